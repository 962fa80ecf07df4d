//! Vision oracle: turning screenshots into structured action verdicts.
//!
//! The run loop consults a vision language model when heuristics are not
//! confident enough. This module provides:
//! - the `VisionOracle` trait the engine and unstick strategies consume
//! - `VlmClient`, an OpenAI-compatible chat-completions client (streaming
//!   responses with activity-based timeout, non-streaming fallback)
//! - verdict parsing from free-form model output into `VisionAnalysis`
//! - `ScriptedOracle` for tests
//!
//! Endpoint and model are configurable via `GAME_VISION_VLM_*` environment
//! variables, see the `config` module.

use base64::Engine;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config;
use crate::strategy::ActionType;

/// Result type for oracle operations
pub type VisionResult<T> = Result<T, VisionError>;

/// Errors that can occur during oracle calls
#[derive(Debug)]
pub enum VisionError {
    /// Failed to connect to the VLM endpoint
    ConnectionFailed(String),
    /// No activity for too long during streaming
    ActivityTimeout(Duration),
    /// Model reply could not be parsed into a verdict
    InvalidResponse(String),
    /// IO error
    Io(std::io::Error),
}

impl std::fmt::Display for VisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisionError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            VisionError::ActivityTimeout(d) => write!(f, "No response for {:?}", d),
            VisionError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            VisionError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for VisionError {}

impl From<std::io::Error> for VisionError {
    fn from(e: std::io::Error) -> Self {
        VisionError::Io(e)
    }
}

/// Structured verdict from a vision analysis
#[derive(Debug, Clone)]
pub struct VisionAnalysis {
    /// What kind of input the model recommends
    pub action_type: ActionType,
    /// Target description: element text, key name, or coordinate hint
    pub target: Option<String>,
    /// Model confidence, clamped to 0-100
    pub confidence: u8,
    /// Model's own explanation, kept for the evidence trail
    pub reasoning: String,
}

/// Context handed to the oracle alongside the screenshot
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    /// Label of the previously executed action, if any
    pub previous_action: Option<String>,
    /// 0-based decision attempt count for this run
    pub attempt: usize,
    /// Operator-supplied hint about the game's controls
    pub input_hint: Option<String>,
    /// Condensed DOM summary (title, clickable element texts)
    pub dom_excerpt: String,
}

/// Trait for vision analysis providers
pub trait VisionOracle {
    /// Analyze a screenshot and recommend the next action
    fn analyze(&self, screenshot: &[u8], ctx: &AnalysisContext) -> VisionResult<VisionAnalysis>;
}

impl<T: VisionOracle + ?Sized> VisionOracle for &T {
    fn analyze(&self, screenshot: &[u8], ctx: &AnalysisContext) -> VisionResult<VisionAnalysis> {
        (**self).analyze(screenshot, ctx)
    }
}

/// Configuration for the VLM client
#[derive(Debug, Clone)]
pub struct VlmConfig {
    /// API endpoint URL
    pub endpoint: String,
    /// Model name to use
    pub model: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Timeout for initial connection (seconds)
    pub connection_timeout: u64,
    /// Timeout for inactivity during streaming (seconds)
    pub activity_timeout: u64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            endpoint: cfg.vlm.endpoint.clone(),
            model: cfg.vlm.model.clone(),
            max_tokens: cfg.vlm.max_tokens,
            connection_timeout: cfg.vlm.connect_timeout,
            activity_timeout: cfg.vlm.activity_timeout,
        }
    }
}

impl VlmConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn activity_timeout(mut self, seconds: u64) -> Self {
        self.activity_timeout = seconds;
        self
    }
}

/// Check if a VLM endpoint is reachable (connection-only check).
///
/// Only verifies the server accepts connections - a full analysis round trip
/// can take 30+ seconds for large screenshots.
pub fn check_health(endpoint: &str, timeout_secs: u64) -> VisionResult<bool> {
    let url = endpoint.trim_start_matches("http://").trim_start_matches("https://");
    let host_port = url.split('/').next().unwrap_or("127.0.0.1:8080");

    let output = Command::new("curl")
        .args([
            "-s",
            "-o", "/dev/null",
            "-w", "%{http_code}",
            "--connect-timeout", &timeout_secs.to_string(),
            "--max-time", &timeout_secs.to_string(),
            "-I",
            &format!("http://{}", host_port),
        ])
        .output()?;

    let status = String::from_utf8_lossy(&output.stdout);
    // Any response (even 4xx/5xx) means the server is reachable; 000 means
    // the connection failed entirely.
    let code: u16 = status.trim().parse().unwrap_or(0);
    Ok(code > 0)
}

/// Build the analysis prompt for a game screenshot.
///
/// Asks for a single JSON object so the reply parses into a
/// [`VisionAnalysis`] without scraping prose.
pub fn build_game_prompt(ctx: &AnalysisContext) -> String {
    let mut prompt = String::from(
        "You are probing an unfamiliar browser game to see if it responds to input. \
         Look at the screenshot and recommend exactly one next input.\n",
    );

    if ctx.attempt == 0 {
        prompt.push_str(
            "This is the first look at the page. If it is still loading or showing \
             a splash screen, recommend \"wait\".\n",
        );
    } else if let Some(prev) = &ctx.previous_action {
        prompt.push_str(&format!("The previous input was: {}.\n", prev));
        prompt.push_str(&format!("This is attempt {}.\n", ctx.attempt + 1));
    }

    if let Some(hint) = &ctx.input_hint {
        prompt.push_str(&format!("Operator hint about the controls: {}.\n", hint));
    }

    if !ctx.dom_excerpt.is_empty() {
        prompt.push_str(&format!("Page structure summary:\n{}\n", ctx.dom_excerpt));
    }

    prompt.push_str(
        "Reply with a single JSON object and nothing else:\n\
         {\"action\": \"click|keyboard|wait|screenshot|unknown\", \
         \"target\": \"element text, key name, or null\", \
         \"confidence\": 0-100, \
         \"reasoning\": \"one sentence\"}",
    );
    prompt
}

/// Parse a model reply into a verdict.
///
/// Models wrap JSON in prose or code fences more often than not, so this
/// extracts the outermost `{...}` span before parsing.
pub fn parse_verdict(reply: &str) -> VisionResult<VisionAnalysis> {
    let start = reply
        .find('{')
        .ok_or_else(|| VisionError::InvalidResponse("no JSON object in reply".to_string()))?;
    let end = reply
        .rfind('}')
        .ok_or_else(|| VisionError::InvalidResponse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(VisionError::InvalidResponse("malformed JSON span".to_string()));
    }

    let value: serde_json::Value = serde_json::from_str(&reply[start..=end])
        .map_err(|e| VisionError::InvalidResponse(e.to_string()))?;

    let action_type = match value["action"].as_str().unwrap_or("unknown") {
        s if s.eq_ignore_ascii_case("click") => ActionType::Click,
        s if s.eq_ignore_ascii_case("keyboard") || s.eq_ignore_ascii_case("key") => {
            ActionType::Keyboard
        }
        s if s.eq_ignore_ascii_case("wait") => ActionType::Wait,
        s if s.eq_ignore_ascii_case("screenshot") => ActionType::Screenshot,
        _ => ActionType::Unknown,
    };

    let confidence = value["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 100.0) as u8;

    let target = value["target"]
        .as_str()
        .map(str::trim)
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("null"))
        .map(String::from);

    let reasoning = value["reasoning"].as_str().unwrap_or("").to_string();

    Ok(VisionAnalysis {
        action_type,
        target,
        confidence,
        reasoning,
    })
}

/// VLM-backed oracle speaking the OpenAI-compatible chat-completions protocol
#[derive(Debug, Clone, Default)]
pub struct VlmClient {
    config: VlmConfig,
}

impl VlmClient {
    pub fn new(config: VlmConfig) -> Self {
        Self { config }
    }

    fn request_body(&self, image_data: &[u8], prompt: &str, stream: bool) -> VisionResult<String> {
        let img_base64 = base64::engine::general_purpose::STANDARD.encode(image_data);
        let request = serde_json::json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/png;base64,{}", img_base64)
                        }
                    },
                    {
                        "type": "text",
                        "text": prompt
                    }
                ]
            }],
            "max_tokens": self.config.max_tokens,
            "stream": stream
        });
        serde_json::to_string(&request).map_err(|e| VisionError::InvalidResponse(e.to_string()))
    }

    /// Stream the completion, reading SSE lines until `[DONE]` or the
    /// activity timeout elapses.
    fn complete_streaming(&self, image_data: &[u8], prompt: &str) -> VisionResult<String> {
        let request_json = self.request_body(image_data, prompt, true)?;

        let mut child = Command::new("curl")
            .args([
                "-s",
                "-N", // Disable buffering for streaming
                "-X", "POST",
                &self.config.endpoint,
                "-H", "Content-Type: application/json",
                "-d", &request_json,
                "--connect-timeout", &self.config.connection_timeout.to_string(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VisionError::Io(std::io::Error::other("Failed to capture stdout")))?;

        let (tx, rx) = mpsc::channel();
        let activity_timeout = Duration::from_secs(self.config.activity_timeout);

        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });

        let mut full_content = String::new();
        let mut last_activity = Instant::now();

        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(line)) => {
                    last_activity = Instant::now();

                    if let Some(data) = line.strip_prefix("data: ") {
                        if data == "[DONE]" {
                            break;
                        }
                        if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
                            if let Some(content) = json["choices"][0]["delta"]["content"].as_str() {
                                full_content.push_str(content);
                            }
                            // Thinking models stream reasoning separately
                            if let Some(content) =
                                json["choices"][0]["delta"]["reasoning_content"].as_str()
                            {
                                full_content.push_str(content);
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    return Err(VisionError::Io(e));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if last_activity.elapsed() > activity_timeout {
                        let _ = child.kill();
                        return Err(VisionError::ActivityTimeout(activity_timeout));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }

        let status = child.wait()?;
        if !status.success() && full_content.is_empty() {
            return Err(VisionError::ConnectionFailed("curl process failed".to_string()));
        }

        if full_content.is_empty() {
            // Endpoint may not support streaming at all
            return self.complete_non_streaming(image_data, prompt);
        }

        Ok(full_content)
    }

    /// Fallback for APIs that don't support streaming
    fn complete_non_streaming(&self, image_data: &[u8], prompt: &str) -> VisionResult<String> {
        let request_json = self.request_body(image_data, prompt, false)?;

        // No --max-time here: without streaming there is no activity signal
        // to watch, so let the request run.
        let output = Command::new("curl")
            .args([
                "-s",
                "-X", "POST",
                &self.config.endpoint,
                "-H", "Content-Type: application/json",
                "-d", &request_json,
                "--connect-timeout", &self.config.connection_timeout.to_string(),
            ])
            .output()?;

        if !output.status.success() {
            return Err(VisionError::ConnectionFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let response: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| VisionError::InvalidResponse(e.to_string()))?;

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("");
        let result = if content.is_empty() {
            response["choices"][0]["message"]["reasoning_content"]
                .as_str()
                .unwrap_or("")
        } else {
            content
        };

        Ok(result.to_string())
    }
}

impl VisionOracle for VlmClient {
    fn analyze(&self, screenshot: &[u8], ctx: &AnalysisContext) -> VisionResult<VisionAnalysis> {
        let prompt = build_game_prompt(ctx);
        let reply = self.complete_streaming(screenshot, &prompt)?;
        parse_verdict(&reply)
    }
}

/// Scripted oracle for tests: pops pre-canned verdicts in order.
///
/// Once the script is exhausted, further calls return an error (which the
/// engine treats as a zero-confidence verdict).
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    responses: RefCell<VecDeque<VisionAnalysis>>,
    calls: Cell<usize>,
}

impl ScriptedOracle {
    pub fn new(responses: impl IntoIterator<Item = VisionAnalysis>) -> Self {
        Self {
            responses: RefCell::new(responses.into_iter().collect()),
            calls: Cell::new(0),
        }
    }

    /// Number of analyze calls made so far
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl VisionOracle for ScriptedOracle {
    fn analyze(&self, _screenshot: &[u8], _ctx: &AnalysisContext) -> VisionResult<VisionAnalysis> {
        self.calls.set(self.calls.get() + 1);
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| VisionError::InvalidResponse("scripted oracle exhausted".to_string()))
    }
}
