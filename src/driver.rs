//! Browser driver abstraction for game page automation.
//!
//! This module provides the transport seam the run loop drives:
//! - `BrowserDriver` trait covering the handful of operations the core needs
//! - `MockBrowser` for testing with scripted frame sequences
//! - bounded exponential backoff for transient transport failures
//!
//! The real remote-browser transport lives outside this crate; anything that
//! can navigate, screenshot, click, and type can host a run.

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Error types for driver operations
#[derive(Debug)]
pub enum DriverError {
    /// Navigation failed (DNS, timeout, bad URL)
    Navigation(String),

    /// Transport-level failure talking to the browser session
    Transport(String),

    /// Script evaluation failed or returned malformed data
    Evaluate(String),

    /// I/O error
    Io(std::io::Error),
}

impl DriverError {
    /// Whether retrying the same operation can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Navigation(_) | DriverError::Transport(_))
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Navigation(msg) => write!(f, "Navigation error: {}", msg),
            DriverError::Transport(msg) => write!(f, "Transport error: {}", msg),
            DriverError::Evaluate(msg) => write!(f, "Evaluate error: {}", msg),
            DriverError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(err)
    }
}

/// A clickable/visible element reported by the DOM probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomElement {
    /// Tag name, lowercase (e.g. "button", "canvas", "a")
    pub tag: String,

    /// Visible text content, trimmed
    pub text: String,

    /// Bounding box origin in viewport pixels
    pub x: f64,
    pub y: f64,

    /// Bounding box size in viewport pixels
    pub width: f64,
    pub height: f64,

    /// Whether the element is rendered (non-zero box, not display:none)
    pub visible: bool,

    /// Whether the element looks interactive (button, link, onclick, canvas)
    pub clickable: bool,
}

impl DomElement {
    /// Geometric center of the bounding box.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Structural summary of the current page, produced by [`DOM_PROBE_JS`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomSummary {
    /// Document title
    #[serde(default)]
    pub title: String,

    /// Current URL
    #[serde(default)]
    pub url: String,

    /// Viewport size in pixels
    #[serde(default)]
    pub viewport_width: f64,
    #[serde(default)]
    pub viewport_height: f64,

    /// Interesting elements, document order
    #[serde(default)]
    pub elements: Vec<DomElement>,

    /// Console error lines captured since the last probe
    #[serde(default)]
    pub console_errors: Vec<String>,

    /// Visible body text, truncated
    #[serde(default)]
    pub text_excerpt: String,
}

impl DomSummary {
    /// Elements that are both rendered and interactive.
    pub fn visible_clickable(&self) -> impl Iterator<Item = &DomElement> {
        self.elements.iter().filter(|e| e.visible && e.clickable)
    }

    /// Center of the viewport, the fallback click target.
    pub fn viewport_center(&self) -> (f64, f64) {
        if self.viewport_width > 0.0 && self.viewport_height > 0.0 {
            (self.viewport_width / 2.0, self.viewport_height / 2.0)
        } else {
            // Probe predates layout; assume a common desktop viewport.
            (640.0, 360.0)
        }
    }
}

/// Handle to an embedded frame the driver has switched into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHandle {
    /// Selector that matched the frame
    pub selector: String,
}

/// Probe script every driver runs to produce a [`DomSummary`].
///
/// Kept to one expression so `evaluate` implementations can pass it verbatim
/// to the page.
pub const DOM_PROBE_JS: &str = r#"(() => {
  const els = [...document.querySelectorAll('button, a, canvas, input, [onclick], [role="button"]')]
    .slice(0, 64)
    .map(el => {
      const r = el.getBoundingClientRect();
      return {
        tag: el.tagName.toLowerCase(),
        text: (el.innerText || el.value || '').trim().slice(0, 80),
        x: r.x, y: r.y, width: r.width, height: r.height,
        visible: r.width > 0 && r.height > 0,
        clickable: true,
      };
    });
  return {
    title: document.title,
    url: location.href,
    viewport_width: innerWidth,
    viewport_height: innerHeight,
    elements: els,
    console_errors: (window.__gvErrors || []).slice(-20),
    text_excerpt: (document.body ? document.body.innerText : '').slice(0, 500),
  };
})()"#;

/// Trait for browser transports
///
/// Implementations wrap a live browser session. The core calls these
/// sequentially from a single run loop; implementations need not be
/// re-entrant.
pub trait BrowserDriver {
    /// Navigate the page to `url`
    fn navigate(&mut self, url: &str) -> DriverResult<()>;

    /// Capture the current viewport as PNG bytes
    fn screenshot(&mut self) -> DriverResult<Vec<u8>>;

    /// Click at viewport coordinates
    fn click(&mut self, x: f64, y: f64) -> DriverResult<()>;

    /// Press (and release) a named key, e.g. "Space", "Enter", "ArrowLeft"
    fn press(&mut self, key: &str) -> DriverResult<()>;

    /// Evaluate a script in the page and return its JSON value
    fn evaluate(&mut self, js: &str) -> DriverResult<serde_json::Value>;

    /// Switch execution context into a frame matching `selector`, if present
    fn switch_frame(&mut self, selector: &str) -> DriverResult<Option<FrameHandle>>;

    /// Reload the page
    fn reload(&mut self) -> DriverResult<()>;

    /// Run the standard DOM probe and parse the result.
    fn dom_summary(&mut self) -> DriverResult<DomSummary> {
        let value = self.evaluate(DOM_PROBE_JS)?;
        serde_json::from_value(value)
            .map_err(|e| DriverError::Evaluate(format!("Malformed DOM probe result: {}", e)))
    }
}

/// Bounded exponential backoff for transient driver failures.
///
/// Defaults to 3 attempts at 1s/2s/4s. Non-transient errors are returned
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first
    pub attempts: u32,

    /// Delay before the second attempt; doubles each retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping, for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds, a non-transient error occurs, or attempts
    /// are exhausted.
    pub fn run<T, F>(&self, mut op: F) -> DriverResult<T>
    where
        F: FnMut() -> DriverResult<T>,
    {
        let mut delay = self.base_delay;
        let mut last_err = None;
        for attempt in 0..self.attempts.max(1) {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.attempts => {
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::Transport("retries exhausted".to_string())))
    }
}

/// Minimal frame renderer for scripted mock games.
///
/// Produces small PNG frames with flat fills, rectangles, and font8x8 text,
/// enough to make frames that are cheap to generate yet hash-distinct.
#[derive(Debug, Clone)]
pub struct FramePainter {
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl FramePainter {
    /// Create a painter filled with `color`
    pub fn new(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut buffer = vec![0u8; (width * height * 3) as usize];
        for chunk in buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
        Self {
            width,
            height,
            buffer,
        }
    }

    /// Draw a filled rectangle
    pub fn rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) -> &mut Self {
        for py in y..(y + h).min(self.height) {
            for px in x..(x + w).min(self.width) {
                let idx = ((py * self.width + px) * 3) as usize;
                self.buffer[idx..idx + 3].copy_from_slice(&color);
            }
        }
        self
    }

    /// Draw text using font8x8 glyphs; 8x8 pixels per character, no wrapping
    pub fn text(&mut self, x: u32, y: u32, text: &str, color: [u8; 3]) -> &mut Self {
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x + 8 > self.width {
                break;
            }
            let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
            for (row_idx, row) in glyph.iter().enumerate() {
                let py = y + row_idx as u32;
                if py >= self.height {
                    break;
                }
                for bit in 0..8u32 {
                    // font8x8 stores LSB as leftmost pixel
                    if (row >> bit) & 1 == 1 {
                        let idx = ((py * self.width + (cursor_x + bit)) * 3) as usize;
                        self.buffer[idx..idx + 3].copy_from_slice(&color);
                    }
                }
            }
            cursor_x += 8;
        }
        self
    }

    /// Encode as PNG bytes
    pub fn to_png(&self) -> Vec<u8> {
        let img: RgbImage =
            ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
                .expect("buffer size matches dimensions");
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("PNG encoding of an in-memory RGB buffer cannot fail");
        bytes
    }
}

/// Render a labeled solid frame, the standard mock game screen.
pub fn labeled_frame(label: &str, color: [u8; 3]) -> Vec<u8> {
    let mut painter = FramePainter::new(320, 180, color);
    painter.text(8, 8, label, [255, 255, 255]);
    painter.to_png()
}

/// Scripted in-process browser for tests and simulations
///
/// Holds a fixed sequence of frames and advances through them according to
/// the configured stimuli, recording every interaction for assertions.
#[derive(Debug, Default)]
pub struct MockBrowser {
    frames: Vec<Vec<u8>>,
    position: usize,
    dom: DomSummary,

    /// Stimuli that advance to the next frame
    advance_on_click: bool,
    advance_keys: Vec<String>,
    advance_on_reload: bool,

    /// Frame selector that switch_frame will match
    embedded_frame: Option<String>,

    /// Remaining navigations that fail with a transient error
    failing_navigations: usize,

    // Interaction log
    pub navigations: Vec<String>,
    pub clicks: Vec<(f64, f64)>,
    pub keys: Vec<String>,
    pub reloads: usize,
    pub frame_switches: Vec<String>,
}

impl MockBrowser {
    /// Browser with a single static frame (never responds to input)
    pub fn new() -> Self {
        Self {
            frames: vec![labeled_frame("blank", [16, 16, 16])],
            ..Default::default()
        }
    }

    /// Replace the frame sequence
    pub fn frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.frames = frames;
        self
    }

    /// Set the DOM summary the probe reports
    pub fn dom(mut self, dom: DomSummary) -> Self {
        self.dom = dom;
        self
    }

    /// Advance one frame per click
    pub fn advance_on_click(mut self, enabled: bool) -> Self {
        self.advance_on_click = enabled;
        self
    }

    /// Advance one frame when any of `keys` is pressed
    pub fn advance_on_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.advance_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Advance one frame on reload
    pub fn advance_on_reload(mut self, enabled: bool) -> Self {
        self.advance_on_reload = enabled;
        self
    }

    /// Report an embedded game frame at `selector`
    pub fn embedded_frame(mut self, selector: impl Into<String>) -> Self {
        self.embedded_frame = Some(selector.into());
        self
    }

    /// Fail the next `count` navigations with a transient error
    pub fn failing_navigations(mut self, count: usize) -> Self {
        self.failing_navigations = count;
        self
    }

    /// Index of the frame currently displayed
    pub fn position(&self) -> usize {
        self.position
    }

    fn advance(&mut self) {
        if self.position + 1 < self.frames.len() {
            self.position += 1;
        }
    }
}

impl BrowserDriver for MockBrowser {
    fn navigate(&mut self, url: &str) -> DriverResult<()> {
        if self.failing_navigations > 0 {
            self.failing_navigations -= 1;
            return Err(DriverError::Navigation(format!(
                "simulated navigation failure for {}",
                url
            )));
        }
        self.navigations.push(url.to_string());
        self.dom.url = url.to_string();
        Ok(())
    }

    fn screenshot(&mut self) -> DriverResult<Vec<u8>> {
        self.frames
            .get(self.position)
            .cloned()
            .ok_or_else(|| DriverError::Transport("no frame scripted".to_string()))
    }

    fn click(&mut self, x: f64, y: f64) -> DriverResult<()> {
        self.clicks.push((x, y));
        if self.advance_on_click {
            self.advance();
        }
        Ok(())
    }

    fn press(&mut self, key: &str) -> DriverResult<()> {
        self.keys.push(key.to_string());
        if self.advance_keys.iter().any(|k| k == key) {
            self.advance();
        }
        Ok(())
    }

    fn evaluate(&mut self, _js: &str) -> DriverResult<serde_json::Value> {
        serde_json::to_value(&self.dom)
            .map_err(|e| DriverError::Evaluate(e.to_string()))
    }

    fn switch_frame(&mut self, selector: &str) -> DriverResult<Option<FrameHandle>> {
        match &self.embedded_frame {
            Some(present) if present == selector => {
                self.frame_switches.push(selector.to_string());
                Ok(Some(FrameHandle {
                    selector: selector.to_string(),
                }))
            }
            _ => Ok(None),
        }
    }

    fn reload(&mut self) -> DriverResult<()> {
        self.reloads += 1;
        if self.advance_on_reload {
            self.advance();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_button() -> DomElement {
        DomElement {
            tag: "button".to_string(),
            text: "Start".to_string(),
            x: 100.0,
            y: 200.0,
            width: 80.0,
            height: 40.0,
            visible: true,
            clickable: true,
        }
    }

    #[test]
    fn test_element_center() {
        assert_eq!(start_button().center(), (140.0, 220.0));
    }

    #[test]
    fn test_dom_summary_filters_visible_clickable() {
        let mut hidden = start_button();
        hidden.visible = false;
        let dom = DomSummary {
            elements: vec![start_button(), hidden],
            ..Default::default()
        };
        assert_eq!(dom.visible_clickable().count(), 1);
    }

    #[test]
    fn test_viewport_center_fallback() {
        let dom = DomSummary::default();
        assert_eq!(dom.viewport_center(), (640.0, 360.0));

        let sized = DomSummary {
            viewport_width: 800.0,
            viewport_height: 600.0,
            ..Default::default()
        };
        assert_eq!(sized.viewport_center(), (400.0, 300.0));
    }

    #[test]
    fn test_mock_browser_advances_on_click() {
        let mut browser = MockBrowser::new()
            .frames(vec![
                labeled_frame("menu", [0, 0, 64]),
                labeled_frame("game", [0, 64, 0]),
            ])
            .advance_on_click(true);

        let before = browser.screenshot().unwrap();
        browser.click(10.0, 10.0).unwrap();
        let after = browser.screenshot().unwrap();

        assert_ne!(before, after);
        assert_eq!(browser.position(), 1);

        // Clicks past the last frame stay on the last frame.
        browser.click(10.0, 10.0).unwrap();
        assert_eq!(browser.position(), 1);
    }

    #[test]
    fn test_mock_browser_key_filtering() {
        let mut browser = MockBrowser::new()
            .frames(vec![
                labeled_frame("menu", [0, 0, 64]),
                labeled_frame("game", [0, 64, 0]),
            ])
            .advance_on_keys(["Space"]);

        browser.press("Enter").unwrap();
        assert_eq!(browser.position(), 0);
        browser.press("Space").unwrap();
        assert_eq!(browser.position(), 1);
        assert_eq!(browser.keys, vec!["Enter", "Space"]);
    }

    #[test]
    fn test_mock_browser_dom_roundtrip() {
        let mut browser = MockBrowser::new().dom(DomSummary {
            title: "Blob Jumper".to_string(),
            elements: vec![start_button()],
            ..Default::default()
        });

        let dom = browser.dom_summary().unwrap();
        assert_eq!(dom.title, "Blob Jumper");
        assert_eq!(dom.elements.len(), 1);
    }

    #[test]
    fn test_switch_frame_matches_configured_selector() {
        let mut browser = MockBrowser::new().embedded_frame("iframe[src*=\"game\"]");
        assert!(browser.switch_frame("#game-container iframe").unwrap().is_none());
        let handle = browser.switch_frame("iframe[src*=\"game\"]").unwrap();
        assert_eq!(
            handle,
            Some(FrameHandle {
                selector: "iframe[src*=\"game\"]".to_string()
            })
        );
    }

    #[test]
    fn test_retry_policy_recovers_from_transient_failures() {
        let mut browser = MockBrowser::new().failing_navigations(2);
        let policy = RetryPolicy::immediate(3);

        let result = policy.run(|| browser.navigate("https://example.test/game"));
        assert!(result.is_ok());
        assert_eq!(browser.navigations.len(), 1);
    }

    #[test]
    fn test_retry_policy_exhaustion() {
        let mut browser = MockBrowser::new().failing_navigations(5);
        let policy = RetryPolicy::immediate(3);

        let result = policy.run(|| browser.navigate("https://example.test/game"));
        assert!(result.is_err());
        assert!(browser.navigations.is_empty());
    }

    #[test]
    fn test_retry_policy_does_not_retry_permanent_errors() {
        let mut calls = 0;
        let policy = RetryPolicy::immediate(3);
        let result: DriverResult<()> = policy.run(|| {
            calls += 1;
            Err(DriverError::Evaluate("bad script".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_labeled_frames_are_hash_distinct() {
        let a = labeled_frame("menu", [0, 0, 64]);
        let b = labeled_frame("game", [0, 0, 64]);
        assert_ne!(a, b);
        // PNG magic bytes
        assert_eq!(&a[0..4], &[0x89, 0x50, 0x4E, 0x47]);
    }
}
