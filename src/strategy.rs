//! Escalating action selection: heuristics first, vision second.
//!
//! Each decision cycle produces one `ActionCandidate`. The layers are tried
//! in increasing cost order:
//! 1. heuristic patterns keyed by detected game archetype (no I/O)
//! 2. the vision oracle (one model call)
//! 3. a learned-pattern store, reserved for replaying previously successful
//!    fixes (currently always defers)
//!
//! The engine never fails: an exhausted decision degrades to a low-confidence
//! `Unknown` candidate and the run loop decides whether that means recovery.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::driver::DomSummary;
use crate::vision::{AnalysisContext, VisionAnalysis, VisionOracle};

/// Start-screen vocabulary shared by the heuristic layer and the DOM button
/// recovery strategy.
pub const START_LEXICON: &[&str] = &[
    "start", "play", "begin", "continue", "go", "launch", "new game", "click to play",
];

/// Loading-screen vocabulary; seeing these means wait, not recover.
const LOADING_WORDS: &[&str] = &["loading", "please wait", "connecting", "buffering"];

/// The closed set of inputs the run loop knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Click at a target element or the viewport center
    Click,
    /// Press a named key
    Keyboard,
    /// Do nothing for a beat; the game is loading, not stuck
    Wait,
    /// Capture an extra evidence screenshot
    Screenshot,
    /// No usable recommendation
    Unknown,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::Click => "click",
            ActionType::Keyboard => "keyboard",
            ActionType::Wait => "wait",
            ActionType::Screenshot => "screenshot",
            ActionType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One recommended next input, produced fresh each decision cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCandidate {
    pub action_type: ActionType,

    /// Element text, key name, or coordinate hint
    pub target: Option<String>,

    /// 0-100
    pub confidence: u8,

    /// Which layer produced this and why, for the evidence trail
    pub reasoning: String,
}

impl ActionCandidate {
    fn unknown(reasoning: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Unknown,
            target: None,
            confidence: 0,
            reasoning: reasoning.into(),
        }
    }

    /// Short label for fingerprint history and logs, e.g. "click:Start"
    pub fn label(&self) -> String {
        match &self.target {
            Some(target) => format!("{}:{}", self.action_type, target),
            None => self.action_type.to_string(),
        }
    }
}

impl From<VisionAnalysis> for ActionCandidate {
    fn from(analysis: VisionAnalysis) -> Self {
        Self {
            action_type: analysis.action_type,
            target: analysis.target,
            confidence: analysis.confidence.min(100),
            reasoning: format!("vision: {}", analysis.reasoning),
        }
    }
}

/// Tunable escalation thresholds.
///
/// The relative ordering matters more than the absolute values:
/// heuristic-bypass > vision-bypass > escalation-floor > attempt-floor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    /// Heuristic candidates above this skip the oracle entirely
    pub heuristic_bypass: u8,

    /// Vision candidates above this are accepted immediately
    pub vision_bypass: u8,

    /// Unknown candidates below this send the loop into recovery
    pub escalation_floor: u8,

    /// Candidates at or above this are worth attempting even when uncertain
    pub attempt_floor: u8,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            heuristic_bypass: 80,
            vision_bypass: 70,
            escalation_floor: 40,
            attempt_floor: 30,
        }
    }
}

/// Broad genre guess used to pick a heuristic pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameArchetype {
    Platformer,
    Clicker,
    Puzzle,
    Generic,
}

struct HeuristicPattern {
    archetype: GameArchetype,
    action_type: ActionType,
    target: Option<&'static str>,
    confidence: u8,
    reasoning: &'static str,
}

/// Per-archetype opening moves. Only the clicker pattern clears the default
/// heuristic bypass; the rest exist to give the fallback layer something
/// better than a coin flip when the oracle is down.
static PATTERNS: Lazy<Vec<HeuristicPattern>> = Lazy::new(|| {
    vec![
        HeuristicPattern {
            archetype: GameArchetype::Clicker,
            action_type: ActionType::Click,
            target: None,
            confidence: 85,
            reasoning: "clicker archetype: repeated clicks on the play area drive progress",
        },
        HeuristicPattern {
            archetype: GameArchetype::Platformer,
            action_type: ActionType::Keyboard,
            target: Some("Space"),
            confidence: 65,
            reasoning: "platformer archetype: Space is the usual jump/confirm key",
        },
        HeuristicPattern {
            archetype: GameArchetype::Puzzle,
            action_type: ActionType::Click,
            target: None,
            confidence: 55,
            reasoning: "puzzle archetype: try selecting a board tile",
        },
        HeuristicPattern {
            archetype: GameArchetype::Generic,
            action_type: ActionType::Click,
            target: None,
            confidence: 45,
            reasoning: "no archetype detected: probe with a center click",
        },
    ]
});

/// Guess the game archetype from the DOM summary's text.
pub fn detect_archetype(dom: &DomSummary) -> GameArchetype {
    let haystack = format!("{} {} {}", dom.title, dom.url, dom.text_excerpt).to_lowercase();

    const CLICKER: &[&str] = &["clicker", "idle", "cookie", "tycoon", "tap "];
    const PLATFORMER: &[&str] = &["platform", "jump", "runner", "dash", "adventure"];
    const PUZZLE: &[&str] = &["puzzle", "match", "merge", "2048", "sudoku", "solitaire"];

    if CLICKER.iter().any(|w| haystack.contains(w)) {
        GameArchetype::Clicker
    } else if PLATFORMER.iter().any(|w| haystack.contains(w)) {
        GameArchetype::Platformer
    } else if PUZZLE.iter().any(|w| haystack.contains(w)) {
        GameArchetype::Puzzle
    } else {
        GameArchetype::Generic
    }
}

/// Lookup of previously successful fixes for similar visual states.
///
/// Promotion rule: a fix becomes replayable once it has succeeded at least
/// `PROMOTION_MIN_SUCCESSES` times at `PROMOTION_MIN_CONFIDENCE` or better.
/// No store backend exists yet, so lookup always defers to the other layers.
#[derive(Debug, Default)]
pub struct LearnedPatternStore;

impl LearnedPatternStore {
    pub const PROMOTION_MIN_SUCCESSES: u32 = 3;
    pub const PROMOTION_MIN_CONFIDENCE: u8 = 95;

    pub fn lookup(&self, _state_hash: &str) -> Option<ActionCandidate> {
        None
    }
}

/// Context the run loop carries into each decision
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    /// Label of the previously executed action
    pub previous_action: Option<String>,

    /// 0-based decision count for this run
    pub attempt: usize,

    /// Operator-supplied hint about the game's controls
    pub input_hint: Option<String>,
}

impl DecisionContext {
    fn analysis_context(&self, dom: &DomSummary) -> AnalysisContext {
        let mut excerpt = format!("title: {}", dom.title);
        let clickables: Vec<&str> = dom
            .visible_clickable()
            .map(|e| e.text.as_str())
            .filter(|t| !t.is_empty())
            .take(10)
            .collect();
        if !clickables.is_empty() {
            excerpt.push_str(&format!("\nclickable: {}", clickables.join(", ")));
        }

        AnalysisContext {
            previous_action: self.previous_action.clone(),
            attempt: self.attempt,
            input_hint: self.input_hint.clone(),
            dom_excerpt: excerpt,
        }
    }
}

/// The escalating decision engine
#[derive(Debug, Default)]
pub struct ActionStrategyEngine {
    thresholds: ConfidenceThresholds,
    learned: LearnedPatternStore,
}

impl ActionStrategyEngine {
    pub fn new(thresholds: ConfidenceThresholds) -> Self {
        Self {
            thresholds,
            learned: LearnedPatternStore,
        }
    }

    pub fn thresholds(&self) -> &ConfidenceThresholds {
        &self.thresholds
    }

    /// Pick the next action. Infallible: every failure path degrades to a
    /// candidate the caller can interpret.
    pub fn decide(
        &self,
        screenshot: &[u8],
        dom: &DomSummary,
        ctx: &DecisionContext,
        oracle: &dyn VisionOracle,
    ) -> ActionCandidate {
        // Layer 1: heuristics
        let heuristic = self.heuristic_candidate(dom, ctx);
        if heuristic.confidence > self.thresholds.heuristic_bypass {
            return heuristic;
        }

        // Layer 2: vision
        let vision = match oracle.analyze(screenshot, &ctx.analysis_context(dom)) {
            Ok(analysis) => ActionCandidate::from(analysis),
            Err(err) => ActionCandidate::unknown(format!("vision oracle failed: {}", err)),
        };
        if vision.confidence > self.thresholds.vision_bypass {
            return vision;
        }

        // Layer 3: learned patterns (always defers for now)
        let state_hash = crate::progress::fingerprint(screenshot);
        if let Some(learned) = self.learned.lookup(&state_hash) {
            return learned;
        }

        // Exhausted: keep the strongest guess
        if vision.confidence >= heuristic.confidence {
            vision
        } else {
            heuristic
        }
    }

    /// Whether the caller should attempt `candidate` at all.
    pub fn should_attempt(&self, candidate: &ActionCandidate) -> bool {
        candidate.confidence >= self.thresholds.attempt_floor
    }

    /// Whether `candidate` signals that the run needs recovery. Only a weak
    /// `Unknown` escalates; a `Wait` never does.
    pub fn should_escalate(&self, candidate: &ActionCandidate) -> bool {
        candidate.action_type == ActionType::Unknown
            && candidate.confidence < self.thresholds.escalation_floor
    }

    fn heuristic_candidate(&self, dom: &DomSummary, ctx: &DecisionContext) -> ActionCandidate {
        // A visible start button beats any genre guess.
        if let Some(element) = dom.visible_clickable().find(|e| {
            let text = e.text.to_lowercase();
            START_LEXICON.iter().any(|w| text.contains(w))
        }) {
            return ActionCandidate {
                action_type: ActionType::Click,
                target: Some(element.text.clone()),
                confidence: 90,
                reasoning: "start-like button visible in DOM".to_string(),
            };
        }

        // Loading screens want patience, not input. Checked only early in
        // the run; a game that still says "loading" after several attempts
        // is likelier stuck than slow.
        let text = dom.text_excerpt.to_lowercase();
        if ctx.attempt < 3 && LOADING_WORDS.iter().any(|w| text.contains(w)) {
            return ActionCandidate {
                action_type: ActionType::Wait,
                target: None,
                confidence: 85,
                reasoning: "loading indicator on screen".to_string(),
            };
        }

        let archetype = detect_archetype(dom);
        let pattern = PATTERNS
            .iter()
            .find(|p| p.archetype == archetype)
            .expect("every archetype has a pattern");

        ActionCandidate {
            action_type: pattern.action_type,
            target: pattern.target.map(String::from),
            confidence: pattern.confidence.min(100),
            reasoning: pattern.reasoning.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DomElement;
    use crate::vision::ScriptedOracle;

    fn dom_with_title(title: &str) -> DomSummary {
        DomSummary {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn button(text: &str) -> DomElement {
        DomElement {
            tag: "button".to_string(),
            text: text.to_string(),
            x: 10.0,
            y: 10.0,
            width: 100.0,
            height: 30.0,
            visible: true,
            clickable: true,
        }
    }

    fn verdict(action_type: ActionType, confidence: u8) -> VisionAnalysis {
        VisionAnalysis {
            action_type,
            target: None,
            confidence,
            reasoning: "scripted".to_string(),
        }
    }

    #[test]
    fn test_threshold_ordering() {
        let t = ConfidenceThresholds::default();
        assert!(t.heuristic_bypass > t.vision_bypass);
        assert!(t.vision_bypass > t.escalation_floor);
        assert!(t.escalation_floor > t.attempt_floor);
    }

    #[test]
    fn test_detect_archetype() {
        assert_eq!(
            detect_archetype(&dom_with_title("Cookie Clicker Deluxe")),
            GameArchetype::Clicker
        );
        assert_eq!(
            detect_archetype(&dom_with_title("Pixel Jump Adventure")),
            GameArchetype::Platformer
        );
        assert_eq!(
            detect_archetype(&dom_with_title("Gem Match Puzzle")),
            GameArchetype::Puzzle
        );
        assert_eq!(
            detect_archetype(&dom_with_title("Untitled")),
            GameArchetype::Generic
        );
    }

    #[test]
    fn test_confident_heuristic_skips_oracle() {
        let engine = ActionStrategyEngine::default();
        let oracle = ScriptedOracle::new([]);
        let dom = dom_with_title("Idle Mining Tycoon");

        let candidate = engine.decide(b"png", &dom, &DecisionContext::default(), &oracle);

        assert_eq!(candidate.action_type, ActionType::Click);
        assert_eq!(candidate.confidence, 85);
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn test_start_button_outranks_archetype() {
        let engine = ActionStrategyEngine::default();
        let oracle = ScriptedOracle::new([]);
        let mut dom = dom_with_title("Untitled");
        dom.elements.push(button("Play Now"));

        let candidate = engine.decide(b"png", &dom, &DecisionContext::default(), &oracle);

        assert_eq!(candidate.action_type, ActionType::Click);
        assert_eq!(candidate.target.as_deref(), Some("Play Now"));
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn test_loading_screen_waits_only_early() {
        let engine = ActionStrategyEngine::default();
        let mut dom = dom_with_title("Untitled");
        dom.text_excerpt = "Loading... 42%".to_string();

        let oracle = ScriptedOracle::new([]);
        let early = engine.decide(b"png", &dom, &DecisionContext::default(), &oracle);
        assert_eq!(early.action_type, ActionType::Wait);
        assert_eq!(oracle.calls(), 0);

        // By attempt 3 the loading text no longer buys patience and the
        // weak generic fallback consults the oracle.
        let late_ctx = DecisionContext {
            attempt: 3,
            ..Default::default()
        };
        let oracle = ScriptedOracle::new([verdict(ActionType::Click, 75)]);
        let late = engine.decide(b"png", &dom, &late_ctx, &oracle);
        assert_eq!(late.action_type, ActionType::Click);
        assert_eq!(oracle.calls(), 1);
    }

    #[test]
    fn test_vision_layer_consulted_for_weak_heuristics() {
        let engine = ActionStrategyEngine::default();
        let oracle = ScriptedOracle::new([verdict(ActionType::Keyboard, 72)]);
        let dom = dom_with_title("Untitled");

        let candidate = engine.decide(b"png", &dom, &DecisionContext::default(), &oracle);

        assert_eq!(candidate.action_type, ActionType::Keyboard);
        assert_eq!(candidate.confidence, 72);
    }

    #[test]
    fn test_oracle_failure_falls_back_to_heuristic() {
        let engine = ActionStrategyEngine::default();
        // Empty script: analyze returns an error.
        let oracle = ScriptedOracle::new([]);
        let dom = dom_with_title("Untitled");

        let candidate = engine.decide(b"png", &dom, &DecisionContext::default(), &oracle);

        // The generic heuristic (45) beats the zero-confidence failure.
        assert_eq!(candidate.action_type, ActionType::Click);
        assert_eq!(candidate.confidence, 45);
    }

    #[test]
    fn test_weak_vision_verdict_keeps_strongest_guess() {
        let engine = ActionStrategyEngine::default();
        let oracle = ScriptedOracle::new([verdict(ActionType::Keyboard, 50)]);
        let dom = dom_with_title("Untitled");

        let candidate = engine.decide(b"png", &dom, &DecisionContext::default(), &oracle);

        // Vision (50) edges out the generic heuristic (45).
        assert_eq!(candidate.action_type, ActionType::Keyboard);
        assert_eq!(candidate.confidence, 50);
    }

    #[test]
    fn test_confidence_never_out_of_range() {
        let engine = ActionStrategyEngine::default();
        let oracle = ScriptedOracle::new([verdict(ActionType::Click, 100)]);
        let dom = dom_with_title("Untitled");
        let candidate = engine.decide(b"png", &dom, &DecisionContext::default(), &oracle);
        assert!(candidate.confidence <= 100);
    }

    #[test]
    fn test_escalation_asymmetry() {
        // A 35-confidence unknown escalates (below the 40 floor), but a
        // 35-confidence click is still worth attempting (above the 30 floor).
        let engine = ActionStrategyEngine::default();

        let weak_unknown = ActionCandidate::unknown("nothing matched");
        assert!(engine.should_escalate(&weak_unknown));
        assert!(!engine.should_attempt(&weak_unknown));

        let uncertain_unknown = ActionCandidate {
            action_type: ActionType::Unknown,
            target: None,
            confidence: 35,
            reasoning: String::new(),
        };
        assert!(engine.should_escalate(&uncertain_unknown));
        assert!(engine.should_attempt(&uncertain_unknown));

        let uncertain_click = ActionCandidate {
            action_type: ActionType::Click,
            target: None,
            confidence: 35,
            reasoning: String::new(),
        };
        assert!(!engine.should_escalate(&uncertain_click));
        assert!(engine.should_attempt(&uncertain_click));
    }

    #[test]
    fn test_wait_never_escalates() {
        let engine = ActionStrategyEngine::default();
        let wait = ActionCandidate {
            action_type: ActionType::Wait,
            target: None,
            confidence: 0,
            reasoning: String::new(),
        };
        assert!(!engine.should_escalate(&wait));
    }

    #[test]
    fn test_learned_store_always_defers() {
        let store = LearnedPatternStore;
        assert!(store.lookup("deadbeef").is_none());
        assert_eq!(LearnedPatternStore::PROMOTION_MIN_SUCCESSES, 3);
        assert_eq!(LearnedPatternStore::PROMOTION_MIN_CONFIDENCE, 95);
    }

    #[test]
    fn test_candidate_label() {
        let candidate = ActionCandidate {
            action_type: ActionType::Keyboard,
            target: Some("Space".to_string()),
            confidence: 65,
            reasoning: String::new(),
        };
        assert_eq!(candidate.label(), "keyboard:Space");

        let bare = ActionCandidate::unknown("");
        assert_eq!(bare.label(), "unknown");
    }
}
