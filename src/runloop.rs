//! The top-level run loop: a sequential state machine under a wall-clock
//! budget.
//!
//! One loop iteration is observe (screenshot + DOM probe), decide (strategy
//! engine), act (driver input), record (fingerprint + evidence). Stalls
//! divert through the unstick coordinator; crashes, timeouts, and spent
//! budgets end the run. `run` never fails — whatever happens, the caller
//! gets a fully-formed report with the evidence collected so far.

use std::time::{Duration, Instant};

use crate::config;
use crate::driver::{BrowserDriver, DomSummary, DriverError, RetryPolicy};
use crate::progress::ProgressTracker;
use crate::runner::{ActionRecord, RunReport, TestState, TransitionRecord};
use crate::session::Session;
use crate::strategy::{
    ActionStrategyEngine, ActionType, ConfidenceThresholds, DecisionContext,
};
use crate::unstick::{UnstickAttempt, UnstickContext, UnstickCoordinator};
use crate::vision::VisionOracle;

/// Consecutive screenshot failures tolerated before declaring the session lost
const OBSERVE_FAILURE_LIMIT: u32 = 3;

/// Per-run configuration, passed in at construction.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// URL of the game under test
    pub game_url: String,

    /// Stop after this many decision cycles
    pub max_actions: usize,

    /// Global wall-clock budget
    pub max_duration: Duration,

    /// Operator hint about the game's controls, forwarded to the oracle
    pub input_hint: Option<String>,

    /// Identical-frame count that counts as stuck
    pub stuck_threshold: usize,

    /// Recovery episodes allowed before the run is declared crashed
    pub recovery_budget: usize,

    /// Pause between an input and the screenshot that judges it
    pub settle_delay: Duration,

    /// How long a Wait action pauses
    pub wait_delay: Duration,

    /// Escalation thresholds for the strategy engine
    pub thresholds: ConfidenceThresholds,

    /// Backoff policy for the initial navigation
    pub navigation_retry: RetryPolicy,
}

impl RunConfig {
    /// Config for `game_url` with defaults from the environment layer
    pub fn new(game_url: impl Into<String>) -> Self {
        let defaults = &config::get().defaults;
        Self {
            game_url: game_url.into(),
            max_actions: defaults.max_actions,
            max_duration: Duration::from_secs(defaults.max_duration_secs),
            input_hint: None,
            stuck_threshold: defaults.stuck_threshold,
            recovery_budget: defaults.recovery_budget,
            settle_delay: Duration::from_millis(defaults.settle_delay_ms),
            wait_delay: Duration::from_millis(defaults.wait_delay_ms),
            thresholds: ConfidenceThresholds::default(),
            navigation_retry: RetryPolicy::default(),
        }
    }

    pub fn max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = max_actions;
        self
    }

    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn input_hint(mut self, hint: impl Into<String>) -> Self {
        self.input_hint = Some(hint.into());
        self
    }

    pub fn stuck_threshold(mut self, threshold: usize) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn recovery_budget(mut self, budget: usize) -> Self {
        self.recovery_budget = budget;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = delay;
        self
    }

    pub fn thresholds(mut self, thresholds: ConfidenceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn navigation_retry(mut self, policy: RetryPolicy) -> Self {
        self.navigation_retry = policy;
        self
    }
}

/// The adaptive play-and-recover state machine
pub struct TestRunLoop<D: BrowserDriver, O: VisionOracle> {
    driver: D,
    oracle: O,
    session: Session,
    config: RunConfig,
    tracker: ProgressTracker,
    engine: ActionStrategyEngine,
    coordinator: UnstickCoordinator,
    state: TestState,
    sequence: u64,
    transitions: Vec<TransitionRecord>,
}

impl<D: BrowserDriver, O: VisionOracle> TestRunLoop<D, O> {
    pub fn new(driver: D, oracle: O, session: Session, config: RunConfig) -> Self {
        let engine = ActionStrategyEngine::new(config.thresholds);
        Self {
            driver,
            oracle,
            session,
            config,
            tracker: ProgressTracker::new(),
            engine,
            coordinator: UnstickCoordinator::with_default_strategies(),
            state: TestState::Initializing,
            sequence: 0,
            transitions: Vec::new(),
        }
    }

    /// Replace the recovery strategy list (tests inject scripted strategies)
    pub fn with_coordinator(mut self, coordinator: UnstickCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    fn transition(&mut self, to: TestState, reason: &str) {
        if self.state == to {
            return;
        }
        self.sequence += 1;
        let _ = self
            .session
            .append_log(&format!("state: {} -> {} ({})", self.state, to, reason));
        self.transitions.push(TransitionRecord {
            sequence: self.sequence,
            from: self.state,
            to,
            reason: reason.to_string(),
        });
        self.state = to;
    }

    /// Drive the run to a terminal state. Consumes the loop; the session is
    /// released when the returned report is all that remains.
    pub fn run(mut self) -> RunReport {
        let deadline = Instant::now() + self.config.max_duration;
        let _ = self.session.init();
        let _ = self
            .session
            .append_log(&format!("run start: {}", self.config.game_url));

        let mut actions: Vec<ActionRecord> = Vec::new();
        let mut unstick_log: Vec<UnstickAttempt> = Vec::new();
        let mut error: Option<String> = None;
        let mut recovery_episodes = 0usize;
        let mut observe_failures = 0u32;
        let mut previous_action: Option<String> = None;

        // Acquire the page. Navigation retries live in the driver layer's
        // policy; exhaustion is fatal to the whole run.
        let policy = self.config.navigation_retry.clone();
        let url = self.config.game_url.clone();
        let navigated = policy.run(|| self.driver.navigate(&url));
        match navigated {
            Ok(()) => self.transition(TestState::Loading, "session acquired, navigation issued"),
            Err(e) => {
                error = Some(format!("navigation failed: {}", e));
                self.transition(TestState::Crashed, "navigation retries exhausted");
            }
        }

        while !self.state.is_terminal() {
            if Instant::now() >= deadline {
                self.transition(TestState::TimedOut, "wall-clock budget exhausted");
                break;
            }
            if actions.len() >= self.config.max_actions {
                self.transition(TestState::Completed, "action budget spent");
                break;
            }

            // Observe
            let screenshot = match self.driver.screenshot() {
                Ok(bytes) => {
                    observe_failures = 0;
                    bytes
                }
                Err(e) => {
                    observe_failures += 1;
                    let _ = self.session.append_log(&format!("screenshot failed: {}", e));
                    if observe_failures >= OBSERVE_FAILURE_LIMIT {
                        error = Some(format!("browser session lost: {}", e));
                        self.transition(TestState::Crashed, "repeated screenshot failures");
                    }
                    continue;
                }
            };
            // A failed probe degrades to an empty summary; the vision layer
            // can still work from pixels alone.
            let dom = self.driver.dom_summary().unwrap_or_default();

            if let Some(fatal) = dom.console_errors.iter().find(|line| {
                let lower = line.to_lowercase();
                lower.contains("uncaught") || lower.contains("fatal")
            }) {
                error = Some(format!("console error: {}", fatal));
                self.transition(TestState::Crashed, "fatal script error in console");
                break;
            }

            // Decide
            let ctx = DecisionContext {
                previous_action: previous_action.clone(),
                attempt: actions.len(),
                input_hint: self.config.input_hint.clone(),
            };
            let candidate = self.engine.decide(&screenshot, &dom, &ctx, &self.oracle);

            // Stall handling. Only an exploring run can be stuck: during
            // Loading a dead-looking screen is still presumed to be loading.
            let stalled = self.tracker.is_stuck(self.config.stuck_threshold);
            if self.state == TestState::Exploring
                && (stalled || self.engine.should_escalate(&candidate))
            {
                let reason = if stalled {
                    format!(
                        "{} consecutive identical frames",
                        self.tracker.metrics().consecutive_identical
                    )
                } else {
                    format!("engine exhausted (confidence {})", candidate.confidence)
                };
                self.transition(TestState::Stuck, &reason);
                self.transition(TestState::Recovering, "running unstick strategies");

                let report = {
                    let uctx = UnstickContext {
                        dom: &dom,
                        oracle: &self.oracle,
                        evidence: &self.session,
                        input_hint: self.config.input_hint.as_deref(),
                        settle_delay: self.config.settle_delay,
                    };
                    self.coordinator.execute_all(&mut self.driver, &uctx)
                };
                recovery_episodes += 1;
                let resolved = report.resolved;
                unstick_log.extend(report.attempts);

                if resolved && recovery_episodes <= self.config.recovery_budget {
                    // Record the post-recovery frame so a real change
                    // reopens the stall window.
                    if let Ok(bytes) = self.driver.screenshot() {
                        self.tracker.record_screenshot(&bytes, "unstick");
                    }
                    previous_action = Some("unstick".to_string());
                    self.transition(TestState::Exploring, "recovery changed the screen");
                } else {
                    error = Some(if resolved {
                        format!(
                            "recovery budget of {} episodes exceeded",
                            self.config.recovery_budget
                        )
                    } else {
                        "all unstick strategies exhausted".to_string()
                    });
                    self.transition(TestState::Crashed, "recovery exhausted");
                }
                continue;
            }

            // Act
            self.sequence += 1;
            let seq = self.sequence;
            let label = candidate.label();
            let mut attempted = false;

            if self.engine.should_attempt(&candidate) {
                attempted = true;
                let outcome = match candidate.action_type {
                    ActionType::Click => {
                        let (x, y) = resolve_click_target(&dom, candidate.target.as_deref());
                        self.driver.click(x, y)
                    }
                    ActionType::Keyboard => {
                        let key = candidate
                            .target
                            .clone()
                            .unwrap_or_else(|| "Space".to_string());
                        self.driver.press(&key)
                    }
                    ActionType::Wait => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let pause = self.config.wait_delay.min(remaining);
                        if !pause.is_zero() {
                            std::thread::sleep(pause);
                        }
                        if self.state == TestState::Loading {
                            self.transition(TestState::Exploring, "wait elapsed");
                        }
                        Ok(())
                    }
                    ActionType::Screenshot => self
                        .session
                        .capture_screenshot(&screenshot, "requested")
                        .map(|_| ())
                        .map_err(DriverError::Io),
                    ActionType::Unknown => Ok(()),
                };
                if let Err(e) = outcome {
                    // Fatal only to this action, not the run.
                    let _ = self
                        .session
                        .append_log(&format!("action {} failed: {}", label, e));
                }
                if self.state == TestState::Loading && candidate.action_type != ActionType::Wait {
                    self.transition(TestState::Exploring, "first confident action attempted");
                }
            }

            if attempted
                && candidate.action_type != ActionType::Wait
                && !self.config.settle_delay.is_zero()
            {
                std::thread::sleep(self.config.settle_delay);
            }

            // Record
            let (changed, screenshot_path) = match self.driver.screenshot() {
                Ok(bytes) => {
                    let changed = self.tracker.record_screenshot(&bytes, &label);
                    (changed, self.session.capture_screenshot(&bytes, &label).ok())
                }
                Err(e) => {
                    let _ = self
                        .session
                        .append_log(&format!("post-action screenshot failed: {}", e));
                    (false, None)
                }
            };

            actions.push(ActionRecord {
                sequence: seq,
                state: self.state,
                action: candidate,
                attempted,
                changed,
                screenshot_path,
            });
            previous_action = Some(label);
        }

        let final_screenshot_path = self
            .driver
            .screenshot()
            .ok()
            .and_then(|bytes| self.session.capture_screenshot(&bytes, "final").ok());

        let metrics = self.tracker.metrics();
        let _ = self.session.append_log(&format!(
            "run end: {} after {} actions, score {:.0}",
            self.state,
            actions.len(),
            metrics.progress_score
        ));

        RunReport {
            terminal_state: self.state,
            actions,
            transitions: self.transitions,
            metrics,
            unstick_log,
            final_screenshot_path,
            error,
        }
    }
}

/// Resolve a click candidate's target description to viewport coordinates:
/// a text match against the DOM wins, the viewport center is the fallback.
fn resolve_click_target(dom: &DomSummary, target: Option<&str>) -> (f64, f64) {
    if let Some(desc) = target {
        let needle = desc.to_lowercase();
        if let Some(element) = dom.visible_clickable().find(|e| {
            let text = e.text.to_lowercase();
            !text.is_empty() && (text.contains(&needle) || needle.contains(&text))
        }) {
            return element.center();
        }
    }
    dom.viewport_center()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DomElement, MockBrowser, labeled_frame};
    use crate::vision::{ScriptedOracle, VisionAnalysis};

    fn test_config(url: &str) -> RunConfig {
        RunConfig::new(url)
            .max_actions(10)
            .max_duration(Duration::from_secs(30))
            .stuck_threshold(3)
            .recovery_budget(2)
            .settle_delay(Duration::ZERO)
            .wait_delay(Duration::ZERO)
            .navigation_retry(RetryPolicy::immediate(3))
    }

    fn test_session() -> (tempfile::TempDir, Session) {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::in_dir(tmp.path().join("run")).keep(false);
        (tmp, session)
    }

    fn clicker_dom() -> DomSummary {
        DomSummary {
            title: "Cookie Clicker Deluxe".to_string(),
            viewport_width: 800.0,
            viewport_height: 600.0,
            ..Default::default()
        }
    }

    fn distinct_frames(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| labeled_frame(&format!("frame {}", i), [(i * 16) as u8, 32, 32]))
            .collect()
    }

    #[test]
    fn test_confident_heuristics_complete_without_oracle() {
        // Scenario: max_actions = 5 and every Layer-1 decision clears the
        // bypass - the oracle must never be consulted.
        let (_tmp, session) = test_session();
        let browser = MockBrowser::new()
            .frames(distinct_frames(8))
            .dom(clicker_dom())
            .advance_on_click(true);
        let oracle = ScriptedOracle::new([]);
        let config = test_config("https://games.test/clicker").max_actions(5);

        let report = TestRunLoop::new(browser, &oracle, session, config).run();

        assert_eq!(report.terminal_state, TestState::Completed);
        assert_eq!(report.actions.len(), 5);
        assert!(report.success());
        assert_eq!(oracle.calls(), 0);
        // Every action was the high-confidence heuristic click.
        assert!(report.actions.iter().all(|a| a.attempted));
        assert!(report.unstick_log.is_empty());
    }

    #[test]
    fn test_zero_duration_times_out_before_any_action() {
        let (_tmp, session) = test_session();
        let browser = MockBrowser::new().dom(clicker_dom());
        let oracle = ScriptedOracle::new([]);
        let config = test_config("https://games.test/slow").max_duration(Duration::ZERO);

        let report = TestRunLoop::new(browser, oracle, session, config).run();

        assert_eq!(report.terminal_state, TestState::TimedOut);
        assert!(report.actions.is_empty());
        assert!(!report.success());
    }

    #[test]
    fn test_navigation_exhaustion_crashes_with_report() {
        let (_tmp, session) = test_session();
        let browser = MockBrowser::new().failing_navigations(10);
        let oracle = ScriptedOracle::new([]);
        let config = test_config("https://games.test/unreachable");

        let report = TestRunLoop::new(browser, oracle, session, config).run();

        assert_eq!(report.terminal_state, TestState::Crashed);
        assert!(report.error.as_deref().unwrap().contains("navigation failed"));
        assert!(report.actions.is_empty());
        // Still a fully-formed report with the transition trail.
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].from, TestState::Initializing);
        assert_eq!(report.transitions[0].to, TestState::Crashed);
    }

    #[test]
    fn test_fatal_console_error_crashes() {
        let (_tmp, session) = test_session();
        let mut dom = clicker_dom();
        dom.console_errors
            .push("Uncaught TypeError: game.init is not a function".to_string());
        let browser = MockBrowser::new().dom(dom);
        let oracle = ScriptedOracle::new([]);

        let report =
            TestRunLoop::new(browser, oracle, session, test_config("https://games.test/broken"))
                .run();

        assert_eq!(report.terminal_state, TestState::Crashed);
        assert!(report.error.as_deref().unwrap().contains("Uncaught TypeError"));
    }

    #[test]
    fn test_stall_recovers_through_keyboard_mash() {
        // Clicks do nothing, Space works: the run stalls, recovery finds the
        // key, and the run completes its budget.
        let (_tmp, session) = test_session();
        let browser = MockBrowser::new()
            .frames(distinct_frames(4))
            .dom(DomSummary {
                title: "Untitled".to_string(),
                viewport_width: 800.0,
                viewport_height: 600.0,
                ..Default::default()
            })
            .advance_on_keys(["Space"]);
        let oracle = ScriptedOracle::new([]);
        let config = test_config("https://games.test/keyboard-only").max_actions(8);

        let report = TestRunLoop::new(browser, oracle, session, config).run();

        assert_eq!(report.terminal_state, TestState::Completed);
        assert!(!report.unstick_log.is_empty());
        let mash = report
            .unstick_log
            .iter()
            .find(|a| a.strategy == "keyboard_mash")
            .expect("keyboard mash should have run");
        assert!(mash.changed);
        // The machine walked Stuck -> Recovering -> Exploring.
        let visited: Vec<TestState> = report.transitions.iter().map(|t| t.to).collect();
        assert!(visited.contains(&TestState::Stuck));
        assert!(visited.contains(&TestState::Recovering));
    }

    #[test]
    fn test_recovery_budget_bounds_dead_pages() {
        // A page that never responds: every recovery "resolves" only through
        // the refresh strategy's guaranteed change claim, so the episode
        // budget converts the loop into a crash.
        let (_tmp, session) = test_session();
        let browser = MockBrowser::new().dom(DomSummary {
            viewport_width: 800.0,
            viewport_height: 600.0,
            ..Default::default()
        });
        let oracle = ScriptedOracle::new([]);
        let config = test_config("https://games.test/dead")
            .max_actions(50)
            .stuck_threshold(2)
            .recovery_budget(2);

        let report = TestRunLoop::new(browser, oracle, session, config).run();

        assert_eq!(report.terminal_state, TestState::Crashed);
        assert!(report.error.as_deref().unwrap().contains("recovery budget"));
        // Two full episodes ran before the third was refused.
        let refreshes = report
            .unstick_log
            .iter()
            .filter(|a| a.strategy == "page_refresh")
            .count();
        assert!(refreshes >= 2);
    }

    #[test]
    fn test_weak_unknown_on_first_decision_is_not_stuck() {
        // Scenario: the oracle answers "unknown" at confidence 35 on the
        // very first decision. Below the escalation floor, but the run is
        // still Loading - no Stuck transition, and an action is attempted.
        let (_tmp, session) = test_session();
        let browser = MockBrowser::new()
            .frames(distinct_frames(4))
            .dom(DomSummary {
                viewport_width: 800.0,
                viewport_height: 600.0,
                ..Default::default()
            })
            .advance_on_click(true);
        let oracle = ScriptedOracle::new([VisionAnalysis {
            action_type: crate::strategy::ActionType::Unknown,
            target: None,
            confidence: 35,
            reasoning: "cannot tell".to_string(),
        }]);
        let config = test_config("https://games.test/ambiguous").max_actions(2);

        let report = TestRunLoop::new(browser, &oracle, session, config).run();

        assert!(report.transitions.iter().all(|t| t.to != TestState::Stuck));
        assert!(report.actions[0].attempted);
        assert!(oracle.calls() >= 1);
        assert_eq!(report.terminal_state, TestState::Completed);
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let (_tmp, session) = test_session();
        let browser = MockBrowser::new()
            .frames(distinct_frames(8))
            .dom(clicker_dom())
            .advance_on_click(true);
        let oracle = ScriptedOracle::new([]);
        let config = test_config("https://games.test/clicker").max_actions(4);

        let report = TestRunLoop::new(browser, oracle, session, config).run();

        let mut sequences: Vec<u64> = report
            .transitions
            .iter()
            .map(|t| t.sequence)
            .chain(report.actions.iter().map(|a| a.sequence))
            .collect();
        let unsorted = sequences.clone();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), unsorted.len(), "sequence numbers must be unique");
    }

    #[test]
    fn test_final_screenshot_is_captured() {
        let (_tmp, session) = test_session();
        let dir = session.dir.clone();
        let browser = MockBrowser::new().dom(clicker_dom());
        let oracle = ScriptedOracle::new([]);
        let config = test_config("https://games.test/clicker").max_actions(1);

        let report = TestRunLoop::new(browser, oracle, session, config).run();

        let path = report.final_screenshot_path.expect("final screenshot");
        assert!(path.starts_with(&dir));
    }

    #[test]
    fn test_resolve_click_target_matches_text() {
        let dom = DomSummary {
            viewport_width: 800.0,
            viewport_height: 600.0,
            elements: vec![DomElement {
                tag: "button".to_string(),
                text: "Start Game".to_string(),
                x: 10.0,
                y: 20.0,
                width: 100.0,
                height: 40.0,
                visible: true,
                clickable: true,
            }],
            ..Default::default()
        };

        assert_eq!(resolve_click_target(&dom, Some("start")), (60.0, 40.0));
        assert_eq!(resolve_click_target(&dom, Some("nonexistent")), (400.0, 300.0));
        assert_eq!(resolve_click_target(&dom, None), (400.0, 300.0));
    }
}
