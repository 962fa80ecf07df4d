//! Recovery maneuvers for runs that have stopped making visual progress.
//!
//! A stuck run walks a fixed-priority list of strategies, cheapest first:
//! frame probing, DOM button scanning, vision-guided clicking, keyboard
//! mashing, and finally a page refresh. Execution stops at the first
//! strategy that visibly changes the screen. Every attempt records
//! before/after fingerprints through the evidence sink, so even failed
//! recoveries leave a trail.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::driver::{BrowserDriver, DomSummary};
use crate::progress::fingerprint;
use crate::session::Session;
use crate::strategy::START_LEXICON;
use crate::vision::VisionOracle;

/// Embed selectors probed by [`IframeDetection`], most specific first
const EMBED_SELECTORS: &[&str] = &[
    "#game-drop",
    "#game-container iframe",
    "iframe[src*=\"game\"]",
    "iframe[src*=\"itch\"]",
    "iframe",
];

/// Keys tapped by [`KeyboardMash`], in order
const MASH_KEYS: &[&str] = &[
    "Space", "Enter", "Escape", "ArrowUp", "ArrowDown", "ArrowLeft", "ArrowRight", "w", "a",
    "s", "d",
];

/// Outcome of one recovery strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnstickAttempt {
    /// Strategy name, e.g. "keyboard_mash"
    pub strategy: String,

    /// Whether the strategy executed its maneuver without a driver error
    pub success: bool,

    /// Whether the screen fingerprint changed
    pub changed: bool,

    /// Human-readable description of what was done
    pub action: String,

    /// Fingerprints bracketing the maneuver
    pub before_hash: String,
    pub after_hash: String,

    /// Driver/oracle error, if one occurred
    pub error: Option<String>,
}

/// Aggregate result of a recovery pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnstickReport {
    /// One entry per strategy tried, in order
    pub attempts: Vec<UnstickAttempt>,

    /// True iff some strategy changed the screen
    pub resolved: bool,
}

/// Context shared by all strategies during one recovery pass
pub struct UnstickContext<'a> {
    /// Latest DOM summary, captured just before recovery started
    pub dom: &'a DomSummary,

    /// Oracle for the vision-guided strategy
    pub oracle: &'a dyn VisionOracle,

    /// Evidence sink receiving before/after screenshots
    pub evidence: &'a Session,

    /// Operator hint about the game's controls
    pub input_hint: Option<&'a str>,

    /// Pause between an input and its re-check screenshot
    pub settle_delay: Duration,
}

/// Trait for recovery strategies
///
/// Implementations must not propagate driver errors; failures are folded
/// into the returned attempt.
pub trait UnstickStrategy {
    /// Stable name used in logs and reports
    fn name(&self) -> &str;

    /// Run the maneuver and report what happened
    fn execute(&self, driver: &mut dyn BrowserDriver, ctx: &UnstickContext<'_>) -> UnstickAttempt;
}

/// Screenshot the page, file it as evidence, and return (bytes, hash).
fn capture(
    driver: &mut dyn BrowserDriver,
    ctx: &UnstickContext<'_>,
    label: &str,
) -> Result<(Vec<u8>, String), String> {
    let bytes = driver.screenshot().map_err(|e| e.to_string())?;
    // Evidence write failures must not abort a recovery in flight.
    let _ = ctx.evidence.capture_screenshot(&bytes, label);
    let hash = fingerprint(&bytes);
    Ok((bytes, hash))
}

fn settle(ctx: &UnstickContext<'_>) {
    if !ctx.settle_delay.is_zero() {
        std::thread::sleep(ctx.settle_delay);
    }
}

/// Probe common embed selectors and click into the first matching frame.
///
/// Many portals wrap the actual game in an iframe; clicks on the outer page
/// never reach it until the driver switches context.
pub struct IframeDetection;

impl UnstickStrategy for IframeDetection {
    fn name(&self) -> &str {
        "iframe_detection"
    }

    fn execute(&self, driver: &mut dyn BrowserDriver, ctx: &UnstickContext<'_>) -> UnstickAttempt {
        let name = self.name();
        let (before_hash, mut error) = match capture(driver, ctx, &format!("{}_before", name)) {
            Ok((_, hash)) => (hash, None),
            Err(e) => (String::new(), Some(e)),
        };

        let mut action = "no embedded frame found".to_string();
        let mut success = false;

        for selector in EMBED_SELECTORS {
            match driver.switch_frame(selector) {
                Ok(Some(_)) => {
                    let (cx, cy) = ctx.dom.viewport_center();
                    match driver.click(cx, cy) {
                        Ok(()) => {
                            action = format!("switched into {} and clicked its center", selector);
                            success = true;
                        }
                        Err(e) => {
                            action = format!("switched into {} but click failed", selector);
                            error = Some(e.to_string());
                        }
                    }
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        settle(ctx);
        let after_hash = match capture(driver, ctx, &format!("{}_after", name)) {
            Ok((_, hash)) => hash,
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        };

        let changed = success && !before_hash.is_empty() && before_hash != after_hash;
        UnstickAttempt {
            strategy: name.to_string(),
            success,
            changed,
            action,
            before_hash,
            after_hash,
            error,
        }
    }
}

/// Scan the DOM summary for a start-like button and click its center.
pub struct DomButtonFinder;

impl UnstickStrategy for DomButtonFinder {
    fn name(&self) -> &str {
        "dom_button_finder"
    }

    fn execute(&self, driver: &mut dyn BrowserDriver, ctx: &UnstickContext<'_>) -> UnstickAttempt {
        let name = self.name();
        let (before_hash, mut error) = match capture(driver, ctx, &format!("{}_before", name)) {
            Ok((_, hash)) => (hash, None),
            Err(e) => (String::new(), Some(e)),
        };

        let target = ctx.dom.visible_clickable().find(|e| {
            let text = e.text.to_lowercase();
            START_LEXICON.iter().any(|w| text.contains(w))
        });

        let (mut action, mut success) = ("no start-like button in DOM".to_string(), false);
        if let Some(element) = target {
            let (cx, cy) = element.center();
            match driver.click(cx, cy) {
                Ok(()) => {
                    action = format!("clicked \"{}\" at ({:.0}, {:.0})", element.text, cx, cy);
                    success = true;
                }
                Err(e) => {
                    action = format!("click on \"{}\" failed", element.text);
                    error = Some(e.to_string());
                }
            }
        }

        settle(ctx);
        let after_hash = match capture(driver, ctx, &format!("{}_after", name)) {
            Ok((_, hash)) => hash,
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        };

        let changed = success && !before_hash.is_empty() && before_hash != after_hash;
        UnstickAttempt {
            strategy: name.to_string(),
            success,
            changed,
            action,
            before_hash,
            after_hash,
            error,
        }
    }
}

/// Ask the oracle to name a clickable target, then click the matching DOM
/// element's center, or the viewport center if nothing matches.
pub struct VisionGuidedClick;

impl UnstickStrategy for VisionGuidedClick {
    fn name(&self) -> &str {
        "vision_guided_click"
    }

    fn execute(&self, driver: &mut dyn BrowserDriver, ctx: &UnstickContext<'_>) -> UnstickAttempt {
        let name = self.name();
        let (before_bytes, before_hash, mut error) =
            match capture(driver, ctx, &format!("{}_before", name)) {
                Ok((bytes, hash)) => (bytes, hash, None),
                Err(e) => (Vec::new(), String::new(), Some(e)),
            };

        let analysis_ctx = crate::vision::AnalysisContext {
            previous_action: None,
            attempt: 0,
            input_hint: ctx.input_hint.map(String::from),
            dom_excerpt: format!("title: {}", ctx.dom.title),
        };

        let described_target = match ctx.oracle.analyze(&before_bytes, &analysis_ctx) {
            Ok(analysis) => analysis.target,
            Err(e) => {
                error = Some(e.to_string());
                None
            }
        };

        // Text-match the description against the DOM; fall back to center.
        let matched = described_target.as_deref().and_then(|desc| {
            let needle = desc.to_lowercase();
            ctx.dom.visible_clickable().find(|e| {
                let text = e.text.to_lowercase();
                !text.is_empty() && (text.contains(&needle) || needle.contains(&text))
            })
        });

        let ((cx, cy), described) = match matched {
            Some(element) => (element.center(), format!("\"{}\"", element.text)),
            None => (ctx.dom.viewport_center(), "viewport center".to_string()),
        };

        let (action, success) = match driver.click(cx, cy) {
            Ok(()) => (format!("clicked {} at ({:.0}, {:.0})", described, cx, cy), true),
            Err(e) => {
                error = Some(e.to_string());
                (format!("click on {} failed", described), false)
            }
        };

        settle(ctx);
        let after_hash = match capture(driver, ctx, &format!("{}_after", name)) {
            Ok((_, hash)) => hash,
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        };

        let changed = success && !before_hash.is_empty() && before_hash != after_hash;
        UnstickAttempt {
            strategy: name.to_string(),
            success,
            changed,
            action,
            before_hash,
            after_hash,
            error,
        }
    }
}

/// Serially tap a fixed key set, re-checking the fingerprint after each key
/// and stopping at the first one that changes the screen.
pub struct KeyboardMash;

impl UnstickStrategy for KeyboardMash {
    fn name(&self) -> &str {
        "keyboard_mash"
    }

    fn execute(&self, driver: &mut dyn BrowserDriver, ctx: &UnstickContext<'_>) -> UnstickAttempt {
        let name = self.name();
        let (_, before_hash, mut error) = match capture(driver, ctx, &format!("{}_before", name)) {
            Ok((bytes, hash)) => (bytes, hash, None),
            Err(e) => (Vec::new(), String::new(), Some(e)),
        };

        let mut action = "no key changed the screen".to_string();
        let mut success = false;
        let mut changed = false;
        let mut after_hash = before_hash.clone();

        for key in MASH_KEYS {
            if let Err(e) = driver.press(key) {
                error = Some(e.to_string());
                break;
            }
            success = true;
            settle(ctx);

            // Intermediate re-checks hash the frame directly; only the
            // final frame goes to the evidence sink below.
            match driver.screenshot() {
                Ok(bytes) => {
                    after_hash = fingerprint(&bytes);
                    if !before_hash.is_empty() && after_hash != before_hash {
                        action = format!("press:{} changed the screen", key);
                        changed = true;
                        break;
                    }
                }
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        if let Ok((_, hash)) = capture(driver, ctx, &format!("{}_after", name)) {
            after_hash = hash;
        }

        UnstickAttempt {
            strategy: name.to_string(),
            success,
            changed,
            action,
            before_hash,
            after_hash,
            error,
        }
    }
}

/// Reload the page. Always reports `changed = true`: a reload rebuilds the
/// DOM even when the rendered frame looks identical.
pub struct PageRefresh;

impl UnstickStrategy for PageRefresh {
    fn name(&self) -> &str {
        "page_refresh"
    }

    fn execute(&self, driver: &mut dyn BrowserDriver, ctx: &UnstickContext<'_>) -> UnstickAttempt {
        let name = self.name();
        let (before_hash, mut error) = match capture(driver, ctx, &format!("{}_before", name)) {
            Ok((_, hash)) => (hash, None),
            Err(e) => (String::new(), Some(e)),
        };

        let (action, success) = match driver.reload() {
            Ok(()) => ("reloaded the page".to_string(), true),
            Err(e) => {
                error = Some(e.to_string());
                ("reload failed".to_string(), false)
            }
        };

        settle(ctx);
        let after_hash = match capture(driver, ctx, &format!("{}_after", name)) {
            Ok((_, hash)) => hash,
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        };

        UnstickAttempt {
            strategy: name.to_string(),
            success,
            changed: success,
            action,
            before_hash,
            after_hash,
            error,
        }
    }
}

/// Runs the ordered strategy list, first visible change wins
pub struct UnstickCoordinator {
    strategies: Vec<Box<dyn UnstickStrategy>>,
}

impl UnstickCoordinator {
    /// Coordinator with a custom strategy list (tests inject mocks here)
    pub fn new(strategies: Vec<Box<dyn UnstickStrategy>>) -> Self {
        Self { strategies }
    }

    /// The production ordering, cheapest and least disruptive first
    pub fn with_default_strategies() -> Self {
        Self::new(vec![
            Box::new(IframeDetection),
            Box::new(DomButtonFinder),
            Box::new(VisionGuidedClick),
            Box::new(KeyboardMash),
            Box::new(PageRefresh),
        ])
    }

    /// Try each strategy in order, stopping at the first that changes the
    /// screen. The report always carries every attempt made.
    pub fn execute_all(
        &self,
        driver: &mut dyn BrowserDriver,
        ctx: &UnstickContext<'_>,
    ) -> UnstickReport {
        let mut attempts = Vec::new();
        let mut resolved = false;

        for strategy in &self.strategies {
            let attempt = strategy.execute(driver, ctx);
            let _ = ctx.evidence.append_log(&format!(
                "unstick {}: success={} changed={} {}",
                attempt.strategy, attempt.success, attempt.changed, attempt.action
            ));
            let changed = attempt.changed;
            attempts.push(attempt);
            if changed {
                resolved = true;
                break;
            }
        }

        UnstickReport { attempts, resolved }
    }
}

impl Default for UnstickCoordinator {
    fn default() -> Self {
        Self::with_default_strategies()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DomElement, MockBrowser, labeled_frame};
    use crate::strategy::ActionType;
    use crate::vision::{ScriptedOracle, VisionAnalysis};

    fn two_frame_browser() -> MockBrowser {
        MockBrowser::new().frames(vec![
            labeled_frame("stuck", [32, 0, 0]),
            labeled_frame("moving", [0, 32, 0]),
        ])
    }

    struct TestContext {
        _tmp: tempfile::TempDir,
        session: Session,
        oracle: ScriptedOracle,
        dom: DomSummary,
    }

    impl TestContext {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let session = Session::in_dir(tmp.path().join("evidence"));
            Self {
                _tmp: tmp,
                session,
                oracle: ScriptedOracle::new([]),
                dom: DomSummary::default(),
            }
        }

        fn ctx(&self) -> UnstickContext<'_> {
            UnstickContext {
                dom: &self.dom,
                oracle: &self.oracle,
                evidence: &self.session,
                input_hint: None,
                settle_delay: Duration::ZERO,
            }
        }
    }

    /// Scripted strategy for coordinator ordering tests. Panics if a
    /// strategy marked unreachable is ever executed.
    struct FixedStrategy {
        name: &'static str,
        changed: bool,
        reachable: bool,
    }

    impl FixedStrategy {
        fn new(name: &'static str, changed: bool) -> Self {
            Self {
                name,
                changed,
                reachable: true,
            }
        }

        fn unreachable(name: &'static str) -> Self {
            Self {
                name,
                changed: false,
                reachable: false,
            }
        }
    }

    impl UnstickStrategy for FixedStrategy {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(
            &self,
            _driver: &mut dyn BrowserDriver,
            _ctx: &UnstickContext<'_>,
        ) -> UnstickAttempt {
            assert!(
                self.reachable,
                "strategy {} must never be invoked",
                self.name
            );
            UnstickAttempt {
                strategy: self.name.to_string(),
                success: self.changed,
                changed: self.changed,
                action: String::new(),
                before_hash: "aaaa".to_string(),
                after_hash: if self.changed { "bbbb" } else { "aaaa" }.to_string(),
                error: None,
            }
        }
    }

    #[test]
    fn test_execute_all_stops_at_first_change() {
        // Scenario: [Fail, Fail, Succeed, NeverCalled] - the fourth strategy
        // must never run.
        let fixture = TestContext::new();
        let mut browser = MockBrowser::new();

        let coordinator = UnstickCoordinator::new(vec![
            Box::new(FixedStrategy::new("fail_one", false)),
            Box::new(FixedStrategy::new("fail_two", false)),
            Box::new(FixedStrategy::new("succeed", true)),
            Box::new(FixedStrategy::unreachable("never_called")),
        ]);

        let report = coordinator.execute_all(&mut browser, &fixture.ctx());

        assert!(report.resolved);
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.attempts[2].strategy, "succeed");
        assert!(report.attempts.iter().all(|a| a.strategy != "never_called"));
    }

    #[test]
    fn test_execute_all_exhaustion_keeps_every_attempt() {
        let fixture = TestContext::new();
        let mut browser = MockBrowser::new();

        let coordinator = UnstickCoordinator::new(vec![
            Box::new(FixedStrategy::new("one", false)),
            Box::new(FixedStrategy::new("two", false)),
        ]);

        let report = coordinator.execute_all(&mut browser, &fixture.ctx());

        assert!(!report.resolved);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts.last().unwrap().strategy, "two");
    }

    #[test]
    fn test_iframe_detection_switches_and_clicks() {
        let fixture = TestContext::new();
        let mut browser = two_frame_browser()
            .embedded_frame("iframe[src*=\"game\"]")
            .advance_on_click(true);

        let attempt = IframeDetection.execute(&mut browser, &fixture.ctx());

        assert!(attempt.success);
        assert!(attempt.changed);
        assert_eq!(browser.frame_switches, vec!["iframe[src*=\"game\"]"]);
        assert_eq!(browser.clicks.len(), 1);
        assert_ne!(attempt.before_hash, attempt.after_hash);
    }

    #[test]
    fn test_iframe_detection_without_frame_is_clean_miss() {
        let fixture = TestContext::new();
        let mut browser = MockBrowser::new();

        let attempt = IframeDetection.execute(&mut browser, &fixture.ctx());

        assert!(!attempt.success);
        assert!(!attempt.changed);
        assert!(attempt.error.is_none());
        assert!(browser.clicks.is_empty());
    }

    #[test]
    fn test_dom_button_finder_clicks_start_center() {
        let mut fixture = TestContext::new();
        fixture.dom.elements.push(DomElement {
            tag: "button".to_string(),
            text: "PLAY".to_string(),
            x: 100.0,
            y: 100.0,
            width: 60.0,
            height: 20.0,
            visible: true,
            clickable: true,
        });
        let mut browser = two_frame_browser().advance_on_click(true);

        let attempt = DomButtonFinder.execute(&mut browser, &fixture.ctx());

        assert!(attempt.changed);
        assert_eq!(browser.clicks, vec![(130.0, 110.0)]);
    }

    #[test]
    fn test_dom_button_finder_ignores_invisible_buttons() {
        let mut fixture = TestContext::new();
        fixture.dom.elements.push(DomElement {
            tag: "button".to_string(),
            text: "Start".to_string(),
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            visible: false,
            clickable: true,
        });
        let mut browser = MockBrowser::new();

        let attempt = DomButtonFinder.execute(&mut browser, &fixture.ctx());

        assert!(!attempt.success);
        assert!(browser.clicks.is_empty());
    }

    #[test]
    fn test_vision_guided_click_matches_described_element() {
        let mut fixture = TestContext::new();
        fixture.dom.elements.push(DomElement {
            tag: "button".to_string(),
            text: "Begin Quest".to_string(),
            x: 200.0,
            y: 300.0,
            width: 100.0,
            height: 40.0,
            visible: true,
            clickable: true,
        });
        fixture.oracle = ScriptedOracle::new([VisionAnalysis {
            action_type: ActionType::Click,
            target: Some("begin quest".to_string()),
            confidence: 77,
            reasoning: "prominent button".to_string(),
        }]);
        let mut browser = two_frame_browser().advance_on_click(true);

        let attempt = VisionGuidedClick.execute(&mut browser, &fixture.ctx());

        assert!(attempt.changed);
        assert_eq!(browser.clicks, vec![(250.0, 320.0)]);
    }

    #[test]
    fn test_vision_guided_click_falls_back_to_center_on_oracle_error() {
        let fixture = TestContext::new(); // empty oracle script -> error
        let mut browser = two_frame_browser().advance_on_click(true);

        let attempt = VisionGuidedClick.execute(&mut browser, &fixture.ctx());

        assert!(attempt.success);
        assert!(attempt.changed);
        assert!(attempt.error.is_some());
        assert_eq!(browser.clicks, vec![(640.0, 360.0)]);
    }

    #[test]
    fn test_keyboard_mash_stops_at_first_effective_key() {
        let fixture = TestContext::new();
        let mut browser = two_frame_browser().advance_on_keys(["Escape"]);

        let attempt = KeyboardMash.execute(&mut browser, &fixture.ctx());

        assert!(attempt.changed);
        assert_eq!(browser.keys, vec!["Space", "Enter", "Escape"]);
        assert!(attempt.action.contains("Escape"));
    }

    #[test]
    fn test_keyboard_mash_exhausts_key_set_on_dead_screen() {
        let fixture = TestContext::new();
        let mut browser = MockBrowser::new();

        let attempt = KeyboardMash.execute(&mut browser, &fixture.ctx());

        assert!(!attempt.changed);
        assert!(attempt.success); // keys were pressed, screen just ignored them
        assert_eq!(browser.keys.len(), MASH_KEYS.len());
    }

    #[test]
    fn test_page_refresh_always_reports_changed() {
        let fixture = TestContext::new();
        // Single static frame: visually nothing changes, yet refresh must
        // still claim a change.
        let mut browser = MockBrowser::new();

        let attempt = PageRefresh.execute(&mut browser, &fixture.ctx());

        assert!(attempt.changed);
        assert_eq!(browser.reloads, 1);
        assert_eq!(attempt.before_hash, attempt.after_hash);
    }

    #[test]
    fn test_attempts_record_evidence_files() {
        let fixture = TestContext::new();
        let mut browser = MockBrowser::new();

        let _ = PageRefresh.execute(&mut browser, &fixture.ctx());

        let captures = fixture.session.list_captures().unwrap();
        assert_eq!(captures.len(), 2); // before + after
    }
}
