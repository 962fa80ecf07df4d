//! Types for test run results and the evidence trail.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::progress::ProgressMetrics;
use crate::strategy::ActionCandidate;
use crate::unstick::UnstickAttempt;

/// Lifecycle state of a run. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestState {
    /// Acquiring the browser session
    Initializing,

    /// Navigation issued, waiting for the game to appear
    Loading,

    /// Actively trying inputs
    Exploring,

    /// Progress has stalled
    Stuck,

    /// Unstick strategies are running
    Recovering,

    /// Run finished its action or duration budget without crashing
    Completed,

    /// Fatal script error or recovery exhaustion
    Crashed,

    /// Wall-clock budget exceeded
    TimedOut,
}

impl TestState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestState::Completed | TestState::Crashed | TestState::TimedOut
        )
    }
}

impl std::fmt::Display for TestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestState::Initializing => "Initializing",
            TestState::Loading => "Loading",
            TestState::Exploring => "Exploring",
            TestState::Stuck => "Stuck",
            TestState::Recovering => "Recovering",
            TestState::Completed => "Completed",
            TestState::Crashed => "Crashed",
            TestState::TimedOut => "TimedOut",
        };
        write!(f, "{}", s)
    }
}

/// One executed (or deliberately skipped) action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Monotonic sequence number shared with transitions
    pub sequence: u64,

    /// State the loop was in when the action ran
    pub state: TestState,

    /// The candidate the engine produced
    pub action: ActionCandidate,

    /// Whether the input was actually sent (false below the attempt floor)
    pub attempted: bool,

    /// Whether the following screenshot differed from the previous one
    pub changed: bool,

    /// Evidence screenshot taken after the action, if capture succeeded
    pub screenshot_path: Option<PathBuf>,
}

/// One state machine transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Monotonic sequence number shared with actions
    pub sequence: u64,

    pub from: TestState,
    pub to: TestState,

    /// Why the transition fired
    pub reason: String,
}

/// Complete result of a run.
///
/// Always fully formed: crashes and timeouts still carry every action,
/// transition, and metric collected up to that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// The state the run ended in
    pub terminal_state: TestState,

    /// Every action taken, in order
    pub actions: Vec<ActionRecord>,

    /// Every state transition, in order
    pub transitions: Vec<TransitionRecord>,

    /// Final progress metrics snapshot
    pub metrics: ProgressMetrics,

    /// Every recovery attempt across all stuck episodes
    pub unstick_log: Vec<UnstickAttempt>,

    /// Last screenshot of the run, if one could be captured
    pub final_screenshot_path: Option<PathBuf>,

    /// Terminal error description for Crashed runs
    pub error: Option<String>,
}

impl RunReport {
    /// Whether the run finished its budget without crashing or timing out.
    pub fn success(&self) -> bool {
        self.terminal_state == TestState::Completed
    }
}
