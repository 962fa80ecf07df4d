//! Game Vision - automated browser game playability probing.
//!
//! This crate provides:
//! - A sequential run loop that plays an unfamiliar browser game under a
//!   wall-clock budget, deciding inputs under visual uncertainty
//! - Screenshot fingerprinting to detect whether the game is responding
//! - An escalating decision engine (heuristics, then a vision model)
//! - Ordered unstick strategies for getting past loading/start screens
//! - Session management for organized evidence files
//!
//! # Example
//!
//! ```rust,no_run
//! use game_vision::driver::MockBrowser;
//! use game_vision::runloop::{RunConfig, TestRunLoop};
//! use game_vision::session::Session;
//! use game_vision::vision::{VlmClient, VlmConfig};
//!
//! let driver = MockBrowser::new();
//! let oracle = VlmClient::new(VlmConfig::default());
//! let session = Session::with_name("demo");
//! let config = RunConfig::new("https://example.com/game");
//! let report = TestRunLoop::new(driver, oracle, session, config).run();
//! println!("{} ({:.0}%)", report.terminal_state, report.metrics.progress_score);
//! ```

pub mod config;
pub mod driver;
pub mod progress;
pub mod runloop;
pub mod runner;
pub mod session;
pub mod strategy;
pub mod unstick;
pub mod vision;

// Re-export run loop types
pub use runloop::{RunConfig, TestRunLoop};
pub use runner::{ActionRecord, RunReport, TestState, TransitionRecord};

// Re-export progress tracking
pub use progress::{ProgressMetrics, ProgressTracker, ScreenshotFingerprint, fingerprint};

// Re-export the decision engine
pub use strategy::{
    ActionCandidate, ActionStrategyEngine, ActionType, ConfidenceThresholds, DecisionContext,
};

// Re-export recovery
pub use unstick::{UnstickAttempt, UnstickContext, UnstickCoordinator, UnstickReport, UnstickStrategy};

// Re-export driver types and the mock
pub use driver::{
    BrowserDriver, DomElement, DomSummary, DriverError, DriverResult, FrameHandle, MockBrowser,
    RetryPolicy,
};

// Re-export session management
pub use session::{Session, cleanup_old_sessions, list_sessions};

// Re-export the vision oracle
pub use vision::{
    AnalysisContext, ScriptedOracle, VisionAnalysis, VisionError, VisionOracle, VisionResult,
    VlmClient, VlmConfig, build_game_prompt, check_health, parse_verdict,
};
