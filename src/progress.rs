//! Screenshot-fingerprint progress tracking.
//!
//! Every action the run loop takes is followed by a screenshot. This module
//! reduces each screenshot to a SHA-256 content hash and keeps the full hash
//! history, which is enough to answer the two questions the loop cares about:
//! - did the last input visibly change anything?
//! - have the last N inputs all produced the same frame (i.e. are we stuck)?

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Compute the content fingerprint of a screenshot.
///
/// Shared with the unstick strategies, which compare before/after frames
/// without going through a tracker.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// One recorded screenshot: its hash, position in the run, and the action
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotFingerprint {
    /// SHA-256 hex digest of the raw image bytes
    pub hash: String,

    /// 0-based position in the recording sequence
    pub sequence: usize,

    /// Label of the action that led to this frame (e.g. "click", "press:Space")
    pub action: String,
}

/// Counters derived from the fingerprint history.
///
/// `progress_score` is a pure function of the other fields, so identical
/// input sequences always produce identical metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressMetrics {
    /// Recordings whose hash differed from the previous frame
    pub screenshots_changed: usize,

    /// Recordings whose hash matched the previous frame
    pub screenshots_identical: usize,

    /// Length of the current run of identical frames
    pub consecutive_identical: usize,

    /// Distinct frame hashes seen over the whole run
    pub unique_states: HashSet<String>,

    /// Total recordings (one per attempted input)
    pub inputs_attempted: usize,

    /// Recordings that changed the screen
    pub inputs_successful: usize,

    /// 0-100 playability score, see [`ProgressMetrics::score`]
    pub progress_score: f64,
}

impl ProgressMetrics {
    /// Recompute the progress score from the counters.
    ///
    /// `min(100, success_rate * 100 + min(unique_states * 5, 20))`, or 0
    /// before any input has been attempted. The unique-state bonus caps at
    /// 20 so a game that merely flickers between many frames cannot saturate
    /// the score without inputs actually landing.
    fn score(&self) -> f64 {
        if self.inputs_attempted == 0 {
            return 0.0;
        }
        let success_rate =
            (self.inputs_successful as f64 / self.inputs_attempted as f64) * 100.0;
        let state_bonus = (self.unique_states.len() as f64 * 5.0).min(20.0);
        (success_rate + state_bonus).min(100.0)
    }
}

/// Tracks whether the game under test is actually responding.
///
/// Owned exclusively by a single run loop; never shared.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    history: Vec<ScreenshotFingerprint>,
    metrics: ProgressMetrics,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a screenshot taken after `action` and report whether the frame
    /// changed.
    ///
    /// The first recording is the bootstrap baseline and always reports
    /// `true`. Subsequent recordings compare against the previous hash.
    pub fn record_screenshot(&mut self, bytes: &[u8], action: &str) -> bool {
        let hash = fingerprint(bytes);
        let previous = self.history.last().map(|f| f.hash.clone());

        self.history.push(ScreenshotFingerprint {
            hash: hash.clone(),
            sequence: self.history.len(),
            action: action.to_string(),
        });

        self.metrics.inputs_attempted += 1;

        let changed = match previous {
            None => true,
            Some(prev) => prev != hash,
        };

        if changed {
            self.metrics.screenshots_changed += 1;
            self.metrics.consecutive_identical = 0;
            self.metrics.inputs_successful += 1;
            self.metrics.unique_states.insert(hash);
        } else {
            self.metrics.screenshots_identical += 1;
            self.metrics.consecutive_identical += 1;
        }

        self.metrics.progress_score = self.metrics.score();
        changed
    }

    /// True once the last `threshold` recordings were all identical to the
    /// frame before them.
    pub fn is_stuck(&self, threshold: usize) -> bool {
        self.metrics.consecutive_identical >= threshold
    }

    /// Immutable snapshot of the current metrics (the unique-state set is
    /// deep-copied).
    pub fn metrics(&self) -> ProgressMetrics {
        self.metrics.clone()
    }

    /// Hash of the most recently recorded frame, if any.
    pub fn last_hash(&self) -> Option<&str> {
        self.history.last().map(|f| f.hash.as_str())
    }

    /// Full fingerprint history for the evidence trail.
    pub fn history(&self) -> &[ScreenshotFingerprint] {
        &self.history
    }

    /// Clear all state for test isolation.
    pub fn reset(&mut self) {
        self.history.clear();
        self.metrics = ProgressMetrics::default();
    }
}
