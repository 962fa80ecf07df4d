//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for Game Vision,
//! supporting:
//! - Environment variables for all configurable values
//! - Sensible defaults for local use
//! - Builder-free access through a cached global
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `GAME_VISION_VLM_ENDPOINT` | VLM API endpoint URL | `http://127.0.0.1:8080/v1/chat/completions` |
//! | `GAME_VISION_VLM_MODEL` | Model name for VLM | `qwen3` |
//! | `GAME_VISION_VLM_MAX_TOKENS` | Maximum tokens in VLM response | `400` |
//! | `GAME_VISION_VLM_TIMEOUT` | Activity timeout (seconds) | `60` |
//! | `GAME_VISION_VLM_CONNECT_TIMEOUT` | Connection timeout (seconds) | `10` |
//! | `GAME_VISION_SESSION_DIR` | Base directory for sessions | `/tmp/game-vision` |
//! | `GAME_VISION_MAX_ACTIONS` | Default action budget per run | `50` |
//! | `GAME_VISION_MAX_DURATION` | Default run budget (seconds) | `120` |
//! | `GAME_VISION_SETTLE_DELAY` | Post-input settle pause (ms) | `400` |
//! | `GAME_VISION_WAIT_DELAY` | Wait action pause (ms) | `1500` |
//! | `GAME_VISION_STUCK_THRESHOLD` | Identical frames before stuck | `5` |
//! | `GAME_VISION_RECOVERY_BUDGET` | Recovery episodes before crash | `3` |

use std::env;
use std::sync::OnceLock;

// ============================================================================
// Default Values
// ============================================================================

/// Default VLM API endpoint
pub const DEFAULT_VLM_ENDPOINT: &str = "http://127.0.0.1:8080/v1/chat/completions";

/// Default VLM model name
pub const DEFAULT_VLM_MODEL: &str = "qwen3";

/// Default max tokens for VLM responses
pub const DEFAULT_VLM_MAX_TOKENS: u32 = 400;

/// Default VLM connection timeout (seconds)
pub const DEFAULT_VLM_CONNECT_TIMEOUT: u64 = 10;

/// Default VLM activity timeout (seconds)
pub const DEFAULT_VLM_ACTIVITY_TIMEOUT: u64 = 60;

/// Default session base directory
pub const DEFAULT_SESSION_DIR: &str = "/tmp/game-vision";

/// Default per-run action budget
pub const DEFAULT_MAX_ACTIONS: usize = 50;

/// Default per-run wall-clock budget (seconds)
pub const DEFAULT_MAX_DURATION_SECS: u64 = 120;

/// Default pause between an input and its screenshot (milliseconds)
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 400;

/// Default Wait action pause (milliseconds)
pub const DEFAULT_WAIT_DELAY_MS: u64 = 1500;

/// Default identical-frame count that counts as stuck
pub const DEFAULT_STUCK_THRESHOLD: usize = 5;

/// Default recovery episodes allowed before a run is declared crashed
pub const DEFAULT_RECOVERY_BUDGET: usize = 3;

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for VLM endpoint
pub const ENV_VLM_ENDPOINT: &str = "GAME_VISION_VLM_ENDPOINT";

/// Environment variable for VLM model
pub const ENV_VLM_MODEL: &str = "GAME_VISION_VLM_MODEL";

/// Environment variable for VLM max tokens
pub const ENV_VLM_MAX_TOKENS: &str = "GAME_VISION_VLM_MAX_TOKENS";

/// Environment variable for VLM connection timeout
pub const ENV_VLM_CONNECT_TIMEOUT: &str = "GAME_VISION_VLM_CONNECT_TIMEOUT";

/// Environment variable for VLM activity timeout
pub const ENV_VLM_ACTIVITY_TIMEOUT: &str = "GAME_VISION_VLM_TIMEOUT";

/// Environment variable for session directory
pub const ENV_SESSION_DIR: &str = "GAME_VISION_SESSION_DIR";

/// Environment variable for the default action budget
pub const ENV_MAX_ACTIONS: &str = "GAME_VISION_MAX_ACTIONS";

/// Environment variable for the default duration budget (seconds)
pub const ENV_MAX_DURATION: &str = "GAME_VISION_MAX_DURATION";

/// Environment variable for the settle delay (milliseconds)
pub const ENV_SETTLE_DELAY: &str = "GAME_VISION_SETTLE_DELAY";

/// Environment variable for the wait delay (milliseconds)
pub const ENV_WAIT_DELAY: &str = "GAME_VISION_WAIT_DELAY";

/// Environment variable for the stuck threshold
pub const ENV_STUCK_THRESHOLD: &str = "GAME_VISION_STUCK_THRESHOLD";

/// Environment variable for the recovery budget
pub const ENV_RECOVERY_BUDGET: &str = "GAME_VISION_RECOVERY_BUDGET";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for Game Vision
#[derive(Debug, Clone)]
pub struct Config {
    /// VLM configuration
    pub vlm: VlmSettings,
    /// Session configuration
    pub session: SessionSettings,
    /// Default values for run configuration
    pub defaults: DefaultSettings,
}

/// VLM-related settings
#[derive(Debug, Clone)]
pub struct VlmSettings {
    /// API endpoint URL
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
    /// Activity timeout during streaming (seconds)
    pub activity_timeout: u64,
}

/// Session-related settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base directory for session storage
    pub base_dir: String,
}

/// Default values for run configuration
#[derive(Debug, Clone)]
pub struct DefaultSettings {
    /// Action budget per run
    pub max_actions: usize,
    /// Wall-clock budget per run (seconds)
    pub max_duration_secs: u64,
    /// Post-input settle pause (milliseconds)
    pub settle_delay_ms: u64,
    /// Wait action pause (milliseconds)
    pub wait_delay_ms: u64,
    /// Identical frames before a run counts as stuck
    pub stuck_threshold: usize,
    /// Recovery episodes allowed before crashing
    pub recovery_budget: usize,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            vlm: VlmSettings::from_env(),
            session: SessionSettings::from_env(),
            defaults: DefaultSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            vlm: VlmSettings::defaults(),
            session: SessionSettings::defaults(),
            defaults: DefaultSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl VlmSettings {
    /// Create VLM settings from environment variables
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var(ENV_VLM_ENDPOINT)
                .unwrap_or_else(|_| DEFAULT_VLM_ENDPOINT.to_string()),
            model: env::var(ENV_VLM_MODEL).unwrap_or_else(|_| DEFAULT_VLM_MODEL.to_string()),
            max_tokens: env::var(ENV_VLM_MAX_TOKENS)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_VLM_MAX_TOKENS),
            connect_timeout: env::var(ENV_VLM_CONNECT_TIMEOUT)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_VLM_CONNECT_TIMEOUT),
            activity_timeout: env::var(ENV_VLM_ACTIVITY_TIMEOUT)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_VLM_ACTIVITY_TIMEOUT),
        }
    }

    /// Create VLM settings with defaults
    pub fn defaults() -> Self {
        Self {
            endpoint: DEFAULT_VLM_ENDPOINT.to_string(),
            model: DEFAULT_VLM_MODEL.to_string(),
            max_tokens: DEFAULT_VLM_MAX_TOKENS,
            connect_timeout: DEFAULT_VLM_CONNECT_TIMEOUT,
            activity_timeout: DEFAULT_VLM_ACTIVITY_TIMEOUT,
        }
    }
}

impl SessionSettings {
    /// Create session settings from environment variables
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_SESSION_DIR)
                .unwrap_or_else(|_| DEFAULT_SESSION_DIR.to_string()),
        }
    }

    /// Create session settings with defaults
    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_SESSION_DIR.to_string(),
        }
    }
}

impl DefaultSettings {
    /// Create default settings from environment variables
    pub fn from_env() -> Self {
        Self {
            max_actions: env::var(ENV_MAX_ACTIONS)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_ACTIONS),
            max_duration_secs: env::var(ENV_MAX_DURATION)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_DURATION_SECS),
            settle_delay_ms: env::var(ENV_SETTLE_DELAY)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SETTLE_DELAY_MS),
            wait_delay_ms: env::var(ENV_WAIT_DELAY)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_WAIT_DELAY_MS),
            stuck_threshold: env::var(ENV_STUCK_THRESHOLD)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_STUCK_THRESHOLD),
            recovery_budget: env::var(ENV_RECOVERY_BUDGET)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RECOVERY_BUDGET),
        }
    }

    /// Create default settings with hardcoded defaults
    pub fn defaults() -> Self {
        Self {
            max_actions: DEFAULT_MAX_ACTIONS,
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            wait_delay_ms: DEFAULT_WAIT_DELAY_MS,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            recovery_budget: DEFAULT_RECOVERY_BUDGET,
        }
    }
}

// ============================================================================
// Convenience Functions
// ============================================================================

/// Get VLM endpoint from environment (convenience function)
pub fn vlm_endpoint() -> String {
    get().vlm.endpoint.clone()
}

/// Get VLM model from environment (convenience function)
pub fn vlm_model() -> String {
    get().vlm.model.clone()
}

/// Get session base directory (convenience function)
pub fn session_base_dir() -> String {
    get().session.base_dir.clone()
}
