//! Ambient configuration for the guard: the knobs that control how policy
//! refresh, persistent-store retries, metrics cardinality and logging
//! behave, as opposed to the policy documents themselves (budgets, routing,
//! pricing — see [`crate::policy::loader`]).
//!
//! Layered loading: an optional TOML file supplies a base, environment
//! variables override individual fields, invalid values are silently
//! ignored rather than failing the load.

pub mod error;
pub mod logging;

pub use error::ConfigError;
pub use logging::{LogFormat, LoggingConfig};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::FailureMode;

/// Top-level configuration for a [`crate::guard::Guard`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// How the guard behaves when an internal invariant check fails mid-decision.
    pub failure_mode: FailureMode,
    /// Directory of `budgets.toml` / `routing.toml` / `pricing.toml` documents.
    pub policy_dir: Option<String>,
    /// Prefix for the environment-variable policy source.
    pub env_prefix: String,
    /// Minimum interval between best-effort policy reloads.
    pub policy_refresh_interval_secs: u64,
    /// Bound on persistent-store CAS retries before degrading to in-memory-only.
    pub cas_max_attempts: u32,
    /// Prefix used to build the persistent-store key `{prefix}:budget:{scope_key}`.
    pub store_key_prefix: String,
    /// How long a `RunState` is retained after `on_run_end` for late-arriving usage reports.
    pub late_arrival_grace_secs: i64,
    /// Whether `run_id` is included in emitted metric attributes (high-cardinality opt-in).
    pub include_run_id_in_metrics: bool,
    pub logging: LoggingConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            policy_dir: None,
            env_prefix: "STRAND_COST_GUARD_".to_string(),
            policy_refresh_interval_secs: 30,
            cas_max_attempts: 8,
            store_key_prefix: "strand_cost_guard".to_string(),
            late_arrival_grace_secs: 30,
            include_run_id_in_metrics: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Load from a TOML file, or return defaults if `path` is `None`.
    /// A path that doesn't exist is a `NotFound` error; a present-but-bad
    /// document is a `Parse` error — the caller is expected to retain its
    /// prior config and warn (`ConfigInvalid` handling).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Best-effort environment overrides. Invalid values are silently
    /// ignored so the guard can still start with defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mode) = std::env::var("STRAND_COST_GUARD_FAILURE_MODE") {
            match mode.to_lowercase().as_str() {
                "fail_open" => self.failure_mode = FailureMode::FailOpen,
                "fail_closed" => self.failure_mode = FailureMode::FailClosed,
                _ => {}
            }
        }
        if let Ok(dir) = std::env::var("STRAND_COST_GUARD_POLICY_DIR") {
            self.policy_dir = Some(dir);
        }
        if let Ok(prefix) = std::env::var("STRAND_COST_GUARD_ENV_PREFIX") {
            self.env_prefix = prefix;
        }
        if let Ok(prefix) = std::env::var("STRAND_COST_GUARD_STORE_KEY_PREFIX") {
            self.store_key_prefix = prefix;
        }
        if let Ok(secs) = std::env::var("STRAND_COST_GUARD_REFRESH_INTERVAL_SECS") {
            if let Ok(v) = secs.parse() {
                self.policy_refresh_interval_secs = v;
            }
        }
        if let Ok(level) = std::env::var("STRAND_COST_GUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("STRAND_COST_GUARD_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.logging.format = f;
            }
        }
        if let Ok(run_id) = std::env::var("STRAND_COST_GUARD_INCLUDE_RUN_ID") {
            self.include_run_id_in_metrics = run_id.to_lowercase() == "true";
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cas_max_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "cas_max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.env_prefix.is_empty() {
            return Err(ConfigError::Validation {
                field: "env_prefix".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
