//! Engine configuration
//!
//! ```toml
//! backend = "quickjs"
//! timeout_ms = 50
//! hard_timeout_ms = 1000
//! memory_limit_bytes = 268435456
//! max_batch_size = 500
//! throttle_ms = 16
//! dedup_callbacks = true
//! merge_batches = true
//! serialize_batches = false
//! ```

use rill_core::protocol::scheduler::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_THROTTLE_MS};
use rill_core::SchedulerConfig;
use rill_sandbox::{Backend, RuntimeOptions, DEFAULT_MAX_STACK, DEFAULT_MEMORY_LIMIT};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Errors from config parsing
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sandbox backend
    pub backend: Backend,
    /// Cooperative budget per guest turn, checked by `__checkBudget()`
    pub timeout_ms: Option<u64>,
    /// Hard deadline per guest turn, enforced by interrupt
    pub hard_timeout_ms: Option<u64>,
    /// Interpreter heap limit
    pub memory_limit_bytes: Option<usize>,
    /// Interpreter stack limit
    pub max_stack_bytes: Option<usize>,
    /// Queued operations that force a flush
    pub max_batch_size: usize,
    /// Minimum time between timed flushes of queued operations
    pub throttle_ms: u64,
    /// Give a function one handle no matter how often it crosses
    pub dedup_callbacks: bool,
    /// Coalesce operations before applying a batch
    pub merge_batches: bool,
    /// Round-trip every batch through wire JSON before applying it
    pub serialize_batches: bool,
    /// Maximum nesting depth of values crossing the boundary
    pub max_codec_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            timeout_ms: None,
            hard_timeout_ms: None,
            memory_limit_bytes: Some(DEFAULT_MEMORY_LIMIT),
            max_stack_bytes: Some(DEFAULT_MAX_STACK),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            throttle_ms: DEFAULT_THROTTLE_MS,
            dedup_callbacks: true,
            merge_batches: true,
            serialize_batches: false,
            max_codec_depth: rill_core::codec::DEFAULT_MAX_DEPTH,
        }
    }
}

impl EngineConfig {
    /// Parse a config from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be at least 1".into()));
        }
        if self.max_codec_depth == 0 {
            return Err(ConfigError::Invalid("max_codec_depth must be at least 1".into()));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("timeout_ms must be positive when set".into()));
        }
        if self.hard_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("hard_timeout_ms must be positive when set".into()));
        }
        if self.memory_limit_bytes == Some(0) {
            return Err(ConfigError::Invalid("memory_limit_bytes must be positive when set".into()));
        }
        Ok(())
    }

    /// Apply a patch; the result is validated and `self` is unchanged on error
    pub fn patched(&self, patch: &EngineConfigPatch) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(timeout) = patch.timeout_ms {
            next.timeout_ms = timeout;
        }
        if let Some(size) = patch.max_batch_size {
            next.max_batch_size = size;
        }
        if let Some(throttle) = patch.throttle_ms {
            next.throttle_ms = throttle;
        }
        if let Some(merge) = patch.merge_batches {
            next.merge_batches = merge;
        }
        if let Some(serialize) = patch.serialize_batches {
            next.serialize_batches = serialize;
        }
        next.validate()?;
        Ok(next)
    }

    /// Scheduler settings derived from this config
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_batch_size: self.max_batch_size,
            throttle_ms: self.throttle_ms,
            merge: self.merge_batches,
        }
    }

    /// Runtime options derived from this config
    pub fn runtime_options(&self, clock: rill_core::SharedClock) -> RuntimeOptions {
        RuntimeOptions {
            memory_limit_bytes: self.memory_limit_bytes,
            max_stack_bytes: self.max_stack_bytes,
            hard_timeout_ms: self.hard_timeout_ms,
            max_codec_depth: self.max_codec_depth,
            clock,
        }
    }
}

/// Settings that can change on a live engine.
///
/// Backend, interpreter limits, the hard deadline and callback dedup are
/// fixed once the sandbox exists. `Some(None)` clears the budget.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfigPatch {
    /// New cooperative budget
    pub timeout_ms: Option<Option<u64>>,
    /// New flush size
    pub max_batch_size: Option<usize>,
    /// New throttle window
    pub throttle_ms: Option<u64>,
    /// Toggle merging
    pub merge_batches: Option<bool>,
    /// Toggle wire round-trips
    pub serialize_batches: Option<bool>,
}
