//! Backend selection, capability flags and runtime options

use rill_core::clock::{system_clock, SharedClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SandboxError;

/// Default interpreter heap limit (256 MiB)
pub const DEFAULT_MEMORY_LIMIT: usize = 256 * 1024 * 1024;

/// Default interpreter stack limit (1 MiB)
pub const DEFAULT_MAX_STACK: usize = 1024 * 1024;

/// Interpreter backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process QuickJS, one interpreter per runtime
    #[default]
    QuickJs,
    /// QuickJS on a dedicated thread per context
    Worker,
    /// Unrestricted in-process evaluation for trusted code
    Direct,
}

impl Backend {
    /// Every backend, in preference order
    pub const ALL: [Backend; 3] = [Backend::QuickJs, Backend::Worker, Backend::Direct];

    /// Configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::QuickJs => "quickjs",
            Backend::Worker => "worker",
            Backend::Direct => "direct",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| SandboxError::Backend(format!("unknown backend `{}`", s)))
    }
}

/// How strongly contexts are separated from the host and from each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Guest shares the host process with no resource limits
    None,
    /// Separate interpreter globals with enforced limits
    Interpreter,
    /// Separate interpreter on its own OS thread
    Thread,
}

/// What a backend can guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SandboxCapabilities {
    /// Running scripts can be aborted by an interrupt handler
    pub hard_interrupt: bool,
    /// Isolation level
    pub isolation: Isolation,
    /// `eval_async` waits for promise results
    pub async_eval: bool,
    /// Heap limit is enforced
    pub memory_limit: bool,
    /// A host function may call back into the context that called it
    pub reentrant_calls: bool,
}

/// Options for a new runtime
#[derive(Clone)]
pub struct RuntimeOptions {
    /// Heap limit in bytes (`None` leaves the interpreter default)
    pub memory_limit_bytes: Option<usize>,
    /// Stack limit in bytes
    pub max_stack_bytes: Option<usize>,
    /// Deadline for each entry into the guest; enforced by interrupt
    pub hard_timeout_ms: Option<u64>,
    /// Maximum nesting depth for values crossing the boundary
    pub max_codec_depth: usize,
    /// Time source for budgets and deadlines
    pub clock: SharedClock,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            memory_limit_bytes: Some(DEFAULT_MEMORY_LIMIT),
            max_stack_bytes: Some(DEFAULT_MAX_STACK),
            hard_timeout_ms: None,
            max_codec_depth: rill_core::codec::DEFAULT_MAX_DEPTH,
            clock: system_clock(),
        }
    }
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .field("max_stack_bytes", &self.max_stack_bytes)
            .field("hard_timeout_ms", &self.hard_timeout_ms)
            .field("max_codec_depth", &self.max_codec_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        for backend in Backend::ALL {
            assert_eq!(backend.as_str().parse::<Backend>().unwrap(), backend);
        }
        assert!("v8".parse::<Backend>().is_err());
        assert_eq!(Backend::default(), Backend::QuickJs);
    }

    #[test]
    fn test_backend_serde_names() {
        let json = serde_json::to_string(&Backend::QuickJs).unwrap();
        assert_eq!(json, "\"quickjs\"");
        let parsed: Backend = serde_json::from_str("\"worker\"").unwrap();
        assert_eq!(parsed, Backend::Worker);
    }
}
