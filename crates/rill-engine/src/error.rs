//! Engine errors

use rill_core::{BridgeError, CallError, ProtocolError};
use rill_sandbox::SandboxError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by [`Engine`](crate::Engine)
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was destroyed; nothing runs any more
    #[error("Engine destroyed")]
    Destroyed,

    /// A bundle is already loaded
    #[error("A bundle is already loaded")]
    AlreadyLoaded,

    /// Guest code failed or the sandbox rejected the request
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// A call across the boundary failed
    #[error(transparent)]
    Call(#[from] CallError),

    /// Guest sent a malformed batch
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A batch could not be encoded or decoded
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Does this error leave the sandbox unusable?
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Sandbox(err) => err.is_fatal(),
            EngineError::Call(CallError::Thrown(err)) => err.name == "FatalError",
            _ => false,
        }
    }
}
