//! Error types shared across the bridge.

use crate::registry::CallbackId;
use crate::value::ErrorValue;
use thiserror::Error;

/// Errors raised while encoding a live value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// Nesting exceeded the configured maximum depth
    #[error("Maximum encoding depth exceeded ({0})")]
    MaxDepthExceeded(usize),

    /// A function could not be turned into a handle
    #[error("Function registration failed: {0}")]
    Registration(String),
}

/// Errors raised while reading the JSON wire format
#[derive(Debug, Error)]
pub enum WireError {
    /// Malformed JSON text
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A tagged value is missing a required field
    #[error("Tagged value `{tag}` is missing field `{field}`")]
    MissingField {
        /// Value of the `__type` tag
        tag: String,
        /// Name of the missing field
        field: &'static str,
    },

    /// A field had the wrong JSON type
    #[error("Field `{field}` has the wrong type: expected {expected}")]
    InvalidField {
        /// Name of the field
        field: &'static str,
        /// Expected JSON shape
        expected: &'static str,
    },

    /// Unknown `__type` tag
    #[error("Unknown wire type: {0}")]
    UnknownType(String),
}

/// Errors from the callback registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The handle was never registered or has already been destroyed
    #[error("Callback handle not found: {0}")]
    HandleNotFound(CallbackId),
}

/// Errors produced by calling a function across the boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The callee threw synchronously
    #[error("{0}")]
    Thrown(ErrorValue),

    /// The callee returned a promise that rejected
    #[error("Promise rejected: {0}")]
    Rejected(ErrorValue),

    /// The handle is unknown to the registry that owns it
    #[error("Callback handle not found: {0}")]
    HandleNotFound(CallbackId),

    /// The context that owns the function has been disposed
    #[error("Context disposed")]
    ContextDisposed,

    /// The owning context is already executing and cannot be re-entered
    #[error("Context is busy")]
    Busy,

    /// Arguments or results could not cross the boundary
    #[error("Marshalling failed: {0}")]
    Marshal(String),
}

impl CallError {
    /// Describe this failure as a guest-visible error object.
    pub fn to_error_value(&self) -> ErrorValue {
        match self {
            CallError::Thrown(err) | CallError::Rejected(err) => err.clone(),
            CallError::HandleNotFound(id) => {
                ErrorValue::new("HandleNotFound", format!("Callback handle not found: {}", id))
            }
            CallError::ContextDisposed => ErrorValue::new("ContextDisposed", "Context disposed"),
            CallError::Busy => ErrorValue::new("Busy", "Context is busy"),
            CallError::Marshal(message) => ErrorValue::new("TypeError", message.clone()),
        }
    }
}

impl From<RegistryError> for CallError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::HandleNotFound(id) => CallError::HandleNotFound(id),
        }
    }
}

impl From<CodecError> for CallError {
    fn from(err: CodecError) -> Self {
        CallError::Marshal(err.to_string())
    }
}

/// Errors raised while interpreting guest-authored operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Unknown `op` tag
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Required field missing or of the wrong type
    #[error("Operation {op} has an invalid `{field}` field")]
    InvalidField {
        /// Operation tag
        op: String,
        /// Field name
        field: &'static str,
    },

    /// The batch envelope itself is malformed
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// The batch was produced by an incompatible protocol version
    #[error("Unsupported protocol version {got} (expected {expected})")]
    VersionMismatch {
        /// Version this build speaks
        expected: u32,
        /// Version found in the batch
        got: u32,
    },
}

/// Errors surfaced by the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Encoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Wire format failure
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Malformed operation stream
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Failed cross-boundary call
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}
