//! Sandbox errors

use rill_core::{CallError, CodecError, ErrorValue, WireError};
use thiserror::Error;

/// Errors produced by sandbox providers, runtimes and contexts
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    /// Guest source failed to parse
    #[error("SyntaxError: {message}")]
    Syntax {
        /// Parser message
        message: String,
        /// Stack trace, if the interpreter produced one
        stack: Option<String>,
    },

    /// Guest code threw
    #[error("{name}: {message}")]
    Runtime {
        /// Error constructor name
        name: String,
        /// Error message
        message: String,
        /// Stack trace, if any
        stack: Option<String>,
    },

    /// The cooperative execution budget ran out
    #[error("BudgetExceeded: {0}")]
    BudgetExceeded(String),

    /// A hard interrupt aborted the running script
    #[error("Interrupted")]
    Interrupted,

    /// The context was disposed
    #[error("Context disposed")]
    ContextDisposed,

    /// The runtime was disposed
    #[error("Runtime disposed")]
    RuntimeDisposed,

    /// The backend cannot do this
    #[error("The {backend} backend does not support {feature}")]
    Unsupported {
        /// Backend name
        backend: &'static str,
        /// Missing feature
        feature: &'static str,
    },

    /// The interpreter is already running and cannot be re-entered
    #[error("Context is busy")]
    Busy,

    /// A value could not cross the boundary
    #[error("Marshalling failed: {0}")]
    Marshal(String),

    /// Malformed wire data
    #[error("Invalid wire data: {0}")]
    Wire(String),

    /// The interpreter ran out of memory
    #[error("Out of memory")]
    OutOfMemory,

    /// The worker thread that hosted the context has stopped
    #[error("Worker thread is gone")]
    WorkerGone,

    /// Interpreter failure outside guest control
    #[error("Backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Map an error thrown by guest code to a sandbox error
    pub fn from_guest(err: ErrorValue) -> Self {
        match err.name.as_str() {
            "SyntaxError" => SandboxError::Syntax {
                message: err.message,
                stack: err.stack,
            },
            "BudgetExceeded" => SandboxError::BudgetExceeded(err.message),
            "InternalError" if err.message.contains("out of memory") => SandboxError::OutOfMemory,
            _ => SandboxError::Runtime {
                name: err.name,
                message: err.message,
                stack: err.stack,
            },
        }
    }

    /// Is the context unusable after this error?
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::OutOfMemory | SandboxError::WorkerGone | SandboxError::Backend(_)
        )
    }

    /// Describe this error as a guest-visible error object
    pub fn to_error_value(&self) -> ErrorValue {
        match self {
            SandboxError::Syntax { message, stack } => ErrorValue {
                name: "SyntaxError".into(),
                message: message.clone(),
                stack: stack.clone(),
            },
            SandboxError::Runtime { name, message, stack } => ErrorValue {
                name: name.clone(),
                message: message.clone(),
                stack: stack.clone(),
            },
            SandboxError::BudgetExceeded(message) => ErrorValue::new("BudgetExceeded", message.clone()),
            SandboxError::Interrupted => ErrorValue::new("Interrupted", "Execution interrupted"),
            SandboxError::ContextDisposed => ErrorValue::new("ContextDisposed", "Context disposed"),
            SandboxError::Busy => ErrorValue::new("Busy", "Context is busy"),
            other => ErrorValue::new("FatalError", other.to_string()),
        }
    }
}

impl From<CodecError> for SandboxError {
    fn from(err: CodecError) -> Self {
        SandboxError::Marshal(err.to_string())
    }
}

impl From<WireError> for SandboxError {
    fn from(err: WireError) -> Self {
        SandboxError::Wire(err.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Wire(err.to_string())
    }
}

impl From<CallError> for SandboxError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::ContextDisposed => SandboxError::ContextDisposed,
            CallError::Busy => SandboxError::Busy,
            CallError::Marshal(message) => SandboxError::Marshal(message),
            other => SandboxError::from_guest(other.to_error_value()),
        }
    }
}

impl From<SandboxError> for CallError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::ContextDisposed | SandboxError::RuntimeDisposed => CallError::ContextDisposed,
            SandboxError::Busy => CallError::Busy,
            SandboxError::Marshal(message) | SandboxError::Wire(message) => CallError::Marshal(message),
            other => CallError::Thrown(other.to_error_value()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_error_names_map_to_variants() {
        assert!(matches!(
            SandboxError::from_guest(ErrorValue::new("SyntaxError", "unexpected token")),
            SandboxError::Syntax { .. }
        ));
        assert_eq!(
            SandboxError::from_guest(ErrorValue::new("BudgetExceeded", "over")),
            SandboxError::BudgetExceeded("over".into())
        );
        assert_eq!(
            SandboxError::from_guest(ErrorValue::new("InternalError", "out of memory")),
            SandboxError::OutOfMemory
        );
        assert!(matches!(
            SandboxError::from_guest(ErrorValue::new("TypeError", "x is not a function")),
            SandboxError::Runtime { ref name, .. } if name == "TypeError"
        ));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SandboxError::OutOfMemory.is_fatal());
        assert!(SandboxError::WorkerGone.is_fatal());
        assert!(!SandboxError::Interrupted.is_fatal());
        assert!(!SandboxError::BudgetExceeded("x".into()).is_fatal());
        assert!(!SandboxError::ContextDisposed.is_fatal());
    }

    #[test]
    fn test_call_error_round_trip() {
        assert_eq!(CallError::from(SandboxError::ContextDisposed), CallError::ContextDisposed);
        assert_eq!(SandboxError::from(CallError::Busy), SandboxError::Busy);
        match CallError::from(SandboxError::Interrupted) {
            CallError::Thrown(err) => assert_eq!(err.name, "Interrupted"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
