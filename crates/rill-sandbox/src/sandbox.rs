//! The provider / runtime / context contract every backend implements

use rill_core::RuntimeValue;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::capabilities::{RuntimeOptions, SandboxCapabilities};
use crate::error::SandboxError;
use crate::interrupt::InterruptHandler;

/// Allocate a process-unique context id
pub(crate) fn next_context_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created, nothing evaluated yet
    Created,
    /// Has run guest code or received globals
    Active,
    /// Disposed; every operation fails with `ContextDisposed`
    Disposed,
}

/// Factory for runtimes of one backend
pub trait SandboxProvider {
    /// Backend name
    fn name(&self) -> &'static str;

    /// Guarantees of this backend
    fn capabilities(&self) -> SandboxCapabilities;

    /// Create a runtime
    fn create_runtime(&self, options: &RuntimeOptions) -> Result<Rc<dyn SandboxRuntime>, SandboxError>;
}

/// An interpreter instance that hosts any number of contexts
pub trait SandboxRuntime {
    /// Create an isolated global scope
    fn create_context(&self) -> Result<Rc<dyn SandboxContext>, SandboxError>;

    /// Dispose the runtime and every context it created
    fn dispose(&self);

    /// Has the runtime been disposed?
    fn is_disposed(&self) -> bool;
}

/// One isolated guest global scope
pub trait SandboxContext {
    /// Process-unique id
    fn id(&self) -> u64;

    /// Guarantees of the backing interpreter
    fn capabilities(&self) -> SandboxCapabilities;

    /// Current lifecycle state
    fn state(&self) -> ContextState;

    /// Evaluate a script and return its completion value
    fn eval(&self, source: &str) -> Result<RuntimeValue, SandboxError>;

    /// Evaluate a script and wait for a promise completion value to settle
    fn eval_async(&self, source: &str) -> Result<RuntimeValue, SandboxError>;

    /// Assign a guest global
    fn set_global(&self, name: &str, value: RuntimeValue) -> Result<(), SandboxError>;

    /// Read a guest global
    fn get_global(&self, name: &str) -> Result<RuntimeValue, SandboxError>;

    /// Install a predicate polled while guest code runs; true aborts it
    fn set_interrupt_handler(&self, handler: InterruptHandler) -> Result<(), SandboxError>;

    /// Remove the interrupt predicate
    fn clear_interrupt_handler(&self) -> Result<(), SandboxError>;

    /// Configure the cooperative budget checked by `__checkBudget()`
    fn set_budget(&self, timeout_ms: Option<u64>) -> Result<(), SandboxError>;

    /// Release the context; idempotent
    fn dispose(&self);

    /// Has the context been disposed?
    fn is_disposed(&self) -> bool {
        self.state() == ContextState::Disposed
    }
}
