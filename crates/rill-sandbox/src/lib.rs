//! Rill Sandbox
//!
//! Isolated JavaScript execution contexts for guest code:
//! - [`SandboxProvider`] / [`SandboxRuntime`] / [`SandboxContext`] contract
//! - `quickjs`, `worker` and `direct` backends
//! - Cooperative budget (`__checkBudget`) and hard interrupts
//! - Guest prelude carrying the guest half of the value codec

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod backend;
pub mod budget;
pub mod capabilities;
pub mod error;
mod host;
pub mod interrupt;
mod js;
pub mod sandbox;

pub use backend::{provider, DirectProvider, QuickJsProvider, WorkerProvider};
pub use budget::{Budget, BUDGET_POLL_INTERVAL};
pub use capabilities::{
    Backend, Isolation, RuntimeOptions, SandboxCapabilities, DEFAULT_MAX_STACK, DEFAULT_MEMORY_LIMIT,
};
pub use error::SandboxError;
pub use interrupt::InterruptHandler;
pub use js::GUEST_LOG_TARGET;
pub use sandbox::{ContextState, SandboxContext, SandboxProvider, SandboxRuntime};
