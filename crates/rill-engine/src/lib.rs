//! Rill Engine
//!
//! Runs one guest bundle inside a sandbox and keeps a host-side replica of
//! the tree it renders:
//! - Injects the guest hooks (`__sendToHost`, `__enqueueOperation`, timers)
//! - Feeds guest batches through the bridge into a receiver
//! - Reports errors and guest messages as subscribable events

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod timers;

pub use config::{ConfigError, EngineConfig, EngineConfigPatch};
pub use engine::{Engine, EngineHealth, ResourceStats};
pub use error::EngineError;
pub use events::{EngineEvent, EventBus, EventKind, ListenerId};
pub use timers::{TimerId, TimerQueue};
