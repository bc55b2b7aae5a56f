//! The engine: one sandbox, one receiver, and the glue between them

use rill_core::clock::system_clock;
use rill_core::{
    Bridge, BridgeError, CallbackId, CallbackRegistry, FunctionValue, GuestBatch, Operation,
    OperationMerger, Receiver, RuntimeValue, SharedClock, ThrottledScheduler, TreeNode,
};
use rill_sandbox::{SandboxContext, SandboxRuntime};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config::{EngineConfig, EngineConfigPatch};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, EventKind, ListenerId};
use crate::hooks;
use crate::timers::{TimerId, TimerQueue};

/// Liveness snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    /// A bundle loaded successfully
    pub loaded: bool,
    /// The engine was destroyed
    pub destroyed: bool,
    /// Errors seen so far
    pub error_count: u64,
    /// Clock time of the last error
    pub last_error_at: Option<u64>,
}

/// Live resource counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    /// Pending guest timers
    pub timers: usize,
    /// Replicated nodes
    pub nodes: usize,
    /// Live callback handles
    pub callbacks: usize,
}

// ============================================================================
// Shared state
// ============================================================================

/// State reachable from guest hooks
pub(crate) struct EngineShared {
    config: RefCell<EngineConfig>,
    clock: SharedClock,
    runtime: Rc<dyn SandboxRuntime>,
    context: Rc<dyn SandboxContext>,
    registry: Rc<CallbackRegistry>,
    bridge: Rc<Bridge>,
    receiver: RefCell<Receiver>,
    scheduler: RefCell<ThrottledScheduler<RuntimeValue>>,
    timers: RefCell<TimerQueue>,
    events: EventBus,
    loaded: Cell<bool>,
    destroyed: Cell<bool>,
    error_count: Cell<u64>,
    last_error_at: Cell<Option<u64>>,
}

impl EngineShared {
    pub(crate) fn context(&self) -> Rc<dyn SandboxContext> {
        self.context.clone()
    }

    pub(crate) fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn live(&self) -> Result<(), EngineError> {
        if self.destroyed.get() {
            Err(EngineError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    /// Record an error, emit it, and destroy the engine when it is fatal
    fn fail(&self, err: EngineError) -> EngineError {
        self.error_count.set(self.error_count.get() + 1);
        self.last_error_at.set(Some(self.now_ms()));
        let message = err.to_string();
        if err.is_fatal() {
            tracing::error!(error = %message, "fatal sandbox error, destroying engine");
            self.events.emit(&EngineEvent::FatalError { message });
            self.destroy();
        } else {
            tracing::warn!(error = %message, "guest error");
            self.events.emit(&EngineEvent::Error { message });
        }
        err
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// `__sendToHost`: queued operations go first, then this batch
    pub(crate) fn receive_batch(&self, value: &RuntimeValue) {
        self.flush_operations();
        let guest = match GuestBatch::from_runtime(value) {
            Ok(guest) => guest,
            Err(err) => {
                self.fail(err.into());
                return;
            }
        };
        let batch_id = {
            let mut scheduler = self.scheduler.borrow_mut();
            match guest.batch_id {
                Some(id) => {
                    scheduler.observe_batch_id(id);
                    id
                }
                None => scheduler.allocate_batch_id(),
            }
        };
        let operations = if self.config.borrow().merge_batches {
            OperationMerger::merge(guest.operations)
        } else {
            guest.operations
        };
        self.deliver(batch_id, operations);
    }

    /// `__enqueueOperation`
    pub(crate) fn enqueue_operation(&self, value: &RuntimeValue) {
        let op = match rill_core::protocol::parse_operation(value) {
            Ok(op) => op,
            Err(err) => {
                self.fail(err.into());
                return;
            }
        };
        let now = self.now_ms();
        let full = self.scheduler.borrow_mut().enqueue(op, now);
        if let Some(batch) = full {
            self.deliver(batch.batch_id, batch.operations);
        }
    }

    /// Flush queued operations into the receiver
    fn flush_operations(&self) {
        if self.destroyed.get() {
            return;
        }
        let now = self.now_ms();
        let batch = self.scheduler.borrow_mut().flush(now);
        if let Some(batch) = batch {
            self.deliver(batch.batch_id, batch.operations);
        }
    }

    /// Flush only if the throttle window has passed
    fn poll_operations(&self) {
        if self.destroyed.get() {
            return;
        }
        let now = self.now_ms();
        let batch = self.scheduler.borrow_mut().poll(now);
        if let Some(batch) = batch {
            self.deliver(batch.batch_id, batch.operations);
        }
    }

    fn deliver(&self, batch_id: u64, operations: Vec<Operation<RuntimeValue>>) {
        if let Err(err) = self.apply(batch_id, operations) {
            self.fail(err);
        }
    }

    fn apply(&self, batch_id: u64, operations: Vec<Operation<RuntimeValue>>) -> Result<(), EngineError> {
        let mut batch = self.bridge.make_batch(batch_id, operations)?;
        if self.config.borrow().serialize_batches {
            let wire = Bridge::batch_to_wire(&batch).map_err(BridgeError::from)?;
            batch = Bridge::batch_from_wire(&wire).map_err(BridgeError::from)?;
        }
        let report = self.receiver.borrow_mut().apply_batch(&batch);
        tracing::debug!(
            batch_id,
            applied = report.applied,
            ignored = report.ignored,
            "batch applied"
        );
        self.events.emit(&EngineEvent::Operation {
            batch: Rc::new(batch),
            report,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Messages and timers
    // ------------------------------------------------------------------------

    pub(crate) fn guest_message(&self, name: String, payload: RuntimeValue) {
        self.events.emit(&EngineEvent::Message { name, payload });
    }

    pub(crate) fn schedule_timer(
        &self,
        callback: FunctionValue,
        args: Vec<RuntimeValue>,
        delay_ms: u64,
        interval_ms: Option<u64>,
    ) -> TimerId {
        let now = self.now_ms();
        self.timers
            .borrow_mut()
            .schedule(callback, args, delay_ms, interval_ms, now)
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) {
        self.timers.borrow_mut().cancel(id);
    }

    fn run_timers(&self) -> usize {
        let now = self.now_ms();
        let due = self.timers.borrow_mut().take_due(now);
        let mut fired = 0;
        for timer in due {
            if self.destroyed.get() {
                break;
            }
            fired += 1;
            if let Err(err) = timer.callback.call(&timer.args) {
                tracing::debug!(timer = timer.id, "timer callback failed");
                self.fail(err.into());
            }
        }
        fired
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.timers.borrow_mut().clear();
        self.scheduler.borrow_mut().clear();
        self.receiver.borrow_mut().clear();
        self.registry.clear();
        self.context.dispose();
        self.runtime.dispose();
        self.events.emit(&EngineEvent::Destroy);
        self.events.clear();
        tracing::debug!(context = self.context.id(), "engine destroyed");
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Runs one guest bundle in a sandbox and replicates its tree
pub struct Engine {
    shared: Rc<EngineShared>,
}

impl Engine {
    /// Create an engine on the system clock
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, system_clock())
    }

    /// Create an engine on an explicit clock
    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Result<Self, EngineError> {
        config.validate()?;
        let provider = rill_sandbox::provider(config.backend);
        let runtime = provider.create_runtime(&config.runtime_options(clock.clone()))?;
        let context = runtime.create_context()?;
        context.set_budget(config.timeout_ms)?;

        let registry = Rc::new(CallbackRegistry::with_dedup(config.dedup_callbacks));
        let bridge = Bridge::with_max_depth(registry.clone(), config.max_codec_depth);
        let now = clock.now_ms();
        let shared = Rc::new(EngineShared {
            scheduler: RefCell::new(ThrottledScheduler::new(config.scheduler(), now)),
            receiver: RefCell::new(Receiver::with_registry(registry.clone())),
            config: RefCell::new(config),
            clock,
            runtime,
            context,
            registry,
            bridge,
            timers: RefCell::new(TimerQueue::new()),
            events: EventBus::new(),
            loaded: Cell::new(false),
            destroyed: Cell::new(false),
            error_count: Cell::new(0),
            last_error_at: Cell::new(None),
        });

        if let Err(err) = hooks::install(&shared) {
            tracing::error!(error = %err, "engine bootstrap failed");
            shared.destroy();
            return Err(err.into());
        }
        tracing::debug!(
            backend = %shared.config.borrow().backend,
            context = shared.context.id(),
            "engine ready"
        );
        Ok(Self { shared })
    }

    /// Evaluate a bundle with `__initialProps` set.
    ///
    /// Guest errors reject the load and are reported; fatal ones also
    /// destroy the engine.
    pub fn load_bundle(&self, source: &str, initial_props: RuntimeValue) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.live()?;
        if shared.loaded.get() {
            return Err(EngineError::AlreadyLoaded);
        }
        let result = shared
            .context
            .set_global(hooks::INITIAL_PROPS, initial_props)
            .and_then(|()| shared.context.eval(source));
        shared.flush_operations();
        match result {
            Ok(_) => {
                shared.loaded.set(true);
                tracing::debug!(bytes = source.len(), "bundle loaded");
                Ok(())
            }
            Err(err) => Err(shared.fail(err.into())),
        }
    }

    /// Deliver an event to the guest's `__handleHostEvent(name, payload)`.
    ///
    /// Fire and forget: a throwing handler is reported through the `error`
    /// event, not to the caller.
    pub fn send_event(&self, name: &str, payload: RuntimeValue) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.live()?;
        let handler = match shared.context.get_global(hooks::HANDLE_HOST_EVENT) {
            Ok(handler) => handler,
            Err(err) => return Err(shared.fail(err.into())),
        };
        let Some(handler) = handler.as_function().cloned() else {
            tracing::debug!(event = name, "guest has no host event handler");
            return Ok(());
        };
        let result = handler.call(&[RuntimeValue::from(name), payload]);
        shared.flush_operations();
        if let Err(err) = result {
            shared.fail(err.into());
        }
        Ok(())
    }

    /// Invoke a callback handle found in the replicated props.
    ///
    /// A synchronous throw in the guest yields `undefined`; unknown handles
    /// fail with `HandleNotFound`.
    pub fn invoke_callback(&self, id: &str, args: &[RuntimeValue]) -> Result<RuntimeValue, EngineError> {
        let shared = &self.shared;
        shared.live()?;
        let result = shared.registry.invoke(&CallbackId::new(id), args);
        shared.flush_operations();
        result.map_err(|err| shared.fail(err.into()))
    }

    /// Fire due timers, then flush queued operations.
    ///
    /// Returns the number of timer callbacks that ran.
    pub fn tick(&self) -> Result<usize, EngineError> {
        self.shared.live()?;
        let fired = self.shared.run_timers();
        self.shared.flush_operations();
        Ok(fired)
    }

    /// Fire due timers; queued operations flush only once the throttle
    /// window has passed
    pub fn run_timers(&self) -> Result<usize, EngineError> {
        self.shared.live()?;
        let fired = self.shared.run_timers();
        self.shared.poll_operations();
        Ok(fired)
    }

    /// Clock time at which the earliest timer is due
    pub fn next_timer_due(&self) -> Option<u64> {
        self.shared.timers.borrow().next_due()
    }

    /// Change settings on the live engine
    pub fn update_config(&self, patch: &EngineConfigPatch) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.live()?;
        let next = shared.config.borrow().patched(patch)?;
        shared.context.set_budget(next.timeout_ms)?;
        shared.scheduler.borrow_mut().set_config(next.scheduler());
        *shared.config.borrow_mut() = next;
        Ok(())
    }

    /// Current settings
    pub fn config(&self) -> EngineConfig {
        self.shared.config.borrow().clone()
    }

    /// Liveness snapshot
    pub fn health(&self) -> EngineHealth {
        let shared = &self.shared;
        EngineHealth {
            loaded: shared.loaded.get(),
            destroyed: shared.destroyed.get(),
            error_count: shared.error_count.get(),
            last_error_at: shared.last_error_at.get(),
        }
    }

    /// Live resource counts
    pub fn resource_stats(&self) -> ResourceStats {
        let shared = &self.shared;
        ResourceStats {
            timers: shared.timers.borrow().len(),
            nodes: shared.receiver.borrow().len(),
            callbacks: shared.registry.count(),
        }
    }

    /// Display-ready replicated tree
    pub fn tree(&self) -> Vec<TreeNode> {
        self.shared.receiver.borrow().tree()
    }

    /// Run `f` against the receiver
    pub fn with_receiver<R>(&self, f: impl FnOnce(&Receiver) -> R) -> R {
        f(&self.shared.receiver.borrow())
    }

    /// The sandbox context the guest runs in
    pub fn context(&self) -> Rc<dyn SandboxContext> {
        self.shared.context()
    }

    /// Subscribe to an event
    pub fn on(&self, kind: EventKind, listener: impl Fn(&EngineEvent) + 'static) -> ListenerId {
        self.shared.events.on(kind, listener)
    }

    /// Unsubscribe
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    /// Release the sandbox, timers, handles and nodes; idempotent
    pub fn destroy(&self) {
        self.shared.destroy();
    }

    /// Has the engine been destroyed?
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}
