//! Host half of a sandbox context
//!
//! [`BridgedContext`] implements [`SandboxContext`] on top of any
//! [`GuestPort`]. Values are encoded here, on the host thread, and only wire
//! JSON goes through the port.
//!
//! Function handles: host functions handed to the guest live in a
//! [`CallbackRegistry`] for the lifetime of the context. Guest functions
//! handed to the host become [`GuestFunction`] proxies, one live proxy per
//! guest id. When the last clone of a proxy drops, the guest id is released
//! on the next entry into the context. A proxy passed back into its own
//! context travels as its guest id, so the guest sees its original function.

use parking_lot::Mutex;
use rill_core::codec::{self, Encoder, FunctionRegistrar, FunctionResolver};
use rill_core::{
    CallError, CallbackId, CallbackRegistry, Callable, CodecError, FunctionIdentity, FunctionValue, RuntimeValue,
    SerializedValue,
};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::budget::Budget;
use crate::capabilities::SandboxCapabilities;
use crate::error::SandboxError;
use crate::interrupt::{HandlerSlot, InterruptHandler};
use crate::js::{Envelope, GuestRequest};
use crate::sandbox::{ContextState, SandboxContext};
use rill_core::clock::SharedClock;

/// Prefix of guest function ids; everything else names a host function
const GUEST_PREFIX: &str = "g";

/// Moves requests into one guest interpreter and brings replies back
pub(crate) trait GuestPort {
    /// Run a request to completion, waiting for promises when it asks to.
    ///
    /// Host calls made by the guest meanwhile are served through `host`.
    fn request(&self, request: &GuestRequest, host: &HostSide) -> Result<Envelope, SandboxError>;

    /// Stop the interpreter; later requests fail
    fn shutdown(&self);
}

/// Budget and interrupt settings of one context, shared with its interpreter
#[derive(Clone)]
pub(crate) struct ContextControls {
    pub(crate) budget: Arc<Mutex<Budget>>,
    pub(crate) handler: HandlerSlot,
}

impl ContextControls {
    pub(crate) fn new(clock: SharedClock) -> Self {
        Self {
            budget: Arc::new(Mutex::new(Budget::new(clock))),
            handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Handler to arm for the next turn
    pub(crate) fn handler(&self) -> Option<InterruptHandler> {
        self.handler.lock().clone()
    }

    /// Restart the budget for a new turn
    pub(crate) fn restart_budget(&self) {
        self.budget.lock().restart();
    }
}

// ============================================================================
// HostSide
// ============================================================================

/// Marshalling state of one context on the host thread
pub(crate) struct HostSide {
    context_id: u64,
    max_depth: usize,
    functions: CallbackRegistry,
    proxies: RefCell<FxHashMap<String, Weak<GuestFunction>>>,
    pending_release: RefCell<Vec<String>>,
    context: RefCell<Weak<BridgedContext>>,
}

impl HostSide {
    pub(crate) fn new(context_id: u64, max_depth: usize) -> Self {
        Self {
            context_id,
            max_depth,
            functions: CallbackRegistry::new(),
            proxies: RefCell::new(FxHashMap::default()),
            pending_release: RefCell::new(Vec::new()),
            context: RefCell::new(Weak::new()),
        }
    }

    fn attach(&self, context: Weak<BridgedContext>) {
        *self.context.borrow_mut() = context;
    }

    /// Encode a host value for the guest
    pub(crate) fn encode(&self, value: &RuntimeValue) -> Result<SerializedValue, CodecError> {
        let mut registrar = HostRegistrar { host: self };
        Encoder::with_max_depth(&mut registrar, self.max_depth).encode(value)
    }

    /// Decode a wire value produced by the guest
    pub(crate) fn decode_wire(&self, wire: &serde_json::Value) -> Result<RuntimeValue, SandboxError> {
        let value = SerializedValue::from_wire(wire)?;
        Ok(codec::decode(&value, &HostResolver { host: self }))
    }

    /// Serve a guest call to a host function; returns the reply envelope
    pub(crate) fn host_call(&self, id: &str, args_json: &str) -> String {
        let reply = match self.invoke_host(id, args_json) {
            Ok(wire) => serde_json::json!({ "ok": wire }),
            Err(err) => serde_json::json!({ "err": err.to_error_value() }),
        };
        reply.to_string()
    }

    /// Reply for a host call that arrives after the context went away
    pub(crate) fn disposed_reply() -> String {
        serde_json::json!({ "err": CallError::ContextDisposed.to_error_value() }).to_string()
    }

    fn invoke_host(&self, id: &str, args_json: &str) -> Result<serde_json::Value, CallError> {
        let wire: Vec<serde_json::Value> =
            serde_json::from_str(args_json).map_err(|e| CallError::Marshal(e.to_string()))?;
        let args = wire
            .iter()
            .map(|arg| self.decode_wire(arg))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CallError::Marshal(e.to_string()))?;
        let result = self.functions.invoke(&CallbackId::new(id), &args)?;
        Ok(self.encode(&result)?.to_wire())
    }

    fn proxy(&self, id: &str) -> FunctionValue {
        self.pending_release.borrow_mut().retain(|pending| pending != id);
        let mut proxies = self.proxies.borrow_mut();
        if let Some(existing) = proxies.get(id).and_then(Weak::upgrade) {
            return existing;
        }
        let proxy = Rc::new(GuestFunction {
            id: id.to_string(),
            identity: FunctionIdentity {
                context: self.context_id,
                id: id.to_string(),
            },
            context: self.context.borrow().clone(),
        });
        proxies.insert(id.to_string(), Rc::downgrade(&proxy));
        proxy
    }

    fn queue_release(&self, id: &str) {
        if let Ok(mut proxies) = self.proxies.try_borrow_mut() {
            if proxies.get(id).is_some_and(|p| p.strong_count() == 0) {
                proxies.remove(id);
            }
        }
        match self.pending_release.try_borrow_mut() {
            Ok(mut pending) => pending.push(id.to_string()),
            Err(_) => tracing::debug!(id, "guest function release dropped"),
        }
    }

    fn take_releases(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_release.borrow_mut())
    }

    fn requeue_releases(&self, ids: Vec<String>) {
        self.pending_release.borrow_mut().extend(ids);
    }

    fn clear(&self) {
        self.functions.clear();
        self.proxies.borrow_mut().clear();
        self.pending_release.borrow_mut().clear();
    }
}

struct HostRegistrar<'a> {
    host: &'a HostSide,
}

impl FunctionRegistrar for HostRegistrar<'_> {
    fn register_function(&mut self, func: &FunctionValue) -> Result<CallbackId, CodecError> {
        if let Some(identity) = func.identity() {
            if identity.context == self.host.context_id {
                return Ok(CallbackId::new(identity.id));
            }
        }
        Ok(self.host.functions.register(func.clone()))
    }
}

struct HostResolver<'a> {
    host: &'a HostSide,
}

impl FunctionResolver for HostResolver<'_> {
    fn resolve_function(&self, id: &CallbackId) -> Option<RuntimeValue> {
        if id.as_str().starts_with(GUEST_PREFIX) {
            Some(RuntimeValue::Function(self.host.proxy(id.as_str())))
        } else {
            self.host.functions.get(id).map(RuntimeValue::Function)
        }
    }
}

// ============================================================================
// GuestFunction
// ============================================================================

/// Host-side proxy for a function that lives in a guest context
pub(crate) struct GuestFunction {
    id: String,
    identity: FunctionIdentity,
    context: Weak<BridgedContext>,
}

impl Callable for GuestFunction {
    fn call(&self, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        let context = self.context.upgrade().ok_or(CallError::ContextDisposed)?;
        context.call_guest(&self.id, args, false)
    }

    fn call_async(&self, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        let context = self.context.upgrade().ok_or(CallError::ContextDisposed)?;
        context.call_guest(&self.id, args, true)
    }

    fn identity(&self) -> Option<FunctionIdentity> {
        Some(self.identity.clone())
    }

    fn name(&self) -> &str {
        &self.id
    }
}

impl Drop for GuestFunction {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            if !context.is_disposed() {
                context.host.queue_release(&self.id);
            }
        }
    }
}

// ============================================================================
// BridgedContext
// ============================================================================

/// A [`SandboxContext`] over a [`GuestPort`]
pub(crate) struct BridgedContext {
    id: u64,
    backend: &'static str,
    capabilities: SandboxCapabilities,
    controls: ContextControls,
    state: Cell<ContextState>,
    host: Rc<HostSide>,
    port: Box<dyn GuestPort>,
}

impl BridgedContext {
    pub(crate) fn new(
        backend: &'static str,
        capabilities: SandboxCapabilities,
        controls: ContextControls,
        host: Rc<HostSide>,
        port: Box<dyn GuestPort>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| {
            host.attach(me.clone());
            Self {
                id: host.context_id,
                backend,
                capabilities,
                controls,
                state: Cell::new(ContextState::Created),
                host,
                port,
            }
        })
    }

    fn enter(&self) -> Result<(), SandboxError> {
        match self.state.get() {
            ContextState::Disposed => return Err(SandboxError::ContextDisposed),
            ContextState::Created => self.state.set(ContextState::Active),
            ContextState::Active => {}
        }
        let ids = self.host.take_releases();
        if !ids.is_empty() {
            let request = GuestRequest::Release { ids: ids.clone() };
            if let Err(err) = self.port.request(&request, &self.host) {
                self.host.requeue_releases(ids);
                return Err(err);
            }
        }
        Ok(())
    }

    fn completion(&self, envelope: Envelope) -> Result<RuntimeValue, SandboxError> {
        match envelope {
            Envelope::Ok(wire) => self.host.decode_wire(&wire),
            Envelope::Err(err) | Envelope::Rejected(err) => Err(SandboxError::from_guest(err)),
            Envelope::Missing(id) => Err(SandboxError::Runtime {
                name: "HandleNotFound".into(),
                message: format!("Guest function {} not found", id),
                stack: None,
            }),
            Envelope::Pending(slot) => Err(SandboxError::Runtime {
                name: "Error".into(),
                message: format!("Promise {} did not settle", slot),
                stack: None,
            }),
        }
    }

    fn evaluate(&self, source: &str, wait: bool) -> Result<RuntimeValue, SandboxError> {
        self.enter()?;
        let request = GuestRequest::Eval {
            source: source.to_string(),
            wait,
        };
        let envelope = self.port.request(&request, &self.host)?;
        self.completion(envelope)
    }

    /// Call a guest function by id
    pub(crate) fn call_guest(&self, id: &str, args: &[RuntimeValue], wait: bool) -> Result<RuntimeValue, CallError> {
        self.enter()?;
        let args = args
            .iter()
            .map(|arg| self.host.encode(arg).map(|value| value.to_wire()))
            .collect::<Result<Vec<_>, _>>()?;
        let request = GuestRequest::Call {
            id: id.to_string(),
            args,
            wait,
        };
        match self.port.request(&request, &self.host)? {
            Envelope::Ok(wire) => Ok(self.host.decode_wire(&wire)?),
            Envelope::Err(err) => Err(CallError::Thrown(err)),
            Envelope::Rejected(err) => Err(CallError::Rejected(err)),
            Envelope::Missing(id) => Err(CallError::HandleNotFound(CallbackId::new(id))),
            Envelope::Pending(slot) => Err(CallError::Marshal(format!("promise {} did not settle", slot))),
        }
    }
}

impl SandboxContext for BridgedContext {
    fn id(&self) -> u64 {
        self.id
    }

    fn capabilities(&self) -> SandboxCapabilities {
        self.capabilities
    }

    fn state(&self) -> ContextState {
        self.state.get()
    }

    fn eval(&self, source: &str) -> Result<RuntimeValue, SandboxError> {
        self.evaluate(source, false)
    }

    fn eval_async(&self, source: &str) -> Result<RuntimeValue, SandboxError> {
        self.evaluate(source, true)
    }

    fn set_global(&self, name: &str, value: RuntimeValue) -> Result<(), SandboxError> {
        self.enter()?;
        let request = GuestRequest::SetGlobal {
            name: name.to_string(),
            value: self.host.encode(&value)?.to_wire(),
        };
        let envelope = self.port.request(&request, &self.host)?;
        self.completion(envelope).map(|_| ())
    }

    fn get_global(&self, name: &str) -> Result<RuntimeValue, SandboxError> {
        self.enter()?;
        let request = GuestRequest::GetGlobal { name: name.to_string() };
        let envelope = self.port.request(&request, &self.host)?;
        self.completion(envelope)
    }

    fn set_interrupt_handler(&self, handler: InterruptHandler) -> Result<(), SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::ContextDisposed);
        }
        if !self.capabilities.hard_interrupt {
            return Err(SandboxError::Unsupported {
                backend: self.backend,
                feature: "hard interrupts",
            });
        }
        *self.controls.handler.lock() = Some(handler);
        Ok(())
    }

    fn clear_interrupt_handler(&self) -> Result<(), SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::ContextDisposed);
        }
        self.controls.handler.lock().take();
        Ok(())
    }

    fn set_budget(&self, timeout_ms: Option<u64>) -> Result<(), SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::ContextDisposed);
        }
        self.controls.budget.lock().set_timeout(timeout_ms);
        Ok(())
    }

    fn dispose(&self) {
        if self.state.replace(ContextState::Disposed) == ContextState::Disposed {
            return;
        }
        self.controls.handler.lock().take();
        self.port.shutdown();
        self.host.clear();
        tracing::debug!(context = self.id, backend = self.backend, "context disposed");
    }
}
