//! Bidirectional value bridge
//!
//! The bridge pairs the codec with a [`CallbackRegistry`]. Outgoing
//! functions are registered and travel as handles. Incoming handles become
//! [`RemoteFunction`] proxies whose calls are sent back over a
//! [`Transport`] as [`BridgeMessage::Invoke`] requests.
//!
//! Messages are tagged JSON (`{"type": "invoke", ...}`) so any transport
//! that can move a string can carry them.

use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::codec::{self, Encoder, FunctionRegistrar, FunctionResolver, DEFAULT_MAX_DEPTH};
use crate::error::{BridgeError, CallError, CodecError, WireError};
use crate::protocol::{Operation, OperationBatch};
use crate::registry::{CallbackId, CallbackRegistry};
use crate::serialized::SerializedValue;
use crate::value::{Callable, ErrorValue, FunctionValue, RuntimeValue};

/// Direction of travel across the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Host calling into or notifying the guest
    HostToGuest,
    /// Guest reporting to the host
    GuestToHost,
}

/// Result of a remote invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvokeOutcome {
    /// Returned a value
    Ok(SerializedValue),
    /// Threw synchronously
    Thrown(ErrorValue),
    /// Promise rejected
    Rejected(ErrorValue),
    /// Handle does not exist on the serving side
    NotFound(CallbackId),
}

/// Message exchanged between the two sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    /// Operation batch (guest to host)
    Batch {
        /// The batch
        batch: OperationBatch,
    },
    /// Named event with a payload
    Event {
        /// Which way the event travels
        direction: Direction,
        /// Event name
        name: String,
        /// Event payload
        payload: SerializedValue,
    },
    /// Call a function by handle
    Invoke {
        /// Correlation id
        #[serde(rename = "callId")]
        call_id: u64,
        /// Handle to call
        handle: CallbackId,
        /// Encoded arguments
        args: Vec<SerializedValue>,
        /// Wait for a promise result to settle
        #[serde(default)]
        wait: bool,
    },
    /// Reply to an `Invoke`
    InvokeResult {
        /// Correlation id of the request
        #[serde(rename = "callId")]
        call_id: u64,
        /// Outcome
        outcome: InvokeOutcome,
    },
    /// Drop references to handles
    Release {
        /// Handles to release, one reference each
        handles: Vec<CallbackId>,
    },
}

impl BridgeMessage {
    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse JSON text
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Carries bridge messages to the peer
pub trait Transport {
    /// Send a request and wait for its reply
    fn request(&self, message: BridgeMessage) -> Result<BridgeMessage, BridgeError>;

    /// Send a message that has no reply
    fn post(&self, message: BridgeMessage);
}

// ============================================================================
// Registrar / resolver adapters
// ============================================================================

/// Registers functions and remembers which handles it minted
struct TrackingRegistrar<'a> {
    registry: &'a CallbackRegistry,
    minted: Vec<CallbackId>,
}

impl FunctionRegistrar for TrackingRegistrar<'_> {
    fn register_function(&mut self, func: &FunctionValue) -> Result<CallbackId, CodecError> {
        let id = self.registry.register(func.clone());
        self.minted.push(id.clone());
        Ok(id)
    }
}

struct RemoteResolver<'a> {
    bridge: &'a Bridge,
}

impl FunctionResolver for RemoteResolver<'_> {
    fn resolve_function(&self, id: &CallbackId) -> Option<RuntimeValue> {
        Some(RuntimeValue::Function(Rc::new(RemoteFunction {
            handle: id.clone(),
            bridge: self.bridge.me.clone(),
        })))
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// One side of the boundary
pub struct Bridge {
    registry: Rc<CallbackRegistry>,
    max_depth: usize,
    peer: RefCell<Option<Rc<dyn Transport>>>,
    next_call_id: Cell<u64>,
    me: Weak<Bridge>,
}

impl Bridge {
    /// Create a bridge over `registry`
    pub fn new(registry: Rc<CallbackRegistry>) -> Rc<Self> {
        Self::with_max_depth(registry, DEFAULT_MAX_DEPTH)
    }

    /// Create a bridge with an explicit codec depth limit
    pub fn with_max_depth(registry: Rc<CallbackRegistry>, max_depth: usize) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            registry,
            max_depth,
            peer: RefCell::new(None),
            next_call_id: Cell::new(1),
            me: me.clone(),
        })
    }

    /// Registry that owns this side's functions
    pub fn registry(&self) -> &Rc<CallbackRegistry> {
        &self.registry
    }

    /// Route calls on remote handles through `transport`
    pub fn connect(&self, transport: Rc<dyn Transport>) {
        *self.peer.borrow_mut() = Some(transport);
    }

    /// Forget the peer; remote calls fail with `ContextDisposed` afterwards
    pub fn disconnect(&self) {
        self.peer.borrow_mut().take();
    }

    /// Encode a value, registering every function it contains
    pub fn encode(&self, value: &RuntimeValue) -> Result<SerializedValue, CodecError> {
        self.encode_tracked(value).map(|(encoded, _)| encoded)
    }

    /// Encode a value and report the handles minted for it.
    ///
    /// On failure every handle minted so far is released again.
    pub fn encode_tracked(&self, value: &RuntimeValue) -> Result<(SerializedValue, Vec<CallbackId>), CodecError> {
        let mut registrar = TrackingRegistrar {
            registry: &self.registry,
            minted: Vec::new(),
        };
        let result = Encoder::with_max_depth(&mut registrar, self.max_depth).encode(value);
        match result {
            Ok(encoded) => Ok((encoded, registrar.minted)),
            Err(err) => {
                self.release_all(&registrar.minted);
                Err(err)
            }
        }
    }

    /// Decode a value; handles become proxies that call across the transport
    pub fn decode(&self, value: &SerializedValue) -> RuntimeValue {
        codec::decode(value, &RemoteResolver { bridge: self })
    }

    /// Decode a value; handles resolve against this side's own registry
    pub fn decode_local(&self, value: &SerializedValue) -> RuntimeValue {
        codec::decode(value, self.registry.as_ref())
    }

    /// Encode the props of guest-authored operations.
    ///
    /// Either every operation is encoded or none is, and in the second case
    /// no handles are left behind.
    pub fn encode_operations(&self, ops: Vec<Operation<RuntimeValue>>) -> Result<Vec<Operation>, CodecError> {
        let mut minted = Vec::new();
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let encoded = op.try_map_props(|value| {
                let (encoded, ids) = self.encode_tracked(&value)?;
                minted.extend(ids);
                Ok::<_, CodecError>(encoded)
            });
            match encoded {
                Ok(op) => out.push(op),
                Err(err) => {
                    self.release_all(&minted);
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    /// Encode operations into a batch
    pub fn make_batch(&self, batch_id: u64, ops: Vec<Operation<RuntimeValue>>) -> Result<OperationBatch, BridgeError> {
        Ok(OperationBatch::new(batch_id, self.encode_operations(ops)?))
    }

    /// Serialize a batch for the wire
    pub fn batch_to_wire(batch: &OperationBatch) -> Result<String, WireError> {
        batch.to_wire_string()
    }

    /// Parse a batch from the wire
    pub fn batch_from_wire(text: &str) -> Result<OperationBatch, WireError> {
        OperationBatch::from_wire_str(text)
    }

    /// Call a handle owned by the peer
    pub fn call_remote(&self, handle: &CallbackId, args: &[RuntimeValue], wait: bool) -> Result<RuntimeValue, CallError> {
        let transport = self.peer.borrow().clone().ok_or(CallError::ContextDisposed)?;

        let mut encoded = Vec::with_capacity(args.len());
        let mut minted = Vec::new();
        for arg in args {
            match self.encode_tracked(arg) {
                Ok((value, ids)) => {
                    encoded.push(value);
                    minted.extend(ids);
                }
                Err(err) => {
                    self.release_all(&minted);
                    return Err(err.into());
                }
            }
        }

        let call_id = self.next_call_id.get();
        self.next_call_id.set(call_id + 1);
        let reply = transport.request(BridgeMessage::Invoke {
            call_id,
            handle: handle.clone(),
            args: encoded,
            wait,
        });
        // Arguments only live for the duration of the call.
        self.release_all(&minted);

        match reply.map_err(|e| CallError::Marshal(e.to_string()))? {
            BridgeMessage::InvokeResult { call_id: got, outcome } if got == call_id => match outcome {
                InvokeOutcome::Ok(value) => Ok(self.decode(&value)),
                InvokeOutcome::Thrown(err) => Err(CallError::Thrown(err)),
                InvokeOutcome::Rejected(err) => Err(CallError::Rejected(err)),
                InvokeOutcome::NotFound(id) => Err(CallError::HandleNotFound(id)),
            },
            other => Err(CallError::Marshal(format!("unexpected reply: {:?}", other))),
        }
    }

    /// Serve a request from the peer; returns the reply, if the message has one
    pub fn serve(&self, message: BridgeMessage) -> Option<BridgeMessage> {
        match message {
            BridgeMessage::Invoke {
                call_id,
                handle,
                args,
                wait,
            } => {
                let args: Vec<RuntimeValue> = args.iter().map(|a| self.decode(a)).collect();
                let result = if wait {
                    self.registry.invoke_async(&handle, &args)
                } else {
                    self.registry.invoke(&handle, &args)
                };
                let outcome = match result {
                    Ok(value) => match self.encode(&value) {
                        Ok(encoded) => InvokeOutcome::Ok(encoded),
                        Err(err) => InvokeOutcome::Thrown(ErrorValue::new("TypeError", err.to_string())),
                    },
                    Err(CallError::Thrown(err)) => InvokeOutcome::Thrown(err),
                    Err(CallError::Rejected(err)) => InvokeOutcome::Rejected(err),
                    Err(CallError::HandleNotFound(id)) => InvokeOutcome::NotFound(id),
                    Err(other) => InvokeOutcome::Thrown(other.to_error_value()),
                };
                Some(BridgeMessage::InvokeResult { call_id, outcome })
            }
            BridgeMessage::Release { handles } => {
                self.release_all(&handles);
                None
            }
            other => {
                tracing::debug!(message = ?other, "bridge message left to the owner");
                None
            }
        }
    }

    fn release_all(&self, handles: &[CallbackId]) {
        for handle in handles {
            if let Err(err) = self.registry.release(handle) {
                tracing::debug!(handle = %handle, error = %err, "release skipped");
            }
        }
    }
}

impl FunctionResolver for CallbackRegistry {
    fn resolve_function(&self, id: &CallbackId) -> Option<RuntimeValue> {
        self.get(id).map(RuntimeValue::Function)
    }
}

/// Proxy for a function owned by the peer
pub struct RemoteFunction {
    handle: CallbackId,
    bridge: Weak<Bridge>,
}

impl RemoteFunction {
    /// Handle this proxy calls
    pub fn handle(&self) -> &CallbackId {
        &self.handle
    }
}

impl Callable for RemoteFunction {
    fn call(&self, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        let bridge = self.bridge.upgrade().ok_or(CallError::ContextDisposed)?;
        bridge.call_remote(&self.handle, args, false)
    }

    fn call_async(&self, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        let bridge = self.bridge.upgrade().ok_or(CallError::ContextDisposed)?;
        bridge.call_remote(&self.handle, args, true)
    }

    fn name(&self) -> &str {
        self.handle.as_str()
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// Transport that serves requests with another bridge in the same thread.
///
/// With `through_wire` set, every message is serialized to JSON and parsed
/// back on the way, exercising the same path a process boundary would.
pub struct LoopbackTransport {
    peer: Weak<Bridge>,
    through_wire: bool,
}

impl LoopbackTransport {
    /// Serve requests with `peer`
    pub fn new(peer: &Rc<Bridge>, through_wire: bool) -> Self {
        Self {
            peer: Rc::downgrade(peer),
            through_wire,
        }
    }

    fn carry(&self, message: BridgeMessage) -> Result<BridgeMessage, BridgeError> {
        if self.through_wire {
            Ok(BridgeMessage::from_json(&message.to_json()?)?)
        } else {
            Ok(message)
        }
    }
}

impl Transport for LoopbackTransport {
    fn request(&self, message: BridgeMessage) -> Result<BridgeMessage, BridgeError> {
        let peer = self.peer.upgrade().ok_or(CallError::ContextDisposed)?;
        let message = self.carry(message)?;
        let reply = peer
            .serve(message)
            .ok_or_else(|| CallError::Marshal("request has no reply".into()))?;
        self.carry(reply)
    }

    fn post(&self, message: BridgeMessage) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        match self.carry(message) {
            Ok(message) => {
                peer.serve(message);
            }
            Err(err) => tracing::warn!(error = %err, "dropping undeliverable bridge message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(through_wire: bool) -> (Rc<Bridge>, Rc<Bridge>) {
        let host = Bridge::new(Rc::new(CallbackRegistry::new()));
        let guest = Bridge::new(Rc::new(CallbackRegistry::new()));
        host.connect(Rc::new(LoopbackTransport::new(&guest, through_wire)));
        guest.connect(Rc::new(LoopbackTransport::new(&host, through_wire)));
        (host, guest)
    }

    #[test]
    fn test_remote_call_round_trip() {
        let (host, guest) = pair(true);
        let add = RuntimeValue::function("add", |args| {
            let sum: f64 = args.iter().filter_map(|a| a.as_f64()).sum();
            Ok(RuntimeValue::Number(sum))
        });
        let encoded = guest.encode(&RuntimeValue::object([("add", add)])).unwrap();
        let decoded = host.decode(&encoded);
        let proxy = decoded.get("add").unwrap();
        let result = proxy
            .as_function()
            .unwrap()
            .call(&[RuntimeValue::from(2), RuntimeValue::from(3)])
            .unwrap();
        assert_eq!(result.as_f64(), Some(5.0));
    }

    #[test]
    fn test_function_arguments_are_released_after_call() {
        let (host, guest) = pair(false);
        let seen = Rc::new(Cell::new(0.0));
        let sink = seen.clone();
        let apply = RuntimeValue::function("apply", move |args| {
            let callback = args.first().and_then(|a| a.as_function().cloned());
            if let Some(callback) = callback {
                let value = callback.call(&[RuntimeValue::from(41)])?;
                sink.set(value.as_f64().unwrap_or_default());
            }
            Ok(RuntimeValue::Undefined)
        });
        let handle = guest.encode(&apply).unwrap();
        let proxy = host.decode(&handle);
        let plus_one = RuntimeValue::function("plusOne", |args| {
            Ok(RuntimeValue::Number(args[0].as_f64().unwrap_or_default() + 1.0))
        });
        proxy.as_function().unwrap().call(&[plus_one]).unwrap();
        assert_eq!(seen.get(), 42.0);
        assert_eq!(host.registry().count(), 0);
    }

    #[test]
    fn test_thrown_and_missing_handles() {
        let (host, guest) = pair(true);
        let boom = RuntimeValue::function("boom", |_| Err(CallError::Thrown(ErrorValue::new("RangeError", "no"))));
        let SerializedValue::FunctionRef(id) = guest.encode(&boom).unwrap() else {
            panic!("expected a handle");
        };
        // Synchronous throws are swallowed by the serving registry.
        assert!(host.call_remote(&id, &[], false).unwrap().is_undefined());
        assert!(matches!(host.call_remote(&id, &[], true), Err(CallError::Thrown(e)) if e.name == "RangeError"));

        guest.registry().release(&id).unwrap();
        assert!(matches!(
            host.call_remote(&id, &[], false),
            Err(CallError::HandleNotFound(missing)) if missing == id
        ));
    }

    #[test]
    fn test_disconnected_bridge_reports_disposed() {
        let (host, _guest) = pair(false);
        host.disconnect();
        assert!(matches!(
            host.call_remote(&CallbackId::new("cb_1"), &[], false),
            Err(CallError::ContextDisposed)
        ));
    }

    #[test]
    fn test_encode_operations_is_all_or_nothing() {
        let bridge = Bridge::with_max_depth(Rc::new(CallbackRegistry::new()), 4);
        let f = RuntimeValue::function("f", |_| Ok(RuntimeValue::Undefined));
        let mut deep = RuntimeValue::Null;
        for _ in 0..10 {
            deep = RuntimeValue::array([deep]);
        }
        let ops = vec![
            Operation::Create {
                id: 1,
                node_type: "Button".into(),
                props: [("onPress".to_string(), f)].into_iter().collect(),
            },
            Operation::Update {
                id: 1,
                props: [("deep".to_string(), deep)].into_iter().collect(),
                removed_prop_keys: vec![],
            },
        ];
        assert!(bridge.encode_operations(ops).is_err());
        assert_eq!(bridge.registry().count(), 0);
    }

    #[test]
    fn test_message_wire_shape() {
        let message = BridgeMessage::Invoke {
            call_id: 7,
            handle: CallbackId::new("cb_3"),
            args: vec![SerializedValue::undefined()],
            wait: false,
        };
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "invoke",
                "callId": 7,
                "handle": "cb_3",
                "args": [{"__type": "undefined"}],
                "wait": false
            })
        );
        assert_eq!(BridgeMessage::from_json(&message.to_json().unwrap()).unwrap(), message);
    }
}
