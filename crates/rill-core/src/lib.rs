//! Rill Core
//!
//! The host/guest boundary of the Rill sandbox bridge:
//! - Value model and the codec that moves values across the boundary
//! - Reference-counted callback registry for function handles
//! - Bridge pairing the codec with the registry and a message transport
//! - Tree replication protocol, operation merger and throttled scheduler
//! - Receiver that applies operation batches to a host-owned node graph

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod clock;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod serialized;
pub mod value;

pub use bridge::{Bridge, BridgeMessage, Direction, InvokeOutcome, LoopbackTransport, RemoteFunction, Transport};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use codec::{decode, encode, DataOnly, Encoder, FunctionRegistrar, FunctionResolver, ENCODE_RULES};
pub use error::{BridgeError, CallError, CodecError, ProtocolError, RegistryError, WireError};
pub use protocol::{
    GuestBatch, NodeId, Operation, OperationBatch, OperationMerger, Props, SchedulerConfig, ThrottledScheduler,
    PROTOCOL_VERSION, ROOT_ID,
};
pub use receiver::{ApplyReport, Receiver, ReceiverNode, SkipReason, TreeNode};
pub use registry::{CallbackHandle, CallbackId, CallbackRegistry, OwnerSide};
pub use serialized::{Primitive, SerializedValue};
pub use value::{
    Callable, ErrorValue, FunctionIdentity, FunctionValue, NativeFunction, ObjectMap, RuntimeValue, ToJson,
    TypedArrayKind,
};
