//! Tree replication protocol
//!
//! The guest describes its component tree as a stream of [`Operation`]s,
//! grouped into ordered [`OperationBatch`]es. Props are generic so the same
//! types carry live values before encoding (`Operation<RuntimeValue>`) and
//! boundary-safe values afterwards (`Operation<SerializedValue>`).

pub mod merge;
pub mod scheduler;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::serialized::SerializedValue;
use crate::value::RuntimeValue;

pub use merge::OperationMerger;
pub use scheduler::{SchedulerConfig, ThrottledScheduler};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Node id, unique per sandbox for the lifetime of the node
pub type NodeId = u64;

/// Id of the host-owned root container
pub const ROOT_ID: NodeId = 0;

/// Ordered node properties
pub type Props<V = SerializedValue> = IndexMap<String, V>;

/// One tree mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
#[serde(bound(deserialize = "V: Deserialize<'de>"))]
pub enum Operation<V = SerializedValue> {
    /// Create a detached node
    Create {
        /// New node id
        id: NodeId,
        /// Component type
        #[serde(rename = "type")]
        node_type: String,
        /// Initial props
        #[serde(default)]
        props: Props<V>,
    },
    /// Merge props into a node and drop removed keys
    Update {
        /// Target node
        id: NodeId,
        /// Props to set
        #[serde(default)]
        props: Props<V>,
        /// Keys to remove
        #[serde(default, rename = "removedPropKeys")]
        removed_prop_keys: Vec<String>,
    },
    /// Destroy a node and its subtree
    Delete {
        /// Target node
        id: NodeId,
    },
    /// Attach a child at the end of a parent's children
    Append {
        /// Subject node
        id: NodeId,
        /// Parent (0 = root)
        #[serde(rename = "parentId")]
        parent_id: NodeId,
        /// Child to attach
        #[serde(rename = "childId")]
        child_id: NodeId,
    },
    /// Attach a child at an index
    Insert {
        /// Subject node
        id: NodeId,
        /// Parent (0 = root)
        #[serde(rename = "parentId")]
        parent_id: NodeId,
        /// Child to attach
        #[serde(rename = "childId")]
        child_id: NodeId,
        /// Position among the parent's children
        index: usize,
    },
    /// Detach a child without destroying it
    Remove {
        /// Parent (0 = root)
        #[serde(rename = "parentId")]
        parent_id: NodeId,
        /// Child to detach
        #[serde(rename = "childId")]
        child_id: NodeId,
    },
}

impl<V> Operation<V> {
    /// Upper-case operation tag
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "CREATE",
            Operation::Update { .. } => "UPDATE",
            Operation::Delete { .. } => "DELETE",
            Operation::Append { .. } => "APPEND",
            Operation::Insert { .. } => "INSERT",
            Operation::Remove { .. } => "REMOVE",
        }
    }

    /// Node the operation is about
    pub fn target(&self) -> NodeId {
        match self {
            Operation::Create { id, .. }
            | Operation::Update { id, .. }
            | Operation::Delete { id }
            | Operation::Append { id, .. }
            | Operation::Insert { id, .. } => *id,
            Operation::Remove { child_id, .. } => *child_id,
        }
    }

    /// Convert the props of CREATE and UPDATE, leaving other operations as is
    pub fn try_map_props<W, E, F>(self, mut f: F) -> Result<Operation<W>, E>
    where
        F: FnMut(V) -> Result<W, E>,
    {
        let mut convert = |props: Props<V>| -> Result<Props<W>, E> {
            props.into_iter().map(|(k, v)| Ok((k, f(v)?))).collect()
        };
        Ok(match self {
            Operation::Create { id, node_type, props } => Operation::Create {
                id,
                node_type,
                props: convert(props)?,
            },
            Operation::Update {
                id,
                props,
                removed_prop_keys,
            } => Operation::Update {
                id,
                props: convert(props)?,
                removed_prop_keys,
            },
            Operation::Delete { id } => Operation::Delete { id },
            Operation::Append { id, parent_id, child_id } => Operation::Append { id, parent_id, child_id },
            Operation::Insert {
                id,
                parent_id,
                child_id,
                index,
            } => Operation::Insert {
                id,
                parent_id,
                child_id,
                index,
            },
            Operation::Remove { parent_id, child_id } => Operation::Remove { parent_id, child_id },
        })
    }
}

/// Ordered group of operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "V: Deserialize<'de>"))]
pub struct OperationBatch<V = SerializedValue> {
    /// Protocol version
    pub version: u32,
    /// Strictly increasing per sandbox
    #[serde(rename = "batchId")]
    pub batch_id: u64,
    /// Operations, applied in order
    pub operations: Vec<Operation<V>>,
}

impl<V> OperationBatch<V> {
    /// Create a batch at the current protocol version
    pub fn new(batch_id: u64, operations: Vec<Operation<V>>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            batch_id,
            operations,
        }
    }
}

impl OperationBatch {
    /// Serialize to JSON text
    pub fn to_wire_string(&self) -> Result<String, crate::error::WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse JSON text
    pub fn from_wire_str(text: &str) -> Result<Self, crate::error::WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Reading guest-authored operations
// ============================================================================

/// A batch as the guest sent it, before encoding
#[derive(Debug, Clone)]
pub struct GuestBatch {
    /// Version claimed by the guest, if any
    pub version: Option<u32>,
    /// Batch id chosen by the guest, if any
    pub batch_id: Option<u64>,
    /// Operations with live props
    pub operations: Vec<Operation<RuntimeValue>>,
}

impl GuestBatch {
    /// Read `{version?, batchId?, operations}` or a bare operation array
    pub fn from_runtime(value: &RuntimeValue) -> Result<Self, ProtocolError> {
        let (version, batch_id, ops) = match value {
            RuntimeValue::Array(_) => (None, None, value.clone()),
            RuntimeValue::Object(_) => {
                let version = match value.get("version") {
                    Some(RuntimeValue::Number(n)) => Some(n as u32),
                    _ => None,
                };
                let batch_id = match value.get("batchId") {
                    Some(RuntimeValue::Number(n)) if n.is_finite() && n >= 0.0 => Some(n as u64),
                    _ => None,
                };
                let ops = value
                    .get("operations")
                    .ok_or_else(|| ProtocolError::InvalidBatch("missing `operations`".into()))?;
                (version, batch_id, ops)
            }
            other => {
                return Err(ProtocolError::InvalidBatch(format!(
                    "expected an object or array, got {}",
                    other.type_name()
                )))
            }
        };
        if let Some(got) = version {
            if got != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    got,
                });
            }
        }
        let items = ops
            .to_vec()
            .ok_or_else(|| ProtocolError::InvalidBatch("`operations` must be an array".into()))?;
        let operations = items.iter().map(parse_operation).collect::<Result<_, _>>()?;
        Ok(Self {
            version,
            batch_id,
            operations,
        })
    }
}

/// Read one guest operation object
pub fn parse_operation(value: &RuntimeValue) -> Result<Operation<RuntimeValue>, ProtocolError> {
    let op = value
        .get("op")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| ProtocolError::InvalidBatch("operation without `op` tag".into()))?;

    let id = |field: &'static str| -> Result<NodeId, ProtocolError> {
        match value.get(field) {
            Some(RuntimeValue::Number(n)) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 => Ok(n as NodeId),
            _ => Err(ProtocolError::InvalidField { op: op.clone(), field }),
        }
    };
    let props = || -> Result<Props<RuntimeValue>, ProtocolError> {
        match value.get("props") {
            None | Some(RuntimeValue::Undefined) | Some(RuntimeValue::Null) => Ok(Props::new()),
            Some(RuntimeValue::Object(map)) => Ok(map.borrow().clone()),
            Some(_) => Err(ProtocolError::InvalidField {
                op: op.clone(),
                field: "props",
            }),
        }
    };

    Ok(match op.as_str() {
        "CREATE" => Operation::Create {
            id: id("id")?,
            node_type: value
                .get("type")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| ProtocolError::InvalidField {
                    op: op.clone(),
                    field: "type",
                })?,
            props: props()?,
        },
        "UPDATE" => {
            let removed_prop_keys = match value.get("removedPropKeys") {
                None | Some(RuntimeValue::Undefined) | Some(RuntimeValue::Null) => Vec::new(),
                Some(keys) => keys
                    .to_vec()
                    .and_then(|keys| keys.iter().map(|k| k.as_str().map(str::to_string)).collect())
                    .ok_or_else(|| ProtocolError::InvalidField {
                        op: op.clone(),
                        field: "removedPropKeys",
                    })?,
            };
            Operation::Update {
                id: id("id")?,
                props: props()?,
                removed_prop_keys,
            }
        }
        "DELETE" => Operation::Delete { id: id("id")? },
        "APPEND" => {
            let child_id = id("childId")?;
            Operation::Append {
                id: id("id").unwrap_or(child_id),
                parent_id: id("parentId")?,
                child_id,
            }
        }
        "INSERT" => {
            let child_id = id("childId")?;
            let index = match value.get("index") {
                Some(RuntimeValue::Number(n)) if n.is_finite() && n >= 0.0 => n as usize,
                _ => {
                    return Err(ProtocolError::InvalidField {
                        op: op.clone(),
                        field: "index",
                    })
                }
            };
            Operation::Insert {
                id: id("id").unwrap_or(child_id),
                parent_id: id("parentId")?,
                child_id,
                index,
            }
        }
        "REMOVE" => Operation::Remove {
            parent_id: id("parentId")?,
            child_id: id("childId")?,
        },
        other => return Err(ProtocolError::UnknownOperation(other.to_string())),
    })
}
