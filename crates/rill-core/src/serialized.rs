//! Boundary-safe values and their JSON wire format
//!
//! A [`SerializedValue`] is what actually crosses between host and guest. It
//! carries no live references: functions become [`SerializedValue::FunctionRef`]
//! handles and back-edges of cycles become [`SerializedValue::CycleRef`].
//!
//! The wire format is plain JSON where JSON can express the value directly
//! and `{"__type": ...}` tagged objects everywhere else, so the guest side
//! can decode it with nothing but `JSON.parse`.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::error::WireError;
use crate::registry::CallbackId;
use crate::value::TypedArrayKind;

/// Tag key used by every non-JSON-native value
pub const TYPE_TAG: &str = "__type";

/// Largest integer that survives a round trip through an `f64`
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Scalar payload
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number, including NaN, infinities and negative zero
    Number(f64),
    /// String
    String(String),
}

/// A value that can cross the boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    /// Scalar
    Primitive(Primitive),
    /// Plain object with ordered keys
    PlainObject(IndexMap<String, SerializedValue>),
    /// Array
    Array(Vec<SerializedValue>),
    /// `Map` entries in insertion order
    MapValue(Vec<(SerializedValue, SerializedValue)>),
    /// `Set` values in insertion order
    SetValue(Vec<SerializedValue>),
    /// `Date` as epoch milliseconds (NaN for an invalid date)
    DateValue(f64),
    /// Regular expression
    RegExpValue {
        /// Pattern source
        source: String,
        /// Flags
        flags: String,
    },
    /// Typed array bytes
    TypedArrayValue {
        /// Element kind
        kind: TypedArrayKind,
        /// Raw bytes
        bytes: Vec<u8>,
    },
    /// Error object
    ErrorValue {
        /// Constructor name
        name: String,
        /// Message
        message: String,
        /// Stack trace
        stack: Option<String>,
    },
    /// Handle to a function owned by the other side
    FunctionRef(CallbackId),
    /// Back-edge of a reference cycle
    CycleRef,
}

impl SerializedValue {
    /// `undefined`
    pub fn undefined() -> Self {
        SerializedValue::Primitive(Primitive::Undefined)
    }

    /// `null`
    pub fn null() -> Self {
        SerializedValue::Primitive(Primitive::Null)
    }

    /// Build a plain object
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, SerializedValue)>) -> Self {
        SerializedValue::PlainObject(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Is this `undefined`?
    pub fn is_undefined(&self) -> bool {
        matches!(self, SerializedValue::Primitive(Primitive::Undefined))
    }

    /// Borrow a string payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SerializedValue::Primitive(Primitive::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SerializedValue::Primitive(Primitive::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Property of a plain object
    pub fn get(&self, key: &str) -> Option<&SerializedValue> {
        match self {
            SerializedValue::PlainObject(map) => map.get(key),
            _ => None,
        }
    }

    /// Collect every function handle reachable from this value, in order
    pub fn function_refs(&self) -> Vec<CallbackId> {
        let mut out = Vec::new();
        self.collect_function_refs(&mut out);
        out
    }

    fn collect_function_refs(&self, out: &mut Vec<CallbackId>) {
        match self {
            SerializedValue::FunctionRef(id) => out.push(id.clone()),
            SerializedValue::PlainObject(map) => {
                for value in map.values() {
                    value.collect_function_refs(out);
                }
            }
            SerializedValue::Array(items) | SerializedValue::SetValue(items) => {
                for value in items {
                    value.collect_function_refs(out);
                }
            }
            SerializedValue::MapValue(entries) => {
                for (key, value) in entries {
                    key.collect_function_refs(out);
                    value.collect_function_refs(out);
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Wire format
    // ========================================================================

    /// Convert to the JSON wire representation
    pub fn to_wire(&self) -> Value {
        match self {
            SerializedValue::Primitive(p) => match p {
                Primitive::Undefined => tagged("undefined", Map::new()),
                Primitive::Null => Value::Null,
                Primitive::Bool(b) => Value::Bool(*b),
                Primitive::Number(n) => number_to_wire(*n),
                Primitive::String(s) => Value::String(s.clone()),
            },
            SerializedValue::PlainObject(map) => {
                let inner: Map<String, Value> = map.iter().map(|(k, v)| (k.clone(), v.to_wire())).collect();
                if map.contains_key(TYPE_TAG) {
                    let mut fields = Map::new();
                    fields.insert("value".into(), Value::Object(inner));
                    tagged("object", fields)
                } else {
                    Value::Object(inner)
                }
            }
            SerializedValue::Array(items) => Value::Array(items.iter().map(|v| v.to_wire()).collect()),
            SerializedValue::MapValue(entries) => {
                let pairs = entries
                    .iter()
                    .map(|(k, v)| Value::Array(vec![k.to_wire(), v.to_wire()]))
                    .collect();
                let mut fields = Map::new();
                fields.insert("entries".into(), Value::Array(pairs));
                tagged("map", fields)
            }
            SerializedValue::SetValue(values) => {
                let mut fields = Map::new();
                fields.insert("values".into(), Value::Array(values.iter().map(|v| v.to_wire()).collect()));
                tagged("set", fields)
            }
            SerializedValue::DateValue(ms) => {
                let mut fields = Map::new();
                let value = if ms.is_finite() {
                    number_to_wire(*ms)
                } else {
                    Value::Null
                };
                fields.insert("value".into(), value);
                tagged("date", fields)
            }
            SerializedValue::RegExpValue { source, flags } => {
                let mut fields = Map::new();
                fields.insert("source".into(), Value::String(source.clone()));
                fields.insert("flags".into(), Value::String(flags.clone()));
                tagged("regexp", fields)
            }
            SerializedValue::TypedArrayValue { kind, bytes } => {
                let mut fields = Map::new();
                fields.insert("kind".into(), Value::String(kind.as_str().into()));
                fields.insert(
                    "bytes".into(),
                    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
                );
                tagged("typedarray", fields)
            }
            SerializedValue::ErrorValue { name, message, stack } => {
                let mut fields = Map::new();
                fields.insert("name".into(), Value::String(name.clone()));
                fields.insert("message".into(), Value::String(message.clone()));
                if let Some(stack) = stack {
                    fields.insert("stack".into(), Value::String(stack.clone()));
                }
                tagged("error", fields)
            }
            SerializedValue::FunctionRef(id) => {
                let mut fields = Map::new();
                fields.insert("id".into(), Value::String(id.as_str().into()));
                tagged("function", fields)
            }
            SerializedValue::CycleRef => tagged("cycle", Map::new()),
        }
    }

    /// Parse the JSON wire representation
    pub fn from_wire(value: &Value) -> Result<Self, WireError> {
        Ok(match value {
            Value::Null => SerializedValue::null(),
            Value::Bool(b) => SerializedValue::Primitive(Primitive::Bool(*b)),
            Value::Number(n) => SerializedValue::Primitive(Primitive::Number(n.as_f64().unwrap_or(f64::NAN))),
            Value::String(s) => SerializedValue::Primitive(Primitive::String(s.clone())),
            Value::Array(items) => {
                SerializedValue::Array(items.iter().map(SerializedValue::from_wire).collect::<Result<_, _>>()?)
            }
            Value::Object(map) => match map.get(TYPE_TAG) {
                Some(Value::String(tag)) => from_tagged(tag, map)?,
                _ => SerializedValue::PlainObject(plain_object_from_wire(map)?),
            },
        })
    }

    /// Serialize to JSON text
    pub fn to_wire_string(&self) -> String {
        self.to_wire().to_string()
    }

    /// Parse JSON text
    pub fn from_wire_str(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_wire(&value)
    }
}

fn tagged(tag: &str, mut fields: Map<String, Value>) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_TAG.into(), Value::String(tag.into()));
    map.append(&mut fields);
    Value::Object(map)
}

fn number_to_wire(n: f64) -> Value {
    let special = if n.is_nan() {
        "NaN"
    } else if n == f64::INFINITY {
        "Infinity"
    } else if n == f64::NEG_INFINITY {
        "-Infinity"
    } else if n == 0.0 && n.is_sign_negative() {
        "-0"
    } else if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Value::from(n as i64);
    } else {
        return Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null);
    };
    let mut fields = Map::new();
    fields.insert("value".into(), Value::String(special.into()));
    tagged("number", fields)
}

fn plain_object_from_wire(map: &Map<String, Value>) -> Result<IndexMap<String, SerializedValue>, WireError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), SerializedValue::from_wire(v)?)))
        .collect()
}

fn field<'a>(tag: &str, map: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, WireError> {
    map.get(name).ok_or_else(|| WireError::MissingField {
        tag: tag.to_string(),
        field: name,
    })
}

fn string_field(tag: &str, map: &Map<String, Value>, name: &'static str) -> Result<String, WireError> {
    match field(tag, map, name)? {
        Value::String(s) => Ok(s.clone()),
        _ => Err(WireError::InvalidField {
            field: name,
            expected: "string",
        }),
    }
}

fn array_field<'a>(tag: &str, map: &'a Map<String, Value>, name: &'static str) -> Result<&'a Vec<Value>, WireError> {
    match field(tag, map, name)? {
        Value::Array(items) => Ok(items),
        _ => Err(WireError::InvalidField {
            field: name,
            expected: "array",
        }),
    }
}

fn from_tagged(tag: &str, map: &Map<String, Value>) -> Result<SerializedValue, WireError> {
    Ok(match tag {
        "undefined" => SerializedValue::undefined(),
        "number" => {
            let n = match string_field(tag, map, "value")?.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                "-0" => -0.0,
                _ => {
                    return Err(WireError::InvalidField {
                        field: "value",
                        expected: "NaN, Infinity, -Infinity or -0",
                    })
                }
            };
            SerializedValue::Primitive(Primitive::Number(n))
        }
        "object" => match field(tag, map, "value")? {
            Value::Object(inner) => SerializedValue::PlainObject(plain_object_from_wire(inner)?),
            _ => {
                return Err(WireError::InvalidField {
                    field: "value",
                    expected: "object",
                })
            }
        },
        "map" => {
            let mut entries = Vec::new();
            for pair in array_field(tag, map, "entries")? {
                match pair {
                    Value::Array(kv) if kv.len() == 2 => {
                        entries.push((SerializedValue::from_wire(&kv[0])?, SerializedValue::from_wire(&kv[1])?));
                    }
                    _ => {
                        return Err(WireError::InvalidField {
                            field: "entries",
                            expected: "[key, value] pairs",
                        })
                    }
                }
            }
            SerializedValue::MapValue(entries)
        }
        "set" => SerializedValue::SetValue(
            array_field(tag, map, "values")?
                .iter()
                .map(SerializedValue::from_wire)
                .collect::<Result<_, _>>()?,
        ),
        "date" => match field(tag, map, "value")? {
            Value::Number(n) => SerializedValue::DateValue(n.as_f64().unwrap_or(f64::NAN)),
            Value::Null => SerializedValue::DateValue(f64::NAN),
            _ => {
                return Err(WireError::InvalidField {
                    field: "value",
                    expected: "number or null",
                })
            }
        },
        "regexp" => SerializedValue::RegExpValue {
            source: string_field(tag, map, "source")?,
            flags: string_field(tag, map, "flags")?,
        },
        "typedarray" => {
            let kind_name = string_field(tag, map, "kind")?;
            let kind = TypedArrayKind::from_name(&kind_name).ok_or(WireError::InvalidField {
                field: "kind",
                expected: "typed array constructor name",
            })?;
            let bytes = array_field(tag, map, "bytes")?
                .iter()
                .map(|b| {
                    b.as_u64().filter(|b| *b <= u8::MAX as u64).map(|b| b as u8).ok_or(WireError::InvalidField {
                        field: "bytes",
                        expected: "array of bytes",
                    })
                })
                .collect::<Result<_, _>>()?;
            SerializedValue::TypedArrayValue { kind, bytes }
        }
        "error" => SerializedValue::ErrorValue {
            name: map.get("name").and_then(Value::as_str).unwrap_or("Error").to_string(),
            message: map.get("message").and_then(Value::as_str).unwrap_or_default().to_string(),
            stack: map.get("stack").and_then(Value::as_str).map(str::to_string),
        },
        "function" => SerializedValue::FunctionRef(CallbackId::new(string_field(tag, map, "id")?)),
        "cycle" => SerializedValue::CycleRef,
        other => return Err(WireError::UnknownType(other.to_string())),
    })
}

impl Serialize for SerializedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        SerializedValue::from_wire(&value).map_err(serde::de::Error::custom)
    }
}

impl From<f64> for SerializedValue {
    fn from(n: f64) -> Self {
        SerializedValue::Primitive(Primitive::Number(n))
    }
}

impl From<i32> for SerializedValue {
    fn from(n: i32) -> Self {
        SerializedValue::Primitive(Primitive::Number(n as f64))
    }
}

impl From<bool> for SerializedValue {
    fn from(b: bool) -> Self {
        SerializedValue::Primitive(Primitive::Bool(b))
    }
}

impl From<&str> for SerializedValue {
    fn from(s: &str) -> Self {
        SerializedValue::Primitive(Primitive::String(s.to_string()))
    }
}

impl From<String> for SerializedValue {
    fn from(s: String) -> Self {
        SerializedValue::Primitive(Primitive::String(s))
    }
}
