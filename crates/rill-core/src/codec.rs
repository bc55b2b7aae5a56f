//! Value codec
//!
//! Converts [`RuntimeValue`] trees into [`SerializedValue`] trees and back.
//!
//! Encoding walks [`ENCODE_RULES`] in order and the first matching rule
//! wins. Cycles are found with the set of containers currently open on the
//! encoding path: a container is entered before its children are visited and
//! left afterwards, so a value shared by two siblings is encoded twice while
//! a true back-edge becomes [`SerializedValue::CycleRef`].

use rustc_hash::FxHashSet;

use crate::error::CodecError;
use crate::registry::CallbackId;
use crate::serialized::{Primitive, SerializedValue};
use crate::value::{ErrorValue, FunctionValue, RuntimeValue};

/// Default recursion limit
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Turns functions into handles while encoding
pub trait FunctionRegistrar {
    /// Register `func` and return the handle id to put on the wire
    fn register_function(&mut self, func: &FunctionValue) -> Result<CallbackId, CodecError>;
}

/// Turns handles back into callables while decoding
pub trait FunctionResolver {
    /// Resolve a handle; `None` decodes as `undefined`
    fn resolve_function(&self, id: &CallbackId) -> Option<RuntimeValue>;
}

/// Registrar/resolver for pure data: refuses functions
#[derive(Debug, Default, Clone, Copy)]
pub struct DataOnly;

impl FunctionRegistrar for DataOnly {
    fn register_function(&mut self, func: &FunctionValue) -> Result<CallbackId, CodecError> {
        Err(CodecError::Registration(format!(
            "function `{}` cannot be encoded without a registry",
            func.name()
        )))
    }
}

impl FunctionResolver for DataOnly {
    fn resolve_function(&self, _id: &CallbackId) -> Option<RuntimeValue> {
        None
    }
}

// ============================================================================
// Rules
// ============================================================================

type Matcher = fn(&RuntimeValue) -> bool;
type RuleEncoder = fn(&mut Encoder<'_>, &RuntimeValue) -> Result<SerializedValue, CodecError>;

/// One encoding rule
pub struct EncodeRule {
    /// Rule name
    pub name: &'static str,
    matches: Matcher,
    encode: RuleEncoder,
}

/// Encoding rules in priority order
pub const ENCODE_RULES: &[EncodeRule] = &[
    EncodeRule { name: "toJSON", matches: is_json, encode: encode_json },
    EncodeRule { name: "undefined", matches: is_undefined, encode: encode_scalar },
    EncodeRule { name: "null", matches: is_null, encode: encode_scalar },
    EncodeRule { name: "boolean", matches: is_bool, encode: encode_scalar },
    EncodeRule { name: "number", matches: is_number, encode: encode_scalar },
    EncodeRule { name: "string", matches: is_string, encode: encode_scalar },
    EncodeRule { name: "function", matches: is_function, encode: encode_function },
    EncodeRule { name: "date", matches: is_date, encode: encode_leaf },
    EncodeRule { name: "regexp", matches: is_regexp, encode: encode_leaf },
    EncodeRule { name: "error", matches: is_error, encode: encode_leaf },
    EncodeRule { name: "typedArray", matches: is_typed_array, encode: encode_leaf },
    EncodeRule { name: "array", matches: is_array, encode: encode_array },
    EncodeRule { name: "map", matches: is_map, encode: encode_map },
    EncodeRule { name: "set", matches: is_set, encode: encode_set },
    EncodeRule { name: "object", matches: is_object, encode: encode_object },
];

fn is_json(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Json(_))
}
fn is_undefined(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Undefined)
}
fn is_null(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Null)
}
fn is_bool(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Bool(_))
}
fn is_number(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Number(_))
}
fn is_string(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::String(_))
}
fn is_function(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Function(_))
}
fn is_date(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Date(_))
}
fn is_regexp(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::RegExp { .. })
}
fn is_error(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Error(_))
}
fn is_typed_array(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::TypedArray { .. })
}
fn is_array(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Array(_))
}
fn is_map(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Map(_))
}
fn is_set(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Set(_))
}
fn is_object(v: &RuntimeValue) -> bool {
    matches!(v, RuntimeValue::Object(_))
}

fn encode_json(enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    match v {
        RuntimeValue::Json(json) => enc.encode(&json.to_json()),
        _ => Ok(SerializedValue::undefined()),
    }
}

fn encode_scalar(_enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    Ok(SerializedValue::Primitive(match v {
        RuntimeValue::Null => Primitive::Null,
        RuntimeValue::Bool(b) => Primitive::Bool(*b),
        RuntimeValue::Number(n) => Primitive::Number(*n),
        RuntimeValue::String(s) => Primitive::String(s.clone()),
        _ => Primitive::Undefined,
    }))
}

fn encode_function(enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    match v {
        RuntimeValue::Function(func) => Ok(SerializedValue::FunctionRef(enc.registrar.register_function(func)?)),
        _ => Ok(SerializedValue::undefined()),
    }
}

fn encode_leaf(_enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    Ok(match v {
        RuntimeValue::Date(ms) => SerializedValue::DateValue(*ms),
        RuntimeValue::RegExp { source, flags } => SerializedValue::RegExpValue {
            source: source.clone(),
            flags: flags.clone(),
        },
        RuntimeValue::Error(err) => SerializedValue::ErrorValue {
            name: err.name.clone(),
            message: err.message.clone(),
            stack: err.stack.clone(),
        },
        RuntimeValue::TypedArray { kind, bytes } => SerializedValue::TypedArrayValue {
            kind: *kind,
            bytes: bytes.clone(),
        },
        _ => SerializedValue::undefined(),
    })
}

fn encode_array(enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    let RuntimeValue::Array(items) = v else {
        return Ok(SerializedValue::undefined());
    };
    let items = items.borrow().clone();
    enc.within(v, |enc| {
        let encoded = items.iter().map(|item| enc.encode(item)).collect::<Result<_, _>>()?;
        Ok(SerializedValue::Array(encoded))
    })
}

fn encode_map(enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    let RuntimeValue::Map(entries) = v else {
        return Ok(SerializedValue::undefined());
    };
    let entries = entries.borrow().clone();
    enc.within(v, |enc| {
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            out.push((enc.encode(key)?, enc.encode(value)?));
        }
        Ok(SerializedValue::MapValue(out))
    })
}

fn encode_set(enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    let RuntimeValue::Set(values) = v else {
        return Ok(SerializedValue::undefined());
    };
    let values = values.borrow().clone();
    enc.within(v, |enc| {
        let encoded = values.iter().map(|item| enc.encode(item)).collect::<Result<_, _>>()?;
        Ok(SerializedValue::SetValue(encoded))
    })
}

fn encode_object(enc: &mut Encoder<'_>, v: &RuntimeValue) -> Result<SerializedValue, CodecError> {
    let RuntimeValue::Object(map) = v else {
        return Ok(SerializedValue::undefined());
    };
    let entries: Vec<(String, RuntimeValue)> = map.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    enc.within(v, |enc| {
        let mut out = indexmap::IndexMap::with_capacity(entries.len());
        for (key, value) in &entries {
            out.insert(key.clone(), enc.encode(value)?);
        }
        Ok(SerializedValue::PlainObject(out))
    })
}

// ============================================================================
// Encoder
// ============================================================================

/// Stateful encoder for one top-level value
pub struct Encoder<'a> {
    registrar: &'a mut dyn FunctionRegistrar,
    open: FxHashSet<usize>,
    depth: usize,
    max_depth: usize,
}

impl<'a> Encoder<'a> {
    /// Create an encoder with the default depth limit
    pub fn new(registrar: &'a mut dyn FunctionRegistrar) -> Self {
        Self::with_max_depth(registrar, DEFAULT_MAX_DEPTH)
    }

    /// Create an encoder with an explicit depth limit
    pub fn with_max_depth(registrar: &'a mut dyn FunctionRegistrar, max_depth: usize) -> Self {
        Self {
            registrar,
            open: FxHashSet::default(),
            depth: 0,
            max_depth,
        }
    }

    /// Encode one value
    pub fn encode(&mut self, value: &RuntimeValue) -> Result<SerializedValue, CodecError> {
        if self.depth >= self.max_depth {
            return Err(CodecError::MaxDepthExceeded(self.max_depth));
        }
        self.depth += 1;
        let result = self.apply_rules(value);
        self.depth -= 1;
        result
    }

    fn apply_rules(&mut self, value: &RuntimeValue) -> Result<SerializedValue, CodecError> {
        for rule in ENCODE_RULES {
            if (rule.matches)(value) {
                return (rule.encode)(self, value);
            }
        }
        Ok(SerializedValue::undefined())
    }

    /// Run `body` with `container` marked open, or yield a cycle marker if it
    /// already is.
    fn within<F>(&mut self, container: &RuntimeValue, body: F) -> Result<SerializedValue, CodecError>
    where
        F: FnOnce(&mut Self) -> Result<SerializedValue, CodecError>,
    {
        let Some(addr) = container.container_addr() else {
            return body(self);
        };
        if !self.open.insert(addr) {
            return Ok(SerializedValue::CycleRef);
        }
        let result = body(self);
        self.open.remove(&addr);
        result
    }
}

/// Encode a value
pub fn encode(value: &RuntimeValue, registrar: &mut dyn FunctionRegistrar) -> Result<SerializedValue, CodecError> {
    Encoder::new(registrar).encode(value)
}

// ============================================================================
// Decoder
// ============================================================================

/// Decode a value. Cycle markers become `undefined`.
pub fn decode(value: &SerializedValue, resolver: &dyn FunctionResolver) -> RuntimeValue {
    match value {
        SerializedValue::Primitive(p) => match p {
            Primitive::Undefined => RuntimeValue::Undefined,
            Primitive::Null => RuntimeValue::Null,
            Primitive::Bool(b) => RuntimeValue::Bool(*b),
            Primitive::Number(n) => RuntimeValue::Number(*n),
            Primitive::String(s) => RuntimeValue::String(s.clone()),
        },
        SerializedValue::PlainObject(map) => {
            RuntimeValue::object(map.iter().map(|(k, v)| (k.clone(), decode(v, resolver))))
        }
        SerializedValue::Array(items) => RuntimeValue::array(items.iter().map(|v| decode(v, resolver))),
        SerializedValue::MapValue(entries) => {
            RuntimeValue::map(entries.iter().map(|(k, v)| (decode(k, resolver), decode(v, resolver))))
        }
        SerializedValue::SetValue(values) => RuntimeValue::set(values.iter().map(|v| decode(v, resolver))),
        SerializedValue::DateValue(ms) => RuntimeValue::Date(*ms),
        SerializedValue::RegExpValue { source, flags } => RuntimeValue::RegExp {
            source: source.clone(),
            flags: flags.clone(),
        },
        SerializedValue::TypedArrayValue { kind, bytes } => RuntimeValue::TypedArray {
            kind: *kind,
            bytes: bytes.clone(),
        },
        SerializedValue::ErrorValue { name, message, stack } => RuntimeValue::Error(ErrorValue {
            name: name.clone(),
            message: message.clone(),
            stack: stack.clone(),
        }),
        SerializedValue::FunctionRef(id) => resolver.resolve_function(id).unwrap_or_else(|| {
            tracing::warn!(id = %id, "unresolved function handle decoded as undefined");
            RuntimeValue::Undefined
        }),
        SerializedValue::CycleRef => RuntimeValue::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ToJson, TypedArrayKind};
    use std::rc::Rc;

    struct Collect(Vec<FunctionValue>);

    impl FunctionRegistrar for Collect {
        fn register_function(&mut self, func: &FunctionValue) -> Result<CallbackId, CodecError> {
            self.0.push(func.clone());
            Ok(CallbackId::new(format!("f{}", self.0.len())))
        }
    }

    fn roundtrip(value: &RuntimeValue) -> RuntimeValue {
        let encoded = encode(value, &mut DataOnly).unwrap();
        let wire = SerializedValue::from_wire_str(&encoded.to_wire_string()).unwrap();
        decode(&wire, &DataOnly)
    }

    #[test]
    fn test_rule_order() {
        let names: Vec<_> = ENCODE_RULES.iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec![
                "toJSON", "undefined", "null", "boolean", "number", "string", "function", "date", "regexp",
                "error", "typedArray", "array", "map", "set", "object"
            ]
        );
    }

    #[test]
    fn test_roundtrip_all_data_shapes() {
        let value = RuntimeValue::object([
            ("undef", RuntimeValue::Undefined),
            ("null", RuntimeValue::Null),
            ("nan", RuntimeValue::Number(f64::NAN)),
            ("inf", RuntimeValue::Number(f64::INFINITY)),
            ("ninf", RuntimeValue::Number(f64::NEG_INFINITY)),
            ("negzero", RuntimeValue::Number(-0.0)),
            ("text", RuntimeValue::from("hi")),
            ("list", RuntimeValue::array([RuntimeValue::from(1), RuntimeValue::Bool(false)])),
            (
                "map",
                RuntimeValue::map([(RuntimeValue::from("k"), RuntimeValue::array([RuntimeValue::Null]))]),
            ),
            ("set", RuntimeValue::set([RuntimeValue::from(1), RuntimeValue::from("a")])),
            ("date", RuntimeValue::Date(1_700_000_000_000.0)),
            ("bad_date", RuntimeValue::Date(f64::NAN)),
            (
                "re",
                RuntimeValue::RegExp {
                    source: "a+b".into(),
                    flags: "gi".into(),
                },
            ),
            (
                "bytes",
                RuntimeValue::TypedArray {
                    kind: TypedArrayKind::Uint16,
                    bytes: vec![1, 0, 255, 255],
                },
            ),
            ("err", RuntimeValue::Error(ErrorValue::new("TypeError", "bad"))),
        ]);
        assert!(roundtrip(&value).deep_eq(&value));
    }

    #[test]
    fn test_undefined_and_null_stay_distinct() {
        assert!(roundtrip(&RuntimeValue::Undefined).is_undefined());
        assert!(matches!(roundtrip(&RuntimeValue::Null), RuntimeValue::Null));
    }

    #[test]
    fn test_shared_sibling_is_not_a_cycle() {
        let shared = RuntimeValue::array([RuntimeValue::from(1)]);
        let value = RuntimeValue::array([shared.clone(), shared]);
        let encoded = encode(&value, &mut DataOnly).unwrap();
        let SerializedValue::Array(items) = encoded else {
            panic!("expected array");
        };
        assert!(items.iter().all(|i| matches!(i, SerializedValue::Array(_))));
    }

    #[test]
    fn test_self_reference_becomes_cycle_marker() {
        let obj = RuntimeValue::object([("name", RuntimeValue::from("root"))]);
        obj.set_property("me", obj.clone());
        let encoded = encode(&obj, &mut DataOnly).unwrap();
        assert_eq!(encoded.get("me"), Some(&SerializedValue::CycleRef));
        let decoded = decode(&encoded, &DataOnly);
        assert!(decoded.get("me").unwrap().is_undefined());
        assert_eq!(decoded.get("name").unwrap().as_str(), Some("root"));
    }

    #[test]
    fn test_deep_cyclic_chain() {
        let head = RuntimeValue::object([("depth", RuntimeValue::from(0))]);
        let mut tail = head.clone();
        for depth in 1..150 {
            let next = RuntimeValue::object([("depth", RuntimeValue::from(depth))]);
            tail.set_property("next", next.clone());
            tail = next;
        }
        tail.set_property("next", head.clone());

        let decoded = roundtrip(&head);
        let mut cursor = decoded;
        for depth in 0..150 {
            assert_eq!(cursor.get("depth").and_then(|d| d.as_f64()), Some(depth as f64));
            cursor = cursor.get("next").unwrap();
        }
        assert!(cursor.is_undefined());
    }

    #[test]
    fn test_depth_limit() {
        let mut value = RuntimeValue::Null;
        for _ in 0..20 {
            value = RuntimeValue::array([value]);
        }
        let err = Encoder::with_max_depth(&mut DataOnly, 10).encode(&value).unwrap_err();
        assert_eq!(err, CodecError::MaxDepthExceeded(10));
    }

    struct Point;

    impl ToJson for Point {
        fn to_json(&self) -> RuntimeValue {
            RuntimeValue::array([RuntimeValue::from(1), RuntimeValue::from(2)])
        }
    }

    #[test]
    fn test_to_json_takes_precedence() {
        let encoded = encode(&RuntimeValue::Json(Rc::new(Point)), &mut DataOnly).unwrap();
        assert_eq!(encoded, SerializedValue::Array(vec![1.into(), 2.into()]));
    }

    #[test]
    fn test_functions_go_through_registrar() {
        let f = RuntimeValue::function("f", |_| Ok(RuntimeValue::Undefined));
        let value = RuntimeValue::object([("a", f.clone()), ("b", f)]);
        let mut collect = Collect(Vec::new());
        let encoded = encode(&value, &mut collect).unwrap();
        assert_eq!(collect.0.len(), 2);
        assert_eq!(encoded.function_refs(), vec![CallbackId::new("f1"), CallbackId::new("f2")]);
    }

    #[test]
    fn test_data_only_refuses_functions() {
        let f = RuntimeValue::function("handler", |_| Ok(RuntimeValue::Undefined));
        assert!(matches!(encode(&f, &mut DataOnly), Err(CodecError::Registration(_))));
    }
}
