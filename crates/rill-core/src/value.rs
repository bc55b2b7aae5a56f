//! Live values on the Rust side of the boundary
//!
//! [`RuntimeValue`] mirrors the JavaScript value shapes that can cross
//! between host and guest. Containers are shared (`Rc<RefCell<..>>`) so
//! identity is observable: two handles to one array are the same array, and
//! an array may contain itself. Everything here is single-threaded.

use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::CallError;

/// Ordered property map of a plain object
pub type ObjectMap = IndexMap<String, RuntimeValue>;

/// Shared callable
pub type FunctionValue = Rc<dyn Callable>;

// ============================================================================
// Callables
// ============================================================================

/// Stable identity of a function that lives on the far side of a boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionIdentity {
    /// Context that owns the function
    pub context: u64,
    /// Function id inside that context
    pub id: String,
}

/// Anything that can be invoked with runtime values
pub trait Callable {
    /// Invoke synchronously
    fn call(&self, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError>;

    /// Invoke and wait for a promise result to settle.
    ///
    /// Host closures are synchronous, so the default simply calls through.
    fn call_async(&self, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        self.call(args)
    }

    /// Identity used for handle deduplication, if the function is a proxy
    fn identity(&self) -> Option<FunctionIdentity> {
        None
    }

    /// Debug name
    fn name(&self) -> &str {
        "anonymous"
    }
}

type NativeFn = dyn Fn(&[RuntimeValue]) -> Result<RuntimeValue, CallError>;

/// Host closure exposed as a [`Callable`]
pub struct NativeFunction {
    name: String,
    func: Box<NativeFn>,
}

impl NativeFunction {
    /// Wrap a closure
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[RuntimeValue]) -> Result<RuntimeValue, CallError> + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    /// Convert into a runtime value
    pub fn into_value(self) -> RuntimeValue {
        RuntimeValue::Function(Rc::new(self))
    }
}

impl Callable for NativeFunction {
    fn call(&self, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        (self.func)(args)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Values that replace their own shape when serialized (JavaScript `toJSON`)
pub trait ToJson {
    /// Produce the value to encode in place of `self`
    fn to_json(&self) -> RuntimeValue;
}

// ============================================================================
// Leaf types
// ============================================================================

/// Error object payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Constructor name (`TypeError`, `BudgetExceeded`, ...)
    pub name: String,
    /// Error message
    pub message: String,
    /// Stack trace, when the producer had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorValue {
    /// Create an error without a stack
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Element kind of a typed array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    /// `Int8Array`
    Int8,
    /// `Uint8Array`
    Uint8,
    /// `Uint8ClampedArray`
    Uint8Clamped,
    /// `Int16Array`
    Int16,
    /// `Uint16Array`
    Uint16,
    /// `Int32Array`
    Int32,
    /// `Uint32Array`
    Uint32,
    /// `Float32Array`
    Float32,
    /// `Float64Array`
    Float64,
    /// `BigInt64Array`
    BigInt64,
    /// `BigUint64Array`
    BigUint64,
}

impl TypedArrayKind {
    const ALL: [TypedArrayKind; 11] = [
        TypedArrayKind::Int8,
        TypedArrayKind::Uint8,
        TypedArrayKind::Uint8Clamped,
        TypedArrayKind::Int16,
        TypedArrayKind::Uint16,
        TypedArrayKind::Int32,
        TypedArrayKind::Uint32,
        TypedArrayKind::Float32,
        TypedArrayKind::Float64,
        TypedArrayKind::BigInt64,
        TypedArrayKind::BigUint64,
    ];

    /// JavaScript constructor name
    pub fn as_str(&self) -> &'static str {
        match self {
            TypedArrayKind::Int8 => "Int8Array",
            TypedArrayKind::Uint8 => "Uint8Array",
            TypedArrayKind::Uint8Clamped => "Uint8ClampedArray",
            TypedArrayKind::Int16 => "Int16Array",
            TypedArrayKind::Uint16 => "Uint16Array",
            TypedArrayKind::Int32 => "Int32Array",
            TypedArrayKind::Uint32 => "Uint32Array",
            TypedArrayKind::Float32 => "Float32Array",
            TypedArrayKind::Float64 => "Float64Array",
            TypedArrayKind::BigInt64 => "BigInt64Array",
            TypedArrayKind::BigUint64 => "BigUint64Array",
        }
    }

    /// Parse a constructor name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Bytes per element
    pub fn element_size(&self) -> usize {
        match self {
            TypedArrayKind::Int8 | TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::Float64 | TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => 8,
        }
    }
}

// ============================================================================
// RuntimeValue
// ============================================================================

/// A live JavaScript-like value
#[derive(Clone)]
pub enum RuntimeValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// IEEE-754 double, including NaN, infinities and negative zero
    Number(f64),
    /// String
    String(String),
    /// Array
    Array(Rc<RefCell<Vec<RuntimeValue>>>),
    /// Plain object with ordered keys
    Object(Rc<RefCell<ObjectMap>>),
    /// `Map` with insertion-ordered entries
    Map(Rc<RefCell<Vec<(RuntimeValue, RuntimeValue)>>>),
    /// `Set` with insertion-ordered values
    Set(Rc<RefCell<Vec<RuntimeValue>>>),
    /// `Date` as epoch milliseconds, NaN for an invalid date
    Date(f64),
    /// Regular expression literal
    RegExp {
        /// Pattern source
        source: String,
        /// Flags (`gimsuy`)
        flags: String,
    },
    /// Typed array, copied as raw little-endian bytes
    TypedArray {
        /// Element kind
        kind: TypedArrayKind,
        /// Backing bytes
        bytes: Vec<u8>,
    },
    /// Error object
    Error(ErrorValue),
    /// Function
    Function(FunctionValue),
    /// Value with a `toJSON` replacement
    Json(Rc<dyn ToJson>),
}

impl RuntimeValue {
    /// Build an array value
    pub fn array(items: impl IntoIterator<Item = RuntimeValue>) -> Self {
        RuntimeValue::Array(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    /// Build a plain object from key/value pairs
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, RuntimeValue)>) -> Self {
        let map: ObjectMap = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        RuntimeValue::Object(Rc::new(RefCell::new(map)))
    }

    /// Build a `Map`
    pub fn map(entries: impl IntoIterator<Item = (RuntimeValue, RuntimeValue)>) -> Self {
        RuntimeValue::Map(Rc::new(RefCell::new(entries.into_iter().collect())))
    }

    /// Build a `Set`
    pub fn set(values: impl IntoIterator<Item = RuntimeValue>) -> Self {
        RuntimeValue::Set(Rc::new(RefCell::new(values.into_iter().collect())))
    }

    /// Wrap a host closure
    pub fn function<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[RuntimeValue]) -> Result<RuntimeValue, CallError> + 'static,
    {
        NativeFunction::new(name, func).into_value()
    }

    /// JavaScript `typeof`-style name
    pub fn type_name(&self) -> &'static str {
        match self {
            RuntimeValue::Undefined => "undefined",
            RuntimeValue::Null => "null",
            RuntimeValue::Bool(_) => "boolean",
            RuntimeValue::Number(_) => "number",
            RuntimeValue::String(_) => "string",
            RuntimeValue::Array(_) => "array",
            RuntimeValue::Object(_) => "object",
            RuntimeValue::Map(_) => "map",
            RuntimeValue::Set(_) => "set",
            RuntimeValue::Date(_) => "date",
            RuntimeValue::RegExp { .. } => "regexp",
            RuntimeValue::TypedArray { .. } => "typedarray",
            RuntimeValue::Error(_) => "error",
            RuntimeValue::Function(_) => "function",
            RuntimeValue::Json(_) => "object",
        }
    }

    /// Is this `undefined`?
    pub fn is_undefined(&self) -> bool {
        matches!(self, RuntimeValue::Undefined)
    }

    /// Is this `null` or `undefined`?
    pub fn is_nullish(&self) -> bool {
        matches!(self, RuntimeValue::Undefined | RuntimeValue::Null)
    }

    /// Borrow a string payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RuntimeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RuntimeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RuntimeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Function payload
    pub fn as_function(&self) -> Option<&FunctionValue> {
        match self {
            RuntimeValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Read a property of a plain object
    pub fn get(&self, key: &str) -> Option<RuntimeValue> {
        match self {
            RuntimeValue::Object(map) => map.borrow().get(key).cloned(),
            RuntimeValue::Json(json) => json.to_json().get(key),
            _ => None,
        }
    }

    /// Set a property on a plain object; returns false for non-objects
    pub fn set_property(&self, key: impl Into<String>, value: RuntimeValue) -> bool {
        match self {
            RuntimeValue::Object(map) => {
                map.borrow_mut().insert(key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Push onto an array; returns false for non-arrays
    pub fn push(&self, value: RuntimeValue) -> bool {
        match self {
            RuntimeValue::Array(items) => {
                items.borrow_mut().push(value);
                true
            }
            _ => false,
        }
    }

    /// Clone the elements of an array
    pub fn to_vec(&self) -> Option<Vec<RuntimeValue>> {
        match self {
            RuntimeValue::Array(items) => Some(items.borrow().clone()),
            _ => None,
        }
    }

    /// Address of a shared container, used for identity checks
    pub(crate) fn container_addr(&self) -> Option<usize> {
        match self {
            RuntimeValue::Array(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            RuntimeValue::Object(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            RuntimeValue::Map(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            RuntimeValue::Set(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            _ => None,
        }
    }

    /// Are both values the same shared container (or the same function)?
    pub fn ptr_eq(&self, other: &RuntimeValue) -> bool {
        match (self, other) {
            (RuntimeValue::Function(a), RuntimeValue::Function(b)) => function_key(a) == function_key(b),
            _ => match (self.container_addr(), other.container_addr()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Structural equality with `Object.is` semantics for numbers.
    ///
    /// Functions compare by identity. Cycles are compared by position: a
    /// pair of containers already under comparison is assumed equal.
    pub fn deep_eq(&self, other: &RuntimeValue) -> bool {
        let mut open = FxHashSet::default();
        deep_eq_inner(self, other, &mut open)
    }
}

fn deep_eq_inner(a: &RuntimeValue, b: &RuntimeValue, open: &mut FxHashSet<(usize, usize)>) -> bool {
    if let (Some(pa), Some(pb)) = (a.container_addr(), b.container_addr()) {
        if !open.insert((pa, pb)) {
            return true;
        }
        let result = deep_eq_containers(a, b, open);
        open.remove(&(pa, pb));
        return result;
    }
    match (a, b) {
        (RuntimeValue::Undefined, RuntimeValue::Undefined) => true,
        (RuntimeValue::Null, RuntimeValue::Null) => true,
        (RuntimeValue::Bool(x), RuntimeValue::Bool(y)) => x == y,
        (RuntimeValue::Number(x), RuntimeValue::Number(y)) => same_value(*x, *y),
        (RuntimeValue::String(x), RuntimeValue::String(y)) => x == y,
        (RuntimeValue::Date(x), RuntimeValue::Date(y)) => same_value(*x, *y),
        (
            RuntimeValue::RegExp { source: s1, flags: f1 },
            RuntimeValue::RegExp { source: s2, flags: f2 },
        ) => s1 == s2 && f1 == f2,
        (
            RuntimeValue::TypedArray { kind: k1, bytes: b1 },
            RuntimeValue::TypedArray { kind: k2, bytes: b2 },
        ) => k1 == k2 && b1 == b2,
        (RuntimeValue::Error(x), RuntimeValue::Error(y)) => x.name == y.name && x.message == y.message,
        (RuntimeValue::Function(_), RuntimeValue::Function(_)) => a.ptr_eq(b),
        (RuntimeValue::Json(x), _) => deep_eq_inner(&x.to_json(), b, open),
        (_, RuntimeValue::Json(y)) => deep_eq_inner(a, &y.to_json(), open),
        _ => false,
    }
}

fn deep_eq_containers(a: &RuntimeValue, b: &RuntimeValue, open: &mut FxHashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (RuntimeValue::Array(x), RuntimeValue::Array(y)) | (RuntimeValue::Set(x), RuntimeValue::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| deep_eq_inner(l, r, open))
        }
        (RuntimeValue::Object(x), RuntimeValue::Object(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((kl, vl), (kr, vr))| kl == kr && deep_eq_inner(vl, vr, open))
        }
        (RuntimeValue::Map(x), RuntimeValue::Map(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|((kl, vl), (kr, vr))| {
                    deep_eq_inner(kl, kr, open) && deep_eq_inner(vl, vr, open)
                })
        }
        _ => false,
    }
}

/// `Object.is` for numbers: NaN equals NaN, `0` and `-0` differ
pub fn same_value(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a == b && a.is_sign_negative() == b.is_sign_negative()
}

/// Deduplication key of a function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FunctionKey {
    /// Host closure, keyed by allocation address
    Pointer(usize),
    /// Proxy for a function owned by a sandbox context
    Remote(FunctionIdentity),
}

/// Compute the deduplication key of a function
pub fn function_key(func: &FunctionValue) -> FunctionKey {
    match func.identity() {
        Some(identity) => FunctionKey::Remote(identity),
        None => FunctionKey::Pointer(Rc::as_ptr(func) as *const () as usize),
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for RuntimeValue {
    fn from(b: bool) -> Self {
        RuntimeValue::Bool(b)
    }
}

impl From<f64> for RuntimeValue {
    fn from(n: f64) -> Self {
        RuntimeValue::Number(n)
    }
}

impl From<i32> for RuntimeValue {
    fn from(n: i32) -> Self {
        RuntimeValue::Number(n as f64)
    }
}

impl From<&str> for RuntimeValue {
    fn from(s: &str) -> Self {
        RuntimeValue::String(s.to_string())
    }
}

impl From<String> for RuntimeValue {
    fn from(s: String) -> Self {
        RuntimeValue::String(s)
    }
}

impl From<ErrorValue> for RuntimeValue {
    fn from(err: ErrorValue) -> Self {
        RuntimeValue::Error(err)
    }
}

impl From<Vec<RuntimeValue>> for RuntimeValue {
    fn from(items: Vec<RuntimeValue>) -> Self {
        RuntimeValue::array(items)
    }
}

// ============================================================================
// Debug
// ============================================================================

impl fmt::Debug for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut open = Vec::new();
        debug_value(self, f, &mut open)
    }
}

fn debug_value(value: &RuntimeValue, f: &mut fmt::Formatter<'_>, open: &mut Vec<usize>) -> fmt::Result {
    if let Some(addr) = value.container_addr() {
        if open.contains(&addr) {
            return write!(f, "[Circular]");
        }
        open.push(addr);
        let result = debug_container(value, f, open);
        open.pop();
        return result;
    }
    match value {
        RuntimeValue::Undefined => write!(f, "undefined"),
        RuntimeValue::Null => write!(f, "null"),
        RuntimeValue::Bool(b) => write!(f, "{}", b),
        RuntimeValue::Number(n) => write!(f, "{}", n),
        RuntimeValue::String(s) => write!(f, "{:?}", s),
        RuntimeValue::Date(ms) => write!(f, "Date({})", ms),
        RuntimeValue::RegExp { source, flags } => write!(f, "/{}/{}", source, flags),
        RuntimeValue::TypedArray { kind, bytes } => write!(f, "{}({} bytes)", kind.as_str(), bytes.len()),
        RuntimeValue::Error(err) => write!(f, "Error({})", err),
        RuntimeValue::Function(func) => write!(f, "[Function {}]", func.name()),
        RuntimeValue::Json(_) => write!(f, "[toJSON]"),
        _ => Ok(()),
    }
}

fn debug_container(value: &RuntimeValue, f: &mut fmt::Formatter<'_>, open: &mut Vec<usize>) -> fmt::Result {
    match value {
        RuntimeValue::Array(items) | RuntimeValue::Set(items) => {
            if matches!(value, RuntimeValue::Set(_)) {
                write!(f, "Set")?;
            }
            write!(f, "[")?;
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                debug_value(item, f, open)?;
            }
            write!(f, "]")
        }
        RuntimeValue::Object(map) => {
            write!(f, "{{")?;
            for (i, (key, item)) in map.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: ", key)?;
                debug_value(item, f, open)?;
            }
            write!(f, "}}")
        }
        RuntimeValue::Map(entries) => {
            write!(f, "Map{{")?;
            for (i, (key, item)) in entries.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                debug_value(key, f, open)?;
                write!(f, " => ")?;
                debug_value(item, f, open)?;
            }
            write!(f, "}}")
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_value_semantics() {
        assert!(same_value(f64::NAN, f64::NAN));
        assert!(!same_value(0.0, -0.0));
        assert!(same_value(1.5, 1.5));
    }

    #[test]
    fn test_deep_eq_handles_self_reference() {
        let a = RuntimeValue::array(vec![RuntimeValue::from(1)]);
        a.push(a.clone());
        let b = RuntimeValue::array(vec![RuntimeValue::from(1)]);
        b.push(b.clone());
        assert!(a.deep_eq(&b));
        assert_eq!(format!("{:?}", a), "[1, [Circular]]");
    }

    #[test]
    fn test_object_key_order_matters() {
        let a = RuntimeValue::object([("x", RuntimeValue::from(1)), ("y", RuntimeValue::from(2))]);
        let b = RuntimeValue::object([("y", RuntimeValue::from(2)), ("x", RuntimeValue::from(1))]);
        assert!(!a.deep_eq(&b));
        assert_eq!(a.get("y").and_then(|v| v.as_f64()), Some(2.0));
    }

    #[test]
    fn test_function_identity_by_pointer() {
        let f = RuntimeValue::function("f", |_| Ok(RuntimeValue::Undefined));
        let g = RuntimeValue::function("g", |_| Ok(RuntimeValue::Undefined));
        assert!(f.ptr_eq(&f.clone()));
        assert!(!f.ptr_eq(&g));
    }

    #[test]
    fn test_typed_array_kind_names() {
        assert_eq!(TypedArrayKind::from_name("Float32Array"), Some(TypedArrayKind::Float32));
        assert_eq!(TypedArrayKind::Uint8Clamped.as_str(), "Uint8ClampedArray");
        assert_eq!(TypedArrayKind::from_name("DataView"), None);
        assert_eq!(TypedArrayKind::BigInt64.element_size(), 8);
    }
}
