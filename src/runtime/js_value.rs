//! Native representation of JavaScript values.
//!
//! [`JSValue`] is what crosses the bridge. Primitives, arrays, plain maps, dates,
//! regular expressions and byte buffers are owned copies; functions, promises and
//! other objects stay in their context group and are represented by handles that
//! read and write through to the live JavaScript value.

use crate::runtime::bridge::{NativeFunction, NativeObject};
use crate::runtime::error::BridgeError;
use crate::runtime::handle::{JsFunction, JsObject, JsPromise};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum nesting depth when copying values across the bridge
pub const MAX_JS_DEPTH: usize = 100;
/// Maximum size in bytes when copying values across the bridge
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// A value projected between native code and a JavaScript context.
///
/// Note: The Serialize/Deserialize implementations are manually implemented
/// because handle variants cannot be serialized.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum JSValue {
    /// JavaScript undefined, also returned for missing properties
    #[default]
    Undefined,
    /// JavaScript null
    Null,
    /// JavaScript boolean
    Bool(bool),
    /// JavaScript integer (within i64 range)
    Int(i64),
    /// JavaScript float (including NaN and ±Infinity)
    Float(f64),
    /// JavaScript string
    String(String),
    /// JavaScript array (preserves order)
    Array(Vec<JSValue>),
    /// Plain object copied as an ordered map
    Object(IndexMap<String, JSValue>),
    /// Date as milliseconds since the Unix epoch
    Date(f64),
    /// Regular expression source and flags
    RegExp { source: String, flags: String },
    /// ArrayBuffer or typed-array view
    Buffer(ByteBuffer),
    /// Live JavaScript function
    Function(JsFunction),
    /// Live JavaScript promise
    Promise(JsPromise),
    /// Any other live JavaScript object
    Ref(JsObject),
    /// Native callable exposed to JavaScript as a function
    NativeFunction(NativeFunction),
    /// Native object exposed through its export table
    Exported(NativeObject),
}

impl JSValue {
    /// Short type tag used in diagnostics and coercion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            JSValue::Undefined => "undefined",
            JSValue::Null => "null",
            JSValue::Bool(_) => "boolean",
            JSValue::Int(_) | JSValue::Float(_) => "number",
            JSValue::String(_) => "string",
            JSValue::Array(_) => "array",
            JSValue::Object(_) | JSValue::Ref(_) | JSValue::Exported(_) => "object",
            JSValue::Date(_) => "date",
            JSValue::RegExp { .. } => "regexp",
            JSValue::Buffer(_) => "buffer",
            JSValue::Function(_) | JSValue::NativeFunction(_) => "function",
            JSValue::Promise(_) => "promise",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, JSValue::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JSValue::Undefined | JSValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JSValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric value of `Int` and `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JSValue::Int(i) => Some(*i as f64),
            JSValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer value of `Int`, or of a `Float` with no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JSValue::Int(i) => Some(*i),
            JSValue::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JSValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&JsFunction> {
        match self {
            JSValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&JsObject> {
        match self {
            JSValue::Ref(o) => Some(o),
            _ => None,
        }
    }

    /// JavaScript truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            JSValue::Undefined | JSValue::Null => false,
            JSValue::Bool(b) => *b,
            JSValue::Int(i) => *i != 0,
            JSValue::Float(f) => *f != 0.0 && !f.is_nan(),
            JSValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

impl fmt::Display for JSValue {
    /// Formats the way `console.log` prints a value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JSValue::Undefined => f.write_str("undefined"),
            JSValue::Null => f.write_str("null"),
            JSValue::Bool(b) => write!(f, "{}", b),
            JSValue::Int(i) => write!(f, "{}", i),
            JSValue::Float(v) if v.is_nan() => f.write_str("NaN"),
            JSValue::Float(v) if v.is_infinite() => {
                f.write_str(if *v > 0.0 { "Infinity" } else { "-Infinity" })
            }
            JSValue::Float(v) => write!(f, "{}", v),
            JSValue::String(s) => f.write_str(s),
            JSValue::Array(items) => {
                f.write_str("[ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(" ]")
            }
            JSValue::Object(map) => {
                f.write_str("{ ")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str(" }")
            }
            JSValue::Date(ms) => write!(f, "[Date {}]", ms),
            JSValue::RegExp { source, flags } => write!(f, "/{}/{}", source, flags),
            JSValue::Buffer(buffer) => write!(
                f,
                "[{} {} bytes]",
                buffer.kind().constructor_name(),
                buffer.byte_length()
            ),
            JSValue::Function(_) | JSValue::NativeFunction(_) => f.write_str("[Function]"),
            JSValue::Promise(_) => f.write_str("[Promise]"),
            JSValue::Ref(_) => f.write_str("[object Object]"),
            JSValue::Exported(object) => write!(f, "[object {}]", object.class_name()),
        }
    }
}

impl From<bool> for JSValue {
    fn from(value: bool) -> Self {
        JSValue::Bool(value)
    }
}

impl From<i32> for JSValue {
    fn from(value: i32) -> Self {
        JSValue::Int(value.into())
    }
}

impl From<i64> for JSValue {
    fn from(value: i64) -> Self {
        JSValue::Int(value)
    }
}

impl From<u32> for JSValue {
    fn from(value: u32) -> Self {
        JSValue::Int(value.into())
    }
}

impl From<f64> for JSValue {
    fn from(value: f64) -> Self {
        JSValue::Float(value)
    }
}

impl From<&str> for JSValue {
    fn from(value: &str) -> Self {
        JSValue::String(value.to_owned())
    }
}

impl From<String> for JSValue {
    fn from(value: String) -> Self {
        JSValue::String(value)
    }
}

impl From<Vec<JSValue>> for JSValue {
    fn from(value: Vec<JSValue>) -> Self {
        JSValue::Array(value)
    }
}

impl From<IndexMap<String, JSValue>> for JSValue {
    fn from(value: IndexMap<String, JSValue>) -> Self {
        JSValue::Object(value)
    }
}

impl From<ByteBuffer> for JSValue {
    fn from(value: ByteBuffer) -> Self {
        JSValue::Buffer(value)
    }
}

impl From<NativeFunction> for JSValue {
    fn from(value: NativeFunction) -> Self {
        JSValue::NativeFunction(value)
    }
}

impl From<NativeObject> for JSValue {
    fn from(value: NativeObject) -> Self {
        JSValue::Exported(value)
    }
}

// Manual Serialize implementation that errors on handle variants
impl Serialize for JSValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error;
        match self {
            JSValue::Undefined | JSValue::Null => serializer.serialize_none(),
            JSValue::Bool(b) => serializer.serialize_bool(*b),
            JSValue::Int(i) => serializer.serialize_i64(*i),
            JSValue::Float(f) => serializer.serialize_f64(*f),
            JSValue::String(s) => serializer.serialize_str(s),
            JSValue::Array(arr) => arr.serialize(serializer),
            JSValue::Object(obj) => obj.serialize(serializer),
            JSValue::Date(ms) => serializer.serialize_f64(*ms),
            JSValue::RegExp { source, flags } => {
                serializer.serialize_str(&format!("/{}/{}", source, flags))
            }
            JSValue::Buffer(buffer) => buffer.as_bytes().serialize(serializer),
            other => Err(Error::custom(format!(
                "Cannot serialize a live {} handle; snapshot it first",
                other.type_name()
            ))),
        }
    }
}

// Manual Deserialize implementation producing owned variants only
impl<'de> Deserialize<'de> for JSValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct JSValueVisitor;

        impl<'de> Visitor<'de> for JSValueVisitor {
            type Value = JSValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter
                    .write_str("a JavaScript value (null, bool, number, string, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(JSValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(JSValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                if value <= i64::MAX as u64 {
                    Ok(JSValue::Int(value as i64))
                } else {
                    Ok(JSValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(JSValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(JSValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(JSValue::String(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(JSValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(JSValue::Object(obj))
            }
        }

        deserializer.deserialize_any(JSValueVisitor)
    }
}

/// Element type of a projected byte buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    ArrayBuffer,
    DataView,
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl TypedArrayKind {
    pub const ALL: [TypedArrayKind; 13] = [
        TypedArrayKind::ArrayBuffer,
        TypedArrayKind::DataView,
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

    /// Size in bytes of one element.
    pub fn element_size(self) -> usize {
        match self {
            TypedArrayKind::ArrayBuffer
            | TypedArrayKind::DataView
            | TypedArrayKind::Int8
            | TypedArrayKind::Uint8
            | TypedArrayKind::Uint8Clamped => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::Float64 | TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => 8,
        }
    }

    /// Name of the global constructor for this kind.
    pub fn constructor_name(self) -> &'static str {
        match self {
            TypedArrayKind::ArrayBuffer => "ArrayBuffer",
            TypedArrayKind::DataView => "DataView",
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

    pub fn from_constructor_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.constructor_name() == name)
    }
}

/// Bytes backing an ArrayBuffer together with the view over them.
///
/// The whole backing buffer travels with the view so `byte_offset` and
/// `byte_length` survive a round trip exactly. Projecting into JavaScript moves
/// `bytes` into the engine without copying; use [`ByteBuffer::slice`] for an
/// explicit copy of a sub-range.
#[derive(Clone, Debug, PartialEq)]
pub struct ByteBuffer {
    kind: TypedArrayKind,
    bytes: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
}

impl ByteBuffer {
    /// View covering the whole buffer.
    pub fn new(kind: TypedArrayKind, bytes: Vec<u8>) -> Result<Self, BridgeError> {
        let len = bytes.len();
        Self::view(kind, bytes, 0, len)
    }

    /// `Uint8Array` over the whole buffer.
    pub fn uint8(bytes: Vec<u8>) -> Self {
        let byte_length = bytes.len();
        Self {
            kind: TypedArrayKind::Uint8,
            bytes,
            byte_offset: 0,
            byte_length,
        }
    }

    /// View over `bytes[byte_offset..byte_offset + byte_length]`.
    pub fn view(
        kind: TypedArrayKind,
        bytes: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
    ) -> Result<Self, BridgeError> {
        let end = byte_offset
            .checked_add(byte_length)
            .ok_or_else(|| BridgeError::Conversion("buffer view overflows".to_string()))?;
        if end > bytes.len() {
            return Err(BridgeError::Conversion(format!(
                "view {}..{} exceeds buffer of {} bytes",
                byte_offset,
                end,
                bytes.len()
            )));
        }
        if kind == TypedArrayKind::ArrayBuffer && (byte_offset != 0 || byte_length != bytes.len())
        {
            return Err(BridgeError::Conversion(
                "an ArrayBuffer cannot be a partial view".to_string(),
            ));
        }
        let size = kind.element_size();
        if byte_offset % size != 0 || byte_length % size != 0 {
            return Err(BridgeError::Conversion(format!(
                "{} view must be aligned to {} bytes",
                kind.constructor_name(),
                size
            )));
        }
        Ok(Self {
            kind,
            bytes,
            byte_offset,
            byte_length,
        })
    }

    pub fn kind(&self) -> TypedArrayKind {
        self.kind
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Number of elements in the view.
    pub fn len(&self) -> usize {
        self.byte_length / self.kind.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    /// The viewed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[self.byte_offset..self.byte_offset + self.byte_length]
    }

    /// The whole backing buffer.
    pub fn backing_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy of the element range `start..end` as a fresh buffer.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self, BridgeError> {
        let size = self.kind.element_size();
        if start > end || end > self.len() {
            return Err(BridgeError::Conversion(format!(
                "slice {}..{} out of range for {} elements",
                start,
                end,
                self.len()
            )));
        }
        let from = self.byte_offset + start * size;
        let to = self.byte_offset + end * size;
        Self::new(self.kind, self.bytes[from..to].to_vec())
    }

    pub(crate) fn into_parts(self) -> (TypedArrayKind, Vec<u8>, usize, usize) {
        (self.kind, self.bytes, self.byte_offset, self.byte_length)
    }
}

/// Tracks depth and size limits while copying values across the bridge.
///
/// This is used to enforce limits while traversing V8 values to prevent
/// excessive memory usage and stack overflow.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    /// Create a new limit tracker with the specified limits.
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    ///
    /// Returns an error if the depth limit is exceeded.
    pub fn enter(&mut self) -> Result<(), BridgeError> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(BridgeError::Conversion(format!(
                "Depth exceeded maximum limit of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    /// Exit a depth level.
    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    /// Add to the byte count.
    ///
    /// Returns an error if the size limit is exceeded.
    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), BridgeError> {
        self.current_bytes += bytes;
        if self.current_bytes > self.max_bytes {
            return Err(BridgeError::Conversion(format!(
                "Size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

impl Default for LimitTracker {
    fn default() -> Self {
        Self::new(MAX_JS_DEPTH, MAX_JS_BYTES)
    }
}
