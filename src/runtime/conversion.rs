//! Projection between V8 values and [`JSValue`].
//!
//! Owned variants are copied with cycle detection and the depth/size limits of
//! [`LimitTracker`]. Functions, promises and other objects become handles into
//! the group's handle table; native functions and exported objects go through
//! the per-context identity cache in [`BridgeState`].

use crate::runtime::bridge;
use crate::runtime::context::ContextId;
use crate::runtime::error::BridgeError;
use crate::runtime::handle::{HandleInner, JsFunction, JsObject, JsPromise};
use crate::runtime::js_value::{ByteBuffer, JSValue, LimitTracker, TypedArrayKind, MAX_JS_BYTES};
use crate::runtime::runner::BridgeState;
use deno_core::v8;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

/// How JS objects without a dedicated variant are projected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Projection {
    /// Plain objects become `Ref` handles that read and write through.
    Live,
    /// Plain objects are copied into `Object` maps; functions and promises are rejected.
    Copy,
}

fn conversion_error(message: impl Into<String>) -> BridgeError {
    BridgeError::Conversion(message.into())
}

fn new_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> Result<v8::Local<'s, v8::String>, BridgeError> {
    if value.len() > MAX_JS_BYTES {
        return Err(conversion_error(format!(
            "String size limit exceeded: {} > {}",
            value.len(),
            MAX_JS_BYTES
        )));
    }
    v8::String::new(scope, value).ok_or_else(|| conversion_error("Failed to allocate string"))
}

fn global_constructor<'s>(
    scope: &mut v8::HandleScope<'s>,
    name: &str,
) -> Result<v8::Local<'s, v8::Function>, BridgeError> {
    let global = scope.get_current_context().global(scope);
    let key = new_string(scope, name)?;
    global
        .get(scope, key.into())
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| conversion_error(format!("{} constructor is unavailable", name)))
}

/// Convert a native value into a V8 value in the current context.
pub(crate) fn to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    value: JSValue,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    let mut tracker = LimitTracker::default();
    to_v8_internal(scope, state, context_id, value, &mut tracker)
}

fn to_v8_internal<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    value: JSValue,
    tracker: &mut LimitTracker,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    tracker.enter()?;

    let result = match value {
        JSValue::Undefined => Ok(v8::undefined(scope).into()),
        JSValue::Null => Ok(v8::null(scope).into()),
        JSValue::Bool(b) => Ok(v8::Boolean::new(scope, b).into()),
        JSValue::Int(i) => Ok(v8::Number::new(scope, i as f64).into()),
        JSValue::Float(f) => Ok(v8::Number::new(scope, f).into()),
        JSValue::String(s) => {
            tracker.add_bytes(s.len())?;
            Ok(new_string(scope, &s)?.into())
        }
        JSValue::Array(items) => {
            let array = v8::Array::new(scope, items.len() as i32);
            for (index, item) in items.into_iter().enumerate() {
                let item = to_v8_internal(scope, state, context_id, item, tracker)?;
                array.set_index(scope, index as u32, item);
            }
            Ok(array.into())
        }
        JSValue::Object(map) => {
            let object = v8::Object::new(scope);
            for (key, item) in map {
                tracker.add_bytes(key.len())?;
                let key = new_string(scope, &key)?;
                let item = to_v8_internal(scope, state, context_id, item, tracker)?;
                object.set(scope, key.into(), item);
            }
            Ok(object.into())
        }
        JSValue::Date(ms) => v8::Date::new(scope, ms)
            .map(Into::into)
            .ok_or_else(|| conversion_error("Failed to create Date")),
        JSValue::RegExp { source, flags } => {
            let ctor = global_constructor(scope, "RegExp")?;
            let source = new_string(scope, &source)?;
            let flags = new_string(scope, &flags)?;
            ctor.new_instance(scope, &[source.into(), flags.into()])
                .map(Into::into)
                .ok_or_else(|| conversion_error("Invalid regular expression"))
        }
        JSValue::Buffer(buffer) => buffer_to_v8(scope, buffer),
        JSValue::Function(function) => handle_to_v8(scope, state, &function.inner),
        JSValue::Promise(promise) => handle_to_v8(scope, state, &promise.inner),
        JSValue::Ref(object) => handle_to_v8(scope, state, &object.inner),
        JSValue::NativeFunction(function) => {
            bridge::project_function(scope, state, context_id, &function)
        }
        JSValue::Exported(object) => bridge::project_object(scope, state, context_id, &object),
    };

    tracker.exit();
    result
}

fn handle_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    handle: &HandleInner,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    if handle.group_id() != state.group_id() {
        return Err(BridgeError::ForeignGroup);
    }
    state
        .handles
        .borrow()
        .get(scope, handle.id())
        .map(Into::into)
        .ok_or(BridgeError::StaleReference)
}

/// Moves the bytes into a new `ArrayBuffer` and builds the declared view over it.
fn buffer_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    buffer: ByteBuffer,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    let (kind, bytes, byte_offset, byte_length) = buffer.into_parts();
    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
    let array_buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
    if kind == TypedArrayKind::ArrayBuffer {
        return Ok(array_buffer.into());
    }

    let ctor = global_constructor(scope, kind.constructor_name())?;
    let offset = v8::Number::new(scope, byte_offset as f64);
    // DataView takes a byte length, typed arrays an element count
    let length = if kind == TypedArrayKind::DataView {
        byte_length
    } else {
        byte_length / kind.element_size()
    };
    let length = v8::Number::new(scope, length as f64);
    ctor.new_instance(scope, &[array_buffer.into(), offset.into(), length.into()])
        .map(Into::into)
        .ok_or_else(|| conversion_error(format!("Failed to create {}", kind.constructor_name())))
}

/// Convert a V8 value into a native value, keeping plain objects live.
pub(crate) fn from_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    value: v8::Local<'s, v8::Value>,
) -> Result<JSValue, BridgeError> {
    from_v8_with(scope, state, context_id, value, Projection::Live)
}

pub(crate) fn from_v8_with<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    value: v8::Local<'s, v8::Value>,
    projection: Projection,
) -> Result<JSValue, BridgeError> {
    let mut seen = HashSet::new();
    let mut tracker = LimitTracker::default();
    let mut converter = Converter {
        state,
        context_id,
        projection,
        seen: &mut seen,
        tracker: &mut tracker,
    };
    converter.convert(scope, value)
}

struct Converter<'a> {
    state: &'a BridgeState,
    context_id: ContextId,
    projection: Projection,
    seen: &'a mut HashSet<i32>,
    tracker: &'a mut LimitTracker,
}

impl Converter<'_> {
    fn convert<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<JSValue, BridgeError> {
        self.tracker.enter()?;
        let result = self.convert_inner(scope, value);
        self.tracker.exit();
        result
    }

    fn convert_inner<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<JSValue, BridgeError> {
        if value.is_undefined() {
            self.tracker.add_bytes(4)?;
            return Ok(JSValue::Undefined);
        }
        if value.is_null() {
            self.tracker.add_bytes(4)?;
            return Ok(JSValue::Null);
        }
        if value.is_boolean() {
            self.tracker.add_bytes(5)?;
            return Ok(JSValue::Bool(value.boolean_value(scope)));
        }
        if value.is_number() {
            // Handle special numeric values (NaN, ±Infinity)
            let number = value
                .number_value(scope)
                .ok_or_else(|| conversion_error("Failed to convert value to number"))?;
            self.tracker.add_bytes(8)?;
            if number.is_finite() && number.fract() == 0.0 {
                let as_int = number as i64;
                if as_int as f64 == number {
                    return Ok(JSValue::Int(as_int));
                }
            }
            return Ok(JSValue::Float(number));
        }
        if value.is_string() {
            let string = value.to_rust_string_lossy(scope);
            self.tracker.add_bytes(string.len())?;
            return Ok(JSValue::String(string));
        }
        if value.is_big_int() {
            let bigint = v8::Local::<v8::BigInt>::try_from(value)
                .map_err(|_| conversion_error("Failed to cast to BigInt"))?;
            self.tracker.add_bytes(8)?;
            let (int, lossless) = bigint.i64_value();
            if lossless {
                return Ok(JSValue::Int(int));
            }
            let text = value.to_rust_string_lossy(scope);
            return text
                .parse::<f64>()
                .map(JSValue::Float)
                .map_err(|_| conversion_error("BigInt value cannot be represented"));
        }
        if value.is_symbol() {
            return Err(conversion_error("Cannot convert a JavaScript symbol"));
        }

        let object = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| conversion_error("Unsupported JavaScript value"))?;

        if let Some(native) = self.state.unwrap_native(scope, self.context_id, object) {
            self.tracker.add_bytes(8)?;
            return Ok(native);
        }
        if value.is_function() {
            self.require_live("function")?;
            self.tracker.add_bytes(8)?;
            return Ok(JSValue::Function(JsFunction::from_inner(
                self.acquire(scope, object)?,
            )));
        }
        if value.is_promise() {
            self.require_live("promise")?;
            self.tracker.add_bytes(8)?;
            return Ok(JSValue::Promise(JsPromise::from_inner(
                self.acquire(scope, object)?,
            )));
        }
        if value.is_array() {
            return self.convert_array(scope, value, object);
        }
        if value.is_date() {
            let date = v8::Local::<v8::Date>::try_from(value)
                .map_err(|_| conversion_error("Failed to cast to Date"))?;
            self.tracker.add_bytes(8)?;
            return Ok(JSValue::Date(date.value_of()));
        }
        if value.is_reg_exp() {
            let source = read_string_property(scope, object, "source")?;
            let flags = read_string_property(scope, object, "flags")?;
            self.tracker.add_bytes(source.len() + flags.len())?;
            return Ok(JSValue::RegExp { source, flags });
        }
        if value.is_array_buffer() || value.is_array_buffer_view() {
            return self.convert_buffer(scope, value);
        }

        match self.projection {
            Projection::Live => {
                self.tracker.add_bytes(8)?;
                Ok(JSValue::Ref(JsObject::from_inner(self.acquire(scope, object)?)))
            }
            Projection::Copy => self.convert_object(scope, object),
        }
    }

    fn require_live(&self, what: &str) -> Result<(), BridgeError> {
        match self.projection {
            Projection::Live => Ok(()),
            Projection::Copy => Err(conversion_error(format!("Cannot copy a {}", what))),
        }
    }

    fn acquire<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
    ) -> Result<Arc<HandleInner>, BridgeError> {
        let context = self
            .state
            .context_shared(self.context_id)
            .ok_or(BridgeError::Terminated)?;
        let id = self.state.handles.borrow_mut().acquire(scope, object);
        Ok(HandleInner::new(context, id))
    }

    fn convert_array<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        object: v8::Local<'s, v8::Object>,
    ) -> Result<JSValue, BridgeError> {
        // Check for circular reference using identity hash
        let hash = object.get_identity_hash().get();
        if !self.seen.insert(hash) {
            return Err(conversion_error("Cannot convert circular reference"));
        }

        let array = v8::Local::<v8::Array>::try_from(value)
            .map_err(|_| conversion_error("Failed to cast to array"))?;
        let len = array.length() as usize;
        self.tracker
            .add_bytes(16 + len.saturating_mul(std::mem::size_of::<usize>()))?;

        let mut items = Vec::with_capacity(len);
        for index in 0..len {
            let item = array
                .get_index(scope, index as u32)
                .ok_or_else(|| conversion_error(format!("Failed to get array index {}", index)))?;
            items.push(self.convert(scope, item)?);
        }

        self.seen.remove(&hash);
        Ok(JSValue::Array(items))
    }

    fn convert_object<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
    ) -> Result<JSValue, BridgeError> {
        let hash = object.get_identity_hash().get();
        if !self.seen.insert(hash) {
            return Err(conversion_error("Cannot convert circular reference"));
        }

        let names = object
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| conversion_error("Failed to get property names"))?;

        let mut map = IndexMap::with_capacity(names.length() as usize);
        for index in 0..names.length() {
            let key = names
                .get_index(scope, index)
                .ok_or_else(|| conversion_error("Failed to get property name"))?;
            let key_str = key.to_rust_string_lossy(scope);
            let item = object
                .get(scope, key)
                .ok_or_else(|| conversion_error(format!("Failed to get property '{}'", key_str)))?;
            self.tracker.add_bytes(key_str.len())?;
            let item = self.convert(scope, item)?;
            map.insert(key_str, item);
        }

        self.seen.remove(&hash);
        Ok(JSValue::Object(map))
    }

    fn convert_buffer<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<JSValue, BridgeError> {
        let (kind, array_buffer, byte_offset, byte_length) = if value.is_array_buffer() {
            let array_buffer = v8::Local::<v8::ArrayBuffer>::try_from(value)
                .map_err(|_| conversion_error("Failed to cast to ArrayBuffer"))?;
            let len = array_buffer.byte_length();
            (TypedArrayKind::ArrayBuffer, array_buffer, 0, len)
        } else {
            let view = v8::Local::<v8::ArrayBufferView>::try_from(value)
                .map_err(|_| conversion_error("Failed to cast to ArrayBufferView"))?;
            let array_buffer = view
                .buffer(scope)
                .ok_or_else(|| conversion_error("View has no backing ArrayBuffer"))?;
            (view_kind(value), array_buffer, view.byte_offset(), view.byte_length())
        };

        let total = array_buffer.byte_length();
        self.tracker.add_bytes(total)?;
        let mut bytes = vec![0_u8; total];
        if total > 0 {
            let whole = v8::Uint8Array::new(scope, array_buffer, 0, total)
                .ok_or_else(|| conversion_error("Failed to read ArrayBuffer"))?;
            whole.copy_contents(&mut bytes);
        }
        ByteBuffer::view(kind, bytes, byte_offset, byte_length).map(JSValue::Buffer)
    }
}

fn view_kind(value: v8::Local<v8::Value>) -> TypedArrayKind {
    if value.is_data_view() {
        TypedArrayKind::DataView
    } else if value.is_int8_array() {
        TypedArrayKind::Int8
    } else if value.is_uint8_clamped_array() {
        TypedArrayKind::Uint8Clamped
    } else if value.is_int16_array() {
        TypedArrayKind::Int16
    } else if value.is_uint16_array() {
        TypedArrayKind::Uint16
    } else if value.is_int32_array() {
        TypedArrayKind::Int32
    } else if value.is_uint32_array() {
        TypedArrayKind::Uint32
    } else if value.is_float32_array() {
        TypedArrayKind::Float32
    } else if value.is_float64_array() {
        TypedArrayKind::Float64
    } else if value.is_big_int64_array() {
        TypedArrayKind::BigInt64
    } else if value.is_big_uint64_array() {
        TypedArrayKind::BigUint64
    } else {
        TypedArrayKind::Uint8
    }
}

fn read_string_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Result<String, BridgeError> {
    let key = new_string(scope, name)?;
    object
        .get(scope, key.into())
        .map(|value| value.to_rust_string_lossy(scope))
        .ok_or_else(|| conversion_error(format!("Failed to read '{}'", name)))
}
