//! Native functions and exported objects projected into JavaScript.
//!
//! A [`NativeFunction`] becomes a JS function whose calls run the native
//! callback on the group thread. A [`NativeObject`] is a descriptor table of
//! named members built once with [`NativeObject::builder`]; its JS projection
//! routes every property read and write back to that table so attribute flags
//! hold the same way from both sides.

use crate::runtime::context::ContextId;
use crate::runtime::conversion;
use crate::runtime::error::BridgeError;
use crate::runtime::js_value::JSValue;
use crate::runtime::runner::{self, BridgeState};
use crate::runtime::scope::JsScope;
use bitflags::bitflags;
use deno_core::v8;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// Property attribute flags. Each flag is independent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PropertyAttributes: u8 {
        const READ_ONLY = 0b001;
        const DONT_ENUM = 0b010;
        const DONT_DELETE = 0b100;
    }
}

impl PropertyAttributes {
    pub const NONE: PropertyAttributes = PropertyAttributes::empty();

    pub fn is_writable(self) -> bool {
        !self.contains(Self::READ_ONLY)
    }

    pub fn is_enumerable(self) -> bool {
        !self.contains(Self::DONT_ENUM)
    }

    pub fn is_deletable(self) -> bool {
        !self.contains(Self::DONT_DELETE)
    }

    pub(crate) fn to_v8(self) -> v8::PropertyAttribute {
        let mut attr = v8::PropertyAttribute::NONE;
        if self.contains(Self::READ_ONLY) {
            attr = attr | v8::PropertyAttribute::READ_ONLY;
        }
        if self.contains(Self::DONT_ENUM) {
            attr = attr | v8::PropertyAttribute::DONT_ENUM;
        }
        if self.contains(Self::DONT_DELETE) {
            attr = attr | v8::PropertyAttribute::DONT_DELETE;
        }
        attr
    }
}

static NEXT_NATIVE_ID: AtomicU64 = AtomicU64::new(1);

fn next_native_id() -> u64 {
    NEXT_NATIVE_ID.fetch_add(1, Ordering::Relaxed)
}

type NativeCallback =
    dyn Fn(&mut JsScope<'_, '_>, Vec<JSValue>) -> Result<JSValue, BridgeError> + Send + Sync;

/// Native callable exposed to JavaScript as a function.
#[derive(Clone)]
pub struct NativeFunction {
    inner: Arc<NativeFunctionInner>,
}

struct NativeFunctionInner {
    id: u64,
    name: String,
    callback: Box<NativeCallback>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&mut JsScope<'_, '_>, Vec<JSValue>) -> Result<JSValue, BridgeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: Arc::new(NativeFunctionInner {
                id: next_native_id(),
                name: name.into(),
                callback: Box::new(callback),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run the callback directly. Only reachable with a live [`JsScope`], so
    /// always on the owning group thread.
    pub fn call(&self, scope: &mut JsScope<'_, '_>, args: Vec<JSValue>) -> Result<JSValue, BridgeError> {
        (self.inner.callback)(scope, args)
    }
}

impl PartialEq for NativeFunction {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Declared type of an exported method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Number,
    String,
    Array,
    Object,
    Function,
    Buffer,
}

impl ParamType {
    fn name(self) -> &'static str {
        match self {
            ParamType::Any => "any",
            ParamType::Bool => "boolean",
            ParamType::Int => "integer",
            ParamType::Number => "number",
            ParamType::String => "string",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Function => "function",
            ParamType::Buffer => "buffer",
        }
    }

    /// Coerce `value` the way a JS caller would expect a native parameter of
    /// this type to accept it.
    pub fn coerce(self, index: usize, value: JSValue) -> Result<JSValue, BridgeError> {
        let fail = || BridgeError::Coercion {
            index,
            expected: self.name(),
        };
        match self {
            ParamType::Any => Ok(value),
            ParamType::Bool => Ok(JSValue::Bool(value.is_truthy())),
            ParamType::Int => {
                let number = to_number(&value).ok_or_else(fail)?;
                if !number.is_finite() {
                    return Err(fail());
                }
                Ok(JSValue::Int(number.trunc() as i64))
            }
            ParamType::Number => match value {
                JSValue::Undefined => Ok(JSValue::Float(f64::NAN)),
                other => to_number(&other).map(JSValue::Float).ok_or_else(fail),
            },
            ParamType::String => match value {
                JSValue::String(_) => Ok(value),
                JSValue::Int(_) | JSValue::Float(_) | JSValue::Bool(_) | JSValue::Null => {
                    Ok(JSValue::String(value.to_string()))
                }
                _ => Err(fail()),
            },
            ParamType::Array => match value {
                JSValue::Array(_) => Ok(value),
                _ => Err(fail()),
            },
            ParamType::Object => match value {
                JSValue::Object(_) | JSValue::Ref(_) | JSValue::Exported(_) => Ok(value),
                _ => Err(fail()),
            },
            ParamType::Function => match value {
                JSValue::Function(_) | JSValue::NativeFunction(_) => Ok(value),
                _ => Err(fail()),
            },
            ParamType::Buffer => match value {
                JSValue::Buffer(_) => Ok(value),
                _ => Err(fail()),
            },
        }
    }
}

fn to_number(value: &JSValue) -> Option<f64> {
    match value {
        JSValue::Int(i) => Some(*i as f64),
        JSValue::Float(f) => Some(*f),
        JSValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        JSValue::Null => Some(0.0),
        JSValue::Date(ms) => Some(*ms),
        JSValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

/// Coerce call arguments to declared parameter types.
///
/// Missing arguments coerce from `undefined`; extra arguments pass through
/// unchanged.
pub fn coerce_args(params: &[ParamType], args: Vec<JSValue>) -> Result<Vec<JSValue>, BridgeError> {
    let count = params.len().max(args.len());
    let mut args = args.into_iter();
    let mut coerced = Vec::with_capacity(count);
    for index in 0..count {
        let value = args.next().unwrap_or_default();
        match params.get(index) {
            Some(param) => coerced.push(param.coerce(index, value)?),
            None => coerced.push(value),
        }
    }
    Ok(coerced)
}

type Getter = dyn Fn() -> JSValue + Send + Sync;
type Setter = dyn Fn(JSValue) + Send + Sync;

enum MemberKind {
    Value(Mutex<JSValue>),
    Accessor {
        getter: Box<Getter>,
        setter: Option<Box<Setter>>,
    },
    Method(NativeFunction),
}

struct Member {
    name: String,
    attrs: PropertyAttributes,
    kind: MemberKind,
}

impl Member {
    fn read(&self) -> JSValue {
        match &self.kind {
            MemberKind::Value(value) => value.lock().clone(),
            MemberKind::Accessor { getter, .. } => getter(),
            MemberKind::Method(function) => JSValue::NativeFunction(function.clone()),
        }
    }

    fn write(&self, value: JSValue) -> bool {
        if !self.attrs.is_writable() {
            return false;
        }
        match &self.kind {
            MemberKind::Value(slot) => {
                *slot.lock() = value;
                true
            }
            MemberKind::Accessor {
                setter: Some(setter),
                ..
            } => {
                setter(value);
                true
            }
            MemberKind::Accessor { setter: None, .. } | MemberKind::Method(_) => false,
        }
    }
}

/// Native object exported to JavaScript through a descriptor table.
#[derive(Clone)]
pub struct NativeObject {
    inner: Arc<NativeObjectInner>,
}

struct NativeObjectInner {
    id: u64,
    class_name: String,
    members: Vec<Member>,
}

impl NativeObject {
    pub fn builder(class_name: impl Into<String>) -> NativeObjectBuilder {
        NativeObjectBuilder {
            class_name: class_name.into(),
            members: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.inner.members.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn attributes(&self, name: &str) -> Option<PropertyAttributes> {
        self.member(name).map(|m| m.attrs)
    }

    /// Read a member. Methods read as their [`NativeFunction`].
    pub fn get(&self, name: &str) -> Option<JSValue> {
        self.member(name).map(Member::read)
    }

    /// Write a member. Returns `Ok(false)` when the member is read-only.
    pub fn set(&self, name: &str, value: impl Into<JSValue>) -> Result<bool, BridgeError> {
        let member = self.member(name).ok_or_else(|| {
            BridgeError::native(format!(
                "{} has no exported member '{}'",
                self.inner.class_name, name
            ))
        })?;
        Ok(member.write(value.into()))
    }

    fn member(&self, name: &str) -> Option<&Member> {
        self.inner.members.iter().find(|m| m.name == name)
    }

    fn member_at(&self, index: usize) -> Option<&Member> {
        self.inner.members.get(index)
    }
}

impl PartialEq for NativeObject {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeObject")
            .field("id", &self.inner.id)
            .field("class_name", &self.inner.class_name)
            .field("members", &self.member_names())
            .finish()
    }
}

/// Builder for the descriptor table of a [`NativeObject`].
pub struct NativeObjectBuilder {
    class_name: String,
    members: Vec<Member>,
}

impl NativeObjectBuilder {
    fn push(mut self, member: Member) -> Self {
        self.members.retain(|m| m.name != member.name);
        self.members.push(member);
        self
    }

    /// Stored value member.
    pub fn value(
        self,
        name: impl Into<String>,
        value: impl Into<JSValue>,
        attrs: PropertyAttributes,
    ) -> Self {
        self.push(Member {
            name: name.into(),
            attrs,
            kind: MemberKind::Value(Mutex::new(value.into())),
        })
    }

    /// Read-only computed member.
    pub fn property<G>(self, name: impl Into<String>, getter: G, attrs: PropertyAttributes) -> Self
    where
        G: Fn() -> JSValue + Send + Sync + 'static,
    {
        self.push(Member {
            name: name.into(),
            attrs: attrs | PropertyAttributes::READ_ONLY,
            kind: MemberKind::Accessor {
                getter: Box::new(getter),
                setter: None,
            },
        })
    }

    /// Computed member with a setter. `READ_ONLY` in `attrs` still wins.
    pub fn property_with_setter<G, S>(
        self,
        name: impl Into<String>,
        getter: G,
        setter: S,
        attrs: PropertyAttributes,
    ) -> Self
    where
        G: Fn() -> JSValue + Send + Sync + 'static,
        S: Fn(JSValue) + Send + Sync + 'static,
    {
        self.push(Member {
            name: name.into(),
            attrs,
            kind: MemberKind::Accessor {
                getter: Box::new(getter),
                setter: Some(Box::new(setter)),
            },
        })
    }

    /// Method whose arguments are coerced to `params` before `callback` runs.
    pub fn method<F>(self, name: impl Into<String>, params: &[ParamType], callback: F) -> Self
    where
        F: Fn(&mut JsScope<'_, '_>, Vec<JSValue>) -> Result<JSValue, BridgeError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let params = params.to_vec();
        let function = NativeFunction::new(name.clone(), move |scope, args| {
            let args = coerce_args(&params, args)?;
            callback(scope, args)
        });
        self.push(Member {
            name,
            attrs: PropertyAttributes::READ_ONLY,
            kind: MemberKind::Method(function),
        })
    }

    pub fn build(self) -> NativeObject {
        NativeObject {
            inner: Arc::new(NativeObjectInner {
                id: next_native_id(),
                class_name: self.class_name,
                members: self.members,
            }),
        }
    }
}

/// Target of a projected JS function.
#[derive(Clone)]
pub(crate) enum Callable {
    Function(NativeFunction),
    Get(NativeObject, usize),
    Set(NativeObject, usize),
}

impl Callable {
    fn invoke(&self, scope: &mut JsScope<'_, '_>, args: Vec<JSValue>) -> Result<JSValue, BridgeError> {
        match self {
            Callable::Function(function) => function.call(scope, args),
            Callable::Get(object, index) => Ok(object
                .member_at(*index)
                .map(Member::read)
                .unwrap_or_default()),
            Callable::Set(object, index) => {
                // Rejected writes are dropped so strict-mode scripts do not throw.
                if let Some(member) = object.member_at(*index) {
                    member.write(args.into_iter().next().unwrap_or_default());
                }
                Ok(JSValue::Undefined)
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct CallableEntry {
    pub(crate) context_id: ContextId,
    pub(crate) callable: Callable,
}

fn new_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> Result<v8::Local<'s, v8::String>, BridgeError> {
    v8::String::new(scope, value)
        .ok_or_else(|| BridgeError::Conversion("Failed to allocate string".to_string()))
}

fn build_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    name: &str,
    callable: Callable,
) -> Result<(u32, v8::Local<'s, v8::Function>), BridgeError> {
    let id = state.register_callable(CallableEntry {
        context_id,
        callable,
    });
    let data = v8::Number::new(scope, f64::from(id));
    let Some(function) = v8::Function::builder(native_trampoline)
        .data(data.into())
        .build(scope)
    else {
        state.forget_callables(&[id]);
        return Err(BridgeError::Conversion(format!("Failed to create function '{}'", name)));
    };
    state.track_callable(scope, id, function);
    let name = new_string(scope, name)?;
    function.set_name(name);
    Ok((id, function))
}

/// JS function for `function` in `context_id`, created once per context.
pub(crate) fn project_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    function: &NativeFunction,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    if let Some(existing) = state.cached_native(scope, context_id, function.id()) {
        return Ok(existing.into());
    }
    let (_, projected) = build_function(
        scope,
        state,
        context_id,
        function.name(),
        Callable::Function(function.clone()),
    )?;
    let object: v8::Local<v8::Object> = projected.into();
    state.cache_native(
        scope,
        context_id,
        function.id(),
        object,
        JSValue::NativeFunction(function.clone()),
    );
    Ok(projected.into())
}

/// Uncached JS function for one-shot callbacks such as promise reactions.
///
/// Returns the callable id so the caller can release it once it has run.
pub(crate) fn build_transient<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    function: &NativeFunction,
) -> Result<(u32, v8::Local<'s, v8::Function>), BridgeError> {
    build_function(
        scope,
        state,
        context_id,
        function.name(),
        Callable::Function(function.clone()),
    )
}

/// JS object backed by the descriptor table of `object`, created once per context.
pub(crate) fn project_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: &BridgeState,
    context_id: ContextId,
    object: &NativeObject,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    if let Some(existing) = state.cached_native(scope, context_id, object.id()) {
        return Ok(existing.into());
    }

    let target = v8::Object::new(scope);
    let global = scope.get_current_context().global(scope);
    let object_ctor_key = new_string(scope, "Object")?;
    let define_key = new_string(scope, "defineProperty")?;
    let define = global
        .get(scope, object_ctor_key.into())
        .and_then(|ctor| v8::Local::<v8::Object>::try_from(ctor).ok())
        .and_then(|ctor| ctor.get(scope, define_key.into()))
        .and_then(|f| v8::Local::<v8::Function>::try_from(f).ok())
        .ok_or_else(|| BridgeError::Conversion("Object.defineProperty is unavailable".to_string()))?;

    for (index, member) in object.inner.members.iter().enumerate() {
        let (_, getter) = build_function(
            scope,
            state,
            context_id,
            &format!("get {}", member.name),
            Callable::Get(object.clone(), index),
        )?;
        let (_, setter) = build_function(
            scope,
            state,
            context_id,
            &format!("set {}", member.name),
            Callable::Set(object.clone(), index),
        )?;

        let descriptor = v8::Object::new(scope);
        let entries: [(&str, v8::Local<v8::Value>); 4] = [
            ("get", getter.into()),
            ("set", setter.into()),
            (
                "enumerable",
                v8::Boolean::new(scope, member.attrs.is_enumerable()).into(),
            ),
            (
                "configurable",
                v8::Boolean::new(scope, member.attrs.is_deletable()).into(),
            ),
        ];
        for (key, value) in entries {
            let key = new_string(scope, key)?;
            descriptor.set(scope, key.into(), value);
        }

        let name = new_string(scope, &member.name)?;
        let undefined = v8::undefined(scope).into();
        define
            .call(scope, undefined, &[target.into(), name.into(), descriptor.into()])
            .ok_or_else(|| {
                BridgeError::Conversion(format!("Failed to export member '{}'", member.name))
            })?;
    }

    state.cache_native(
        scope,
        context_id,
        object.id(),
        target,
        JSValue::Exported(object.clone()),
    );
    Ok(target.into())
}

/// Throw `err` into the running script as an `Error` or `TypeError`.
pub(crate) fn throw_error(scope: &mut v8::HandleScope, err: &BridgeError) {
    let text = match err {
        BridgeError::Script(exception) => exception.message.clone(),
        other => other.to_string(),
    };
    let message = v8::String::new(scope, &text).unwrap_or_else(|| v8::String::empty(scope));
    let exception = match err {
        BridgeError::Coercion { .. } => v8::Exception::type_error(scope, message),
        _ => v8::Exception::error(scope, message),
    };
    scope.throw_exception(exception);
}

fn native_trampoline<'a>(
    scope: &mut v8::HandleScope<'a>,
    args: v8::FunctionCallbackArguments<'a>,
    mut rv: v8::ReturnValue,
) {
    let Some(state) = scope.get_slot::<Rc<BridgeState>>().cloned() else {
        throw_error(scope, &BridgeError::Terminated);
        return;
    };
    let entry = args
        .data()
        .uint32_value(scope)
        .and_then(|id| state.callable(id));
    let Some(entry) = entry else {
        throw_error(scope, &BridgeError::StaleReference);
        return;
    };

    let mut argv = Vec::with_capacity(args.length().max(0) as usize);
    for index in 0..args.length() {
        match conversion::from_v8(scope, &state, entry.context_id, args.get(index)) {
            Ok(value) => argv.push(value),
            Err(err) => {
                throw_error(scope, &err);
                return;
            }
        }
    }

    let outcome = runner::with_active_scope(scope, |scope| {
        let mut js_scope = JsScope::new(scope, &state, entry.context_id);
        panic::catch_unwind(AssertUnwindSafe(|| {
            entry.callable.invoke(&mut js_scope, argv)
        }))
    });
    let result = outcome.unwrap_or_else(|_| {
        tracing::error!("native callback panicked");
        Err(BridgeError::native("native callback panicked"))
    });

    match result.and_then(|value| conversion::to_v8(scope, &state, entry.context_id, value)) {
        Ok(value) => rv.set(value),
        Err(err) => {
            // process.exit() unwinds the script through termination, not an exception
            let terminating =
                scope.is_execution_terminating() || matches!(err, BridgeError::Terminated);
            if !terminating {
                throw_error(scope, &err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_object() -> (NativeObject, Arc<Mutex<i64>>) {
        let count = Arc::new(Mutex::new(0_i64));
        let read = count.clone();
        let write = count.clone();
        let object = NativeObject::builder("Counter")
            .value("name", "counter", PropertyAttributes::READ_ONLY)
            .value("label", "draft", PropertyAttributes::NONE)
            .property_with_setter(
                "count",
                move || JSValue::Int(*read.lock()),
                move |value| {
                    if let Some(n) = value.as_i64() {
                        *write.lock() = n;
                    }
                },
                PropertyAttributes::DONT_DELETE,
            )
            .property("doubled", || JSValue::Int(2), PropertyAttributes::DONT_ENUM)
            .method("add", &[ParamType::Int, ParamType::Int], |_scope, args| {
                let a = args[0].as_i64().unwrap_or(0);
                let b = args[1].as_i64().unwrap_or(0);
                Ok(JSValue::Int(a + b))
            })
            .build();
        (object, count)
    }

    #[test]
    fn test_read_only_members_reject_native_writes() {
        let (object, _) = counter_object();
        assert_eq!(object.set("name", "other").unwrap(), false);
        assert_eq!(object.get("name"), Some(JSValue::String("counter".into())));
        assert_eq!(object.set("doubled", 4).unwrap(), false);
        assert_eq!(object.set("add", 1).unwrap(), false);
        assert!(object.set("missing", 1).is_err());
    }

    #[test]
    fn test_writable_members_update_native_state() {
        let (object, count) = counter_object();
        assert!(object.set("count", 7).unwrap());
        assert_eq!(*count.lock(), 7);
        assert_eq!(object.get("count"), Some(JSValue::Int(7)));

        assert!(object.set("label", "final").unwrap());
        assert_eq!(object.get("label"), Some(JSValue::String("final".into())));
    }

    #[test]
    fn test_attributes_are_independent() {
        let (object, _) = counter_object();
        let count = object.attributes("count").unwrap();
        assert!(count.is_writable() && count.is_enumerable() && !count.is_deletable());

        let doubled = object.attributes("doubled").unwrap();
        assert!(!doubled.is_writable() && !doubled.is_enumerable() && doubled.is_deletable());

        assert!(matches!(object.get("add"), Some(JSValue::NativeFunction(_))));
    }

    #[test]
    fn test_builder_replaces_duplicate_members() {
        let object = NativeObject::builder("Dup")
            .value("x", 1, PropertyAttributes::NONE)
            .value("x", 2, PropertyAttributes::NONE)
            .build();
        assert_eq!(object.member_names(), vec!["x"]);
        assert_eq!(object.get("x"), Some(JSValue::Int(2)));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(
            ParamType::Int.coerce(0, JSValue::String(" 42 ".into())).unwrap(),
            JSValue::Int(42)
        );
        assert_eq!(ParamType::Int.coerce(0, JSValue::Float(3.9)).unwrap(), JSValue::Int(3));
        assert_eq!(ParamType::Int.coerce(0, JSValue::Bool(true)).unwrap(), JSValue::Int(1));
        assert!(matches!(
            ParamType::Int.coerce(2, JSValue::String("abc".into())),
            Err(BridgeError::Coercion { index: 2, expected: "integer" })
        ));
        assert!(ParamType::Int.coerce(0, JSValue::Undefined).is_err());
        assert!(matches!(
            ParamType::Number.coerce(0, JSValue::Undefined).unwrap(),
            JSValue::Float(f) if f.is_nan()
        ));
    }

    #[test]
    fn test_string_and_shape_coercion() {
        assert_eq!(
            ParamType::String.coerce(0, JSValue::Int(5)).unwrap(),
            JSValue::String("5".into())
        );
        assert!(ParamType::String.coerce(0, JSValue::Undefined).is_err());
        assert_eq!(
            ParamType::Bool.coerce(0, JSValue::String(String::new())).unwrap(),
            JSValue::Bool(false)
        );
        assert!(ParamType::Array.coerce(0, JSValue::Null).is_err());
        assert!(ParamType::Function.coerce(0, JSValue::Int(1)).is_err());
    }

    #[test]
    fn test_coerce_args_fills_missing_and_keeps_extra() {
        let args = coerce_args(
            &[ParamType::Any, ParamType::Bool],
            vec![JSValue::Int(1), JSValue::Int(0), JSValue::String("extra".into())],
        )
        .unwrap();
        assert_eq!(
            args,
            vec![
                JSValue::Int(1),
                JSValue::Bool(false),
                JSValue::String("extra".into())
            ]
        );

        let args = coerce_args(&[ParamType::Any, ParamType::Bool], vec![]).unwrap();
        assert_eq!(args, vec![JSValue::Undefined, JSValue::Bool(false)]);
    }

    #[test]
    fn test_native_function_identity() {
        let f = NativeFunction::new("f", |_, _| Ok(JSValue::Undefined));
        let g = NativeFunction::new("f", |_, _| Ok(JSValue::Undefined));
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
        assert_eq!(f.name(), "f");
    }
}
