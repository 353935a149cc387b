//! Live access to a context while running on its group thread.
//!
//! A [`JsScope`] is handed to native callbacks and to code entering a context
//! through [`runner::enter`](crate::runtime::runner). `Context` and handle
//! methods called while a callback runs open a nested scope on top of the
//! callback's one, so both routes reach the same heap.

use crate::runtime::bridge::{NativeFunction, PropertyAttributes};
use crate::runtime::context::{Context, ContextId, ScriptOrigin};
use crate::runtime::conversion::{self, Projection};
use crate::runtime::error::{BridgeError, ScriptException};
use crate::runtime::group::ContextGroup;
use crate::runtime::handle::{
    HandleInner, JsFunction, JsObject, JsPromise, PromiseResolver, PromiseState,
};
use crate::runtime::js_value::JSValue;
use crate::runtime::process::Process;
use crate::runtime::runner::{BridgeState, TimerCallback};
use deno_core::v8;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Entry into one context on its group thread.
pub struct JsScope<'a, 's> {
    scope: &'a mut v8::HandleScope<'s>,
    state: &'a BridgeState,
    context_id: ContextId,
}

fn new_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> Result<v8::Local<'s, v8::String>, BridgeError> {
    v8::String::new(scope, value)
        .ok_or_else(|| BridgeError::Conversion("Failed to allocate string".to_string()))
}

/// Turn the exception caught by `tc` into a [`BridgeError`].
pub(crate) fn take_exception(tc: &mut v8::TryCatch<v8::HandleScope>) -> BridgeError {
    if tc.has_terminated() {
        return BridgeError::Terminated;
    }
    let Some(exception) = tc.exception() else {
        return BridgeError::Script(ScriptException::new("Unknown JavaScript error"));
    };

    let message = exception.to_rust_string_lossy(tc);
    let name = v8::Local::<v8::Object>::try_from(exception)
        .ok()
        .and_then(|object| {
            let key = v8::String::new(tc, "name")?;
            object.get(tc, key.into())
        })
        .filter(|value| value.is_string())
        .map(|value| value.to_rust_string_lossy(tc));
    let stack = tc
        .stack_trace()
        .filter(|value| !value.is_undefined())
        .map(|value| value.to_rust_string_lossy(tc));

    BridgeError::Script(ScriptException {
        name,
        message,
        stack,
    })
}

impl<'a, 's> JsScope<'a, 's> {
    pub(crate) fn new(
        scope: &'a mut v8::HandleScope<'s>,
        state: &'a BridgeState,
        context_id: ContextId,
    ) -> Self {
        Self {
            scope,
            state,
            context_id,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Handle on the context this scope runs in.
    pub fn context(&self) -> Option<Context> {
        self.state.context_handle(self.context_id)
    }

    pub fn group(&self) -> Option<ContextGroup> {
        self.state.group()
    }

    /// Non-owning view of the process that owns this group, if any.
    pub fn process(&self) -> Option<Process> {
        self.state.process().map(Process::view)
    }

    /// Compile and run `source` in the current context.
    pub fn evaluate(&mut self, source: &str) -> Result<JSValue, BridgeError> {
        self.evaluate_with(source, &ScriptOrigin::default())
    }

    /// Compile and run `source`, reporting `origin` in stack traces.
    pub fn evaluate_with(&mut self, source: &str, origin: &ScriptOrigin) -> Result<JSValue, BridgeError> {
        let state = self.state;
        let context_id = self.context_id;
        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        let code = new_string(tc, source)?;
        let name = new_string(tc, &origin.name)?;
        let line_offset = i32::try_from(origin.line_offset).unwrap_or(i32::MAX);
        let origin = v8::ScriptOrigin::new(
            tc,
            name.into(),
            line_offset,
            0,
            false,
            0,
            None,
            false,
            false,
            false,
            None,
        );
        let Some(script) = v8::Script::compile(tc, code, Some(&origin)) else {
            return Err(take_exception(tc));
        };
        match script.run(tc) {
            Some(result) => conversion::from_v8(tc, state, context_id, result),
            None => Err(take_exception(tc)),
        }
    }

    fn object(&mut self, handle: &HandleInner) -> Result<v8::Local<'s, v8::Object>, BridgeError> {
        if handle.group_id() != self.state.group_id() {
            return Err(BridgeError::ForeignGroup);
        }
        self.state
            .handles
            .borrow()
            .get(self.scope, handle.id())
            .ok_or(BridgeError::StaleReference)
    }

    fn function(&mut self, handle: &HandleInner) -> Result<v8::Local<'s, v8::Function>, BridgeError> {
        let object = self.object(handle)?;
        let value: v8::Local<v8::Value> = object.into();
        v8::Local::<v8::Function>::try_from(value)
            .map_err(|_| BridgeError::Conversion("Value is not a function".to_string()))
    }

    fn global_object(&mut self) -> v8::Local<'s, v8::Object> {
        let context = self.scope.get_current_context();
        context.global(self.scope)
    }

    fn handle_for(&mut self, object: v8::Local<'s, v8::Object>) -> Result<Arc<HandleInner>, BridgeError> {
        let context = self
            .state
            .context_shared(self.context_id)
            .ok_or(BridgeError::Terminated)?;
        let id = self.state.handles.borrow_mut().acquire(self.scope, object);
        Ok(HandleInner::new(context, id))
    }

    /// The global object of the current context.
    pub fn global(&mut self) -> Result<JsObject, BridgeError> {
        let global = self.global_object();
        Ok(JsObject::from_inner(self.handle_for(global)?))
    }

    fn get_from(&mut self, target: v8::Local<'s, v8::Object>, key: &str) -> Result<JSValue, BridgeError> {
        let state = self.state;
        let context_id = self.context_id;
        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        let key = new_string(tc, key)?;
        match target.get(tc, key.into()) {
            Some(value) => conversion::from_v8(tc, state, context_id, value),
            None => Err(take_exception(tc)),
        }
    }

    fn set_on(
        &mut self,
        target: v8::Local<'s, v8::Object>,
        key: &str,
        value: JSValue,
        attrs: PropertyAttributes,
    ) -> Result<bool, BridgeError> {
        let value = conversion::to_v8(self.scope, self.state, self.context_id, value)?;
        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        let key = new_string(tc, key)?;
        let result = if attrs.is_empty() {
            target.set(tc, key.into(), value)
        } else {
            target.define_own_property(tc, key.into(), value, attrs.to_v8())
        };
        result.ok_or_else(|| take_exception(tc))
    }

    fn delete_from(&mut self, target: v8::Local<'s, v8::Object>, key: &str) -> Result<bool, BridgeError> {
        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        let key = new_string(tc, key)?;
        target
            .delete(tc, key.into())
            .ok_or_else(|| take_exception(tc))
    }

    /// Global property, `Undefined` when missing.
    pub fn global_property(&mut self, name: &str) -> Result<JSValue, BridgeError> {
        let global = self.global_object();
        self.get_from(global, name)
    }

    /// Install a global property. Non-empty `attrs` define it with those flags.
    pub fn set_global_property(
        &mut self,
        name: &str,
        value: impl Into<JSValue>,
        attrs: PropertyAttributes,
    ) -> Result<bool, BridgeError> {
        let global = self.global_object();
        self.set_on(global, name, value.into(), attrs)
    }

    pub fn delete_global_property(&mut self, name: &str) -> Result<bool, BridgeError> {
        let global = self.global_object();
        self.delete_from(global, name)
    }

    pub fn get(&mut self, object: &JsObject, key: &str) -> Result<JSValue, BridgeError> {
        let target = self.object(&object.inner)?;
        self.get_from(target, key)
    }

    pub fn set(&mut self, object: &JsObject, key: &str, value: impl Into<JSValue>) -> Result<bool, BridgeError> {
        let target = self.object(&object.inner)?;
        self.set_on(target, key, value.into(), PropertyAttributes::NONE)
    }

    pub fn delete(&mut self, object: &JsObject, key: &str) -> Result<bool, BridgeError> {
        let target = self.object(&object.inner)?;
        self.delete_from(target, key)
    }

    pub fn keys(&mut self, object: &JsObject) -> Result<Vec<String>, BridgeError> {
        let target = self.object(&object.inner)?;
        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        let Some(names) = target.get_own_property_names(tc, v8::GetPropertyNamesArgs::default())
        else {
            return Err(take_exception(tc));
        };
        let mut keys = Vec::with_capacity(names.length() as usize);
        for index in 0..names.length() {
            if let Some(name) = names.get_index(tc, index) {
                keys.push(name.to_rust_string_lossy(tc));
            }
        }
        Ok(keys)
    }

    /// Deep copy of `object` with nested objects copied as well.
    pub fn snapshot(&mut self, object: &JsObject) -> Result<JSValue, BridgeError> {
        let target = self.object(&object.inner)?;
        conversion::from_v8_with(
            self.scope,
            self.state,
            self.context_id,
            target.into(),
            Projection::Copy,
        )
    }

    fn call_local(
        &mut self,
        function: v8::Local<'s, v8::Function>,
        this: v8::Local<'s, v8::Value>,
        args: Vec<JSValue>,
    ) -> Result<JSValue, BridgeError> {
        let state = self.state;
        let context_id = self.context_id;
        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            argv.push(conversion::to_v8(self.scope, state, context_id, arg)?);
        }
        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        match function.call(tc, this, &argv) {
            Some(result) => conversion::from_v8(tc, state, context_id, result),
            None => Err(take_exception(tc)),
        }
    }

    /// Call a JS function with `this` bound to `this`.
    pub fn call(&mut self, function: &JsFunction, this: JSValue, args: Vec<JSValue>) -> Result<JSValue, BridgeError> {
        let target = self.function(&function.inner)?;
        let this = conversion::to_v8(self.scope, self.state, self.context_id, this)?;
        self.call_local(target, this, args)
    }

    /// Call `object[name](...args)`.
    pub fn call_method(&mut self, object: &JsObject, name: &str, args: Vec<JSValue>) -> Result<JSValue, BridgeError> {
        let target = self.object(&object.inner)?;
        let method = {
            let tc = &mut v8::TryCatch::new(&mut *self.scope);
            let key = new_string(tc, name)?;
            match target.get(tc, key.into()) {
                Some(value) => value,
                None => return Err(take_exception(tc)),
            }
        };
        let method = v8::Local::<v8::Function>::try_from(method)
            .map_err(|_| BridgeError::Conversion(format!("'{}' is not a function", name)))?;
        self.call_local(method, target.into(), args)
    }

    /// Create a pending promise and the resolver that settles it.
    pub fn new_promise(&mut self) -> Result<(JsPromise, PromiseResolver), BridgeError> {
        let context = self
            .state
            .context_shared(self.context_id)
            .ok_or(BridgeError::Terminated)?;
        let resolver = v8::PromiseResolver::new(self.scope)
            .ok_or_else(|| BridgeError::Conversion("Failed to create promise".to_string()))?;
        let promise = resolver.get_promise(self.scope);
        let promise_id = self
            .state
            .handles
            .borrow_mut()
            .acquire(self.scope, promise.into());
        let resolver_id = self.state.store_resolver(self.scope, resolver);
        Ok((
            JsPromise::from_inner(HandleInner::new(context.clone(), promise_id)),
            PromiseResolver::new(context, resolver_id),
        ))
    }

    pub(crate) fn settle_resolver(&mut self, id: u64, value: JSValue, fulfil: bool) -> Result<bool, BridgeError> {
        let Some(global) = self.state.take_resolver(id) else {
            return Ok(false);
        };
        let resolver = v8::Local::new(self.scope, &global);
        let value = match conversion::to_v8(self.scope, self.state, self.context_id, value) {
            Ok(value) => value,
            Err(err) => {
                let message = new_string(self.scope, &err.to_string())?;
                let exception = v8::Exception::error(self.scope, message);
                resolver.reject(self.scope, exception);
                return Err(err);
            }
        };
        let settled = if fulfil {
            resolver.resolve(self.scope, value)
        } else {
            resolver.reject(self.scope, value)
        };
        Ok(settled.unwrap_or(false))
    }

    fn promise(&mut self, promise: &JsPromise) -> Result<v8::Local<'s, v8::Promise>, BridgeError> {
        let object = self.object(&promise.inner)?;
        let value: v8::Local<v8::Value> = object.into();
        v8::Local::<v8::Promise>::try_from(value)
            .map_err(|_| BridgeError::Conversion("Value is not a promise".to_string()))
    }

    pub fn promise_state(&mut self, promise: &JsPromise) -> Result<PromiseState, BridgeError> {
        let target = self.promise(promise)?;
        let state = target.state();
        if state == v8::PromiseState::Pending {
            return Ok(PromiseState::Pending);
        }
        let result = target.result(self.scope);
        let value = conversion::from_v8(self.scope, self.state, self.context_id, result)?;
        Ok(match state {
            v8::PromiseState::Fulfilled => PromiseState::Fulfilled(value),
            _ => PromiseState::Rejected(value),
        })
    }

    /// Run `callback` once `promise` settles, with `Ok` for fulfilment and `Err`
    /// for rejection.
    pub fn when_settled<F>(&mut self, promise: &JsPromise, callback: F) -> Result<(), BridgeError>
    where
        F: FnOnce(Result<JSValue, JSValue>) + Send + 'static,
    {
        let target = self.promise(promise)?;
        let slot = Arc::new(Mutex::new(Some(callback)));
        // Both reactions are unregistered as soon as either one runs.
        let reactions: Arc<Mutex<Vec<u32>>> = Arc::default();

        let fulfilled_slot = slot.clone();
        let fulfilled_reactions = reactions.clone();
        let on_fulfilled = NativeFunction::new("onFulfilled", move |scope, args| {
            scope.forget_callables(&fulfilled_reactions.lock());
            if let Some(callback) = fulfilled_slot.lock().take() {
                callback(Ok(args.into_iter().next().unwrap_or_default()));
            }
            Ok(JSValue::Undefined)
        });
        let rejected_reactions = reactions.clone();
        let on_rejected = NativeFunction::new("onRejected", move |scope, args| {
            scope.forget_callables(&rejected_reactions.lock());
            if let Some(callback) = slot.lock().take() {
                callback(Err(args.into_iter().next().unwrap_or_default()));
            }
            Ok(JSValue::Undefined)
        });

        let (fulfilled_id, on_fulfilled) = self.transient_function(&on_fulfilled)?;
        let (rejected_id, on_rejected) = match self.transient_function(&on_rejected) {
            Ok(built) => built,
            Err(err) => {
                self.forget_callables(&[fulfilled_id]);
                return Err(err);
            }
        };
        reactions.lock().extend([fulfilled_id, rejected_id]);
        target
            .then2(self.scope, on_fulfilled, on_rejected)
            .map(|_| ())
            .ok_or_else(|| BridgeError::Conversion("Failed to attach promise callbacks".to_string()))
    }

    fn transient_function(
        &mut self,
        function: &NativeFunction,
    ) -> Result<(u32, v8::Local<'s, v8::Function>), BridgeError> {
        crate::runtime::bridge::build_transient(self.scope, self.state, self.context_id, function)
    }

    pub(crate) fn forget_callables(&mut self, ids: &[u32]) {
        self.state.forget_callables(ids);
    }

    pub(crate) fn schedule_timer(
        &mut self,
        callback: JSValue,
        args: Vec<JSValue>,
        delay: Duration,
        repeat: bool,
    ) -> Result<u32, BridgeError> {
        let target = conversion::to_v8(self.scope, self.state, self.context_id, callback)?;
        let target = v8::Local::<v8::Function>::try_from(target)
            .map_err(|_| BridgeError::Conversion("Timer callback is not a function".to_string()))?;
        let callback = v8::Global::new(self.scope, target);
        let mut globals = Vec::with_capacity(args.len());
        for arg in args {
            let value = conversion::to_v8(self.scope, self.state, self.context_id, arg)?;
            globals.push(v8::Global::new(self.scope, value));
        }
        let timer = TimerCallback {
            callback,
            args: globals,
        };
        Ok(self
            .state
            .timers
            .borrow_mut()
            .schedule(self.context_id, timer, delay, repeat))
    }

    pub(crate) fn clear_timer(&mut self, id: u32) -> bool {
        self.state.timers.borrow_mut().clear(id)
    }

    pub(crate) fn invoke_timer(&mut self, timer: &TimerCallback) -> Result<(), BridgeError> {
        let function = v8::Local::new(self.scope, &timer.callback);
        let mut args = Vec::with_capacity(timer.args.len());
        for arg in &timer.args {
            args.push(v8::Local::new(self.scope, arg));
        }
        let undefined = v8::undefined(self.scope).into();
        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        match function.call(tc, undefined, &args) {
            Some(_) => Ok(()),
            None => Err(take_exception(tc)),
        }
    }

    /// Stop the running script at the next safe point.
    pub(crate) fn terminate_execution(&mut self) {
        self.scope.terminate_execution();
    }
}
