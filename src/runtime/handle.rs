//! Native handles to live JavaScript values.
//!
//! A handle names an entry in its group's [`HandleTable`]. Converting the same
//! JS object twice yields handles that compare equal and project back to the
//! same object. Entries are reference counted on the group thread; dropping the
//! last native clone sends a release command. A handle also keeps its context
//! registered, so it stays usable after every `Context` clone is gone.
//!
//! Handle methods touch the JS heap directly, so they must run on the owning
//! group thread. Calls from anywhere else fail with
//! [`BridgeError::InvalidThreadAccess`]; use [`ContextGroup::dispatch_async`] or
//! [`JsFunction::call_async`] to get there.

use crate::runtime::context::{Context, ContextId, ContextShared};
use crate::runtime::error::BridgeError;
use crate::runtime::group::ContextGroup;
use crate::runtime::js_value::JSValue;
use crate::runtime::runner::{self, GroupCommand};
use crate::runtime::scope::JsScope;
use deno_core::v8;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct HandleInner {
    context: Arc<ContextShared>,
    id: u64,
}

impl HandleInner {
    pub(crate) fn new(context: Arc<ContextShared>, id: u64) -> Arc<Self> {
        Arc::new(Self { context, id })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn group_id(&self) -> u64 {
        self.context.group().id()
    }

    pub(crate) fn context_id(&self) -> ContextId {
        self.context.id()
    }

    fn group(&self) -> &ContextGroup {
        self.context.group()
    }

    fn enter<R>(
        &self,
        f: impl FnOnce(&mut JsScope<'_, '_>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        if !self.group().is_current_thread() {
            return Err(BridgeError::InvalidThreadAccess);
        }
        runner::enter(self.group_id(), self.context_id(), f)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.group().send_quiet(GroupCommand::ReleaseHandle(self.id));
    }
}

macro_rules! handle_type {
    ($name:ident, $label:literal) => {
        #[derive(Clone)]
        pub struct $name {
            pub(crate) inner: Arc<HandleInner>,
        }

        impl $name {
            pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
                Self { inner }
            }

            /// Group that owns the underlying JS value.
            pub fn group(&self) -> &ContextGroup {
                self.inner.group()
            }

            pub fn context_id(&self) -> ContextId {
                self.inner.context_id()
            }

            /// Context the value was created in. The handle keeps it alive.
            pub fn context(&self) -> Context {
                Context::from_shared(self.inner.context.clone())
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.inner.group_id() == other.inner.group_id() && self.inner.id == other.inner.id
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.inner.group_id().hash(state);
                self.inner.id.hash(state);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}@{}", $label, self.inner.id, self.inner.group_id())
            }
        }
    };
}

handle_type!(JsObject, "JsObject");
handle_type!(JsFunction, "JsFunction");
handle_type!(JsPromise, "JsPromise");

impl JsObject {
    /// Property value, `Undefined` when missing.
    pub fn get(&self, key: &str) -> Result<JSValue, BridgeError> {
        self.inner.enter(|scope| scope.get(self, key))
    }

    pub fn set(&self, key: &str, value: impl Into<JSValue>) -> Result<bool, BridgeError> {
        let value = value.into();
        self.inner.enter(|scope| scope.set(self, key, value))
    }

    pub fn delete(&self, key: &str) -> Result<bool, BridgeError> {
        self.inner.enter(|scope| scope.delete(self, key))
    }

    /// Own enumerable property names.
    pub fn keys(&self) -> Result<Vec<String>, BridgeError> {
        self.inner.enter(|scope| scope.keys(self))
    }

    pub fn call_method(&self, name: &str, args: Vec<JSValue>) -> Result<JSValue, BridgeError> {
        self.inner.enter(|scope| scope.call_method(self, name, args))
    }

    /// Deep copy of the object as owned values, safe to move across groups.
    pub fn snapshot(&self) -> Result<JSValue, BridgeError> {
        self.inner.enter(|scope| scope.snapshot(self))
    }
}

impl JsFunction {
    /// Call on the owning group thread.
    pub fn call(&self, this: JSValue, args: Vec<JSValue>) -> Result<JSValue, BridgeError> {
        self.inner.enter(|scope| scope.call(self, this, args))
    }

    /// Queue a call onto the owning group thread and hand the result to `callback`
    /// there.
    pub fn call_async<F>(&self, args: Vec<JSValue>, callback: F) -> Result<(), BridgeError>
    where
        F: FnOnce(Result<JSValue, BridgeError>) + Send + 'static,
    {
        let function = self.clone();
        self.inner.group().dispatch_async(move || {
            let result = function.call(JSValue::Undefined, args);
            callback(result);
        })
    }

    /// The function viewed as a plain object handle.
    pub fn as_object(&self) -> JsObject {
        JsObject::from_inner(self.inner.clone())
    }
}

/// Settlement state of a [`JsPromise`].
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(JSValue),
    Rejected(JSValue),
}

impl JsPromise {
    pub fn state(&self) -> Result<PromiseState, BridgeError> {
        self.inner.enter(|scope| scope.promise_state(self))
    }

    /// Run `callback` on the group thread once the promise settles.
    pub fn when_settled<F>(&self, callback: F) -> Result<(), BridgeError>
    where
        F: FnOnce(Result<JSValue, JSValue>) + Send + 'static,
    {
        self.inner.enter(|scope| scope.when_settled(self, callback))
    }
}

pub(crate) struct ResolverInner {
    context: Arc<ContextShared>,
    id: u64,
    settled: AtomicBool,
}

impl Drop for ResolverInner {
    fn drop(&mut self) {
        self.context
            .group()
            .send_quiet(GroupCommand::ReleaseResolver(self.id));
    }
}

/// Native side of a promise created with `new_promise`.
///
/// `resolve` and `reject` may be called from any thread. The first call wins;
/// later calls do nothing and return `false`.
#[derive(Clone)]
pub struct PromiseResolver {
    inner: Arc<ResolverInner>,
}

impl PromiseResolver {
    pub(crate) fn new(context: Arc<ContextShared>, id: u64) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                context,
                id,
                settled: AtomicBool::new(false),
            }),
        }
    }

    pub fn resolve(&self, value: impl Into<JSValue>) -> bool {
        self.settle(value.into(), true)
    }

    pub fn reject(&self, value: impl Into<JSValue>) -> bool {
        self.settle(value.into(), false)
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    fn settle(&self, value: JSValue, fulfil: bool) -> bool {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let inner = self.inner.clone();
        let dispatched = self.inner.context.group().dispatch_async(move || {
            let group_id = inner.context.group().id();
            let result = runner::enter(group_id, inner.context.id(), |scope| {
                scope.settle_resolver(inner.id, value, fulfil)
            });
            if let Err(err) = result {
                tracing::warn!(resolver = inner.id, "failed to settle promise: {}", err);
            }
        });
        dispatched.is_ok()
    }
}

impl fmt::Debug for PromiseResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseResolver")
            .field("id", &self.inner.id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

struct HandleEntry {
    value: v8::Global<v8::Object>,
    hash: i32,
    refs: usize,
}

/// Reference-counted table of JS objects held by native handles.
///
/// Entries are found by identity hash and confirmed with strict equality so
/// one JS object maps to one id for as long as any handle is alive.
#[derive(Default)]
pub(crate) struct HandleTable {
    next_id: u64,
    entries: HashMap<u64, HandleEntry>,
    by_hash: HashMap<i32, Vec<u64>>,
}

impl HandleTable {
    pub(crate) fn acquire<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
    ) -> u64 {
        let hash = object.get_identity_hash().get();
        if let Some(ids) = self.by_hash.get(&hash) {
            for id in ids {
                if let Some(entry) = self.entries.get_mut(id) {
                    let existing = v8::Local::new(scope, &entry.value);
                    if existing.strict_equals(object.into()) {
                        entry.refs += 1;
                        return *id;
                    }
                }
            }
        }

        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            HandleEntry {
                value: v8::Global::new(scope, object),
                hash,
                refs: 1,
            },
        );
        self.by_hash.entry(hash).or_default().push(id);
        id
    }

    pub(crate) fn get<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        id: u64,
    ) -> Option<v8::Local<'s, v8::Object>> {
        self.entries
            .get(&id)
            .map(|entry| v8::Local::new(scope, &entry.value))
    }

    /// Drop one reference. Returns true when the entry was freed.
    pub(crate) fn release(&mut self, id: u64) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return false;
        }
        let hash = entry.hash;
        self.entries.remove(&id);
        if let Some(ids) = self.by_hash.get_mut(&hash) {
            ids.retain(|candidate| *candidate != id);
            if ids.is_empty() {
                self.by_hash.remove(&hash);
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_hash.clear();
    }
}
