//! Script contexts: one global object inside a context group.
//!
//! `Context` methods can be called from any thread. They marshal onto the group
//! thread and block until the work is done. On the group thread, including from
//! inside a native callback, they run synchronously in a nested scope.

use crate::runtime::bridge::PropertyAttributes;
use crate::runtime::error::{BridgeError, ScriptException};
use crate::runtime::group::ContextGroup;
use crate::runtime::handle::{JsObject, JsPromise, PromiseResolver};
use crate::runtime::js_value::JSValue;
use crate::runtime::process::{Process, ProcessShared};
use crate::runtime::runner::{self, GroupCommand};
use crate::runtime::scope::JsScope;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type ContextId = u64;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Receives exceptions that would otherwise escape a context.
pub type ExceptionHandler = Arc<dyn Fn(&Context, &ScriptException) + Send + Sync>;

/// Name and line offset reported for an evaluated script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOrigin {
    pub name: String,
    pub line_offset: u32,
}

impl ScriptOrigin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line_offset: 0,
        }
    }

    pub fn with_line_offset(mut self, line_offset: u32) -> Self {
        self.line_offset = line_offset;
        self
    }
}

impl Default for ScriptOrigin {
    fn default() -> Self {
        Self::new("<anonymous>")
    }
}

pub(crate) struct ContextShared {
    id: ContextId,
    name: String,
    group: ContextGroup,
    defunct: AtomicBool,
    handler: Mutex<Option<ExceptionHandler>>,
    in_handler: AtomicBool,
    process: Weak<ProcessShared>,
}

impl ContextShared {
    pub(crate) fn new(name: String, group: ContextGroup, process: Weak<ProcessShared>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            group,
            defunct: AtomicBool::new(false),
            handler: Mutex::new(None),
            in_handler: AtomicBool::new(false),
            process,
        })
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn group(&self) -> &ContextGroup {
        &self.group
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        self.group.send_quiet(GroupCommand::ReleaseContext(self.id));
    }
}

/// Handle to one JavaScript global environment.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn group(&self) -> &ContextGroup {
        &self.shared.group
    }

    /// Process owning this context, if it was created for one.
    pub fn process(&self) -> Option<Process> {
        self.shared.process.upgrade().map(Process::view)
    }

    /// Whether the owning process has exited. Defunct contexts reject all work.
    pub fn is_defunct(&self) -> bool {
        self.shared.defunct.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_defunct(&self) {
        self.shared.defunct.store(true, Ordering::SeqCst);
    }

    pub fn evaluate_script(&self, source: &str) -> Result<JSValue, BridgeError> {
        self.evaluate_script_with(source, &ScriptOrigin::default())
    }

    /// Evaluate `source` and return its completion value.
    ///
    /// When an exception handler is installed, script exceptions go to the
    /// handler and the call returns `Undefined`.
    pub fn evaluate_script_with(&self, source: &str, origin: &ScriptOrigin) -> Result<JSValue, BridgeError> {
        self.ensure_live()?;
        let code = source.to_string();
        let origin = origin.clone();
        let context = self.clone();
        self.marshal(move || {
            let result = runner::enter(context.group().id(), context.id(), |scope| {
                scope.evaluate_with(&code, &origin)
            });
            match result {
                Err(BridgeError::Script(exception)) if context.handle_exception(&exception) => {
                    Ok(JSValue::Undefined)
                }
                other => other,
            }
        })
    }

    /// Evaluate without routing exceptions to the handler.
    pub(crate) fn evaluate_unhandled(&self, source: &str, origin: &ScriptOrigin) -> Result<JSValue, BridgeError> {
        self.with_scope(|scope| scope.evaluate_with(source, origin))
    }

    /// Run `f` inside this context. Only valid on the group thread.
    pub fn with_scope<R>(
        &self,
        f: impl FnOnce(&mut JsScope<'_, '_>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        if !self.shared.group.is_current_thread() {
            return Err(BridgeError::InvalidThreadAccess);
        }
        self.ensure_live()?;
        runner::enter(self.shared.group.id(), self.shared.id, f)
    }

    fn ensure_live(&self) -> Result<(), BridgeError> {
        if self.is_defunct() {
            return Err(BridgeError::StaleReference);
        }
        Ok(())
    }

    fn marshal<R, F>(&self, task: F) -> Result<R, BridgeError>
    where
        F: FnOnce() -> Result<R, BridgeError> + Send + 'static,
        R: Send + 'static,
    {
        self.shared.group.invoke(task)
    }

    fn scoped<R, F>(&self, f: F) -> Result<R, BridgeError>
    where
        F: FnOnce(&mut JsScope<'_, '_>) -> Result<R, BridgeError> + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_live()?;
        let (group_id, context_id) = (self.shared.group.id(), self.shared.id);
        self.marshal(move || runner::enter(group_id, context_id, f))
    }

    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&Context, &ScriptException) + Send + Sync + 'static,
    {
        *self.shared.handler.lock() = Some(Arc::new(handler));
    }

    pub fn clear_exception_handler(&self) {
        *self.shared.handler.lock() = None;
    }

    pub fn has_exception_handler(&self) -> bool {
        self.shared.handler.lock().is_some()
    }

    /// Offer `exception` to the installed handler. Returns false when there is
    /// none, when the handler panics, or when the exception was raised while
    /// the handler itself was running.
    pub(crate) fn handle_exception(&self, exception: &ScriptException) -> bool {
        let Some(handler) = self.shared.handler.lock().clone() else {
            return false;
        };
        if self.shared.in_handler.swap(true, Ordering::SeqCst) {
            return false;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(self, exception)));
        self.shared.in_handler.store(false, Ordering::SeqCst);
        if outcome.is_err() {
            tracing::error!(context = self.shared.id, "exception handler panicked");
            return false;
        }
        true
    }

    /// Hold the owning process open. No-op for contexts without a process.
    pub fn keep_alive(&self) {
        if let Some(process) = self.shared.process.upgrade() {
            process.keep_alive();
        }
    }

    pub fn let_die(&self) {
        if let Some(process) = self.shared.process.upgrade() {
            process.let_die();
        }
    }

    pub fn global(&self) -> Result<JsObject, BridgeError> {
        self.scoped(|scope| scope.global())
    }

    /// Global property, `Undefined` when missing.
    pub fn property(&self, name: &str) -> Result<JSValue, BridgeError> {
        let name = name.to_string();
        self.scoped(move |scope| scope.global_property(&name))
    }

    pub fn set_property(&self, name: &str, value: impl Into<JSValue>) -> Result<bool, BridgeError> {
        self.set_property_with(name, value, PropertyAttributes::NONE)
    }

    /// Define a global property with explicit attributes.
    pub fn set_property_with(
        &self,
        name: &str,
        value: impl Into<JSValue>,
        attrs: PropertyAttributes,
    ) -> Result<bool, BridgeError> {
        let name = name.to_string();
        let value = value.into();
        self.scoped(move |scope| scope.set_global_property(&name, value, attrs))
    }

    pub fn delete_property(&self, name: &str) -> Result<bool, BridgeError> {
        let name = name.to_string();
        self.scoped(move |scope| scope.delete_global_property(&name))
    }

    /// Pending promise plus the resolver that settles it from any thread.
    pub fn new_promise(&self) -> Result<(JsPromise, PromiseResolver), BridgeError> {
        self.scoped(|scope| scope.new_promise())
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("group", &self.shared.group.id())
            .field("defunct", &self.is_defunct())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_defaults() {
        let origin = ScriptOrigin::new("main.js").with_line_offset(2);
        assert_eq!(origin.name, "main.js");
        assert_eq!(origin.line_offset, 2);
        assert_eq!(ScriptOrigin::default(), ScriptOrigin::new("<anonymous>"));
    }
}
