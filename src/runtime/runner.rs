//! Group thread backed by `deno_core::JsRuntime`.
//!
//! Every context group owns one isolate hosted on a dedicated OS thread with a
//! single-threaded Tokio runtime. Work from other threads arrives as
//! [`GroupCommand`]s and runs sequentially on that thread. For process groups
//! the same loop also drives timers, keep-alive accounting and the exit state
//! machine.

use crate::runtime::bridge::CallableEntry;
use crate::runtime::config::GroupConfig;
use crate::runtime::context::{Context, ContextId, ContextShared, ScriptOrigin};
use crate::runtime::error::{BridgeError, ScriptException};
use crate::runtime::globals;
use crate::runtime::group::{ContextGroup, GroupShared};
use crate::runtime::handle::HandleTable;
use crate::runtime::js_value::JSValue;
use crate::runtime::process::{ProcessShared, EXIT_CODE_ABANDONED};
use crate::runtime::scope::JsScope;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

type InitSignalChannel = (
    StdSender<Result<(), String>>,
    StdReceiver<Result<(), String>>,
);

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Commands sent to a group thread.
pub(crate) enum GroupCommand {
    /// Run a closure on the group thread.
    Task(Task),
    /// A native handle was dropped.
    ReleaseHandle(u64),
    /// A promise resolver was dropped.
    ReleaseResolver(u64),
    /// The last `Context` handle for a context was dropped.
    ReleaseContext(ContextId),
    /// Re-evaluate the exit conditions of the owning process.
    Wake,
}

/// Shortest delay a timer can be scheduled with.
const MIN_TIMER_DELAY: Duration = Duration::from_millis(1);

pub(crate) struct Timer<T> {
    pub(crate) id: u32,
    pub(crate) context_id: ContextId,
    pub(crate) payload: T,
    pub(crate) interval: Option<Duration>,
}

/// Deadline-ordered timers.
///
/// A timer stays active from `schedule` until it is cleared or a one-shot timer
/// has fired, including while its callback runs, so an interval cleared from
/// its own callback is not re-armed.
pub(crate) struct TimerQueue<T> {
    next_id: u32,
    seq: u64,
    order: BTreeMap<(Instant, u64), u32>,
    pending: HashMap<u32, ((Instant, u64), Timer<T>)>,
    active: HashSet<u32>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            seq: 0,
            order: BTreeMap::new(),
            pending: HashMap::new(),
            active: HashSet::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub(crate) fn schedule(
        &mut self,
        context_id: ContextId,
        payload: T,
        delay: Duration,
        repeat: bool,
    ) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        let delay = delay.max(MIN_TIMER_DELAY);
        let timer = Timer {
            id,
            context_id,
            payload,
            interval: repeat.then_some(delay),
        };
        self.active.insert(id);
        self.insert(Instant::now() + delay, timer);
        id
    }

    fn insert(&mut self, deadline: Instant, timer: Timer<T>) {
        self.seq += 1;
        let key = (deadline, self.seq);
        self.order.insert(key, timer.id);
        self.pending.insert(timer.id, (key, timer));
    }

    /// Cancel a timer. Returns false when the id is unknown or already done.
    pub(crate) fn clear(&mut self, id: u32) -> bool {
        let was_active = self.active.remove(&id);
        if let Some((key, _)) = self.pending.remove(&id) {
            self.order.remove(&key);
        }
        was_active
    }

    /// Take the earliest timer whose deadline is at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Timer<T>> {
        let (&key, &id) = self.order.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.order.remove(&key);
        self.pending.remove(&id).map(|(_, timer)| timer)
    }

    /// Put a fired timer back if it repeats and was not cleared meanwhile.
    pub(crate) fn rearm(&mut self, timer: Timer<T>) {
        if !self.active.contains(&timer.id) {
            return;
        }
        match timer.interval {
            Some(interval) => self.insert(Instant::now() + interval, timer),
            None => {
                self.active.remove(&timer.id);
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.order.keys().next().map(|(deadline, _)| *deadline)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn clear_context(&mut self, context_id: ContextId) {
        let ids: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, (_, timer))| timer.context_id == context_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.clear(id);
        }
    }

    pub(crate) fn clear_all(&mut self) {
        self.order.clear();
        self.pending.clear();
        self.active.clear();
    }
}

/// JS callback and bound arguments of a scheduled timer.
pub(crate) struct TimerCallback {
    pub(crate) callback: v8::Global<v8::Function>,
    pub(crate) args: Vec<v8::Global<v8::Value>>,
}

struct ContextSlot {
    context: v8::Global<v8::Context>,
    handle: Weak<ContextShared>,
}

struct CallableSlot {
    entry: CallableEntry,
    function: Option<v8::Weak<v8::Function>>,
}

/// Cached projection of a native value. Held weakly so scripts decide its lifetime.
struct NativeEntry {
    object: v8::Weak<v8::Object>,
    hash: i32,
    native: JSValue,
    token: u64,
}

type NativeKey = (ContextId, u64);

/// Projections whose JS side was garbage collected.
enum Collected {
    Callable(u32),
    Native(NativeKey, u64),
}

/// Per-isolate bookkeeping shared by conversion, projection and scopes.
///
/// Stored in an isolate slot so native callbacks can reach it. Projected
/// functions and objects are tracked with weak handles; their finalizers only
/// queue the entry, and [`BridgeState::sweep`] drops it later.
pub(crate) struct BridgeState {
    group_id: u64,
    group: Weak<GroupShared>,
    process: Option<Weak<ProcessShared>>,
    contexts: RefCell<HashMap<ContextId, ContextSlot>>,
    pub(crate) handles: RefCell<HandleTable>,
    resolvers: RefCell<HashMap<u64, v8::Global<v8::PromiseResolver>>>,
    next_resolver: Cell<u64>,
    callables: RefCell<HashMap<u32, CallableSlot>>,
    next_callable: Cell<u32>,
    natives: RefCell<HashMap<NativeKey, NativeEntry>>,
    by_hash: RefCell<HashMap<i32, Vec<NativeKey>>>,
    next_token: Cell<u64>,
    collected: Rc<RefCell<Vec<Collected>>>,
    pub(crate) timers: RefCell<TimerQueue<TimerCallback>>,
}

impl BridgeState {
    fn new(group_id: u64, group: Weak<GroupShared>, process: Option<Weak<ProcessShared>>) -> Self {
        Self {
            group_id,
            group,
            process,
            contexts: RefCell::new(HashMap::new()),
            handles: RefCell::new(HandleTable::default()),
            resolvers: RefCell::new(HashMap::new()),
            next_resolver: Cell::new(0),
            callables: RefCell::new(HashMap::new()),
            next_callable: Cell::new(0),
            natives: RefCell::new(HashMap::new()),
            by_hash: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
            collected: Rc::new(RefCell::new(Vec::new())),
            timers: RefCell::new(TimerQueue::default()),
        }
    }

    pub(crate) fn group_id(&self) -> u64 {
        self.group_id
    }

    pub(crate) fn group(&self) -> Option<ContextGroup> {
        self.group.upgrade().map(ContextGroup::from_shared)
    }

    pub(crate) fn process(&self) -> Option<Arc<ProcessShared>> {
        self.process.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn context_shared(&self, context_id: ContextId) -> Option<Arc<ContextShared>> {
        self.contexts
            .borrow()
            .get(&context_id)
            .and_then(|slot| slot.handle.upgrade())
    }

    pub(crate) fn context_handle(&self, context_id: ContextId) -> Option<Context> {
        self.context_shared(context_id).map(Context::from_shared)
    }

    fn context_global(&self, context_id: ContextId) -> Option<v8::Global<v8::Context>> {
        self.contexts
            .borrow()
            .get(&context_id)
            .map(|slot| slot.context.clone())
    }

    pub(crate) fn register_callable(&self, entry: CallableEntry) -> u32 {
        let id = self.next_callable.get().wrapping_add(1);
        self.next_callable.set(id);
        self.callables.borrow_mut().insert(
            id,
            CallableSlot {
                entry,
                function: None,
            },
        );
        id
    }

    /// Forget callable `id` once `function` is collected.
    pub(crate) fn track_callable(
        &self,
        scope: &mut v8::HandleScope,
        id: u32,
        function: v8::Local<v8::Function>,
    ) {
        let collected = self.collected.clone();
        let weak = v8::Weak::with_finalizer(
            scope,
            function,
            Box::new(move |_: &mut v8::Isolate| {
                collected.borrow_mut().push(Collected::Callable(id));
            }),
        );
        if let Some(slot) = self.callables.borrow_mut().get_mut(&id) {
            slot.function = Some(weak);
        }
    }

    pub(crate) fn callable(&self, id: u32) -> Option<CallableEntry> {
        self.callables.borrow().get(&id).map(|slot| slot.entry.clone())
    }

    pub(crate) fn forget_callables(&self, ids: &[u32]) {
        let mut callables = self.callables.borrow_mut();
        for id in ids {
            callables.remove(id);
        }
    }

    pub(crate) fn cached_native<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        context_id: ContextId,
        native_id: u64,
    ) -> Option<v8::Local<'s, v8::Object>> {
        self.natives
            .borrow()
            .get(&(context_id, native_id))
            .and_then(|entry| entry.object.to_local(scope))
    }

    pub(crate) fn cache_native(
        &self,
        scope: &mut v8::HandleScope,
        context_id: ContextId,
        native_id: u64,
        object: v8::Local<v8::Object>,
        native: JSValue,
    ) {
        let key = (context_id, native_id);
        let token = self.next_token.get() + 1;
        self.next_token.set(token);
        let collected = self.collected.clone();
        let weak = v8::Weak::with_finalizer(
            scope,
            object,
            Box::new(move |_: &mut v8::Isolate| {
                collected.borrow_mut().push(Collected::Native(key, token));
            }),
        );
        let hash = object.get_identity_hash().get();
        let entry = NativeEntry {
            object: weak,
            hash,
            native,
            token,
        };
        let replaced = self.natives.borrow_mut().insert(key, entry);
        if let Some(old) = replaced {
            self.unindex(key, old.hash);
        }
        self.by_hash.borrow_mut().entry(hash).or_default().push(key);
    }

    fn unindex(&self, key: NativeKey, hash: i32) {
        let mut by_hash = self.by_hash.borrow_mut();
        if let Some(keys) = by_hash.get_mut(&hash) {
            keys.retain(|candidate| *candidate != key);
            if keys.is_empty() {
                by_hash.remove(&hash);
            }
        }
    }

    /// Native value behind a projected wrapper, if `object` is one.
    pub(crate) fn unwrap_native(
        &self,
        scope: &mut v8::HandleScope,
        _context_id: ContextId,
        object: v8::Local<v8::Object>,
    ) -> Option<JSValue> {
        let by_hash = self.by_hash.borrow();
        let keys = by_hash.get(&object.get_identity_hash().get())?;
        let natives = self.natives.borrow();
        keys.iter()
            .filter_map(|key| natives.get(key))
            .find(|entry| {
                entry
                    .object
                    .to_local(scope)
                    .is_some_and(|existing| existing.strict_equals(object.into()))
            })
            .map(|entry| entry.native.clone())
    }

    /// Drop bookkeeping for projections the garbage collector reclaimed.
    pub(crate) fn sweep(&self) {
        let collected = std::mem::take(&mut *self.collected.borrow_mut());
        if collected.is_empty() {
            return;
        }
        for item in collected {
            match item {
                Collected::Callable(id) => {
                    self.callables.borrow_mut().remove(&id);
                }
                Collected::Native(key, token) => {
                    let removed = {
                        let mut natives = self.natives.borrow_mut();
                        match natives.get(&key) {
                            Some(entry) if entry.token == token => natives.remove(&key),
                            _ => None,
                        }
                    };
                    if let Some(entry) = removed {
                        self.unindex(key, entry.hash);
                    }
                }
            }
        }
        tracing::trace!(
            group = self.group_id,
            callables = self.callables.borrow().len(),
            natives = self.natives.borrow().len(),
            "swept collected projections"
        );
    }

    pub(crate) fn store_resolver(
        &self,
        scope: &mut v8::HandleScope,
        resolver: v8::Local<v8::PromiseResolver>,
    ) -> u64 {
        let id = self.next_resolver.get() + 1;
        self.next_resolver.set(id);
        self.resolvers
            .borrow_mut()
            .insert(id, v8::Global::new(scope, resolver));
        id
    }

    pub(crate) fn take_resolver(&self, id: u64) -> Option<v8::Global<v8::PromiseResolver>> {
        self.resolvers.borrow_mut().remove(&id)
    }

    fn insert_context(&self, context_id: ContextId, context: v8::Global<v8::Context>, handle: Weak<ContextShared>) {
        self.contexts
            .borrow_mut()
            .insert(context_id, ContextSlot { context, handle });
    }

    /// Drop everything the isolate keeps alive for `context_id`.
    fn remove_context(&self, context_id: ContextId) {
        if self.contexts.borrow_mut().remove(&context_id).is_none() {
            return;
        }
        self.natives
            .borrow_mut()
            .retain(|(owner, _), _| *owner != context_id);
        self.by_hash.borrow_mut().retain(|_, keys| {
            keys.retain(|(owner, _)| *owner != context_id);
            !keys.is_empty()
        });
        self.callables
            .borrow_mut()
            .retain(|_, slot| slot.entry.context_id != context_id);
        self.timers.borrow_mut().clear_context(context_id);
        tracing::debug!(group = self.group_id, context = context_id, "context released");
    }

    fn clear(&self) {
        let leaked = self.handles.borrow().len();
        if leaked > 0 {
            tracing::debug!(group = self.group_id, leaked, "handles still alive at shutdown");
        }
        self.handles.borrow_mut().clear();
        self.resolvers.borrow_mut().clear();
        self.natives.borrow_mut().clear();
        self.by_hash.borrow_mut().clear();
        self.callables.borrow_mut().clear();
        self.collected.borrow_mut().clear();
        self.timers.borrow_mut().clear_all();
        self.contexts.borrow_mut().clear();
    }
}

struct GroupCore {
    js_runtime: JsRuntime,
    state: Rc<BridgeState>,
    main_claimed: bool,
}

thread_local! {
    static CORE: RefCell<Option<GroupCore>> = const { RefCell::new(None) };
    /// Innermost scope that JS work on this thread may nest under.
    static ACTIVE_SCOPE: Cell<Option<NonNull<v8::HandleScope<'static>>>> = const { Cell::new(None) };
}

/// Run `f` against the group core installed on this thread.
fn with_core<R>(f: impl FnOnce(&mut GroupCore) -> R) -> Result<R, BridgeError> {
    CORE.with(|cell| {
        let mut guard = cell.try_borrow_mut().map_err(|_| BridgeError::Reentrant)?;
        let core = guard.as_mut().ok_or(BridgeError::InvalidThreadAccess)?;
        Ok(f(core))
    })
}

struct RestoreActiveScope(Option<NonNull<v8::HandleScope<'static>>>);

impl Drop for RestoreActiveScope {
    fn drop(&mut self) {
        ACTIVE_SCOPE.with(|current| current.set(self.0));
    }
}

/// Run `f` with `scope` as the base for nested [`enter`] calls.
pub(crate) fn with_active_scope<'s, R>(
    scope: &mut v8::HandleScope<'s>,
    f: impl FnOnce(&mut v8::HandleScope<'s>) -> R,
) -> R {
    let raw = NonNull::from(&mut *scope).cast::<v8::HandleScope<'static>>();
    let _restore = RestoreActiveScope(ACTIVE_SCOPE.with(|current| current.replace(Some(raw))));
    f(scope)
}

/// Enter `context_id` of group `group_id` on the current thread.
///
/// While a scope is already open on this thread, including inside a native
/// callback, the entry nests under it. Otherwise it opens a fresh scope on the
/// group core. Fails with [`BridgeError::InvalidThreadAccess`] off the group
/// thread.
pub(crate) fn enter<R>(
    group_id: u64,
    context_id: ContextId,
    f: impl FnOnce(&mut JsScope<'_, '_>) -> Result<R, BridgeError>,
) -> Result<R, BridgeError> {
    match ACTIVE_SCOPE.with(Cell::get) {
        Some(raw) => enter_nested(raw, group_id, context_id, f),
        None => with_core(|core| core.enter(group_id, context_id, f))?,
    }
}

fn enter_nested<R>(
    raw: NonNull<v8::HandleScope<'static>>,
    group_id: u64,
    context_id: ContextId,
    f: impl FnOnce(&mut JsScope<'_, '_>) -> Result<R, BridgeError>,
) -> Result<R, BridgeError> {
    // SAFETY: `raw` was registered by `with_active_scope` further up this
    // thread's stack and that frame is still running. Scopes opened below it
    // never hand control to host code without registering themselves, so it
    // is the innermost scope here.
    let outer = unsafe { &mut *raw.as_ptr() };
    let state = outer
        .get_slot::<Rc<BridgeState>>()
        .cloned()
        .ok_or(BridgeError::Terminated)?;
    if group_id != state.group_id {
        return Err(BridgeError::InvalidThreadAccess);
    }
    let context = state
        .context_global(context_id)
        .ok_or(BridgeError::Terminated)?;

    let scope = &mut v8::HandleScope::new(outer);
    let context = v8::Local::new(scope, context);
    let scope = &mut v8::ContextScope::new(scope, context);
    with_active_scope(scope, |scope| {
        let mut js_scope = JsScope::new(scope, &state, context_id);
        f(&mut js_scope)
    })
}

/// Create a new context in the group hosted on the current thread.
pub(crate) fn create_context(
    name: String,
    process: Weak<ProcessShared>,
) -> Result<Context, BridgeError> {
    with_core(|core| core.create_context(name, process))?
}

impl GroupCore {
    fn new(
        config: &GroupConfig,
        group_id: u64,
        group: Weak<GroupShared>,
        process: Option<Weak<ProcessShared>>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let create_params = match (config.max_heap_size, config.initial_heap_size) {
            (Some(max), initial) => {
                let initial_bytes = initial.unwrap_or(0);
                Some(v8::CreateParams::default().heap_limits(initial_bytes, max))
            }
            (None, _) => None,
        };

        let mut js_runtime = panic::catch_unwind(AssertUnwindSafe(|| {
            JsRuntime::new(RuntimeOptions {
                create_params,
                ..Default::default()
            })
        }))
        .map_err(|_| BridgeError::ProcessFailed("Failed to create JavaScript engine".to_string()))?;

        let state = Rc::new(BridgeState::new(group_id, group, process));
        js_runtime.v8_isolate().set_slot(state.clone());

        Ok(Self {
            js_runtime,
            state,
            main_claimed: false,
        })
    }

    fn install(core: GroupCore) {
        CORE.with(|cell| *cell.borrow_mut() = Some(core));
    }

    fn uninstall() {
        let core = CORE.with(|cell| cell.borrow_mut().take());
        if let Some(core) = core {
            core.state.clear();
            drop(core);
        }
    }

    fn create_context(&mut self, name: String, process: Weak<ProcessShared>) -> Result<Context, BridgeError> {
        let group = self.state.group().ok_or(BridgeError::Terminated)?;
        let global = if self.main_claimed {
            let scope = &mut self.js_runtime.handle_scope();
            let context = v8::Context::new(scope, Default::default());
            v8::Global::new(scope, context)
        } else {
            self.main_claimed = true;
            self.js_runtime.main_context()
        };

        let shared = ContextShared::new(name, group, process);
        let context_id = shared.id();
        self.state
            .insert_context(context_id, global, Arc::downgrade(&shared));
        tracing::debug!(group = self.state.group_id, context = context_id, "context created");
        Ok(Context::from_shared(shared))
    }

    fn enter<R>(
        &mut self,
        group_id: u64,
        context_id: ContextId,
        f: impl FnOnce(&mut JsScope<'_, '_>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        if group_id != self.state.group_id {
            return Err(BridgeError::InvalidThreadAccess);
        }
        self.state.sweep();
        let context = self
            .state
            .context_global(context_id)
            .ok_or(BridgeError::Terminated)?;
        let state = self.state.clone();

        let scope = &mut self.js_runtime.handle_scope();
        let context = v8::Local::new(scope, context);
        let scope = &mut v8::ContextScope::new(scope, context);

        let result = with_active_scope(scope, |scope| {
            let mut js_scope = JsScope::new(scope, &state, context_id);
            f(&mut js_scope)
        });

        if !scope.is_execution_terminating() {
            scope.perform_microtask_checkpoint();
        }
        if scope.is_execution_terminating() {
            scope.cancel_terminate_execution();
        }
        result
    }

    /// Run platform tasks such as deferred GC finalizers, then sweep.
    fn pump(&mut self) {
        let platform = v8::V8::get_current_platform();
        while v8::Platform::pump_message_loop(&platform, self.js_runtime.v8_isolate(), false) {}
        self.state.sweep();
    }

    fn fire_timer(&mut self, timer: Timer<TimerCallback>) -> Result<(), BridgeError> {
        let group_id = self.state.group_id;
        let context_id = timer.context_id;
        let result = self.enter(group_id, context_id, |scope| scope.invoke_timer(&timer.payload));
        self.state.timers.borrow_mut().rearm(timer);
        result
    }
}

fn bind_current_thread(group: &Weak<GroupShared>) {
    if let Some(shared) = group.upgrade() {
        ContextGroup::from_shared(shared).bind_thread(std::thread::current().id());
    }
}

fn build_tokio() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to build tokio runtime: {}", e))
}

/// Spawn a plain group thread and wait until its isolate is ready.
pub(crate) fn spawn_group(config: GroupConfig) -> Result<ContextGroup, BridgeError> {
    config.validate()?;
    let (group, cmd_rx) = ContextGroup::channel();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();
    let group_id = group.id();
    let weak = group.downgrade();
    let name = config
        .thread_name
        .clone()
        .unwrap_or_else(|| format!("jsprocess-group-{}", group_id));

    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            bind_current_thread(&weak);
            let tokio_rt = match build_tokio() {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };
            match GroupCore::new(&config, group_id, weak, None) {
                Ok(core) => {
                    GroupCore::install(core);
                    let _ = init_tx.send(Ok(()));
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err.to_string()));
                    return;
                }
            }

            let mut runner = Runner::new(cmd_rx, None);
            tokio_rt.block_on(runner.run());
            GroupCore::uninstall();
            tracing::debug!(group = group_id, "group thread stopped");
        })
        .map_err(|e| BridgeError::ProcessFailed(format!("Failed to spawn group thread: {}", e)))?;
    group.bind_thread(thread.thread().id());

    match init_rx.recv() {
        Ok(Ok(())) => Ok(group),
        Ok(Err(err)) => Err(BridgeError::ProcessFailed(err)),
        Err(_) => Err(BridgeError::ProcessFailed(
            "Group thread initialization failed".to_string(),
        )),
    }
}

/// Spawn the group thread of a process.
///
/// Initialization failures are reported through the process itself, so this
/// only fails when the OS thread cannot be created.
pub(crate) fn spawn_process_thread(
    process: Arc<ProcessShared>,
) -> Result<(ContextGroup, JoinHandle<()>), BridgeError> {
    let config = process.config().clone();
    let (group, cmd_rx) = ContextGroup::channel();
    let group_id = group.id();
    let weak = group.downgrade();

    let thread = std::thread::Builder::new()
        .name(config.thread_name())
        .spawn(move || {
            bind_current_thread(&weak);
            let tokio_rt = match build_tokio() {
                Ok(rt) => rt,
                Err(err) => {
                    process.fail(err);
                    return;
                }
            };
            match GroupCore::new(&config.group, group_id, weak, Some(Arc::downgrade(&process))) {
                Ok(core) => GroupCore::install(core),
                Err(err) => {
                    process.fail(err.to_string());
                    return;
                }
            }

            match boot(&process) {
                Ok(context) => {
                    process.start(context);
                    let mut runner = Runner::new(cmd_rx, Some(process));
                    tokio_rt.block_on(runner.run());
                }
                Err(err) => process.fail(err.to_string()),
            }
            GroupCore::uninstall();
            tracing::debug!(group = group_id, "process thread stopped");
        })
        .map_err(|e| BridgeError::ProcessFailed(format!("Failed to spawn process thread: {}", e)))?;
    group.bind_thread(thread.thread().id());
    Ok((group, thread))
}

/// Create the process context, install its globals and run the bootstrap script.
fn boot(process: &Arc<ProcessShared>) -> Result<Context, BridgeError> {
    let config = process.config();
    let context = create_context(config.identity.clone(), Arc::downgrade(process))?;
    context.with_scope(|scope| globals::install(scope, process))?;
    if let Some(source) = &config.bootstrap_script {
        match context.evaluate_unhandled(source, &ScriptOrigin::new("<bootstrap>")) {
            Ok(_) => {}
            // `process.exit()` during bootstrap is a normal exit, not a failure.
            Err(BridgeError::Terminated) if process.exit_request().is_some() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(context)
}

struct Runner {
    rx: mpsc::UnboundedReceiver<GroupCommand>,
    backlog: VecDeque<Task>,
    process: Option<Arc<ProcessShared>>,
    closed: bool,
}

impl Runner {
    fn new(rx: mpsc::UnboundedReceiver<GroupCommand>, process: Option<Arc<ProcessShared>>) -> Self {
        Self {
            rx,
            backlog: VecDeque::new(),
            process,
            closed: false,
        }
    }

    async fn run(&mut self) {
        loop {
            self.drain();
            let _ = with_core(GroupCore::pump);
            if let Some(task) = self.backlog.pop_front() {
                run_task(task);
                continue;
            }
            self.fire_due_timers();

            match self.process.clone() {
                Some(process) => {
                    if process.check_exit(|| self.settle()) {
                        break;
                    }
                    if !self.backlog.is_empty() {
                        continue;
                    }
                }
                None if self.closed => break,
                None => {}
            }

            let deadline = with_core(|core| core.state.timers.borrow().next_deadline())
                .ok()
                .flatten();
            let received = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        command = self.rx.recv() => Some(command),
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => None,
                    }
                }
                None => Some(self.rx.recv().await),
            };
            match received {
                Some(Some(command)) => self.accept(command),
                Some(None) => self.close(),
                None => {}
            }
        }
        // Work sent from now on is refused instead of silently dropped.
        self.rx.close();
        self.backlog.clear();
    }

    fn accept(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::Task(task) => self.backlog.push_back(task),
            GroupCommand::ReleaseHandle(id) => {
                let _ = with_core(|core| core.state.handles.borrow_mut().release(id));
            }
            GroupCommand::ReleaseResolver(id) => {
                let _ = with_core(|core| core.state.take_resolver(id));
            }
            GroupCommand::ReleaseContext(id) => {
                let _ = with_core(|core| core.state.remove_context(id));
            }
            GroupCommand::Wake => {}
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(process) = &self.process {
            process.request_exit(EXIT_CODE_ABANDONED);
        }
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(command) => self.accept(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.close();
                    break;
                }
            }
        }
    }

    /// Drain pending commands and report whether nothing is left to run.
    fn settle(&mut self) -> bool {
        self.drain();
        let timers_idle = with_core(|core| core.state.timers.borrow().is_empty()).unwrap_or(true);
        self.backlog.is_empty() && timers_idle
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            let due = with_core(|core| core.state.timers.borrow_mut().pop_due(now))
                .ok()
                .flatten();
            let Some(timer) = due else {
                break;
            };
            let result = with_core(|core| core.fire_timer(timer)).and_then(|r| r);
            match result {
                Ok(()) => {}
                Err(BridgeError::Script(exception)) => self.report_uncaught(exception),
                Err(BridgeError::Terminated) => {}
                Err(err) => tracing::warn!("timer callback failed: {}", err),
            }
        }
    }

    fn report_uncaught(&self, exception: ScriptException) {
        match &self.process {
            Some(process) => process.report_uncaught(exception),
            None => tracing::error!("uncaught exception in timer: {}", exception),
        }
    }
}

fn run_task(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!("group task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::NativeFunction;

    fn projection_counts() -> (usize, usize) {
        with_core(|core| {
            (
                core.state.callables.borrow().len(),
                core.state.natives.borrow().len(),
            )
        })
        .unwrap()
    }

    #[test]
    fn test_unreachable_projections_are_swept() {
        let group = ContextGroup::new().unwrap();
        let context = group.create_context().unwrap();

        for round in 0..50_i64 {
            let function = NativeFunction::new("f", move |_scope, _args| Ok(JSValue::Int(round)));
            context.set_property("f", function).unwrap();
        }
        assert_eq!(context.evaluate_script("f()").unwrap(), JSValue::Int(49));
        context.delete_property("f").unwrap();

        let (callables, natives) = group
            .invoke(|| {
                with_core(|core| {
                    core.js_runtime.v8_isolate().low_memory_notification();
                    core.pump();
                })
                .unwrap();
                Ok(projection_counts())
            })
            .unwrap();
        assert!(callables < 25, "{} callables still registered", callables);
        assert!(natives < 25, "{} projections still cached", natives);

        // A live projection keeps working after a sweep
        let function = NativeFunction::new("g", |_scope, _args| Ok(JSValue::Int(7)));
        context.set_property("g", function).unwrap();
        assert_eq!(context.evaluate_script("g()").unwrap(), JSValue::Int(7));
    }

    #[test]
    fn test_promise_reactions_are_released_on_settle() {
        let group = ContextGroup::new().unwrap();
        let context = group.create_context().unwrap();
        let (promise, resolver) = context.new_promise().unwrap();

        let (before, _) = group.invoke(|| Ok(projection_counts())).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        group
            .invoke(move || {
                promise.when_settled(move |result| {
                    tx.send(result).unwrap();
                })
            })
            .unwrap();
        let (waiting, _) = group.invoke(|| Ok(projection_counts())).unwrap();
        assert_eq!(waiting, before + 2);

        assert!(resolver.resolve(1));
        let settled = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(settled, Ok(JSValue::Int(1)));
        let (after, _) = group.invoke(|| Ok(projection_counts())).unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_timer_queue_orders_by_deadline() {
        let mut queue = TimerQueue::default();
        let late = queue.schedule(1, "late", Duration::from_millis(50), false);
        let early = queue.schedule(1, "early", Duration::from_millis(5), false);
        assert_ne!(late, early);
        assert_eq!(queue.len(), 2);

        assert!(queue.pop_due(Instant::now()).is_none());

        let later = Instant::now() + Duration::from_millis(100);
        let first = queue.pop_due(later).unwrap();
        assert_eq!(first.payload, "early");
        queue.rearm(first);
        let second = queue.pop_due(later).unwrap();
        assert_eq!(second.payload, "late");
        queue.rearm(second);

        assert!(queue.is_empty());
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn test_interval_rearms_until_cleared() {
        let mut queue = TimerQueue::default();
        let id = queue.schedule(1, (), Duration::from_millis(1), true);
        let later = Instant::now() + Duration::from_secs(1);

        let timer = queue.pop_due(later).unwrap();
        queue.rearm(timer);
        assert!(!queue.is_empty());
        assert!(queue.next_deadline().is_some());

        // Cleared while its callback runs
        let timer = queue.pop_due(later).unwrap();
        assert!(queue.clear(id));
        queue.rearm(timer);
        assert!(queue.is_empty());
        assert!(!queue.clear(id));
    }

    #[test]
    fn test_zero_delay_is_clamped() {
        let mut queue = TimerQueue::default();
        let before = Instant::now();
        queue.schedule(1, (), Duration::ZERO, false);
        assert!(queue.next_deadline().unwrap() >= before + MIN_TIMER_DELAY);
        assert!(queue.pop_due(before).is_none());
    }

    #[test]
    fn test_clear_context_drops_only_its_timers() {
        let mut queue = TimerQueue::default();
        queue.schedule(1, "a", Duration::from_millis(1), false);
        queue.schedule(2, "b", Duration::from_millis(1), true);
        queue.clear_context(2);
        assert_eq!(queue.len(), 1);
        let timer = queue.pop_due(Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(timer.context_id, 1);
    }
}
