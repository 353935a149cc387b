//! Node-style processes: a context group with a lifecycle.
//!
//! A process owns one group thread and one context with `process`, timers and
//! `console` installed. It stays alive while it has pending timers, queued
//! tasks or keep-alive references, then announces `about-to-exit` (which
//! listeners may veto by calling `keep_alive`) and finally `exit`.
//!
//! ```text
//! Created -> Starting -> Active <-> AboutToExit -> Exited -> Disposed
//!                 \______________________________/
//!                          (failed)
//! ```

use crate::runtime::config::{validate_identity, AccessMask, ProcessConfig};
use crate::runtime::context::Context;
use crate::runtime::error::{BridgeError, ScriptException};
use crate::runtime::events::{self, EventListener, Lifecycle, ListenerEntry, ListenerId, ScriptEvent};
use crate::runtime::group::ContextGroup;
use crate::runtime::handle::JsFunction;
use crate::runtime::runner;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Exit code reported when every owning handle was dropped while running.
pub const EXIT_CODE_ABANDONED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Created,
    Starting,
    Active,
    AboutToExit,
    Exited,
    Disposed,
}

impl ProcessState {
    pub fn is_done(self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::Disposed)
    }

    fn is_running(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Active | ProcessState::AboutToExit
        )
    }
}

struct ProcessInner {
    state: ProcessState,
    keep_alive: u32,
    exit_code: Option<i32>,
    script_exit_code: i32,
    exit_request: Option<i32>,
    failure: Option<String>,
    listeners: Vec<ListenerEntry>,
    next_listener: u64,
    context: Option<Context>,
    group: Option<ContextGroup>,
    /// Exit or failure listeners have been notified.
    notified: bool,
}

pub(crate) struct ProcessShared {
    config: ProcessConfig,
    inner: Mutex<ProcessInner>,
    done: Condvar,
}

enum CatchUp {
    /// Deliver `start`, then register the listener under the given id.
    Start(ListenerId, Context),
    Exit(i32),
    Failed(String),
}

impl ProcessShared {
    fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ProcessInner {
                state: ProcessState::Created,
                keep_alive: 0,
                exit_code: None,
                script_exit_code: 0,
                exit_request: None,
                failure: None,
                listeners: Vec::new(),
                next_listener: 0,
                context: None,
                group: None,
                notified: false,
            }),
            done: Condvar::new(),
        }
    }

    pub(crate) fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub(crate) fn identity(&self) -> &str {
        &self.config.identity
    }

    fn push_native(inner: &mut ProcessInner, listener: Arc<dyn EventListener>) -> ListenerId {
        inner.next_listener += 1;
        let id = ListenerId(inner.next_listener);
        inner.listeners.push(ListenerEntry::Native { id, listener });
        id
    }

    fn attach_group(&self, group: ContextGroup) {
        let mut inner = self.inner.lock();
        if !inner.state.is_done() {
            inner.group = Some(group);
        }
    }

    pub(crate) fn keep_alive(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_done() {
            return;
        }
        inner.keep_alive = inner.keep_alive.saturating_add(1);
    }

    pub(crate) fn let_die(&self) {
        let group = {
            let mut inner = self.inner.lock();
            inner.keep_alive = inner.keep_alive.saturating_sub(1);
            if inner.keep_alive > 0 {
                return;
            }
            inner.group.clone()
        };
        if let Some(group) = group {
            group.wake();
        }
    }

    /// Ask the process to exit with `code`. The first request wins.
    pub(crate) fn request_exit(&self, code: i32) {
        let group = {
            let mut inner = self.inner.lock();
            if !inner.state.is_running() {
                return;
            }
            if inner.exit_request.is_none() {
                inner.exit_request = Some(code);
            }
            inner.group.clone()
        };
        if let Some(group) = group {
            group.wake();
        }
    }

    fn abandon(&self) {
        let running = self.inner.lock().state.is_running();
        if running {
            tracing::debug!(process = self.identity(), "process abandoned by its owners");
            self.request_exit(EXIT_CODE_ABANDONED);
        }
    }

    pub(crate) fn script_exit_code(&self) -> i32 {
        self.inner.lock().script_exit_code
    }

    pub(crate) fn set_script_exit_code(&self, code: i32) {
        self.inner.lock().script_exit_code = code & 0xff;
    }

    pub(crate) fn add_script_listener(&self, event: ScriptEvent, function: JsFunction) {
        let mut inner = self.inner.lock();
        if !inner.state.is_done() {
            inner.listeners.push(ListenerEntry::Script { event, function });
        }
    }

    /// Initialization failed: deliver `failed` and nothing else.
    pub(crate) fn fail(self: &Arc<Self>, message: String) {
        let (listeners, context) = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                return;
            }
            inner.state = ProcessState::Exited;
            inner.failure = Some(message.clone());
            inner.exit_code = None;
            (std::mem::take(&mut inner.listeners), inner.context.clone())
        };
        if let Some(context) = context {
            context.mark_defunct();
        }
        tracing::error!(process = self.identity(), "process failed: {}", message);

        let error = BridgeError::ProcessFailed(message);
        events::dispatch(&listeners, &Process::view(self.clone()), Lifecycle::Failed(&error));
        self.mark_notified();
    }

    /// Initialization finished: go active and deliver `start`.
    pub(crate) fn start(self: &Arc<Self>, context: Context) {
        let listeners = {
            let mut inner = self.inner.lock();
            inner.context = Some(context.clone());
            inner.state = ProcessState::Active;
            inner.listeners.clone()
        };
        tracing::info!(process = self.identity(), "process started");
        events::dispatch(&listeners, &Process::view(self.clone()), Lifecycle::Start(&context));
    }

    /// Drive the exit state machine from the group thread.
    ///
    /// `settle` drains pending commands and reports whether the process has no
    /// queued tasks and no timers left. Returns true once the process exited.
    pub(crate) fn check_exit(self: &Arc<Self>, mut settle: impl FnMut() -> bool) -> bool {
        if let Some(code) = self.exit_request() {
            let listeners = {
                let mut inner = self.inner.lock();
                inner.state = ProcessState::AboutToExit;
                inner.listeners.clone()
            };
            self.deliver_about_to_exit(code, &listeners);
            self.finish(code);
            return true;
        }

        if !settle() {
            return false;
        }
        let Some((code, listeners)) = self.begin_about_to_exit() else {
            return false;
        };
        self.deliver_about_to_exit(code, &listeners);

        let idle = settle();
        if let Some(code) = self.exit_request() {
            self.finish(code);
            return true;
        }

        let code = {
            let mut inner = self.inner.lock();
            if inner.keep_alive > 0 || !idle {
                inner.state = ProcessState::Active;
                None
            } else {
                Some(inner.script_exit_code)
            }
        };
        match code {
            Some(code) => {
                self.finish(code);
                true
            }
            None => {
                tracing::debug!(process = self.identity(), "exit aborted");
                false
            }
        }
    }

    pub(crate) fn exit_request(&self) -> Option<i32> {
        self.inner.lock().exit_request
    }

    fn begin_about_to_exit(&self) -> Option<(i32, Vec<ListenerEntry>)> {
        let mut inner = self.inner.lock();
        let idle = inner.state == ProcessState::Active
            && inner.keep_alive == 0
            && inner.exit_request.is_none();
        if !idle {
            return None;
        }
        inner.state = ProcessState::AboutToExit;
        Some((inner.script_exit_code, inner.listeners.clone()))
    }

    fn deliver_about_to_exit(self: &Arc<Self>, code: i32, listeners: &[ListenerEntry]) {
        let view = Process::view(self.clone());
        for exception in events::dispatch(listeners, &view, Lifecycle::AboutToExit(code)) {
            self.report_uncaught(exception);
        }
    }

    /// Script `exit` listeners run while the context is still usable; native
    /// listeners are told afterwards.
    fn finish(self: &Arc<Self>, code: i32) {
        let (listeners, context) = {
            let mut inner = self.inner.lock();
            inner.state = ProcessState::Exited;
            inner.exit_code = Some(code);
            (std::mem::take(&mut inner.listeners), inner.context.clone())
        };
        let (scripts, natives): (Vec<_>, Vec<_>) = listeners
            .into_iter()
            .partition(|entry| matches!(entry, ListenerEntry::Script { .. }));

        let view = Process::view(self.clone());
        for exception in events::dispatch(&scripts, &view, Lifecycle::Exit(code)) {
            tracing::error!(
                process = self.identity(),
                "exception in exit listener: {}",
                exception
            );
        }
        if let Some(context) = &context {
            context.mark_defunct();
        }
        tracing::info!(process = self.identity(), exit_code = code, "process exited");

        events::dispatch(&natives, &view, Lifecycle::Exit(code));
        self.mark_notified();
    }

    fn mark_notified(&self) {
        self.inner.lock().notified = true;
        self.done.notify_all();
    }

    /// The group thread is gone.
    fn dispose(self: &Arc<Self>, panicked: bool) {
        let starting = matches!(
            self.inner.lock().state,
            ProcessState::Created | ProcessState::Starting
        );
        if panicked && starting {
            self.fail("process thread panicked during startup".to_string());
        } else if panicked {
            tracing::error!(process = self.identity(), "process thread panicked");
            let listeners = {
                let mut inner = self.inner.lock();
                if inner.state.is_done() {
                    Vec::new()
                } else {
                    inner.state = ProcessState::Exited;
                    inner.exit_code = Some(1);
                    std::mem::take(&mut inner.listeners)
                }
            };
            events::dispatch(&listeners, &Process::view(self.clone()), Lifecycle::Exit(1));
        }

        {
            let mut inner = self.inner.lock();
            inner.state = ProcessState::Disposed;
            inner.notified = true;
            inner.keep_alive = 0;
            inner.listeners.clear();
        }
        self.done.notify_all();
        tracing::debug!(process = self.identity(), "process disposed");
    }

    /// Exception nobody caught: the context handler gets it, otherwise the
    /// process exits with code 1.
    pub(crate) fn report_uncaught(&self, exception: ScriptException) {
        let context = self.inner.lock().context.clone();
        let handled = context
            .map(|context| context.handle_exception(&exception))
            .unwrap_or(false);
        if !handled {
            tracing::error!(process = self.identity(), "uncaught exception: {}", exception);
            self.request_exit(1);
        }
    }

    /// What a listener registered after the process finished is told.
    fn finished_catch_up(inner: &ProcessInner) -> CatchUp {
        match &inner.failure {
            Some(message) => CatchUp::Failed(message.clone()),
            None => CatchUp::Exit(inner.exit_code.unwrap_or(0)),
        }
    }

    /// Register a listener that already received `start`, or replay the end
    /// if the process finished meanwhile.
    fn attach_late(self: &Arc<Self>, id: ListenerId, listener: Arc<dyn EventListener>) {
        let catch_up = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                Self::finished_catch_up(&inner)
            } else {
                inner.listeners.push(ListenerEntry::Native { id, listener });
                return;
            }
        };
        self.catch_up(listener, catch_up);
    }

    fn catch_up(self: &Arc<Self>, listener: Arc<dyn EventListener>, catch_up: CatchUp) {
        let view = Process::view(self.clone());
        match catch_up {
            CatchUp::Start(id, context) => {
                let group = context.group().clone();
                if group.is_current_thread() {
                    events::notify(listener.as_ref(), &view, Lifecycle::Start(&context));
                    self.attach_late(id, listener);
                    return;
                }
                let shared = self.clone();
                let late = listener.clone();
                let delivered = group.invoke(move || {
                    events::notify(late.as_ref(), &view, Lifecycle::Start(&context));
                    shared.attach_late(id, late);
                    Ok(())
                });
                if let Err(err) = delivered {
                    tracing::debug!(process = self.identity(), "start catch-up skipped: {}", err);
                    self.attach_late(id, listener);
                }
            }
            CatchUp::Exit(code) => {
                events::notify(listener.as_ref(), &view, Lifecycle::Exit(code));
            }
            CatchUp::Failed(message) => {
                let error = BridgeError::ProcessFailed(message);
                events::notify(listener.as_ref(), &view, Lifecycle::Failed(&error));
            }
        }
    }
}

/// Owning handles keep the process running; views handed to listeners don't.
struct OwnerGuard {
    shared: Arc<ProcessShared>,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.shared.abandon();
    }
}

/// Handle to a running process.
///
/// The handle returned by [`Process::new`] and its clones own the process:
/// once all of them are dropped a process that is still running exits with
/// [`EXIT_CODE_ABANDONED`].
#[derive(Clone)]
pub struct Process {
    shared: Arc<ProcessShared>,
    owner: Option<Arc<OwnerGuard>>,
}

impl Process {
    /// Start a process named `identity`.
    pub fn new(
        identity: impl Into<String>,
        access: AccessMask,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Result<Self, BridgeError> {
        Self::with_config(ProcessConfig::new(identity).with_access(access), listener)
    }

    pub fn with_config(
        config: ProcessConfig,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Result<Self, BridgeError> {
        Self::with_listeners(config, listener.into_iter().collect())
    }

    /// Start a process with several listeners, all registered before anything
    /// is delivered.
    pub fn with_listeners(
        config: ProcessConfig,
        listeners: Vec<Arc<dyn EventListener>>,
    ) -> Result<Self, BridgeError> {
        validate_identity(&config.identity)?;
        let reaper_name = format!("{}-reaper", config.thread_name());

        let shared = Arc::new(ProcessShared::new(config));
        {
            let mut inner = shared.inner.lock();
            for listener in listeners {
                ProcessShared::push_native(&mut inner, listener);
            }
            inner.state = ProcessState::Starting;
        }

        let (group, thread) = runner::spawn_process_thread(shared.clone())?;
        shared.attach_group(group);

        let process = Process {
            shared: shared.clone(),
            owner: Some(Arc::new(OwnerGuard {
                shared: shared.clone(),
            })),
        };

        std::thread::Builder::new()
            .name(reaper_name)
            .spawn(move || {
                let panicked = thread.join().is_err();
                shared.dispose(panicked);
            })?;

        Ok(process)
    }

    pub(crate) fn view(shared: Arc<ProcessShared>) -> Self {
        Self {
            shared,
            owner: None,
        }
    }

    pub fn identity(&self) -> &str {
        self.shared.identity()
    }

    pub fn access_mask(&self) -> AccessMask {
        self.shared.config.access
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ProcessState {
        self.shared.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            ProcessState::Active | ProcessState::AboutToExit
        )
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Exit code once exited. `None` while running or after a failure.
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.inner.lock().exit_code
    }

    /// Initialization error, if the process failed to start.
    pub fn failure(&self) -> Option<String> {
        self.shared.inner.lock().failure.clone()
    }

    /// The process context, available once the process is active.
    pub fn context(&self) -> Option<Context> {
        self.shared.inner.lock().context.clone()
    }

    pub fn group(&self) -> Option<ContextGroup> {
        self.shared.inner.lock().group.clone()
    }

    /// Hold the process open until a matching [`let_die`](Self::let_die).
    pub fn keep_alive(&self) {
        self.shared.keep_alive();
    }

    pub fn let_die(&self) {
        self.shared.let_die();
    }

    /// Keep-alive reference released on drop.
    pub fn keep_alive_guard(&self) -> KeepAliveGuard {
        self.keep_alive();
        KeepAliveGuard {
            process: Process::view(self.shared.clone()),
        }
    }

    pub fn keep_alive_count(&self) -> u32 {
        self.shared.inner.lock().keep_alive
    }

    /// Exit as soon as the group thread is free. Later calls are ignored.
    pub fn exit(&self, code: i32) {
        self.shared.request_exit(code);
    }

    /// Register `listener`. Events the process is already past are replayed:
    /// `start` for a running process, `exit` or `failed` for a finished one.
    /// A running process only dispatches to the listener after its `start`.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let (id, catch_up) = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ProcessState::Created | ProcessState::Starting => {
                    (ProcessShared::push_native(&mut inner, listener.clone()), None)
                }
                ProcessState::Active | ProcessState::AboutToExit => {
                    inner.next_listener += 1;
                    let id = ListenerId(inner.next_listener);
                    match inner.context.clone() {
                        // Visible to dispatch only once `start` was delivered
                        Some(context) => (id, Some(CatchUp::Start(id, context))),
                        None => {
                            inner.listeners.push(ListenerEntry::Native {
                                id,
                                listener: listener.clone(),
                            });
                            (id, None)
                        }
                    }
                }
                ProcessState::Exited | ProcessState::Disposed => {
                    inner.next_listener += 1;
                    let catch_up = ProcessShared::finished_catch_up(&inner);
                    (ListenerId(inner.next_listener), Some(catch_up))
                }
            }
        };
        if let Some(catch_up) = catch_up {
            self.shared.catch_up(listener, catch_up);
        }
        id
    }

    /// Returns false when `id` is not registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.shared.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|entry| match entry {
            ListenerEntry::Native { id: existing, .. } => *existing != id,
            ListenerEntry::Script { .. } => true,
        });
        inner.listeners.len() != before
    }

    /// Block until exit (or failure) listeners have been notified.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut inner = self.shared.inner.lock();
        self.shared
            .done
            .wait_while_for(&mut inner, |inner| !inner.notified, timeout);
        inner.notified
    }

    /// Block until the group thread has been torn down.
    pub fn wait_for_disposal(&self, timeout: Duration) -> bool {
        let mut inner = self.shared.inner.lock();
        self.shared.done.wait_while_for(
            &mut inner,
            |inner| inner.state != ProcessState::Disposed,
            timeout,
        );
        inner.state == ProcessState::Disposed
    }

    pub(crate) fn shared(&self) -> &Arc<ProcessShared> {
        &self.shared
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("owner", &self.owner.is_some())
            .finish()
    }
}

/// RAII keep-alive reference from [`Process::keep_alive_guard`].
pub struct KeepAliveGuard {
    process: Process,
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        self.process.let_die();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::events::{EventChannel, ProcessEvent};

    fn shared_in(state: ProcessState) -> (Arc<ProcessShared>, std::sync::mpsc::Receiver<ProcessEvent>) {
        let shared = Arc::new(ProcessShared::new(ProcessConfig::new("unit")));
        let (listener, events) = EventChannel::new();
        {
            let mut inner = shared.inner.lock();
            ProcessShared::push_native(&mut inner, listener);
            inner.state = state;
        }
        (shared, events)
    }

    #[test]
    fn test_panic_during_startup_is_a_failure() {
        let (shared, events) = shared_in(ProcessState::Starting);
        shared.dispose(true);

        let received: Vec<ProcessEvent> = events.try_iter().collect();
        assert_eq!(received.len(), 1, "unexpected events: {:?}", received);
        match &received[0] {
            ProcessEvent::Failed { error } => assert!(error.contains("panicked"), "{}", error),
            other => panic!("expected a failure, got {:?}", other),
        }

        let process = Process::view(shared);
        assert_eq!(process.state(), ProcessState::Disposed);
        assert_eq!(process.exit_code(), None);
        assert!(process.failure().is_some());
    }

    #[test]
    fn test_panic_after_start_exits_with_one() {
        let (shared, events) = shared_in(ProcessState::Active);
        shared.dispose(true);

        let received: Vec<ProcessEvent> = events.try_iter().collect();
        assert!(
            matches!(received.as_slice(), [ProcessEvent::Exit { code: 1 }]),
            "unexpected events: {:?}",
            received
        );
        let process = Process::view(shared);
        assert_eq!(process.exit_code(), Some(1));
        assert_eq!(process.failure(), None);
    }

    #[test]
    fn test_state_classification() {
        assert!(ProcessState::Exited.is_done());
        assert!(ProcessState::Disposed.is_done());
        assert!(!ProcessState::AboutToExit.is_done());
        assert!(ProcessState::AboutToExit.is_running());
        assert!(!ProcessState::Created.is_running());
    }

    #[test]
    fn test_keep_alive_counts_saturate() {
        let shared = ProcessShared::new(ProcessConfig::new("unit"));
        shared.let_die();
        assert_eq!(shared.inner.lock().keep_alive, 0);
        shared.keep_alive();
        shared.keep_alive();
        shared.let_die();
        assert_eq!(shared.inner.lock().keep_alive, 1);
    }

    #[test]
    fn test_exit_requests_need_a_running_process() {
        let shared = ProcessShared::new(ProcessConfig::new("unit"));
        shared.request_exit(3);
        assert_eq!(shared.exit_request(), None);

        shared.inner.lock().state = ProcessState::Active;
        shared.request_exit(3);
        shared.request_exit(4);
        assert_eq!(shared.exit_request(), Some(3));
    }

    #[test]
    fn test_script_exit_code_is_masked() {
        let shared = ProcessShared::new(ProcessConfig::new("unit"));
        shared.set_script_exit_code(256 + 7);
        assert_eq!(shared.script_exit_code(), 7);
        shared.set_script_exit_code(-1);
        assert_eq!(shared.script_exit_code(), 255);
    }
}
