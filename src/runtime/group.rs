//! Context groups: one isolate on one dedicated thread.
//!
//! Contexts in the same group share a heap, so values move between them as live
//! handles. Every JS operation on a group runs on its thread; other threads
//! reach it through [`ContextGroup::dispatch_async`] and
//! [`ContextGroup::invoke`].

use crate::runtime::config::GroupConfig;
use crate::runtime::context::Context;
use crate::runtime::error::BridgeError;
use crate::runtime::runner::{self, GroupCommand};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;
use tokio::sync::mpsc;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct GroupShared {
    id: u64,
    sender: mpsc::UnboundedSender<GroupCommand>,
    thread: OnceLock<ThreadId>,
}

/// Handle to a context group. Cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct ContextGroup {
    shared: Arc<GroupShared>,
}

impl ContextGroup {
    /// Spawn a group with default isolate settings.
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_config(GroupConfig::default())
    }

    pub fn with_config(config: GroupConfig) -> Result<Self, BridgeError> {
        runner::spawn_group(config)
    }

    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<GroupCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = GroupShared {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            sender,
            thread: OnceLock::new(),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            receiver,
        )
    }

    pub(crate) fn from_shared(shared: Arc<GroupShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<GroupShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn bind_thread(&self, thread: ThreadId) {
        let _ = self.shared.thread.set(thread);
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Create a context in this group. The first context reuses the isolate's
    /// main context.
    pub fn create_context(&self) -> Result<Context, BridgeError> {
        self.create_named_context(format!("context-{}", self.id()))
    }

    pub fn create_named_context(&self, name: impl Into<String>) -> Result<Context, BridgeError> {
        let name = name.into();
        self.invoke(move || runner::create_context(name, Weak::new()))
    }

    /// Queue `task` to run on the group thread.
    pub fn dispatch_async<F>(&self, task: F) -> Result<(), BridgeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(GroupCommand::Task(Box::new(task)))
    }

    /// Run `task` on the group thread and wait for its result.
    ///
    /// Runs inline when already on the group thread. Calling this from another
    /// group's thread blocks that group until `task` completes.
    pub fn invoke<R, F>(&self, task: F) -> Result<R, BridgeError>
    where
        F: FnOnce() -> Result<R, BridgeError> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current_thread() {
            return task();
        }
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        self.dispatch_async(move || {
            let _ = result_tx.send(task());
        })?;
        result_rx.recv().map_err(|_| BridgeError::Terminated)?
    }

    pub fn is_current_thread(&self) -> bool {
        self.shared.thread.get() == Some(&std::thread::current().id())
    }

    /// Whether the group thread has stopped accepting work.
    pub fn is_terminated(&self) -> bool {
        self.shared.sender.is_closed()
    }

    pub fn same_group(&self, other: &ContextGroup) -> bool {
        self.shared.id == other.shared.id
    }

    pub(crate) fn send(&self, command: GroupCommand) -> Result<(), BridgeError> {
        self.shared
            .sender
            .send(command)
            .map_err(|_| BridgeError::Terminated)
    }

    /// Send without caring whether the thread is still there.
    pub(crate) fn send_quiet(&self, command: GroupCommand) {
        let _ = self.shared.sender.send(command);
    }

    pub(crate) fn wake(&self) {
        self.send_quiet(GroupCommand::Wake);
    }
}

impl PartialEq for ContextGroup {
    fn eq(&self, other: &Self) -> bool {
        self.same_group(other)
    }
}

impl Eq for ContextGroup {}

impl fmt::Debug for ContextGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGroup")
            .field("id", &self.shared.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
