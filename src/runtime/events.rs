//! Process lifecycle notifications.
//!
//! Native listeners implement [`EventListener`]; scripts subscribe with
//! `process.on('beforeExit' | 'exit', fn)`. Listeners run one at a time and a
//! failing listener never stops the others from being notified.

use crate::runtime::context::Context;
use crate::runtime::error::{BridgeError, ScriptException};
use crate::runtime::handle::JsFunction;
use crate::runtime::js_value::JSValue;
use crate::runtime::process::Process;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Observer of a process's lifecycle.
///
/// A process delivers either `on_process_failed` alone, or `on_process_start`,
/// then at most one `on_process_about_to_exit` per exit attempt, then
/// `on_process_exit` exactly once.
pub trait EventListener: Send + Sync {
    fn on_process_start(&self, process: &Process, context: &Context);

    /// The process ran out of work. Calling `keep_alive` from here keeps it running.
    fn on_process_about_to_exit(&self, process: &Process, exit_code: i32);

    fn on_process_exit(&self, process: &Process, exit_code: i32);

    fn on_process_failed(&self, process: &Process, error: &BridgeError);
}

/// Registration token returned by `add_event_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Owned copy of a lifecycle notification.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Start { context: Context },
    AboutToExit { code: i32 },
    Exit { code: i32 },
    Failed { error: String },
}

/// Listener that forwards every notification into a channel.
pub struct EventChannel {
    sender: Mutex<Sender<ProcessEvent>>,
}

impl EventChannel {
    pub fn new() -> (Arc<Self>, Receiver<ProcessEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(sender),
            }),
            receiver,
        )
    }

    fn forward(&self, event: ProcessEvent) {
        let _ = self.sender.lock().send(event);
    }
}

impl EventListener for EventChannel {
    fn on_process_start(&self, _process: &Process, context: &Context) {
        self.forward(ProcessEvent::Start {
            context: context.clone(),
        });
    }

    fn on_process_about_to_exit(&self, _process: &Process, exit_code: i32) {
        self.forward(ProcessEvent::AboutToExit { code: exit_code });
    }

    fn on_process_exit(&self, _process: &Process, exit_code: i32) {
        self.forward(ProcessEvent::Exit { code: exit_code });
    }

    fn on_process_failed(&self, _process: &Process, error: &BridgeError) {
        self.forward(ProcessEvent::Failed {
            error: error.to_string(),
        });
    }
}

/// Events scripts can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScriptEvent {
    BeforeExit,
    Exit,
}

impl ScriptEvent {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name {
            "beforeExit" => Some(Self::BeforeExit),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub(crate) enum ListenerEntry {
    Native {
        id: ListenerId,
        listener: Arc<dyn EventListener>,
    },
    Script {
        event: ScriptEvent,
        function: JsFunction,
    },
}

/// A notification being delivered.
#[derive(Clone, Copy)]
pub(crate) enum Lifecycle<'a> {
    Start(&'a Context),
    AboutToExit(i32),
    Exit(i32),
    Failed(&'a BridgeError),
}

impl Lifecycle<'_> {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Start(_) => "start",
            Lifecycle::AboutToExit(_) => "about-to-exit",
            Lifecycle::Exit(_) => "exit",
            Lifecycle::Failed(_) => "failed",
        }
    }

    fn script_event(&self) -> Option<(ScriptEvent, i32)> {
        match *self {
            Lifecycle::AboutToExit(code) => Some((ScriptEvent::BeforeExit, code)),
            Lifecycle::Exit(code) => Some((ScriptEvent::Exit, code)),
            _ => None,
        }
    }
}

impl fmt::Debug for Lifecycle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deliver `event` to one native listener, containing any panic.
pub(crate) fn notify(listener: &dyn EventListener, process: &Process, event: Lifecycle<'_>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match event {
        Lifecycle::Start(context) => listener.on_process_start(process, context),
        Lifecycle::AboutToExit(code) => listener.on_process_about_to_exit(process, code),
        Lifecycle::Exit(code) => listener.on_process_exit(process, code),
        Lifecycle::Failed(error) => listener.on_process_failed(process, error),
    }));
    if outcome.is_err() {
        tracing::error!(
            process = process.identity(),
            event = event.name(),
            "event listener panicked"
        );
    }
}

/// Deliver `event` to every listener in registration order.
///
/// Returns the exceptions thrown by script listeners.
pub(crate) fn dispatch(
    listeners: &[ListenerEntry],
    process: &Process,
    event: Lifecycle<'_>,
) -> Vec<ScriptException> {
    let mut thrown = Vec::new();
    for entry in listeners {
        match entry {
            ListenerEntry::Native { listener, .. } => notify(listener.as_ref(), process, event),
            ListenerEntry::Script { event: wanted, function } => {
                let Some((kind, code)) = event.script_event() else {
                    continue;
                };
                if kind != *wanted {
                    continue;
                }
                match function.call(JSValue::Undefined, vec![JSValue::Int(i64::from(code))]) {
                    Ok(_) => {}
                    Err(BridgeError::Script(exception)) => thrown.push(exception),
                    Err(err) => tracing::debug!(
                        process = process.identity(),
                        event = event.name(),
                        "script listener skipped: {}",
                        err
                    ),
                }
            }
        }
    }
    thrown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_event_names() {
        assert_eq!(ScriptEvent::parse("beforeExit"), Some(ScriptEvent::BeforeExit));
        assert_eq!(ScriptEvent::parse("exit"), Some(ScriptEvent::Exit));
        assert_eq!(ScriptEvent::parse("close"), None);
    }

    #[test]
    fn test_only_exit_events_reach_scripts() {
        assert_eq!(
            Lifecycle::AboutToExit(3).script_event(),
            Some((ScriptEvent::BeforeExit, 3))
        );
        assert_eq!(Lifecycle::Exit(0).script_event(), Some((ScriptEvent::Exit, 0)));
        let error = BridgeError::Terminated;
        assert_eq!(Lifecycle::Failed(&error).script_event(), None);
    }
}
