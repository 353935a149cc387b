#![allow(dead_code)]

use jsprocess::runtime::{
    BridgeError, Context, EventChannel, EventListener, Process, ProcessConfig, ProcessEvent,
};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

type StartHook = Box<dyn Fn(&Process, &Context) + Send + Sync>;
type AboutToExitHook = Box<dyn Fn(&Process, i32) + Send + Sync>;

/// Listener that runs optional hooks and records every notification.
pub struct Recorder {
    channel: Arc<EventChannel>,
    on_start: Option<StartHook>,
    on_about_to_exit: Option<AboutToExitHook>,
}

impl Recorder {
    pub fn new() -> (Self, Receiver<ProcessEvent>) {
        let (channel, events) = EventChannel::new();
        (
            Self {
                channel,
                on_start: None,
                on_about_to_exit: None,
            },
            events,
        )
    }

    pub fn on_start(mut self, hook: impl Fn(&Process, &Context) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_about_to_exit(mut self, hook: impl Fn(&Process, i32) + Send + Sync + 'static) -> Self {
        self.on_about_to_exit = Some(Box::new(hook));
        self
    }
}

impl EventListener for Recorder {
    fn on_process_start(&self, process: &Process, context: &Context) {
        if let Some(hook) = &self.on_start {
            hook(process, context);
        }
        self.channel.on_process_start(process, context);
    }

    fn on_process_about_to_exit(&self, process: &Process, exit_code: i32) {
        if let Some(hook) = &self.on_about_to_exit {
            hook(process, exit_code);
        }
        self.channel.on_process_about_to_exit(process, exit_code);
    }

    fn on_process_exit(&self, process: &Process, exit_code: i32) {
        self.channel.on_process_exit(process, exit_code);
    }

    fn on_process_failed(&self, process: &Process, error: &BridgeError) {
        self.channel.on_process_failed(process, error);
    }
}

/// Start a process whose recorder keeps it alive until the test lets it die.
pub fn held_process(identity: &str) -> (Process, Receiver<ProcessEvent>) {
    let (recorder, events) = Recorder::new();
    let recorder = recorder.on_start(|process, _context| process.keep_alive());
    let process = Process::with_config(ProcessConfig::new(identity), Some(Arc::new(recorder))).unwrap();
    expect_start(&events);
    (process, events)
}

pub fn expect_start(events: &Receiver<ProcessEvent>) -> Context {
    match events.recv_timeout(WAIT).unwrap() {
        ProcessEvent::Start { context } => context,
        other => panic!("expected start, got {:?}", other),
    }
}

/// Every event up to and including `exit` or `failed`.
pub fn collect_until_done(events: &Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events.recv_timeout(WAIT).unwrap();
        let done = matches!(event, ProcessEvent::Exit { .. } | ProcessEvent::Failed { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Short names of `events`, e.g. `["start", "about-to-exit:0", "exit:0"]`.
pub fn names(events: &[ProcessEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            ProcessEvent::Start { .. } => "start".to_string(),
            ProcessEvent::AboutToExit { code } => format!("about-to-exit:{}", code),
            ProcessEvent::Exit { code } => format!("exit:{}", code),
            ProcessEvent::Failed { .. } => "failed".to_string(),
        })
        .collect()
}
