//! Node-style JavaScript processes on dedicated threads.
//!
//! A [`ContextGroup`] owns one V8 isolate and the thread it runs on. Contexts
//! created in a group evaluate scripts and exchange [`JSValue`]s with native
//! code, and a [`Process`] wraps a group with a `process` global, timers and
//! an exit lifecycle reported through [`EventListener`]s.

pub mod runtime;

pub use runtime::{
    BridgeError, Context, ContextGroup, EventListener, GroupConfig, JSValue, NativeFunction,
    NativeObject, Process, ProcessConfig, ProcessRegistry, ProcessState, ScriptException,
};
