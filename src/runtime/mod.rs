//! Thread-confined JavaScript groups, contexts and Node-style processes.
//!
//! This module implements a Rust-first runtime bridge on top of `deno_core`.
//! Each context group owns a single V8 isolate running on a dedicated OS thread
//! with a Tokio event loop; processes add a lifecycle, timers and keep-alive
//! accounting on top of a group.

pub mod bridge;
pub mod config;
pub mod context;
pub(crate) mod conversion;
pub mod error;
pub mod events;
pub(crate) mod globals;
pub mod group;
pub mod handle;
pub mod js_value;
pub mod process;
pub mod registry;
pub(crate) mod runner;
pub mod scope;

// Re-export key types for convenience
pub use bridge::{coerce_args, NativeFunction, NativeObject, NativeObjectBuilder, ParamType, PropertyAttributes};
pub use config::{validate_identity, AccessMask, GroupConfig, ProcessConfig};
pub use context::{Context, ContextId, ExceptionHandler, ScriptOrigin};
pub use error::{BridgeError, ScriptException};
pub use events::{EventChannel, EventListener, ListenerId, ProcessEvent};
pub use globals::CONSOLE_TARGET;
pub use group::ContextGroup;
pub use handle::{JsFunction, JsObject, JsPromise, PromiseResolver, PromiseState};
pub use js_value::{ByteBuffer, JSValue, LimitTracker, TypedArrayKind, MAX_JS_BYTES, MAX_JS_DEPTH};
pub use process::{KeepAliveGuard, Process, ProcessState, EXIT_CODE_ABANDONED};
pub use registry::{FsStore, PersistentStore, ProcessRegistry, UninstallScope};
pub use scope::JsScope;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_group_lifecycle() {
        let group = ContextGroup::new().unwrap();
        assert!(!group.is_terminated());
        assert!(!group.is_current_thread());

        let context = group.create_context().unwrap();
        let result = context.evaluate_script("40 + 2");
        assert_eq!(result.unwrap(), JSValue::Int(42));
        assert!(!context.is_defunct());
        assert!(context.process().is_none());
    }

    #[test]
    fn test_multiple_groups_sequential() {
        for i in 0..3 {
            let group = ContextGroup::new().unwrap();
            let context = group.create_context().unwrap();

            let code = format!("{} * 2", i);
            let result = context.evaluate_script(&code);
            assert_eq!(result.unwrap(), JSValue::Int(i * 2));
        }
    }

    #[test]
    fn test_concurrent_groups() {
        let mut contexts = vec![];

        for _ in 0..3 {
            let group = ContextGroup::new().unwrap();
            contexts.push(group.create_context().unwrap());
        }

        let mut threads = vec![];
        for (i, context) in contexts.into_iter().enumerate() {
            let t = thread::spawn(move || {
                let code = format!("{} + 100", i);
                let result = context.evaluate_script(&code);
                assert_eq!(result.unwrap(), JSValue::Int(i as i64 + 100));
            });
            threads.push(t);
        }

        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_group_with_heap_limits() {
        let config = GroupConfig::new()
            .with_max_heap_size(10 * 1024 * 1024) // 10 MB
            .with_initial_heap_size(1024 * 1024); // 1 MB

        let group = ContextGroup::with_config(config).unwrap();
        let context = group.create_context().unwrap();

        let result = context.evaluate_script("'hello'");
        assert_eq!(result.unwrap(), JSValue::String("hello".into()));
    }

    #[test]
    fn test_group_rejects_invalid_heap_limits() {
        let config = GroupConfig::new().with_initial_heap_size(1024 * 1024);
        let err = ContextGroup::with_config(config).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }

    #[test]
    fn test_context_state_persistence() {
        let group = ContextGroup::new().unwrap();
        let context = group.create_context().unwrap();

        let result1 = context.evaluate_script("var counter = 0; counter");
        assert_eq!(result1.unwrap(), JSValue::Int(0));

        let result2 = context.evaluate_script("++counter");
        assert_eq!(result2.unwrap(), JSValue::Int(1));

        assert_eq!(context.property("counter").unwrap(), JSValue::Int(1));
    }

    #[test]
    fn test_contexts_have_separate_globals() {
        let group = ContextGroup::new().unwrap();
        let first = group.create_named_context("first").unwrap();
        let second = group.create_named_context("second").unwrap();
        assert_ne!(first, second);
        assert_eq!(second.name(), "second");

        first.evaluate_script("var x = 10").unwrap();
        second.evaluate_script("var x = 20").unwrap();

        assert_eq!(first.evaluate_script("x").unwrap(), JSValue::Int(10));
        assert_eq!(second.evaluate_script("x").unwrap(), JSValue::Int(20));
    }

    #[test]
    fn test_script_errors_carry_name_and_message() {
        let group = ContextGroup::new().unwrap();
        let context = group.create_context().unwrap();

        let err = context
            .evaluate_script("throw new TypeError('bad input')")
            .unwrap_err();
        let exception = err.as_script().unwrap();
        assert_eq!(exception.name.as_deref(), Some("TypeError"));
        assert!(exception.message.contains("bad input"));
    }

    #[test]
    fn test_missing_property_is_undefined() {
        let group = ContextGroup::new().unwrap();
        let context = group.create_context().unwrap();
        assert_eq!(context.property("nothingHere").unwrap(), JSValue::Undefined);
    }
}
