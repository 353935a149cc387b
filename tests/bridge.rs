use jsprocess::runtime::{
    BridgeError, ByteBuffer, ContextGroup, JSValue, NativeFunction, NativeObject, ParamType,
    PromiseState, PropertyAttributes, ScriptOrigin, TypedArrayKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn counter_object() -> NativeObject {
    NativeObject::builder("Counter")
        .value("version", 1, PropertyAttributes::READ_ONLY)
        .value("label", "first", PropertyAttributes::NONE)
        .method("double", &[ParamType::Int], |_scope, args| {
            Ok(JSValue::Int(args[0].as_i64().unwrap_or(0) * 2))
        })
        .build()
}

#[test]
fn test_exception_handler_swallows_script_errors() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    context.set_exception_handler(move |_context, exception| {
        assert_eq!(exception.name.as_deref(), Some("ReferenceError"));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(context.has_exception_handler());

    let result = context.evaluate_script("notDefinedAnywhere()").unwrap();
    assert_eq!(result, JSValue::Undefined);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    context.clear_exception_handler();
    let err = context.evaluate_script("notDefinedAnywhere()").unwrap_err();
    let exception = err.as_script().unwrap();
    assert_eq!(exception.name.as_deref(), Some("ReferenceError"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_script_origin_names_the_stack() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let origin = ScriptOrigin::new("app.js").with_line_offset(10);
    let err = context
        .evaluate_script_with("throw new Error('here')", &origin)
        .unwrap_err();
    let stack = err.as_script().unwrap().stack.clone().unwrap();
    assert!(stack.contains("app.js:11"), "unexpected stack: {}", stack);
}

#[test]
fn test_exported_object_keeps_identity() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();
    let object = counter_object();

    context.set_property("a", object.clone()).unwrap();
    context.set_property("b", object.clone()).unwrap();
    assert_eq!(context.evaluate_script("a === b").unwrap(), JSValue::Bool(true));
    assert_eq!(context.property("a").unwrap(), JSValue::Exported(object));
}

#[test]
fn test_exported_members() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();
    let object = counter_object();
    context.set_property("counter", object.clone()).unwrap();

    assert_eq!(context.evaluate_script("counter.double(21)").unwrap(), JSValue::Int(42));
    assert_eq!(context.evaluate_script("counter.double('4')").unwrap(), JSValue::Int(8));

    let strict = "'use strict'; counter.version = 9; counter.version";
    assert_eq!(context.evaluate_script(strict).unwrap(), JSValue::Int(1));
    assert_eq!(object.get("version"), Some(JSValue::Int(1)));

    context.evaluate_script("counter.label = 'second'").unwrap();
    assert_eq!(object.get("label"), Some(JSValue::String("second".into())));
    assert!(object.set("label", "third").unwrap());
    assert_eq!(
        context.evaluate_script("counter.label").unwrap(),
        JSValue::String("third".into())
    );
}

#[test]
fn test_uncoercible_argument_throws_type_error() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();
    context.set_property("counter", counter_object()).unwrap();

    let caught = context
        .evaluate_script("try { counter.double({}); false } catch (e) { e instanceof TypeError }")
        .unwrap();
    assert_eq!(caught, JSValue::Bool(true));
}

#[test]
fn test_native_function_round_trip() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let greet = NativeFunction::new("greet", |_scope, args| {
        let name = args.first().and_then(JSValue::as_str).unwrap_or("nobody");
        Ok(JSValue::String(format!("hello {}", name)))
    });
    context.set_property("greet", greet.clone()).unwrap();
    context.set_property("again", greet.clone()).unwrap();

    assert_eq!(
        context.evaluate_script("greet('js')").unwrap(),
        JSValue::String("hello js".into())
    );
    assert_eq!(context.evaluate_script("greet === again").unwrap(), JSValue::Bool(true));
    assert_eq!(context.property("greet").unwrap(), JSValue::NativeFunction(greet));
}

#[test]
fn test_native_errors_become_script_errors() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();
    let fail = NativeFunction::new("fail", |_scope, _args| Err(BridgeError::native("nope")));
    context.set_property("fail", fail).unwrap();

    let message = context
        .evaluate_script("try { fail() } catch (e) { e.message }")
        .unwrap();
    assert!(message.as_str().unwrap().contains("nope"));
}

#[test]
fn test_script_handles_stay_on_the_group_thread() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let object = context.evaluate_script("({ answer: 42 })").unwrap();
    let object = object.as_object().unwrap().clone();
    assert!(matches!(object.get("answer"), Err(BridgeError::InvalidThreadAccess)));
    assert!(matches!(
        context.with_scope(|scope| scope.evaluate("1")),
        Err(BridgeError::InvalidThreadAccess)
    ));

    let read = object.clone();
    let answer = group.invoke(move || read.get("answer")).unwrap();
    assert_eq!(answer, JSValue::Int(42));

    let snapshot = group.invoke(move || object.snapshot()).unwrap();
    match snapshot {
        JSValue::Object(map) => assert_eq!(map.get("answer"), Some(&JSValue::Int(42))),
        other => panic!("expected a copied object, got {:?}", other),
    }
}

#[test]
fn test_script_function_identity_and_calls() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let value = context
        .evaluate_script("globalThis.add = function (x, y) { return x + y }; add")
        .unwrap();
    let add = value.as_function().unwrap().clone();
    assert_eq!(context.property("add").unwrap().as_function(), Some(&add));

    context.set_property("sameAdd", JSValue::Function(add.clone())).unwrap();
    assert_eq!(context.evaluate_script("add === sameAdd").unwrap(), JSValue::Bool(true));

    let call = add.clone();
    let sum = group
        .invoke(move || call.call(JSValue::Undefined, vec![JSValue::Int(2), JSValue::Int(3)]))
        .unwrap();
    assert_eq!(sum, JSValue::Int(5));

    let (tx, rx) = mpsc::channel();
    add.call_async(vec![JSValue::Int(20), JSValue::Int(22)], move |result| {
        tx.send(result.unwrap()).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), JSValue::Int(42));
}

#[test]
fn test_handles_do_not_cross_groups() {
    let first = ContextGroup::new().unwrap();
    let second = ContextGroup::new().unwrap();
    assert!(!first.same_group(&second));

    let source = first.create_context().unwrap();
    let target = second.create_context().unwrap();

    let function = source.evaluate_script("(() => 1)").unwrap();
    let err = target.set_property("borrowed", function).unwrap_err();
    assert!(matches!(err, BridgeError::ForeignGroup));

    let copy = source.evaluate_script("[1, 'two', [3]]").unwrap();
    target.set_property("copied", copy).unwrap();
    assert_eq!(target.evaluate_script("copied[2][0]").unwrap(), JSValue::Int(3));
}

#[test]
fn test_buffers_cross_by_value() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    match context.evaluate_script("new Uint8Array([1, 2, 3])").unwrap() {
        JSValue::Buffer(buffer) => {
            assert_eq!(buffer.kind(), TypedArrayKind::Uint8);
            assert_eq!(buffer.as_bytes(), &[1, 2, 3]);
        }
        other => panic!("expected a buffer, got {:?}", other),
    }

    context
        .set_property("bytes", ByteBuffer::uint8(vec![4, 5, 6]))
        .unwrap();
    assert_eq!(
        context.evaluate_script("bytes instanceof Uint8Array && bytes[2]").unwrap(),
        JSValue::Int(6)
    );
}

#[test]
fn test_copied_values() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    assert_eq!(context.evaluate_script("0.5").unwrap(), JSValue::Float(0.5));
    assert_eq!(context.evaluate_script("null").unwrap(), JSValue::Null);
    assert_eq!(context.evaluate_script("new Date(1000)").unwrap(), JSValue::Date(1000.0));
    assert_eq!(
        context.evaluate_script("/ab+c/gi").unwrap(),
        JSValue::RegExp {
            source: "ab+c".into(),
            flags: "gi".into()
        }
    );
    assert_eq!(
        context.evaluate_script("[1, [true, 'x']]").unwrap(),
        JSValue::Array(vec![
            JSValue::Int(1),
            JSValue::Array(vec![JSValue::Bool(true), JSValue::String("x".into())]),
        ])
    );
}

#[test]
fn test_global_property_attributes() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    context
        .set_property_with("hidden", 1, PropertyAttributes::DONT_ENUM)
        .unwrap();
    context.set_property("shown", 2).unwrap();
    assert_eq!(
        context.evaluate_script("Object.keys(globalThis).includes('hidden')").unwrap(),
        JSValue::Bool(false)
    );
    assert_eq!(
        context.evaluate_script("Object.keys(globalThis).includes('shown')").unwrap(),
        JSValue::Bool(true)
    );

    assert!(context.delete_property("shown").unwrap());
    assert_eq!(context.property("shown").unwrap(), JSValue::Undefined);
}

#[test]
fn test_native_promise_resolution() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let (promise, resolver) = context.new_promise().unwrap();
    context.set_property("pending", JSValue::Promise(promise)).unwrap();
    context
        .evaluate_script("pending.then(value => { globalThis.got = value * 2 })")
        .unwrap();

    assert!(resolver.resolve(21));
    assert!(!resolver.resolve(1));
    assert!(resolver.is_settled());
    assert_eq!(context.property("got").unwrap(), JSValue::Int(42));
}

#[test]
fn test_script_promise_state_and_callbacks() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let value = context.evaluate_script("Promise.resolve(5)").unwrap();
    let JSValue::Promise(resolved) = value else {
        panic!("expected a promise");
    };
    let state = group.invoke(move || resolved.state()).unwrap();
    assert_eq!(state, PromiseState::Fulfilled(JSValue::Int(5)));

    let (promise, resolver) = context.new_promise().unwrap();
    let (tx, rx) = mpsc::channel();
    group
        .invoke(move || {
            promise.when_settled(move |result| {
                tx.send(result).unwrap();
            })
        })
        .unwrap();
    assert!(resolver.reject("no"));
    let settled = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(settled, Err(JSValue::String("no".into())));
}

#[test]
fn test_context_calls_nest_inside_native_callbacks() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let nested = NativeFunction::new("nested", |scope, _args| {
        let context = scope.context().ok_or(BridgeError::Terminated)?;
        context.set_property("inner", 20)?;
        context.evaluate_script("inner + 1")
    });
    context.set_property("nested", nested).unwrap();
    assert_eq!(context.evaluate_script("nested()").unwrap(), JSValue::Int(21));
    assert_eq!(context.evaluate_script("nested() * 2").unwrap(), JSValue::Int(42));

    let apply = NativeFunction::new("apply", |_scope, args| {
        let callback = args
            .first()
            .and_then(JSValue::as_function)
            .cloned()
            .ok_or_else(|| BridgeError::native("expected a function"))?;
        callback.call(JSValue::Undefined, vec![JSValue::Int(4)])
    });
    context.set_property("apply", apply).unwrap();
    assert_eq!(
        context.evaluate_script("apply(x => x * 10) + apply(x => nested() + x)").unwrap(),
        JSValue::Int(65)
    );

    let spawn = NativeFunction::new("spawn", |scope, _args| {
        let group = scope.group().ok_or(BridgeError::Terminated)?;
        match group.create_context() {
            Err(BridgeError::Reentrant) => Ok(JSValue::Bool(true)),
            _ => Ok(JSValue::Bool(false)),
        }
    });
    context.set_property("spawn", spawn).unwrap();
    assert_eq!(context.evaluate_script("spawn()").unwrap(), JSValue::Bool(true));

    let scoped = NativeFunction::new("scoped", |scope, _args| scope.evaluate("20 + 1"));
    context.set_property("scoped", scoped).unwrap();
    assert_eq!(context.evaluate_script("scoped() * 2").unwrap(), JSValue::Int(42));
}

#[test]
fn test_function_call_off_thread_is_refused() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let value = context.evaluate_script("(x => x + 1)").unwrap();
    let function = value.as_function().unwrap().clone();
    assert!(matches!(
        function.call(JSValue::Undefined, vec![JSValue::Int(1)]),
        Err(BridgeError::InvalidThreadAccess)
    ));

    let result = group
        .invoke(move || function.call(JSValue::Undefined, vec![JSValue::Int(1)]))
        .unwrap();
    assert_eq!(result, JSValue::Int(2));
}

#[test]
fn test_handles_keep_their_context_registered() {
    let group = ContextGroup::new().unwrap();
    let context = group.create_context().unwrap();

    let value = context
        .evaluate_script("globalThis.base = 3; (x => x + base)")
        .unwrap();
    let function = value.as_function().unwrap().clone();
    let (promise, resolver) = context.new_promise().unwrap();
    drop(value);
    drop(context);

    let call = function.clone();
    let result = group
        .invoke(move || call.call(JSValue::Undefined, vec![JSValue::Int(2)]))
        .unwrap();
    assert_eq!(result, JSValue::Int(5));

    assert!(resolver.resolve(7));
    let state = group.invoke(move || promise.state()).unwrap();
    assert_eq!(state, PromiseState::Fulfilled(JSValue::Int(7)));

    let context = function.context();
    assert_eq!(context.evaluate_script("base * 2").unwrap(), JSValue::Int(6));
}
