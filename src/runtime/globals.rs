//! Globals installed into every process context: `process`, timers and
//! `console`.

use crate::runtime::bridge::{coerce_args, NativeFunction, NativeObject, ParamType, PropertyAttributes};
use crate::runtime::error::BridgeError;
use crate::runtime::events::ScriptEvent;
use crate::runtime::js_value::JSValue;
use crate::runtime::process::ProcessShared;
use crate::runtime::scope::JsScope;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Tracing target for script console output.
pub const CONSOLE_TARGET: &str = "jsprocess::console";

pub(crate) fn install(scope: &mut JsScope<'_, '_>, process: &Arc<ProcessShared>) -> Result<(), BridgeError> {
    let object = process_object(process);
    scope.set_global_property("process", object, PropertyAttributes::DONT_ENUM)?;

    for function in timer_functions() {
        let name = function.name().to_string();
        scope.set_global_property(&name, function, PropertyAttributes::DONT_ENUM)?;
    }

    let console = console_object(process.identity(), process.config().enable_console);
    scope.set_global_property("console", console, PropertyAttributes::DONT_ENUM)?;
    Ok(())
}

fn upgrade(process: &Weak<ProcessShared>) -> Result<Arc<ProcessShared>, BridgeError> {
    process.upgrade().ok_or(BridgeError::Terminated)
}

fn exit_code_from(value: &JSValue) -> Option<i32> {
    let code = ParamType::Int.coerce(0, value.clone()).ok()?.as_i64()?;
    Some((code & 0xff) as i32)
}

fn process_object(process: &Arc<ProcessShared>) -> NativeObject {
    let weak = Arc::downgrade(process);
    let read = weak.clone();
    let write = weak.clone();
    let exit = weak.clone();
    let keep = weak.clone();
    let release = weak.clone();
    let subscribe = weak;

    NativeObject::builder("Process")
        .value(
            "id",
            process.identity(),
            PropertyAttributes::READ_ONLY | PropertyAttributes::DONT_DELETE,
        )
        .value(
            "mediaAccess",
            process.config().access.as_str(),
            PropertyAttributes::READ_ONLY | PropertyAttributes::DONT_DELETE,
        )
        .property_with_setter(
            "exitCode",
            move || {
                read.upgrade()
                    .map(|process| JSValue::Int(i64::from(process.script_exit_code())))
                    .unwrap_or_default()
            },
            move |value| {
                if let (Some(process), Some(code)) = (write.upgrade(), exit_code_from(&value)) {
                    process.set_script_exit_code(code);
                }
            },
            PropertyAttributes::DONT_DELETE,
        )
        .method("exit", &[ParamType::Any], move |scope, args| {
            let process = upgrade(&exit)?;
            let code = match args.first() {
                Some(value) if !value.is_undefined() => exit_code_from(value).ok_or(
                    BridgeError::Coercion {
                        index: 0,
                        expected: "integer",
                    },
                )?,
                _ => process.script_exit_code(),
            };
            process.set_script_exit_code(code);
            process.request_exit(code);
            scope.terminate_execution();
            Err(BridgeError::Terminated)
        })
        .method("keepAlive", &[], move |_scope, _args| {
            upgrade(&keep)?.keep_alive();
            Ok(JSValue::Undefined)
        })
        .method("letDie", &[], move |_scope, _args| {
            upgrade(&release)?.let_die();
            Ok(JSValue::Undefined)
        })
        .method(
            "on",
            &[ParamType::String, ParamType::Function],
            move |_scope, args| {
                let name = args[0].as_str().unwrap_or_default();
                let event = ScriptEvent::parse(name).ok_or_else(|| {
                    BridgeError::native(format!("Unsupported process event '{}'", name))
                })?;
                match &args[1] {
                    JSValue::Function(function) => {
                        upgrade(&subscribe)?.add_script_listener(event, function.clone());
                        Ok(JSValue::Undefined)
                    }
                    _ => Err(BridgeError::native("process.on expects a script function")),
                }
            },
        )
        .build()
}

/// Delay in the way timers read it: anything that is not a finite, positive
/// number means "as soon as possible".
fn delay_from(value: Option<&JSValue>) -> Duration {
    let millis = value
        .and_then(|value| ParamType::Number.coerce(1, value.clone()).ok())
        .and_then(|value| value.as_f64())
        .filter(|millis| millis.is_finite() && *millis > 0.0)
        .unwrap_or(0.0);
    Duration::from_micros((millis * 1000.0).round() as u64)
}

fn timer_id(args: &[JSValue]) -> Option<u32> {
    let id = args.first()?.as_f64()?;
    (id.is_finite() && id >= 1.0 && id <= f64::from(u32::MAX)).then_some(id as u32)
}

fn schedule(
    scope: &mut JsScope<'_, '_>,
    args: Vec<JSValue>,
    repeat: bool,
    has_delay: bool,
) -> Result<JSValue, BridgeError> {
    let args = coerce_args(&[ParamType::Function], args)?;
    let mut args = args.into_iter();
    let callback = args.next().unwrap_or_default();
    let delay = if has_delay {
        delay_from(args.next().as_ref())
    } else {
        Duration::ZERO
    };
    let id = scope.schedule_timer(callback, args.collect(), delay, repeat)?;
    Ok(JSValue::Int(i64::from(id)))
}

fn timer_functions() -> Vec<NativeFunction> {
    let clear = |scope: &mut JsScope<'_, '_>, args: Vec<JSValue>| -> Result<JSValue, BridgeError> {
        if let Some(id) = timer_id(&args) {
            scope.clear_timer(id);
        }
        Ok(JSValue::Undefined)
    };
    vec![
        NativeFunction::new("setTimeout", |scope, args| schedule(scope, args, false, true)),
        NativeFunction::new("setInterval", |scope, args| schedule(scope, args, true, true)),
        NativeFunction::new("setImmediate", |scope, args| schedule(scope, args, false, false)),
        NativeFunction::new("clearTimeout", clear),
        NativeFunction::new("clearInterval", clear),
        NativeFunction::new("clearImmediate", clear),
    ]
}

fn format_line(args: &[JSValue]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn console_object(identity: &str, enabled: bool) -> NativeObject {
    let mut builder = NativeObject::builder("Console");
    for level in ["log", "info", "debug", "warn", "error"] {
        let identity = identity.to_string();
        builder = builder.method(level, &[], move |_scope, args| {
            if !enabled {
                return Ok(JSValue::Undefined);
            }
            let line = format_line(&args);
            match level {
                "debug" => tracing::debug!(target: CONSOLE_TARGET, process = %identity, "{}", line),
                "warn" => tracing::warn!(target: CONSOLE_TARGET, process = %identity, "{}", line),
                "error" => tracing::error!(target: CONSOLE_TARGET, process = %identity, "{}", line),
                _ => tracing::info!(target: CONSOLE_TARGET, process = %identity, "{}", line),
            }
            Ok(JSValue::Undefined)
        });
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_parsing() {
        assert_eq!(delay_from(None), Duration::ZERO);
        assert_eq!(delay_from(Some(&JSValue::Int(25))), Duration::from_millis(25));
        assert_eq!(delay_from(Some(&JSValue::String("10".into()))), Duration::from_millis(10));
        assert_eq!(delay_from(Some(&JSValue::Int(-5))), Duration::ZERO);
        assert_eq!(delay_from(Some(&JSValue::String("soon".into()))), Duration::ZERO);
        assert_eq!(delay_from(Some(&JSValue::Float(f64::INFINITY))), Duration::ZERO);
    }

    #[test]
    fn test_timer_ids() {
        assert_eq!(timer_id(&[JSValue::Int(3)]), Some(3));
        assert_eq!(timer_id(&[JSValue::Int(0)]), None);
        assert_eq!(timer_id(&[JSValue::Undefined]), None);
        assert_eq!(timer_id(&[]), None);
    }

    #[test]
    fn test_exit_codes_wrap_to_a_byte() {
        assert_eq!(exit_code_from(&JSValue::Int(3)), Some(3));
        assert_eq!(exit_code_from(&JSValue::Int(258)), Some(2));
        assert_eq!(exit_code_from(&JSValue::Int(-1)), Some(255));
        assert_eq!(exit_code_from(&JSValue::String("7".into())), Some(7));
        assert_eq!(exit_code_from(&JSValue::Undefined), None);
    }

    #[test]
    fn test_console_line_joins_arguments() {
        let line = format_line(&[JSValue::String("answer".into()), JSValue::Int(42)]);
        assert_eq!(line, "answer 42");
    }
}
