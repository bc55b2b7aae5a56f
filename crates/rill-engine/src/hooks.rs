//! Globals the engine injects into the guest
//!
//! Every hook holds a weak reference to the engine, so a guest that outlives
//! its engine gets `ContextDisposed` instead of keeping the engine alive.

use rill_core::{CallError, CallbackId, ErrorValue, RuntimeValue};
use rill_sandbox::SandboxError;
use std::rc::{Rc, Weak};

use crate::engine::EngineShared;

/// `__sendToHost(batch)`: apply a whole batch now
pub const SEND_TO_HOST: &str = "__sendToHost";
/// `__enqueueOperation(op)`: queue one operation for the next flush
pub const ENQUEUE_OPERATION: &str = "__enqueueOperation";
/// `__sendEventToHost(name, payload)`: emit a `message` event
pub const SEND_EVENT_TO_HOST: &str = "__sendEventToHost";
/// `__registerCallback(fn) -> id`
pub const REGISTER_CALLBACK: &str = "__registerCallback";
/// `__invokeCallback(id, args) -> value`
pub const INVOKE_CALLBACK: &str = "__invokeCallback";
/// Props given to `load_bundle`
pub const INITIAL_PROPS: &str = "__initialProps";
/// Optional guest handler for `send_event`
pub const HANDLE_HOST_EVENT: &str = "__handleHostEvent";

const RESOLVE_CALLBACK: &str = "__rill_resolveCallback";

// A registered guest function resolves to the original local function, so
// invoking it does not re-enter the sandbox through the host.
const BOOTSTRAP: &str = r#"
(function (global) {
  "use strict";
  const resolve = global.__rill_resolveCallback;
  delete global.__rill_resolveCallback;
  global.__invokeCallback = function (id, args) {
    return resolve(id).apply(undefined, Array.isArray(args) ? args : []);
  };
})(globalThis);
"#;

fn hook<F>(shared: &Rc<EngineShared>, name: &'static str, body: F) -> RuntimeValue
where
    F: Fn(&EngineShared, &[RuntimeValue]) -> Result<RuntimeValue, CallError> + 'static,
{
    let engine: Weak<EngineShared> = Rc::downgrade(shared);
    RuntimeValue::function(name, move |args| {
        let engine = engine.upgrade().ok_or(CallError::ContextDisposed)?;
        if engine.is_destroyed() {
            return Err(CallError::ContextDisposed);
        }
        body(&engine, args)
    })
}

fn arg(args: &[RuntimeValue], index: usize) -> RuntimeValue {
    args.get(index).cloned().unwrap_or(RuntimeValue::Undefined)
}

fn type_error(message: &str) -> CallError {
    CallError::Thrown(ErrorValue::new("TypeError", message))
}

/// Milliseconds from a guest delay argument; missing, negative or NaN is 0
fn delay_ms(value: Option<&RuntimeValue>) -> u64 {
    match value.and_then(RuntimeValue::as_f64) {
        Some(ms) if ms.is_finite() && ms > 0.0 => ms as u64,
        _ => 0,
    }
}

fn timer_hook(shared: &Rc<EngineShared>, name: &'static str, repeat: bool) -> RuntimeValue {
    hook(shared, name, move |engine, args| {
        let callback = args
            .first()
            .and_then(RuntimeValue::as_function)
            .cloned()
            .ok_or_else(|| type_error("timer callback must be a function"))?;
        let delay = delay_ms(args.get(1));
        let extra = args.iter().skip(2).cloned().collect();
        let id = engine.schedule_timer(callback, extra, delay, repeat.then_some(delay));
        Ok(RuntimeValue::Number(f64::from(id)))
    })
}

fn clear_timer_hook(shared: &Rc<EngineShared>, name: &'static str) -> RuntimeValue {
    hook(shared, name, |engine, args| {
        if let Some(id) = args.first().and_then(RuntimeValue::as_f64) {
            if id.is_finite() && id >= 0.0 {
                engine.cancel_timer(id as u32);
            }
        }
        Ok(RuntimeValue::Undefined)
    })
}

/// Install every hook, then the guest bootstrap
pub(crate) fn install(shared: &Rc<EngineShared>) -> Result<(), SandboxError> {
    let context = shared.context();

    context.set_global(
        SEND_TO_HOST,
        hook(shared, SEND_TO_HOST, |engine, args| {
            engine.receive_batch(&arg(args, 0));
            Ok(RuntimeValue::Undefined)
        }),
    )?;

    context.set_global(
        ENQUEUE_OPERATION,
        hook(shared, ENQUEUE_OPERATION, |engine, args| {
            engine.enqueue_operation(&arg(args, 0));
            Ok(RuntimeValue::Undefined)
        }),
    )?;

    context.set_global(
        SEND_EVENT_TO_HOST,
        hook(shared, SEND_EVENT_TO_HOST, |engine, args| {
            let name = match arg(args, 0) {
                RuntimeValue::String(name) => name,
                _ => return Err(type_error("event name must be a string")),
            };
            engine.guest_message(name, arg(args, 1));
            Ok(RuntimeValue::Undefined)
        }),
    )?;

    context.set_global(
        REGISTER_CALLBACK,
        hook(shared, REGISTER_CALLBACK, |engine, args| {
            let func = args
                .first()
                .and_then(RuntimeValue::as_function)
                .cloned()
                .ok_or_else(|| type_error("__registerCallback expects a function"))?;
            let id = engine.registry().register(func);
            Ok(RuntimeValue::String(id.as_str().to_string()))
        }),
    )?;

    context.set_global(
        RESOLVE_CALLBACK,
        hook(shared, RESOLVE_CALLBACK, |engine, args| {
            let id = match arg(args, 0) {
                RuntimeValue::String(id) => CallbackId::new(id),
                _ => return Err(type_error("callback id must be a string")),
            };
            engine
                .registry()
                .get(&id)
                .map(RuntimeValue::Function)
                .ok_or(CallError::HandleNotFound(id))
        }),
    )?;

    context.set_global("setTimeout", timer_hook(shared, "setTimeout", false))?;
    context.set_global("setInterval", timer_hook(shared, "setInterval", true))?;
    context.set_global("clearTimeout", clear_timer_hook(shared, "clearTimeout"))?;
    context.set_global("clearInterval", clear_timer_hook(shared, "clearInterval"))?;

    context.eval(BOOTSTRAP)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_argument() {
        assert_eq!(delay_ms(None), 0);
        assert_eq!(delay_ms(Some(&RuntimeValue::Number(f64::NAN))), 0);
        assert_eq!(delay_ms(Some(&RuntimeValue::Number(-5.0))), 0);
        assert_eq!(delay_ms(Some(&RuntimeValue::Number(12.7))), 12);
        assert_eq!(delay_ms(Some(&RuntimeValue::from("10"))), 0);
    }
}
