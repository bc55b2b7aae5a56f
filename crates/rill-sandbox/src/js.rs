//! QuickJS glue shared by every backend
//!
//! The host never touches guest objects directly. Each request is JSON text
//! handed to the prelude's `__rill.dispatch`, and each reply is a JSON
//! envelope: `{"ok": wire}`, `{"err": error}`, `{"rejected": error}`,
//! `{"pending": slot}` or `{"missing": id}`.

use rill_core::ErrorValue;
use rquickjs::{Ctx, Function, Object, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::budget::Budget;
use crate::error::SandboxError;
use crate::interrupt::InterruptState;
use parking_lot::Mutex;

/// Guest prelude source
pub(crate) const PRELUDE: &str = include_str!("prelude.js");

/// Global the prelude exposes its entry points on
const API_GLOBAL: &str = "__rill";

/// Raw host hook the prelude wraps host functions around
pub(crate) const HOST_CALL_HOOK: &str = "__rill_host_call";

const HOST_LOG_HOOK: &str = "__rill_host_log";
const BUDGET_HOOK: &str = "__rill_budget_poll";

/// Logging target for guest console output
pub const GUEST_LOG_TARGET: &str = "rill::guest";

/// Request into a guest context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub(crate) enum GuestRequest {
    /// Evaluate a script
    Eval { source: String, wait: bool },
    /// Assign a global
    SetGlobal { name: String, value: serde_json::Value },
    /// Read a global
    GetGlobal { name: String },
    /// Call a guest function by id
    Call {
        id: String,
        args: Vec<serde_json::Value>,
        wait: bool,
    },
    /// Poll a pending promise
    Settled { slot: u64 },
    /// Drop guest functions the host no longer references
    Release { ids: Vec<String> },
}

/// Reply from a guest context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum Envelope {
    Ok(serde_json::Value),
    Err(ErrorValue),
    Rejected(ErrorValue),
    Pending(u64),
    Missing(String),
}

/// Failure of the interpreter itself, as opposed to a guest throw
#[derive(Debug)]
pub(crate) enum Fault {
    Interrupted,
    Engine(String),
}

impl From<Fault> for SandboxError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Interrupted => SandboxError::Interrupted,
            Fault::Engine(message) => SandboxError::Backend(message),
        }
    }
}

/// Install the guest prelude into a fresh context.
///
/// The caller must already have set [`HOST_CALL_HOOK`].
pub(crate) fn install(ctx: &Ctx<'_>, context_id: u64, budget: Arc<Mutex<Budget>>) -> rquickjs::Result<()> {
    let global = ctx.globals();

    let log = Function::new(
        ctx.clone(),
        move |level: String, message: String| -> rquickjs::Result<()> {
            guest_log(context_id, &level, &message);
            Ok(())
        },
    )?
    .with_name(HOST_LOG_HOOK)?;
    global.set(HOST_LOG_HOOK, log)?;

    let poll = Function::new(ctx.clone(), move || -> rquickjs::Result<bool> { Ok(budget.lock().poll()) })?
        .with_name(BUDGET_HOOK)?;
    global.set(BUDGET_HOOK, poll)?;

    ctx.eval::<(), _>(PRELUDE)?;
    Ok(())
}

fn guest_log(context_id: u64, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: GUEST_LOG_TARGET, context = context_id, "{}", message),
        "warn" => tracing::warn!(target: GUEST_LOG_TARGET, context = context_id, "{}", message),
        "debug" => tracing::debug!(target: GUEST_LOG_TARGET, context = context_id, "{}", message),
        _ => tracing::info!(target: GUEST_LOG_TARGET, context = context_id, "{}", message),
    }
}

/// Run one request inside `ctx`
pub(crate) fn run(
    ctx: &Ctx<'_>,
    request: &GuestRequest,
    text: &str,
    interrupts: &InterruptState,
) -> Result<Envelope, Fault> {
    match execute(ctx, request, text) {
        Ok(reply) => {
            serde_json::from_str(&reply).map_err(|e| Fault::Engine(format!("malformed guest reply: {}", e)))
        }
        Err(rquickjs::Error::Exception) => {
            let caught = ctx.catch();
            if interrupts.is_fired() {
                return Err(Fault::Interrupted);
            }
            describe(ctx, caught).map(Envelope::Err)
        }
        Err(err) => Err(Fault::Engine(err.to_string())),
    }
}

fn execute<'js>(ctx: &Ctx<'js>, request: &GuestRequest, text: &str) -> rquickjs::Result<String> {
    let api: Object<'js> = ctx.globals().get(API_GLOBAL)?;
    match request {
        GuestRequest::Eval { source, wait } => {
            let value: Value<'js> = ctx.eval(source.as_str())?;
            let complete: Function<'js> = api.get("complete")?;
            complete.call((value, *wait))
        }
        _ => {
            let dispatch: Function<'js> = api.get("dispatch")?;
            dispatch.call((text.to_string(),))
        }
    }
}

fn describe<'js>(ctx: &Ctx<'js>, caught: Value<'js>) -> Result<ErrorValue, Fault> {
    let described = ctx
        .globals()
        .get::<_, Object<'js>>(API_GLOBAL)
        .and_then(|api| api.get::<_, Function<'js>>("describe"))
        .and_then(|describe| describe.call::<_, String>((caught,)));
    match described {
        Ok(text) => serde_json::from_str(&text).map_err(|e| Fault::Engine(format!("malformed error: {}", e))),
        Err(rquickjs::Error::Exception) => {
            ctx.catch();
            Err(Fault::Engine("exception while describing a guest exception".into()))
        }
        Err(err) => Err(Fault::Engine(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = GuestRequest::Call {
            id: "g1".into(),
            args: vec![json!(1)],
            wait: false,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"kind": "call", "id": "g1", "args": [1], "wait": false})
        );
        let release = GuestRequest::Release { ids: vec!["g2".into()] };
        assert_eq!(
            serde_json::to_value(&release).unwrap(),
            json!({"kind": "release", "ids": ["g2"]})
        );
    }

    #[test]
    fn test_envelope_parsing() {
        let ok: Envelope = serde_json::from_str(r#"{"ok": {"__type": "undefined"}}"#).unwrap();
        assert_eq!(ok, Envelope::Ok(json!({"__type": "undefined"})));
        let err: Envelope = serde_json::from_str(r#"{"err": {"name": "TypeError", "message": "boom"}}"#).unwrap();
        assert_eq!(err, Envelope::Err(ErrorValue::new("TypeError", "boom")));
        let pending: Envelope = serde_json::from_str(r#"{"pending": 3}"#).unwrap();
        assert_eq!(pending, Envelope::Pending(3));
        let missing: Envelope = serde_json::from_str(r#"{"missing": "g9"}"#).unwrap();
        assert_eq!(missing, Envelope::Missing("g9".into()));
    }
}
