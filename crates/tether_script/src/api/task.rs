//! Operations and the pull scheduler

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Function, Object, Value};
use std::rc::Rc;
use std::time::Duration;
use tether_core::{Admission, BoundedScheduler, CallableHandle, Completion, Delivery, ResultType};
use tether_services::delay;

use super::{count_arg, optional};
use crate::ffi::{self, JsCallable, ScriptHandle};
use crate::host::HostState;

type ScriptAdmission = Admission<CallableHandle<JsCallable>>;

pub(super) fn register<'js>(host: &Object<'js>, state: &Rc<HostState>) -> rquickjs::Result<()> {
    let st = Rc::clone(state);
    host.set(
        "taskDelay",
        Func::from(move |ctx: Ctx<'js>, ms: f64| task_delay(&ctx, &st, ms)),
    )?;

    let st = Rc::clone(state);
    host.set(
        "taskStatus",
        Func::from(move |ctx: Ctx<'js>, op: ScriptHandle| task_status(&ctx, &st, op)),
    )?;

    let st = Rc::clone(state);
    host.set(
        "taskWait",
        Func::from(
            move |ctx: Ctx<'js>, op: ScriptHandle, type_name: Opt<Option<String>>| {
                task_wait(ctx, &st, op, optional(type_name))
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "taskRun",
        Func::from(
            move |ctx: Ctx<'js>, producer: Function<'js>, limit: Opt<Option<f64>>| {
                task_run(ctx, &st, producer, optional(limit))
            },
        ),
    )?;
    Ok(())
}

fn task_delay(ctx: &Ctx<'_>, state: &HostState, ms: f64) -> rquickjs::Result<ScriptHandle> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(ffi::throw(ctx, format!("invalid delay {ms}")));
    }
    let operation = delay::delay(&state.handle, Duration::from_secs_f64(ms / 1000.0));
    Ok(state.add_operation(operation, ResultType::Void))
}

fn task_status(ctx: &Ctx<'_>, state: &HostState, op: ScriptHandle) -> rquickjs::Result<&'static str> {
    let operations = state.operations.borrow();
    match operations.get(op) {
        Some(entry) => Ok(entry.operation.status().as_str()),
        None => Err(ffi::throw(ctx, format!("unknown operation {op}"))),
    }
}

fn task_wait<'js>(
    ctx: Ctx<'js>,
    state: &HostState,
    op: ScriptHandle,
    type_name: Option<String>,
) -> rquickjs::Result<Value<'js>> {
    let Some(entry) = state.take_operation(op) else {
        return Err(ffi::throw(&ctx, format!("unknown operation {op}")));
    };
    let result_type = resolve_type(type_name.as_deref(), entry.natural);
    match entry.operation.wait() {
        Ok(value) => ffi::operation_value_to_js(&ctx, result_type.decode(value)),
        Err(err) => Err(ffi::throw(&ctx, err)),
    }
}

fn task_run<'js>(
    ctx: Ctx<'js>,
    state: &HostState,
    producer: Function<'js>,
    limit: Option<f64>,
) -> rquickjs::Result<f64> {
    let limit = count_arg(&ctx, "limit", limit, state.settings.scheduler.default_concurrency)?;
    let scheduler = BoundedScheduler::new(limit);

    let outcome = scheduler.run(
        || next_admission(&ctx, state, &producer),
        |completion| deliver(&ctx, completion),
    );
    match outcome {
        Ok(report) => {
            tracing::debug!(?report, "task run finished");
            Ok(report.dispatched as f64)
        }
        Err(message) => Err(ffi::throw(&ctx, message)),
    }
}

/// Ask the producer for its next `[operation, type, callback]` triple.
fn next_admission<'js>(
    ctx: &Ctx<'js>,
    state: &HostState,
    producer: &Function<'js>,
) -> Result<Option<ScriptAdmission>, String> {
    let message = |err| ffi::error_message(ctx, err);

    let item: Value<'js> = producer.call(()).map_err(message)?;
    if item.is_undefined() || item.is_null() {
        return Ok(None);
    }
    let Some(entry) = item.as_array() else {
        return Err("producer must return [operation, type, callback] or null".to_string());
    };
    let op: ScriptHandle = entry.get(0).map_err(message)?;
    let type_name: Option<String> = entry.get(1).map_err(message)?;
    let callback: Function<'js> = entry.get(2).map_err(message)?;

    let Some(op) = state.take_operation(op) else {
        return Err(format!("unknown operation {op}"));
    };
    let result_type = resolve_type(type_name.as_deref(), op.natural);
    let callback = ffi::park(ctx, &state.callables, callback);
    Ok(Some(Admission::new(op.operation, result_type, callback)))
}

/// Invoke a completion's callback with `(value)` or `(undefined, message)`.
fn deliver(ctx: &Ctx<'_>, completion: Completion<CallableHandle<JsCallable>>) -> Result<(), String> {
    let Completion { callback, result, .. } = completion;
    callback
        .invoke(|parked| call_with(ctx, parked, result).map_err(|err| ffi::error_message(ctx, err)))
        .unwrap_or(Ok(()))
}

fn call_with(ctx: &Ctx<'_>, parked: JsCallable, result: Delivery) -> rquickjs::Result<()> {
    let func = parked.restore(ctx)?;
    match result {
        Ok(value) => func.call::<_, ()>((ffi::operation_value_to_js(ctx, value)?,)),
        Err(err) => func.call::<_, ()>((Value::new_undefined(ctx.clone()), err.to_string())),
    }
}

/// The named result type, or the operation's own when none is named.
/// An unrecognised name delivers nothing.
pub(crate) fn resolve_type(name: Option<&str>, natural: ResultType) -> ResultType {
    let Some(name) = name else {
        return natural;
    };
    name.parse().unwrap_or_else(|err| {
        tracing::warn!(%err, "delivering nothing");
        ResultType::Void
    })
}
