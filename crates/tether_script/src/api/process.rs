//! Child processes and process batches

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Function, IntoJs, Object, Value};
use std::path::PathBuf;
use std::rc::Rc;
use tether_core::{BoundedScheduler, CallableHandle, Completion, Job, OperationValue, ResultType};
use tether_services::process::{self, CapturedOutput, ProcessSpec, SPAWN_FAILURE_EXIT_CODE};

use super::{count_arg, optional};
use crate::ffi::{self, JsCallable, ScriptHandle};
use crate::host::{BatchEntry, BatchProcess, HostState};

pub(super) fn register<'js>(host: &Object<'js>, state: &Rc<HostState>) -> rquickjs::Result<()> {
    let st = Rc::clone(state);
    host.set(
        "startProcess",
        Func::from(
            move |ctx: Ctx<'js>,
                  file: String,
                  args: Opt<Option<String>>,
                  capture: Opt<Option<bool>>,
                  working_dir: Opt<Option<String>>| {
                let spec = process_spec(file, optional(args), optional(capture), optional(working_dir));
                start_process(ctx, &st, &spec)
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "startProcessAsync",
        Func::from(
            move |file: String,
                  args: Opt<Option<String>>,
                  capture: Opt<Option<bool>>,
                  working_dir: Opt<Option<String>>| {
                let spec = process_spec(file, optional(args), optional(capture), optional(working_dir));
                // Captured text has no consumer on this path.
                let operation = process::spawn(&st.handle, spec, &CapturedOutput::default());
                st.add_operation(operation, ResultType::Int)
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "createBatchProcess",
        Func::from(move |ctx: Ctx<'js>, callback: Value<'js>| create_batch(ctx, &st, callback)),
    )?;

    let st = Rc::clone(state);
    host.set(
        "addBatchProcess",
        Func::from(
            move |ctx: Ctx<'js>,
                  batch: ScriptHandle,
                  file: String,
                  args: Opt<Option<String>>,
                  capture: Opt<Option<bool>>,
                  working_dir: Opt<Option<String>>,
                  on_exit: Opt<Option<Function<'js>>>| {
                let spec = process_spec(file, optional(args), optional(capture), optional(working_dir));
                add_batch_process(ctx, &st, batch, spec, optional(on_exit))
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "runBatchProcess",
        Func::from(
            move |ctx: Ctx<'js>, batch: ScriptHandle, limit: Opt<Option<f64>>| {
                run_batch(ctx, &st, batch, optional(limit))
            },
        ),
    )?;
    Ok(())
}

fn process_spec(
    file: String,
    args: Option<String>,
    capture: Option<bool>,
    working_dir: Option<String>,
) -> ProcessSpec {
    ProcessSpec::new(file)
        .args_line(args.as_deref().unwrap_or_default())
        .capture_output(capture.unwrap_or(false))
        .working_dir(working_dir.filter(|dir| !dir.is_empty()).map(PathBuf::from))
}

/// `undefined` unless capture was requested.
fn output_to_js<'js>(ctx: &Ctx<'js>, capture: bool, output: Option<String>) -> rquickjs::Result<Value<'js>> {
    if capture {
        output.unwrap_or_default().into_js(ctx)
    } else {
        Ok(Value::new_undefined(ctx.clone()))
    }
}

fn start_process<'js>(ctx: Ctx<'js>, state: &HostState, spec: &ProcessSpec) -> rquickjs::Result<Object<'js>> {
    let outcome = process::run_blocking(&state.handle, spec);
    let result = Object::new(ctx.clone())?;
    result.set("exitCode", outcome.exit_code)?;
    if let Some(output) = outcome.output {
        result.set("output", output)?;
    }
    Ok(result)
}

fn create_batch<'js>(ctx: Ctx<'js>, state: &HostState, callback: Value<'js>) -> rquickjs::Result<Value<'js>> {
    let Some(callback) = callback.into_function() else {
        return Ok(Value::new_null(ctx));
    };
    let callback = ffi::park(&ctx, &state.callables, callback);
    let id = state.batches.borrow_mut().insert(BatchProcess {
        callback,
        entries: Vec::new(),
    });
    tracing::debug!(batch = %id, "batch created");
    id.into_js(&ctx)
}

/// Returns the process's 1-based index in the batch, or `false` for an
/// unknown batch.
fn add_batch_process<'js>(
    ctx: Ctx<'js>,
    state: &HostState,
    batch: ScriptHandle,
    spec: ProcessSpec,
    on_exit: Option<Function<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let mut batches = state.batches.borrow_mut();
    let Some(entry) = batches.get_mut(batch) else {
        return false.into_js(&ctx);
    };
    let on_exit = on_exit.map(|func| ffi::park(&ctx, &state.callables, func));
    entry.entries.push(BatchEntry { spec, on_exit });
    (entry.entries.len() as f64).into_js(&ctx)
}

/// Bookkeeping carried through the scheduler for one batch member.
struct BatchSlot {
    index: usize,
    capture: bool,
    output: CapturedOutput,
    on_exit: Option<CallableHandle<JsCallable>>,
}

fn run_batch(ctx: Ctx<'_>, state: &HostState, batch: ScriptHandle, limit: Option<f64>) -> rquickjs::Result<bool> {
    let limit = count_arg(&ctx, "limit", limit, state.settings.scheduler.batch_concurrency)?;
    // A batch runs once; removing it up front also keeps callbacks from
    // seeing it half-run.
    let Some(BatchProcess { callback, entries }) = state.batches.borrow_mut().remove(batch) else {
        return Ok(false);
    };
    tracing::debug!(batch = %batch, processes = entries.len(), limit, "running batch");

    let jobs = entries.into_iter().enumerate().map(|(index, entry)| {
        let slot = BatchSlot {
            index: index + 1,
            capture: entry.spec.capture_output,
            output: CapturedOutput::default(),
            on_exit: entry.on_exit,
        };
        let handle = state.handle.clone();
        let output = slot.output.clone();
        let spec = entry.spec;
        Job::new(move || process::spawn(&handle, spec, &output), ResultType::Int, slot)
    });

    let outcome = BoundedScheduler::new(limit).run_fan_out(jobs, |completion| {
        batch_exited(&ctx, batch, &callback, completion).map_err(|err| ffi::error_message(&ctx, err))
    });
    match outcome {
        Ok(report) => {
            tracing::debug!(batch = %batch, ?report, "batch finished");
            Ok(true)
        }
        Err(message) => Err(ffi::throw(&ctx, message)),
    }
}

fn batch_exited(
    ctx: &Ctx<'_>,
    batch: ScriptHandle,
    callback: &CallableHandle<JsCallable>,
    completion: Completion<BatchSlot>,
) -> rquickjs::Result<()> {
    let slot = completion.callback;
    let exit_code = match completion.result {
        Ok(Some(OperationValue::Int(code))) => code,
        Ok(other) => {
            tracing::warn!(index = slot.index, value = ?other, "unexpected process result");
            SPAWN_FAILURE_EXIT_CODE
        }
        Err(err) => {
            tracing::error!(index = slot.index, %err, "batch process failed");
            SPAWN_FAILURE_EXIT_CODE
        }
    };
    let output = slot.output.take();

    if let Some(on_exit) = slot.on_exit {
        if let Some(parked) = on_exit.take() {
            let func = parked.restore(ctx)?;
            func.call::<_, ()>((exit_code, output_to_js(ctx, slot.capture, output.clone())?))?;
        }
    }
    if let Some(parked) = callback.get() {
        let func = parked.restore(ctx)?;
        func.call::<_, ()>((
            batch,
            slot.index as f64,
            exit_code,
            output_to_js(ctx, slot.capture, output)?,
        ))?;
    }
    Ok(())
}
