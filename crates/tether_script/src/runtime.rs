//! Script runtime management
//!
//! Owns the interpreter, the tokio runtime that native work runs on, and the
//! host state behind the `host` global. Everything here stays on the thread
//! that created it.

use rquickjs::{Context, Ctx, Function, Runtime, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tether_services::Settings;
use thiserror::Error;

use crate::api;
use crate::ffi;
use crate::host::HostState;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("script engine error: {0}")]
    Engine(#[from] rquickjs::Error),

    #[error("failed to start worker runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("uncaught exception: {0}")]
    Uncaught(String),
}

/// Script execution context
pub struct ScriptRuntime {
    state: Rc<HostState>,
    pub context: Context,
    // Declared after `context` so the context is freed first.
    runtime: Runtime,
    tokio: tokio::runtime::Runtime,
}

impl ScriptRuntime {
    pub fn new() -> Result<Self, ScriptError> {
        Self::with_settings(Settings::default(), Vec::new())
    }

    /// Create a runtime with `settings`. `args` are what the script sees from
    /// `host.commandLineArgs()`.
    pub fn with_settings(settings: Settings, args: Vec<String>) -> Result<Self, ScriptError> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("tether-worker");
        if let Some(threads) = settings.runtime.worker_threads {
            builder.worker_threads(threads.max(1));
        }
        let tokio = builder.build().map_err(ScriptError::Runtime)?;

        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;
        let state = Rc::new(HostState::new(settings, args, tokio.handle().clone()));
        context.with(|ctx| api::install(&ctx, &state))?;
        tracing::info!(version = tether_core::VERSION, "script runtime ready");

        Ok(Self {
            state,
            context,
            runtime,
            tokio,
        })
    }

    /// Run a script file. See [`ScriptRuntime::execute`].
    pub fn execute_file(&self, path: &Path) -> Result<i32, ScriptError> {
        let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "executing script");
        self.execute(&source)
    }

    /// Evaluate `source` and return its exit code.
    ///
    /// The code is the script's integer completion value, 0 when it has
    /// none, or whatever the script passed to `host.exit`. Promise jobs
    /// queued by the script run before this returns.
    pub fn execute(&self, source: &str) -> Result<i32, ScriptError> {
        let evaluated = self.context.with(|ctx| match ctx.eval::<Value, _>(source) {
            Ok(value) => Ok(completion_code(&value)),
            Err(err) => Err(ffi::error_message(&ctx, err)),
        });
        let drained = evaluated.and_then(|code| self.run_pending_jobs().map(|()| code));

        if let Some(code) = self.state.exit_request.take() {
            tracing::debug!(code, "script exited");
            return Ok(code);
        }
        drained.map_err(ScriptError::Uncaught)
    }

    /// Evaluate an expression and return it as JSON text. `undefined`
    /// becomes `None`.
    pub fn eval_json(&self, source: &str) -> Result<Option<String>, ScriptError> {
        self.context.with(|ctx| {
            let value = ctx
                .eval::<Value, _>(source)
                .map_err(|err| ScriptError::Uncaught(ffi::error_message(&ctx, err)))?;
            let json = ctx
                .json_stringify(value)
                .map_err(|err| ScriptError::Uncaught(ffi::error_message(&ctx, err)))?;
            json.map(|text| text.to_string()).transpose().map_err(ScriptError::from)
        })
    }

    /// Call a JavaScript function by name with no arguments.
    pub fn call_function(&self, name: &str) -> Result<(), ScriptError> {
        self.context.with(|ctx| {
            let call = |ctx: &Ctx<'_>| -> rquickjs::Result<()> {
                let func: Function = ctx.globals().get(name)?;
                func.call::<_, ()>(())
            };
            call(&ctx).map_err(|err| ScriptError::Uncaught(ffi::error_message(&ctx, err)))
        })?;
        self.run_pending_jobs().map_err(ScriptError::Uncaught)
    }

    /// Script callables currently parked in the registry.
    pub fn live_callables(&self) -> usize {
        self.state.callables.len()
    }

    /// Operations created by the script and not yet consumed.
    pub fn pending_operations(&self) -> usize {
        self.state.operations.borrow().len()
    }

    pub fn open_connections(&self) -> usize {
        self.state.connections.borrow().len()
    }

    pub fn settings(&self) -> &Settings {
        &self.state.settings
    }

    pub fn tokio_handle(&self) -> &tokio::runtime::Handle {
        self.tokio.handle()
    }

    fn run_pending_jobs(&self) -> Result<(), String> {
        while self.runtime.is_job_pending() {
            if let Err(job) = self.runtime.execute_pending_job() {
                let message = job.0.with(|ctx| ffi::error_message(&ctx, rquickjs::Error::Exception));
                return Err(message);
            }
        }
        Ok(())
    }
}

/// Integral completion values become the exit code; anything else is 0.
fn completion_code(value: &Value<'_>) -> i32 {
    if let Some(code) = value.as_int() {
        return code;
    }
    match value.as_float() {
        Some(code) if code.fract() == 0.0 && code >= f64::from(i32::MIN) && code <= f64::from(i32::MAX) => {
            code as i32
        }
        _ => 0,
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        self.state.shutdown();
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new().expect("Failed to create script runtime")
    }
}
