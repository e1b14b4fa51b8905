//! Child process execution
//!
//! Children always get piped stdout and stderr so they never write into the
//! host's terminal. Output is only kept when capture was requested, one line
//! per output line in arrival order.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tether_core::{AsyncOperation, OperationValue};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::runtime::Handle;

/// Exit code reported when a process could not be run at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;

/// What to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub file: String,
    pub args: Vec<String>,
    pub capture_output: bool,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            args: Vec::new(),
            capture_output: false,
            working_dir: None,
        }
    }

    /// Set arguments from a single command-line string.
    pub fn args_line(mut self, line: &str) -> Self {
        self.args = split_args(line);
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

/// Split an argument string on whitespace. Double quotes group words and are
/// removed; `""` yields an empty argument.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    /// Present only when capture was requested.
    pub output: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start '{file}': {source}")]
    Spawn {
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for '{file}': {source}")]
    Wait {
        file: String,
        #[source]
        source: io::Error,
    },
}

/// Output slot filled by a background process before its operation settles.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Option<String>>>);

impl CapturedOutput {
    fn set(&self, text: String) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(text);
    }

    pub fn take(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

async fn pump<R>(reader: Option<R>, sink: Option<&Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(sink) = sink {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end_matches(['\r', '\n']);
                    let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    out.push_str(text);
                    out.push('\n');
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed reading child output");
                break;
            }
        }
    }
}

/// Run a process to completion.
pub async fn run(spec: &ProcessSpec) -> Result<ProcessOutcome, ProcessError> {
    let mut command = Command::new(&spec.file);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        file: spec.file.clone(),
        source,
    })?;
    tracing::debug!(file = %spec.file, pid = ?child.id(), capture = spec.capture_output, "process started");

    let output = Mutex::new(String::new());
    let sink = spec.capture_output.then_some(&output);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, (), ()) = tokio::join!(child.wait(), pump(stdout, sink), pump(stderr, sink));
    let status = status.map_err(|source| ProcessError::Wait {
        file: spec.file.clone(),
        source,
    })?;

    // Killed by a signal has no code.
    let exit_code = status.code().unwrap_or(-1);
    tracing::debug!(file = %spec.file, exit_code, "process exited");

    Ok(ProcessOutcome {
        exit_code,
        output: spec
            .capture_output
            .then(|| output.into_inner().unwrap_or_else(PoisonError::into_inner)),
    })
}

/// Run a process on `handle`, blocking the calling thread.
///
/// A process that can not be run reports [`SPAWN_FAILURE_EXIT_CODE`].
pub fn run_blocking(handle: &Handle, spec: &ProcessSpec) -> ProcessOutcome {
    match handle.block_on(run(spec)) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(%err, "process failed");
            ProcessOutcome {
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                output: spec.capture_output.then(String::new),
            }
        }
    }
}

/// Start a process in the background.
///
/// The operation's value is the exit code as [`OperationValue::Int`]. The
/// captured output, if requested, is stored in `output` before the operation
/// settles.
pub fn spawn(handle: &Handle, spec: ProcessSpec, output: &CapturedOutput) -> AsyncOperation {
    let (operation, completer) = AsyncOperation::pending();
    let slot = output.clone();

    handle.spawn(async move {
        match run(&spec).await {
            Ok(outcome) => {
                if let Some(text) = outcome.output {
                    slot.set(text);
                }
                completer.succeed(OperationValue::Int(outcome.exit_code));
            }
            Err(err) => {
                tracing::warn!(%err, "background process failed");
                completer.fail(err);
            }
        }
    });

    operation
}
