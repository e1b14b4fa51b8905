//! Asynchronous operations
//!
//! An [`AsyncOperation`] observes one unit of background work (a subprocess,
//! a timer, a transfer). The worker side holds the matching [`Completer`],
//! which can be used once. Completion is monotonic: after the first
//! outcome is recorded the state never changes.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Value produced by a completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationValue {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Str(String),
}

/// Tag telling the dispatcher how to decode an operation's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultType {
    Void,
    Int,
    Long,
    Float,
    Double,
    Bool,
    String,
}

impl ResultType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultType::Void => "void",
            ResultType::Int => "int",
            ResultType::Long => "long",
            ResultType::Float => "float",
            ResultType::Double => "double",
            ResultType::Bool => "bool",
            ResultType::String => "string",
        }
    }

    /// Decode `value` under this tag.
    ///
    /// `None` means "deliver nothing": the tag is `Void`, or the value's shape
    /// does not match the tag.
    pub fn decode(self, value: OperationValue) -> Option<OperationValue> {
        let matches = matches!(
            (self, &value),
            (ResultType::Int, OperationValue::Int(_))
                | (ResultType::Long, OperationValue::Long(_))
                | (ResultType::Float, OperationValue::Float(_))
                | (ResultType::Double, OperationValue::Double(_))
                | (ResultType::Bool, OperationValue::Bool(_))
                | (ResultType::String, OperationValue::Str(_))
        );
        if matches {
            Some(value)
        } else {
            if self != ResultType::Void {
                tracing::debug!(tag = self.as_str(), ?value, "result type mismatch, delivering nothing");
            }
            None
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown result type '{0}'")]
pub struct UnknownResultType(pub String);

impl FromStr for ResultType {
    type Err = UnknownResultType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "void" => Ok(ResultType::Void),
            "int" => Ok(ResultType::Int),
            "long" => Ok(ResultType::Long),
            "float" => Ok(ResultType::Float),
            "double" => Ok(ResultType::Double),
            "bool" => Ok(ResultType::Bool),
            "string" => Ok(ResultType::String),
            other => Err(UnknownResultType(other.to_string())),
        }
    }
}

/// Failure of the native action itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),

    #[error("operation was abandoned before completing")]
    Abandoned,
}

impl OperationError {
    pub fn failed(message: impl fmt::Display) -> Self {
        OperationError::Failed(message.to_string())
    }
}

pub type Outcome = Result<OperationValue, OperationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

type Listener = Box<dyn FnOnce() + Send>;

struct State {
    outcome: Option<Outcome>,
    listeners: Vec<Listener>,
}

struct Shared {
    state: Mutex<State>,
    done: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, outcome: Outcome) {
        let listeners = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.listeners)
        };
        self.done.notify_all();
        for listener in listeners {
            listener();
        }
    }
}

/// Observer side of one unit of background work.
///
/// Clones observe the same operation.
#[derive(Clone)]
pub struct AsyncOperation {
    shared: Arc<Shared>,
}

impl AsyncOperation {
    /// Create a pending operation and the completer that settles it.
    pub fn pending() -> (Self, Completer) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outcome: None,
                listeners: Vec::new(),
            }),
            done: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// An operation that is already settled.
    pub fn ready(outcome: Outcome) -> Self {
        let (operation, completer) = Self::pending();
        completer.complete(outcome);
        operation
    }

    /// Run `work` on a dedicated thread.
    pub fn spawn_thread<F>(name: &str, work: F) -> Self
    where
        F: FnOnce() -> Outcome + Send + 'static,
    {
        let (operation, completer) = Self::pending();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || completer.complete(work()));
        if let Err(err) = spawned {
            // The completer moved into the failed closure and was dropped,
            // which already settled the operation as abandoned.
            tracing::error!(%err, "failed to spawn operation thread");
        }
        operation
    }

    pub fn status(&self) -> OperationStatus {
        match &self.shared.lock().outcome {
            None => OperationStatus::Pending,
            Some(Ok(_)) => OperationStatus::Completed,
            Some(Err(_)) => OperationStatus::Failed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    /// Snapshot of the outcome, if settled.
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.lock().outcome.clone()
    }

    /// Block the calling thread until the operation settles.
    pub fn wait(&self) -> Outcome {
        let mut state = self.shared.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .done
            .wait_timeout_while(state, timeout, |state| state.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.outcome.clone()
    }

    /// Run `listener` once the operation settles.
    ///
    /// Runs immediately on the calling thread if already settled, otherwise
    /// on whichever thread completes the operation. Listeners must only
    /// signal; they never touch interpreter state.
    pub fn on_complete(&self, listener: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.lock();
            if state.outcome.is_none() {
                state.listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("status", &self.status())
            .finish()
    }
}

/// Worker side of an [`AsyncOperation`].
///
/// Dropping a completer without settling marks the operation
/// [`OperationError::Abandoned`].
pub struct Completer {
    shared: Option<Arc<Shared>>,
}

impl Completer {
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(shared) = self.shared.take() {
            shared.finish(outcome);
        }
    }

    pub fn succeed(self, value: OperationValue) {
        self.complete(Ok(value));
    }

    pub fn fail(self, message: impl fmt::Display) {
        self.complete(Err(OperationError::failed(message)));
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish(Err(OperationError::Abandoned));
        }
    }
}
