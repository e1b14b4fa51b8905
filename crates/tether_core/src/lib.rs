//! Tether Core
//!
//! Engine-agnostic building blocks for hosting a single-threaded script
//! interpreter on top of concurrent native work:
//! - Callable handle registry
//! - Asynchronous operations and their completers
//! - Bounded-concurrency scheduler
//! - Packet framing and the connection event bridge

pub mod bridge;
pub mod frame;
pub mod operation;
pub mod registry;
pub mod scheduler;

pub use bridge::{ConnectionEvent, ConnectionId, DispatchReport, EventBridge};
pub use frame::{FrameDecoder, FrameError, Payload, PayloadKind};
pub use operation::{
    AsyncOperation, Completer, OperationError, OperationStatus, OperationValue, Outcome,
    ResultType,
};
pub use registry::{CallableHandle, CallableRegistry, HandleKey};
pub use scheduler::{Admission, BoundedScheduler, Completion, Delivery, Job, RunReport};

/// Host library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
