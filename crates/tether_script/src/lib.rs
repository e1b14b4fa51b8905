//! Tether Scripting System
//!
//! Hosts a QuickJS interpreter on one thread and exposes the native host
//! library to it through the `host` global.
//!
//! ## Architecture
//!
//! - **Interpreter:** QuickJS via `rquickjs`, single threaded, never shared
//! - **Native work:** tokio runtime owned by [`ScriptRuntime`]
//! - **FFI:** integer handles for host objects, parked functions for callbacks
//!   (see [`ffi`])

mod api;
pub mod ffi;
mod host;
pub mod runtime;

pub use api::HOST_GLOBAL;
pub use rquickjs;
pub use runtime::{ScriptError, ScriptRuntime};
