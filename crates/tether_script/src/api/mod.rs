//! The `host` global
//!
//! Every entry point is a closure over the runtime's [`HostState`]. Each
//! submodule adds its functions to the shared `host` object.

mod fs;
mod network;
mod process;
mod system;
mod task;

use rquickjs::function::Opt;
use rquickjs::{Ctx, Object};
use std::rc::Rc;

use crate::ffi;
use crate::host::HostState;

/// Name of the global object carrying the host API.
pub const HOST_GLOBAL: &str = "host";

/// Install the host API into `ctx`'s globals.
pub(crate) fn install(ctx: &Ctx<'_>, state: &Rc<HostState>) -> rquickjs::Result<()> {
    let host = Object::new(ctx.clone())?;

    task::register(&host, state)?;
    process::register(&host, state)?;
    network::register(&host, state)?;
    system::register(ctx, &host, state)?;
    fs::register(&host)?;

    let globals = ctx.globals();
    globals.set(HOST_GLOBAL, host.clone())?;
    // Scripts commonly call `print` bare.
    globals.set("print", host.get::<_, rquickjs::Value>("print")?)?;
    tracing::debug!("host api installed");
    Ok(())
}

/// A trailing argument that may be omitted, `undefined` or `null`.
pub(crate) fn optional<T>(arg: Opt<Option<T>>) -> Option<T> {
    arg.0.flatten()
}

/// A non-negative whole count such as a concurrency limit.
pub(crate) fn count_arg(ctx: &Ctx<'_>, name: &str, value: Option<f64>, default: usize) -> rquickjs::Result<usize> {
    match value {
        None => Ok(default),
        Some(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        Some(n) => Err(ffi::throw(ctx, format!("{name} must be a non-negative integer, got {n}"))),
    }
}
