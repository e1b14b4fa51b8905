//! Process environment, console and host information

use rquickjs::convert::Coerced;
use rquickjs::function::{Func, Opt, Rest};
use rquickjs::{Ctx, IntoJs, Object, Value};
use std::io::BufRead;
use std::rc::Rc;

use super::optional;
use crate::ffi;
use crate::host::HostState;

pub(super) fn register<'js>(ctx: &Ctx<'js>, host: &Object<'js>, state: &Rc<HostState>) -> rquickjs::Result<()> {
    host.set("version", tether_core::VERSION)?;
    host.set("osType", Func::from(os_type))?;

    let settings = serde_json::to_string(&state.settings).map_err(|err| ffi::throw(ctx, err))?;
    host.set("settings", ctx.json_parse(settings)?)?;

    let st = Rc::clone(state);
    host.set("commandLineArgs", Func::from(move || st.args.clone()))?;

    host.set(
        "env",
        Func::from(|ctx: Ctx<'js>, name: String| ffi::nullable(&ctx, std::env::var(name).ok())),
    )?;
    host.set("envAll", Func::from(env_all))?;

    let st = Rc::clone(state);
    host.set(
        "exit",
        Func::from(move |ctx: Ctx<'js>, code: Opt<Option<i32>>| -> rquickjs::Result<()> {
            let code = optional(code).unwrap_or(0);
            tracing::debug!(code, "script requested exit");
            st.exit_request.set(Some(code));
            Err(exit_error(&ctx, code))
        }),
    )?;

    host.set("readLine", Func::from(read_line))?;
    host.set("print", Func::from(print))?;
    Ok(())
}

/// The error that unwinds the script after `host.exit`.
pub(super) fn exit_error(ctx: &Ctx<'_>, code: i32) -> rquickjs::Error {
    ffi::throw(ctx, format!("exit({code})"))
}

fn os_type(ctx: Ctx<'_>) -> rquickjs::Result<Value<'_>> {
    ffi::nullable(&ctx, os_name())
}

fn os_name() -> Option<&'static str> {
    if cfg!(target_os = "windows") {
        Some("Windows")
    } else if cfg!(target_os = "macos") {
        Some("MacOS")
    } else if cfg!(target_os = "android") {
        Some("Android")
    } else if cfg!(target_os = "ios") {
        Some("iOS")
    } else if cfg!(target_os = "linux") {
        Some("Linux")
    } else {
        None
    }
}

fn env_all(ctx: Ctx<'_>) -> rquickjs::Result<Object<'_>> {
    let vars = Object::new(ctx)?;
    for (name, value) in std::env::vars_os() {
        // Names or values that are not unicode can't be represented.
        if let (Ok(name), Ok(value)) = (name.into_string(), value.into_string()) {
            vars.set(name, value)?;
        }
    }
    Ok(vars)
}

/// One line from stdin without its terminator, or `null` at end of input.
fn read_line(ctx: Ctx<'_>) -> rquickjs::Result<Value<'_>> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) => Ok(Value::new_null(ctx)),
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\r', '\n']).len();
            line.truncate(trimmed);
            line.into_js(&ctx)
        }
        Err(err) => Err(ffi::throw(&ctx, err)),
    }
}

fn print(values: Rest<Value<'_>>) -> rquickjs::Result<()> {
    let mut parts = Vec::with_capacity(values.0.len());
    for value in values.0 {
        parts.push(value.get::<Coerced<String>>()?.0);
    }
    println!("{}", parts.join(" "));
    Ok(())
}
