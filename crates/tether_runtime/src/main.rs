//! Tether Runtime
//!
//! `tether <entry.js> [args...]`: runs a script with the host library and
//! exits with its exit code.

use anyhow::{Context, Result};
use std::path::Path;
use tether_script::{ScriptError, ScriptRuntime};
use tether_services::Settings;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the script.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(entry) = args.next() else {
        eprintln!("usage: tether <entry.js> [args...]");
        std::process::exit(2);
    };

    let code = run(Path::new(&entry), args.collect())?;
    std::process::exit(code);
}

/// Run `entry` from its own directory. Returns the script's exit code; an
/// uncaught script error is printed and reported as 1.
fn run(entry: &Path, args: Vec<String>) -> Result<i32> {
    let entry = entry
        .canonicalize()
        .with_context(|| format!("script not found: {}", entry.display()))?;
    let dir = entry
        .parent()
        .context("script path has no parent directory")?;
    std::env::set_current_dir(dir)
        .with_context(|| format!("failed to enter {}", dir.display()))?;

    let settings = Settings::discover(dir)?;
    tracing::info!("Tether v{}", tether_core::VERSION);
    tracing::debug!(script = %entry.display(), ?settings, "starting");

    let runtime = ScriptRuntime::with_settings(settings, args)?;
    match runtime.execute_file(&entry) {
        Ok(code) => Ok(code),
        Err(ScriptError::Uncaught(message)) => {
            eprintln!("error: {message}");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}
