//! Tether Services Layer
//!
//! Native work behind script operations: processes, timers, downloads,
//! filesystem helpers, plus host settings.

pub mod delay;
pub mod download;
pub mod files;
pub mod process;
pub mod settings;

pub use settings::Settings;
