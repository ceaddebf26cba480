//! Adapter resolution.
//!
//! Resolution order for the concrete [`Computer`] backend:
//!
//! 1. explicit `adapter` argument (CLI `--adapter`),
//! 2. the `CUA_ADAPTER` environment variable,
//! 3. the platform default (`"macos"` on macOS, `"windows"` on Windows,
//!    `"sim"` elsewhere so headless CI keeps working).
//!
//! Platform backends are registered behind target gates; requesting an
//! adapter that is not compiled in is an unrecoverable error surfaced to the
//! CLI with a nonzero exit.

use tracing::info;

use cua_types::{CuaError, Settings};

use crate::adapter::Computer;
use crate::sim::SimComputer;

fn default_adapter_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "sim"
    }
}

/// Load a concrete [`Computer`].
///
/// # Errors
///
/// Returns [`CuaError::UnknownAdapter`] when the resolved name is not
/// registered in this build.
pub fn load_computer(
    _settings: &Settings,
    adapter: Option<&str>,
) -> Result<Box<dyn Computer>, CuaError> {
    let name = adapter
        .map(str::to_string)
        .or_else(|| std::env::var("CUA_ADAPTER").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| default_adapter_name().to_string());

    info!(adapter = %name, "loading computer adapter");
    match name.as_str() {
        "sim" => Ok(Box::new(SimComputer::new())),
        // Platform backends plug in here; they live out-of-tree and register
        // under these names.
        other => Err(CuaError::UnknownAdapter(other.to_string())),
    }
}
