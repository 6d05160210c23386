//! Shared pieces of Parley: the signaling wire protocol, logging setup, error types.
//!
//! Everything here is transport agnostic; the server crate owns sockets and state.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::*;

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

/// Initialize tracing to stdout.
///
/// `RUST_LOG` takes precedence over `default_level` when set.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Initialize tracing that writes to `path` instead of stdout.
///
/// The file is truncated first so each run starts with a clean log.
pub fn init_tracing_to_file(default_level: &str, path: &Path) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let file = File::create(path)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}
