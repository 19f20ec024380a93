//! Tracing setup.
//!
//! Foreground runs log to stderr; daemon runs append to the project's
//! log file with ANSI disabled. `RUST_LOG` overrides the default filter.

use std::path::Path;

use tracing_subscriber::EnvFilter;

fn filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

pub fn init_stderr(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn init_file(path: &Path, debug: bool) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_writer(file)
        .with_ansi(false)
        .try_init();
    Ok(())
}
