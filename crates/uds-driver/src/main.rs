//! uds-driver binary: serves socket requests as newline-delimited JSON.
//!
//! Each line on stdin is one [`Request`]; every reply produced by it is
//! written to stdout as one JSON line. Logs go to stderr.

use std::io::{BufRead, Write};

use miette::{IntoDiagnostic, Result, WrapErr};
use tracing_subscriber::EnvFilter;

use uds_driver::{DriverConfig, MemoryDriver, Request};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("uds_driver=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match get_arg(&args, "--config") {
        Some(path) => DriverConfig::from_file(&path)?,
        None => DriverConfig::default(),
    };
    config.validate()?;

    let mut driver = MemoryDriver::in_memory(config);
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for (lineno, line) in stdin.lock().lines().enumerate() {
        let line = line.into_diagnostic().wrap_err("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "ignoring malformed request");
                continue;
            }
        };
        for reply in driver.dispatch(request) {
            serde_json::to_writer(&mut stdout, &reply).into_diagnostic()?;
            stdout.write_all(b"\n").into_diagnostic()?;
        }
        stdout.flush().into_diagnostic()?;
    }

    tracing::info!(open = driver.table().open_count(), "input closed, shutting down");
    Ok(())
}

/// Get the value following a CLI flag.
fn get_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}
