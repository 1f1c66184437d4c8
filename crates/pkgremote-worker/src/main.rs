//! Standalone worker entrypoint
//!
//! Usage: pkgremote-worker
//!
//! Reads its configuration from the environment (see
//! `pkgremote_worker::config`) and serves jobs until SIGINT/SIGTERM.

use std::process::ExitCode;

use tracing::error;

fn main() -> ExitCode {
    pkgremote_worker::logging::init();

    if let Err(e) = pkgremote_worker::run_local_server() {
        error!(error = %e, "worker failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
