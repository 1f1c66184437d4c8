//! Remote package build worker
//!
//! Runs on a macOS host holding the Developer ID signing identity. It polls
//! a queue channel for jobs, unpacks each into a private staging directory,
//! hands it to a [`BuildDelegate`], and replies with the built package.
//!
//! This crate can be used in two modes:
//! - **Standalone process**: [`run_local_server`] wired to the filesystem
//!   spool and the `pkgbuild` delegate, stopped by SIGINT/SIGTERM
//! - **In-process library**: [`Worker`] over any [`QueueTransport`] and
//!   delegate, for tests and embedders
//!
//! [`QueueTransport`]: pkgremote_protocol::QueueTransport

pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod pkgbuild;
pub mod shutdown;
pub mod worker;

use std::sync::Arc;

use pkgremote_protocol::SpoolQueue;
use tracing::info;

pub use config::{ConfigError, TrustedConfig, WorkerConfig};
pub use error::WorkerError;
pub use job::{BuildDelegate, BuildError, BuildResult, WorkerJob};
pub use pkgbuild::PkgbuildDelegate;
pub use shutdown::{install_signal_handler, run_until_shutdown, ServeExit, Service, ShutdownToken};
pub use worker::{ServeOptions, Worker, WorkerState};

/// Run the worker until a termination signal arrives.
///
/// Configuration is read from the environment before anything touches the
/// queue; a missing signing identity or queue parameter fails here.
pub fn run_local_server() -> Result<(), WorkerError> {
    let config = WorkerConfig::from_env()?;
    info!(
        queue = %config.queue,
        spool = %config.spool_dir.display(),
        channel = %config.channel,
        "starting local server"
    );

    let transport = SpoolQueue::open(&config.spool_dir, &config.queue)
        .map_err(|e| WorkerError::transport(&config.channel, e))?;
    let worker = Worker::new(
        Arc::new(transport),
        Arc::new(PkgbuildDelegate::new()),
        config.trusted.clone(),
        ServeOptions::from(&config),
    );

    serve_until_signalled(&worker, ShutdownToken::new())
}

/// Install the signal handler for `shutdown` and run `service` until it
/// stops.
///
/// The handler is process-wide, so this may only be called once.
pub fn serve_until_signalled<S: Service>(service: &S, shutdown: ShutdownToken) -> Result<(), WorkerError> {
    install_signal_handler(shutdown.clone())?;
    run_until_shutdown(service, &shutdown)?;

    info!("Done.");
    Ok(())
}
