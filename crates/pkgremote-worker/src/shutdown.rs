//! Graceful shutdown on SIGINT/SIGTERM.
//!
//! The worker process runs two threads joined as a unit:
//! 1. the service loop ([`Service::serve`])
//! 2. a watcher that waits for the shared [`ShutdownToken`] and then asks
//!    the service to close
//!
//! The signal handler only cancels the token. Whichever thread finishes
//! first, the token ends up cancelled so the other one winds down too.
//! A cancellation exit is a clean shutdown, never an error.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::WorkerError;

/// Cancellation flag shared between the service, the watcher and the
/// signal handler.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn cancel(&self) {
        let (flag, changed) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) {
        let (flag, changed) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|e| e.into_inner());
        while !*cancelled {
            cancelled = changed.wait(cancelled).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Sleep for up to `timeout`, returning early if shutdown is requested.
    ///
    /// Returns true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        // A timeout past the end of the clock is no timeout at all.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let (flag, changed) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|e| e.into_inner());
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = changed
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            cancelled = guard;
        }
        *cancelled
    }
}

/// How a service loop ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The shutdown token was cancelled.
    Cancelled,
    /// [`Service::close`] was called.
    Closed,
}

/// A long-running loop that can be asked to stop.
pub trait Service: Sync {
    /// Run until `shutdown` is cancelled, the service is closed, or a fatal
    /// error occurs.
    fn serve(&self, shutdown: &ShutdownToken) -> Result<ServeExit, WorkerError>;

    /// Ask a running [`Service::serve`] to return.
    fn close(&self) -> Result<(), WorkerError>;
}

/// Install SIGINT/SIGTERM handling that cancels `token`.
///
/// May only be called once per process.
pub fn install_signal_handler(token: ShutdownToken) -> Result<(), WorkerError> {
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            warn!("received another termination signal, shutdown already in progress");
        } else {
            info!("received termination signal, shutting down");
        }
        token.cancel();
    })?;
    Ok(())
}

/// Run `service` and its shutdown watcher until both finish.
///
/// Returns the first error from either thread. A service that stops because
/// it was cancelled or closed yields `Ok(())`.
pub fn run_until_shutdown<S: Service>(service: &S, shutdown: &ShutdownToken) -> Result<(), WorkerError> {
    let (served, watched) = thread::scope(|scope| {
        let server = scope.spawn(|| {
            let result = service.serve(shutdown);
            // Release the watcher however the loop ended.
            shutdown.cancel();
            result
        });

        let watcher = scope.spawn(|| {
            shutdown.wait();
            info!("Closing server ...");
            service.close()
        });

        (
            server.join().map_err(|_| WorkerError::Panicked("server")),
            watcher.join().map_err(|_| WorkerError::Panicked("shutdown watcher")),
        )
    });

    let served = served.and_then(|r| r);
    let watched = watched.and_then(|r| r);

    match served {
        Ok(exit) => info!(?exit, "server stopped"),
        Err(e) => return Err(e),
    }
    watched
}
