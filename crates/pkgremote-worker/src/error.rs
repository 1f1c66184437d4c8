//! Fatal worker errors.
//!
//! A single job's failure never shows up here; it becomes a negative reply.
//! These are the conditions that stop the worker process.

use std::io;

use pkgremote_protocol::TransportError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error on channel '{channel}': {source}")]
    Transport {
        channel: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} task panicked")]
    Panicked(&'static str),
}

impl WorkerError {
    pub fn transport(channel: &str, source: TransportError) -> Self {
        Self::Transport {
            channel: channel.to_string(),
            source,
        }
    }
}
