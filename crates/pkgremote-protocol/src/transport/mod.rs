//! Queue transport capability.
//!
//! Callers and workers never talk to each other directly. Both sides hold a
//! [`QueueTransport`]: callers submit jobs and wait for correlated replies,
//! workers poll for jobs and publish replies. Delivery is assumed reliable
//! and at-least-once; correlation is the transport's responsibility.
//!
//! Two implementations are provided:
//! - [`MemoryQueue`]: in-process queue for tests and single-process setups
//! - [`SpoolQueue`]: filesystem spool shared between hosts

mod memory;
mod spool;

pub use memory::MemoryQueue;
pub use spool::{SpoolQueue, DEFAULT_REPLY_POLL_INTERVAL};

use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use crate::envelope::{CorrelationId, JobEnvelope, ReplyEnvelope};
use crate::metadata::JobMetadata;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timed out after {waited:?} waiting for reply to job {id}")]
    Timeout { id: CorrelationId, waited: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid queue or channel name: {0:?}")]
    InvalidName(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Returns true if no reply arrived before the deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A job taken off the queue by a worker.
///
/// The archive lives in a temporary file inside the scratch directory the
/// worker passed to [`QueueTransport::poll`]; it is removed on drop.
#[derive(Debug)]
pub struct ReceivedJob {
    pub envelope: JobEnvelope,
    pub archive: NamedTempFile,
}

/// A reply collected by a caller.
#[derive(Debug)]
pub struct Reply {
    pub envelope: ReplyEnvelope,
    /// Reply archive, present when the job succeeded.
    pub archive: Option<NamedTempFile>,
}

/// Request/reply queue shared by callers and workers.
pub trait QueueTransport: Send + Sync {
    /// Enqueue the archive at `archive` with `metadata` under `channel`.
    ///
    /// Returns the correlation id the reply will carry.
    fn submit(
        &self,
        channel: &str,
        archive: &Path,
        metadata: &JobMetadata,
    ) -> Result<CorrelationId, TransportError>;

    /// Block until the reply to `id` arrives or `deadline` passes.
    ///
    /// A reply archive is materialized inside `scratch`.
    fn await_reply(
        &self,
        id: &CorrelationId,
        deadline: Instant,
        scratch: &Path,
    ) -> Result<Reply, TransportError>;

    /// Take the next pending job for `channel`, if any, without blocking.
    ///
    /// The job's archive is materialized inside `scratch`.
    fn poll(&self, channel: &str, scratch: &Path) -> Result<Option<ReceivedJob>, TransportError>;

    /// Publish a reply. `archive` is required when `envelope.ok` is true.
    fn reply(&self, envelope: &ReplyEnvelope, archive: Option<&Path>) -> Result<(), TransportError>;
}

impl<T: QueueTransport + ?Sized> QueueTransport for std::sync::Arc<T> {
    fn submit(
        &self,
        channel: &str,
        archive: &Path,
        metadata: &JobMetadata,
    ) -> Result<CorrelationId, TransportError> {
        (**self).submit(channel, archive, metadata)
    }

    fn await_reply(
        &self,
        id: &CorrelationId,
        deadline: Instant,
        scratch: &Path,
    ) -> Result<Reply, TransportError> {
        (**self).await_reply(id, deadline, scratch)
    }

    fn poll(&self, channel: &str, scratch: &Path) -> Result<Option<ReceivedJob>, TransportError> {
        (**self).poll(channel, scratch)
    }

    fn reply(&self, envelope: &ReplyEnvelope, archive: Option<&Path>) -> Result<(), TransportError> {
        (**self).reply(envelope, archive)
    }
}

fn scratch_file(scratch: &Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix("pkgremote-")
        .suffix(".tar.gz")
        .tempfile_in(scratch)
}

fn write_scratch(scratch: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    let mut file = scratch_file(scratch)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

fn copy_to_scratch(scratch: &Path, source: &Path) -> io::Result<NamedTempFile> {
    let file = scratch_file(scratch)?;
    std::fs::copy(source, file.path())?;
    Ok(file)
}

fn check_name(name: &str) -> Result<(), TransportError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidName(name.to_string()))
    }
}
