//! Remote caller.
//!
//! One blocking request/reply exchange with a worker: pack the input, submit
//! it, wait for the correlated reply, and land the returned artifact at the
//! requested path. Transport failures propagate as-is; nothing is retried.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use pkgremote_protocol::{
    pack, unpack, ArchiveBundle, ArchiveError, CorrelationId, JobError, JobMetadata,
    QueueTransport, TransportError,
};
use tracing::{debug, info};

use crate::settings::{CallTimeouts, TimeoutValidationError};

/// Errors from a remote call
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("this plugin currently supports 1 file only (the binary), got {0}")]
    FileCount(usize),

    #[error("invalid timeouts: {0}")]
    Timeouts(#[from] TimeoutValidationError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote build failed: {0}")]
    Remote(JobError),

    #[error("unexpected reply to job {id}: {reason}")]
    UnexpectedReply { id: CorrelationId, reason: String },

    #[error("cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CallError {
    /// Returns true if no reply arrived before the deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_timeout())
    }

    fn output(path: &Path, source: io::Error) -> Self {
        Self::Output {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutput {
    /// Correlation id of the job.
    pub id: CorrelationId,
    /// Where the artifact was written.
    pub path: PathBuf,
    /// Metadata returned by the worker.
    pub metadata: JobMetadata,
}

/// Client side of the job queue.
pub struct RemoteCaller<T> {
    transport: T,
    scratch_dir: PathBuf,
}

impl<T: QueueTransport> RemoteCaller<T> {
    /// Caller whose temporary archives live in the system temp directory.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Build `input` remotely on `channel` and write the artifact to `output`.
    ///
    /// On success exactly one file exists at `output`; on failure nothing is
    /// written there. Temporary archives are removed on every path.
    pub fn call(
        &self,
        channel: &str,
        input: &ArchiveBundle,
        metadata: &JobMetadata,
        output: &Path,
        timeouts: &CallTimeouts,
    ) -> Result<CallOutput, CallError> {
        timeouts.validate()?;
        if input.len() != 1 {
            return Err(CallError::FileCount(input.len()));
        }
        let started = Instant::now();

        let id = self.submit(channel, input, metadata)?;
        info!(channel, job_id = %id, "job submitted, waiting for reply");

        let deadline = timeouts.reply_deadline(started);
        let reply = self.transport.await_reply(&id, deadline, &self.scratch_dir)?;

        if !reply.envelope.ok {
            let error = reply.envelope.error.unwrap_or_else(|| {
                JobError::internal("negative reply without error details")
            });
            return Err(CallError::Remote(error));
        }

        let archive = reply.archive.ok_or_else(|| CallError::UnexpectedReply {
            id,
            reason: "successful reply carries no archive".to_string(),
        })?;
        reply.envelope.verify_archive(archive.path())?;

        land_artifact(&id, archive.path(), output)?;
        info!(channel, job_id = %id, output = %output.display(), "artifact received");

        Ok(CallOutput {
            id,
            path: output.to_path_buf(),
            metadata: reply.envelope.metadata,
        })
    }

    fn submit(
        &self,
        channel: &str,
        input: &ArchiveBundle,
        metadata: &JobMetadata,
    ) -> Result<CorrelationId, CallError> {
        let archive = tempfile::Builder::new()
            .prefix("pkgremote-call-")
            .suffix(".tar.gz")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| ArchiveError::DestinationUnwritable {
                target: self.scratch_dir.display().to_string(),
                source: e,
            })?;
        let file = archive.reopen().map_err(|e| ArchiveError::DestinationUnwritable {
            target: archive.path().display().to_string(),
            source: e,
        })?;
        pack(input.entries(), file)?;
        debug!(path = %archive.path().display(), "input archive packed");

        // The transport keeps its own copy; ours is removed on drop.
        Ok(self.transport.submit(channel, archive.path(), metadata)?)
    }
}

/// Unpack the reply next to `output`, then move its single file into place.
fn land_artifact(id: &CorrelationId, archive: &Path, output: &Path) -> Result<(), CallError> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staging = tempfile::Builder::new()
        .prefix(".pkgremote-")
        .tempdir_in(parent)
        .map_err(|e| CallError::output(output, e))?;

    let reader = File::open(archive).map_err(|e| ArchiveError::SourceUnreadable {
        path: archive.to_path_buf(),
        source: e,
    })?;
    let files = unpack(BufReader::new(reader), staging.path())?;
    if files.len() != 1 {
        return Err(CallError::UnexpectedReply {
            id: *id,
            reason: format!("expected exactly one file in reply archive, got {}", files.len()),
        });
    }

    fs::rename(&files[0].path, output).map_err(|e| CallError::output(output, e))?;
    Ok(())
}
