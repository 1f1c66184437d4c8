//! Request and reply envelopes.
//!
//! An envelope is the JSON record that travels next to an archive blob. The
//! correlation id is assigned by the transport at submission time and is
//! echoed in the reply so the caller can match the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::archive::{digest_file, ArchiveError};
use crate::error::JobError;
use crate::metadata::JobMetadata;

/// Identity matching a reply to the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Envelope of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Correlation id assigned at submission.
    pub id: CorrelationId,
    /// Channel the job was submitted under.
    pub channel: String,
    /// Caller-supplied parameters.
    pub metadata: JobMetadata,
    /// SHA-256 hex of the archive blob.
    pub archive_sha256: String,
    /// When the job entered the queue.
    pub submitted_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(channel: impl Into<String>, metadata: JobMetadata, archive_sha256: String) -> Self {
        Self {
            id: CorrelationId::new(),
            channel: channel.into(),
            metadata,
            archive_sha256,
            submitted_at: Utc::now(),
        }
    }

    /// Check that the archive at `path` is the one this envelope describes.
    pub fn verify_archive(&self, path: &Path) -> Result<(), ArchiveError> {
        verify_digest(&self.archive_sha256, path)
    }
}

/// Envelope of a reply.
///
/// Exactly one of `archive_sha256` (success) and `error` (failure) is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Correlation id echoed from the job.
    pub id: CorrelationId,
    /// Whether the job succeeded.
    pub ok: bool,
    /// Worker-supplied metadata about the result.
    #[serde(default)]
    pub metadata: JobMetadata,
    /// SHA-256 hex of the reply archive (present when ok=true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,
    /// Failure details (present when ok=false).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// When the worker published the reply.
    pub replied_at: DateTime<Utc>,
}

impl ReplyEnvelope {
    /// Successful reply carrying an archive.
    pub fn success(id: CorrelationId, metadata: JobMetadata, archive_sha256: String) -> Self {
        Self {
            id,
            ok: true,
            metadata,
            archive_sha256: Some(archive_sha256),
            error: None,
            replied_at: Utc::now(),
        }
    }

    /// Negative reply carrying a structured error.
    pub fn failure(id: CorrelationId, error: JobError) -> Self {
        Self {
            id,
            ok: false,
            metadata: JobMetadata::new(),
            archive_sha256: None,
            error: Some(error),
            replied_at: Utc::now(),
        }
    }

    /// Check that the reply archive at `path` is the one this envelope describes.
    pub fn verify_archive(&self, path: &Path) -> Result<(), ArchiveError> {
        match &self.archive_sha256 {
            Some(expected) => verify_digest(expected, path),
            None => Err(ArchiveError::Corrupt(format!(
                "reply {} carries no archive digest",
                self.id
            ))),
        }
    }
}

fn verify_digest(expected: &str, path: &Path) -> Result<(), ArchiveError> {
    let actual = digest_file(path).map_err(|e| ArchiveError::SourceUnreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    if actual != expected {
        return Err(ArchiveError::Corrupt(format!(
            "archive SHA-256 mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}
