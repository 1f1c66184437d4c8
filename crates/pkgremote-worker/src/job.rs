//! Build delegate capability and the job handed to it.

use std::io;
use std::path::{Path, PathBuf};

use pkgremote_protocol::{CorrelationId, JobError, JobMetadata, MetadataError, UnpackedFile};

use crate::config::TrustedConfig;

/// Everything a build delegate may look at for one job.
///
/// The staging and output directories belong to this job alone and are
/// removed by the worker once the job is finished.
#[derive(Debug)]
pub struct WorkerJob<'a> {
    /// Correlation id of the job.
    pub id: CorrelationId,
    /// Directory holding the extracted input files.
    pub staging_dir: &'a Path,
    /// Empty directory for the delegate's artifact and intermediates.
    pub output_dir: &'a Path,
    /// Files extracted into `staging_dir`, in archive order.
    pub files: &'a [UnpackedFile],
    /// Caller-supplied metadata.
    pub metadata: &'a JobMetadata,
    /// Worker-local trusted configuration.
    pub trusted: &'a TrustedConfig,
}

/// Errors from a build delegate.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed ({}): {stderr}", describe_status(.status))]
    Tool {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(String),
}

impl BuildError {
    /// Structured form sent back to the caller.
    pub fn to_job_error(&self) -> JobError {
        match self {
            Self::Metadata(e) => JobError::invalid_request(e.to_string()),
            Self::Tool { tool, status, .. } => JobError::with_data(
                pkgremote_protocol::ErrorCode::BuildFailed,
                self.to_string(),
                serde_json::json!({ "tool": tool, "status": status }),
            ),
            _ => JobError::build_failed(self.to_string()),
        }
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Result of one build: the single artifact produced.
pub type BuildResult = Result<PathBuf, BuildError>;

/// Format-specific packaging logic injected into the worker.
pub trait BuildDelegate: Send + Sync {
    /// Build an artifact from `job`, returning its path.
    ///
    /// The artifact should be written inside `job.output_dir`.
    fn build(&self, job: &WorkerJob<'_>) -> BuildResult;
}

impl<F> BuildDelegate for F
where
    F: Fn(&WorkerJob<'_>) -> BuildResult + Send + Sync,
{
    fn build(&self, job: &WorkerJob<'_>) -> BuildResult {
        self(job)
    }
}
