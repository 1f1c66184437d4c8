//! Worker loop.
//!
//! Polls one channel, runs each job through the build delegate inside a
//! private workspace, and publishes exactly one reply per job. A job's
//! failure becomes a negative reply; only transport failures end the loop.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pkgremote_protocol::archive::digest_file;
use pkgremote_protocol::{
    pack, unpack, ArchiveEntry, ArchiveError, JobError, QueueTransport, ReceivedJob,
    ReplyEnvelope,
};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, error, info, info_span, warn};

use crate::config::{TrustedConfig, WorkerConfig};
use crate::error::WorkerError;
use crate::job::{BuildDelegate, WorkerJob};
use crate::shutdown::{ServeExit, Service, ShutdownToken};

/// Where the worker is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Polling = 1,
    Processing = 2,
    Replying = 3,
    Closing = 4,
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Polling,
            2 => Self::Processing,
            3 => Self::Replying,
            4 => Self::Closing,
            5 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Loop parameters.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Channel to take jobs from.
    pub channel: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Parent directory for job workspaces and transient archives.
    pub scratch_dir: PathBuf,
}

impl From<&WorkerConfig> for ServeOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            poll_interval: config.poll_interval,
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

/// Reply archive ready to publish.
struct BuiltReply {
    archive: NamedTempFile,
    sha256: String,
}

/// Queue consumer that turns jobs into built artifacts.
pub struct Worker {
    transport: Arc<dyn QueueTransport>,
    delegate: Arc<dyn BuildDelegate>,
    trusted: TrustedConfig,
    options: ServeOptions,
    state: AtomicU8,
    closing: AtomicBool,
    /// Token of the running `serve`, so `close` can cut a sleep short.
    wake: Mutex<Option<ShutdownToken>>,
}

impl Worker {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        delegate: Arc<dyn BuildDelegate>,
        trusted: TrustedConfig,
        options: ServeOptions,
    ) -> Self {
        Self {
            transport,
            delegate,
            trusted,
            options,
            state: AtomicU8::new(WorkerState::Idle as u8),
            closing: AtomicBool::new(false),
            wake: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.options.channel
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        let state = WorkerState::from_u8(self.state.load(Ordering::SeqCst));
        if state != WorkerState::Stopped && self.closing.load(Ordering::SeqCst) {
            return WorkerState::Closing;
        }
        state
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Poll once and process the job found, if any.
    ///
    /// Returns whether a job was processed. Errors are transport failures;
    /// a failed job is answered with a negative reply and is not an error.
    pub fn run_once(&self) -> Result<bool, WorkerError> {
        let channel = self.channel();
        self.set_state(WorkerState::Polling);

        let job = self
            .transport
            .poll(channel, &self.options.scratch_dir)
            .map_err(|e| WorkerError::transport(channel, e))?;

        let processed = match job {
            Some(job) => {
                self.handle(job)?;
                true
            }
            None => false,
        };
        self.set_state(WorkerState::Idle);
        Ok(processed)
    }

    fn serve_loop(&self, shutdown: &ShutdownToken) -> Result<ServeExit, WorkerError> {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Ok(ServeExit::Closed);
            }
            if shutdown.is_cancelled() {
                return Ok(ServeExit::Cancelled);
            }

            match self.run_once() {
                // Drain the queue before sleeping.
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!(channel = %self.channel(), error = %e, "worker loop stopped");
                    return Err(e);
                }
            }

            shutdown.wait_timeout(self.options.poll_interval);
        }
    }

    fn handle(&self, job: ReceivedJob) -> Result<(), WorkerError> {
        let id = job.envelope.id;
        let span = info_span!("job", channel = %self.channel(), job_id = %id);
        let _entered = span.enter();

        info!("job received");
        let unknown = job.envelope.metadata.unknown_keys();
        if !unknown.is_empty() {
            warn!(keys = ?unknown, "ignoring unknown metadata keys");
        }
        self.set_state(WorkerState::Processing);
        let outcome = self.process(&job);
        // Input archive is no longer needed.
        drop(job.archive);

        self.set_state(WorkerState::Replying);
        let published = match &outcome {
            Ok(built) => {
                let envelope =
                    ReplyEnvelope::success(id, job.envelope.metadata.clone(), built.sha256.clone());
                self.transport.reply(&envelope, Some(built.archive.path()))
            }
            Err(job_error) => {
                warn!(error = %job_error, "job failed");
                self.transport
                    .reply(&ReplyEnvelope::failure(id, job_error.clone()), None)
            }
        };

        if let Err(e) = published {
            error!(error = %e, "failed to publish reply");
            return Err(WorkerError::transport(self.channel(), e));
        }

        info!(ok = outcome.is_ok(), "reply published");
        Ok(())
    }

    /// Run one job to a reply archive. The job workspace is gone when this
    /// returns, whatever the outcome.
    fn process(&self, job: &ReceivedJob) -> Result<BuiltReply, JobError> {
        let envelope = &job.envelope;
        if envelope.channel != self.options.channel {
            return Err(JobError::unknown_channel(&envelope.channel));
        }

        envelope
            .verify_archive(job.archive.path())
            .map_err(|e| JobError::corrupt_payload(e.to_string()))?;

        let workspace = tempfile::Builder::new()
            .prefix("pkgremote-job-")
            .tempdir_in(&self.options.scratch_dir)
            .map_err(|e| JobError::internal(format!("cannot create job workspace: {}", e)))?;

        let result = self.build_in(&workspace, job);

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!(path = %path.display(), error = %e, "failed to remove job workspace");
        } else {
            debug!(path = %path.display(), "job workspace removed");
        }

        result
    }

    fn build_in(&self, workspace: &TempDir, job: &ReceivedJob) -> Result<BuiltReply, JobError> {
        let staging_dir = workspace.path().join("staging");
        let output_dir = workspace.path().join("output");
        for dir in [&staging_dir, &output_dir] {
            fs::create_dir(dir)
                .map_err(|e| JobError::internal(format!("cannot create {}: {}", dir.display(), e)))?;
        }

        let archive = File::open(job.archive.path())
            .map_err(|e| JobError::internal(format!("cannot open job archive: {}", e)))?;
        let files = unpack(BufReader::new(archive), &staging_dir).map_err(unpack_error)?;
        if files.len() != 1 {
            return Err(JobError::invalid_request(format!(
                "expected exactly one file in job archive, got {}",
                files.len()
            )));
        }

        let worker_job = WorkerJob {
            id: job.envelope.id,
            staging_dir: &staging_dir,
            output_dir: &output_dir,
            files: &files,
            metadata: &job.envelope.metadata,
            trusted: &self.trusted,
        };
        let artifact = self.delegate.build(&worker_job).map_err(|e| e.to_job_error())?;

        pack_reply(&artifact, &self.options.scratch_dir)
    }
}

impl Service for Worker {
    fn serve(&self, shutdown: &ShutdownToken) -> Result<ServeExit, WorkerError> {
        *self.wake.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown.clone());
        info!(
            channel = %self.channel(),
            poll_interval = ?self.options.poll_interval,
            "worker started"
        );

        let result = self.serve_loop(shutdown);
        self.set_state(WorkerState::Stopped);
        result
    }

    /// Stop after the current job, if any, has been replied to.
    ///
    /// Wakes a sleeping loop by cancelling the token it was served with.
    fn close(&self) -> Result<(), WorkerError> {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(token) = self.wake.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            token.cancel();
        }
        Ok(())
    }
}

fn unpack_error(err: ArchiveError) -> JobError {
    match err {
        ArchiveError::Corrupt(_) => JobError::corrupt_payload(err.to_string()),
        ArchiveError::UnsafePath(_) | ArchiveError::UnsupportedEntry { .. } => {
            JobError::invalid_request(err.to_string())
        }
        _ => JobError::internal(err.to_string()),
    }
}

/// Pack the delegate's artifact into a reply archive outside the job workspace.
fn pack_reply(artifact: &Path, scratch_dir: &Path) -> Result<BuiltReply, JobError> {
    let metadata = fs::metadata(artifact).map_err(|e| {
        JobError::build_failed(format!("artifact {} is not readable: {}", artifact.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(JobError::build_failed(format!(
            "artifact {} is not a regular file",
            artifact.display()
        )));
    }
    let name = artifact.file_name().ok_or_else(|| {
        JobError::build_failed(format!("artifact {} has no file name", artifact.display()))
    })?;

    let entry = ArchiveEntry::new(artifact, name, file_mode(&metadata));
    let internal = |e: ArchiveError| JobError::internal(format!("cannot pack reply: {}", e));

    let archive = tempfile::Builder::new()
        .prefix("pkgremote-reply-")
        .suffix(".tar.gz")
        .tempfile_in(scratch_dir)
        .map_err(|e| JobError::internal(format!("cannot create reply archive: {}", e)))?;
    let file = archive
        .reopen()
        .map_err(|e| JobError::internal(format!("cannot open reply archive: {}", e)))?;
    pack(std::slice::from_ref(&entry), file).map_err(internal)?;

    let sha256 = digest_file(archive.path())
        .map_err(|e| JobError::internal(format!("cannot hash reply archive: {}", e)))?;

    Ok(BuiltReply { archive, sha256 })
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BuildError, BuildResult};
    use pkgremote_protocol::{CorrelationId, ErrorCode, JobMetadata, MemoryQueue, DEFAULT_CHANNEL};
    use std::time::Instant;
    use tempfile::TempDir;

    struct Fixture {
        queue: Arc<MemoryQueue>,
        scratch: TempDir,
        inputs: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: Arc::new(MemoryQueue::new()),
                scratch: TempDir::new().unwrap(),
                inputs: TempDir::new().unwrap(),
            }
        }

        fn worker(&self, delegate: impl BuildDelegate + 'static) -> Worker {
            Worker::new(
                self.queue.clone(),
                Arc::new(delegate),
                TrustedConfig::new("Developer ID Installer: Example"),
                ServeOptions {
                    channel: DEFAULT_CHANNEL.to_string(),
                    poll_interval: Duration::from_millis(20),
                    scratch_dir: self.scratch.path().to_path_buf(),
                },
            )
        }

        fn submit(&self, files: &[(&str, &[u8], u32)]) -> CorrelationId {
            self.submit_with(files, &JobMetadata::for_package("io.example.app", "1.2.3"))
        }

        fn submit_with(&self, files: &[(&str, &[u8], u32)], metadata: &JobMetadata) -> CorrelationId {
            let entries: Vec<ArchiveEntry> = files
                .iter()
                .map(|(name, content, mode)| {
                    let source = self.inputs.path().join(name);
                    fs::write(&source, content).unwrap();
                    ArchiveEntry::new(source, *name, *mode)
                })
                .collect();
            let archive = self.inputs.path().join("job.tar.gz");
            pack(&entries, File::create(&archive).unwrap()).unwrap();

            self.queue.submit(DEFAULT_CHANNEL, &archive, metadata).unwrap()
        }

        fn reply(&self, id: &CorrelationId) -> pkgremote_protocol::Reply {
            self.queue
                .await_reply(id, Instant::now() + Duration::from_secs(5), self.inputs.path())
                .unwrap()
        }

        fn scratch_entries(&self) -> usize {
            fs::read_dir(self.scratch.path()).unwrap().count()
        }
    }

    fn copy_input(job: &WorkerJob<'_>) -> BuildResult {
        let input = &job.files[0];
        let artifact = job.output_dir.join("package.pkg");
        fs::copy(&input.path, &artifact)?;
        Ok(artifact)
    }

    #[test]
    fn test_empty_queue_does_not_invoke_delegate() {
        let fixture = Fixture::new();
        let worker = fixture.worker(|_: &WorkerJob<'_>| -> BuildResult {
            panic!("delegate must not run without a job")
        });

        assert!(!worker.run_once().unwrap());
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn test_successful_job_replies_with_artifact() {
        let fixture = Fixture::new();
        let worker = fixture.worker(copy_input);
        let id = fixture.submit(&[("hugo", b"binary", 0o755)]);

        assert!(worker.run_once().unwrap());
        let reply = fixture.reply(&id);

        assert!(reply.envelope.ok);
        assert_eq!(reply.envelope.metadata.package_identifier(), Some("io.example.app"));
        let archive = reply.archive.unwrap();
        reply.envelope.verify_archive(archive.path()).unwrap();

        let out = TempDir::new().unwrap();
        let files = unpack(File::open(archive.path()).unwrap(), out.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, out.path().join("package.pkg"));
        assert_eq!(fs::read(&files[0].path).unwrap(), b"binary");

        assert_eq!(fixture.scratch_entries(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_delegate_sees_preserved_mode_and_trusted_identity() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let worker = fixture.worker(move |job: &WorkerJob<'_>| -> BuildResult {
            let mode = fs::metadata(&job.files[0].path)?.permissions().mode() & 0o777;
            *recorder.lock().unwrap() = Some((mode, job.trusted.signing_identity().to_string()));
            copy_input(job)
        });
        fixture.submit(&[("hugo", b"binary", 0o755)]);

        worker.run_once().unwrap();

        let (mode, identity) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(mode, 0o755);
        assert_eq!(identity, "Developer ID Installer: Example");
    }

    #[test]
    fn test_delegate_failure_is_negative_reply_and_workspace_removed() {
        let fixture = Fixture::new();
        let staging = Arc::new(Mutex::new(None));
        let recorder = staging.clone();
        let worker = fixture.worker(move |job: &WorkerJob<'_>| -> BuildResult {
            *recorder.lock().unwrap() = Some(job.staging_dir.to_path_buf());
            Err(BuildError::Failed("productbuild refused".into()))
        });
        let id = fixture.submit(&[("hugo", b"binary", 0o755)]);

        assert!(worker.run_once().unwrap());
        let reply = fixture.reply(&id);

        assert!(!reply.envelope.ok);
        assert!(reply.archive.is_none());
        let error = reply.envelope.error.unwrap();
        assert_eq!(error.code, ErrorCode::BuildFailed);
        assert_eq!(error.message, "productbuild refused");

        let staging = staging.lock().unwrap().clone().unwrap();
        assert!(!staging.exists());
        assert_eq!(fixture.scratch_entries(), 0);
    }

    #[test]
    fn test_unknown_metadata_keys_are_ignored() {
        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let worker = fixture.worker(move |job: &WorkerJob<'_>| -> BuildResult {
            *recorder.lock().unwrap() = Some(job.trusted.signing_identity().to_string());
            copy_input(job)
        });
        let mut metadata = JobMetadata::for_package("io.example.app", "1.2.3");
        metadata.insert("apple_signing_identity", "Developer ID Installer: Someone Else");
        let id = fixture.submit_with(&[("hugo", b"binary", 0o755)], &metadata);

        assert!(worker.run_once().unwrap());
        let reply = fixture.reply(&id);

        assert!(reply.envelope.ok);
        assert_eq!(
            seen.lock().unwrap().as_deref(),
            Some("Developer ID Installer: Example")
        );
        assert_eq!(reply.envelope.metadata, metadata);
    }

    #[test]
    fn test_multi_file_job_is_rejected_without_building() {
        let fixture = Fixture::new();
        let worker = fixture.worker(|_: &WorkerJob<'_>| -> BuildResult {
            panic!("delegate must not run for an invalid job")
        });
        let id = fixture.submit(&[("hugo", b"a", 0o755), ("README", b"b", 0o644)]);

        worker.run_once().unwrap();
        let reply = fixture.reply(&id);

        assert_eq!(reply.envelope.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_garbage_archive_is_corrupt_payload() {
        let fixture = Fixture::new();
        let worker = fixture.worker(copy_input);
        let garbage = fixture.inputs.path().join("garbage.tar.gz");
        fs::write(&garbage, b"definitely not gzip").unwrap();
        let id = fixture
            .queue
            .submit(DEFAULT_CHANNEL, &garbage, &JobMetadata::new())
            .unwrap();

        worker.run_once().unwrap();
        let reply = fixture.reply(&id);

        assert_eq!(reply.envelope.error.unwrap().code, ErrorCode::CorruptPayload);
    }

    #[test]
    fn test_job_failure_does_not_stop_the_loop() {
        let fixture = Fixture::new();
        let worker = fixture.worker(|job: &WorkerJob<'_>| -> BuildResult {
            if job.files[0].path.ends_with("bad") {
                return Err(BuildError::Failed("bad input".into()));
            }
            copy_input(job)
        });
        let first = fixture.submit(&[("bad", b"x", 0o644)]);
        let second = fixture.submit(&[("hugo", b"y", 0o755)]);

        let token = ShutdownToken::new();
        std::thread::scope(|scope| {
            scope.spawn(|| worker.serve(&token));
            assert!(!fixture.reply(&first).envelope.ok);
            assert!(fixture.reply(&second).envelope.ok);
            token.cancel();
        });

        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_close_wakes_sleeping_loop() {
        let fixture = Fixture::new();
        let mut worker = fixture.worker(copy_input);
        worker.options.poll_interval = Duration::from_secs(3600);

        let token = ShutdownToken::new();
        let exit = std::thread::scope(|scope| {
            let handle = scope.spawn(|| worker.serve(&token));
            std::thread::sleep(Duration::from_millis(50));
            worker.close().unwrap();
            handle.join().unwrap()
        });

        assert_eq!(exit.unwrap(), ServeExit::Closed);
    }

    #[test]
    fn test_cancelled_token_exits_cleanly() {
        let fixture = Fixture::new();
        let worker = fixture.worker(copy_input);
        let token = ShutdownToken::new();
        token.cancel();

        assert_eq!(worker.serve(&token).unwrap(), ServeExit::Cancelled);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}
