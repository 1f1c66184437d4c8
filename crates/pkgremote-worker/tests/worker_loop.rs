//! Worker loop behaviour against the in-memory queue.

use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pkgremote_protocol::{
    pack, unpack, ArchiveEntry, CorrelationId, ErrorCode, JobMetadata, MemoryQueue,
    QueueTransport, SpoolQueue, TransportError, DEFAULT_CHANNEL,
};
use pkgremote_worker::{
    run_until_shutdown, BuildError, BuildResult, ServeOptions, Service, ShutdownToken,
    TrustedConfig, Worker, WorkerError, WorkerJob,
};
use tempfile::TempDir;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn worker_over(
    transport: Arc<dyn QueueTransport>,
    delegate: impl pkgremote_worker::BuildDelegate + 'static,
    scratch: &Path,
) -> Worker {
    Worker::new(
        transport,
        Arc::new(delegate),
        TrustedConfig::new("Developer ID Installer: Example"),
        ServeOptions {
            channel: DEFAULT_CHANNEL.to_string(),
            poll_interval: POLL_INTERVAL,
            scratch_dir: scratch.to_path_buf(),
        },
    )
}

fn submit_hugo(queue: &MemoryQueue, dir: &Path) -> CorrelationId {
    let source = dir.join("hugo");
    fs::write(&source, b"#!/bin/sh\necho hugo\n").unwrap();
    let archive = dir.join("job.tar.gz");
    pack(&[ArchiveEntry::new(&source, "hugo", 0o755)], File::create(&archive).unwrap()).unwrap();
    queue
        .submit(
            DEFAULT_CHANNEL,
            &archive,
            &JobMetadata::for_package("io.example.app", "1.2.3"),
        )
        .unwrap()
}

fn artifact_from_input(job: &WorkerJob<'_>) -> BuildResult {
    let artifact = job.output_dir.join("hugo.pkg");
    fs::copy(&job.files[0].path, &artifact)?;
    Ok(artifact)
}

#[test]
fn test_job_submitted_to_idle_worker_is_picked_up_within_one_poll_interval() {
    let scratch = TempDir::new().unwrap();
    let inputs = TempDir::new().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let worker = worker_over(
        queue.clone(),
        move |job: &WorkerJob<'_>| -> BuildResult {
            counter.fetch_add(1, Ordering::SeqCst);
            artifact_from_input(job)
        },
        scratch.path(),
    );
    let shutdown = ShutdownToken::new();

    thread::scope(|scope| {
        let running = scope.spawn(|| run_until_shutdown(&worker, &shutdown));

        // Several empty polls go by without the delegate running.
        thread::sleep(POLL_INTERVAL * 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let submitted = Instant::now();
        let id = submit_hugo(&queue, inputs.path());
        let reply = queue
            .await_reply(&id, Instant::now() + Duration::from_secs(10), inputs.path())
            .unwrap();
        let latency = submitted.elapsed();

        assert!(reply.envelope.ok);
        assert!(latency < POLL_INTERVAL + Duration::from_secs(2), "took {:?}", latency);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        running.join().unwrap().unwrap();
    });
}

#[test]
fn test_reply_archive_reproduces_artifact_mode() {
    let scratch = TempDir::new().unwrap();
    let inputs = TempDir::new().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let worker = worker_over(queue.clone(), artifact_from_input, scratch.path());
    let id = submit_hugo(&queue, inputs.path());

    assert!(worker.run_once().unwrap());
    let reply = queue
        .await_reply(&id, Instant::now() + Duration::from_secs(1), inputs.path())
        .unwrap();

    let out = TempDir::new().unwrap();
    let archive = reply.archive.unwrap();
    let files = unpack(File::open(archive.path()).unwrap(), out.path()).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].mode & 0o777, 0o755);
    assert_eq!(fs::read(&files[0].path).unwrap(), b"#!/bin/sh\necho hugo\n");
}

#[test]
fn test_staging_directories_are_isolated_and_removed() {
    let scratch = TempDir::new().unwrap();
    let inputs = TempDir::new().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let worker = worker_over(
        queue.clone(),
        move |job: &WorkerJob<'_>| -> BuildResult {
            let entries = fs::read_dir(job.staging_dir)?.count();
            recorder
                .lock()
                .unwrap()
                .push((job.staging_dir.to_path_buf(), entries));
            Err(BuildError::Failed("stub refuses".into()))
        },
        scratch.path(),
    );

    let ids = [submit_hugo(&queue, inputs.path()), submit_hugo(&queue, inputs.path())];
    while worker.run_once().unwrap() {}

    for id in &ids {
        let reply = queue
            .await_reply(id, Instant::now() + Duration::from_secs(1), inputs.path())
            .unwrap();
        let error = reply.envelope.error.unwrap();
        assert_eq!(error.code, ErrorCode::BuildFailed);
        assert_eq!(reply.envelope.id, *id);
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0].0, seen[1].0);
    for (staging, entries) in seen.iter() {
        assert_eq!(*entries, 1);
        assert!(!staging.exists());
    }
}

/// Transport whose reply side is broken.
struct BrokenReplies {
    inner: MemoryQueue,
}

impl QueueTransport for BrokenReplies {
    fn submit(
        &self,
        channel: &str,
        archive: &Path,
        metadata: &JobMetadata,
    ) -> Result<CorrelationId, TransportError> {
        self.inner.submit(channel, archive, metadata)
    }

    fn await_reply(
        &self,
        id: &CorrelationId,
        deadline: Instant,
        scratch: &Path,
    ) -> Result<pkgremote_protocol::Reply, TransportError> {
        self.inner.await_reply(id, deadline, scratch)
    }

    fn poll(
        &self,
        channel: &str,
        scratch: &Path,
    ) -> Result<Option<pkgremote_protocol::ReceivedJob>, TransportError> {
        self.inner.poll(channel, scratch)
    }

    fn reply(
        &self,
        _envelope: &pkgremote_protocol::ReplyEnvelope,
        _archive: Option<&Path>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unavailable("broker connection lost".into()))
    }
}

#[test]
fn test_spool_job_without_archive_does_not_stop_the_worker() {
    let spool = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let inputs = TempDir::new().unwrap();
    let queue = Arc::new(SpoolQueue::open(spool.path(), "releases").unwrap());
    let worker = worker_over(queue.clone(), artifact_from_input, scratch.path());

    let source = inputs.path().join("hugo");
    fs::write(&source, b"#!/bin/sh\necho hugo\n").unwrap();
    let archive = inputs.path().join("job.tar.gz");
    pack(&[ArchiveEntry::new(&source, "hugo", 0o755)], File::create(&archive).unwrap()).unwrap();
    let metadata = JobMetadata::for_package("io.example.app", "1.2.3");

    let broken = queue.submit(DEFAULT_CHANNEL, &archive, &metadata).unwrap();
    let requests = queue.root().join("requests").join(DEFAULT_CHANNEL);
    fs::remove_file(requests.join(format!("{}.tar.gz", broken))).unwrap();

    assert!(!worker.run_once().unwrap());
    assert!(queue.root().join("rejected").join(format!("{}.json", broken)).is_file());

    let id = queue.submit(DEFAULT_CHANNEL, &archive, &metadata).unwrap();
    assert!(worker.run_once().unwrap());

    let reply = queue
        .await_reply(&id, Instant::now() + Duration::from_secs(5), inputs.path())
        .unwrap();
    assert!(reply.envelope.ok);
}

#[test]
fn test_transport_failure_stops_the_loop() {
    let scratch = TempDir::new().unwrap();
    let inputs = TempDir::new().unwrap();
    let transport = Arc::new(BrokenReplies {
        inner: MemoryQueue::new(),
    });
    submit_hugo(&transport.inner, inputs.path());
    let worker = worker_over(transport.clone(), artifact_from_input, scratch.path());

    let err = run_until_shutdown(&worker, &ShutdownToken::new()).unwrap_err();

    match err {
        WorkerError::Transport { channel, source } => {
            assert_eq!(channel, DEFAULT_CHANNEL);
            assert!(source.to_string().contains("broker connection lost"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn test_close_without_job_in_flight() {
    let scratch = TempDir::new().unwrap();
    let worker = worker_over(Arc::new(MemoryQueue::new()), artifact_from_input, scratch.path());
    let shutdown = ShutdownToken::new();

    let result = thread::scope(|scope| {
        let running = scope.spawn(|| run_until_shutdown(&worker, &shutdown));
        thread::sleep(POLL_INTERVAL);
        worker.close().unwrap();
        running.join().unwrap()
    });

    assert!(result.is_ok());
}
