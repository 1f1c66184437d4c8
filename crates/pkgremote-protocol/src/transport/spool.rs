//! Filesystem spool transport.
//!
//! Jobs and replies are files under a shared spool directory, typically a
//! network mount or a synced folder reachable by both build host and worker:
//!
//! ```text
//! <spool>/<queue>/requests/<channel>/<id>.tar.gz
//! <spool>/<queue>/requests/<channel>/<id>.json     (commit marker)
//! <spool>/<queue>/claimed/<id>.{tar.gz,json}       (taken by a worker)
//! <spool>/<queue>/replies/<id>.{tar.gz,json}
//! <spool>/<queue>/rejected/<id>.{tar.gz,json}      (unreadable envelopes)
//! <spool>/<queue>/.tmp/                            (staging for atomic writes)
//! ```
//!
//! Every file is written to `.tmp` and renamed into place, and the JSON
//! envelope is always written after its archive, so an envelope's existence
//! proves the pair is complete. A worker claims a job by renaming its
//! envelope into `claimed/`; the rename succeeds for exactly one worker.
//! Claimed files stay until the reply is published.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use super::{check_name, copy_to_scratch, QueueTransport, ReceivedJob, Reply, TransportError};
use crate::archive::digest_file;
use crate::envelope::{CorrelationId, JobEnvelope, ReplyEnvelope};
use crate::metadata::JobMetadata;

/// How often a waiting caller checks for its reply.
pub const DEFAULT_REPLY_POLL_INTERVAL: Duration = Duration::from_millis(500);

const ARCHIVE_EXT: &str = "tar.gz";
const ENVELOPE_EXT: &str = "json";

/// Queue backed by a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
    reply_poll_interval: Duration,
}

impl SpoolQueue {
    /// Open (creating if needed) the queue `queue` inside `spool_dir`.
    pub fn open(spool_dir: impl AsRef<Path>, queue: &str) -> Result<Self, TransportError> {
        check_name(queue)?;
        let root = spool_dir.as_ref().join(queue);

        for dir in ["requests", "claimed", "replies", "rejected", ".tmp"] {
            fs::create_dir_all(root.join(dir))?;
        }

        // Verify the spool is writable
        let check = root.join(".tmp").join(".spool_test");
        fs::write(&check, b"")?;
        fs::remove_file(&check)?;

        Ok(Self {
            root,
            reply_poll_interval: DEFAULT_REPLY_POLL_INTERVAL,
        })
    }

    /// Set how often [`QueueTransport::await_reply`] checks for a reply.
    pub fn with_reply_poll_interval(mut self, interval: Duration) -> Self {
        self.reply_poll_interval = interval;
        self
    }

    /// Directory holding this queue's files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of unclaimed jobs on `channel`.
    pub fn pending_jobs(&self, channel: &str) -> usize {
        self.envelopes_in(&self.root.join("requests").join(channel))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    fn requests_dir(&self, channel: &str) -> PathBuf {
        self.root.join("requests").join(channel)
    }

    fn claimed_dir(&self) -> PathBuf {
        self.root.join("claimed")
    }

    fn replies_dir(&self) -> PathBuf {
        self.root.join("replies")
    }

    fn rejected_dir(&self) -> PathBuf {
        self.root.join("rejected")
    }

    /// Write `dest` via a file in `.tmp` and an atomic rename.
    fn commit(&self, dest: &Path, write: impl FnOnce(&Path) -> io::Result<()>) -> io::Result<()> {
        let name = dest
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "commit target has no file name"))?;
        let temp_path = self.root.join(".tmp").join(name);
        if let Err(e) = write(&temp_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        fs::rename(&temp_path, dest)
    }

    fn commit_json<T: Serialize>(&self, dest: &Path, value: &T) -> Result<(), TransportError> {
        let json = serde_json::to_vec_pretty(value)?;
        self.commit(dest, |tmp| fs::write(tmp, &json))?;
        Ok(())
    }

    /// Envelope files in `dir`, sorted by name.
    fn envelopes_in(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut envelopes = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == ENVELOPE_EXT) {
                envelopes.push(path);
            }
        }
        envelopes.sort();
        Ok(envelopes)
    }

    /// Move a claimed job's files to `rejected/`. Missing files are skipped.
    fn reject(&self, id: &str) {
        for ext in [ENVELOPE_EXT, ARCHIVE_EXT] {
            let name = format!("{}.{}", id, ext);
            let from = self.claimed_dir().join(&name);
            match fs::rename(&from, self.rejected_dir().join(&name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(job_id = id, path = %from.display(), error = %e, "failed to move rejected job file");
                }
            }
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl QueueTransport for SpoolQueue {
    fn submit(
        &self,
        channel: &str,
        archive: &Path,
        metadata: &JobMetadata,
    ) -> Result<CorrelationId, TransportError> {
        check_name(channel)?;
        let envelope = JobEnvelope::new(channel, metadata.clone(), digest_file(archive)?);
        let id = envelope.id;
        let dir = self.requests_dir(channel);
        fs::create_dir_all(&dir)?;

        self.commit(&dir.join(format!("{}.{}", id, ARCHIVE_EXT)), |tmp| {
            fs::copy(archive, tmp).map(|_| ())
        })?;
        self.commit_json(&dir.join(format!("{}.{}", id, ENVELOPE_EXT)), &envelope)?;

        debug!(%id, channel, spool = %self.root.display(), "job submitted");
        Ok(id)
    }

    fn await_reply(
        &self,
        id: &CorrelationId,
        deadline: Instant,
        scratch: &Path,
    ) -> Result<Reply, TransportError> {
        let started = Instant::now();
        let marker = self.replies_dir().join(format!("{}.{}", id, ENVELOPE_EXT));
        let archive_path = self.replies_dir().join(format!("{}.{}", id, ARCHIVE_EXT));

        loop {
            match fs::read(&marker) {
                Ok(bytes) => {
                    let envelope: ReplyEnvelope = serde_json::from_slice(&bytes)?;
                    let archive = if envelope.ok {
                        let file = copy_to_scratch(scratch, &archive_path)?;
                        remove_if_present(&archive_path)?;
                        Some(file)
                    } else {
                        None
                    };
                    remove_if_present(&marker)?;
                    return Ok(Reply { envelope, archive });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout {
                    id: *id,
                    waited: started.elapsed(),
                });
            }
            thread::sleep(self.reply_poll_interval.min(deadline - now));
        }
    }

    fn poll(&self, channel: &str, scratch: &Path) -> Result<Option<ReceivedJob>, TransportError> {
        check_name(channel)?;
        let dir = self.requests_dir(channel);

        for marker in self.envelopes_in(&dir)? {
            let Some(id) = marker.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let claimed_envelope = self.claimed_dir().join(format!("{}.{}", id, ENVELOPE_EXT));
            let claimed_archive = self.claimed_dir().join(format!("{}.{}", id, ARCHIVE_EXT));

            match fs::rename(&marker, &claimed_envelope) {
                Ok(()) => {}
                // Another worker got there first
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            match fs::rename(dir.join(format!("{}.{}", id, ARCHIVE_EXT)), &claimed_archive) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(job_id = %id, channel, "rejecting job without archive");
                    self.reject(&id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let envelope: JobEnvelope = match fs::read(&claimed_envelope)
                .map_err(TransportError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(TransportError::from))
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(job_id = %id, channel, error = %e, "rejecting unreadable job envelope");
                    self.reject(&id);
                    continue;
                }
            };

            if envelope.id.to_string() != id {
                warn!(job_id = %id, envelope_id = %envelope.id, channel, "rejecting job with mismatched id");
                self.reject(&id);
                continue;
            }

            debug!(id = %envelope.id, channel, "job claimed");
            let archive = copy_to_scratch(scratch, &claimed_archive)?;
            return Ok(Some(ReceivedJob { envelope, archive }));
        }

        Ok(None)
    }

    fn reply(&self, envelope: &ReplyEnvelope, archive: Option<&Path>) -> Result<(), TransportError> {
        let id = envelope.id;
        match archive {
            Some(path) => {
                self.commit(&self.replies_dir().join(format!("{}.{}", id, ARCHIVE_EXT)), |tmp| {
                    fs::copy(path, tmp).map(|_| ())
                })?;
            }
            None if envelope.ok => {
                return Err(TransportError::Unavailable(format!(
                    "successful reply {} has no archive",
                    id
                )));
            }
            None => {}
        }
        self.commit_json(
            &self.replies_dir().join(format!("{}.{}", id, ENVELOPE_EXT)),
            envelope,
        )?;

        remove_if_present(&self.claimed_dir().join(format!("{}.{}", id, ENVELOPE_EXT)))?;
        remove_if_present(&self.claimed_dir().join(format!("{}.{}", id, ARCHIVE_EXT)))?;

        debug!(%id, ok = envelope.ok, "reply published");
        Ok(())
    }
}
