//! In-process queue transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;

use super::{check_name, write_scratch, QueueTransport, ReceivedJob, Reply, TransportError};
use crate::archive::digest_file;
use crate::envelope::{CorrelationId, JobEnvelope, ReplyEnvelope};
use crate::metadata::JobMetadata;

#[derive(Debug)]
struct StoredJob {
    envelope: JobEnvelope,
    archive: Vec<u8>,
}

#[derive(Debug)]
struct StoredReply {
    envelope: ReplyEnvelope,
    archive: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, VecDeque<StoredJob>>,
    in_flight: HashSet<CorrelationId>,
    replies: HashMap<CorrelationId, StoredReply>,
}

/// Thread-safe queue living in the current process.
///
/// Waiters are woken through a condition variable, so a reply published by
/// a worker thread reaches a blocked caller immediately.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting on `channel`.
    pub fn pending_jobs(&self, channel: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.pending.get(channel).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Number of jobs taken by a worker and not yet replied to.
    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Number of replies published but not yet collected.
    pub fn uncollected_replies(&self) -> usize {
        self.state.lock().map(|s| s.replies.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Unavailable("memory queue lock poisoned".to_string()))
    }
}

impl QueueTransport for MemoryQueue {
    fn submit(
        &self,
        channel: &str,
        archive: &Path,
        metadata: &JobMetadata,
    ) -> Result<CorrelationId, TransportError> {
        check_name(channel)?;
        let bytes = fs::read(archive)?;
        let envelope = JobEnvelope::new(channel, metadata.clone(), digest_file(archive)?);
        let id = envelope.id;

        let mut state = self.lock()?;
        state
            .pending
            .entry(channel.to_string())
            .or_default()
            .push_back(StoredJob {
                envelope,
                archive: bytes,
            });
        drop(state);
        self.changed.notify_all();

        debug!(%id, channel, "job submitted");
        Ok(id)
    }

    fn await_reply(
        &self,
        id: &CorrelationId,
        deadline: Instant,
        scratch: &Path,
    ) -> Result<Reply, TransportError> {
        let started = Instant::now();
        let mut state = self.lock()?;

        let stored = loop {
            if let Some(stored) = state.replies.remove(id) {
                break stored;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout {
                    id: *id,
                    waited: started.elapsed(),
                });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(|_| TransportError::Unavailable("memory queue lock poisoned".to_string()))?;
            state = guard;
        };
        drop(state);

        let archive = match stored.archive {
            Some(bytes) => Some(write_scratch(scratch, &bytes)?),
            None => None,
        };
        Ok(Reply {
            envelope: stored.envelope,
            archive,
        })
    }

    fn poll(&self, channel: &str, scratch: &Path) -> Result<Option<ReceivedJob>, TransportError> {
        let mut state = self.lock()?;
        let Some(job) = state.pending.get_mut(channel).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        state.in_flight.insert(job.envelope.id);
        drop(state);

        debug!(id = %job.envelope.id, channel, "job claimed");
        let archive = write_scratch(scratch, &job.archive)?;
        Ok(Some(ReceivedJob {
            envelope: job.envelope,
            archive,
        }))
    }

    fn reply(&self, envelope: &ReplyEnvelope, archive: Option<&Path>) -> Result<(), TransportError> {
        let bytes = match archive {
            Some(path) => Some(fs::read(path)?),
            None if envelope.ok => {
                return Err(TransportError::Unavailable(format!(
                    "successful reply {} has no archive",
                    envelope.id
                )));
            }
            None => None,
        };

        let mut state = self.lock()?;
        state.in_flight.remove(&envelope.id);
        state.replies.insert(
            envelope.id,
            StoredReply {
                envelope: envelope.clone(),
                archive: bytes,
            },
        );
        drop(state);
        self.changed.notify_all();

        debug!(id = %envelope.id, ok = envelope.ok, "reply published");
        Ok(())
    }
}
