//! Remote package build protocol
//!
//! Shared vocabulary between a build host that needs a signed macOS package
//! and the worker that can produce one: the archive codec used for payloads,
//! job and reply envelopes, metadata, structured errors, and the queue
//! transport both sides talk through.

pub mod archive;
pub mod envelope;
pub mod error;
pub mod metadata;
pub mod transport;

pub use archive::{pack, unpack, ArchiveBundle, ArchiveEntry, ArchiveError, UnpackedFile};
pub use envelope::{CorrelationId, JobEnvelope, ReplyEnvelope};
pub use error::{ErrorCode, JobError};
pub use metadata::{JobMetadata, MetadataError};
pub use transport::{MemoryQueue, QueueTransport, ReceivedJob, Reply, SpoolQueue, TransportError};

/// Channel used by the macOS package plugin and its worker.
pub const DEFAULT_CHANNEL: &str = "macospkgremote";
