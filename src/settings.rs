//! Per-call plugin settings.
//!
//! The host hands the plugin its `archive_settings.custom_settings` table as a
//! JSON object. Everything needed for one call is validated here, before any
//! file or queue is touched.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use pkgremote_protocol::JobMetadata;
use serde_json::{Map, Value};

/// Setting names.
pub mod keys {
    pub const PACKAGE_IDENTIFIER: &str = "package_identifier";
    pub const PACKAGE_VERSION: &str = "package_version";
    pub const QUEUE: &str = "queue";
    pub const SPOOL_DIR: &str = "spool_dir";
    pub const TIMEOUT_SECONDS: &str = "timeout_seconds";
    pub const REPLY_WAIT_SECONDS: &str = "reply_wait_seconds";
}

/// Maximum accepted overall timeout (one day).
const MAX_OVERALL_SECONDS: u64 = 86_400;

/// Settings validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("archive_settings.custom_settings.{0} is required")]
    Missing(&'static str),

    #[error("archive_settings.custom_settings.{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(transparent)]
    Timeouts(#[from] TimeoutValidationError),
}

/// Timeout validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("overall timeout must be in (0, 86400s], got {value:?}")]
    OverallOutOfBounds { value: Duration },

    #[error("reply wait must be in (0, {max:?}], got {value:?}")]
    ReplyWaitOutOfBounds { value: Duration, max: Duration },
}

/// Deadlines for one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Wall-clock limit for the whole call (default: 10 min).
    pub overall: Duration,
    /// Longest the transport waits for a reply (default: 5 min).
    pub reply_wait: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(600),
            reply_wait: Duration::from_secs(300),
        }
    }
}

impl CallTimeouts {
    pub fn new(overall: Duration, reply_wait: Duration) -> Self {
        Self { overall, reply_wait }
    }

    /// Reject a zero or unbounded deadline, or a reply wait longer than the
    /// overall deadline.
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        if self.overall.is_zero() || self.overall > Duration::from_secs(MAX_OVERALL_SECONDS) {
            return Err(TimeoutValidationError::OverallOutOfBounds {
                value: self.overall,
            });
        }

        if self.reply_wait.is_zero() || self.reply_wait > self.overall {
            return Err(TimeoutValidationError::ReplyWaitOutOfBounds {
                value: self.reply_wait,
                max: self.overall,
            });
        }

        Ok(())
    }

    /// When to stop waiting for a reply to a call that began at `started`.
    ///
    /// The reply wait starts now but never runs past the overall deadline.
    pub fn reply_deadline(&self, started: Instant) -> Instant {
        let overall_deadline = started + self.overall;
        let wait_deadline = Instant::now() + self.reply_wait;
        overall_deadline.min(wait_deadline)
    }
}

/// Validated settings for one plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSettings {
    pub package_identifier: String,
    pub package_version: String,
    /// Queue name inside the spool.
    pub queue: String,
    /// Spool directory shared with the worker.
    pub spool_dir: PathBuf,
    pub timeouts: CallTimeouts,
}

impl PluginSettings {
    /// Read and validate the host's custom settings table.
    pub fn from_map(settings: &Map<String, Value>) -> Result<Self, SettingsError> {
        let package_identifier = required_str(settings, keys::PACKAGE_IDENTIFIER)?;
        let package_version = required_str(settings, keys::PACKAGE_VERSION)?;
        let queue = required_str(settings, keys::QUEUE)?;
        let spool_dir = PathBuf::from(required_str(settings, keys::SPOOL_DIR)?);

        let defaults = CallTimeouts::default();
        let timeouts = CallTimeouts {
            overall: optional_seconds(settings, keys::TIMEOUT_SECONDS)?.unwrap_or(defaults.overall),
            reply_wait: optional_seconds(settings, keys::REPLY_WAIT_SECONDS)?
                .unwrap_or(defaults.reply_wait),
        };
        timeouts.validate()?;

        Ok(Self {
            package_identifier,
            package_version,
            queue,
            spool_dir,
            timeouts,
        })
    }

    /// Metadata sent with the job.
    pub fn metadata(&self) -> JobMetadata {
        JobMetadata::for_package(&self.package_identifier, &self.package_version)
    }
}

pub(crate) fn required_str(settings: &Map<String, Value>, key: &'static str) -> Result<String, SettingsError> {
    match settings.get(key) {
        None | Some(Value::Null) => Err(SettingsError::Missing(key)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(SettingsError::Missing(key)),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(SettingsError::Invalid {
            key,
            reason: format!("expected a string, got {}", other),
        }),
    }
}

fn optional_seconds(
    settings: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<Duration>, SettingsError> {
    let invalid = |reason: String| SettingsError::Invalid { key, reason };
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| invalid(format!("expected whole seconds, got {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| invalid(e.to_string())),
        Some(other) => Err(invalid(format!("expected seconds, got {}", other))),
    }
}
