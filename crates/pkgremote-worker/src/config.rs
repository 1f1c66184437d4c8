//! Worker configuration.
//!
//! Everything here is read once from the worker's own environment at
//! startup. Nothing a caller sends can change it; in particular the signing
//! identity never comes from job metadata.

use std::path::PathBuf;
use std::time::Duration;

use pkgremote_protocol::DEFAULT_CHANNEL;

/// Signing identity used by `codesign` and `productbuild`.
pub const SIGNING_IDENTITY_ENV: &str = "BUILDPKG_APPLE_DEVELOPER_SIGNING_IDENTITY";
/// Queue name inside the spool.
pub const QUEUE_ENV: &str = "PKGREMOTE_SERVER_QUEUE";
/// Spool directory shared with callers.
pub const SPOOL_ENV: &str = "PKGREMOTE_SERVER_SPOOL";
/// Channel to serve (default: `macospkgremote`).
pub const CHANNEL_ENV: &str = "PKGREMOTE_SERVER_CHANNEL";
/// Seconds between polls (default: 45).
pub const POLL_INTERVAL_ENV: &str = "PKGREMOTE_POLL_INTERVAL_SECONDS";

/// Default time between queue polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(45);

/// Longest accepted poll interval (one day).
pub const MAX_POLL_INTERVAL_SECONDS: u64 = 86_400;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} not set in environment. {hint}")]
    Missing { var: &'static str, hint: &'static str },

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker-local trusted configuration, shared read-only by every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedConfig {
    signing_identity: String,
}

impl TrustedConfig {
    pub fn new(signing_identity: impl Into<String>) -> Self {
        Self {
            signing_identity: signing_identity.into(),
        }
    }

    /// Developer ID identity passed to `codesign --sign` and `productbuild --sign`.
    pub fn signing_identity(&self) -> &str {
        &self.signing_identity
    }
}

/// Worker configuration settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Trusted signing configuration.
    pub trusted: TrustedConfig,
    /// Queue name inside the spool.
    pub queue: String,
    /// Spool directory.
    pub spool_dir: PathBuf,
    /// Channel served by this worker.
    pub channel: String,
    /// Time between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Where per-job staging directories and archives are created.
    pub scratch_dir: PathBuf,
}

impl WorkerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup`, treating empty values as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let signing_identity = get(SIGNING_IDENTITY_ENV).ok_or(ConfigError::Missing {
            var: SIGNING_IDENTITY_ENV,
            hint: "Must be set to a valid Developer ID Application + Developer ID Installer signing identity.",
        })?;
        let queue = get(QUEUE_ENV).ok_or(ConfigError::Missing {
            var: QUEUE_ENV,
            hint: "Must name the queue shared with callers.",
        })?;
        let spool_dir = get(SPOOL_ENV).map(PathBuf::from).ok_or(ConfigError::Missing {
            var: SPOOL_ENV,
            hint: "Must point at the spool directory shared with callers.",
        })?;
        let channel = get(CHANNEL_ENV).unwrap_or_else(|| DEFAULT_CHANNEL.to_string());

        let poll_interval = match get(POLL_INTERVAL_ENV) {
            None => DEFAULT_POLL_INTERVAL,
            Some(value) => match value.trim().parse::<u64>() {
                Ok(0) => {
                    return Err(ConfigError::Invalid {
                        var: POLL_INTERVAL_ENV,
                        value,
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Ok(secs) if secs > MAX_POLL_INTERVAL_SECONDS => {
                    return Err(ConfigError::Invalid {
                        var: POLL_INTERVAL_ENV,
                        value,
                        reason: format!("must be at most {} seconds", MAX_POLL_INTERVAL_SECONDS),
                    });
                }
                Ok(secs) => Duration::from_secs(secs),
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        var: POLL_INTERVAL_ENV,
                        value,
                        reason: e.to_string(),
                    });
                }
            },
        };

        Ok(Self {
            trusted: TrustedConfig::new(signing_identity),
            queue,
            spool_dir,
            channel,
            poll_interval,
            scratch_dir: std::env::temp_dir(),
        })
    }
}
