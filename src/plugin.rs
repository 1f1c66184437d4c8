//! Host plugin server.
//!
//! The release tool starts the plugin once per archive, writes a single JSON
//! request line to stdin and reads a single JSON receipt line from stdout:
//!
//! ```text
//! -> {"config":{"try":false},"request":{"out_filename":"...","files":[...],"settings":{...}}}
//! <- {"error":null}
//! ```
//!
//! Every failure, including an unparsable request, is reported in the
//! receipt as `{plugin, message}`; the process itself only fails on I/O
//! errors talking to the host.
//!
//! The same server speaks for two plugins: `macospkgremote` ships the
//! build to a worker over the queue, `macospkg` builds in this process.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use pkgremote_protocol::{
    ArchiveBundle, ArchiveEntry, QueueTransport, SpoolQueue, TransportError, DEFAULT_CHANNEL,
};
use pkgremote_worker::{BuildDelegate, PkgbuildDelegate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::caller::{CallError, RemoteCaller};
use crate::local::{LocalBuildError, LocalBuilder, LocalSettings};
use crate::settings::{PluginSettings, SettingsError};

/// Name reported in errors from the queue-backed plugin.
pub const PLUGIN_NAME: &str = "macospkgremote";

/// Name reported in errors from the local plugin.
pub const LOCAL_PLUGIN_NAME: &str = "macospkg";

/// Mode used when the host does not send one.
pub const DEFAULT_FILE_MODE: u32 = 0o755;

/// Host-wide plugin configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Dry run: validate the request but do not build anything.
    #[serde(default, rename = "try")]
    pub try_run: bool,
}

/// One file the host wants archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub source_path_abs: PathBuf,
    pub target_path: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
}

fn default_mode() -> u32 {
    DEFAULT_FILE_MODE
}

/// Archive request from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub out_filename: PathBuf,
    #[serde(default)]
    pub files: Vec<ArchiveFile>,
    /// The host's `archive_settings.custom_settings` table.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Full stdin payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInput {
    #[serde(default)]
    pub config: PluginConfig,
    pub request: ArchiveRequest,
}

/// Failure reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{plugin}: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: &str, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }
}

/// Receipt written back to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub error: Option<PluginError>,
}

/// Why building an archive failed.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Connect(#[from] TransportError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Local(#[from] LocalBuildError),
}

/// Opens the queue named by a call's settings.
pub type Connector =
    Box<dyn Fn(&PluginSettings) -> Result<Arc<dyn QueueTransport>, TransportError> + Send + Sync>;

/// Where a request gets built.
enum Backend {
    /// On a worker reached through the queue.
    Remote(Connector),
    /// In this process.
    Local(Arc<dyn BuildDelegate>),
}

/// Serves one host request per process.
pub struct PluginServer {
    name: &'static str,
    backend: Backend,
    scratch_dir: PathBuf,
}

impl PluginServer {
    /// Server that reaches the worker through the filesystem spool.
    pub fn spool() -> Self {
        Self::with_connector(Box::new(
            |settings: &PluginSettings| -> Result<Arc<dyn QueueTransport>, TransportError> {
                let queue = SpoolQueue::open(&settings.spool_dir, &settings.queue)?;
                Ok(Arc::new(queue))
            },
        ))
    }

    pub fn with_connector(connect: Connector) -> Self {
        Self {
            name: PLUGIN_NAME,
            backend: Backend::Remote(connect),
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Server that runs `pkgbuild` on this machine.
    pub fn local() -> Self {
        Self::with_delegate(Arc::new(PkgbuildDelegate::new()))
    }

    /// Server that builds in-process with `delegate`.
    pub fn with_delegate(delegate: Arc<dyn BuildDelegate>) -> Self {
        Self {
            name: LOCAL_PLUGIN_NAME,
            backend: Backend::Local(delegate),
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Name this server reports in receipt errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Run against the process's stdin and stdout.
    pub fn run(&self) -> io::Result<()> {
        self.run_with_io(&mut io::stdin().lock(), &mut io::stdout().lock())
    }

    /// Run with custom I/O (for testing).
    pub fn run_with_io<R: BufRead, W: Write>(&self, reader: &mut R, writer: &mut W) -> io::Result<()> {
        let mut line = String::new();
        reader.read_line(&mut line)?;

        let receipt = match serde_json::from_str::<PluginInput>(line.trim()) {
            Ok(input) => self.handle(&input),
            Err(e) => Receipt {
                error: Some(PluginError::new(self.name, format!("invalid request: {}", e))),
            },
        };

        serde_json::to_writer(&mut *writer, &receipt)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Handle one parsed request.
    pub fn handle(&self, input: &PluginInput) -> Receipt {
        let request = &input.request;
        info!("Creating archive {}", request.out_filename.display());

        let error = if request.files.len() != 1 {
            Some(PluginError::new(
                self.name,
                CallError::FileCount(request.files.len()).to_string(),
            ))
        } else if input.config.try_run {
            info!("try mode, skipping build");
            None
        } else {
            self.create_archive(request)
                .err()
                .map(|e| PluginError::new(self.name, e.to_string()))
        };

        if let Some(e) = &error {
            warn!(error = %e.message, "archive failed");
        }
        Receipt { error }
    }

    fn create_archive(&self, request: &ArchiveRequest) -> Result<(), CreateError> {
        match &self.backend {
            Backend::Remote(connect) => self.build_remote(connect, request),
            Backend::Local(delegate) => {
                let settings = LocalSettings::from_map(&request.settings)?;
                LocalBuilder::new(delegate.clone())
                    .with_scratch_dir(&self.scratch_dir)
                    .build(&request.files[0], &settings, &request.out_filename)?;
                Ok(())
            }
        }
    }

    fn build_remote(&self, connect: &Connector, request: &ArchiveRequest) -> Result<(), CreateError> {
        let settings = PluginSettings::from_map(&request.settings)?;
        let transport = connect(&settings)?;
        let caller = RemoteCaller::new(transport).with_scratch_dir(&self.scratch_dir);

        let bundle = ArchiveBundle::new(
            request
                .files
                .iter()
                .map(|f| ArchiveEntry::new(&f.source_path_abs, &f.target_path, f.mode))
                .collect(),
        );

        caller.call(
            DEFAULT_CHANNEL,
            &bundle,
            &settings.metadata(),
            &request.out_filename,
            &settings.timeouts,
        )?;
        Ok(())
    }
}
