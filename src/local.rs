//! Local package build.
//!
//! For release hosts that are Macs with the signing identity in their own
//! keychain. There is no queue and no worker: the input is staged in a
//! private directory, the build delegate runs in this process, and the
//! package is moved straight to the requested output file.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pkgremote_protocol::archive::sanitize;
use pkgremote_protocol::{ArchiveError, CorrelationId, JobMetadata, UnpackedFile};
use pkgremote_worker::{BuildDelegate, BuildError, TrustedConfig, WorkerJob};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::plugin::ArchiveFile;
use crate::settings::{keys, required_str, SettingsError};

/// Setting naming the Developer ID identity used for a local build.
pub const APPLE_SIGNING_IDENTITY: &str = "apple_signing_identity";

/// Validated settings for one local build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSettings {
    pub package_identifier: String,
    pub package_version: String,
    /// Identity passed to `codesign` and `productbuild`.
    pub signing_identity: String,
}

impl LocalSettings {
    /// Read the host's custom settings table.
    pub fn from_map(settings: &Map<String, Value>) -> Result<Self, SettingsError> {
        let signing_identity = required_str(settings, APPLE_SIGNING_IDENTITY)?;
        let package_identifier = required_str(settings, keys::PACKAGE_IDENTIFIER)?;
        let package_version = required_str(settings, keys::PACKAGE_VERSION)?;

        Ok(Self {
            package_identifier,
            package_version,
            signing_identity,
        })
    }

    pub fn metadata(&self) -> JobMetadata {
        JobMetadata::for_package(&self.package_identifier, &self.package_version)
    }
}

/// Errors from a local build
#[derive(Debug, thiserror::Error)]
pub enum LocalBuildError {
    #[error(transparent)]
    Target(#[from] ArchiveError),

    #[error("cannot stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LocalBuildError {
    fn stage(path: &Path, source: io::Error) -> Self {
        Self::Stage {
            path: path.to_path_buf(),
            source,
        }
    }

    fn output(path: &Path, source: io::Error) -> Self {
        Self::Output {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Runs a build delegate in this process.
pub struct LocalBuilder {
    delegate: Arc<dyn BuildDelegate>,
    scratch_dir: PathBuf,
}

impl LocalBuilder {
    pub fn new(delegate: Arc<dyn BuildDelegate>) -> Self {
        Self {
            delegate,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Package `file` and write the result to `output`.
    ///
    /// The working directory is removed on every path; on failure nothing
    /// is written to `output`.
    pub fn build(
        &self,
        file: &ArchiveFile,
        settings: &LocalSettings,
        output: &Path,
    ) -> Result<(), LocalBuildError> {
        let target = sanitize(Path::new(&file.target_path))?;

        let workspace = tempfile::Builder::new()
            .prefix("pkgremote-local-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| LocalBuildError::stage(&self.scratch_dir, e))?;
        let staging_dir = workspace.path().join("staging");
        let output_dir = workspace.path().join("output");
        for dir in [&staging_dir, &output_dir] {
            fs::create_dir_all(dir).map_err(|e| LocalBuildError::stage(dir, e))?;
        }

        let staged = stage(file, &staging_dir.join(target))?;
        debug!(path = %staged.path.display(), mode = %format!("{:o}", staged.mode), "input staged");

        let metadata = settings.metadata();
        let trusted = TrustedConfig::new(&settings.signing_identity);
        let job = WorkerJob {
            id: CorrelationId::new(),
            staging_dir: &staging_dir,
            output_dir: &output_dir,
            files: std::slice::from_ref(&staged),
            metadata: &metadata,
            trusted: &trusted,
        };
        let artifact = self.delegate.build(&job)?;

        move_into_place(&artifact, output)?;
        info!(output = %output.display(), "package written");
        Ok(())
    }
}

/// Copy the host's file to `dest` and give it the requested mode.
fn stage(file: &ArchiveFile, dest: &Path) -> Result<UnpackedFile, LocalBuildError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| LocalBuildError::stage(parent, e))?;
    }
    fs::copy(&file.source_path_abs, dest)
        .map_err(|e| LocalBuildError::stage(&file.source_path_abs, e))?;
    set_mode(dest, file.mode).map_err(|e| LocalBuildError::stage(dest, e))?;

    Ok(UnpackedFile {
        path: dest.to_path_buf(),
        mode: file.mode,
    })
}

/// Rename `artifact` to `output`, copying through a sibling temp file when
/// the two live on different filesystems.
fn move_into_place(artifact: &Path, output: &Path) -> Result<(), LocalBuildError> {
    if fs::rename(artifact, output).is_ok() {
        return Ok(());
    }

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut partial = tempfile::Builder::new()
        .prefix(".pkgremote-")
        .tempfile_in(parent)
        .map_err(|e| LocalBuildError::output(output, e))?;
    let mut source = File::open(artifact).map_err(|e| LocalBuildError::output(artifact, e))?;
    io::copy(&mut source, partial.as_file_mut()).map_err(|e| LocalBuildError::output(output, e))?;
    partial
        .persist(output)
        .map_err(|e| LocalBuildError::output(output, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
