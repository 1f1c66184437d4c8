//! Signed macOS installer package delegate.
//!
//! Wraps Apple's command line tools:
//! 1. `codesign` each staged file with the hardened runtime
//! 2. `pkgbuild` a component package rooted at the staging directory
//! 3. `productbuild` a signed product archive from the component
//!
//! Only works on a macOS host with the signing identity in its keychain.

use std::path::{Path, PathBuf};
use std::process::Command;

use pkgremote_protocol::metadata::keys;
use tracing::info;

use crate::job::{BuildDelegate, BuildError, BuildResult, WorkerJob};

/// Where the packaged files are installed on the target machine.
pub const DEFAULT_INSTALL_LOCATION: &str = "/usr/local/bin";

/// File name of the product archive inside the job's output directory.
pub const PRODUCT_FILE_NAME: &str = "package.pkg";

/// Lines of tool stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Builds signed `.pkg` installers.
#[derive(Debug, Clone)]
pub struct PkgbuildDelegate {
    install_location: String,
}

impl PkgbuildDelegate {
    pub fn new() -> Self {
        Self {
            install_location: DEFAULT_INSTALL_LOCATION.to_string(),
        }
    }

    pub fn with_install_location(mut self, location: impl Into<String>) -> Self {
        self.install_location = location.into();
        self
    }
}

impl Default for PkgbuildDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildDelegate for PkgbuildDelegate {
    fn build(&self, job: &WorkerJob<'_>) -> BuildResult {
        let identifier = job.metadata.require(keys::PACKAGE_IDENTIFIER)?;
        let version = job.metadata.require(keys::PACKAGE_VERSION)?;
        let identity = job.trusted.signing_identity();

        for file in job.files {
            run_tool("codesign", &codesign_args(identity, &file.path))?;
        }

        let component = job.output_dir.join("component.pkg");
        run_tool(
            "pkgbuild",
            &pkgbuild_args(
                job.staging_dir,
                identifier,
                version,
                &self.install_location,
                &component,
            ),
        )?;

        let product = product_path(job.output_dir);
        run_tool("productbuild", &productbuild_args(&component, identity, &product))?;

        info!(job_id = %job.id, identifier, version, "package built");
        Ok(product)
    }
}

fn codesign_args(identity: &str, path: &Path) -> Vec<String> {
    vec![
        "--force".to_string(),
        "--options".to_string(),
        "runtime".to_string(),
        "--timestamp".to_string(),
        "--sign".to_string(),
        identity.to_string(),
        path.display().to_string(),
    ]
}

fn pkgbuild_args(
    root: &Path,
    identifier: &str,
    version: &str,
    install_location: &str,
    output: &Path,
) -> Vec<String> {
    vec![
        "--root".to_string(),
        root.display().to_string(),
        "--identifier".to_string(),
        identifier.to_string(),
        "--version".to_string(),
        version.to_string(),
        "--install-location".to_string(),
        install_location.to_string(),
        output.display().to_string(),
    ]
}

fn productbuild_args(component: &Path, identity: &str, output: &Path) -> Vec<String> {
    vec![
        "--package".to_string(),
        component.display().to_string(),
        "--sign".to_string(),
        identity.to_string(),
        "--timestamp".to_string(),
        output.display().to_string(),
    ]
}

/// Run `tool` to completion, turning a non-zero exit into [`BuildError::Tool`].
fn run_tool(tool: &str, args: &[String]) -> Result<(), BuildError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| BuildError::Spawn {
            tool: tool.to_string(),
            source: e,
        })?;

    if output.status.success() {
        return Ok(());
    }

    Err(BuildError::Tool {
        tool: tool.to_string(),
        status: output.status.code(),
        stderr: stderr_tail(&output.stderr),
    })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Expected product path for a job's output directory.
pub fn product_path(output_dir: &Path) -> PathBuf {
    output_dir.join(PRODUCT_FILE_NAME)
}
