//! macospkg CLI
//!
//! Serves one archive request from the release host on stdin/stdout and
//! builds the signed package on this Mac, with the identity named in
//! `archive_settings.custom_settings.apple_signing_identity`.

use std::process::ExitCode;

use clap::Parser;
use macospkg_remote::PluginServer;
use tracing::error;

#[derive(Parser)]
#[command(name = "macospkg")]
#[command(about = "Build signed macOS packages on this machine", version)]
struct Cli {}

fn main() -> ExitCode {
    let _cli = Cli::parse();
    pkgremote_worker::logging::init();

    if let Err(e) = PluginServer::local().run() {
        error!(error = %e, "plugin I/O failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
