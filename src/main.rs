//! macospkgremote CLI
//!
//! Without arguments, serves one archive request from the release host on
//! stdin/stdout. `macospkgremote localserver` runs the build worker instead.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use macospkg_remote::PluginServer;
use tracing::error;

#[derive(Parser)]
#[command(name = "macospkgremote")]
#[command(about = "Build signed macOS packages on a remote worker", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build worker on this Mac until SIGINT/SIGTERM
    Localserver,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    pkgremote_worker::logging::init();

    match cli.command {
        Some(Commands::Localserver) => {
            if let Err(e) = pkgremote_worker::run_local_server() {
                error!(error = %e, "local server failed");
                return ExitCode::FAILURE;
            }
        }
        None => {
            if let Err(e) = PluginServer::spool().run() {
                error!(error = %e, "plugin I/O failed");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
