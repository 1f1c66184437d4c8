//! macospkg-remote - signed macOS packages built on a remote worker
//!
//! A release host without Apple's signing tools hands its binary to this
//! plugin, which ships it over a job queue to a macOS worker holding the
//! Developer ID identity and waits for the signed `.pkg` to come back.
//!
//! - [`plugin`]: the host-facing stdin/stdout server
//! - [`caller`]: one request/reply exchange over a [`QueueTransport`]
//! - [`settings`]: per-call settings and deadlines
//! - [`local`]: the same build run in-process, for hosts that can sign
//!
//! The worker side lives in `pkgremote_worker`; `macospkgremote localserver`
//! runs it. The `macospkg` binary is the local plugin.
//!
//! [`QueueTransport`]: pkgremote_protocol::QueueTransport

pub mod caller;
pub mod local;
pub mod plugin;
pub mod settings;

pub use caller::{CallError, CallOutput, RemoteCaller};
pub use local::{LocalBuildError, LocalBuilder, LocalSettings};
pub use plugin::{PluginError, PluginInput, PluginServer, Receipt, LOCAL_PLUGIN_NAME, PLUGIN_NAME};
pub use settings::{CallTimeouts, PluginSettings, SettingsError, TimeoutValidationError};
