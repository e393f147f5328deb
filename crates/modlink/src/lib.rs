//! modlink: command bridge between the mod manager UI and its helper
//! process.
//!
//! The UI issues typed remote calls against a long-lived helper
//! subprocess that processes one request at a time. Concurrent callers
//! share a [`Bridge`]: each call is queued, written to the helper's
//! stdin as a line-oriented JSON frame, answered on its stdout, and
//! routed back to exactly the caller that issued it while the UI's
//! scheduler keeps running.
//!
//! # Architecture
//!
//! - **bridge**: wire protocol types and the JSON-line codec
//! - **spawn**: helper binary resolution, log redirection, spawning
//! - **dispatcher**: the public `Bridge` handle and the single worker
//!   task owning the pipe
//! - **helper**: the subprocess side — command registry, request loop,
//!   parent-liveness monitor

pub mod bridge;
pub mod dispatcher;
pub mod helper;
pub mod spawn;

pub use bridge::protocol::{CMD_DIE, CMD_INIT, Reply, ReplyStatus, Request};
pub use dispatcher::{Bridge, BridgeConfig, BridgeError, DebugConfig, InitError};
pub use helper::{CommandRegistry, HelperArgs};
pub use spawn::{
    HELPER_LOG_ENV, HelperSpawnConfig, HelperSpawner, InstalledHelperSpawner, SpawnError,
};
