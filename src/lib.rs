//! Keep local folders in sync with a remote host over SCP/SSH.
//!
//! Remote operations shell out to a plink compatible remote-shell executor
//! and a pscp compatible copy tool. All of them run on one worker thread
//! ([`task::TaskQueue`]); callers enqueue and observe results through
//! listeners and a [`progress::ProgressSink`].

pub mod bulk;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod listener;
pub mod mapping;
pub mod process;
pub mod progress;
pub mod registry;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use commands::SyncCommands;
pub use error::{ErrorKind, Result, ScpError};
pub use registry::ConnectionRegistry;
