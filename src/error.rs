//! Error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures touching a session workspace on disk.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid session key {0:?}")]
    InvalidKey(String),

    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures starting or supervising a toolchain process.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no command configured")]
    EmptyCommand,

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}
