use std::fmt::Debug;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    /// The transport failed to open or operate the node's socket.
    Transport(#[from] TransportError),

    #[error("{0}")]
    /// An IO error has occurred,
    IO(#[from] io::Error),

    #[error("Invalid setting: {0}")]
    /// The provided configuration cannot be used to run a node.
    InvalidSetting(String),

    #[error("The identity file {path:?} is corrupt: {reason}")]
    /// The persisted member id exists but could not be trusted.
    CorruptIdentity { path: PathBuf, reason: String },

    #[error("The node has been shut down.")]
    /// The membership executor is no longer running.
    Shutdown,

    #[error("Failed to initialised cluster extension: {0}")]
    Extension(anyhow::Error),
}
