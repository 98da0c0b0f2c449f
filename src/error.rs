// Controller error taxonomy — failures reported back to the host per command.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::SessionKey;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("unknown session key: {0}")]
    UnknownKey(SessionKey),

    #[error("session key already in use: {0}")]
    DuplicateKey(SessionKey),

    #[error("session {0} has not resolved its metadata yet")]
    NotResolved(SessionKey),

    #[error("file index {index} out of range for session {key}")]
    FileIndex { key: SessionKey, index: usize },

    #[error("session {key} did not stop within {secs}s")]
    StopTimeout { key: SessionKey, secs: u64 },

    #[error("failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine failure: {0}")]
    Engine(#[from] anyhow::Error),
}

impl ControllerError {
    /// The session key this error is scoped to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::UnknownKey(key)
            | Self::DuplicateKey(key)
            | Self::NotResolved(key)
            | Self::FileIndex { key, .. }
            | Self::StopTimeout { key, .. } => Some(key),
            Self::Persistence { .. } | Self::Engine(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
