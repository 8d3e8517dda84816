use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the discovery, handshake and transfer protocols
#[derive(Debug, Error)]
pub enum ShareError {
    /// Socket, connect, send or receive failure
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// The peer did not answer within the allowed window
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with something other than the expected literal
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The receiving side refused the transfer
    #[error("authorization denied")]
    AuthorizationDenied,

    /// A local file could not be read or written
    #[error("file error on {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ShareError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn file_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }
}

pub type ShareResult<T> = std::result::Result<T, ShareError>;
