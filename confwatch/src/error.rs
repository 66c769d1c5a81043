//! Error types for confwatch operations.

use std::time::Duration;

use thiserror::Error;

use crate::store::Revision;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot connect to store: {0}")]
    Connection(String),

    /// The channel to an endpoint could not be set up.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    Status(#[from] tonic::Status),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid key component {0:?}")]
    InvalidKey(String),

    #[error("write of {key} failed: {source}")]
    Write {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("initial read of {prefix} failed: {source}")]
    Seed {
        prefix: String,
        #[source]
        source: Box<Error>,
    },

    #[error("watch on {prefix} terminated: {source}")]
    Stream {
        prefix: String,
        #[source]
        source: Box<Error>,
    },

    #[error("revision {requested} has been compacted, oldest available is after {compacted}")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("revision {requested} is ahead of the current revision {current}")]
    FutureRevision {
        requested: Revision,
        current: Revision,
    },

    #[error("synchronizer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn write(key: impl Into<String>, source: Error) -> Self {
        Error::Write {
            key: key.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn seed(prefix: impl Into<String>, source: Error) -> Self {
        Error::Seed {
            prefix: prefix.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn stream(prefix: impl Into<String>, source: Error) -> Self {
        Error::Stream {
            prefix: prefix.into(),
            source: Box::new(source),
        }
    }

    /// Returns `true` when the failure means the resume marker is gone and the
    /// only way forward is a fresh seed.
    pub fn is_compacted(&self) -> bool {
        match self {
            Error::Compacted { .. } => true,
            Error::Write { source, .. }
            | Error::Seed { source, .. }
            | Error::Stream { source, .. } => source.is_compacted(),
            _ => false,
        }
    }

    /// Returns `true` for failures to reach or authenticate with the store.
    pub fn is_connection(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Transport(_) => true,
            Error::Status(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::Unauthenticated
            ),
            Error::Write { source, .. }
            | Error::Seed { source, .. }
            | Error::Stream { source, .. } => source.is_connection(),
            _ => false,
        }
    }
}
