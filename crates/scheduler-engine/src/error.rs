//! Engine error types.
//!
//! Fatal initialization failures (socket bind, store connection, worker
//! spawn) surface through [`EngineError`]; everything after startup is
//! handled inside the engine and reported on the event stream instead.

use std::io;
use std::path::PathBuf;

use crate::meta::StoreError;

/// Errors surfaced by engine startup and the public handle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The worker socket could not be bound.
    #[error("failed to bind worker socket {path}: {source}")]
    Bind {
        /// Requested socket path.
        path: PathBuf,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },

    /// The metadata store rejected or dropped the connection.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The object store socket could not be reached.
    #[error("failed to connect object store socket {path}: {source}")]
    ObjectStoreConnect {
        /// Requested socket path.
        path: PathBuf,
        /// Underlying connect error.
        #[source]
        source: io::Error,
    },

    /// A worker subprocess could not be spawned.
    #[error("failed to spawn worker process: {0}")]
    SpawnWorker(#[source] io::Error),

    /// The configured worker command template is unusable.
    #[error("invalid worker command: {0}")]
    WorkerCommand(String),
}
