//! Object-store seam.
//!
//! The store pushes residency notifications (`OBJECT_SEALED` /
//! `OBJECT_EVICTED`) into the engine and accepts `FETCH` requests to pull a
//! remote copy. Production uses [`SocketObjectStore`] over the store's Unix
//! sockets; standalone mode and tests inject their own [`ObjectStoreClient`]
//! and feed the notification channel directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use taskforge_core::message::{read_message, write_message, StoreNotice, StoreRequest};
use taskforge_core::ObjectId;

use crate::error::EngineError;

/// Residency change reported by the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectEvent {
    /// Object became resident on this node.
    Added(ObjectId),
    /// Object was evicted from this node.
    Removed(ObjectId),
}

/// Outbound half of the object-store protocol.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Ask the store to pull a remote copy of `oid`. Completion is signalled
    /// later through an [`ObjectEvent::Added`] notification; the store
    /// retries internally, so this call carries no timeout.
    async fn fetch(&self, oid: ObjectId) -> Result<(), EngineError>;
}

/// Object-store client that does nothing; used when the engine runs without
/// an object store (standalone mode).
pub struct NullObjectStore;

#[async_trait]
impl ObjectStoreClient for NullObjectStore {
    async fn fetch(&self, oid: ObjectId) -> Result<(), EngineError> {
        debug!(%oid, "no object store configured; fetch dropped");
        Ok(())
    }
}

/// Client for a real object store reachable over two Unix sockets: the store
/// socket for notifications and the manager socket for fetch requests.
pub struct SocketObjectStore {
    fetch_tx: mpsc::UnboundedSender<ObjectId>,
}

impl SocketObjectStore {
    /// Connect both sockets, returning the client and the notification
    /// stream. The connections are retried with bounded backoff if they drop
    /// later; only the initial connect is fatal.
    pub async fn connect(
        store_path: &Path,
        manager_path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ObjectEvent>), EngineError> {
        let notif =
            UnixStream::connect(store_path)
                .await
                .map_err(|source| EngineError::ObjectStoreConnect {
                    path: store_path.to_path_buf(),
                    source,
                })?;
        let manager =
            UnixStream::connect(manager_path)
                .await
                .map_err(|source| EngineError::ObjectStoreConnect {
                    path: manager_path.to_path_buf(),
                    source,
                })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_notification_reader(
            notif,
            store_path.to_path_buf(),
            event_tx,
        ));

        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_fetch_writer(
            manager,
            manager_path.to_path_buf(),
            fetch_rx,
        ));

        Ok((Self { fetch_tx }, event_rx))
    }
}

#[async_trait]
impl ObjectStoreClient for SocketObjectStore {
    async fn fetch(&self, oid: ObjectId) -> Result<(), EngineError> {
        if self.fetch_tx.send(oid).is_err() {
            warn!(%oid, "object store fetch channel closed; request dropped");
        }
        Ok(())
    }
}

const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

async fn reconnect(path: &Path) -> UnixStream {
    let mut backoff = RECONNECT_BACKOFF_START;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return stream,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "object store reconnect failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
    }
}

async fn run_notification_reader(
    mut stream: UnixStream,
    path: PathBuf,
    event_tx: mpsc::UnboundedSender<ObjectEvent>,
) {
    loop {
        match read_message::<_, StoreNotice>(&mut stream).await {
            Ok(StoreNotice::Sealed(oid)) => {
                if event_tx.send(ObjectEvent::Added(oid)).is_err() {
                    return;
                }
            }
            Ok(StoreNotice::Evicted(oid)) => {
                if event_tx.send(ObjectEvent::Removed(oid)).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "object store notification stream dropped; reconnecting");
                stream = reconnect(&path).await;
            }
        }
    }
}

async fn run_fetch_writer(
    mut stream: UnixStream,
    path: PathBuf,
    mut fetch_rx: mpsc::UnboundedReceiver<ObjectId>,
) {
    while let Some(oid) = fetch_rx.recv().await {
        loop {
            match write_message(&mut stream, &StoreRequest::Fetch(oid)).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(%oid, error = %err, "fetch request failed; reconnecting");
                    stream = reconnect(&path).await;
                }
            }
        }
    }
}
