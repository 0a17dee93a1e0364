//! Public API types for the in-process scheduling engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use taskforge_core::{ActorId, ObjectId, ResourceVector, TaskId};

use crate::error::EngineError;
use crate::meta::{MemoryMetaStore, MetadataStore};
use crate::object_store::{NullObjectStore, ObjectEvent, ObjectStoreClient, SocketObjectStore};
use crate::redis_meta::RedisMetaStore;

/// Identifier of a worker connection, unique for the engine's lifetime.
pub type WorkerId = u64;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address advertised to the cluster (identifies this node).
    pub node_address: String,

    /// Path at which the engine binds its worker socket.
    pub worker_socket: PathBuf,

    /// Object-store notification socket; `None` runs without a store.
    pub object_store_socket: Option<PathBuf>,

    /// Object-store manager socket used for remote-fetch requests.
    pub object_store_manager_socket: Option<PathBuf>,

    /// `host:port` of the metadata store; `None` selects the in-process
    /// store (standalone, single-node operation).
    pub redis_address: Option<String>,

    /// Number of worker subprocesses to spawn at startup and to maintain.
    pub num_workers: usize,

    /// Schedulable resource capacity of this node.
    pub static_resources: ResourceVector,

    /// Command template used to spawn a worker; every `{socket}` token is
    /// replaced with the worker socket path.
    pub worker_command: Vec<String>,

    /// How long a gracefully killed worker may linger before escalation.
    pub graceful_kill_timeout: Duration,

    /// Cadence of the engine's housekeeping timer (kill escalation, child
    /// reaping).
    pub tick_interval: Duration,

    /// When running without an object store, treat a finishing task's return
    /// objects as locally resident.
    pub standalone_object_tracking: bool,
}

impl EngineConfig {
    /// Default grace period before an unresponsive worker is killed hard.
    pub const DEFAULT_GRACEFUL_KILL_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default housekeeping cadence.
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

    /// A minimal configuration binding the given worker socket, with no
    /// stores, no spawned workers, and the given capacity.
    pub fn for_socket(worker_socket: impl Into<PathBuf>, resources: ResourceVector) -> Self {
        Self {
            node_address: "127.0.0.1".to_string(),
            worker_socket: worker_socket.into(),
            object_store_socket: None,
            object_store_manager_socket: None,
            redis_address: None,
            num_workers: 0,
            static_resources: resources,
            worker_command: Vec::new(),
            graceful_kill_timeout: Self::DEFAULT_GRACEFUL_KILL_TIMEOUT,
            tick_interval: Self::DEFAULT_TICK_INTERVAL,
            standalone_object_tracking: false,
        }
    }
}

/// Lifecycle stage of a worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStage {
    /// Socket accepted, registration not yet received.
    Connected,
    /// Registered (pid known), not asking for work.
    Registered,
    /// Blocked in `GET_TASK`, available for assignment.
    Idle,
    /// Executing an assignment.
    Busy,
    /// Executing, but blocked on a missing input object.
    Blocked,
    /// Asked to terminate; awaiting departure or escalation.
    Terminating,
}

/// Snapshot of a single worker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Connection id.
    pub worker_id: WorkerId,
    /// OS pid, once registered.
    pub pid: Option<u32>,
    /// Current stage.
    pub stage: WorkerStage,
    /// Task currently held, if any.
    pub task: Option<TaskId>,
    /// Actor hosted by this worker, if any.
    pub actor: Option<ActorId>,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether a stop has been requested.
    pub stop_requested: bool,
    /// Tasks with at least one non-resident argument.
    pub waiting: usize,
    /// Tasks ready to run, not yet assigned.
    pub dispatch: usize,
    /// Per-connection worker snapshots.
    pub workers: Vec<WorkerSnapshot>,
    /// Pids of spawned worker processes that have not registered yet.
    pub spawned_unregistered: Vec<u32>,
    /// Resources not currently reserved by assignments.
    pub available: ResourceVector,
    /// Configured resource capacity.
    pub capacity: ResourceVector,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// A worker socket was accepted.
    WorkerConnected {
        /// Connection id.
        worker_id: WorkerId,
    },
    /// A worker sent its registration.
    WorkerRegistered {
        /// Connection id.
        worker_id: WorkerId,
        /// Registered pid.
        pid: u32,
    },
    /// A worker departed or was killed.
    WorkerDied {
        /// Connection id.
        worker_id: WorkerId,
        /// Task released as lost, if the worker held one.
        lost_task: Option<TaskId>,
    },
    /// A task entered the queues.
    TaskSubmitted {
        /// Task id.
        task_id: TaskId,
    },
    /// A task was assigned to a worker.
    TaskAssigned {
        /// Task id.
        task_id: TaskId,
        /// Assigned worker.
        worker_id: WorkerId,
    },
    /// A worker reported its task done.
    TaskFinished {
        /// Task id.
        task_id: TaskId,
    },
    /// A task was marked lost after its worker died.
    TaskLost {
        /// Task id.
        task_id: TaskId,
    },
    /// Reconstruction found remote copies and issued a fetch.
    FetchRequested {
        /// Object being fetched.
        object_id: ObjectId,
    },
    /// Reconstruction won the re-execution CAS and requeued the producer.
    ReconstructionStarted {
        /// Object being reconstructed.
        object_id: ObjectId,
        /// Producing task.
        task_id: TaskId,
    },
    /// A non-fatal problem worth surfacing.
    Warning {
        /// Message.
        message: String,
    },
    /// A non-fatal error.
    Error {
        /// Message.
        message: String,
    },
    /// Engine stopped.
    Stopped,
}

/// How to remove a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Send a terminate message and escalate after the configured timeout.
    Graceful,
    /// Kill the process and drop the connection immediately.
    Immediate,
}

/// External collaborators injected into the engine.
///
/// Production wiring is assembled by [`start_engine`]; tests and embedders
/// inject their own store implementations through [`start_engine_with`].
pub struct EngineDeps {
    /// Metadata store client.
    pub meta: Arc<dyn MetadataStore>,
    /// Object store client used for fetch requests.
    pub object_store: Arc<dyn ObjectStoreClient>,
    /// Residency notifications feeding the engine.
    pub object_events: mpsc::UnboundedReceiver<ObjectEvent>,
}

/// Handle to a running engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// A watch receiver that observes every snapshot update.
    pub fn snapshot_watch(&self) -> tokio::sync::watch::Receiver<StatusSnapshot> {
        self.inner.snapshot_rx.clone()
    }

    /// Request a graceful shutdown: workers are terminated and the engine
    /// task exits once they are gone.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Remove a worker. Returns `false` if the engine is no longer running.
    pub fn kill_worker(&self, worker_id: WorkerId, mode: KillMode) -> bool {
        self.inner
            .cmd_tx
            .send(crate::engine::EngineCommand::KillWorker { worker_id, mode })
            .is_ok()
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}

/// Start an engine with production wiring derived from the configuration:
/// Redis-backed metadata store when `redis_address` is set (in-process store
/// otherwise), socket object store when both store sockets are set.
pub async fn start_engine(config: EngineConfig) -> Result<EngineHandle, EngineError> {
    let meta: Arc<dyn MetadataStore> = match &config.redis_address {
        Some(address) => Arc::new(RedisMetaStore::connect(address).await?),
        None => Arc::new(MemoryMetaStore::new()),
    };

    let (object_store, object_events): (Arc<dyn ObjectStoreClient>, _) = match (
        &config.object_store_socket,
        &config.object_store_manager_socket,
    ) {
        (Some(store), Some(manager)) => {
            let (client, events) = SocketObjectStore::connect(store, manager).await?;
            (Arc::new(client), events)
        }
        _ => {
            // No store: the channel stays empty and, if standalone tracking
            // is on, the engine synthesizes residency itself.
            let (_tx, rx) = mpsc::unbounded_channel();
            (Arc::new(NullObjectStore), rx)
        }
    };

    start_engine_with(
        config,
        EngineDeps {
            meta,
            object_store,
            object_events,
        },
    )
    .await
}

/// Start an engine against injected collaborators.
pub async fn start_engine_with(
    config: EngineConfig,
    deps: EngineDeps,
) -> Result<EngineHandle, EngineError> {
    crate::engine::start_engine(config, deps).await
}
