//! Worker pool: subprocess spawning, connection handling, and kill paths.
//!
//! The pool spawns `num_workers` subprocesses from the configured command
//! template and accepts their connections on the engine's Unix listener. A
//! connection is matched to a spawned child when its registration message
//! carries the child's pid; externally launched workers register with an
//! unknown pid and are tracked without a child handle. Socket I/O runs on
//! per-connection reader/writer tasks; all state changes happen on the
//! engine task through the internal event channel.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use taskforge_core::message::{read_message, write_message, EngineMessage, FrameError, WorkerRequest};
use taskforge_core::{ActorId, TaskId};

use crate::api::{WorkerId, WorkerSnapshot, WorkerStage};
use crate::engine::EngineInput;
use crate::error::EngineError;

pub(crate) struct WorkerClient {
    tx: mpsc::UnboundedSender<EngineMessage>,
    pub(crate) pid: Option<u32>,
    pub(crate) actor: Option<ActorId>,
    pub(crate) stage: WorkerStage,
    pub(crate) task: Option<TaskId>,
    pub(crate) child: Option<Child>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl WorkerClient {
    pub(crate) fn is_pool_owned(&self) -> bool {
        self.child.is_some()
    }

    /// Kill the owned subprocess, if any, and stop the I/O tasks.
    pub(crate) fn tear_down(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.reader.abort();
        self.writer.abort();
    }
}

pub(crate) struct WorkerPool {
    target: usize,
    command: Vec<String>,
    socket_path: PathBuf,
    next_id: WorkerId,
    /// Spawned subprocesses whose registration has not arrived yet.
    children: HashMap<u32, Child>,
    workers: HashMap<WorkerId, WorkerClient>,
    /// Idle workers, least recently used first.
    idle_order: VecDeque<WorkerId>,
}

impl WorkerPool {
    pub(crate) fn new(target: usize, command: Vec<String>, socket_path: PathBuf) -> Self {
        Self {
            target,
            command,
            socket_path,
            next_id: 0,
            children: HashMap::new(),
            workers: HashMap::new(),
            idle_order: VecDeque::new(),
        }
    }

    pub(crate) fn spawn_initial(&mut self) -> Result<(), EngineError> {
        for _ in 0..self.target {
            self.spawn_one()?;
        }
        Ok(())
    }

    pub(crate) fn spawn_one(&mut self) -> Result<u32, EngineError> {
        let argv: Vec<String> = self
            .command
            .iter()
            .map(|arg| arg.replace("{socket}", &self.socket_path.to_string_lossy()))
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(EngineError::WorkerCommand(
                "worker command template is empty".to_string(),
            ));
        };

        let mut child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::SpawnWorker)?;
        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                let _ = child.start_kill();
                return Err(EngineError::SpawnWorker(io::Error::other(
                    "worker exited before its pid could be read",
                )));
            }
        };

        debug!(pid, "spawned worker process");
        self.children.insert(pid, child);
        Ok(pid)
    }

    /// Spawn replacements until the pool-owned worker count reaches the
    /// configured target again.
    pub(crate) fn maybe_respawn(&mut self) {
        while self.owned_live() < self.target {
            if let Err(err) = self.spawn_one() {
                warn!(error = %err, "failed to spawn replacement worker");
                break;
            }
        }
    }

    fn owned_live(&self) -> usize {
        self.children.len() + self.workers.values().filter(|w| w.child.is_some()).count()
    }

    pub(crate) fn accept(
        &mut self,
        stream: UnixStream,
        internal_tx: mpsc::UnboundedSender<EngineInput>,
    ) -> WorkerId {
        let worker_id = self.next_id;
        self.next_id += 1;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(run_reader(read_half, worker_id, internal_tx.clone()));
        let writer = tokio::spawn(run_writer(write_half, worker_id, rx, internal_tx));

        self.workers.insert(
            worker_id,
            WorkerClient {
                tx,
                pid: None,
                actor: None,
                stage: WorkerStage::Connected,
                task: None,
                child: None,
                reader,
                writer,
            },
        );
        worker_id
    }

    /// Apply a registration message. Returns whether the pid matched a
    /// spawned child (the worker becomes pool-owned).
    pub(crate) fn register(
        &mut self,
        worker_id: WorkerId,
        pid: u32,
        actor: Option<ActorId>,
    ) -> Option<bool> {
        let worker = self.workers.get_mut(&worker_id)?;
        if worker.stage != WorkerStage::Connected {
            warn!(worker_id, pid, "duplicate registration ignored");
            return None;
        }

        let child = self.children.remove(&pid);
        let matched = child.is_some();
        worker.pid = Some(pid);
        worker.actor = actor;
        worker.child = child;
        worker.stage = WorkerStage::Registered;
        Some(matched)
    }

    /// A registered worker asked for work.
    pub(crate) fn mark_idle(&mut self, worker_id: WorkerId) -> bool {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        if worker.stage != WorkerStage::Registered {
            return false;
        }
        worker.stage = WorkerStage::Idle;
        self.idle_order.push_back(worker_id);
        true
    }

    /// Pick the least-recently-used idle worker eligible for the given actor
    /// binding: an actor task requires its actor's worker, a plain task any
    /// plain worker.
    pub(crate) fn take_idle(&mut self, actor: Option<&ActorId>) -> Option<WorkerId> {
        let position = self.idle_order.iter().position(|worker_id| {
            self.workers
                .get(worker_id)
                .is_some_and(|w| match actor {
                    Some(actor) => w.actor.as_ref() == Some(actor),
                    None => w.actor.is_none(),
                })
        })?;
        self.idle_order.remove(position)
    }

    pub(crate) fn assign(&mut self, worker_id: WorkerId, task_id: TaskId) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.stage = WorkerStage::Busy;
            worker.task = Some(task_id);
        }
    }

    pub(crate) fn send(&self, worker_id: WorkerId, message: EngineMessage) -> bool {
        self.workers
            .get(&worker_id)
            .is_some_and(|w| w.tx.send(message).is_ok())
    }

    pub(crate) fn block(&mut self, worker_id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if worker.stage == WorkerStage::Busy {
                worker.stage = WorkerStage::Blocked;
            }
        }
    }

    pub(crate) fn unblock(&mut self, worker_id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if worker.stage == WorkerStage::Blocked {
                worker.stage = WorkerStage::Busy;
            }
        }
    }

    /// The worker reported its task done; returns the released task id.
    pub(crate) fn finish_task(&mut self, worker_id: WorkerId) -> Option<TaskId> {
        let worker = self.workers.get_mut(&worker_id)?;
        let task = worker.task.take();
        if matches!(worker.stage, WorkerStage::Busy | WorkerStage::Blocked) {
            worker.stage = WorkerStage::Registered;
        }
        task
    }

    /// Send a terminate request and mark the worker as departing.
    pub(crate) fn begin_terminate(&mut self, worker_id: WorkerId) -> bool {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        if worker.stage == WorkerStage::Terminating {
            return false;
        }
        worker.stage = WorkerStage::Terminating;
        self.idle_order.retain(|id| *id != worker_id);
        let _ = worker.tx.send(EngineMessage::Terminate);
        true
    }

    /// Remove a worker from every collection, stopping its I/O tasks and
    /// killing its owned subprocess.
    pub(crate) fn remove(&mut self, worker_id: WorkerId) -> Option<WorkerClient> {
        let mut worker = self.workers.remove(&worker_id)?;
        self.idle_order.retain(|id| *id != worker_id);
        worker.tear_down();
        Some(worker)
    }

    /// Reap spawned children that exited before registering. Returns their
    /// pids.
    pub(crate) fn try_reap(&mut self) -> Vec<u32> {
        let mut reaped = Vec::new();
        self.children.retain(|pid, child| match child.try_wait() {
            Ok(Some(_)) => {
                reaped.push(*pid);
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid, error = %err, "failed to poll worker child");
                true
            }
        });
        reaped
    }

    /// Kill spawned children that never registered.
    pub(crate) fn kill_unmatched(&mut self) {
        for (_, child) in self.children.iter_mut() {
            let _ = child.start_kill();
        }
        self.children.clear();
    }

    pub(crate) fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn contains(&self, worker_id: WorkerId) -> bool {
        self.workers.contains_key(&worker_id)
    }

    pub(crate) fn spawned_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.children.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub(crate) fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|(worker_id, w)| WorkerSnapshot {
                worker_id: *worker_id,
                pid: w.pid,
                stage: w.stage,
                task: w.task,
                actor: w.actor,
            })
            .collect();
        snapshots.sort_unstable_by_key(|s| s.worker_id);
        snapshots
    }
}

async fn run_reader(
    mut read_half: OwnedReadHalf,
    worker_id: WorkerId,
    internal_tx: mpsc::UnboundedSender<EngineInput>,
) {
    loop {
        match read_message::<_, WorkerRequest>(&mut read_half).await {
            Ok(request) => {
                let disconnect = request == WorkerRequest::Disconnect;
                if internal_tx
                    .send(EngineInput::Worker { worker_id, request })
                    .is_err()
                    || disconnect
                {
                    return;
                }
            }
            Err(FrameError::Closed) => {
                let _ = internal_tx.send(EngineInput::WorkerClosed {
                    worker_id,
                    error: None,
                });
                return;
            }
            Err(err) => {
                let _ = internal_tx.send(EngineInput::WorkerClosed {
                    worker_id,
                    error: Some(err.to_string()),
                });
                return;
            }
        }
    }
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    worker_id: WorkerId,
    mut rx: mpsc::UnboundedReceiver<EngineMessage>,
    internal_tx: mpsc::UnboundedSender<EngineInput>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = write_message(&mut write_half, &message).await {
            let _ = internal_tx.send(EngineInput::WorkerClosed {
                worker_id,
                error: Some(err.to_string()),
            });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::ID_LEN;

    fn test_pool() -> WorkerPool {
        WorkerPool::new(0, Vec::new(), PathBuf::from("/tmp/unused.sock"))
    }

    fn insert_registered(pool: &mut WorkerPool, actor: Option<ActorId>) -> WorkerId {
        let worker_id = pool.next_id;
        pool.next_id += 1;
        let (tx, _rx) = mpsc::unbounded_channel();
        pool.workers.insert(
            worker_id,
            WorkerClient {
                tx,
                pid: Some(1000 + worker_id as u32),
                actor,
                stage: WorkerStage::Registered,
                task: None,
                child: None,
                reader: tokio::spawn(async {}),
                writer: tokio::spawn(async {}),
            },
        );
        worker_id
    }

    #[tokio::test]
    async fn idle_pick_is_least_recently_used() {
        let mut pool = test_pool();
        let a = insert_registered(&mut pool, None);
        let b = insert_registered(&mut pool, None);
        let c = insert_registered(&mut pool, None);
        assert!(pool.mark_idle(a));
        assert!(pool.mark_idle(b));
        assert!(pool.mark_idle(c));

        assert_eq!(pool.take_idle(None), Some(a));

        // `a` goes busy and idles again after the others: it is now the most
        // recently used and must be picked last.
        pool.assign(a, TaskId::from_digest(&[1; 32]));
        pool.finish_task(a);
        assert!(pool.mark_idle(a));

        assert_eq!(pool.take_idle(None), Some(b));
        assert_eq!(pool.take_idle(None), Some(c));
        assert_eq!(pool.take_idle(None), Some(a));
        assert_eq!(pool.take_idle(None), None);
    }

    #[tokio::test]
    async fn actor_tasks_require_the_actor_worker() {
        let mut pool = test_pool();
        let actor = ActorId::from_bytes([9; ID_LEN]);
        let plain = insert_registered(&mut pool, None);
        let bound = insert_registered(&mut pool, Some(actor));
        assert!(pool.mark_idle(plain));
        assert!(pool.mark_idle(bound));

        // Plain tasks never land on an actor worker, even an idle one.
        assert_eq!(pool.take_idle(None), Some(plain));
        assert_eq!(pool.take_idle(None), None);

        let other = ActorId::from_bytes([8; ID_LEN]);
        assert_eq!(pool.take_idle(Some(&other)), None);
        assert_eq!(pool.take_idle(Some(&actor)), Some(bound));
    }

    #[tokio::test]
    async fn get_task_is_only_honored_after_registration() {
        let mut pool = test_pool();
        let worker_id = insert_registered(&mut pool, None);
        pool.workers.get_mut(&worker_id).expect("worker").stage = WorkerStage::Connected;
        assert!(!pool.mark_idle(worker_id));

        pool.workers.get_mut(&worker_id).expect("worker").stage = WorkerStage::Registered;
        assert!(pool.mark_idle(worker_id));
        assert!(!pool.mark_idle(worker_id));
    }

    #[tokio::test]
    async fn removal_clears_every_collection() {
        let mut pool = test_pool();
        let worker_id = insert_registered(&mut pool, None);
        assert!(pool.mark_idle(worker_id));

        let removed = pool.remove(worker_id).expect("present");
        assert!(removed.pid.is_some());
        assert!(!pool.contains(worker_id));
        assert_eq!(pool.take_idle(None), None);
        assert!(pool.remove(worker_id).is_none());
    }
}
