use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, info, warn};

use taskforge_core::message::{EngineMessage, WorkerRequest};
use taskforge_core::{NodeId, ObjectId, TaskSpec};

use crate::api::{
    EngineConfig, EngineDeps, EngineEvent, EngineHandle, KillMode, StatusSnapshot, WorkerId,
};
use crate::error::EngineError;
use crate::meta::{MetadataStore, TaskStatus, TaskTableEntry};
use crate::object_store::{ObjectEvent, ObjectStoreClient};
use crate::queues::{Enqueued, SchedulerState};
use crate::reconstruct::ReconstructionTracker;
use crate::worker::WorkerPool;

pub(crate) enum EngineInput {
    Worker {
        worker_id: WorkerId,
        request: WorkerRequest,
    },
    WorkerClosed {
        worker_id: WorkerId,
        error: Option<String>,
    },
}

pub(crate) enum EngineCommand {
    KillWorker { worker_id: WorkerId, mode: KillMode },
}

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    stop_requested: AtomicBool,
    notify: Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) async fn start_engine(
    cfg: EngineConfig,
    deps: EngineDeps,
) -> Result<EngineHandle, EngineError> {
    // A stale socket file from a previous run would make the bind fail.
    if cfg.worker_socket.exists() {
        let _ = std::fs::remove_file(&cfg.worker_socket);
    }
    let listener = UnixListener::bind(&cfg.worker_socket).map_err(|source| EngineError::Bind {
        path: cfg.worker_socket.clone(),
        source,
    })?;

    let node_id = NodeId::derive(&[
        cfg.node_address.as_bytes(),
        cfg.worker_socket.to_string_lossy().as_bytes(),
        &std::process::id().to_le_bytes(),
        &chrono::Utc::now().timestamp_micros().to_le_bytes(),
    ]);

    let meta_events = deps.meta.subscribe(node_id).await?;

    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        waiting: 0,
        dispatch: 0,
        workers: Vec::new(),
        spawned_unregistered: Vec::new(),
        available: cfg.static_resources,
        capacity: cfg.static_resources,
    });

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        cmd_tx,
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let pool = WorkerPool::new(
        cfg.num_workers,
        cfg.worker_command.clone(),
        cfg.worker_socket.clone(),
    );
    let state = SchedulerState::new(cfg.static_resources);

    let runtime = EngineRuntime {
        cfg,
        node_id,
        meta: deps.meta,
        object_store: deps.object_store,
        object_events: deps.object_events,
        meta_events,
        listener,
        internal_tx,
        internal_rx,
        cmd_rx,
        state,
        pool,
        recon: ReconstructionTracker::default(),
        recon_queue: VecDeque::new(),
        kill_deadlines: Vec::new(),
        stopping: false,
        snapshot_tx,
        inner: inner.clone(),
    };

    let join = tokio::spawn(runtime.run());
    Ok(EngineHandle { inner, join })
}

struct EngineRuntime {
    cfg: EngineConfig,
    node_id: NodeId,
    meta: Arc<dyn MetadataStore>,
    object_store: Arc<dyn ObjectStoreClient>,
    object_events: mpsc::UnboundedReceiver<ObjectEvent>,
    meta_events: mpsc::UnboundedReceiver<TaskTableEntry>,
    listener: UnixListener,
    internal_tx: mpsc::UnboundedSender<EngineInput>,
    internal_rx: mpsc::UnboundedReceiver<EngineInput>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    state: SchedulerState,
    pool: WorkerPool,
    recon: ReconstructionTracker,
    recon_queue: VecDeque<ObjectId>,
    kill_deadlines: Vec<(Instant, WorkerId)>,
    stopping: bool,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<EngineInner>,
}

impl EngineRuntime {
    async fn run(mut self) -> anyhow::Result<()> {
        if self.cfg.num_workers > 0 {
            self.pool
                .spawn_initial()
                .map_err(|err| anyhow::anyhow!("spawning initial workers: {err}"))?;
        }

        info!(
            node = %self.node_id,
            socket = %self.cfg.worker_socket.display(),
            workers = self.cfg.num_workers,
            "engine started"
        );
        self.emit(EngineEvent::Started);
        self.push_snapshot();

        let mut tick = tokio::time::interval(self.cfg.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.inner.should_stop() && !self.stopping {
                self.begin_shutdown();
            }
            if self.stopping && self.pool.is_empty() {
                break;
            }

            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.on_accept(stream),
                    Err(err) => self.emit(EngineEvent::Warning {
                        message: format!("worker accept failed: {err}"),
                    }),
                },
                Some(input) = self.internal_rx.recv() => self.handle_input(input).await,
                Some(event) = self.object_events.recv() => self.handle_object_event(event).await,
                Some(entry) = self.meta_events.recv() => self.handle_meta_entry(entry).await,
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                _ = self.inner.notify.notified() => {}
            }

            self.drain_reconstructions().await;
            self.try_dispatch().await;
            self.push_snapshot();
        }

        self.pool.kill_unmatched();
        let _ = std::fs::remove_file(&self.cfg.worker_socket);
        info!("engine stopped");
        self.emit(EngineEvent::Stopped);
        self.push_snapshot();
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            waiting: self.state.waiting_len(),
            dispatch: self.state.dispatch_len(),
            workers: self.pool.snapshots(),
            spawned_unregistered: self.pool.spawned_pids(),
            available: self.state.available(),
            capacity: self.state.capacity(),
        });
    }

    fn begin_shutdown(&mut self) {
        self.stopping = true;
        self.pool.kill_unmatched();
        let deadline = Instant::now() + self.cfg.graceful_kill_timeout;
        for worker_id in self.pool.worker_ids() {
            if self.pool.begin_terminate(worker_id) {
                self.kill_deadlines.push((deadline, worker_id));
            }
        }
    }

    fn on_accept(&mut self, stream: UnixStream) {
        let worker_id = self.pool.accept(stream, self.internal_tx.clone());
        if self.stopping {
            if self.pool.begin_terminate(worker_id) {
                self.kill_deadlines
                    .push((Instant::now() + self.cfg.graceful_kill_timeout, worker_id));
            }
        } else {
            self.emit(EngineEvent::WorkerConnected { worker_id });
        }
    }

    async fn on_tick(&mut self) {
        for pid in self.pool.try_reap() {
            warn!(pid, "worker process exited before registering");
        }
        if !self.stopping {
            self.pool.maybe_respawn();
        }

        if self.kill_deadlines.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = self
            .kill_deadlines
            .drain(..)
            .partition(|(deadline, _)| *deadline <= now);
        self.kill_deadlines = pending;
        for (_, worker_id) in due {
            if self.pool.contains(worker_id) {
                warn!(worker_id, "graceful kill timed out; escalating");
                self.remove_worker(worker_id, None).await;
            }
        }
    }

    async fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Worker { worker_id, request } => match request {
                WorkerRequest::Register { pid, actor } => {
                    if let Some(matched) = self.pool.register(worker_id, pid, actor) {
                        debug!(worker_id, pid, matched, "worker registered");
                        self.emit(EngineEvent::WorkerRegistered { worker_id, pid });
                    }
                }
                WorkerRequest::Submit(spec) => self.submit_local(spec, true).await,
                WorkerRequest::GetTask => {
                    if !self.pool.mark_idle(worker_id) {
                        debug!(worker_id, "GET_TASK outside the registered state ignored");
                    }
                }
                WorkerRequest::TaskDone => self.on_task_done(worker_id).await,
                WorkerRequest::Reconstruct(oid) => {
                    self.pool.block(worker_id);
                    self.recon_queue.push_back(oid);
                }
                WorkerRequest::NotifyUnblocked => self.pool.unblock(worker_id),
                WorkerRequest::Disconnect => self.remove_worker(worker_id, None).await,
            },
            EngineInput::WorkerClosed { worker_id, error } => {
                self.remove_worker(worker_id, error).await;
            }
        }
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::KillWorker { worker_id, mode } => match mode {
                KillMode::Immediate => self.remove_worker(worker_id, None).await,
                KillMode::Graceful => {
                    if self.pool.begin_terminate(worker_id) {
                        self.kill_deadlines
                            .push((Instant::now() + self.cfg.graceful_kill_timeout, worker_id));
                    }
                }
            },
        }
    }

    /// Remove a worker from every collection, release its in-flight task as
    /// lost, and keep the pool at target size.
    async fn remove_worker(&mut self, worker_id: WorkerId, error: Option<String>) {
        let Some(worker) = self.pool.remove(worker_id) else {
            return;
        };
        if let Some(reason) = error {
            self.emit(EngineEvent::Warning {
                message: format!("worker {worker_id} connection failed: {reason}"),
            });
        }

        let lost_task = worker.task;
        if let Some(task_id) = lost_task {
            if self.state.release_assigned(task_id).is_some() {
                match self
                    .meta
                    .task_update(
                        task_id,
                        &[TaskStatus::Scheduled, TaskStatus::Running],
                        TaskStatus::Lost,
                    )
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(%task_id, "lost transition skipped; status had advanced"),
                    Err(err) => warn!(%task_id, error = %err, "failed to mark task lost"),
                }
                self.emit(EngineEvent::TaskLost { task_id });
            }
        }

        self.emit(EngineEvent::WorkerDied {
            worker_id,
            lost_task,
        });

        if worker.is_pool_owned() && !self.stopping {
            self.pool.maybe_respawn();
        }
    }

    async fn on_task_done(&mut self, worker_id: WorkerId) {
        let Some(task_id) = self.pool.finish_task(worker_id) else {
            debug!(worker_id, "TASK_DONE from a worker with no assignment");
            return;
        };
        let Some(spec) = self.state.release_assigned(task_id) else {
            warn!(%task_id, "finished task had no local record");
            return;
        };

        match self
            .meta
            .task_update(
                task_id,
                &[TaskStatus::Scheduled, TaskStatus::Running],
                TaskStatus::Done,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(%task_id, "done transition lost a status race"),
            Err(err) => warn!(%task_id, error = %err, "failed to mark task done"),
        }

        self.recon.clear_returns_of(task_id);
        if self.cfg.standalone_object_tracking {
            let returns: Vec<ObjectId> = spec.return_ids().collect();
            for oid in returns {
                self.object_available(oid).await;
            }
        }
        self.emit(EngineEvent::TaskFinished { task_id });
    }

    async fn submit_local(&mut self, spec: TaskSpec, add_to_table: bool) {
        let task_id = spec.id();
        if self.state.contains(task_id) {
            return;
        }
        if add_to_table {
            let entry = TaskTableEntry::new(spec.clone(), TaskStatus::Waiting, self.node_id);
            if let Err(err) = self.meta.task_add(entry).await {
                warn!(%task_id, error = %err, "task table add failed");
            }
        }

        match self.state.submit(spec) {
            Enqueued::Waiting(missing) => {
                debug!(%task_id, missing = missing.len(), "task waiting on inputs");
                self.recon_queue.extend(missing);
            }
            Enqueued::Dispatch => {}
            Enqueued::AlreadyKnown => return,
        }
        self.emit(EngineEvent::TaskSubmitted { task_id });
    }

    async fn handle_object_event(&mut self, event: ObjectEvent) {
        match event {
            ObjectEvent::Added(oid) => self.object_available(oid).await,
            ObjectEvent::Removed(oid) => self.object_removed(oid).await,
        }
    }

    async fn object_available(&mut self, oid: ObjectId) {
        if let Err(err) = self.meta.object_add(oid, self.node_id, 0, 0).await {
            warn!(%oid, error = %err, "object table add failed");
        }
        self.recon.clear(oid);
        let promoted = self.state.on_object_available(oid);
        if !promoted.is_empty() {
            debug!(%oid, promoted = promoted.len(), "waiting tasks became dispatchable");
        }
    }

    async fn object_removed(&mut self, oid: ObjectId) {
        if let Err(err) = self.meta.object_remove(oid, self.node_id).await {
            warn!(%oid, error = %err, "object table remove failed");
        }
        let demoted = self.state.on_object_removed(oid);
        for task_id in demoted {
            debug!(%task_id, %oid, "task demoted to waiting after eviction");
            if let Some(record) = self.state.record(task_id) {
                let missing: Vec<ObjectId> = record
                    .spec
                    .args()
                    .iter()
                    .copied()
                    .filter(|arg| !self.state.is_local(*arg))
                    .collect();
                self.recon_queue.extend(missing);
            }
        }
    }

    /// A task-table write landed for an entry this node owns: another node
    /// requeued one of our tasks (typically via reconstruction).
    async fn handle_meta_entry(&mut self, entry: TaskTableEntry) {
        if entry.owner != self.node_id || entry.status != TaskStatus::Waiting {
            return;
        }
        if self.state.contains(entry.task_id) {
            return;
        }
        // The notification carries the status at write time; re-read before
        // requeueing so a stale WAITING cannot re-run a task that has since
        // advanced.
        match self.meta.task_get(entry.task_id).await {
            Ok(Some(current))
                if current.status == TaskStatus::Waiting && current.owner == self.node_id =>
            {
                debug!(task_id = %current.task_id, "picking up task requeued through the task table");
                self.submit_local(current.spec, false).await;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(task_id = %entry.task_id, error = %err, "task table re-read failed")
            }
        }
    }

    async fn drain_reconstructions(&mut self) {
        while let Some(oid) = self.recon_queue.pop_front() {
            self.reconstruct_object(oid).await;
        }
    }

    /// The reconstruction protocol for one object: fetch if it exists
    /// anywhere, otherwise re-execute its producing task — but only if this
    /// node wins the DONE→WAITING compare-and-set.
    async fn reconstruct_object(&mut self, oid: ObjectId) {
        if self.recon.is_active(oid) || self.state.is_local(oid) {
            return;
        }

        let locations = match self.meta.object_lookup(oid).await {
            Ok(locations) => locations,
            Err(err) => {
                warn!(%oid, error = %err, "object table lookup failed");
                return;
            }
        };

        if !locations.is_empty() {
            // The object exists elsewhere; pulling it is enough. No task is
            // re-executed.
            self.recon.set_fetch(oid);
            self.emit(EngineEvent::FetchRequested { object_id: oid });
            if let Err(err) = self.object_store.fetch(oid).await {
                warn!(%oid, error = %err, "fetch request failed");
            }
            return;
        }

        let task_id = oid.producing_task();
        let entry = match self.meta.task_get(task_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(%oid, "no producing task recorded; nothing to reconstruct");
                return;
            }
            Err(err) => {
                warn!(%oid, error = %err, "task table lookup failed");
                return;
            }
        };

        match entry.status {
            TaskStatus::Done => {
                match self
                    .meta
                    .task_update(task_id, &[TaskStatus::Done], TaskStatus::Waiting)
                    .await
                {
                    Ok(true) => {
                        self.recon.set_reexecution(oid);
                        self.emit(EngineEvent::ReconstructionStarted {
                            object_id: oid,
                            task_id,
                        });
                        self.submit_local(entry.spec, false).await;
                    }
                    Ok(false) => {
                        // Lost the race: either a location appeared and the
                        // status moved on, or another node owns the re-run.
                        debug!(%oid, %task_id, "reconstruction suppressed by CAS");
                    }
                    Err(err) => warn!(%oid, error = %err, "reconstruction CAS failed"),
                }
            }
            TaskStatus::Scheduled | TaskStatus::Running => {
                // An in-flight execution will (re)produce the object.
            }
            TaskStatus::Waiting | TaskStatus::Lost => {
                if entry.owner == self.node_id && !self.state.contains(task_id) {
                    if entry.status == TaskStatus::Lost {
                        if let Err(err) = self
                            .meta
                            .task_update(task_id, &[TaskStatus::Lost], TaskStatus::Waiting)
                            .await
                        {
                            warn!(%task_id, error = %err, "lost→waiting update failed");
                        }
                    }
                    self.recon.set_reexecution(oid);
                    self.emit(EngineEvent::ReconstructionStarted {
                        object_id: oid,
                        task_id,
                    });
                    self.submit_local(entry.spec, false).await;
                }
            }
        }
    }

    /// Assign dispatch-queue heads while resources and an eligible idle
    /// worker exist. Never skips past the head: a wide task at the front
    /// blocks narrower tasks behind it rather than starving.
    async fn try_dispatch(&mut self) {
        loop {
            let Some(task_id) = self.state.dispatch_head() else {
                break;
            };
            let (demand, actor) = {
                let record = self.state.record(task_id).expect("dispatch head has a record");
                (record.spec.resources(), record.spec.actor())
            };
            if !demand.fits_within(&self.state.available()) {
                break;
            }
            let Some(worker_id) = self.pool.take_idle(actor.as_ref()) else {
                break;
            };

            let spec = self.state.begin_assignment(task_id, worker_id);
            match self
                .meta
                .task_update(
                    task_id,
                    &[TaskStatus::Waiting, TaskStatus::Lost],
                    TaskStatus::Scheduled,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(%task_id, "assignment status write lost a race"),
                Err(err) => warn!(%task_id, error = %err, "assignment status write failed"),
            }

            self.pool.assign(worker_id, task_id);
            if !self.pool.send(worker_id, EngineMessage::Execute(spec)) {
                // The connection died between pick and send; its close event
                // will release the task as lost.
                warn!(worker_id, %task_id, "assignment send failed");
            }
            self.state.mark_running(task_id);
            if let Err(err) = self
                .meta
                .task_update(task_id, &[TaskStatus::Scheduled], TaskStatus::Running)
                .await
            {
                warn!(%task_id, error = %err, "running status write failed");
            }
            self.emit(EngineEvent::TaskAssigned { task_id, worker_id });
        }
    }
}
