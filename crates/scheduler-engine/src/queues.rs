//! Queue manager and resource ledger.
//!
//! A task is in exactly one of: the waiting queue (at least one argument not
//! locally resident), the dispatch queue (all arguments resident, no worker
//! yet), or assigned to exactly one worker. Both queues are FIFO in
//! submission order. The ledger debits a task's demand on assignment and
//! credits it back on completion or worker death; it never goes negative.

use std::collections::{HashMap, HashSet, VecDeque};

use taskforge_core::{ObjectId, ResourceVector, TaskId, TaskSpec};

use crate::api::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskPlace {
    Waiting,
    Dispatch,
    Assigned { worker: WorkerId, running: bool },
}

#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub(crate) spec: TaskSpec,
    pub(crate) place: TaskPlace,
    missing: HashSet<ObjectId>,
}

/// Outcome of inserting a task into the queues.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Waiting(Vec<ObjectId>),
    Dispatch,
    AlreadyKnown,
}

pub(crate) struct SchedulerState {
    tasks: HashMap<TaskId, TaskRecord>,
    waiting: VecDeque<TaskId>,
    dispatch: VecDeque<TaskId>,
    waiting_index: HashMap<ObjectId, HashSet<TaskId>>,
    local_objects: HashSet<ObjectId>,
    capacity: ResourceVector,
    available: ResourceVector,
}

impl SchedulerState {
    pub(crate) fn new(capacity: ResourceVector) -> Self {
        Self {
            tasks: HashMap::new(),
            waiting: VecDeque::new(),
            dispatch: VecDeque::new(),
            waiting_index: HashMap::new(),
            local_objects: HashSet::new(),
            capacity,
            available: capacity,
        }
    }

    pub(crate) fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub(crate) fn record(&self, task_id: TaskId) -> Option<&TaskRecord> {
        self.tasks.get(&task_id)
    }

    pub(crate) fn is_local(&self, oid: ObjectId) -> bool {
        self.local_objects.contains(&oid)
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub(crate) fn dispatch_len(&self) -> usize {
        self.dispatch.len()
    }

    pub(crate) fn available(&self) -> ResourceVector {
        self.available
    }

    pub(crate) fn capacity(&self) -> ResourceVector {
        self.capacity
    }

    /// Insert a newly submitted task into the right queue.
    pub(crate) fn submit(&mut self, spec: TaskSpec) -> Enqueued {
        let task_id = spec.id();
        if self.tasks.contains_key(&task_id) {
            return Enqueued::AlreadyKnown;
        }

        let missing: HashSet<ObjectId> = spec
            .args()
            .iter()
            .copied()
            .filter(|oid| !self.local_objects.contains(oid))
            .collect();

        if missing.is_empty() {
            self.tasks.insert(
                task_id,
                TaskRecord {
                    spec,
                    place: TaskPlace::Dispatch,
                    missing,
                },
            );
            self.dispatch.push_back(task_id);
            Enqueued::Dispatch
        } else {
            for oid in &missing {
                self.waiting_index.entry(*oid).or_default().insert(task_id);
            }
            let still_missing = missing.iter().copied().collect();
            self.tasks.insert(
                task_id,
                TaskRecord {
                    spec,
                    place: TaskPlace::Waiting,
                    missing,
                },
            );
            self.waiting.push_back(task_id);
            Enqueued::Waiting(still_missing)
        }
    }

    /// An object became resident: promote every waiting task whose last
    /// missing argument it was. Returns the promoted task ids.
    pub(crate) fn on_object_available(&mut self, oid: ObjectId) -> Vec<TaskId> {
        self.local_objects.insert(oid);

        let Some(dependents) = self.waiting_index.remove(&oid) else {
            return Vec::new();
        };

        let mut ready: HashSet<TaskId> = HashSet::new();
        for task_id in dependents {
            if let Some(record) = self.tasks.get_mut(&task_id) {
                record.missing.remove(&oid);
                if record.missing.is_empty() && record.place == TaskPlace::Waiting {
                    record.place = TaskPlace::Dispatch;
                    ready.insert(task_id);
                }
            }
        }

        if ready.is_empty() {
            return Vec::new();
        }

        // Preserve submission order when moving between queues.
        let mut promoted = Vec::with_capacity(ready.len());
        self.waiting.retain(|task_id| {
            if ready.contains(task_id) {
                promoted.push(*task_id);
                false
            } else {
                true
            }
        });
        for task_id in &promoted {
            self.dispatch.push_back(*task_id);
        }
        promoted
    }

    /// An object was evicted: demote every dispatch-queue task that depends
    /// on it back to waiting. Tasks already handed to a worker and running
    /// are not demoted. Returns the demoted task ids.
    pub(crate) fn on_object_removed(&mut self, oid: ObjectId) -> Vec<TaskId> {
        self.local_objects.remove(&oid);

        // Tasks already waiting on something else now also miss this object;
        // without this a later promotion could dispatch with a gone input.
        for task_id in &self.waiting {
            let record = self.tasks.get_mut(task_id).expect("queued task has a record");
            if record.spec.args().contains(&oid) {
                record.missing.insert(oid);
                self.waiting_index.entry(oid).or_default().insert(*task_id);
            }
        }

        let mut demoted = Vec::new();
        self.dispatch.retain(|task_id| {
            let record = self.tasks.get_mut(task_id).expect("queued task has a record");
            if record.spec.args().contains(&oid) {
                record.place = TaskPlace::Waiting;
                record.missing.insert(oid);
                demoted.push(*task_id);
                false
            } else {
                true
            }
        });

        for task_id in &demoted {
            self.waiting_index.entry(oid).or_default().insert(*task_id);
            self.waiting.push_back(*task_id);
        }
        demoted
    }

    /// Head of the dispatch queue, if any. Dispatch never skips past the
    /// head, so a wide task cannot starve behind narrow ones.
    pub(crate) fn dispatch_head(&self) -> Option<TaskId> {
        self.dispatch.front().copied()
    }

    /// Commit the head of the dispatch queue to `worker`: pop it, debit the
    /// ledger, and return a clone of the spec to send.
    pub(crate) fn begin_assignment(&mut self, task_id: TaskId, worker: WorkerId) -> TaskSpec {
        let head = self.dispatch.pop_front();
        debug_assert_eq!(head, Some(task_id), "assignment must take the queue head");

        let record = self.tasks.get_mut(&task_id).expect("assigned task has a record");
        record.place = TaskPlace::Assigned {
            worker,
            running: false,
        };
        self.available = self
            .available
            .checked_sub(&record.spec.resources())
            .expect("dispatch checked the ledger before assignment");
        record.spec.clone()
    }

    pub(crate) fn mark_running(&mut self, task_id: TaskId) {
        if let Some(record) = self.tasks.get_mut(&task_id) {
            if let TaskPlace::Assigned { worker, .. } = record.place {
                record.place = TaskPlace::Assigned {
                    worker,
                    running: true,
                };
            }
        }
    }

    /// Remove a finished or lost assigned task, crediting its resources back.
    pub(crate) fn release_assigned(&mut self, task_id: TaskId) -> Option<TaskSpec> {
        let record = self.tasks.get(&task_id)?;
        if !matches!(record.place, TaskPlace::Assigned { .. }) {
            return None;
        }
        let record = self.tasks.remove(&task_id)?;
        self.available = self.available.saturating_add(&record.spec.resources());
        debug_assert!(
            self.available.fits_within(&self.capacity),
            "ledger credit exceeded capacity"
        );
        Some(record.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::ID_LEN;

    fn oid(seed: u8) -> ObjectId {
        ObjectId::from_bytes([seed; ID_LEN])
    }

    fn spec(payload: &[u8], args: Vec<ObjectId>, cpus: u64) -> TaskSpec {
        TaskSpec::new(payload.to_vec(), args, 1, ResourceVector::new(cpus, 0), None)
    }

    #[test]
    fn submit_classifies_by_argument_availability() {
        let mut state = SchedulerState::new(ResourceVector::new(4, 0));
        state.on_object_available(oid(1));

        let ready = spec(b"ready", vec![oid(1)], 1);
        let blocked = spec(b"blocked", vec![oid(1), oid(2)], 1);

        assert_eq!(state.submit(ready.clone()), Enqueued::Dispatch);
        assert_eq!(state.submit(blocked), Enqueued::Waiting(vec![oid(2)]));
        assert_eq!(state.submit(ready), Enqueued::AlreadyKnown);
        assert_eq!(state.dispatch_len(), 1);
        assert_eq!(state.waiting_len(), 1);
    }

    #[test]
    fn last_missing_argument_promotes() {
        let mut state = SchedulerState::new(ResourceVector::new(4, 0));
        let task = spec(b"t", vec![oid(1), oid(2)], 1);
        let task_id = task.id();
        state.submit(task);

        assert!(state.on_object_available(oid(1)).is_empty());
        assert_eq!(state.waiting_len(), 1);

        assert_eq!(state.on_object_available(oid(2)), vec![task_id]);
        assert_eq!(state.waiting_len(), 0);
        assert_eq!(state.dispatch_len(), 1);
    }

    #[test]
    fn removal_then_availability_restores_memberships() {
        let mut state = SchedulerState::new(ResourceVector::new(4, 0));
        state.on_object_available(oid(1));

        let dependent = spec(b"dep", vec![oid(1)], 1);
        let independent = spec(b"ind", vec![], 1);
        let dependent_id = dependent.id();
        state.submit(dependent);
        state.submit(independent);
        assert_eq!(state.dispatch_len(), 2);

        assert_eq!(state.on_object_removed(oid(1)), vec![dependent_id]);
        assert_eq!(state.waiting_len(), 1);
        assert_eq!(state.dispatch_len(), 1);

        assert_eq!(state.on_object_available(oid(1)), vec![dependent_id]);
        assert_eq!(state.waiting_len(), 0);
        assert_eq!(state.dispatch_len(), 2);
    }

    #[test]
    fn dispatch_is_fifo_and_head_blocking() {
        let mut state = SchedulerState::new(ResourceVector::new(2, 0));
        let wide = spec(b"wide", vec![], 2);
        let narrow = spec(b"narrow", vec![], 1);
        let wide_id = wide.id();
        let narrow_id = narrow.id();
        state.submit(wide);
        state.submit(narrow);

        // The wide head is assigned first even though the narrow task would
        // also fit; FIFO is never bypassed.
        assert_eq!(state.dispatch_head(), Some(wide_id));
        state.begin_assignment(wide_id, 1);
        assert_eq!(state.available(), ResourceVector::ZERO);

        // The remaining head no longer fits the ledger.
        assert_eq!(state.dispatch_head(), Some(narrow_id));
        assert!(!spec(b"narrow", vec![], 1)
            .resources()
            .fits_within(&state.available()));
    }

    #[test]
    fn release_credits_the_ledger_back_to_capacity() {
        let capacity = ResourceVector::new(3, 1);
        let mut state = SchedulerState::new(capacity);
        let task = spec(b"t", vec![], 2);
        let task_id = task.id();
        state.submit(task);

        state.begin_assignment(task_id, 7);
        state.mark_running(task_id);
        assert_eq!(state.available(), ResourceVector::new(1, 1));

        let released = state.release_assigned(task_id).expect("assigned");
        assert_eq!(released.id(), task_id);
        assert_eq!(state.available(), capacity);
        assert!(state.release_assigned(task_id).is_none());
        assert!(!state.contains(task_id));
    }

    #[test]
    fn eviction_reaches_tasks_already_waiting_on_other_inputs() {
        let mut state = SchedulerState::new(ResourceVector::new(4, 0));
        state.on_object_available(oid(1));
        let task = spec(b"t", vec![oid(1), oid(2)], 1);
        let task_id = task.id();
        state.submit(task);
        assert_eq!(state.waiting_len(), 1);

        state.on_object_removed(oid(1));

        // The second input alone no longer promotes; both are needed again.
        assert!(state.on_object_available(oid(2)).is_empty());
        assert_eq!(state.on_object_available(oid(1)), vec![task_id]);
        assert_eq!(state.dispatch_len(), 1);
    }

    #[test]
    fn queues_never_hold_a_task_twice() {
        let mut state = SchedulerState::new(ResourceVector::new(4, 0));
        let task = spec(b"t", vec![oid(9)], 1);
        state.submit(task);

        // Repeated availability flaps must not duplicate queue entries.
        state.on_object_available(oid(9));
        state.on_object_removed(oid(9));
        state.on_object_available(oid(9));

        assert_eq!(state.waiting_len() + state.dispatch_len(), 1);
    }
}
