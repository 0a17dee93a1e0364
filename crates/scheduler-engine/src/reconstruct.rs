//! Per-object reconstruction state.
//!
//! Tracks which objects currently have a fetch or a re-execution in flight
//! so that repeated `reconstruct()` calls coalesce. The protocol itself
//! (object-table lookup, DONE→WAITING compare-and-set, local resubmission)
//! lives on the engine, which owns the store clients.

use std::collections::HashMap;

use taskforge_core::{ObjectId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconState {
    /// Locations exist elsewhere; a fetch was issued. Cleared when the
    /// object arrives locally.
    FetchRequested,
    /// No locations existed and this node won the re-execution CAS. Cleared
    /// when the object arrives or the producing task completes.
    ReconstructionRequested,
}

#[derive(Default)]
pub(crate) struct ReconstructionTracker {
    states: HashMap<ObjectId, ReconState>,
}

impl ReconstructionTracker {
    /// Whether a reconstruct call for `oid` should be a no-op.
    pub(crate) fn is_active(&self, oid: ObjectId) -> bool {
        self.states.contains_key(&oid)
    }

    pub(crate) fn set_fetch(&mut self, oid: ObjectId) {
        self.states.insert(oid, ReconState::FetchRequested);
    }

    pub(crate) fn set_reexecution(&mut self, oid: ObjectId) {
        self.states.insert(oid, ReconState::ReconstructionRequested);
    }

    /// The object became locally resident; any in-flight state is finished.
    pub(crate) fn clear(&mut self, oid: ObjectId) -> Option<ReconState> {
        self.states.remove(&oid)
    }

    /// The producing task completed; its pending re-executions are finished.
    pub(crate) fn clear_returns_of(&mut self, task_id: TaskId) {
        self.states.retain(|oid, state| {
            !(oid.producing_task() == task_id && *state == ReconState::ReconstructionRequested)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::ID_LEN;

    #[test]
    fn duplicate_requests_coalesce() {
        let mut tracker = ReconstructionTracker::default();
        let oid = ObjectId::from_bytes([1; ID_LEN]);

        assert!(!tracker.is_active(oid));
        tracker.set_fetch(oid);
        assert!(tracker.is_active(oid));

        tracker.clear(oid);
        assert!(!tracker.is_active(oid));
    }

    #[test]
    fn task_completion_clears_only_its_reexecutions() {
        let mut tracker = ReconstructionTracker::default();
        let task = TaskId::from_digest(&[7; 32]);
        let other = TaskId::from_digest(&[8; 32]);

        let mine = ObjectId::for_return(task, 0);
        let fetched = ObjectId::for_return(task, 1);
        let theirs = ObjectId::for_return(other, 0);

        tracker.set_reexecution(mine);
        tracker.set_fetch(fetched);
        tracker.set_reexecution(theirs);

        tracker.clear_returns_of(task);
        assert!(!tracker.is_active(mine));
        // A fetch in flight is not owned by the task's completion.
        assert!(tracker.is_active(fetched));
        assert!(tracker.is_active(theirs));
    }
}
