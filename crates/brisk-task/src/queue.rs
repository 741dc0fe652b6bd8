use std::collections::HashSet;

use brisk_core::{
    mutation::{MutationAck, MutationState, TaskMutation, TaskMutationOperation},
    tasks::SyncState,
};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::{Result, TaskStore, TaskStoreError};

impl TaskStore {
    /// Append a mutation to the tail of the queue. When `task_id` is given
    /// the pending index for that task is pointed at the new mutation.
    pub fn enqueue_mutation(
        &mut self,
        operation: TaskMutationOperation,
        task_id: Option<&str>,
    ) -> TaskMutation {
        let mutation = TaskMutation::new(operation);
        if let Some(task_id) = task_id {
            self.track_pending(task_id, &mutation.id);
        }
        debug!(
            mutation_id = %mutation.id,
            kind = mutation.operation.kind(),
            task_id = mutation.task_id(),
            depth = self.mutation_queue.len() + 1,
            "mutation queued"
        );
        self.mutation_queue.push(mutation.clone());
        mutation
    }

    /// Hand the next runnable mutation to the sync worker.
    ///
    /// Scans the queue front to back and returns the first `Queued`
    /// mutation whose task has no earlier mutation still in flight or
    /// failed, so writes to one task are never reordered while different
    /// tasks keep global FIFO order. The mutation stays in the queue as
    /// `InFlight` with `attempts` bumped.
    #[instrument(skip(self))]
    pub fn shift_next_mutation(&mut self) -> Option<TaskMutation> {
        let index = self.next_runnable_index()?;
        let mutation = &mut self.mutation_queue[index];
        mutation.state = MutationState::InFlight;
        mutation.attempts += 1;
        let mutation = mutation.clone();

        self.mark_tracking_tasks(&mutation.id, SyncState::Syncing);
        debug!(
            mutation_id = %mutation.id,
            kind = mutation.operation.kind(),
            attempts = mutation.attempts,
            "mutation in flight"
        );
        Some(mutation)
    }

    /// Ensure a mutation is in flight without dequeuing another one.
    /// Already in-flight mutations are returned unchanged; a queued or
    /// failed one counts as a new attempt.
    pub fn mark_mutation_in_flight(&mut self, id: &str) -> Result<TaskMutation> {
        let mutation = self.mutation_mut(id)?;
        if mutation.state != MutationState::InFlight {
            mutation.state = MutationState::InFlight;
            mutation.attempts += 1;
        }
        let mutation = mutation.clone();
        self.mark_tracking_tasks(id, SyncState::Syncing);
        Ok(mutation)
    }

    /// Drop a confirmed mutation from the queue.
    ///
    /// Only tasks still tracking this exact mutation get their optimistic
    /// flags cleared; a task that has since been edited again stays
    /// pending until its newer mutation resolves. A remote id in `ack` is
    /// always recorded, on the task and on later queued writes for the same
    /// task that were enqueued before the id was known.
    ///
    /// Returns `false` when the mutation was not queued (already resolved).
    #[instrument(skip(self, ack))]
    pub fn resolve_mutation(&mut self, id: &str, ack: Option<MutationAck>) -> bool {
        let Some(index) = self.mutation_queue.iter().position(|m| m.id == id) else {
            debug!("resolve for unknown mutation ignored");
            return false;
        };
        let mutation = self.mutation_queue.remove(index);
        let task_id = mutation.task_id().to_string();

        if let Some(external_id) = ack.and_then(|a| a.external_id) {
            self.record_external_id(&task_id, &external_id);
        }

        let now = Utc::now();
        for tracked in self.tasks_tracking(id) {
            self.pending_by_task_id.remove(&tracked);
            if let Some(task) = self.tasks_by_id.get_mut(&tracked) {
                task.mark_synced(now);
            }
        }
        debug!(kind = mutation.operation.kind(), task_id = %task_id, "mutation resolved");
        true
    }

    /// Record a failed attempt. The mutation stays queued as `Failed` so
    /// the UI can show it; tracking tasks switch to the error state. So
    /// does the mutation's own task when a later write for it is now held
    /// back behind the failure.
    #[instrument(skip(self, error))]
    pub fn fail_mutation(&mut self, id: &str, error: impl Into<String>) -> Result<TaskMutation> {
        let error = error.into();
        let mutation = self.mutation_mut(id)?;
        mutation.state = MutationState::Failed;
        mutation.last_error = Some(error.clone());
        mutation.failed_at = Some(Utc::now());
        let mutation = mutation.clone();

        let mut affected = self.tasks_tracking(id);
        let task_id = mutation.task_id();
        if !affected.iter().any(|t| t == task_id) && self.has_later_mutation(id, task_id) {
            affected.push(task_id.to_string());
        }
        for tracked in affected {
            if let Some(task) = self.tasks_by_id.get_mut(&tracked) {
                task.sync_state = SyncState::Error;
                task.pending_sync = false;
                task.sync_error = Some(error.clone());
            }
        }
        warn!(
            kind = mutation.operation.kind(),
            attempts = mutation.attempts,
            "mutation failed: {error}"
        );
        Ok(mutation)
    }

    /// Put a mutation back at the front of the queue for a retry.
    ///
    /// The queued copy (if any) wins over the argument so `attempts` can
    /// never go backwards. The pending index is re-pointed at it unless a
    /// newer mutation for the same task is still queued; the task goes back
    /// to pending either way.
    #[instrument(skip(self, mutation), fields(mutation_id = %mutation.id))]
    pub fn requeue_mutation(&mut self, mutation: TaskMutation) -> TaskMutation {
        let mut mutation = match self.mutation_queue.iter().position(|m| m.id == mutation.id) {
            Some(index) => self.mutation_queue.remove(index),
            None => mutation,
        };
        mutation.state = MutationState::Queued;
        self.mutation_queue.insert(0, mutation.clone());

        let task_id = mutation.task_id().to_string();
        let newer_queued = self.mutation_queue[1..]
            .iter()
            .any(|m| m.task_id() == task_id);
        if !newer_queued {
            self.track_pending(&task_id, &mutation.id);
        }
        if let Some(task) = self.tasks_by_id.get_mut(&task_id) {
            task.mark_pending(pending_state_for(&mutation.operation));
            task.sync_error = None;
        }
        info!(task_id = %task_id, attempts = mutation.attempts, "mutation requeued");
        mutation
    }

    /// Failed mutations, in queue order, whose retry delay has run out at
    /// `now`. `delay` maps the attempt count to the wait after the last
    /// failure; a failure with no recorded time is always due.
    pub fn failed_mutations_due(
        &self,
        now: DateTime<Utc>,
        delay: impl Fn(u32) -> TimeDelta,
    ) -> Vec<TaskMutation> {
        self.mutation_queue
            .iter()
            .filter(|m| m.state == MutationState::Failed)
            .filter(|m| match m.failed_at {
                Some(at) => at
                    .checked_add_signed(delay(m.attempts))
                    .is_some_and(|due| due <= now),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Drop every failed mutation. Pending-index entries left pointing at
    /// nothing are swept and their tasks return to idle.
    pub fn clear_failed_mutations(&mut self) -> usize {
        let before = self.mutation_queue.len();
        self.mutation_queue
            .retain(|m| m.state != MutationState::Failed);
        let removed = before - self.mutation_queue.len();

        let live: HashSet<&str> = self.mutation_queue.iter().map(|m| m.id.as_str()).collect();
        let stale: Vec<String> = self
            .pending_by_task_id
            .iter()
            .filter(|(_, mutation_id)| !live.contains(mutation_id.as_str()))
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in stale {
            self.untrack_pending(&task_id);
            if let Some(task) = self.tasks_by_id.get_mut(&task_id) {
                if task.sync_state == SyncState::Error {
                    task.sync_state = SyncState::Idle;
                    task.sync_error = None;
                }
            }
        }
        // Tasks whose newer write was only held back by a dropped failure.
        let unblocked: Vec<(String, SyncState)> = self
            .pending_by_task_id
            .iter()
            .filter_map(|(task_id, mutation_id)| {
                let mutation = self.mutation_queue.iter().find(|m| &m.id == mutation_id)?;
                Some((task_id.clone(), pending_state_for(&mutation.operation)))
            })
            .collect();
        for (task_id, state) in unblocked {
            if let Some(task) = self.tasks_by_id.get_mut(&task_id) {
                if task.sync_state == SyncState::Error {
                    task.mark_pending(state);
                    task.sync_error = None;
                }
            }
        }

        if removed > 0 {
            info!(removed, "cleared failed mutations");
        }
        removed
    }

    /// Return an in-flight mutation to `Queued` in place, keeping its
    /// position and attempt count. Used when the worker aborts a call it
    /// never got an answer for.
    pub fn release_mutation(&mut self, id: &str) -> Result<TaskMutation> {
        let mutation = self.mutation_mut(id)?;
        if mutation.state == MutationState::InFlight {
            mutation.state = MutationState::Queued;
        }
        let mutation = mutation.clone();
        self.mark_tracking_tasks(id, pending_state_for(&mutation.operation));
        Ok(mutation)
    }

    /// Release every in-flight mutation, e.g. after a restart interrupted
    /// the previous worker.
    pub fn release_in_flight_mutations(&mut self) -> usize {
        let in_flight: Vec<String> = self
            .mutation_queue
            .iter()
            .filter(|m| m.state == MutationState::InFlight)
            .map(|m| m.id.clone())
            .collect();
        for id in &in_flight {
            // Ids were just read from the queue.
            let _ = self.release_mutation(id);
        }
        in_flight.len()
    }

    fn next_runnable_index(&self) -> Option<usize> {
        let mut blocked: HashSet<&str> = HashSet::new();
        for (index, mutation) in self.mutation_queue.iter().enumerate() {
            match mutation.state {
                MutationState::Queued if !blocked.contains(mutation.task_id()) => {
                    return Some(index)
                }
                MutationState::Queued => {}
                MutationState::InFlight | MutationState::Failed => {
                    blocked.insert(mutation.task_id());
                }
            }
        }
        None
    }

    fn has_later_mutation(&self, mutation_id: &str, task_id: &str) -> bool {
        self.mutation_queue
            .iter()
            .skip_while(|m| m.id != mutation_id)
            .skip(1)
            .any(|m| m.task_id() == task_id)
    }

    fn mutation_mut(&mut self, id: &str) -> Result<&mut TaskMutation> {
        self.mutation_queue
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| TaskStoreError::MutationNotFound { id: id.to_string() })
    }

    fn mark_tracking_tasks(&mut self, mutation_id: &str, state: SyncState) {
        for tracked in self.tasks_tracking(mutation_id) {
            if let Some(task) = self.tasks_by_id.get_mut(&tracked) {
                task.mark_pending(state);
            }
        }
    }

    fn record_external_id(&mut self, task_id: &str, external_id: &str) {
        if let Some(task) = self.tasks_by_id.get_mut(task_id) {
            task.external_id = Some(external_id.to_string());
        }
        for mutation in self
            .mutation_queue
            .iter_mut()
            .filter(|m| m.task_id() == task_id)
        {
            match &mut mutation.operation {
                TaskMutationOperation::Delete { external_id: slot, .. }
                | TaskMutationOperation::Move {
                    external_id: slot, ..
                } if slot.is_none() => *slot = Some(external_id.to_string()),
                _ => {}
            }
        }
    }
}

fn pending_state_for(operation: &TaskMutationOperation) -> SyncState {
    match operation {
        TaskMutationOperation::Move { .. } => SyncState::PendingMove,
        _ => SyncState::Pending,
    }
}
