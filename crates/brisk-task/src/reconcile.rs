use std::collections::HashSet;

use brisk_core::{
    mutation::MutationState,
    tasks::{SyncState, Task, TaskList},
};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::TaskStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileListsOptions {
    /// Drop every known list before applying the incoming ones.
    pub replace: bool,
}

impl TaskStore {
    /// Fold authoritative remote tasks into the store, last writer wins.
    ///
    /// Incoming tasks are matched by id, then by remote id, so a task the
    /// provider echoes back under its local id or under its remote id
    /// lands on the same entry. A task that still carried an unconfirmed
    /// local edit (pending, failed, or with a write still queued) is
    /// overwritten and flagged with `has_conflict`; while a failed write for
    /// it remains queued it keeps its error. New ids are appended to the
    /// display order.
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    pub fn upsert_remote_tasks(&mut self, tasks: Vec<Task>, fetched_at: DateTime<Utc>) -> usize {
        let count = tasks.len();
        for mut incoming in tasks {
            if let Some(local_id) = self.local_id_for(&incoming) {
                incoming.id = local_id;
            }

            let overwritten_edit = self.tasks_by_id.get(&incoming.id).is_some_and(|local| {
                local.pending_sync
                    || local.sync_state == SyncState::Error
                    || self.pending_by_task_id.contains_key(&local.id)
            });
            if overwritten_edit {
                warn!(task_id = %incoming.id, "remote snapshot replaced an unconfirmed local edit");
            }
            let failure = self
                .mutation_queue
                .iter()
                .rev()
                .find(|m| m.task_id() == incoming.id && m.state == MutationState::Failed)
                .map(|m| m.last_error.clone().unwrap_or_default());

            incoming.pending_sync = false;
            incoming.sync_state = if failure.is_some() {
                SyncState::Error
            } else {
                SyncState::Idle
            };
            incoming.sync_error = failure;
            incoming.last_synced_at = Some(fetched_at);
            incoming.has_conflict = overwritten_edit;
            incoming.client_mutation_id = self.pending_by_task_id.get(&incoming.id).cloned();

            if !self.tasks_by_id.contains_key(&incoming.id) {
                self.task_order.push(incoming.id.clone());
            }
            self.tasks_by_id.insert(incoming.id.clone(), incoming);
        }
        self.last_sync_at = Some(fetched_at);
        count
    }

    /// Apply remote lists. With `replace` the local lists are dropped
    /// first; otherwise incoming fields overwrite lists with the same id
    /// (keeping the local visibility toggle) and new ids are appended.
    #[instrument(skip(self, lists), fields(count = lists.len()))]
    pub fn reconcile_lists(&mut self, lists: Vec<TaskList>, options: ReconcileListsOptions) {
        if options.replace {
            self.lists_by_id.clear();
            self.list_order.clear();
        }
        for mut list in lists {
            match self.lists_by_id.get(&list.id) {
                Some(existing) => list.is_visible = existing.is_visible,
                None if !self.list_order.contains(&list.id) => {
                    self.list_order.push(list.id.clone());
                }
                None => {}
            }
            self.lists_by_id.insert(list.id.clone(), list);
        }
    }

    /// Drop local tasks the provider no longer knows about.
    ///
    /// Only tasks with a remote id missing from `remote_ids` are removed
    /// (optionally restricted to one list); tasks with unconfirmed local
    /// edits are kept. Their leftover mutations go with them. Returns the
    /// removed ids.
    #[instrument(skip(self, remote_ids))]
    pub fn prune_absent_remote_tasks(
        &mut self,
        list_id: Option<&str>,
        remote_ids: &HashSet<String>,
    ) -> Vec<String> {
        let stale: Vec<String> = self
            .tasks()
            .filter(|t| list_id.is_none() || t.list_id.as_deref() == list_id)
            .filter(|t| !t.pending_sync)
            .filter(|t| {
                t.external_id
                    .as_ref()
                    .is_some_and(|ext| !remote_ids.contains(ext))
            })
            .map(|t| t.id.clone())
            .collect();

        for id in &stale {
            self.tasks_by_id.remove(id);
            self.task_order.retain(|t| t != id);
            self.mutation_queue.retain(|m| m.task_id() != id);
            self.pending_by_task_id.remove(id);
        }
        if !stale.is_empty() {
            info!(pruned = stale.len(), "pruned tasks missing remotely");
        }
        stale
    }

    fn local_id_for(&self, incoming: &Task) -> Option<String> {
        if self.tasks_by_id.contains_key(&incoming.id) {
            return None;
        }
        let external_id = incoming.external_id.as_deref()?;
        self.tasks()
            .find(|t| t.external_id.as_deref() == Some(external_id))
            .map(|t| t.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use brisk_core::{
        events::RecordingObserver,
        mutation::MutationAck,
        tasks::{ListSource, NewTask, TaskChanges},
    };

    use super::*;

    fn store() -> TaskStore {
        TaskStore::with_observer(Arc::new(RecordingObserver::new()))
    }

    fn remote_task(title: &str, external_id: &str) -> Task {
        let mut task = Task::new(title);
        task.external_id = Some(external_id.to_string());
        task
    }

    fn remote_list(id: &str, name: &str) -> TaskList {
        let mut list = TaskList::local(name, None);
        list.id = id.to_string();
        list.external_id = Some(id.to_string());
        list.source = ListSource::Remote;
        list
    }

    #[test]
    fn upsert_inserts_and_appends() {
        let mut store = store();
        let local = store.add_task(NewTask::titled("local"));
        let fetched_at = Utc::now();
        let remote = remote_task("remote", "g-1");

        assert_eq!(store.upsert_remote_tasks(vec![remote.clone()], fetched_at), 1);

        assert_eq!(store.task_order(), &[local.id.clone(), remote.id.clone()]);
        let stored = store.task(&remote.id).unwrap();
        assert_eq!(stored.sync_state, SyncState::Idle);
        assert_eq!(stored.last_synced_at, Some(fetched_at));
        assert!(!stored.has_conflict);
        assert_eq!(store.last_sync_at(), Some(fetched_at));
        store.check_invariants().unwrap();
    }

    #[test]
    fn upsert_overwrites_unconfirmed_edit() {
        let mut store = store();
        let task = store.add_task(NewTask::titled("Buy milk"));
        let create = store.shift_next_mutation().unwrap();
        store.resolve_mutation(&create.id, Some(MutationAck::with_external_id("g-1")));
        store
            .update_task(
                &task.id,
                TaskChanges {
                    title: Some("Buy oat milk".into()),
                    ..TaskChanges::default()
                },
            )
            .unwrap();
        assert!(store.task(&task.id).unwrap().pending_sync);

        let mut remote = store.task(&task.id).cloned().unwrap();
        remote.title = "Buy milk".into();
        let fetched_at = Utc::now();
        store.upsert_remote_tasks(vec![remote], fetched_at);

        let merged = store.task(&task.id).unwrap();
        assert_eq!(merged.title, "Buy milk");
        assert_eq!(merged.sync_state, SyncState::Idle);
        assert!(!merged.pending_sync);
        assert!(merged.has_conflict);
        assert_eq!(merged.last_synced_at, Some(fetched_at));
        // The queued update is untouched and still tracked.
        assert_eq!(store.mutation_queue().len(), 1);
        assert_eq!(
            merged.client_mutation_id.as_deref(),
            store.pending_mutation_for(&task.id)
        );
        store.check_invariants().unwrap();
    }

    #[test]
    fn upsert_flags_failed_edit_and_keeps_its_error() {
        let mut store = store();
        let task = store.add_task(NewTask::titled("draft"));
        let create = store.shift_next_mutation().unwrap();
        store.resolve_mutation(&create.id, Some(MutationAck::with_external_id("g-7")));
        store
            .update_task(
                &task.id,
                TaskChanges {
                    title: Some("local edit".into()),
                    ..TaskChanges::default()
                },
            )
            .unwrap();
        let update = store.shift_next_mutation().unwrap();
        store.fail_mutation(&update.id, "remote call failed: 503").unwrap();
        assert!(!store.task(&task.id).unwrap().pending_sync);

        store.upsert_remote_tasks(vec![remote_task("draft", "g-7")], Utc::now());

        let merged = store.task(&task.id).unwrap();
        assert_eq!(merged.title, "draft");
        assert!(merged.has_conflict);
        assert_eq!(merged.sync_state, SyncState::Error);
        assert_eq!(merged.sync_error.as_deref(), Some("remote call failed: 503"));
        store.check_invariants().unwrap();
    }

    #[test]
    fn upsert_matches_by_remote_id() {
        let mut store = store();
        let task = store.add_task(NewTask::titled("Call bank"));
        let create = store.shift_next_mutation().unwrap();
        store.resolve_mutation(&create.id, Some(MutationAck::with_external_id("g-5")));

        let echoed = remote_task("Call bank", "g-5");
        store.upsert_remote_tasks(vec![echoed.clone()], Utc::now());

        assert_eq!(store.task_count(), 1);
        assert!(store.task(&echoed.id).is_none());
        assert_eq!(store.task(&task.id).unwrap().external_id.as_deref(), Some("g-5"));
    }

    #[test]
    fn reconcile_lists_merges_by_id() {
        let mut store = store();
        let local = store.create_list("Local", None);
        store.reconcile_lists(
            vec![remote_list("l-1", "Work")],
            ReconcileListsOptions::default(),
        );
        store.set_list_visibility("l-1", false).unwrap();

        store.reconcile_lists(
            vec![remote_list("l-1", "Work stuff"), remote_list("l-2", "Home")],
            ReconcileListsOptions::default(),
        );

        assert_eq!(
            store.list_order(),
            &[local.id.clone(), "l-1".to_string(), "l-2".to_string()]
        );
        let work = store.list("l-1").unwrap();
        assert_eq!(work.name, "Work stuff");
        assert!(!work.is_visible);
    }

    #[test]
    fn reconcile_lists_replace_drops_local_lists() {
        let mut store = store();
        store.create_list("Local", None);
        store.reconcile_lists(
            vec![remote_list("l-9", "Remote")],
            ReconcileListsOptions { replace: true },
        );
        assert_eq!(store.list_order(), &["l-9".to_string()]);
        assert_eq!(store.lists().count(), 1);
    }

    #[test]
    fn prune_skips_pending_and_unsynced_tasks() {
        let mut store = store();
        let gone = remote_task("gone", "g-1");
        let kept = remote_task("kept", "g-2");
        let edited = remote_task("edited", "g-3");
        store.upsert_remote_tasks(vec![gone.clone(), kept.clone(), edited.clone()], Utc::now());
        store
            .update_task(
                &edited.id,
                TaskChanges {
                    title: Some("edited locally".into()),
                    ..TaskChanges::default()
                },
            )
            .unwrap();
        let fresh = store.add_task(NewTask::titled("never synced"));

        let remote_ids: HashSet<String> = ["g-2".to_string()].into_iter().collect();
        let pruned = store.prune_absent_remote_tasks(None, &remote_ids);

        assert_eq!(pruned, vec![gone.id.clone()]);
        assert!(store.task(&kept.id).is_some());
        assert!(store.task(&edited.id).is_some());
        assert!(store.task(&fresh.id).is_some());
        store.check_invariants().unwrap();
    }
}
