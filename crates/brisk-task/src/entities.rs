use brisk_core::{
    events::{TaskEvent, TaskEventKind},
    mutation::TaskMutationOperation,
    tasks::{
        normalize_labels, NewTask, Subtask, SyncState, Task, TaskChanges, TaskList, TaskStatus,
        COPY_SUFFIX,
    },
};
use chrono::{NaiveDate, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{Result, TaskStore, TaskStoreError};

/// Partial update for a single subtask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubtaskChanges {
    pub title: Option<String>,
    pub is_completed: Option<bool>,
    pub due_date: Option<Option<NaiveDate>>,
}

impl TaskStore {
    /// Create a task optimistically and queue its `create` mutation.
    ///
    /// The title is trimmed but never rejected; validation belongs to the
    /// caller. Without an explicit list the task lands in the first list.
    #[instrument(skip(self, input), fields(title = %input.title))]
    pub fn add_task(&mut self, input: NewTask) -> Task {
        let now = Utc::now();
        let mut task = Task::new(input.title.trim());
        task.description = input.description;
        task.status = input.status.unwrap_or_default();
        task.is_completed = task.status == TaskStatus::Done;
        task.completed_at = task.is_completed.then_some(now);
        task.priority = input.priority.unwrap_or_default();
        task.due_date = input.due_date;
        task.labels = normalize_labels(input.labels);
        task.list_id = input.list_id.or_else(|| self.list_order.first().cloned());
        task.subtasks = input.subtasks;
        task.order = self.front_order();
        task.mark_pending(SyncState::Pending);

        let id = task.id.clone();
        let operation = TaskMutationOperation::Create {
            task: Box::new(task.clone()),
        };
        self.tasks_by_id.insert(id.clone(), task);
        self.task_order.insert(0, id.clone());
        self.enqueue_mutation(operation, Some(&id));

        self.emit(TaskEvent::new(TaskEventKind::TaskCreated).with("task_id", id.as_str()));
        self.tasks_by_id[&id].clone()
    }

    /// Merge `changes` into a task and queue an `update` mutation.
    ///
    /// Unknown ids leave the store untouched and return `TaskNotFound`.
    #[instrument(skip(self, changes))]
    pub fn update_task(&mut self, id: &str, changes: TaskChanges) -> Result<Task> {
        let task = self.apply_update(id, changes)?;
        self.emit(TaskEvent::new(TaskEventKind::TaskUpdated).with("task_id", id));
        Ok(task)
    }

    /// Remove a task locally and queue a `delete` carrying its remote id.
    #[instrument(skip(self))]
    pub fn delete_task(&mut self, id: &str) -> Result<Task> {
        let external_id = self
            .tasks_by_id
            .get(id)
            .ok_or_else(|| not_found(id))?
            .external_id
            .clone();

        self.enqueue_mutation(
            TaskMutationOperation::Delete {
                id: id.to_string(),
                external_id: external_id.clone(),
            },
            Some(id),
        );
        self.task_order.retain(|t| t != id);
        let removed = self.tasks_by_id.remove(id).ok_or_else(|| not_found(id))?;

        let mut event = TaskEvent::new(TaskEventKind::TaskDeleted).with("task_id", id);
        if let Some(external_id) = external_id {
            event = event.with("external_id", external_id);
        }
        self.emit(event);
        Ok(removed)
    }

    #[instrument(skip(self))]
    pub fn toggle_task_completion(&mut self, id: &str) -> Result<Task> {
        let completing = !self.tasks_by_id.get(id).ok_or_else(|| not_found(id))?.is_completed;
        let changes = TaskChanges {
            is_completed: Some(completing),
            completed_at: Some(completing.then(Utc::now)),
            status: Some(if completing {
                TaskStatus::Done
            } else {
                TaskStatus::Todo
            }),
            ..TaskChanges::default()
        };
        let task = self.apply_update(id, changes)?;

        let kind = if completing {
            TaskEventKind::TaskCompleted
        } else {
            TaskEventKind::TaskReopened
        };
        self.emit(TaskEvent::new(kind).with("task_id", id));
        Ok(task)
    }

    /// Copy a task (fresh ids, " (Copy)" title suffix, not completed).
    /// Returns `None` when the source does not exist.
    pub fn duplicate_task(&mut self, id: &str) -> Option<Task> {
        let source = self.tasks_by_id.get(id)?;
        let input = NewTask {
            title: format!("{}{}", source.title, COPY_SUFFIX),
            description: source.description.clone(),
            status: None,
            priority: Some(source.priority),
            due_date: source.due_date,
            labels: source.labels.clone(),
            list_id: source.list_id.clone(),
            subtasks: source
                .subtasks
                .iter()
                .map(|s| Subtask {
                    id: Uuid::new_v4().to_string(),
                    ..s.clone()
                })
                .collect(),
        };
        debug!(source = id, "duplicating task");
        Some(self.add_task(input))
    }

    pub fn set_task_due_date(&mut self, id: &str, due_date: Option<NaiveDate>) -> Result<Task> {
        let changes = TaskChanges {
            due_date: Some(due_date),
            ..TaskChanges::default()
        };
        let task = self.apply_update(id, changes)?;

        let due = due_date.map(|d| d.to_string()).unwrap_or_default();
        self.emit(
            TaskEvent::new(TaskEventKind::TaskDueChanged)
                .with("task_id", id)
                .with("due_date", due),
        );
        Ok(task)
    }

    /// Move a task to another list, placing it right after `previous_id`
    /// in display order (or first when absent), and queue a `move`.
    #[instrument(skip(self))]
    pub fn move_task(
        &mut self,
        id: &str,
        to_list_id: &str,
        previous_id: Option<&str>,
    ) -> Result<Task> {
        self.relocate(id, to_list_id, previous_id, true)
    }

    /// Body of [`TaskStore::move_task`]. With `reorder` unset the display
    /// position is left alone and `previous_id` only travels with the
    /// queued `move`.
    fn relocate(
        &mut self,
        id: &str,
        to_list_id: &str,
        previous_id: Option<&str>,
        reorder: bool,
    ) -> Result<Task> {
        if !self.lists_by_id.contains_key(to_list_id) {
            return Err(TaskStoreError::ListNotFound {
                id: to_list_id.to_string(),
            });
        }
        let task = self.tasks_by_id.get_mut(id).ok_or_else(|| not_found(id))?;
        let from_list = task.list_id.replace(to_list_id.to_string());
        task.updated_at = Utc::now();
        task.has_conflict = false;
        task.sync_error = None;
        task.mark_pending(SyncState::PendingMove);
        let external_id = task.external_id.clone();

        if reorder {
            self.task_order.retain(|t| t != id);
            let at = previous_id
                .and_then(|prev| self.task_order.iter().position(|t| t == prev))
                .map_or(0, |pos| pos + 1);
            self.task_order.insert(at, id.to_string());
        }

        self.enqueue_mutation(
            TaskMutationOperation::Move {
                id: id.to_string(),
                to_list_id: to_list_id.to_string(),
                previous_id: previous_id.map(str::to_string),
                parent_id: None,
                external_id,
            },
            Some(id),
        );

        self.emit(
            TaskEvent::new(TaskEventKind::TaskMoved)
                .with("task_id", id)
                .with("from_list_id", from_list.unwrap_or_default())
                .with("to_list_id", to_list_id),
        );
        Ok(self.tasks_by_id[id].clone())
    }

    pub fn add_subtask(&mut self, task_id: &str, title: &str) -> Result<Subtask> {
        let mut subtasks = self.subtasks_of(task_id)?;
        let subtask = Subtask::new(title);
        subtasks.push(subtask.clone());
        self.update_task(
            task_id,
            TaskChanges {
                subtasks: Some(subtasks),
                ..TaskChanges::default()
            },
        )?;
        Ok(subtask)
    }

    pub fn update_subtask(
        &mut self,
        task_id: &str,
        subtask_id: &str,
        changes: SubtaskChanges,
    ) -> Result<Subtask> {
        let mut subtasks = self.subtasks_of(task_id)?;
        let subtask = subtasks
            .iter_mut()
            .find(|s| s.id == subtask_id)
            .ok_or_else(|| TaskStoreError::SubtaskNotFound {
                task_id: task_id.to_string(),
                subtask_id: subtask_id.to_string(),
            })?;
        if let Some(title) = changes.title {
            subtask.title = title.trim().to_string();
        }
        if let Some(is_completed) = changes.is_completed {
            subtask.is_completed = is_completed;
        }
        if let Some(due_date) = changes.due_date {
            subtask.due_date = due_date;
        }
        let updated = subtask.clone();

        self.update_task(
            task_id,
            TaskChanges {
                subtasks: Some(subtasks),
                ..TaskChanges::default()
            },
        )?;
        Ok(updated)
    }

    pub fn remove_subtask(&mut self, task_id: &str, subtask_id: &str) -> Result<()> {
        let mut subtasks = self.subtasks_of(task_id)?;
        let before = subtasks.len();
        subtasks.retain(|s| s.id != subtask_id);
        if subtasks.len() == before {
            return Err(TaskStoreError::SubtaskNotFound {
                task_id: task_id.to_string(),
                subtask_id: subtask_id.to_string(),
            });
        }
        self.update_task(
            task_id,
            TaskChanges {
                subtasks: Some(subtasks),
                ..TaskChanges::default()
            },
        )?;
        Ok(())
    }

    /// Lists are local-only until the provider reports them back.
    pub fn create_list(&mut self, name: &str, color: Option<String>) -> TaskList {
        let list = TaskList::local(name, color);
        self.list_order.push(list.id.clone());
        self.lists_by_id.insert(list.id.clone(), list.clone());
        list
    }

    pub fn set_list_visibility(&mut self, id: &str, visible: bool) -> Result<TaskList> {
        let list = self
            .lists_by_id
            .get_mut(id)
            .ok_or_else(|| TaskStoreError::ListNotFound { id: id.to_string() })?;
        list.is_visible = visible;
        Ok(list.clone())
    }

    /// Delete a list. Its tasks must be reassigned: each one is moved
    /// behind the closest earlier task of the target list and keeps its
    /// display position. Deleting a non-empty list without a target is
    /// rejected. Returns the ids of the moved tasks.
    #[instrument(skip(self))]
    pub fn delete_list(&mut self, id: &str, reassign_to: Option<&str>) -> Result<Vec<String>> {
        if !self.lists_by_id.contains_key(id) {
            return Err(TaskStoreError::ListNotFound { id: id.to_string() });
        }
        let members: Vec<String> = self
            .tasks()
            .filter(|t| t.list_id.as_deref() == Some(id))
            .map(|t| t.id.clone())
            .collect();

        match reassign_to {
            Some(target) if target == id => {
                return Err(TaskStoreError::InvalidReassignment { id: id.to_string() });
            }
            Some(target) if !self.lists_by_id.contains_key(target) => {
                return Err(TaskStoreError::ListNotFound {
                    id: target.to_string(),
                });
            }
            Some(target) => {
                for task_id in &members {
                    let previous = self.previous_in_list(task_id, target);
                    self.relocate(task_id, target, previous.as_deref(), false)?;
                }
            }
            None if !members.is_empty() => {
                return Err(TaskStoreError::ListNotEmpty {
                    id: id.to_string(),
                    count: members.len(),
                });
            }
            None => {}
        }

        self.lists_by_id.remove(id);
        self.list_order.retain(|l| l != id);
        Ok(members)
    }

    /// Shared body of every task edit: merge, bump `updated_at`, mark pending
    /// and queue the `update`. Emits nothing; callers pick the event.
    pub(crate) fn apply_update(&mut self, id: &str, changes: TaskChanges) -> Result<Task> {
        let task = self.tasks_by_id.get_mut(id).ok_or_else(|| not_found(id))?;
        changes.apply_to(task);
        task.updated_at = Utc::now();
        task.has_conflict = false;
        task.sync_error = None;
        task.mark_pending(SyncState::Pending);

        self.enqueue_mutation(
            TaskMutationOperation::Update {
                id: id.to_string(),
                changes,
            },
            Some(id),
        );
        Ok(self.tasks_by_id[id].clone())
    }

    fn subtasks_of(&self, task_id: &str) -> Result<Vec<Subtask>> {
        self.tasks_by_id
            .get(task_id)
            .map(|t| t.subtasks.clone())
            .ok_or_else(|| not_found(task_id))
    }

    fn previous_in_list(&self, id: &str, list_id: &str) -> Option<String> {
        let pos = self.task_order.iter().position(|t| t == id)?;
        self.task_order[..pos]
            .iter()
            .rev()
            .find(|t| {
                self.tasks_by_id
                    .get(t.as_str())
                    .is_some_and(|task| task.list_id.as_deref() == Some(list_id))
            })
            .cloned()
    }

    // Sort key that places a new task ahead of every existing one.
    fn front_order(&self) -> i64 {
        self.tasks_by_id
            .values()
            .map(|t| t.order)
            .min()
            .map_or(0, |min| min - 1)
    }
}

fn not_found(id: &str) -> TaskStoreError {
    TaskStoreError::TaskNotFound { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use brisk_core::{events::RecordingObserver, mutation::MutationState, tasks::Priority};

    use super::*;

    fn store() -> (TaskStore, RecordingObserver) {
        let observer = RecordingObserver::new();
        (TaskStore::with_observer(Arc::new(observer.clone())), observer)
    }

    #[test]
    fn add_task_is_optimistic_and_queued() {
        let (mut store, observer) = store();
        let task = store.add_task(NewTask::titled("Buy milk"));

        assert!(task.pending_sync);
        assert_eq!(task.sync_state, SyncState::Pending);
        assert_eq!(store.task_order()[0], task.id);
        assert_eq!(store.mutation_queue().len(), 1);
        let mutation = &store.mutation_queue()[0];
        assert!(matches!(
            mutation.operation,
            TaskMutationOperation::Create { .. }
        ));
        assert_eq!(mutation.state, MutationState::Queued);
        assert_eq!(store.pending_mutation_for(&task.id), Some(mutation.id.as_str()));
        assert_eq!(task.client_mutation_id.as_deref(), Some(mutation.id.as_str()));
        assert_eq!(observer.kinds(), vec![TaskEventKind::TaskCreated]);
        store.check_invariants().unwrap();
    }

    #[test]
    fn add_task_trims_title_and_defaults_list() {
        let (mut store, _) = store();
        let inbox = store.create_list("Inbox", None);
        store.create_list("Errands", None);

        let task = store.add_task(NewTask::titled("   "));
        assert_eq!(task.title, "");
        assert_eq!(task.list_id.as_deref(), Some(inbox.id.as_str()));
    }

    #[test]
    fn newest_task_comes_first() {
        let (mut store, _) = store();
        let first = store.add_task(NewTask::titled("one"));
        let second = store.add_task(NewTask::titled("two"));

        assert_eq!(store.task_order(), &[second.id.clone(), first.id.clone()]);
        assert!(second.order < first.order);
        let titles: Vec<_> = store.tasks().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["two", "one"]);
    }

    #[test]
    fn update_unknown_task_changes_nothing() {
        let (mut store, observer) = store();
        let before = store.snapshot();
        let err = store
            .update_task("missing", TaskChanges::default())
            .expect_err("unknown id");
        assert_eq!(
            err,
            TaskStoreError::TaskNotFound {
                id: "missing".into()
            }
        );
        assert_eq!(store.snapshot(), before);
        assert!(observer.events().is_empty());
    }

    #[test]
    fn update_repoints_pending_index() {
        let (mut store, _) = store();
        let task = store.add_task(NewTask::titled("Buy milk"));
        let create_id = store.mutation_queue()[0].id.clone();

        let updated = store
            .update_task(
                &task.id,
                TaskChanges {
                    title: Some("Buy oat milk".into()),
                    priority: Some(Priority::High),
                    ..TaskChanges::default()
                },
            )
            .unwrap();

        assert_eq!(updated.title, "Buy oat milk");
        assert_eq!(updated.priority, Priority::High);
        assert!(updated.updated_at >= task.updated_at);
        assert_eq!(store.mutation_queue().len(), 2);
        let update_id = store.mutation_queue()[1].id.clone();
        assert_eq!(store.pending_mutation_for(&task.id), Some(update_id.as_str()));
        assert!(store.mutation(&create_id).is_some());
        store.check_invariants().unwrap();
    }

    #[test]
    fn delete_is_immediate_and_keeps_remote_id() {
        let (mut store, observer) = store();
        let task = store.add_task(NewTask::titled("Old chore"));
        store.tasks_by_id.get_mut(&task.id).unwrap().external_id = Some("g-42".into());

        store.delete_task(&task.id).unwrap();

        assert!(store.task(&task.id).is_none());
        assert!(!store.task_order().contains(&task.id));
        let delete = store.mutation_queue().last().unwrap();
        assert_eq!(
            delete.operation,
            TaskMutationOperation::Delete {
                id: task.id.clone(),
                external_id: Some("g-42".into()),
            }
        );
        assert_eq!(store.pending_mutation_for(&task.id), Some(delete.id.as_str()));
        assert_eq!(observer.kinds().last(), Some(&TaskEventKind::TaskDeleted));
        store.check_invariants().unwrap();
    }

    #[test]
    fn delete_unknown_task_is_rejected() {
        let (mut store, _) = store();
        assert!(matches!(
            store.delete_task("nope"),
            Err(TaskStoreError::TaskNotFound { .. })
        ));
        assert!(store.mutation_queue().is_empty());
    }

    #[test]
    fn toggle_flips_completion_and_emits() {
        let (mut store, observer) = store();
        let task = store.add_task(NewTask::titled("Run"));

        let done = store.toggle_task_completion(&task.id).unwrap();
        assert!(done.is_completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.status, TaskStatus::Done);

        let reopened = store.toggle_task_completion(&task.id).unwrap();
        assert!(!reopened.is_completed);
        assert!(reopened.completed_at.is_none());
        assert_eq!(reopened.status, TaskStatus::Todo);

        assert_eq!(
            observer.kinds(),
            vec![
                TaskEventKind::TaskCreated,
                TaskEventKind::TaskCompleted,
                TaskEventKind::TaskReopened
            ]
        );
    }

    #[test]
    fn duplicate_copies_fields_with_new_identity() {
        let (mut store, _) = store();
        let mut input = NewTask::titled("Plan trip");
        input.priority = Some(Priority::Medium);
        input.subtasks = vec![Subtask::new("Book flights")];
        let source = store.add_task(input);

        let copy = store.duplicate_task(&source.id).expect("source exists");
        assert_ne!(copy.id, source.id);
        assert_eq!(copy.title, "Plan trip (Copy)");
        assert_eq!(copy.priority, Priority::Medium);
        assert_eq!(copy.subtasks[0].title, "Book flights");
        assert_ne!(copy.subtasks[0].id, source.subtasks[0].id);
        assert_eq!(store.task_order()[0], copy.id);

        assert!(store.duplicate_task("missing").is_none());
    }

    #[test]
    fn due_date_round_trip() {
        let (mut store, observer) = store();
        let task = store.add_task(NewTask::titled("Dentist"));
        let due = NaiveDate::from_ymd_opt(2026, 11, 2);

        let with_due = store.set_task_due_date(&task.id, due).unwrap();
        assert_eq!(with_due.due_date, due);
        let cleared = store.set_task_due_date(&task.id, None).unwrap();
        assert_eq!(cleared.due_date, None);

        let events = observer.events();
        assert_eq!(events[1].kind, TaskEventKind::TaskDueChanged);
        assert_eq!(events[1].payload["due_date"], "2026-11-02");
    }

    #[test]
    fn move_repositions_and_marks_pending_move() {
        let (mut store, _) = store();
        let home = store.create_list("Home", None);
        let work = store.create_list("Work", None);
        let a = store.add_task(NewTask::titled("a"));
        let b = store.add_task(NewTask::titled("b"));
        let c = store.add_task(NewTask::titled("c"));
        assert_eq!(a.list_id.as_deref(), Some(home.id.as_str()));

        let moved = store.move_task(&c.id, &work.id, Some(&a.id)).unwrap();

        assert_eq!(moved.list_id.as_deref(), Some(work.id.as_str()));
        assert_eq!(moved.sync_state, SyncState::PendingMove);
        assert!(moved.pending_sync);
        assert_eq!(
            store.task_order(),
            &[b.id.clone(), a.id.clone(), c.id.clone()]
        );
        assert!(matches!(
            &store.mutation_queue().last().unwrap().operation,
            TaskMutationOperation::Move { to_list_id, previous_id, .. }
                if to_list_id == &work.id && previous_id.as_deref() == Some(a.id.as_str())
        ));
        store.check_invariants().unwrap();
    }

    #[test]
    fn move_to_unknown_list_is_rejected() {
        let (mut store, _) = store();
        let task = store.add_task(NewTask::titled("a"));
        assert!(matches!(
            store.move_task(&task.id, "nowhere", None),
            Err(TaskStoreError::ListNotFound { .. })
        ));
        assert_eq!(store.task(&task.id).unwrap().sync_state, SyncState::Pending);
    }

    #[test]
    fn subtask_edits_queue_updates() {
        let (mut store, _) = store();
        let task = store.add_task(NewTask::titled("Groceries"));

        let eggs = store.add_subtask(&task.id, " eggs ").unwrap();
        assert_eq!(eggs.title, "eggs");
        store
            .update_subtask(
                &task.id,
                &eggs.id,
                SubtaskChanges {
                    is_completed: Some(true),
                    ..SubtaskChanges::default()
                },
            )
            .unwrap();
        assert!(store.task(&task.id).unwrap().subtasks[0].is_completed);

        store.remove_subtask(&task.id, &eggs.id).unwrap();
        assert!(store.task(&task.id).unwrap().subtasks.is_empty());
        assert!(matches!(
            store.remove_subtask(&task.id, &eggs.id),
            Err(TaskStoreError::SubtaskNotFound { .. })
        ));

        let kinds: Vec<_> = store
            .mutation_queue()
            .iter()
            .map(|m| m.operation.kind())
            .collect();
        assert_eq!(kinds, vec!["create", "update", "update", "update"]);
    }

    #[test]
    fn delete_list_requires_reassignment() {
        let (mut store, _) = store();
        let home = store.create_list("Home", None);
        let work = store.create_list("Work", None);
        let first = store.add_task(NewTask::titled("first"));
        let second = store.add_task(NewTask::titled("second"));

        assert_eq!(
            store.delete_list(&home.id, None),
            Err(TaskStoreError::ListNotEmpty {
                id: home.id.clone(),
                count: 2
            })
        );
        assert_eq!(
            store.delete_list(&home.id, Some(&home.id)),
            Err(TaskStoreError::InvalidReassignment { id: home.id.clone() })
        );

        let moved = store.delete_list(&home.id, Some(&work.id)).unwrap();
        assert_eq!(moved, vec![second.id.clone(), first.id.clone()]);
        assert!(store.list(&home.id).is_none());
        assert_eq!(store.list_order(), &[work.id.clone()]);
        assert_eq!(store.task_order(), &[second.id.clone(), first.id.clone()]);
        assert!(store
            .tasks()
            .all(|t| t.list_id.as_deref() == Some(work.id.as_str())));
    }

    #[test]
    fn delete_list_keeps_display_positions() {
        let (mut store, _) = store();
        let home = store.create_list("Home", None);
        let work = store.create_list("Work", None);
        let a = store.add_task(NewTask::titled("a"));
        let w = store.add_task(NewTask {
            list_id: Some(work.id.clone()),
            ..NewTask::titled("w")
        });
        let b = store.add_task(NewTask::titled("b"));
        let before = store.task_order().to_vec();
        assert_eq!(before, vec![b.id.clone(), w.id.clone(), a.id.clone()]);

        store.delete_list(&home.id, Some(&work.id)).unwrap();

        assert_eq!(store.task_order(), before.as_slice());
        let anchors: Vec<(String, Option<String>)> = store
            .mutation_queue()
            .iter()
            .filter_map(|m| match &m.operation {
                TaskMutationOperation::Move { id, previous_id, .. } => {
                    Some((id.clone(), previous_id.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            anchors,
            vec![(b.id.clone(), None), (a.id.clone(), Some(w.id.clone()))]
        );
        store.check_invariants().unwrap();
    }

    #[test]
    fn empty_list_deletes_without_target() {
        let (mut store, _) = store();
        let list = store.create_list("Someday", Some("#ff0".into()));
        assert!(store.set_list_visibility(&list.id, false).is_ok());
        assert_eq!(store.delete_list(&list.id, None), Ok(vec![]));
        assert!(store.lists().next().is_none());
    }
}
