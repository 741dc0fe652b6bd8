use brisk_core::{
    mutation::{MutationState, TaskMutation},
    tasks::{NewTask, SyncState, Task, TaskChanges, TaskLabel, TaskList},
};
use brisk_task::{SharedTaskStore, SubtaskChanges, TaskStore};
use color_eyre::{eyre::eyre, Result};

use crate::cli::{AddTask, ListCommand, QueueCommand, SubtaskCommand, TaskCommand};

/// Shortest id prefix shown in listings.
const SHORT_ID: usize = 8;

/// Execute a task subcommand against the shared store.
pub async fn handle(cmd: TaskCommand, store: &SharedTaskStore) -> Result<()> {
    match cmd {
        TaskCommand::List { list, all } => {
            let list_id = list
                .map(|prefix| store.read(|s| list_id(s, &prefix)))
                .transpose()?;
            let lines = store.read(|s| render_tasks(s, list_id.as_deref(), all));
            if lines.is_empty() {
                println!("No tasks yet. Add one with `brisk task add <title>`.");
            }
            for line in lines {
                println!("{line}");
            }
        }
        TaskCommand::Add(add) => {
            let task = add_task(store, add).await?;
            println!("Created task {}: {}", short(&task.id), task.title);
        }
        TaskCommand::Edit {
            id,
            title,
            description,
            priority,
        } => {
            let id = store.read(|s| task_id(s, &id))?;
            let changes = TaskChanges {
                title,
                description: description.map(|d| Some(d).filter(|d| !d.is_empty())),
                priority,
                ..TaskChanges::default()
            };
            if changes.is_empty() {
                return Err(eyre!("nothing to change; pass --title, --description or --priority"));
            }
            let task = store.mutate(|s| s.update_task(&id, changes)).await?;
            println!("Updated: {}", task.title);
        }
        TaskCommand::Done { id } => {
            let id = store.read(|s| task_id(s, &id))?;
            let task = store.mutate(|s| s.toggle_task_completion(&id)).await?;
            let verb = if task.is_completed { "Completed" } else { "Reopened" };
            println!("{verb}: {}", task.title);
        }
        TaskCommand::Delete { id } => {
            let id = store.read(|s| task_id(s, &id))?;
            let task = store.mutate(|s| s.delete_task(&id)).await?;
            println!("Deleted: {}", task.title);
        }
        TaskCommand::Due { id, date } => {
            let id = store.read(|s| task_id(s, &id))?;
            let task = store.mutate(|s| s.set_task_due_date(&id, date)).await?;
            match task.due_date {
                Some(due) => println!("{} is due {due}", task.title),
                None => println!("{} has no due date", task.title),
            }
        }
        TaskCommand::Duplicate { id } => {
            let id = store.read(|s| task_id(s, &id))?;
            let copy = store
                .mutate(|s| s.duplicate_task(&id))
                .await
                .ok_or_else(|| eyre!("task {id} disappeared"))?;
            println!("Created task {}: {}", short(&copy.id), copy.title);
        }
        TaskCommand::Move { id, list, after } => {
            let (id, list, after) = store.read(|s| -> Result<_> {
                let after = after.map(|prefix| task_id(s, &prefix)).transpose()?;
                Ok((task_id(s, &id)?, list_id(s, &list)?, after))
            })?;
            let task = store
                .mutate(|s| s.move_task(&id, &list, after.as_deref()))
                .await?;
            println!("Moved: {}", task.title);
        }
        TaskCommand::Subtask(cmd) => handle_subtask(cmd, store).await?,
    }
    Ok(())
}

pub async fn add_task(store: &SharedTaskStore, add: AddTask) -> Result<Task> {
    if add.title.trim().is_empty() {
        return Err(eyre!("title must not be empty"));
    }
    let list_id = add
        .list
        .map(|prefix| store.read(|s| list_id(s, &prefix)))
        .transpose()?;
    let input = NewTask {
        title: add.title,
        description: add.description,
        priority: add.priority,
        due_date: add.due,
        labels: add.labels.into_iter().map(TaskLabel::new).collect(),
        list_id,
        ..NewTask::default()
    };
    Ok(store.mutate(|s| s.add_task(input)).await)
}

async fn handle_subtask(cmd: SubtaskCommand, store: &SharedTaskStore) -> Result<()> {
    match cmd {
        SubtaskCommand::Add { task, title } => {
            let id = store.read(|s| task_id(s, &task))?;
            let subtask = store.mutate(|s| s.add_subtask(&id, &title)).await?;
            println!("Added subtask {}: {}", short(&subtask.id), subtask.title);
        }
        SubtaskCommand::Done { task, subtask } => {
            let (id, subtask_id, done) = store.read(|s| -> Result<_> {
                let id = task_id(s, &task)?;
                let found = subtask_of(s, &id, &subtask)?;
                Ok((id, found.id.clone(), found.is_completed))
            })?;
            let changes = SubtaskChanges {
                is_completed: Some(!done),
                ..SubtaskChanges::default()
            };
            let updated = store
                .mutate(|s| s.update_subtask(&id, &subtask_id, changes))
                .await?;
            println!("{} {}", checkbox(updated.is_completed), updated.title);
        }
        SubtaskCommand::Remove { task, subtask } => {
            let (id, subtask_id) = store.read(|s| -> Result<_> {
                let id = task_id(s, &task)?;
                let found = subtask_of(s, &id, &subtask)?.id.clone();
                Ok((id, found))
            })?;
            store.mutate(|s| s.remove_subtask(&id, &subtask_id)).await?;
            println!("Removed subtask {}", short(&subtask_id));
        }
    }
    Ok(())
}

pub async fn handle_list(cmd: ListCommand, store: &SharedTaskStore) -> Result<()> {
    match cmd {
        ListCommand::List => {
            let lines = store.read(render_lists);
            if lines.is_empty() {
                println!("No lists yet. Add one with `brisk list add <name>`.");
            }
            for line in lines {
                println!("{line}");
            }
        }
        ListCommand::Add { name, color } => {
            if name.trim().is_empty() {
                return Err(eyre!("list name must not be empty"));
            }
            let list = store.mutate(|s| s.create_list(name.trim(), color)).await;
            println!("Created list {}: {}", short(&list.id), list.name);
        }
        ListCommand::Hide { id } => set_visibility(store, &id, false).await?,
        ListCommand::Show { id } => set_visibility(store, &id, true).await?,
        ListCommand::Delete { id, reassign } => {
            let (id, reassign) = store.read(|s| -> Result<_> {
                let reassign = reassign.map(|prefix| list_id(s, &prefix)).transpose()?;
                Ok((list_id(s, &id)?, reassign))
            })?;
            let moved = store
                .mutate(|s| s.delete_list(&id, reassign.as_deref()))
                .await?;
            println!("Deleted list {}; moved {} task(s)", short(&id), moved.len());
        }
    }
    Ok(())
}

async fn set_visibility(store: &SharedTaskStore, prefix: &str, visible: bool) -> Result<()> {
    let id = store.read(|s| list_id(s, prefix))?;
    let list = store.mutate(|s| s.set_list_visibility(&id, visible)).await?;
    let state = if list.is_visible { "shown" } else { "hidden" };
    println!("{} is now {state}", list.name);
    Ok(())
}

pub async fn handle_queue(cmd: QueueCommand, store: &SharedTaskStore) -> Result<()> {
    match cmd {
        QueueCommand::List => {
            let lines = store.read(|s| s.mutation_queue().iter().map(render_mutation).collect::<Vec<_>>());
            if lines.is_empty() {
                println!("Queue is empty; everything is synced.");
            }
            for line in lines {
                println!("{line}");
            }
        }
        QueueCommand::Retry { id } => {
            let failed: Vec<TaskMutation> = store.read(|s| -> Result<_> {
                match id {
                    Some(prefix) => {
                        let id = mutation_id(s, &prefix)?;
                        match s.mutation(&id) {
                            Some(m) if m.state == MutationState::Failed => Ok(vec![m.clone()]),
                            Some(_) => Err(eyre!("change {} has not failed", short(&id))),
                            None => Err(eyre!("no queued change matches '{prefix}'")),
                        }
                    }
                    None => Ok(s
                        .mutation_queue()
                        .iter()
                        .filter(|m| m.state == MutationState::Failed)
                        .cloned()
                        .collect()),
                }
            })?;
            let count = failed.len();
            store
                .mutate(|s| {
                    // Reverse so the oldest failure ends up at the very front.
                    for mutation in failed.into_iter().rev() {
                        s.requeue_mutation(mutation);
                    }
                })
                .await;
            println!("Requeued {count} change(s)");
        }
        QueueCommand::ClearFailed => {
            let removed = store.mutate(TaskStore::clear_failed_mutations).await;
            println!("Dropped {removed} failed change(s)");
        }
    }
    Ok(())
}

fn render_tasks(store: &TaskStore, list_id: Option<&str>, include_done: bool) -> Vec<String> {
    let mut lines = Vec::new();
    for task in store
        .tasks()
        .filter(|t| list_id.is_none() || t.list_id.as_deref() == list_id)
        .filter(|t| include_done || !t.is_completed)
    {
        lines.push(render_task(task));
        if let Some(desc) = &task.description {
            lines.push(format!("    {desc}"));
        }
        for subtask in &task.subtasks {
            lines.push(format!(
                "    {} {} {}",
                checkbox(subtask.is_completed),
                short(&subtask.id),
                subtask.title
            ));
        }
    }
    lines
}

fn render_task(task: &Task) -> String {
    let mut line = format!(
        "{} {} {}",
        short(&task.id),
        checkbox(task.is_completed),
        task.title
    );
    if task.priority != brisk_core::tasks::Priority::None {
        line.push_str(&format!(" !{}", task.priority));
    }
    if let Some(due) = task.due_date {
        line.push_str(&format!(" (due {due})"));
    }
    if !task.labels.is_empty() {
        let names: Vec<&str> = task.labels.iter().map(|l| l.name.as_str()).collect();
        line.push_str(&format!(" #{}", names.join(" #")));
    }
    match task.sync_state {
        SyncState::Idle => {}
        SyncState::Error => line.push_str(&format!(
            " [sync error: {}]",
            task.sync_error.as_deref().unwrap_or("unknown")
        )),
        state => line.push_str(&format!(" [{}]", state.as_str())),
    }
    if task.has_conflict {
        line.push_str(" [overwritten by remote]");
    }
    line
}

fn render_lists(store: &TaskStore) -> Vec<String> {
    store
        .lists()
        .map(|list: &TaskList| {
            let count = store
                .tasks()
                .filter(|t| t.list_id.as_deref() == Some(list.id.as_str()))
                .count();
            let hidden = if list.is_visible { "" } else { " (hidden)" };
            format!("{} {} [{count}]{hidden}", short(&list.id), list.name)
        })
        .collect()
}

fn render_mutation(mutation: &TaskMutation) -> String {
    let state = match mutation.state {
        MutationState::Queued => "queued",
        MutationState::InFlight => "in flight",
        MutationState::Failed => "failed",
    };
    let mut line = format!(
        "{} {} task {} ({state}, {} attempt(s))",
        short(&mutation.id),
        mutation.operation.kind(),
        short(mutation.task_id()),
        mutation.attempts
    );
    if let Some(err) = &mutation.last_error {
        line.push_str(&format!(": {err}"));
    }
    line
}

fn checkbox(done: bool) -> &'static str {
    if done {
        "[x]"
    } else {
        "[ ]"
    }
}

fn short(id: &str) -> &str {
    id.get(..SHORT_ID).unwrap_or(id)
}

fn task_id(store: &TaskStore, prefix: &str) -> Result<String> {
    resolve_prefix("task", prefix, store.tasks().map(|t| t.id.as_str()))
}

fn list_id(store: &TaskStore, prefix: &str) -> Result<String> {
    resolve_prefix("list", prefix, store.lists().map(|l| l.id.as_str()))
}

fn mutation_id(store: &TaskStore, prefix: &str) -> Result<String> {
    resolve_prefix(
        "queued change",
        prefix,
        store.mutation_queue().iter().map(|m| m.id.as_str()),
    )
}

fn subtask_of<'a>(
    store: &'a TaskStore,
    task_id: &str,
    prefix: &str,
) -> Result<&'a brisk_core::tasks::Subtask> {
    let task = store
        .task(task_id)
        .ok_or_else(|| eyre!("task {task_id} not found"))?;
    let id = resolve_prefix("subtask", prefix, task.subtasks.iter().map(|s| s.id.as_str()))?;
    task.subtasks
        .iter()
        .find(|s| s.id == id)
        .ok_or_else(|| eyre!("subtask {id} not found"))
}

/// Exact match wins; otherwise the prefix must pick exactly one id.
fn resolve_prefix<'a>(
    kind: &str,
    prefix: &str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<String> {
    let candidates: Vec<&str> = ids.filter(|id| id.starts_with(prefix)).collect();
    if let Some(exact) = candidates.iter().find(|id| **id == prefix) {
        return Ok(exact.to_string());
    }
    match candidates.as_slice() {
        [] => Err(eyre!("no {kind} matches '{prefix}'")),
        [only] => Ok(only.to_string()),
        many => Err(eyre!(
            "'{prefix}' matches {} {kind}s; use a longer id",
            many.len()
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use brisk_core::{events::RecordingObserver, tasks::Priority};
    use chrono::NaiveDate;

    use super::*;

    fn store() -> SharedTaskStore {
        SharedTaskStore::new(TaskStore::with_observer(Arc::new(RecordingObserver::new())))
    }

    fn add(title: &str) -> AddTask {
        AddTask {
            title: title.into(),
            description: None,
            priority: None,
            due: None,
            list: None,
            labels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn add_and_complete_by_prefix() {
        let store = store();
        let task = add_task(
            &store,
            AddTask {
                priority: Some(Priority::High),
                labels: vec!["home".into(), " Home ".into()],
                ..add("Buy milk")
            },
        )
        .await
        .expect("add");
        assert_eq!(task.labels.len(), 1);

        handle(
            TaskCommand::Done {
                id: task.id[..6].to_string(),
            },
            &store,
        )
        .await
        .expect("done");
        assert!(store.read(|s| s.task(&task.id).map(|t| t.is_completed)) == Some(true));
        assert_eq!(store.read(|s| s.mutation_queue().len()), 2);
    }

    #[tokio::test]
    async fn blank_titles_are_rejected() {
        let store = store();
        assert!(add_task(&store, add("   ")).await.is_err());
        assert_eq!(store.read(TaskStore::task_count), 0);
    }

    #[tokio::test]
    async fn due_date_set_and_cleared() {
        let store = store();
        let task = add_task(&store, add("File taxes")).await.expect("add");
        let date = NaiveDate::from_ymd_opt(2024, 4, 15);

        handle(TaskCommand::Due { id: task.id.clone(), date }, &store)
            .await
            .expect("due");
        assert_eq!(store.read(|s| s.task(&task.id).and_then(|t| t.due_date)), date);

        handle(TaskCommand::Due { id: task.id.clone(), date: None }, &store)
            .await
            .expect("clear");
        assert_eq!(store.read(|s| s.task(&task.id).and_then(|t| t.due_date)), None);
    }

    #[tokio::test]
    async fn list_delete_with_reassign_moves_tasks() {
        let store = store();
        handle_list(ListCommand::Add { name: "Home".into(), color: None }, &store)
            .await
            .expect("add list");
        handle_list(ListCommand::Add { name: "Work".into(), color: None }, &store)
            .await
            .expect("add list");
        let (home, work) = store.read(|s| (s.list_order()[0].clone(), s.list_order()[1].clone()));
        let task = add_task(&store, AddTask { list: Some(home.clone()), ..add("a") })
            .await
            .expect("add");

        let refused = handle_list(ListCommand::Delete { id: home.clone(), reassign: None }, &store).await;
        assert!(refused.is_err());

        handle_list(
            ListCommand::Delete {
                id: home.clone(),
                reassign: Some(work.clone()),
            },
            &store,
        )
        .await
        .expect("delete");
        store.read(|s| {
            assert!(s.list(&home).is_none());
            assert_eq!(s.task(&task.id).and_then(|t| t.list_id.clone()), Some(work.clone()));
        });
    }

    #[tokio::test]
    async fn retry_requeues_failed_changes() {
        let store = store();
        let task = add_task(&store, add("a")).await.expect("add");
        let shifted = store.mutate(|s| s.shift_next_mutation()).await.expect("shift");
        store
            .mutate(|s| s.fail_mutation(&shifted.id, "offline"))
            .await
            .expect("fail");

        handle_queue(QueueCommand::Retry { id: None }, &store)
            .await
            .expect("retry");
        store.read(|s| {
            assert_eq!(s.mutation_queue()[0].state, MutationState::Queued);
            assert_eq!(s.task(&task.id).map(|t| t.sync_state), Some(SyncState::Pending));
        });
    }

    #[tokio::test]
    async fn subtasks_toggle_by_prefix() {
        let store = store();
        let task = add_task(&store, add("Pack")).await.expect("add");
        handle(
            TaskCommand::Subtask(SubtaskCommand::Add {
                task: task.id.clone(),
                title: "socks".into(),
            }),
            &store,
        )
        .await
        .expect("add subtask");
        let subtask_id = store
            .read(|s| s.task(&task.id).map(|t| t.subtasks[0].id.clone()))
            .expect("subtask");

        handle(
            TaskCommand::Subtask(SubtaskCommand::Done {
                task: task.id.clone(),
                subtask: subtask_id[..8].to_string(),
            }),
            &store,
        )
        .await
        .expect("toggle");
        assert_eq!(
            store.read(|s| s.task(&task.id).map(|t| t.subtasks[0].is_completed)),
            Some(true)
        );
    }

    #[test]
    fn prefix_resolution() {
        let ids = ["abc1", "abc2", "xyz"];
        assert_eq!(resolve_prefix("task", "x", ids.into_iter()).unwrap(), "xyz");
        assert!(resolve_prefix("task", "abc", ids.into_iter()).is_err());
        assert!(resolve_prefix("task", "nope", ids.into_iter()).is_err());
        let nested = ["ab", "abc"];
        assert_eq!(resolve_prefix("task", "ab", nested.into_iter()).unwrap(), "ab");
    }

    #[test]
    fn renders_sync_markers() {
        let mut task = Task::new("Call bank");
        task.sync_state = SyncState::Error;
        task.sync_error = Some("offline".into());
        task.has_conflict = true;
        let line = render_task(&task);
        assert!(line.contains("[sync error: offline]"));
        assert!(line.contains("[overwritten by remote]"));
    }
}
