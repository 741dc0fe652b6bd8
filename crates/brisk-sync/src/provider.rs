use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use brisk_core::{
    mutation::MutationAck,
    tasks::{ListSource, Task, TaskList},
};
use chrono::Utc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

/// Failures a remote provider can report. The worker turns all of them
/// into queue state; none escape to the caller of a store mutator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials were rejected; syncing must stop until re-auth.
    #[error("provider rejected the credentials")]
    Unauthorized,
    #[error("remote entity not found: {0}")]
    NotFound(String),
    #[error("remote call failed: {0}")]
    Remote(String),
}

/// Remote task service the sync worker pushes to and pulls from.
///
/// Ids passed in are remote ids (`external_id`). Tasks returned from
/// `fetch_tasks` carry their remote id in `external_id`; their `id` may be
/// anything, the store matches on the remote id.
#[async_trait]
pub trait TaskProvider: Send + Sync {
    /// Human-readable provider name for logs.
    fn name(&self) -> &'static str;

    async fn fetch_lists(&self) -> Result<Vec<TaskList>, ProviderError>;

    async fn fetch_tasks(&self, list: &TaskList) -> Result<Vec<Task>, ProviderError>;

    /// Create a task remotely; the ack carries the new remote id.
    async fn create_task(
        &self,
        task: &Task,
        list_external_id: Option<&str>,
    ) -> Result<MutationAck, ProviderError>;

    async fn update_task(&self, external_id: &str, task: &Task) -> Result<(), ProviderError>;

    async fn delete_task(&self, external_id: &str) -> Result<(), ProviderError>;

    /// Move a task to another list, after `previous_external_id` (or first).
    /// Providers that re-create on move return the new remote id.
    async fn move_task(
        &self,
        external_id: &str,
        to_list_external_id: &str,
        previous_external_id: Option<&str>,
    ) -> Result<MutationAck, ProviderError>;
}

/// Accepts every write and has nothing to fetch. Creates are acked with the
/// local id as remote id.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvider;

#[async_trait]
impl TaskProvider for NoopProvider {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn fetch_lists(&self) -> Result<Vec<TaskList>, ProviderError> {
        Ok(Vec::new())
    }

    async fn fetch_tasks(&self, _list: &TaskList) -> Result<Vec<Task>, ProviderError> {
        Ok(Vec::new())
    }

    #[instrument(skip_all)]
    async fn create_task(
        &self,
        task: &Task,
        _list_external_id: Option<&str>,
    ) -> Result<MutationAck, ProviderError> {
        Ok(MutationAck::with_external_id(task.id.clone()))
    }

    async fn update_task(&self, _external_id: &str, _task: &Task) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn delete_task(&self, _external_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn move_task(
        &self,
        _external_id: &str,
        _to_list_external_id: &str,
        _previous_external_id: Option<&str>,
    ) -> Result<MutationAck, ProviderError> {
        Ok(MutationAck::default())
    }
}

/// A remote held in process memory, for tests and offline smoke runs.
///
/// Clones share state. Failures can be scripted with [`fail_next`]; each
/// scripted error is returned by exactly one subsequent call.
///
/// [`fail_next`]: InMemoryProvider::fail_next
#[derive(Debug, Default, Clone)]
pub struct InMemoryProvider {
    inner: Arc<Mutex<RemoteState>>,
}

#[derive(Debug, Default)]
struct RemoteState {
    lists: Vec<TaskList>,
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    failures: VecDeque<ProviderError>,
    calls: Vec<String>,
    latency: Duration,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a remote list; returns its remote id.
    pub fn add_list(&self, name: &str) -> String {
        let mut list = TaskList::local(name, None);
        list.id = format!("rl-{}", Uuid::new_v4());
        list.external_id = Some(list.id.clone());
        list.source = ListSource::Remote;
        let id = list.id.clone();
        self.state().lists.push(list);
        id
    }

    /// Insert a task as if another client had created it; returns its remote id.
    pub fn seed_task(&self, list_external_id: &str, title: &str) -> String {
        let mut task = Task::new(title);
        let external_id = format!("rt-{}", Uuid::new_v4());
        task.external_id = Some(external_id.clone());
        task.list_id = Some(list_external_id.to_string());
        let mut state = self.state();
        state.order.push(external_id.clone());
        state.tasks.insert(external_id.clone(), task);
        external_id
    }

    pub fn remove_task(&self, external_id: &str) {
        let mut state = self.state();
        state.tasks.remove(external_id);
        state.order.retain(|id| id != external_id);
    }

    pub fn task(&self, external_id: &str) -> Option<Task> {
        self.state().tasks.get(external_id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.state().tasks.len()
    }

    /// Delay every call by `latency` before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn fail_next(&self, error: ProviderError) {
        self.state().failures.push_back(error);
    }

    /// Names of the calls received so far, e.g. `"create:Buy milk"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn begin(&self, call: String) -> Result<MutexGuard<'_, RemoteState>, ProviderError> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        state.calls.push(call);
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl TaskProvider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_lists(&self) -> Result<Vec<TaskList>, ProviderError> {
        let state = self.begin("fetch_lists".into()).await?;
        Ok(state.lists.clone())
    }

    async fn fetch_tasks(&self, list: &TaskList) -> Result<Vec<Task>, ProviderError> {
        let state = self.begin(format!("fetch_tasks:{}", list.name)).await?;
        let remote_list = list.external_id.as_deref().unwrap_or(&list.id);
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.list_id.as_deref() == Some(remote_list))
            .cloned()
            .collect())
    }

    async fn create_task(
        &self,
        task: &Task,
        list_external_id: Option<&str>,
    ) -> Result<MutationAck, ProviderError> {
        let mut state = self.begin(format!("create:{}", task.title)).await?;
        let external_id = format!("rt-{}", Uuid::new_v4());
        let mut remote = task.clone();
        remote.external_id = Some(external_id.clone());
        remote.list_id = list_external_id
            .map(str::to_string)
            .or_else(|| state.lists.first().map(|l| l.id.clone()));
        remote.updated_at = Utc::now();
        state.order.push(external_id.clone());
        state.tasks.insert(external_id.clone(), remote);
        Ok(MutationAck::with_external_id(external_id))
    }

    async fn update_task(&self, external_id: &str, task: &Task) -> Result<(), ProviderError> {
        let mut state = self.begin(format!("update:{}", task.title)).await?;
        let remote = state
            .tasks
            .get_mut(external_id)
            .ok_or_else(|| ProviderError::NotFound(external_id.to_string()))?;
        let list_id = remote.list_id.clone();
        *remote = task.clone();
        remote.external_id = Some(external_id.to_string());
        remote.list_id = list_id;
        remote.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_task(&self, external_id: &str) -> Result<(), ProviderError> {
        let mut state = self.begin(format!("delete:{external_id}")).await?;
        if state.tasks.remove(external_id).is_none() {
            return Err(ProviderError::NotFound(external_id.to_string()));
        }
        state.order.retain(|id| id != external_id);
        Ok(())
    }

    async fn move_task(
        &self,
        external_id: &str,
        to_list_external_id: &str,
        previous_external_id: Option<&str>,
    ) -> Result<MutationAck, ProviderError> {
        let mut state = self.begin(format!("move:{external_id}")).await?;
        let remote = state
            .tasks
            .get_mut(external_id)
            .ok_or_else(|| ProviderError::NotFound(external_id.to_string()))?;
        remote.list_id = Some(to_list_external_id.to_string());

        state.order.retain(|id| id != external_id);
        let at = previous_external_id
            .and_then(|prev| state.order.iter().position(|id| id == prev))
            .map_or(0, |pos| pos + 1);
        state.order.insert(at, external_id.to_string());
        Ok(MutationAck::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_acks_everything() {
        let provider = NoopProvider;
        let task = Task::new("a");
        assert_eq!(provider.name(), "noop");
        assert!(provider.fetch_lists().await.unwrap().is_empty());
        let ack = provider.create_task(&task, None).await.unwrap();
        assert_eq!(ack.external_id.as_deref(), Some(task.id.as_str()));
        provider.delete_task("x").await.unwrap();
    }

    #[tokio::test]
    async fn memory_provider_round_trip() {
        let provider = InMemoryProvider::new();
        let list_id = provider.add_list("Inbox");
        let lists = provider.fetch_lists().await.unwrap();

        let ack = provider
            .create_task(&Task::new("Buy milk"), Some(&list_id))
            .await
            .unwrap();
        let external_id = ack.external_id.unwrap();
        let fetched = provider.fetch_tasks(&lists[0]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].external_id.as_deref(), Some(external_id.as_str()));

        provider.delete_task(&external_id).await.unwrap();
        assert_eq!(
            provider.delete_task(&external_id).await,
            Err(ProviderError::NotFound(external_id))
        );
    }

    #[tokio::test]
    async fn scripted_failures_fire_once() {
        let provider = InMemoryProvider::new();
        provider.fail_next(ProviderError::Unauthorized);
        assert_eq!(
            provider.fetch_lists().await,
            Err(ProviderError::Unauthorized)
        );
        assert!(provider.fetch_lists().await.is_ok());
        assert_eq!(provider.calls(), vec!["fetch_lists", "fetch_lists"]);
    }
}
