use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use brisk_core::{
    mutation::{MutationAck, TaskMutation, TaskMutationOperation},
    tasks::Task,
};
use brisk_task::{ReconcileListsOptions, SharedTaskStore, SyncStatus, TaskStore};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::{ProviderError, TaskProvider};

pub const DEFAULT_BATCH_LIMIT: usize = 25;
pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Most mutations pushed per drain.
    pub batch_limit: usize,
    /// Upper bound for any single provider call.
    pub mutation_timeout: Duration,
    /// Pause between cycles of [`SyncWorker::run`].
    pub drain_interval: Duration,
    /// Automatic retry of failed mutations; `None` leaves them for the user.
    pub retry: Option<RetryBackoff>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            mutation_timeout: DEFAULT_MUTATION_TIMEOUT,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            retry: Some(RetryBackoff::default()),
        }
    }
}

/// Exponential delay between a failed attempt and its automatic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            max: DEFAULT_RETRY_MAX,
        }
    }
}

impl RetryBackoff {
    /// `base * 2^(attempts - 1)`, capped at `max`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.max(1) - 1;
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub resolved: usize,
    /// Resolved without a remote call (nothing left to send).
    pub skipped: usize,
    pub failed: usize,
    /// Failed mutations put back in the queue because their backoff ran out.
    pub retried: usize,
    /// The provider rejected the credentials; draining stopped early.
    pub requires_reauth: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub lists: usize,
    pub tasks: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub drained: DrainReport,
    /// `None` when no poll was due.
    pub polled: Option<PollReport>,
}

/// The remote call a queued mutation turns into, resolved against the
/// store at send time so it carries the freshest local state and ids.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RemoteCall {
    Create {
        task: Task,
        list_external_id: Option<String>,
    },
    Update {
        external_id: String,
        task: Task,
    },
    Delete {
        external_id: String,
    },
    Move {
        external_id: String,
        to_list_external_id: String,
        previous_external_id: Option<String>,
    },
}

#[derive(Debug)]
enum Plan {
    Send(RemoteCall),
    Skip(&'static str),
    Fail(String),
}

/// Drives the mutation queue against a [`TaskProvider`] and folds remote
/// snapshots back into the store.
///
/// Each drain follows shift → remote call → resolve / fail. Mutations of
/// one task are never sent concurrently; the queue hands them out one at a
/// time in enqueue order.
#[derive(Clone)]
pub struct SyncWorker {
    store: SharedTaskStore,
    provider: Arc<dyn TaskProvider>,
    settings: WorkerSettings,
}

impl SyncWorker {
    pub fn new(store: SharedTaskStore, provider: Arc<dyn TaskProvider>) -> Self {
        Self {
            store,
            provider,
            settings: WorkerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Push up to `batch_limit` queued mutations.
    ///
    /// A rejected credential releases the mutation back to the queue (the
    /// attempt still counts) and stops the drain. A delete the provider no
    /// longer knows counts as done.
    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn drain_queue(&self) -> DrainReport {
        let mut report = DrainReport {
            retried: self.requeue_due_failures(Utc::now()).await,
            ..DrainReport::default()
        };
        for _ in 0..self.settings.batch_limit {
            let Some(mutation) = self.store.mutate(TaskStore::shift_next_mutation).await else {
                break;
            };

            let call = match self.store.read(|s| plan(s, &mutation)) {
                Plan::Send(call) => call,
                Plan::Skip(reason) => {
                    debug!(mutation_id = %mutation.id, reason, "nothing to send");
                    self.store
                        .mutate(|s| s.resolve_mutation(&mutation.id, None))
                        .await;
                    report.skipped += 1;
                    continue;
                }
                Plan::Fail(reason) => {
                    self.fail(&mutation, reason).await;
                    report.failed += 1;
                    continue;
                }
            };

            match self.timed(self.send(&call)).await {
                Ok(ack) => {
                    self.store
                        .mutate(|s| s.resolve_mutation(&mutation.id, ack))
                        .await;
                    report.resolved += 1;
                }
                Err(ProviderError::Unauthorized) => {
                    warn!(mutation_id = %mutation.id, "provider requires re-authentication");
                    if let Err(err) = self.store.mutate(|s| s.release_mutation(&mutation.id)).await {
                        debug!("release skipped: {err}");
                    }
                    report.requires_reauth = true;
                    break;
                }
                Err(err) => {
                    self.fail(&mutation, err.to_string()).await;
                    report.failed += 1;
                }
            }
        }

        if report != DrainReport::default() {
            info!(
                resolved = report.resolved,
                skipped = report.skipped,
                failed = report.failed,
                retried = report.retried,
                "queue drained"
            );
        }
        report
    }

    /// Put failed mutations whose backoff has run out at `now` back at the
    /// front of the queue, oldest first. Does nothing when automatic retry
    /// is off. Returns how many were requeued.
    pub async fn requeue_due_failures(&self, now: DateTime<Utc>) -> usize {
        let Some(backoff) = self.settings.retry else {
            return 0;
        };
        self.store
            .mutate(|s| {
                let due = s.failed_mutations_due(now, |attempts| {
                    TimeDelta::from_std(backoff.delay_for(attempts)).unwrap_or(TimeDelta::MAX)
                });
                let count = due.len();
                for mutation in due.into_iter().rev() {
                    debug!(mutation_id = %mutation.id, attempts = mutation.attempts, "retrying failed mutation");
                    s.requeue_mutation(mutation);
                }
                count
            })
            .await
    }

    /// Fetch every remote list and its tasks, apply them last-writer-wins,
    /// drop local tasks that vanished remotely and schedule the next poll.
    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn poll_once(&self) -> Result<PollReport, ProviderError> {
        let fetched_at = Utc::now();
        let lists = self.timed(self.provider.fetch_lists()).await?;
        let mut report = PollReport {
            lists: lists.len(),
            ..PollReport::default()
        };
        self.store
            .mutate(|s| s.reconcile_lists(lists.clone(), ReconcileListsOptions::default()))
            .await;

        for list in &lists {
            let mut tasks = self.timed(self.provider.fetch_tasks(list)).await?;
            for task in &mut tasks {
                task.list_id = Some(list.id.clone());
            }
            let remote_ids: HashSet<String> =
                tasks.iter().filter_map(|t| t.external_id.clone()).collect();
            report.tasks += tasks.len();

            let pruned = self
                .store
                .mutate(|s| {
                    s.upsert_remote_tasks(tasks, fetched_at);
                    s.prune_absent_remote_tasks(Some(&list.id), &remote_ids)
                })
                .await;
            report.pruned += pruned.len();
        }

        self.store
            .mutate(|s| {
                let interval = s.poll_interval_ms();
                s.schedule_next_poll(interval);
            })
            .await;
        debug!(?report, "poll complete");
        Ok(report)
    }

    /// One drain plus, when due, one poll. Sync status is kept current
    /// throughout. Only a credential rejection is returned as an error.
    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn run_cycle(&self) -> Result<CycleReport, ProviderError> {
        self.set_status(SyncStatus::Syncing).await;

        let drained = self.drain_queue().await;
        if drained.requires_reauth {
            self.set_status(reauth_status()).await;
            return Err(ProviderError::Unauthorized);
        }

        let mut polled = None;
        let mut status = match drained.failed {
            0 => SyncStatus::Idle,
            n => SyncStatus::Error {
                message: format!("{n} change(s) failed to sync"),
            },
        };
        if self.store.read(|s| s.is_poll_due(Utc::now())) {
            match self.poll_once().await {
                Ok(report) => polled = Some(report),
                Err(ProviderError::Unauthorized) => {
                    self.set_status(reauth_status()).await;
                    return Err(ProviderError::Unauthorized);
                }
                Err(err) => {
                    warn!("poll failed: {err}");
                    self.store
                        .mutate(|s| {
                            let interval = s.poll_interval_ms();
                            s.schedule_next_poll(interval);
                        })
                        .await;
                    status = SyncStatus::Error {
                        message: err.to_string(),
                    };
                }
            }
        }

        self.set_status(status).await;
        Ok(CycleReport { drained, polled })
    }

    /// Run cycles until `shutdown` flips to `true` (or its sender is
    /// dropped). Returns `Err(Unauthorized)` when the provider rejects the
    /// credentials; queued work is kept for the next session.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProviderError> {
        self.store.mutate(|s| s.register_poller_active(true)).await;
        info!(provider = self.provider.name(), "sync worker started");

        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            if let Err(err) = self.run_cycle().await {
                break Err(err);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.drain_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.store.mutate(|s| s.register_poller_active(false)).await;
        info!(provider = self.provider.name(), "sync worker stopped");
        outcome
    }

    async fn send(&self, call: &RemoteCall) -> Result<Option<MutationAck>, ProviderError> {
        match call {
            RemoteCall::Create {
                task,
                list_external_id,
            } => self
                .provider
                .create_task(task, list_external_id.as_deref())
                .await
                .map(Some),
            RemoteCall::Update { external_id, task } => self
                .provider
                .update_task(external_id, task)
                .await
                .map(|()| None),
            RemoteCall::Delete { external_id } => {
                match self.provider.delete_task(external_id).await {
                    Err(ProviderError::NotFound(_)) => Ok(None),
                    other => other.map(|()| None),
                }
            }
            RemoteCall::Move {
                external_id,
                to_list_external_id,
                previous_external_id,
            } => self
                .provider
                .move_task(
                    external_id,
                    to_list_external_id,
                    previous_external_id.as_deref(),
                )
                .await
                .map(Some),
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let limit = self.settings.mutation_timeout;
        tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(ProviderError::Remote(format!(
                "timed out after {} ms",
                limit.as_millis()
            )))
        })
    }

    async fn fail(&self, mutation: &TaskMutation, reason: String) {
        if let Err(err) = self
            .store
            .mutate(|s| s.fail_mutation(&mutation.id, reason))
            .await
        {
            debug!("fail skipped: {err}");
        }
    }

    async fn set_status(&self, status: SyncStatus) {
        self.store.mutate(|s| s.set_sync_status(status)).await;
    }
}

fn reauth_status() -> SyncStatus {
    SyncStatus::Error {
        message: ProviderError::Unauthorized.to_string(),
    }
}

fn plan(store: &TaskStore, mutation: &TaskMutation) -> Plan {
    match &mutation.operation {
        TaskMutationOperation::Create { task } => match store.task(&task.id) {
            // A later delete is queued; it will find no remote id either.
            None => Plan::Skip("task deleted before it reached the remote"),
            Some(current) => Plan::Send(RemoteCall::Create {
                task: current.clone(),
                list_external_id: current
                    .list_id
                    .as_deref()
                    .and_then(|id| list_external_id(store, id)),
            }),
        },
        TaskMutationOperation::Update { id, .. } => match store.task(id) {
            None => Plan::Skip("task deleted locally"),
            Some(task) => match &task.external_id {
                Some(external_id) => Plan::Send(RemoteCall::Update {
                    external_id: external_id.clone(),
                    task: task.clone(),
                }),
                None => Plan::Fail(format!("task {id} has no remote id")),
            },
        },
        TaskMutationOperation::Delete { external_id, .. } => match external_id {
            Some(external_id) => Plan::Send(RemoteCall::Delete {
                external_id: external_id.clone(),
            }),
            None => Plan::Skip("task never reached the remote"),
        },
        TaskMutationOperation::Move {
            id,
            to_list_id,
            previous_id,
            external_id,
            ..
        } => {
            let local = store.task(id);
            let Some(external_id) = external_id
                .clone()
                .or_else(|| local.and_then(|t| t.external_id.clone()))
            else {
                return match local {
                    None => Plan::Skip("task deleted locally"),
                    Some(_) => Plan::Fail(format!("task {id} has no remote id")),
                };
            };
            let Some(to_list_external_id) = list_external_id(store, to_list_id) else {
                return Plan::Fail(format!("list {to_list_id} does not exist remotely"));
            };
            Plan::Send(RemoteCall::Move {
                external_id,
                to_list_external_id,
                previous_external_id: previous_id
                    .as_deref()
                    .and_then(|prev| store.task(prev))
                    .and_then(|t| t.external_id.clone()),
            })
        }
    }
}

fn list_external_id(store: &TaskStore, list_id: &str) -> Option<String> {
    store.list(list_id).and_then(|l| l.external_id.clone())
}
