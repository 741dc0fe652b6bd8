//! Remote provider boundary and the background worker that drains the
//! mutation queue and pulls remote snapshots into the task store.

mod provider;
mod worker;

pub use provider::{InMemoryProvider, NoopProvider, ProviderError, TaskProvider};
pub use worker::{
    CycleReport, DrainReport, PollReport, RetryBackoff, SyncWorker, WorkerSettings,
    DEFAULT_BATCH_LIMIT, DEFAULT_DRAIN_INTERVAL, DEFAULT_MUTATION_TIMEOUT, DEFAULT_RETRY_BASE,
    DEFAULT_RETRY_MAX,
};
