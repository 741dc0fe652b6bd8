use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::TaskStore;

/// Sync lifecycle as reported by the worker. Not persisted.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error {
        message: String,
    },
}

/// Scheduling blackboard shared with the background worker. The store
/// never runs timers itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PollerState {
    pub(crate) active: bool,
    pub(crate) next_poll_at: Option<DateTime<Utc>>,
}

impl TaskStore {
    pub fn register_poller_active(&mut self, active: bool) {
        self.poller.active = active;
        if !active {
            self.poller.next_poll_at = None;
        }
    }

    pub fn poller_active(&self) -> bool {
        self.poller.active
    }

    /// Record that the next poll should happen `delay_ms` from now.
    pub fn schedule_next_poll(&mut self, delay_ms: u64) -> DateTime<Utc> {
        let delay = i64::try_from(delay_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX);
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.poller.next_poll_at = Some(at);
        debug!(next_poll_at = %at, "poll scheduled");
        at
    }

    pub fn next_poll_at(&self) -> Option<DateTime<Utc>> {
        self.poller.next_poll_at
    }

    /// True when no poll is scheduled or the scheduled time has passed.
    pub fn is_poll_due(&self, now: DateTime<Utc>) -> bool {
        self.poller.next_poll_at.is_none_or(|at| at <= now)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn set_poll_interval(&mut self, interval_ms: u64) {
        self.poll_interval_ms = interval_ms;
    }

    pub fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = status;
    }

    pub fn sync_status(&self) -> &SyncStatus {
        &self.sync_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedules_relative_to_now() {
        let mut store = TaskStore::new();
        let before = Utc::now();
        let at = store.schedule_next_poll(30_000);

        assert!(at >= before + Duration::milliseconds(30_000));
        assert_eq!(store.next_poll_at(), Some(at));
        assert!(!store.is_poll_due(before));
        assert!(store.is_poll_due(at));
    }

    #[test]
    fn huge_delay_saturates() {
        let mut store = TaskStore::new();
        let at = store.schedule_next_poll(u64::MAX);
        assert!(at > Utc::now());
    }

    #[test]
    fn deactivating_clears_schedule() {
        let mut store = TaskStore::new();
        store.register_poller_active(true);
        store.schedule_next_poll(1_000);
        assert!(store.poller_active());

        store.register_poller_active(false);
        assert!(!store.poller_active());
        assert!(store.next_poll_at().is_none());
        assert!(store.is_poll_due(Utc::now()));
    }

    #[test]
    fn tracks_sync_status() {
        let mut store = TaskStore::new();
        assert_eq!(store.sync_status(), &SyncStatus::Idle);
        store.set_sync_status(SyncStatus::Error {
            message: "offline".into(),
        });
        assert_eq!(
            store.sync_status(),
            &SyncStatus::Error {
                message: "offline".into()
            }
        );
    }
}
