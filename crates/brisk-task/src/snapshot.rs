//! Versioned encoding of the persisted store state.
//!
//! # Format
//! A JSON envelope `{"version": N, "state": {...}}`. `state` holds the
//! fields of [`StoreSnapshot`].
//!
//! # Invariants
//! - `SCHEMA_VERSION` only ever increases.
//! - Every version below `SCHEMA_VERSION` has exactly one migration step in
//!   `MIGRATIONS`, applied in order before the state is deserialized.
//! - Snapshots written by a newer binary are rejected, never guessed at.

use std::collections::HashMap;

use brisk_core::{
    mutation::TaskMutation,
    tasks::{Task, TaskList},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::DEFAULT_POLL_INTERVAL_MS;

pub const SCHEMA_VERSION: u32 = 3;

/// The subset of store state needed to resume safely after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub tasks_by_id: HashMap<String, Task>,
    pub task_order: Vec<String>,
    pub lists_by_id: HashMap<String, TaskList>,
    pub list_order: Vec<String>,
    pub mutation_queue: Vec<TaskMutation>,
    pub pending_by_task_id: HashMap<String, String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("snapshot envelope is malformed: {0}")]
    Malformed(&'static str),
    #[error("snapshot has no schema version")]
    MissingVersion,
    #[error("snapshot schema version {found} is not supported (latest is {latest})")]
    UnsupportedVersion { found: u32, latest: u32 },
    #[error("migration from schema version {from} failed: {reason}")]
    Migration { from: u32, reason: String },
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    state: &'a StoreSnapshot,
}

struct Migration {
    from: u32,
    apply: fn(Map<String, Value>) -> Result<Map<String, Value>, String>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 1,
        apply: v1_to_v2,
    },
    Migration {
        from: 2,
        apply: v2_to_v3,
    },
];

pub fn encode_snapshot(snapshot: &StoreSnapshot) -> Result<Vec<u8>, SnapshotError> {
    serde_json::to_vec(&Envelope {
        version: SCHEMA_VERSION,
        state: snapshot,
    })
    .map_err(SnapshotError::Encode)
}

/// Decode a snapshot, migrating older schema versions first.
pub fn decode_snapshot(bytes: &[u8]) -> Result<StoreSnapshot, SnapshotError> {
    let envelope: Value = serde_json::from_slice(bytes).map_err(SnapshotError::Decode)?;
    let Value::Object(mut envelope) = envelope else {
        return Err(SnapshotError::Malformed("envelope is not an object"));
    };

    let version = envelope
        .get("version")
        .and_then(Value::as_u64)
        .ok_or(SnapshotError::MissingVersion)?;
    let version = u32::try_from(version)
        .ok()
        .filter(|v| (1..=SCHEMA_VERSION).contains(v))
        .ok_or(SnapshotError::UnsupportedVersion {
            found: u32::try_from(version).unwrap_or(u32::MAX),
            latest: SCHEMA_VERSION,
        })?;

    let Some(Value::Object(mut state)) = envelope.remove("state") else {
        return Err(SnapshotError::Malformed("missing state object"));
    };
    for migration in MIGRATIONS.iter().filter(|m| m.from >= version) {
        state = (migration.apply)(state).map_err(|reason| SnapshotError::Migration {
            from: migration.from,
            reason,
        })?;
    }

    serde_json::from_value(Value::Object(state)).map_err(SnapshotError::Decode)
}

/// v1 had no poll interval and tracked mutation failure as a `failed` flag.
/// In-flight work was never written in v1, so non-failed means queued.
fn v1_to_v2(mut state: Map<String, Value>) -> Result<Map<String, Value>, String> {
    state
        .entry("poll_interval_ms")
        .or_insert_with(|| Value::from(DEFAULT_POLL_INTERVAL_MS));

    let queue = state
        .get_mut("mutation_queue")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| "mutation_queue is not an array".to_string())?;
    for entry in queue {
        let entry = entry
            .as_object_mut()
            .ok_or_else(|| "mutation entry is not an object".to_string())?;
        let failed = entry
            .remove("failed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        entry.insert(
            "state".to_string(),
            Value::from(if failed { "failed" } else { "queued" }),
        );
    }
    Ok(state)
}

/// v3 records when a mutation last failed. Older failures are dated to
/// their enqueue time so their retry delay has already run out.
fn v2_to_v3(mut state: Map<String, Value>) -> Result<Map<String, Value>, String> {
    let queue = state
        .get_mut("mutation_queue")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| "mutation_queue is not an array".to_string())?;
    for entry in queue {
        let entry = entry
            .as_object_mut()
            .ok_or_else(|| "mutation entry is not an object".to_string())?;
        let failed_at = match entry.get("state").and_then(Value::as_str) {
            Some("failed") => entry.get("enqueued_at").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        entry.entry("failed_at").or_insert(failed_at);
    }
    Ok(state)
}
