//! Durable task records and the store interface.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::RegistryResult;
use crate::models::{ParamName, StatusEntry, TaskId, TaskParams, TaskState};
use crate::task::StageResults;

/// Everything the registry keeps about one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Display title (the target filename).
    pub title: String,
    pub owner: String,
    /// Kept for restarts; `None` once unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<TaskParams>,
    pub queue: String,
    pub state: TaskState,
    /// Flushed status lines, oldest first, bounded.
    #[serde(default)]
    pub history: Vec<StatusEntry>,
    /// Memoized stage results.
    #[serde(default)]
    pub results: StageResults,
    /// Parameters whose cached results no longer reflect their value.
    #[serde(default)]
    pub tainted: BTreeSet<ParamName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_as: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_from: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Fresh queued record for `params`.
    pub fn new(id: TaskId, params: TaskParams, now: DateTime<Utc>, retention: Duration) -> Self {
        Self {
            id,
            title: params.filename.clone(),
            owner: params.username.clone(),
            queue: params.queue.clone(),
            params: Some(params),
            state: TaskState::Queued,
            history: Vec::new(),
            results: StageResults::default(),
            tainted: BTreeSet::new(),
            restarted_as: None,
            restarted_from: None,
            created_at: now,
            updated_at: now,
            expires_at: now + retention,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Append a flushed status line, dropping the oldest beyond `limit`.
    pub fn push_history(&mut self, entry: StatusEntry, limit: usize) {
        self.history.push(entry);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

/// Storage behind the registry.
///
/// Records, run locks and abort flags are keyed by task id. Expired records
/// read as absent. Implementations serialize read-modify-write within one
/// process; across processes only the run lock is exclusive.
pub trait TaskStore: Send + Sync {
    /// Insert or replace a record.
    fn put(&self, record: &TaskRecord) -> RegistryResult<()>;

    fn get(&self, id: &TaskId) -> RegistryResult<Option<TaskRecord>>;

    /// Apply `f` to the stored record. Returns `false` if there is none.
    fn update(&self, id: &TaskId, f: &mut dyn FnMut(&mut TaskRecord)) -> RegistryResult<bool>;

    /// Delete the record and its abort flag. The run lock stays.
    fn delete(&self, id: &TaskId) -> RegistryResult<bool>;

    /// Ids of all stored records, expired or not.
    fn ids(&self) -> RegistryResult<Vec<TaskId>>;

    /// Create the run lock unless an unexpired one exists.
    fn try_acquire_lock(&self, id: &TaskId, ttl: Duration) -> RegistryResult<bool>;

    fn lock_held(&self, id: &TaskId) -> RegistryResult<bool>;

    fn request_abort(&self, id: &TaskId) -> RegistryResult<()>;

    fn abort_requested(&self, id: &TaskId) -> RegistryResult<bool>;

    /// Drop expired records, their abort flags and expired run locks.
    /// Returns the number of records removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> RegistryResult<usize>;
}
