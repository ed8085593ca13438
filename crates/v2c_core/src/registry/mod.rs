//! Task registry: durable records, run locks, abort flags and delivery.
//!
//! [`TaskRegistry`] is the facade used by both sides:
//! - callers submit, query, restart, abort, remove and list tasks
//! - the task machine loads its record, checks and takes the run lock,
//!   persists stage results and records the terminal state
//!
//! It also serves as the [`StatusSink`] behind every status reporter.

mod json_store;
mod memory;
mod queue;
mod store;

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use json_store::JsonStore;
pub use memory::MemoryStore;
pub use queue::{Delivery, MemoryQueue, SpoolQueue, TaskQueue};
pub use store::{TaskRecord, TaskStore};

use crate::config::RegistrySettings;
use crate::models::{
    ParamName, StatusEntry, TaskId, TaskParams, TaskState, TaskStatusView, TaskSummary,
};
use crate::task::{StageResults, StatusSink};

/// Errors from the registry and its store.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Task does not exist")]
    NotFound,

    #[error("Task must belong to you.")]
    NotOwner,

    #[error("Task has already been restarted with id {new_id}")]
    AlreadyRestarted { new_id: TaskId },

    #[error("Could not extract the task parameters.")]
    ParamsUnavailable,

    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid data in {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serde(path: &Path, source: serde_json::Error) -> Self {
        Self::Serde {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Facade over the task store and queue.
pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
    settings: RegistrySettings,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn TaskStore>, queue: Arc<dyn TaskQueue>, settings: RegistrySettings) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    /// Registry on in-memory store and queue.
    pub fn in_memory(settings: RegistrySettings) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryQueue::new()), settings)
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    // ---------------------------------------------------------------------
    // Caller side
    // ---------------------------------------------------------------------

    /// Record a new task and enqueue its first delivery.
    pub fn submit(&self, params: TaskParams) -> RegistryResult<TaskId> {
        self.submit_record(params, None)
    }

    fn submit_record(&self, params: TaskParams, restarted_from: Option<TaskId>) -> RegistryResult<TaskId> {
        let id = TaskId::new();
        let queue = params.queue.clone();
        let mut record = TaskRecord::new(id.clone(), params, Utc::now(), self.settings.retention());
        record.restarted_from = restarted_from;

        self.store.put(&record)?;
        self.queue.push(&queue, &id)?;

        tracing::info!(task = %id, owner = %record.owner, queue = %queue, "Submitted task");
        Ok(id)
    }

    /// Caller-facing status; `None` for unknown or purged ids.
    pub fn status(&self, id: &TaskId) -> RegistryResult<Option<TaskStatusView>> {
        let Some(record) = self.store.get(id)? else {
            return Ok(None);
        };
        let abort_pending = !record.state.is_terminal() && self.store.abort_requested(id)?;
        Ok(Some(status_view(&record, abort_pending)))
    }

    /// Submit a copy of a finished task's parameters, at most once per task.
    pub fn restart(&self, id: &TaskId, requester: &str) -> RegistryResult<TaskId> {
        let record = self.store.get(id)?.ok_or(RegistryError::NotFound)?;
        if record.owner != requester {
            return Err(RegistryError::NotOwner);
        }
        if let Some(new_id) = record.restarted_as {
            return Err(RegistryError::AlreadyRestarted { new_id });
        }
        let params = record.params.ok_or(RegistryError::ParamsUnavailable)?;

        let new_id = self.submit_record(params, Some(id.clone()))?;

        let linked = self.store.update(id, &mut |r| {
            r.restarted_as = Some(new_id.clone());
            r.updated_at = Utc::now();
        })?;
        if !linked {
            tracing::warn!(task = %id, new_task = %new_id, "Original task vanished during restart");
        }

        tracing::info!(task = %id, new_task = %new_id, "Restarted task");
        Ok(new_id)
    }

    /// Raise the cooperative abort flag.
    pub fn abort(&self, id: &TaskId, requester: &str) -> RegistryResult<()> {
        self.owned_record(id, requester)?;
        self.store.request_abort(id)?;
        tracing::info!(task = %id, "Abort requested");
        Ok(())
    }

    /// Forget a task. A running execution is not affected.
    pub fn remove(&self, id: &TaskId, requester: &str) -> RegistryResult<()> {
        self.owned_record(id, requester)?;
        self.store.delete(id)?;
        tracing::info!(task = %id, "Removed task");
        Ok(())
    }

    /// Tasks visible to `requester`, newest first. Sudoers see every task.
    pub fn list(&self, requester: &str) -> RegistryResult<Vec<TaskSummary>> {
        let everyone = self.settings.is_sudoer(requester);
        let mut summaries = Vec::new();
        for id in self.store.ids()? {
            let record = match self.store.get(&id) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(task = %id, error = %e, "Skipping unreadable task");
                    continue;
                }
            };
            if !everyone && record.owner != requester {
                continue;
            }
            let abort_pending = !record.state.is_terminal() && self.store.abort_requested(&id)?;
            summaries.push(TaskSummary {
                status: status_view(&record, abort_pending),
                id: record.id,
                title: record.title,
                owner: record.owner,
                created_at: record.created_at,
            });
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        self.store.purge_expired(now)
    }

    fn owned_record(&self, id: &TaskId, requester: &str) -> RegistryResult<TaskRecord> {
        let record = self.store.get(id)?.ok_or(RegistryError::NotFound)?;
        if record.owner != requester {
            return Err(RegistryError::NotOwner);
        }
        Ok(record)
    }

    // ---------------------------------------------------------------------
    // Task machine side
    // ---------------------------------------------------------------------

    pub fn run_lock_held(&self, id: &TaskId) -> RegistryResult<bool> {
        self.store.lock_held(id)
    }

    /// Take the run lock; `false` if another execution holds it.
    pub fn acquire_run_lock(&self, id: &TaskId, ttl: chrono::Duration) -> RegistryResult<bool> {
        self.store.try_acquire_lock(id, ttl)
    }

    pub fn load_task(&self, id: &TaskId) -> RegistryResult<TaskRecord> {
        self.store.get(id)?.ok_or(RegistryError::NotFound)
    }

    /// Persist stage results and taint after an executed stage.
    pub fn save_stage_results(
        &self,
        id: &TaskId,
        results: &StageResults,
        tainted: &BTreeSet<ParamName>,
    ) -> RegistryResult<()> {
        let found = self.store.update(id, &mut |r| {
            r.results = results.clone();
            r.tainted = tainted.clone();
            r.updated_at = Utc::now();
        })?;
        if !found {
            tracing::warn!(task = %id, "Task record gone; stage results not persisted");
        }
        Ok(())
    }

    /// Store a terminal state.
    pub fn record_outcome(&self, id: &TaskId, state: TaskState) -> RegistryResult<()> {
        debug_assert!(state.is_terminal());
        let label = state.label();
        let found = self.store.update(id, &mut |r| {
            r.state = state.clone();
            r.updated_at = Utc::now();
        })?;
        if found {
            tracing::info!(task = %id, state = label, "Recorded task outcome");
        } else {
            tracing::warn!(task = %id, state = label, "Task record gone; outcome not recorded");
        }
        Ok(())
    }
}

impl StatusSink for TaskRegistry {
    fn abort_requested(&self, id: &TaskId) -> bool {
        match self.store.abort_requested(id) {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "Failed to read abort flag");
                false
            }
        }
    }

    fn write_status(&self, id: &TaskId, text: &str, percent: Option<u32>) -> RegistryResult<()> {
        let limit = self.settings.status_history;
        let now = Utc::now();
        self.store.update(id, &mut |r| {
            if !r.state.is_terminal() {
                r.state = TaskState::Progress {
                    text: text.to_string(),
                    percent,
                };
            }
            r.push_history(
                StatusEntry {
                    at: now,
                    text: text.to_string(),
                    percent,
                },
                limit,
            );
            r.updated_at = now;
        })?;
        Ok(())
    }
}

fn status_view(record: &TaskRecord, abort_pending: bool) -> TaskStatusView {
    if abort_pending {
        return TaskStatusView::Aborted;
    }
    match &record.state {
        TaskState::Queued => TaskStatusView::Pending,
        TaskState::Progress { text, percent } => TaskStatusView::Progress {
            text: text.clone(),
            percent: *percent,
        },
        TaskState::Done { filename, url } => TaskStatusView::Done {
            filename: filename.clone(),
            url: url.clone(),
        },
        TaskState::NeedsManualUpload { url, hashsum } => TaskStatusView::NeedsManualUpload {
            url: url.clone(),
            hashsum: hashsum.clone(),
        },
        TaskState::Failed { text } => TaskStatusView::Fail {
            text: text.clone(),
            restartable: record.params.is_some() && record.restarted_as.is_none(),
        },
        TaskState::Aborted => TaskStatusView::Aborted,
    }
}
