//! At-least-once task delivery.
//!
//! A delivery is claimed by `pop`, and stays claimed until it is acked or
//! deferred with `retry_later`. Claims left behind by a dead worker are put
//! back by `requeue_stale`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::json_store::atomic_write;
use super::{RegistryError, RegistryResult};
use crate::models::TaskId;

/// Handle on a claimed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Receipt {
    Memory(u64),
    Spool(PathBuf),
}

/// One claimed task delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub task_id: TaskId,
    pub queue: String,
    /// Deferrals so far; 0 on first delivery.
    pub attempt: u32,
    pub not_before: DateTime<Utc>,
    pub(crate) receipt: Receipt,
}

/// Durable queue feeding the worker pool.
pub trait TaskQueue: Send + Sync {
    /// Enqueue a first delivery of `id`.
    fn push(&self, queue: &str, id: &TaskId) -> RegistryResult<()>;

    /// Claim the next due delivery, trying `queues` in order.
    fn pop(&self, queues: &[String]) -> RegistryResult<Option<Delivery>>;

    /// Finish a claimed delivery.
    fn ack(&self, delivery: &Delivery) -> RegistryResult<()>;

    /// Release a claim and deliver again after `countdown`, one attempt later.
    fn retry_later(&self, delivery: &Delivery, countdown: Duration) -> RegistryResult<()>;

    /// Return claims older than `older_than` to their queues.
    fn requeue_stale(&self, older_than: Duration) -> RegistryResult<usize>;
}

fn due_at(countdown: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(countdown).unwrap_or(chrono::Duration::zero())
}

#[derive(Debug, Clone)]
struct Entry {
    task_id: TaskId,
    queue: String,
    attempt: u32,
    not_before: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    pending: Vec<Entry>,
    claimed: HashMap<u64, (Entry, SystemTime)>,
    next_receipt: u64,
}

/// Queue held in memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries waiting on `queue`, due or not.
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|e| e.queue == queue)
            .count()
    }

    pub fn claimed(&self) -> usize {
        self.state.lock().claimed.len()
    }
}

impl TaskQueue for MemoryQueue {
    fn push(&self, queue: &str, id: &TaskId) -> RegistryResult<()> {
        self.state.lock().pending.push(Entry {
            task_id: id.clone(),
            queue: queue.to_string(),
            attempt: 0,
            not_before: Utc::now(),
        });
        Ok(())
    }

    fn pop(&self, queues: &[String]) -> RegistryResult<Option<Delivery>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        for queue in queues {
            let next = state
                .pending
                .iter()
                .enumerate()
                .filter(|(_, e)| &e.queue == queue && e.not_before <= now)
                .min_by_key(|(_, e)| e.not_before)
                .map(|(i, _)| i);
            if let Some(index) = next {
                let entry = state.pending.remove(index);
                let receipt = state.next_receipt;
                state.next_receipt += 1;
                state.claimed.insert(receipt, (entry.clone(), SystemTime::now()));
                return Ok(Some(Delivery {
                    task_id: entry.task_id,
                    queue: entry.queue,
                    attempt: entry.attempt,
                    not_before: entry.not_before,
                    receipt: Receipt::Memory(receipt),
                }));
            }
        }
        Ok(None)
    }

    fn ack(&self, delivery: &Delivery) -> RegistryResult<()> {
        if let Receipt::Memory(receipt) = delivery.receipt {
            self.state.lock().claimed.remove(&receipt);
        }
        Ok(())
    }

    fn retry_later(&self, delivery: &Delivery, countdown: Duration) -> RegistryResult<()> {
        let mut state = self.state.lock();
        if let Receipt::Memory(receipt) = delivery.receipt {
            state.claimed.remove(&receipt);
        }
        state.pending.push(Entry {
            task_id: delivery.task_id.clone(),
            queue: delivery.queue.clone(),
            attempt: delivery.attempt + 1,
            not_before: due_at(countdown),
        });
        Ok(())
    }

    fn requeue_stale(&self, older_than: Duration) -> RegistryResult<usize> {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        let stale: Vec<u64> = state
            .claimed
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at).unwrap_or_default() >= older_than)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in &stale {
            if let Some((entry, _)) = state.claimed.remove(receipt) {
                state.pending.push(entry);
            }
        }
        Ok(stale.len())
    }
}

/// Spool file contents; the file name carries the same fields for ordering.
#[derive(Debug, Serialize, Deserialize)]
struct SpoolEntry {
    task_id: TaskId,
    queue: String,
    attempt: u32,
    not_before: DateTime<Utc>,
}

/// Queue spooled to a directory.
///
/// Each delivery is `spool/<queue>/<not_before_ms>-<attempt>-<id>.json`;
/// claiming renames it into `spool/<queue>/claimed/`, so only one worker
/// process can win it.
#[derive(Debug)]
pub struct SpoolQueue {
    root: PathBuf,
}

impl SpoolQueue {
    pub fn open(store_root: impl AsRef<Path>) -> RegistryResult<Self> {
        let root = store_root.as_ref().join("spool");
        fs::create_dir_all(&root)
            .map_err(|e| RegistryError::io(format!("creating {}", root.display()), e))?;
        Ok(Self { root })
    }

    fn queue_dir(&self, queue: &str) -> RegistryResult<PathBuf> {
        let valid = !queue.is_empty()
            && queue
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(RegistryError::io(
                "resolving queue",
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid queue name {:?}", queue)),
            ));
        }
        let dir = self.root.join(queue);
        let claimed = dir.join("claimed");
        fs::create_dir_all(&claimed)
            .map_err(|e| RegistryError::io(format!("creating {}", claimed.display()), e))?;
        Ok(dir)
    }

    fn spool(&self, entry: &SpoolEntry) -> RegistryResult<()> {
        let dir = self.queue_dir(&entry.queue)?;
        let name = format!(
            "{:013}-{}-{}.json",
            entry.not_before.timestamp_millis().max(0),
            entry.attempt,
            entry.task_id
        );
        let path = dir.join(&name);
        let json = serde_json::to_vec_pretty(entry).map_err(|e| RegistryError::serde(&path, e))?;
        atomic_write(&path, &json)
    }
}

/// `(not_before_ms, attempt, task id)` from a spool file name.
fn parse_spool_name(name: &str) -> Option<(i64, u32, TaskId)> {
    let stem = name.strip_suffix(".json")?;
    let mut parts = stem.splitn(3, '-');
    let millis = parts.next()?.parse().ok()?;
    let attempt = parts.next()?.parse().ok()?;
    let id = parts.next().filter(|id| !id.is_empty())?;
    Some((millis, attempt, TaskId::from(id)))
}

fn list_names(dir: &Path) -> RegistryResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RegistryError::io(format!("listing {}", dir.display()), e)),
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.ends_with(".json"))
        .collect();
    names.sort();
    Ok(names)
}

impl TaskQueue for SpoolQueue {
    fn push(&self, queue: &str, id: &TaskId) -> RegistryResult<()> {
        self.spool(&SpoolEntry {
            task_id: id.clone(),
            queue: queue.to_string(),
            attempt: 0,
            not_before: Utc::now(),
        })
    }

    fn pop(&self, queues: &[String]) -> RegistryResult<Option<Delivery>> {
        let now_ms = Utc::now().timestamp_millis();
        for queue in queues {
            let dir = self.queue_dir(queue)?;
            for name in list_names(&dir)? {
                let Some((millis, attempt, task_id)) = parse_spool_name(&name) else {
                    tracing::warn!(file = %name, "Ignoring malformed spool entry");
                    continue;
                };
                if millis > now_ms {
                    // Names sort by due time.
                    break;
                }

                let claimed = dir.join("claimed").join(&name);
                match fs::rename(dir.join(&name), &claimed) {
                    Ok(()) => {}
                    // Another worker got it first.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(RegistryError::io(format!("claiming {}", name), e)),
                }
                if let Err(e) = File::options()
                    .write(true)
                    .open(&claimed)
                    .and_then(|f| f.set_modified(SystemTime::now()))
                {
                    tracing::warn!(file = %name, error = %e, "Failed to stamp claim time");
                }

                return Ok(Some(Delivery {
                    task_id,
                    queue: queue.clone(),
                    attempt,
                    not_before: Utc
                        .timestamp_millis_opt(millis)
                        .single()
                        .unwrap_or_else(Utc::now),
                    receipt: Receipt::Spool(claimed),
                }));
            }
        }
        Ok(None)
    }

    fn ack(&self, delivery: &Delivery) -> RegistryResult<()> {
        if let Receipt::Spool(path) = &delivery.receipt {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(RegistryError::io(format!("acking {}", path.display()), e)),
            }
        }
        Ok(())
    }

    fn retry_later(&self, delivery: &Delivery, countdown: Duration) -> RegistryResult<()> {
        self.spool(&SpoolEntry {
            task_id: delivery.task_id.clone(),
            queue: delivery.queue.clone(),
            attempt: delivery.attempt + 1,
            not_before: due_at(countdown),
        })?;
        self.ack(delivery)
    }

    fn requeue_stale(&self, older_than: Duration) -> RegistryResult<usize> {
        let now = SystemTime::now();
        let queues = fs::read_dir(&self.root)
            .map_err(|e| RegistryError::io(format!("listing {}", self.root.display()), e))?;

        let mut requeued = 0;
        for queue in queues.flatten() {
            let claimed_dir = queue.path().join("claimed");
            for name in list_names(&claimed_dir)? {
                let path = claimed_dir.join(&name);
                let age = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|at| now.duration_since(at).ok())
                    .unwrap_or_default();
                if age < older_than {
                    continue;
                }
                match fs::rename(&path, queue.path().join(&name)) {
                    Ok(()) => {
                        tracing::info!(file = %name, "Requeued stale claim");
                        requeued += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(RegistryError::io(format!("requeueing {}", name), e)),
                }
            }
        }
        Ok(requeued)
    }
}
