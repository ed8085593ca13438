//! Directory-backed task store.
//!
//! Layout under the store root:
//! - `tasks/<id>.json`: the task record
//! - `locks/<id>.lock`: run lock holding its expiry, created with `create_new`
//! - `aborts/<id>`: abort request marker
//!
//! Record writes go to a temp file first and are renamed into place.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::store::{TaskRecord, TaskStore};
use super::{RegistryError, RegistryResult};
use crate::models::TaskId;

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    expires_at: DateTime<Utc>,
}

/// Task store persisted as JSON files.
#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    /// Serializes read-modify-write of records within this process.
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> RegistryResult<Self> {
        let root = root.into();
        for dir in ["tasks", "locks", "aborts"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| RegistryError::io(format!("creating {}", path.display()), e))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id))
    }

    fn lock_path(&self, id: &TaskId) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", id))
    }

    fn abort_path(&self, id: &TaskId) -> PathBuf {
        self.root.join("aborts").join(id.as_str())
    }

    fn read_record(&self, path: &Path) -> RegistryResult<Option<TaskRecord>> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RegistryError::io(format!("reading {}", path.display()), e)),
        };
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| RegistryError::serde(path, e))
    }

    fn write_record(&self, record: &TaskRecord) -> RegistryResult<()> {
        let path = self.record_path(&record.id);
        let json = serde_json::to_vec_pretty(record).map_err(|e| RegistryError::serde(&path, e))?;
        atomic_write(&path, &json)
    }

    /// `None` when the lock is missing; an unreadable lock counts as held.
    fn lock_expiry(&self, id: &TaskId) -> RegistryResult<Option<DateTime<Utc>>> {
        let path = self.lock_path(id);
        match fs::read_to_string(&path) {
            Ok(data) => Ok(Some(
                serde_json::from_str::<LockFile>(&data)
                    .map(|l| l.expires_at)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RegistryError::io(format!("reading {}", path.display()), e)),
        }
    }
}

impl TaskStore for JsonStore {
    fn put(&self, record: &TaskRecord) -> RegistryResult<()> {
        check_id(&record.id)?;
        let _guard = self.write_lock.lock();
        self.write_record(record)
    }

    fn get(&self, id: &TaskId) -> RegistryResult<Option<TaskRecord>> {
        if check_id(id).is_err() {
            return Ok(None);
        }
        let now = Utc::now();
        Ok(self
            .read_record(&self.record_path(id))?
            .filter(|r| !r.is_expired(now)))
    }

    fn update(&self, id: &TaskId, f: &mut dyn FnMut(&mut TaskRecord)) -> RegistryResult<bool> {
        if check_id(id).is_err() {
            return Ok(false);
        }
        let _guard = self.write_lock.lock();
        let now = Utc::now();
        match self.read_record(&self.record_path(id))? {
            Some(mut record) if !record.is_expired(now) => {
                f(&mut record);
                self.write_record(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, id: &TaskId) -> RegistryResult<bool> {
        if check_id(id).is_err() {
            return Ok(false);
        }
        let _guard = self.write_lock.lock();
        remove_if_exists(&self.abort_path(id))?;
        remove_if_exists(&self.record_path(id))
    }

    fn ids(&self) -> RegistryResult<Vec<TaskId>> {
        let dir = self.root.join("tasks");
        let entries = fs::read_dir(&dir)
            .map_err(|e| RegistryError::io(format!("listing {}", dir.display()), e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::io(format!("listing {}", dir.display()), e))?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                ids.push(TaskId::from(id));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn try_acquire_lock(&self, id: &TaskId, ttl: Duration) -> RegistryResult<bool> {
        check_id(id)?;
        let path = self.lock_path(id);

        // Second round only after removing an expired lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lock = LockFile {
                        expires_at: Utc::now() + ttl,
                    };
                    let json = serde_json::to_vec(&lock).map_err(|e| RegistryError::serde(&path, e))?;
                    file.write_all(&json)
                        .and_then(|_| file.sync_all())
                        .map_err(|e| RegistryError::io(format!("writing {}", path.display()), e))?;
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match self.lock_expiry(id)? {
                        Some(expiry) if expiry > Utc::now() => return Ok(false),
                        _ => {
                            tracing::debug!(task = %id, "Replacing expired run lock");
                            remove_if_exists(&path)?;
                        }
                    }
                }
                Err(e) => return Err(RegistryError::io(format!("creating {}", path.display()), e)),
            }
        }
        Ok(false)
    }

    fn lock_held(&self, id: &TaskId) -> RegistryResult<bool> {
        if check_id(id).is_err() {
            return Ok(false);
        }
        Ok(matches!(self.lock_expiry(id)?, Some(expiry) if expiry > Utc::now()))
    }

    fn request_abort(&self, id: &TaskId) -> RegistryResult<()> {
        check_id(id)?;
        let path = self.abort_path(id);
        fs::write(&path, b"")
            .map_err(|e| RegistryError::io(format!("writing {}", path.display()), e))
    }

    fn abort_requested(&self, id: &TaskId) -> RegistryResult<bool> {
        if check_id(id).is_err() {
            return Ok(false);
        }
        Ok(self.abort_path(id).exists())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        let mut purged = 0;
        for id in self.ids()? {
            let path = self.record_path(&id);
            let _guard = self.write_lock.lock();
            let record = match self.read_record(&path) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(task = %id, error = %e, "Skipping unreadable task record");
                    continue;
                }
            };
            if record.is_expired(now) {
                remove_if_exists(&self.abort_path(&id))?;
                remove_if_exists(&path)?;
                purged += 1;
            }
        }

        let locks = self.root.join("locks");
        let entries = fs::read_dir(&locks)
            .map_err(|e| RegistryError::io(format!("listing {}", locks.display()), e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".lock")) else {
                continue;
            };
            if matches!(self.lock_expiry(&TaskId::from(id))?, Some(expiry) if expiry <= now) {
                remove_if_exists(&entry.path())?;
            }
        }

        if purged > 0 {
            tracing::info!(purged, "Purged expired task records");
        }
        Ok(purged)
    }
}

/// Ids become file names; refuse anything that is not one plain component.
fn check_id(id: &TaskId) -> RegistryResult<()> {
    let s = id.as_str();
    let valid = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::NotFound)
    }
}

/// Write to a temp file in the same directory, then rename over `path`.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> RegistryResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{}.tmp", std::process::id()));
    let temp = PathBuf::from(temp);

    fs::write(&temp, data)
        .and_then(|_| fs::rename(&temp, path))
        .map_err(|e| {
            let _ = fs::remove_file(&temp);
            RegistryError::io(format!("writing {}", path.display()), e)
        })
}

fn remove_if_exists(path: &Path) -> RegistryResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RegistryError::io(format!("removing {}", path.display()), e)),
    }
}
