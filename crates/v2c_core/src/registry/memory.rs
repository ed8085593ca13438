//! In-process task store.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::store::{TaskRecord, TaskStore};
use super::RegistryResult;
use crate::models::TaskId;

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<TaskId, TaskRecord>,
    locks: HashMap<TaskId, DateTime<Utc>>,
    aborts: HashSet<TaskId>,
}

/// Task store held in memory, for tests and single-process use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn put(&self, record: &TaskRecord) -> RegistryResult<()> {
        self.tables
            .lock()
            .records
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, id: &TaskId) -> RegistryResult<Option<TaskRecord>> {
        let now = Utc::now();
        Ok(self
            .tables
            .lock()
            .records
            .get(id)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    fn update(&self, id: &TaskId, f: &mut dyn FnMut(&mut TaskRecord)) -> RegistryResult<bool> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        match tables.records.get_mut(id) {
            Some(record) if !record.is_expired(now) => {
                f(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, id: &TaskId) -> RegistryResult<bool> {
        let mut tables = self.tables.lock();
        tables.aborts.remove(id);
        Ok(tables.records.remove(id).is_some())
    }

    fn ids(&self) -> RegistryResult<Vec<TaskId>> {
        Ok(self.tables.lock().records.keys().cloned().collect())
    }

    fn try_acquire_lock(&self, id: &TaskId, ttl: Duration) -> RegistryResult<bool> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        match tables.locks.get(id) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                tables.locks.insert(id.clone(), now + ttl);
                Ok(true)
            }
        }
    }

    fn lock_held(&self, id: &TaskId) -> RegistryResult<bool> {
        let now = Utc::now();
        Ok(matches!(self.tables.lock().locks.get(id), Some(expiry) if *expiry > now))
    }

    fn request_abort(&self, id: &TaskId) -> RegistryResult<()> {
        self.tables.lock().aborts.insert(id.clone());
        Ok(())
    }

    fn abort_requested(&self, id: &TaskId) -> RegistryResult<bool> {
        Ok(self.tables.lock().aborts.contains(id))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        let mut tables = self.tables.lock();
        let expired: Vec<TaskId> = tables
            .records
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            tables.records.remove(id);
            tables.aborts.remove(id);
        }
        tables.locks.retain(|_, expiry| *expiry > now);
        Ok(expired.len())
    }
}
