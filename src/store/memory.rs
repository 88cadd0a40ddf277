// src/store/memory.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::{BatchdagError, Result};
use crate::model::{Execution, ExecutionId, ExecutionRecord};
use crate::store::{ExecutionLease, ExecutionStore};

type NameSet = Arc<Mutex<BTreeSet<String>>>;

/// In-memory store for tests, keyed by execution name.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, ExecutionRecord>>>,
    leases: NameSet,
    kill_requests: NameSet,
}

fn names(set: &NameSet) -> MutexGuard<'_, BTreeSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ExecutionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ExecutionStore for MemoryStore {
    fn next_id(&self) -> Result<ExecutionId> {
        Ok(self
            .lock()
            .values()
            .map(|r| r.execution.id)
            .max()
            .unwrap_or(0)
            + 1)
    }

    fn load_by_name(&self, name: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.lock().get(name).cloned())
    }

    fn load_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .lock()
            .values()
            .find(|r| r.execution.id == id)
            .cloned())
    }

    fn save(&self, record: &ExecutionRecord) -> Result<()> {
        self.lock()
            .insert(record.execution.name.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Execution>> {
        let mut out: Vec<Execution> = self
            .lock()
            .values()
            .filter(|r| !r.execution.deleted)
            .map(|r| r.execution.clone())
            .collect();
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    fn soft_delete(&self, name: &str) -> Result<()> {
        match self.lock().get_mut(name) {
            Some(record) => {
                record.execution.deleted = true;
                Ok(())
            }
            None => Err(BatchdagError::ExecutionNotFound(name.to_string())),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.lock().remove(name);
        Ok(())
    }

    fn lease(&self, name: &str) -> Result<ExecutionLease> {
        if !names(&self.leases).insert(name.to_string()) {
            return Err(BatchdagError::ExecutionBusy {
                execution: name.to_string(),
                pid: std::process::id(),
            });
        }
        let leases = Arc::clone(&self.leases);
        let owned = name.to_string();
        Ok(ExecutionLease::new(name, move || {
            names(&leases).remove(&owned);
        }))
    }

    fn is_leased(&self, name: &str) -> Result<bool> {
        Ok(names(&self.leases).contains(name))
    }

    fn request_kill(&self, name: &str) -> Result<()> {
        names(&self.kill_requests).insert(name.to_string());
        Ok(())
    }

    fn take_kill_request(&self, name: &str) -> Result<bool> {
        Ok(names(&self.kill_requests).remove(name))
    }
}
