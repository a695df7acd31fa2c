// Job store: keyed collection of job records behind a small interface so the
// in-memory map can be swapped for a shared backend without touching callers.

use super::model::JobRecord;
use std::collections::HashMap;
use std::sync::RwLock;

pub trait JobStore: Send + Sync {
    fn get(&self, id: &str) -> Option<JobRecord>;

    fn put(&self, record: JobRecord);

    /// Mutate a record in place; returns the updated copy, or None if absent.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut JobRecord)) -> Option<JobRecord>;

    fn remove(&self, id: &str) -> Option<JobRecord>;
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn get(&self, id: &str) -> Option<JobRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    fn put(&self, record: JobRecord) {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.id.clone(), record);
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut JobRecord)) -> Option<JobRecord> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = records.get_mut(id)?;
        f(record);
        Some(record.clone())
    }

    fn remove(&self, id: &str) -> Option<JobRecord> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
    }
}
