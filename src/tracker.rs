use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::UnitId;

/// Per-job-kind tracker entry shape. The Tracker itself stays generic over
/// this trait so each Job Kind can carry its own richer entry while the
/// base layer's bookkeeping (register/get/remove/count) is written once.
pub trait TrackerEntry: Clone + Send + Sync + 'static {
    /// Job-private logical identifier for the task this unit represents
    /// (e.g. "page 17 ocr provider-a"). Unique across currently in-flight
    /// entries of the same job.
    fn task_key(&self) -> &str;

    fn retry_count(&self) -> u32;
}

/// In-memory map from unit id to Tracker Entry, scoped to a single job.
/// Writes only happen while the owning job's mutex is held; reads are safe
/// at any time.
pub struct Tracker<E: TrackerEntry> {
    entries: RwLock<HashMap<UnitId, E>>,
}

impl<E: TrackerEntry> Tracker<E> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: UnitId, entry: E) {
        self.entries.write().insert(id, entry);
    }

    pub fn get(&self, id: &UnitId) -> Option<E> {
        self.entries.read().get(id).cloned()
    }

    pub fn remove(&self, id: &UnitId) -> Option<E> {
        self.entries.write().remove(id)
    }

    pub fn all_by_task_key(&self, task_key: &str) -> Vec<E> {
        self.entries
            .read()
            .values()
            .filter(|e| e.task_key() == task_key)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<E: TrackerEntry> Default for Tracker<E> {
    fn default() -> Self {
        Self::new()
    }
}
