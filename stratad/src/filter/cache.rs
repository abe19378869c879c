use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::store::{CatalogObserver, FileRecord};

#[derive(Debug)]
struct CachedResult {
    /// `None` when the filter can match on any backend.
    candidates: Option<BTreeSet<String>>,
    files: Vec<FileRecord>,
}

#[derive(Debug, Default)]
struct CacheState {
    generation: u64,
    entries: HashMap<i64, CachedResult>,
}

/// Last computed result per filter id. Any write on a backend drops every
/// entry whose candidate set includes that backend.
#[derive(Debug, Default)]
pub struct FilterCache {
    state: Mutex<CacheState>,
}

impl FilterCache {
    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bumped on every invalidation; a result computed under an older
    /// generation is not stored.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn get(&self, filter_id: i64) -> Option<Vec<FileRecord>> {
        self.lock()
            .entries
            .get(&filter_id)
            .map(|entry| entry.files.clone())
    }

    pub fn insert(
        &self,
        filter_id: i64,
        generation: u64,
        candidates: Option<BTreeSet<String>>,
        files: Vec<FileRecord>,
    ) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state
            .entries
            .insert(filter_id, CachedResult { candidates, files });
        true
    }

    pub fn invalidate_filter(&self, filter_id: i64) {
        let mut state = self.lock();
        state.generation += 1;
        state.entries.remove(&filter_id);
    }

    pub fn invalidate_backend(&self, backend_id: &str) {
        let mut state = self.lock();
        state.generation += 1;
        state.entries.retain(|_, entry| match &entry.candidates {
            Some(candidates) => !candidates.contains(backend_id),
            None => false,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CatalogObserver for FilterCache {
    fn backend_changed(&self, backend_id: &str) {
        self.invalidate_backend(backend_id);
    }
}
