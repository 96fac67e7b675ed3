use crate::metadata::types::MetadataResult;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

const MAX_ENTRIES: usize = 1024;

/// Short-lived cache of finished results keyed by normalized url.
///
/// Entries are shared snapshots; a newer result replaces the entry, it never edits it.
pub struct ResultCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Arc<MetadataResult>, Instant)>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, key: &str) -> Option<Arc<MetadataResult>> {
        if !self.is_enabled() {
            return None;
        }

        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(result, _)| result.clone())
    }

    pub fn insert(&self, key: String, result: Arc<MetadataResult>) {
        if !self.is_enabled() {
            return;
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_ENTRIES {
            let ttl = self.ttl;
            entries.retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
        }
        if entries.len() >= MAX_ENTRIES {
            log::debug!("result cache full, dropping {} entries", entries.len());
            entries.clear();
        }
        entries.insert(key, (result, Instant::now()));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
