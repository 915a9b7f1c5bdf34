//! In-process memory tier.

use super::key::CacheKey;
use super::payload::Payload;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Unbounded key → payload map for repeat access within a process.
///
/// Holds disposable copies of what the disk store owns; dropping it loses
/// nothing. Reads share the lock, writes are serialized.
#[derive(Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<CacheKey, Payload>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Payload> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn put(&self, key: CacheKey, payload: Payload) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, payload);
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
