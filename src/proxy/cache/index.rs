use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use super::CacheEntry;

/// Entries and blob files to remove from disk after an index mutation. Blob
/// hashes appear only once their reference count has dropped to zero.
#[derive(Debug, Default)]
pub(super) struct Removal {
    pub entries: Vec<CacheEntry>,
    pub unreferenced_blobs: Vec<String>,
}

impl Removal {
    pub(super) fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unreferenced_blobs.is_empty()
    }
}

/// In-memory cache index: LRU over variant keys, the Vary list remembered per
/// base key, and reference counts for content-addressed blobs shared between
/// entries.
#[derive(Debug)]
pub(super) struct CacheIndex {
    lru: LruCache<String, CacheEntry>,
    vary_lists: HashMap<String, Vec<String>>,
    blob_refs: HashMap<String, usize>,
    bytes_in_use: u64,
    max_bytes: u64,
}

impl CacheIndex {
    pub(super) fn new(capacity: NonZeroUsize, max_bytes: u64) -> Self {
        Self {
            lru: LruCache::new(capacity),
            vary_lists: HashMap::new(),
            blob_refs: HashMap::new(),
            bytes_in_use: 0,
            max_bytes,
        }
    }

    pub(super) fn reset(&mut self) {
        self.lru.clear();
        self.vary_lists.clear();
        self.blob_refs.clear();
        self.bytes_in_use = 0;
    }

    pub(super) fn get(&mut self, variant_key: &str) -> Option<CacheEntry> {
        self.lru.get(variant_key).cloned()
    }

    pub(super) fn vary_names(&self, key_base: &str) -> Vec<String> {
        self.vary_lists.get(key_base).cloned().unwrap_or_default()
    }

    pub(super) fn blob_is_referenced(&self, hash: &str) -> bool {
        self.blob_refs.contains_key(hash)
    }

    pub(super) fn insert(
        &mut self,
        variant_key: String,
        vary_names: Vec<String>,
        entry: CacheEntry,
    ) -> Removal {
        let mut removal = Removal::default();

        self.vary_lists.insert(entry.key_base.clone(), vary_names);
        self.track_insert(&entry);

        if let Some((_key, replaced)) = self.lru.push(variant_key, entry) {
            self.track_remove(&replaced, &mut removal);
            removal.entries.push(replaced);
        }

        while self.bytes_in_use > self.max_bytes {
            if let Some((_key, evicted)) = self.lru.pop_lru() {
                self.track_remove(&evicted, &mut removal);
                removal.entries.push(evicted);
            } else {
                break;
            }
        }

        removal
    }

    /// Removes an entry only when the generation id still matches, so a
    /// concurrent replacement is never deleted by a stale reader.
    pub(super) fn remove_if_id_matches(&mut self, variant_key: &str, id: u64) -> Removal {
        let mut removal = Removal::default();
        let matches = self
            .lru
            .get(variant_key)
            .map(|entry| entry.id == id)
            .unwrap_or(false);
        if matches && let Some(removed) = self.lru.pop(variant_key) {
            self.track_remove(&removed, &mut removal);
            removal.entries.push(removed);
        }
        removal
    }

    pub(super) fn remove_by_variant_key(&mut self, variant_key: &str) -> Removal {
        let mut removal = Removal::default();
        if let Some(removed) = self.lru.pop(variant_key) {
            self.track_remove(&removed, &mut removal);
            removal.entries.push(removed);
        }
        removal
    }

    fn track_insert(&mut self, entry: &CacheEntry) {
        self.bytes_in_use = self.bytes_in_use.saturating_add(entry.content_length);
        if let Some(hash) = &entry.content_hash {
            *self.blob_refs.entry(hash.clone()).or_insert(0) += 1;
        }
    }

    fn track_remove(&mut self, entry: &CacheEntry, removal: &mut Removal) {
        self.bytes_in_use = self.bytes_in_use.saturating_sub(entry.content_length);
        if let Some(hash) = &entry.content_hash
            && let Some(count) = self.blob_refs.get_mut(hash)
        {
            *count -= 1;
            if *count == 0 {
                self.blob_refs.remove(hash);
                removal.unreferenced_blobs.push(hash.clone());
            }
        }
    }

    #[cfg(test)]
    pub(super) fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.lru.len()
    }
}
