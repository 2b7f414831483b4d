use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::Mutex;
use tokio::{fs as async_fs, task};
use tracing::{trace, warn};

mod entry;
mod index;
mod key;
mod maintenance;
pub(crate) mod policy;
mod store;
mod writer;

use entry::{CacheEntry, PersistedEntry};
use index::{CacheIndex, Removal};
use key::{CacheKey, VaryKey};
use maintenance::spawn_cache_sweeper;
use policy::{Disposition, Validators};
use store::BlobStore;
pub(crate) use writer::CacheWriter;

/// Freshness inputs recorded when an entry is stored or revalidated.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub initial_age: Duration,
    pub freshness: Duration,
    pub validators: Validators,
}

impl EntryMeta {
    pub(crate) fn from_response(headers: &HeaderMap, received_at: SystemTime) -> Self {
        Self {
            initial_age: policy::initial_age(headers, received_at),
            freshness: policy::freshness_lifetime(headers, received_at).unwrap_or(Duration::ZERO),
            validators: Validators::from_headers(headers),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// None for entries stored without a body (empty or HEAD).
    pub body_path: Option<PathBuf>,
    pub content_length: u64,
    pub validators: Validators,
    pub variant_key: String,
    /// Generation id of the entry this response was read from; used to make
    /// revalidation updates race-safe against concurrent replacement.
    pub generation: u64,
}

#[derive(Debug)]
pub enum Lookup {
    Miss,
    Fresh(CachedResponse),
    Stale(CachedResponse),
}

#[derive(Clone)]
pub struct HttpCache {
    state: Arc<CacheState>,
}

#[derive(Debug)]
struct CacheState {
    index: Mutex<CacheIndex>,
    store: BlobStore,
    max_entry_size: u64,
    next_id: AtomicU64,
}

impl HttpCache {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        capacity: usize,
        cache_dir: PathBuf,
        max_entry_size: u64,
        max_bytes: u64,
        sweeper_interval: Duration,
        sweeper_batch_size: usize,
        stale_grace: Duration,
    ) -> Result<Self> {
        let capacity = std::num::NonZeroUsize::new(capacity)
            .ok_or_else(|| anyhow!("cache capacity must be greater than zero"))?;
        let index = CacheIndex::new(capacity, max_bytes);
        let store = BlobStore::open(cache_dir)?;
        let state = Arc::new(CacheState {
            index: Mutex::new(index),
            store,
            max_entry_size,
            next_id: AtomicU64::new(1),
        });

        let rebuild = {
            let state = state.clone();
            task::spawn_blocking(move || state.rebuild_from_disk(max_entry_size, stale_grace))
        };
        rebuild
            .await
            .map_err(|err| anyhow!("cache rebuild task failed: {err}"))??;

        spawn_cache_sweeper(state.clone(), sweeper_interval, sweeper_batch_size, stale_grace);
        Ok(Self { state })
    }

    /// Resolves a request against the cache. The returned variant key is
    /// derived from the Vary list remembered for this resource and identifies
    /// the slot a refetch would fill, so callers key coordination on it even
    /// for misses.
    pub async fn lookup(
        &self,
        method: &Method,
        uri: &Uri,
        req_headers: &HeaderMap,
    ) -> (String, Lookup) {
        let key_base = CacheKey::key_base_for(method, uri);
        let vary_names = self.state.index.lock().vary_names(&key_base);
        let cache_key = CacheKey::new(method, uri, &vary_names, req_headers);
        let variant_key = cache_key.variant_key().to_string();
        let entry = self.state.index.lock().get(&variant_key);

        let entry = match entry {
            Some(entry) => entry,
            None => return (variant_key, Lookup::Miss),
        };

        let disposition = policy::classify(
            entry.stored_at,
            entry.initial_age,
            entry.freshness,
            &entry.validators,
            SystemTime::now(),
        );
        // Expired entries without validators stay on disk for the sweeper;
        // the refetch that follows this miss replaces them in place.
        if disposition == Disposition::Miss {
            trace!("cache entry expired without validators");
            return (variant_key, Lookup::Miss);
        }

        let body_path = match &entry.content_hash {
            Some(hash) => {
                let path = self.state.store.blob_path(hash);
                if !self.verify_blob(&path, hash).await {
                    warn!(
                        path = %path.display(),
                        "cache body missing or corrupted, dropping entry"
                    );
                    let removal = self
                        .state
                        .index
                        .lock()
                        .remove_if_id_matches(&variant_key, entry.id);
                    self.state.remove_files_async(removal).await;
                    return (variant_key, Lookup::Miss);
                }
                Some(path)
            }
            None => None,
        };

        let response = CachedResponse {
            status: entry.status,
            headers: entry.headers.clone(),
            body_path,
            content_length: entry.content_length,
            validators: entry.validators.clone(),
            variant_key: variant_key.clone(),
            generation: entry.id,
        };

        match disposition {
            Disposition::Fresh => (variant_key, Lookup::Fresh(response)),
            Disposition::Stale(_) => (variant_key, Lookup::Stale(response)),
            Disposition::Miss => unreachable!(),
        }
    }

    async fn verify_blob(&self, path: &std::path::Path, expected: &str) -> bool {
        let store = self.state.store.clone();
        let path = path.to_path_buf();
        let expected = expected.to_string();
        task::spawn_blocking(move || store.content_hash_matches(&path, &expected))
            .await
            .unwrap_or(false)
    }

    /// Opens a streaming writer for a response about to be relayed. Returns
    /// `None` when the Vary contract makes the response unsafe to cache.
    pub(crate) async fn open_writer(
        &self,
        method: &Method,
        uri: &Uri,
        req_headers: &HeaderMap,
        resp_headers: &HeaderMap,
    ) -> Result<Option<CacheWriter>> {
        let vary = match VaryKey::from_response(resp_headers, req_headers) {
            Some(vary) => vary,
            None => {
                trace!("skipping cache due to Vary header limits");
                return Ok(None);
            }
        };
        let cache_key = CacheKey::new(method, uri, &vary.names(), req_headers);

        let temp_name = format!("tmp_{}", uuid::Uuid::new_v4());
        let temp_path = self.state.store.temp_path(&temp_name);

        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options.open(&temp_path).await?;

        Ok(Some(CacheWriter::new(
            file,
            temp_path,
            self.state.clone(),
            cache_key,
            vary,
        )))
    }

    /// Applies a 304 revalidation to a stored entry: merged headers and new
    /// freshness inputs, body untouched. Returns false when the entry was
    /// concurrently replaced or evicted.
    pub(crate) async fn apply_revalidation(
        &self,
        variant_key: &str,
        generation: u64,
        merged_headers: HeaderMap,
        meta: EntryMeta,
    ) -> Result<bool> {
        let (stale, vary_names) = {
            let mut guard = self.state.index.lock();
            match guard.get(variant_key) {
                Some(entry) if entry.id == generation => {
                    let names = entry.vary.names();
                    (entry, names)
                }
                _ => return Ok(false),
            }
        };

        let refreshed = CacheEntry {
            id: self.state.next_entry_id(),
            stored_at: SystemTime::now(),
            initial_age: meta.initial_age,
            freshness: meta.freshness,
            validators: meta.validators,
            headers: merged_headers,
            ..stale
        };

        let persisted = refreshed.to_persisted(variant_key);
        self.state
            .store
            .write_metadata_async(&refreshed.entry_id, &persisted)
            .await?;

        let removal =
            self.state
                .index
                .lock()
                .insert(variant_key.to_string(), vary_names, refreshed);
        self.state.remove_files_async(removal).await;
        trace!("revalidated cache entry for {variant_key}");
        Ok(true)
    }

    /// Buffered store, convenient for tests; the serving path streams through
    /// `open_writer` instead.
    #[cfg(test)]
    pub(crate) async fn store(
        &self,
        method: &Method,
        uri: &Uri,
        req_headers: &HeaderMap,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
        meta: EntryMeta,
    ) -> Result<()> {
        if let Some(mut writer) = self.open_writer(method, uri, req_headers, headers).await? {
            writer.write_chunk(body).await?;
            writer.finish(status, headers.clone(), meta).await?;
        }
        Ok(())
    }
}

impl CacheState {
    fn next_entry_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn remove_files_async(&self, removal: Removal) {
        for entry in &removal.entries {
            self.store.remove_meta_async(&entry.entry_id).await;
        }
        for hash in &removal.unreferenced_blobs {
            self.store.remove_blob_async(hash).await;
        }
    }
}
