use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::fs as async_fs;
use tracing::{debug, warn};

use super::{CacheEntry, CacheKey, CacheState, PersistedEntry};

#[derive(Debug, Default)]
pub(super) struct SweepStats {
    pub inspected: usize,
    pub removed: u64,
    pub bytes_reclaimed: u64,
}

pub(super) fn spawn_cache_sweeper(
    state: Arc<CacheState>,
    interval: Duration,
    batch_size: usize,
    stale_grace: Duration,
) {
    if interval.is_zero() || batch_size == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.sweep_expired_entries(batch_size, stale_grace).await {
                Ok(stats) => {
                    if stats.removed > 0 {
                        debug!(
                            removed = stats.removed,
                            bytes_reclaimed = stats.bytes_reclaimed,
                            "cache sweep removed expired entries"
                        );
                    }
                }
                Err(err) => {
                    warn!(error = %err, "cache sweep failed");
                }
            }
        }
    });
}

fn shard_files(root: &Path, extension: Option<&str>) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    for shard1 in fs::read_dir(root)? {
        let shard1 = shard1?;
        if !shard1.file_type()?.is_dir() {
            continue;
        }
        for shard2 in fs::read_dir(shard1.path())? {
            let shard2 = shard2?;
            if !shard2.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard2.path())? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == extension
                {
                    files.push(path);
                }
            }
        }
    }
    Ok(files)
}

fn prune_empty_shards_sync(root: &Path) {
    let Ok(shard1_entries) = fs::read_dir(root) else {
        return;
    };
    for shard1 in shard1_entries.filter_map(|e| e.ok()) {
        if !shard1.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Ok(shard2_entries) = fs::read_dir(shard1.path()) {
            for shard2 in shard2_entries.filter_map(|e| e.ok()) {
                fs::remove_dir(shard2.path()).ok();
            }
        }
        fs::remove_dir(shard1.path()).ok();
    }
}

fn valid_content_hash(value: &str) -> bool {
    value.len() == 64 && value.as_bytes().iter().all(|b| b.is_ascii_hexdigit())
}

impl CacheState {
    /// Rebuilds the index from persisted metadata at startup. Stale entries
    /// within the grace window are restored (they still have revalidation
    /// value); unparsable, mismatched, corrupted, or oversize entries are
    /// dropped. Blobs no surviving entry references are removed afterwards.
    pub(super) fn rebuild_from_disk(
        &self,
        max_entry_size: u64,
        stale_grace: Duration,
    ) -> Result<()> {
        self.store.remove_temp_files()?;
        self.index.lock().reset();

        let now = SystemTime::now();
        for meta_path in shard_files(&self.store.meta_root(), Some("json"))? {
            self.restore_entry_from_meta(&meta_path, now, max_entry_size, stale_grace)?;
        }

        for blob_path in shard_files(&self.store.blob_root(), None)? {
            let referenced = blob_path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|hash| self.index.lock().blob_is_referenced(hash))
                .unwrap_or(false);
            if !referenced {
                debug!(path = %blob_path.display(), "removing unreferenced blob");
                fs::remove_file(&blob_path).ok();
            }
        }

        prune_empty_shards_sync(&self.store.meta_root());
        prune_empty_shards_sync(&self.store.blob_root());
        Ok(())
    }

    fn restore_entry_from_meta(
        &self,
        meta_path: &Path,
        now: SystemTime,
        max_entry_size: u64,
        stale_grace: Duration,
    ) -> Result<()> {
        let data = match fs::read(meta_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    "failed to read cache metadata {}: {}",
                    meta_path.display(),
                    err
                );
                return Ok(());
            }
        };

        let persisted: PersistedEntry = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "failed to parse cache metadata {}: {}",
                    meta_path.display(),
                    err
                );
                fs::remove_file(meta_path).ok();
                return Ok(());
            }
        };

        let entry_id = CacheKey::entry_id_for_key(&persisted.variant_key);
        let file_stem = meta_path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if entry_id != file_stem {
            warn!(
                expected = entry_id,
                actual = file_stem,
                "cache metadata key mismatch; removing entry"
            );
            fs::remove_file(meta_path).ok();
            return Ok(());
        }

        if let Some(hash) = &persisted.content_hash {
            if !valid_content_hash(hash) {
                warn!(
                    "cache metadata {} has invalid content hash; removing entry",
                    meta_path.display()
                );
                fs::remove_file(meta_path).ok();
                return Ok(());
            }
            let blob_path = self.store.blob_path(hash);
            if !blob_path.exists() || !self.store.content_hash_matches(&blob_path, hash) {
                warn!(
                    "cache blob missing or corrupted for {}; removing entry",
                    meta_path.display()
                );
                fs::remove_file(meta_path).ok();
                return Ok(());
            }
        }

        let entry = CacheEntry::from_persisted(&persisted, &entry_id, self.next_entry_id());

        // Entries still within their lifetime or the stale grace window keep
        // their slot; anything older is not worth restoring.
        let expired_for = now
            .duration_since(entry.expires_at())
            .unwrap_or(Duration::ZERO);
        if expired_for > stale_grace {
            fs::remove_file(meta_path).ok();
            return Ok(());
        }

        if entry.content_length > max_entry_size {
            fs::remove_file(meta_path).ok();
            return Ok(());
        }

        let vary_names = entry.vary.names();
        let removal =
            self.index
                .lock()
                .insert(persisted.variant_key.clone(), vary_names, entry);
        for evicted in &removal.entries {
            self.store.remove_meta(&evicted.entry_id);
        }
        for hash in &removal.unreferenced_blobs {
            self.store.remove_blob(hash);
        }
        Ok(())
    }

    /// Removes entries whose staleness has outlived the grace window,
    /// inspecting at most `batch_size` metadata files per run.
    pub(super) async fn sweep_expired_entries(
        &self,
        batch_size: usize,
        stale_grace: Duration,
    ) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        if batch_size == 0 {
            return Ok(stats);
        }
        let now = SystemTime::now();

        let meta_files = {
            let meta_root = self.store.meta_root();
            tokio::task::spawn_blocking(move || shard_files(&meta_root, Some("json")))
                .await
                .map_err(|err| anyhow::anyhow!("cache sweep scan failed: {err}"))??
        };

        for path in meta_files {
            if stats.inspected >= batch_size {
                break;
            }
            stats.inspected += 1;

            let data = match async_fs::read(&path).await {
                Ok(data) => data,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let persisted: PersistedEntry = match serde_json::from_slice(&data) {
                Ok(value) => value,
                Err(_) => continue,
            };

            let stored_at = SystemTime::UNIX_EPOCH + Duration::from_secs(persisted.stored_at);
            let lifetime = Duration::from_secs(persisted.freshness_secs)
                .saturating_sub(Duration::from_secs(persisted.initial_age_secs));
            let expired_for = now
                .duration_since(stored_at + lifetime)
                .unwrap_or(Duration::ZERO);
            if expired_for <= stale_grace {
                continue;
            }

            let removal = self
                .index
                .lock()
                .remove_by_variant_key(&persisted.variant_key);
            self.remove_files_async(removal).await;

            // The entry may already be gone from the index (restart, byte-cap
            // eviction of a newer generation); its files still need removing.
            if let Some(entry_id) = path.file_stem().and_then(|s| s.to_str()) {
                self.store.remove_meta_async(entry_id).await;
            }
            // A tampered meta file may carry a hash too short to shard into
            // a blob path; only well-formed hashes are worth resolving.
            if let Some(hash) = &persisted.content_hash
                && valid_content_hash(hash)
                && !self.index.lock().blob_is_referenced(hash)
            {
                self.store.remove_blob_async(hash).await;
            }

            stats.removed += 1;
            stats.bytes_reclaimed = stats.bytes_reclaimed.saturating_add(persisted.content_length);
        }

        Ok(stats)
    }
}
