use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Result, anyhow};
use blake3::Hasher;
use http::{HeaderMap, StatusCode};
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

use super::{CacheEntry, CacheKey, CacheState, EntryMeta, VaryKey};

/// Streams a response body into a temp file while hashing it. On `finish` the
/// temp file is renamed to its content-addressed blob path (a no-op when an
/// identical blob already exists) and the entry is registered in the index.
/// Bodies that exceed the per-entry limit are silently discarded; delivery to
/// the client is unaffected.
pub(crate) struct CacheWriter {
    file: AsyncFile,
    hasher: Hasher,
    temp_path: std::path::PathBuf,
    state: Arc<CacheState>,
    current_size: u64,
    key: CacheKey,
    vary: VaryKey,
    discard: bool,
    finished: bool,
}

impl CacheWriter {
    pub(super) fn new(
        file: AsyncFile,
        temp_path: std::path::PathBuf,
        state: Arc<CacheState>,
        key: CacheKey,
        vary: VaryKey,
    ) -> Self {
        Self {
            file,
            hasher: Hasher::new(),
            temp_path,
            state,
            current_size: 0,
            key,
            vary,
            discard: false,
            finished: false,
        }
    }

    pub(crate) fn discard(&mut self) {
        self.discard = true;
    }

    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.discard {
            return Ok(());
        }
        if self.current_size + chunk.len() as u64 > self.state.max_entry_size {
            trace!(
                "cache entry for {} exceeds size limit, discarding",
                self.key.key_base()
            );
            self.discard = true;
            return Ok(());
        }
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.current_size += chunk.len() as u64;
        Ok(())
    }

    /// Completes the entry. Returns true when the entry was stored, false
    /// when it was discarded (oversize or explicitly abandoned).
    pub(crate) async fn finish(
        mut self,
        status: StatusCode,
        headers: HeaderMap,
        meta: EntryMeta,
    ) -> Result<bool> {
        self.file.flush().await?;

        if self.discard {
            async_fs::remove_file(&self.temp_path).await.ok();
            self.finished = true;
            return Ok(false);
        }

        let content_hash = if self.current_size == 0 {
            async_fs::remove_file(&self.temp_path).await.ok();
            None
        } else {
            let hash = self.hasher.finalize().to_hex().to_string();
            let blob_path = self.state.store.blob_path(&hash);
            if async_fs::try_exists(&blob_path).await.unwrap_or(false) {
                // Identical body already on disk, the new copy is redundant.
                async_fs::remove_file(&self.temp_path).await.ok();
            } else {
                let shard_dir = blob_path
                    .parent()
                    .map(|path| path.to_path_buf())
                    .ok_or_else(|| anyhow!("blob path missing parent"))?;
                async_fs::create_dir_all(&shard_dir).await?;
                async_fs::rename(&self.temp_path, &blob_path).await?;
            }
            Some(hash)
        };

        let entry = CacheEntry {
            id: self.state.next_entry_id(),
            entry_id: self.key.entry_id().to_string(),
            key_base: self.key.key_base().to_string(),
            status,
            headers,
            vary: self.vary.clone(),
            stored_at: SystemTime::now(),
            initial_age: meta.initial_age,
            freshness: meta.freshness,
            validators: meta.validators,
            content_hash,
            content_length: self.current_size,
        };

        let persisted = entry.to_persisted(self.key.variant_key());

        if let Err(err) = self
            .state
            .store
            .write_metadata_async(self.key.entry_id(), &persisted)
            .await
        {
            warn!("failed to write cache metadata: {}", err);
            self.state.store.remove_meta_async(self.key.entry_id()).await;
            // The blob stays put. A writer that just deduplicated onto the
            // same hash is not in the index yet, so its reference is
            // invisible here; the startup rebuild reclaims blobs no entry
            // references.
            self.finished = true;
            return Ok(false);
        }

        let removal = self.state.index.lock().insert(
            self.key.variant_key().to_string(),
            self.vary.names(),
            entry,
        );
        trace!("stored cache entry for {}", self.key.key_base());

        self.state.remove_files_async(removal).await;

        self.finished = true;
        Ok(true)
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let temp_path = self.temp_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(temp_path).await;
            });
        } else {
            let _ = std::fs::remove_file(&temp_path);
        }
    }
}
