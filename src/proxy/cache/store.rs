use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use blake3::Hasher;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

use super::PersistedEntry;

const BLOB_DIR: &str = "blobs";
const META_DIR: &str = "meta";

/// On-disk layout under the cache directory: content-addressed blob files in
/// `blobs/aa/bb/<hash>` and per-entry metadata in `meta/aa/bb/<entry_id>.json`.
/// In-flight downloads land in `tmp_<uuid>` files at the root and are renamed
/// into place on completion.
#[derive(Debug, Clone)]
pub(super) struct BlobStore {
    cache_dir: PathBuf,
}

fn sharded(root: PathBuf, name: &str) -> PathBuf {
    let (first, remainder) = name.split_at(2);
    let (second, _) = remainder.split_at(2);
    root.join(first).join(second).join(name)
}

impl BlobStore {
    pub(super) fn open(cache_dir: PathBuf) -> Result<Self> {
        ensure!(
            cache_dir.is_dir(),
            "cache directory {} does not exist",
            cache_dir.display()
        );
        fs::create_dir_all(cache_dir.join(BLOB_DIR))
            .with_context(|| format!("failed to create {}/{BLOB_DIR}", cache_dir.display()))?;
        fs::create_dir_all(cache_dir.join(META_DIR))
            .with_context(|| format!("failed to create {}/{META_DIR}", cache_dir.display()))?;
        Ok(Self { cache_dir })
    }

    pub(super) fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub(super) fn blob_root(&self) -> PathBuf {
        self.cache_dir.join(BLOB_DIR)
    }

    pub(super) fn meta_root(&self) -> PathBuf {
        self.cache_dir.join(META_DIR)
    }

    pub(super) fn blob_path(&self, content_hash: &str) -> PathBuf {
        sharded(self.blob_root(), content_hash)
    }

    pub(super) fn meta_path(&self, entry_id: &str) -> PathBuf {
        let mut path = sharded(self.meta_root(), entry_id);
        path.set_extension("json");
        path
    }

    pub(super) fn temp_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    pub(super) fn remove_temp_files(&self) -> Result<()> {
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| name.starts_with("tmp_"))
                    .unwrap_or(false)
            {
                fs::remove_file(&path).ok();
            }
        }
        Ok(())
    }

    pub(super) fn content_hash_matches(&self, path: &Path, expected_hex: &str) -> bool {
        let mut file = match fs::File::open(path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        let mut hasher = Hasher::new();
        let mut buf = [0u8; 8192];
        loop {
            match std::io::Read::read(&mut file, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    hasher.update(&buf[..n]);
                }
                Err(_) => return false,
            }
        }
        hasher.finalize().to_hex().to_string() == expected_hex
    }

    pub(super) async fn remove_meta_async(&self, entry_id: &str) {
        let path = self.meta_path(entry_id);
        let _ = async_fs::remove_file(&path).await;
        self.prune_empty_shards(&path).await;
    }

    pub(super) async fn remove_blob_async(&self, content_hash: &str) {
        let path = self.blob_path(content_hash);
        let _ = async_fs::remove_file(&path).await;
        self.prune_empty_shards(&path).await;
    }

    pub(super) fn remove_meta(&self, entry_id: &str) {
        fs::remove_file(self.meta_path(entry_id)).ok();
    }

    pub(super) fn remove_blob(&self, content_hash: &str) {
        fs::remove_file(self.blob_path(content_hash)).ok();
    }

    async fn dir_is_empty(path: &Path) -> bool {
        let mut entries = match async_fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        match entries.next_entry().await {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => false,
        }
    }

    async fn prune_empty_shards(&self, leaf: &Path) {
        let shard2 = match leaf.parent() {
            Some(path) => path.to_path_buf(),
            None => return,
        };
        if Self::dir_is_empty(&shard2).await {
            let _ = async_fs::remove_dir(&shard2).await;
        }
        let shard1 = match shard2.parent() {
            Some(path) => path.to_path_buf(),
            None => return,
        };
        if shard1 == self.blob_root() || shard1 == self.meta_root() {
            return;
        }
        if Self::dir_is_empty(&shard1).await {
            let _ = async_fs::remove_dir(&shard1).await;
        }
    }

    pub(super) async fn write_metadata_async(
        &self,
        entry_id: &str,
        entry: &PersistedEntry,
    ) -> Result<()> {
        let meta_path = self.meta_path(entry_id);
        if let Some(parent) = meta_path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create cache shard {}", parent.display()))?;
        }
        let data = serde_json::to_vec(entry)?;
        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let mut file = options
            .open(&meta_path)
            .await
            .with_context(|| format!("failed to write cache metadata {}", meta_path.display()))?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_are_sharded_by_prefix() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf()).unwrap();
        let hash = "deadbeefcafe";
        assert_eq!(
            store.blob_path(hash),
            dir.path().join("blobs").join("de").join("ad").join(hash)
        );
        assert_eq!(
            store.meta_path(hash),
            dir.path()
                .join("meta")
                .join("de")
                .join("ad")
                .join(format!("{hash}.json"))
        );
    }

    #[test]
    fn open_requires_existing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(BlobStore::open(missing).is_err());
    }

    #[test]
    fn remove_temp_files_only_touches_temp_names() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf()).unwrap();
        let temp = store.temp_path("tmp_abc123");
        let keeper = dir.path().join("keep.txt");
        fs::write(&temp, b"partial").unwrap();
        fs::write(&keeper, b"kept").unwrap();

        store.remove_temp_files().unwrap();
        assert!(!temp.exists());
        assert!(keeper.exists());
    }

    #[test]
    fn content_hash_matches_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf()).unwrap();
        let body = b"hello world";
        let hash = blake3::hash(body).to_hex().to_string();
        let path = store.blob_path(&hash);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();

        assert!(store.content_hash_matches(&path, &hash));
        fs::write(&path, b"hello worlx").unwrap();
        assert!(!store.content_hash_matches(&path, &hash));
    }

    #[tokio::test]
    async fn removing_last_file_prunes_shard_dirs() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf()).unwrap();
        let hash = "aabbccdd";
        let path = store.blob_path(hash);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"x").unwrap();

        store.remove_blob_async(hash).await;
        assert!(!path.exists());
        assert!(!dir.path().join("blobs").join("aa").exists());
        assert!(dir.path().join("blobs").exists());
    }
}
