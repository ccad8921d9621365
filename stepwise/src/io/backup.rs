//! Content-addressed store for pre-mutation snapshots (`.stepwise/backups/`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::debug;

/// SHA-256 of `bytes` as lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/<first two hex>/<hash>`.
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or("00");
        self.dir.join(shard).join(hash)
    }

    /// Store `bytes` and return their hash. Existing blobs are not rewritten.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = content_hash(bytes);
        let path = self.blob_path(&hash);
        if path.exists() {
            return Ok(hash);
        }
        let parent = path
            .parent()
            .with_context(|| format!("backup path missing parent {}", path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
        let tmp = parent.join(format!("{hash}.tmp"));
        fs::write(&tmp, bytes).with_context(|| format!("write backup {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("store backup {}", path.display()))?;
        debug!(%hash, bytes = bytes.len(), "stored backup");
        Ok(hash)
    }

    /// Load a blob and verify its hash.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash);
        let bytes = fs::read(&path).with_context(|| format!("read backup {}", path.display()))?;
        let actual = content_hash(&bytes);
        if actual != hash {
            return Err(anyhow!(
                "backup {} is corrupt (hash {actual})",
                path.display()
            ));
        }
        Ok(bytes)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_is_content_addressed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = BackupStore::new(temp.path().join("backups"));
        let hash = store.put(b"hello").expect("put");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(store.blob_path(&hash).ends_with(Path::new("2c").join(&hash)));
        assert_eq!(store.put(b"hello").expect("put again"), hash);
        assert_eq!(store.get(&hash).expect("get"), b"hello");
    }

    #[test]
    fn detects_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = BackupStore::new(temp.path());
        let hash = store.put(b"original").expect("put");
        fs::write(store.blob_path(&hash), b"tampered").expect("tamper");
        assert!(store.get(&hash).is_err());
    }
}
