//! Directory-backed cache store keyed by source URL.
//!
//! Entries live at `<cache dir>/data/<first two hex digits>/<remaining digits>`
//! where the digits are the SHA-256 of the source URL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ferry_core::{CacheParameters, CacheStore};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use crate::copy::copy_atomically;
use crate::error::{FsOpsError, FsOpsResult};
use crate::mover::DEFAULT_CHUNK_SIZE;

/// Hex SHA-256 of a source location.
#[must_use]
pub fn cache_key(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Cache store writing into the first configured cache directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCacheStore;

impl FsCacheStore {
    /// Where the entry for `source` lives under `root`.
    #[must_use]
    pub fn entry_path(root: &Path, source: &str) -> PathBuf {
        let key = cache_key(source);
        let (prefix, rest) = key.split_at(2);
        root.join("data").join(prefix).join(rest)
    }

    async fn lookup(params: &CacheParameters, source: &str) -> FsOpsResult<Option<PathBuf>> {
        for dir in params.lookup_dirs() {
            let candidate = Self::entry_path(Path::new(dir), source);
            let present = fs::try_exists(&candidate)
                .await
                .map_err(|err| FsOpsError::io("cache.lookup", &candidate, err))?;
            if present {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn store(params: &CacheParameters, source: &str, data: &Path) -> FsOpsResult<PathBuf> {
        let root = params.cache_dirs.first().ok_or(FsOpsError::InvalidInput {
            field: "cache_dirs",
            reason: "no writable cache directory configured",
            value: None,
        })?;
        let entry = Self::entry_path(Path::new(root), source);
        let bytes = copy_atomically(data, &entry, DEFAULT_CHUNK_SIZE, |_| Ok(())).await?;
        debug!(entry = %entry.display(), bytes, "cache entry written");
        Ok(entry)
    }

    async fn evict(params: &CacheParameters, source: &str) -> FsOpsResult<()> {
        for dir in params.cache_dirs.iter().chain(&params.draining_dirs) {
            let entry = Self::entry_path(Path::new(dir), source);
            match fs::remove_file(&entry).await {
                Ok(()) => debug!(entry = %entry.display(), "cache entry removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(FsOpsError::io("cache.remove", entry, err)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, params: &CacheParameters, key: &str) -> anyhow::Result<Option<PathBuf>> {
        Ok(Self::lookup(params, key).await?)
    }

    async fn put(&self, params: &CacheParameters, key: &str, data: &Path) -> anyhow::Result<PathBuf> {
        Ok(Self::store(params, key, data).await?)
    }

    async fn remove(&self, params: &CacheParameters, key: &str) -> anyhow::Result<()> {
        Ok(Self::evict(params, key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dirs: &[&Path], readonly: &[&Path]) -> CacheParameters {
        let text = |paths: &[&Path]| paths.iter().map(|p| p.display().to_string()).collect();
        CacheParameters {
            cache_dirs: text(dirs),
            readonly_dirs: text(readonly),
            draining_dirs: Vec::new(),
        }
    }

    #[test]
    fn keys_are_sha256_hex() {
        assert_eq!(
            cache_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let path = FsCacheStore::entry_path(Path::new("/cache"), "abc");
        assert_eq!(
            path,
            PathBuf::from(
                "/cache/data/ba/7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            )
        );
    }

    #[tokio::test]
    async fn put_then_get_then_remove() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("download.dat");
        std::fs::write(&data, b"payload")?;
        let cache_root = dir.path().join("cache");
        let params = params(&[&cache_root], &[]);
        let store = FsCacheStore;
        let source = "gsiftp://remote/file.dat";

        assert!(store.get(&params, source).await?.is_none());
        let entry = store.put(&params, source, &data).await?;
        assert!(entry.starts_with(cache_root.join("data")));
        assert_eq!(std::fs::read(&entry)?, b"payload");
        assert_eq!(store.get(&params, source).await?, Some(entry.clone()));

        store.remove(&params, source).await?;
        assert!(!entry.exists());
        assert!(store.get(&params, source).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn readonly_directories_serve_hits() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let readonly = dir.path().join("shared");
        let source = "https://remote/shared.dat";
        let entry = FsCacheStore::entry_path(&readonly, source);
        std::fs::create_dir_all(entry.parent().expect("parent"))?;
        std::fs::write(&entry, b"shared")?;

        let params = params(&[&dir.path().join("private")], &[&readonly]);
        assert_eq!(FsCacheStore.get(&params, source).await?, Some(entry));
        Ok(())
    }

    #[tokio::test]
    async fn put_requires_a_writable_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("download.dat");
        std::fs::write(&data, b"payload").expect("write");
        let err = FsCacheStore
            .put(&CacheParameters::default(), "https://remote/x", &data)
            .await
            .expect_err("no cache dir");
        assert!(err.downcast_ref::<FsOpsError>().is_some());
    }
}
