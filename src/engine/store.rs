// On-disk artifact cache: a raw tier per source URL and a resolved tier per
// (key, width, height).
//
// Layout:
//   {root}/{key}               raw download
//   {root}/{w}x{h}/{key}       transformed image
//   {root}/.staging/           in-progress transforms and downloads

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::key::{CacheKey, Dimensions};
use crate::config::STAGING_DIR_NAME;
use crate::error::{ReadError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Raw,
    Resolved(Dimensions),
}

/// One stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: CacheKey,
    pub tier: Tier,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn raw_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn resolved_path(&self, key: &CacheKey, dims: Dimensions) -> PathBuf {
        self.root.join(dims.to_string()).join(key.as_str())
    }

    /// Scratch area for work that must never be mistaken for a cached artifact.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    /// Existence check only; content is not validated.
    pub async fn lookup_resolved(&self, key: &CacheKey, dims: Dimensions) -> Option<Artifact> {
        let path = self.resolved_path(key, dims);
        is_file(&path).await.then(|| Artifact {
            key: key.clone(),
            tier: Tier::Resolved(dims),
            path,
        })
    }

    pub async fn lookup_raw(&self, key: &CacheKey) -> Option<Artifact> {
        let path = self.raw_path(key);
        is_file(&path).await.then(|| Artifact {
            key: key.clone(),
            tier: Tier::Raw,
            path,
        })
    }

    /// Atomically place `data` at the resolved-tier path.
    ///
    /// The bytes go to a temp file in the target directory, are fsynced and
    /// then renamed over the final path, so concurrent writers of the same
    /// triple never leave a truncated or interleaved file. On failure the temp
    /// file is removed before the error is returned.
    pub async fn write_resolved(
        &self,
        key: &CacheKey,
        dims: Dimensions,
        data: Bytes,
    ) -> Result<Artifact, StoreError> {
        let path = self.resolved_path(key, dims);
        let target = path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&target, &data))
            .await
            .map_err(|e| StoreError {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .map_err(|e| {
                warn!("resolved write {} failed: {}", path.display(), e);
                StoreError {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;

        debug!("committed {}", path.display());
        Ok(Artifact {
            key: key.clone(),
            tier: Tier::Resolved(dims),
            path,
        })
    }

    /// Read the whole artifact. The file may have vanished since lookup; that
    /// is reported with `not_found` set rather than treated as fatal.
    pub async fn read(&self, artifact: &Artifact) -> Result<Bytes, ReadError> {
        tokio::fs::read(&artifact.path)
            .await
            .map(Bytes::from)
            .map_err(|e| ReadError {
                path: artifact.path.clone(),
                reason: e.to_string(),
                not_found: e.kind() == ErrorKind::NotFound,
            })
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Write-fsync-rename. Dropping the `NamedTempFile` on an error path deletes it.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("10x10").join("abc.jpg");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        let entries: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn write_atomic_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("10x10");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let err = write_atomic(&blocker.join("abc.jpg"), b"data");
        assert!(err.is_err());
    }
}
