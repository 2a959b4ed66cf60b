use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::FetchError;

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Download `url` (scheme-less `host/path`) into `dest`.
    ///
    /// On success `dest` holds the complete body. On failure nothing is left
    /// at `dest` or beside it.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf, FetchError>;
}
