use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::traits::ImageSource;
use crate::error::FetchError;

/// Plain GET fetcher. One request per call, no retries.
pub struct HttpSource {
    client: Client,
    scheme: String,
}

impl HttpSource {
    pub fn new(scheme: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            scheme: scheme.into(),
        })
    }

    /// Full upstream URL for a scheme-less `host/path`.
    pub fn upstream_url(&self, url: &str) -> String {
        format!("{}://{}", self.scheme, url)
    }
}

fn request_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

fn io_error(e: std::io::Error) -> FetchError {
    FetchError::Io(e.to_string())
}

#[async_trait]
impl ImageSource for HttpSource {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf, FetchError> {
        let upstream = self.upstream_url(url);
        debug!("http fetch {}", upstream);

        let mut resp = self
            .client
            .get(&upstream)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if !status.is_success() {
            warn!("http fetch failed status={} url={}", status.as_u16(), upstream);
            return Err(FetchError::Status(status.as_u16()));
        }

        let dir = dest
            .parent()
            .ok_or_else(|| FetchError::Io(format!("{} has no parent", dest.display())))?;
        tokio::fs::create_dir_all(dir).await.map_err(io_error)?;

        // Stream into a sibling temp file; it is deleted on drop unless persisted.
        let tmp = NamedTempFile::new_in(dir).map_err(io_error)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen().map_err(io_error)?);

        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await.map_err(request_error)? {
            file.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        drop(file);

        tmp.persist(dest).map_err(|e| io_error(e.error))?;
        debug!("http fetch {} done ({} bytes)", upstream, written);
        Ok(dest.to_path_buf())
    }
}
