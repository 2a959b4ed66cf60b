// Two-stage external transform: super-resolution upscale, then exact resize.
//
// Both tools are invoked directly with an argument vector. Each call works in
// its own temporary directory under the staging area, which is removed when
// the call returns on every path.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, warn};

use super::key::Dimensions;
use crate::config::{ProxyConfig, UpscalerConfig};
use crate::error::{Stage, TransformError};

#[async_trait]
pub trait Transformer: Send + Sync {
    /// Produce the bytes of `raw` scaled to exactly `dims`.
    async fn transform(&self, raw: &Path, dims: Dimensions) -> Result<Bytes, TransformError>;
}

/// Runs the configured upscaler and resizer as subprocesses.
pub struct CommandTransformer {
    upscaler: UpscalerConfig,
    resizer: PathBuf,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl CommandTransformer {
    pub fn new(config: &ProxyConfig, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            upscaler: config.upscaler.clone(),
            resizer: config.resizer.clone(),
            staging_dir: staging_dir.into(),
            timeout: config.transform_timeout,
        }
    }

    /// `<tool> -i <input> -o <output> -n <model> -f <format> -s <factor>`
    fn upscale_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-o".into(),
            output.as_os_str().to_owned(),
            "-n".into(),
            self.upscaler.model.clone().into(),
            "-f".into(),
            self.upscaler.format.clone().into(),
            "-s".into(),
            self.upscaler.factor.to_string().into(),
        ]
    }

    /// `<tool> <path> -resize <w>x<h> <path>`, in place.
    fn resize_args(path: &Path, dims: Dimensions) -> Vec<OsString> {
        vec![
            path.as_os_str().to_owned(),
            "-resize".into(),
            dims.to_string().into(),
            path.as_os_str().to_owned(),
        ]
    }

    /// Upscale `raw` into `work`, then resize `work` in place.
    async fn run_stages(
        &self,
        raw: &Path,
        work: &Path,
        dims: Dimensions,
    ) -> Result<Bytes, TransformError> {
        self.run(
            Stage::Upscale,
            &self.upscaler.program,
            self.upscale_args(raw, work),
            work,
        )
        .await?;

        self.run(
            Stage::Resize,
            &self.resizer,
            Self::resize_args(work, dims),
            work,
        )
        .await?;

        let bytes = tokio::fs::read(work).await.map_err(|e| TransformError::Io {
            stage: Stage::Resize,
            reason: e.to_string(),
        })?;
        Ok(Bytes::from(bytes))
    }

    async fn run(
        &self,
        stage: Stage,
        program: &Path,
        args: Vec<OsString>,
        expected_output: &Path,
    ) -> Result<(), TransformError> {
        debug!("{} stage: {} {:?}", stage, program.display(), args);

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransformError::Io {
                stage,
                reason: format!("spawn {}: {}", program.display(), e),
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| TransformError::Io {
                stage,
                reason: e.to_string(),
            })?,
            Err(_) => {
                warn!("{} stage timed out after {:?}", stage, self.timeout);
                return Err(TransformError::Timeout { stage });
            }
        };

        let diagnostics = diagnostics(&output.stdout, &output.stderr);
        if !output.status.success() {
            warn!("{} stage exited with {}: {}", stage, output.status, diagnostics);
            return Err(TransformError::Failed {
                stage,
                status: output.status.to_string(),
                diagnostics,
            });
        }

        let produced = tokio::fs::metadata(expected_output)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !produced {
            warn!(
                "{} stage exited cleanly but wrote no {}",
                stage,
                expected_output.display()
            );
            return Err(TransformError::Failed {
                stage,
                status: format!("{} (no output file)", output.status),
                diagnostics,
            });
        }

        Ok(())
    }
}

fn diagnostics(stdout: &[u8], stderr: &[u8]) -> String {
    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    match (out.trim(), err.trim()) {
        ("", "") => String::new(),
        (o, "") => o.to_string(),
        ("", e) => e.to_string(),
        (o, e) => format!("{}\n{}", o, e),
    }
}

#[async_trait]
impl Transformer for CommandTransformer {
    async fn transform(&self, raw: &Path, dims: Dimensions) -> Result<Bytes, TransformError> {
        let staging = self.staging_dir.clone();
        let work_dir = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&staging)?;
            tempfile::Builder::new()
                .prefix("transform-")
                .tempdir_in(&staging)
        })
        .await
        .map_err(|e| e.to_string())
        .and_then(|r| r.map_err(|e| e.to_string()))
        .map_err(|reason| TransformError::Io {
            stage: Stage::Upscale,
            reason,
        })?;
        let work = work_dir
            .path()
            .join(format!("{}.{}", dims, self.upscaler.format));

        let result = self.run_stages(raw, &work, dims).await;

        // On cancellation the guard's own drop removes the directory instead.
        let cleanup = tokio::task::spawn_blocking(move || work_dir.close()).await;
        if let Ok(Err(e)) = cleanup {
            warn!("removing transform work dir failed: {}", e);
        }

        let bytes = result?;
        debug!("transform of {} to {} produced {} bytes", raw.display(), dims, bytes.len());
        Ok(bytes)
    }
}
