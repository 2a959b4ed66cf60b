use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Extensions accepted for source images (compared case-insensitively).
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Longest extension kept in a cache key.
pub const MAX_EXTENSION_LEN: usize = 8;

/// Directory under the cache root holding in-progress transforms.
pub const STAGING_DIR_NAME: &str = ".staging";

/// Default filter when neither `RUST_LOG` nor `LOG_LEVEL` is set.
pub const DEFAULT_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn";

/// Settings for the external super-resolution tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpscalerConfig {
    /// Executable invoked for the upscale stage.
    pub program: PathBuf,
    /// Model name passed with `-n`.
    pub model: String,
    /// Multiplicative factor passed with `-s`.
    pub factor: u32,
    /// Output format passed with `-f`; also decides the served content type.
    pub format: String,
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("./lib/realesr/realesrgan-ncnn-vulkan"),
            model: "realesrgan-x4plus".to_string(),
            factor: 4,
            format: "jpg".to_string(),
        }
    }
}

impl UpscalerConfig {
    /// MIME type of the images the upscaler writes.
    pub fn content_type(&self) -> &'static str {
        match self.format.to_ascii_lowercase().as_str() {
            "png" => "image/png",
            "webp" => "image/webp",
            _ => "image/jpeg",
        }
    }
}

/// Top-level configuration for the proxy, passed explicitly into the
/// pipeline and the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,
    /// Root of the on-disk cache (raw and resolved tiers).
    pub cache_dir: PathBuf,
    /// Hosts images may be fetched from. Empty allows nothing.
    pub allowed_hosts: Vec<String>,
    /// Scheme used for upstream requests.
    pub upstream_scheme: String,
    pub upscaler: UpscalerConfig,
    /// Executable invoked for the resize stage.
    pub resizer: PathBuf,
    /// Whole-request budget for a source download.
    pub fetch_timeout: Duration,
    /// Budget for each of the two subprocess stages.
    pub transform_timeout: Duration,
    /// Largest accepted width or height.
    pub max_dimension: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            cache_dir: PathBuf::from("./var"),
            allowed_hosts: Vec::new(),
            upstream_scheme: "https".to_string(),
            upscaler: UpscalerConfig::default(),
            resizer: PathBuf::from("convert"),
            fetch_timeout: Duration::from_secs(30),
            transform_timeout: Duration::from_secs(300),
            max_dimension: 8192,
        }
    }
}

impl ProxyConfig {
    /// Check the settings that would otherwise only fail at request time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upscaler.factor == 0 {
            return Err(ConfigError::Invalid("upscale factor must be > 0".into()));
        }
        if self.upscaler.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("upscaler program is empty".into()));
        }
        if self.upscaler.model.is_empty() {
            return Err(ConfigError::Invalid("upscaler model is empty".into()));
        }
        if self.resizer.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("resizer program is empty".into()));
        }
        if self.fetch_timeout.is_zero() || self.transform_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        if self.max_dimension == 0 {
            return Err(ConfigError::Invalid("max_dimension must be > 0".into()));
        }
        match self.upstream_scheme.as_str() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Whether `host` is on the allow-list.
    pub fn is_allowed_host(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|h| h == host)
    }
}

/// Split a comma-separated host list, dropping blanks.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unsupported upstream scheme '{0}' (expected http or https)")]
    UnsupportedScheme(String),
}
