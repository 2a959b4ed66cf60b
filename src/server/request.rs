// Request parsing and validation for `/api/{W}x{H}/{host}/{path}`.

use reqwest::Url;

use crate::config::{ProxyConfig, ALLOWED_EXTENSIONS};
use crate::engine::key::Dimensions;

/// Why a request was turned away before reaching the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("invalid dimensions")]
    Dimensions,
    #[error("URL is not valid")]
    Url,
    #[error("host is not allowed")]
    Host,
    #[error("file extension is not allowed")]
    Extension,
}

/// A validated image request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub dims: Dimensions,
    /// Scheme-less `host/path`, exactly as requested. Hashed into the key.
    pub url: String,
}

impl ImageRequest {
    pub fn parse(dims: &str, rest: &str, config: &ProxyConfig) -> Result<Self, RequestError> {
        let dims = parse_dimensions(dims, config.max_dimension).ok_or(RequestError::Dimensions)?;

        let (host, path) = rest.split_once('/').ok_or(RequestError::Url)?;
        if host.is_empty() || path.is_empty() || rest.contains(&['?', '#'][..]) {
            return Err(RequestError::Url);
        }
        let upstream = Url::parse(&format!("{}://{}", config.upstream_scheme, rest))
            .map_err(|_| RequestError::Url)?;
        if upstream.host_str().is_none() {
            return Err(RequestError::Url);
        }

        if !config.is_allowed_host(host) {
            return Err(RequestError::Host);
        }
        if !has_allowed_extension(path) {
            return Err(RequestError::Extension);
        }

        Ok(Self {
            dims,
            url: rest.to_string(),
        })
    }
}

/// Parse `{width}x{height}`. Both sides must be plain decimal, non-zero and
/// no larger than `max`.
pub fn parse_dimensions(value: &str, max: u32) -> Option<Dimensions> {
    let (w, h) = value.split_once('x')?;
    let parse = |s: &str| -> Option<u32> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse::<u32>().ok().filter(|n| *n <= max)
    };
    Dimensions::new(parse(w)?, parse(h)?)
}

fn has_allowed_extension(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ALLOWED_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}
