// Cache key derivation and target dimensions.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::config::MAX_EXTENSION_LEN;
use crate::error::KeyError;

/// Filesystem-safe identifier of a source URL: `<digest>.<ext>`.
///
/// The digest is SHA-256 over the exact URL string, base64url-encoded without
/// padding, so the key never contains `/`, `+` or `=`. The lower-cased
/// extension is kept as a suffix because the external tools sniff it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(url: &str) -> Result<Self, KeyError> {
        let extension = extension_of(url)?;
        let digest = Sha256::digest(url.as_bytes());
        let encoded = URL_SAFE_NO_PAD.encode(digest);
        Ok(Self(format!("{}.{}", encoded, extension)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extension of the final path segment, lower-cased.
fn extension_of(url: &str) -> Result<String, KeyError> {
    let segment = url.rsplit('/').next().unwrap_or(url);
    let (_, ext) = segment
        .rsplit_once('.')
        .ok_or_else(|| KeyError::MissingExtension(url.to_string()))?;

    if ext.is_empty() {
        return Err(KeyError::MissingExtension(url.to_string()));
    }
    if ext.len() > MAX_EXTENSION_LEN || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(KeyError::BadExtension(ext.to_string()));
    }
    Ok(ext.to_ascii_lowercase())
}

/// Target size of a resolved artifact. Both sides are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    width: u32,
    height: u32,
}

impl Dimensions {
    /// Returns `None` when either side is zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// `{width}x{height}`, also the resolved-tier directory name.
impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
