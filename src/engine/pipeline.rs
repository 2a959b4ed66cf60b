// Resolve orchestration: cache check, raw fetch, transform, commit.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::flight::SingleFlight;
use super::key::{CacheKey, Dimensions};
use super::stats::{StatsCollector, StatsSnapshot};
use super::store::CacheStore;
use super::transform::{CommandTransformer, Transformer};
use crate::config::ProxyConfig;
use crate::error::ResolveError;
use crate::source::http_source::HttpSource;
use crate::source::traits::ImageSource;

type Resolved = Result<Bytes, ResolveError>;

/// Turns `(url, dims)` into image bytes, computing each resolved artifact at
/// most once per concurrent burst of identical requests.
///
/// ```text
/// START -> CACHE_CHECK -> HIT: read, return
///                      -> MISS: FETCH_RAW -> TRANSFORM -> COMMIT -> return
/// ```
///
/// Nothing is retried; every failure ends the call and the caller may simply
/// call `resolve` again.
pub struct Pipeline {
    store: CacheStore,
    source: Arc<dyn ImageSource>,
    transformer: Arc<dyn Transformer>,
    resolved_flights: SingleFlight<Resolved>,
    raw_flights: SingleFlight<Result<PathBuf, ResolveError>>,
    stats: StatsCollector,
}

impl Pipeline {
    /// Wire the HTTP fetcher and subprocess transformer from `config`.
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let store = CacheStore::new(&config.cache_dir);
        let source = HttpSource::new(&config.upstream_scheme, config.fetch_timeout)?;
        let transformer = CommandTransformer::new(config, store.staging_dir());
        Ok(Self::with_parts(store, Arc::new(source), Arc::new(transformer)))
    }

    pub fn with_parts(
        store: CacheStore,
        source: Arc<dyn ImageSource>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        Self {
            store,
            source,
            transformer,
            resolved_flights: SingleFlight::new(),
            raw_flights: SingleFlight::new(),
            stats: StatsCollector::new(),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// `url` is the scheme-less `host/path` the client asked for, already
    /// checked against the host and extension allow-lists.
    pub async fn resolve(&self, url: &str, dims: Dimensions) -> Resolved {
        self.stats.record_request();

        let result = self.resolve_inner(url, dims).await;
        match &result {
            Ok(bytes) => self.stats.record_served(bytes.len() as u64),
            Err(e) => {
                self.stats.record_failure();
                warn!(
                    "resolve {} at {} failed stage={}: {}",
                    url,
                    dims,
                    e.kind(),
                    e
                );
            }
        }
        result
    }

    async fn resolve_inner(&self, url: &str, dims: Dimensions) -> Resolved {
        let key = CacheKey::derive(url)?;

        if let Some(bytes) = self.read_cached(&key, dims).await? {
            self.stats.record_hit();
            info!("cache hit {}/{}", dims, key);
            return Ok(bytes);
        }

        self.stats.record_miss();
        info!("cache miss {}/{} url={}", dims, key, url);

        let id = format!("{}/{}", dims, key);
        let joined = self
            .resolved_flights
            .run(&id, || self.populate(url, &key, dims))
            .await;
        if !joined.leader {
            self.stats.record_coalesced();
            debug!("{} answered by an in-flight resolve", id);
        }
        joined.value
    }

    /// Read the resolved artifact if present. A file that disappears between
    /// lookup and read counts as a miss.
    async fn read_cached(
        &self,
        key: &CacheKey,
        dims: Dimensions,
    ) -> Result<Option<Bytes>, ResolveError> {
        let Some(artifact) = self.store.lookup_resolved(key, dims).await else {
            return Ok(None);
        };
        match self.store.read(&artifact).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.not_found => {
                debug!("{} vanished after lookup, treating as miss", artifact.path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn populate(&self, url: &str, key: &CacheKey, dims: Dimensions) -> Resolved {
        // A flight for this triple may have committed just before we joined.
        if let Some(bytes) = self.read_cached(key, dims).await? {
            return Ok(bytes);
        }

        let raw = self.ensure_raw(url, key).await?;

        self.stats.record_transform();
        debug!("transforming {} to {}", raw.display(), dims);
        let bytes = self
            .transformer
            .transform(&raw, dims)
            .await
            .map_err(|source| ResolveError::TransformFailed { dims, source })?;

        self.store.write_resolved(key, dims, bytes.clone()).await?;
        info!("resolved {}/{} ({} bytes)", dims, key, bytes.len());
        Ok(bytes)
    }

    /// Path of the raw download, fetching it when no earlier request did.
    async fn ensure_raw(&self, url: &str, key: &CacheKey) -> Result<PathBuf, ResolveError> {
        if let Some(raw) = self.store.lookup_raw(key).await {
            self.stats.record_raw_reuse();
            debug!("raw {} reused", key);
            return Ok(raw.path);
        }

        let joined = self
            .raw_flights
            .run(key.as_str(), || async {
                if let Some(raw) = self.store.lookup_raw(key).await {
                    return Ok(raw.path);
                }
                self.stats.record_fetch();
                self.source
                    .fetch(url, &self.store.raw_path(key))
                    .await
                    .map_err(|source| ResolveError::FetchFailed {
                        url: url.to_string(),
                        source,
                    })
            })
            .await;
        joined.value
    }
}
