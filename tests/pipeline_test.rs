// Resolve pipeline behaviour checked with counting test doubles.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use upscale_proxy::engine::key::{CacheKey, Dimensions};
use upscale_proxy::engine::pipeline::Pipeline;
use upscale_proxy::engine::store::CacheStore;
use upscale_proxy::engine::transform::Transformer;
use upscale_proxy::error::{FetchError, ResolveError, Stage, TransformError};
use upscale_proxy::source::traits::ImageSource;

const URL: &str = "ftp.pl/photos/cat.jpg";

type Events = Arc<Mutex<Vec<String>>>;

struct FakeSource {
    calls: AtomicUsize,
    fail: bool,
    delay: Duration,
    events: Events,
}

#[async_trait]
impl ImageSource for FakeSource {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(format!("fetch {}", url));
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(FetchError::Status(404));
        }
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, format!("raw:{}", url)).unwrap();
        Ok(dest.to_path_buf())
    }
}

struct FakeTransformer {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
    events: Events,
    seen: Mutex<Vec<(PathBuf, Dimensions)>>,
}

#[async_trait]
impl Transformer for FakeTransformer {
    async fn transform(&self, raw: &Path, dims: Dimensions) -> Result<Bytes, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(format!("transform {}", dims));
        self.seen.lock().push((raw.to_path_buf(), dims));
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransformError::Failed {
                stage: Stage::Upscale,
                status: "exit status: 1".to_string(),
                diagnostics: "no gpu".to_string(),
            });
        }
        let raw_bytes = std::fs::read(raw).unwrap();
        let mut out = raw_bytes;
        out.extend_from_slice(format!(" @{}", dims).as_bytes());
        Ok(Bytes::from(out))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    pipeline: Arc<Pipeline>,
    source: Arc<FakeSource>,
    transformer: Arc<FakeTransformer>,
    events: Events,
}

struct Options {
    fetch_fails: bool,
    transform_fails: bool,
    delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            fetch_fails: false,
            transform_fails: false,
            delay: Duration::ZERO,
        }
    }
}

impl Harness {
    fn new(opts: Options) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(FakeSource {
            calls: AtomicUsize::new(0),
            fail: opts.fetch_fails,
            delay: opts.delay,
            events: events.clone(),
        });
        let transformer = Arc::new(FakeTransformer {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(opts.transform_fails),
            delay: opts.delay,
            events: events.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::with_parts(
            CacheStore::new(dir.path()),
            source.clone(),
            transformer.clone(),
        );
        Self {
            _dir: dir,
            pipeline: Arc::new(pipeline),
            source,
            transformer,
            events,
        }
    }

    fn fetches(&self) -> usize {
        self.source.calls.load(Ordering::SeqCst)
    }

    fn transforms(&self) -> usize {
        self.transformer.calls.load(Ordering::SeqCst)
    }

    fn resolved_path(&self, dims: Dimensions) -> PathBuf {
        let key = CacheKey::derive(URL).unwrap();
        self.pipeline.store().resolved_path(&key, dims)
    }
}

fn dims(w: u32, h: u32) -> Dimensions {
    Dimensions::new(w, h).unwrap()
}

#[tokio::test]
async fn test_cache_hit_short_circuits() {
    let h = Harness::new(Options::default());
    let path = h.resolved_path(dims(800, 600));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"cached bytes").unwrap();

    let bytes = h.pipeline.resolve(URL, dims(800, 600)).await.unwrap();

    assert_eq!(&bytes[..], b"cached bytes");
    assert_eq!(h.fetches(), 0);
    assert_eq!(h.transforms(), 0);
    assert_eq!(h.pipeline.stats().cache_hits, 1);
}

#[tokio::test]
async fn test_cache_miss_runs_pipeline_in_order() {
    let h = Harness::new(Options::default());
    let d = dims(800, 600);

    let bytes = h.pipeline.resolve(URL, d).await.unwrap();

    assert_eq!(
        *h.events.lock(),
        vec![format!("fetch {}", URL), "transform 800x600".to_string()]
    );
    let key = CacheKey::derive(URL).unwrap();
    let seen = h.transformer.seen.lock().clone();
    assert_eq!(seen, vec![(h.pipeline.store().raw_path(&key), d)]);

    // Committed before returning.
    assert_eq!(std::fs::read(h.resolved_path(d)).unwrap(), bytes.to_vec());
    assert_eq!(&bytes[..], format!("raw:{} @800x600", URL).as_bytes());
}

#[tokio::test]
async fn test_transform_failure_leaves_no_resolved_artifact() {
    let h = Harness::new(Options {
        transform_fails: true,
        ..Options::default()
    });
    let d = dims(800, 600);

    let err = h.pipeline.resolve(URL, d).await.unwrap_err();

    assert!(matches!(err, ResolveError::TransformFailed { .. }));
    assert!(!h.resolved_path(d).exists());
    assert_eq!(h.pipeline.stats().failures, 1);
}

#[tokio::test]
async fn test_failure_is_not_remembered() {
    let h = Harness::new(Options {
        transform_fails: true,
        ..Options::default()
    });
    let d = dims(800, 600);

    assert!(h.pipeline.resolve(URL, d).await.is_err());
    h.transformer.fail.store(false, Ordering::SeqCst);
    assert!(h.pipeline.resolve(URL, d).await.is_ok());

    // The raw download from the first attempt is reused.
    assert_eq!(h.fetches(), 1);
    assert_eq!(h.transforms(), 2);
}

#[tokio::test]
async fn test_fetch_failure() {
    let h = Harness::new(Options {
        fetch_fails: true,
        ..Options::default()
    });

    let err = h.pipeline.resolve(URL, dims(800, 600)).await.unwrap_err();

    assert_eq!(
        err,
        ResolveError::FetchFailed {
            url: URL.to_string(),
            source: FetchError::Status(404),
        }
    );
    assert_eq!(h.transforms(), 0);
    assert!(!h.resolved_path(dims(800, 600)).exists());
}

#[tokio::test]
async fn test_resolve_twice_serves_from_cache() {
    let h = Harness::new(Options::default());
    let d = dims(800, 600);

    let first = h.pipeline.resolve(URL, d).await.unwrap();
    let second = h.pipeline.resolve(URL, d).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.fetches(), 1);
    assert_eq!(h.transforms(), 1);

    let stats = h.pipeline.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn test_raw_tier_reused_across_resolutions() {
    let h = Harness::new(Options::default());

    h.pipeline.resolve(URL, dims(800, 600)).await.unwrap();
    h.pipeline.resolve(URL, dims(400, 300)).await.unwrap();

    assert_eq!(h.fetches(), 1);
    assert_eq!(h.transforms(), 2);
    assert!(h.resolved_path(dims(800, 600)).exists());
    assert!(h.resolved_path(dims(400, 300)).exists());
    assert_eq!(h.pipeline.stats().raw_reuses, 1);
}

#[tokio::test]
async fn test_url_without_extension_is_invalid_input() {
    let h = Harness::new(Options::default());

    let err = h
        .pipeline
        .resolve("ftp.pl/photos/cat", dims(800, 600))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::InvalidInput(_)));
    assert_eq!(h.fetches(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_requests_compute_once() {
    let h = Harness::new(Options {
        delay: Duration::from_millis(100),
        ..Options::default()
    });
    let d = dims(640, 480);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pipeline = h.pipeline.clone();
        handles.push(tokio::spawn(async move { pipeline.resolve(URL, d).await }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(h.fetches(), 1);
    assert_eq!(h.transforms(), 1);
    assert_eq!(
        std::fs::read(h.resolved_path(d)).unwrap(),
        results[0].to_vec()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolutions_share_one_download() {
    let h = Harness::new(Options {
        delay: Duration::from_millis(100),
        ..Options::default()
    });

    let a = {
        let p = h.pipeline.clone();
        tokio::spawn(async move { p.resolve(URL, dims(800, 600)).await })
    };
    let b = {
        let p = h.pipeline.clone();
        tokio::spawn(async move { p.resolve(URL, dims(400, 300)).await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_ne!(a, b);
    assert_eq!(h.fetches(), 1);
    assert_eq!(h.transforms(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_reach_every_caller() {
    let h = Harness::new(Options {
        transform_fails: true,
        delay: Duration::from_millis(100),
        ..Options::default()
    });
    let d = dims(320, 240);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pipeline = h.pipeline.clone();
        handles.push(tokio::spawn(async move { pipeline.resolve(URL, d).await }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ResolveError::TransformFailed { .. }));
    }

    assert_eq!(h.transforms(), 1);
    assert!(!h.resolved_path(d).exists());
}

#[tokio::test]
async fn test_commit_failure_is_storage_failed() {
    let h = Harness::new(Options::default());
    let d = dims(800, 600);
    // A plain file where the resolution directory belongs.
    let blocker = h.resolved_path(d).parent().unwrap().to_path_buf();
    std::fs::write(&blocker, b"not a directory").unwrap();

    let err = h.pipeline.resolve(URL, d).await.unwrap_err();

    assert!(matches!(err, ResolveError::StorageFailed(_)));
    assert_eq!(h.transforms(), 1);
    assert!(std::fs::read(h.resolved_path(d)).is_err());
    assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory");
    assert_eq!(h.pipeline.stats().failures, 1);
}

#[tokio::test]
async fn test_removed_resolved_artifact_is_recomputed() {
    let h = Harness::new(Options::default());
    let d = dims(800, 600);

    let first = h.pipeline.resolve(URL, d).await.unwrap();
    std::fs::remove_file(h.resolved_path(d)).unwrap();
    let second = h.pipeline.resolve(URL, d).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.fetches(), 1);
    assert_eq!(h.transforms(), 2);
    assert_eq!(h.pipeline.stats().cache_misses, 2);
    assert!(h.resolved_path(d).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_artifact_removed_during_reads_is_never_a_read_failure() {
    let h = Harness::new(Options::default());
    let d = dims(800, 600);
    h.pipeline.resolve(URL, d).await.unwrap();

    let path = h.resolved_path(d);
    let stop = Arc::new(AtomicBool::new(false));
    let remover = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::SeqCst) {
                let _ = std::fs::remove_file(&path);
            }
        })
    };

    for _ in 0..200 {
        let result = h.pipeline.resolve(URL, d).await;
        assert!(
            !matches!(result, Err(ResolveError::ReadFailed(_))),
            "{:?}",
            result
        );
    }

    stop.store(true, Ordering::SeqCst);
    remover.await.unwrap();
}
