//! Cache lifecycle manager.
//!
//! `CacheWorker` answers the three lifecycle signals a host dispatches:
//!
//! - setup: precache the asset list into the current bucket
//! - intercept: cache-first lookup, network fallback, opportunistic store
//! - activate: delete every bucket that isn't the current one
//!
//! Writes of freshly fetched responses run as detached tasks and never
//! delay the response. `settle()` waits for them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Error};
use crate::metrics::{CacheMetrics, CacheStats};
use crate::models::{Request, Response};
use crate::network::Fetcher;
use crate::storage::{add_all, CacheStorage};

#[derive(Debug, Clone)]
pub struct SetupReport {
    pub cache_name: String,
    /// Entries written by the precache batch (0 if it failed)
    pub stored: usize,
    /// Why the precache batch failed, if it did
    pub error: Option<String>,
    /// Ask the host to activate without waiting for older workers to go away
    pub skip_waiting: bool,
}

#[derive(Debug, Clone)]
pub struct ActivateReport {
    /// Stale buckets that were removed
    pub deleted: Vec<String>,
    /// Ask the host to route every open client through this worker now
    pub claim_clients: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Response to hand back to the intercepted request
#[derive(Debug, Clone)]
pub struct Intercepted {
    pub response: Response,
    pub source: ResponseSource,
}

#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    async fn on_setup(&self) -> Result<SetupReport, CacheError>;

    async fn on_intercept(&self, request: Request) -> Result<Intercepted, Error>;

    async fn on_activate(&self) -> Result<ActivateReport, CacheError>;
}

pub struct CacheWorker {
    config: Arc<CacheConfig>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<CacheMetrics>,
    pending: Mutex<JoinSet<()>>,
}

impl CacheWorker {
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            fetcher,
            metrics: Arc::new(CacheMetrics::default()),
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    /// Wait for every detached cache write started so far.
    pub async fn settle(&self) {
        let mut writes = std::mem::take(&mut *self.pending.lock().await);
        while writes.join_next().await.is_some() {}
    }

    fn precache_requests(&self) -> Result<Vec<Request>, CacheError> {
        self.config
            .assets()
            .iter()
            .map(|asset| {
                self.config
                    .resolve(asset)
                    .map(Request::get)
                    .map_err(|source| CacheError::Fetch {
                        url: asset.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Best-effort write into the current bucket. Failures are dropped.
    async fn store_detached(&self, request: Request, response: Response) {
        let storage = Arc::clone(&self.storage);
        let config = Arc::clone(&self.config);
        let metrics = Arc::clone(&self.metrics);

        let mut pending = self.pending.lock().await;
        // Reap finished writes so a long-running host doesn't accumulate them
        while pending.try_join_next().is_some() {}

        pending.spawn(async move {
            let Ok(bucket) = storage.open(config.cache_name()).await else {
                return;
            };
            if bucket.put(&request, response).await.is_ok() {
                metrics.record_stored();
            }
        });
    }
}

#[async_trait]
impl LifecycleHandler for CacheWorker {
    async fn on_setup(&self) -> Result<SetupReport, CacheError> {
        let cache_name = self.config.cache_name().to_string();
        let bucket = self.storage.open(&cache_name).await?;

        let batch = match self.precache_requests() {
            Ok(requests) => add_all(bucket.as_ref(), self.fetcher.as_ref(), requests).await,
            Err(e) => Err(e),
        };

        let (stored, error) = match batch {
            Ok(stored) => {
                info!(bucket = %cache_name, stored, "Precached assets");
                (stored, None)
            }
            Err(e) => {
                // Partial availability is acceptable; setup still completes
                warn!(bucket = %cache_name, error = %e, "Precache failed, continuing setup");
                (0, Some(e.to_string()))
            }
        };

        Ok(SetupReport {
            cache_name,
            stored,
            error,
            skip_waiting: true,
        })
    }

    async fn on_intercept(&self, request: Request) -> Result<Intercepted, Error> {
        if let Some(response) = self.storage.match_request(&request).await? {
            self.metrics.record_hit(response.body.len());
            debug!(url = %request.url, "Cache hit");
            return Ok(Intercepted {
                response,
                source: ResponseSource::Cache,
            });
        }

        self.metrics.record_miss();
        let response = self.fetcher.fetch(&request).await?;

        if response.is_storable() {
            self.store_detached(request, response.clone()).await;
        } else {
            debug!(
                url = %request.url,
                status = response.status,
                response_type = ?response.response_type,
                "Passing response through uncached"
            );
        }

        Ok(Intercepted {
            response,
            source: ResponseSource::Network,
        })
    }

    async fn on_activate(&self) -> Result<ActivateReport, CacheError> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| !self.config.is_current(name))
            .collect();

        let removed = try_join_all(stale.iter().map(|name| self.storage.delete(name))).await?;

        let deleted: Vec<String> = stale
            .into_iter()
            .zip(removed)
            .filter_map(|(name, existed)| existed.then_some(name))
            .collect();

        for name in &deleted {
            info!(bucket = %name, "Deleted stale cache");
        }

        Ok(ActivateReport {
            deleted,
            claim_clients: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResponseType;
    use crate::storage::test_support::StubFetcher;
    use crate::storage::{DiskCacheStorage, MemoryCacheStorage};
    use reqwest::Method;
    use url::Url;

    const ORIGIN: &str = "http://app.test";

    fn config(assets: &[&str]) -> CacheConfig {
        CacheConfig::new(
            "mailcraft-cache-v1",
            assets.iter().map(|s| s.to_string()).collect(),
            Url::parse(ORIGIN).unwrap(),
        )
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
    }

    fn worker(
        assets: &[&str],
        fetcher: Arc<StubFetcher>,
    ) -> (CacheWorker, Arc<MemoryCacheStorage>) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let worker = CacheWorker::new(config(assets), storage.clone(), fetcher);
        (worker, storage)
    }

    #[tokio::test]
    async fn test_setup_precaches_every_asset() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .route("http://app.test/", Response::new(200, "index"))
                .route("http://app.test/static/css/style.css", Response::new(200, "css"))
                .route(
                    "https://cdn.test/htmx.js",
                    Response::new(200, "htmx").with_type(ResponseType::Cors),
                ),
        );
        let assets = ["/", "/static/css/style.css", "https://cdn.test/htmx.js"];
        let (worker, storage) = worker(&assets, fetcher);

        let report = worker.on_setup().await.unwrap();
        assert_eq!(report.stored, 3);
        assert!(report.error.is_none());
        assert!(report.skip_waiting);

        let bucket = storage.open("mailcraft-cache-v1").await.unwrap();
        for asset in assets {
            let request = get(asset);
            assert!(
                bucket.match_request(&request).await.unwrap().is_some(),
                "missing {}",
                asset
            );
        }
    }

    #[tokio::test]
    async fn test_setup_survives_failed_batch() {
        let fetcher = Arc::new(StubFetcher::new().route("http://app.test/", Response::new(200, "index")));
        // Second asset is unreachable
        let (worker, storage) = worker(&["/", "/static/manifest.json"], fetcher);

        let report = worker.on_setup().await.unwrap();
        assert_eq!(report.stored, 0);
        assert!(report.error.is_some());
        assert!(report.skip_waiting);

        // Bucket exists but the batch left nothing behind
        assert!(storage.has("mailcraft-cache-v1").await.unwrap());
        let bucket = storage.open("mailcraft-cache-v1").await.unwrap();
        assert!(bucket.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_intercept_hit_skips_network() {
        let fetcher = Arc::new(StubFetcher::new());
        let (worker, storage) = worker(&[], fetcher.clone());
        let request = get("/static/css/style.css");
        storage
            .open("mailcraft-cache-v1")
            .await
            .unwrap()
            .put(&request, Response::new(200, "cached"))
            .await
            .unwrap();

        let intercepted = worker.on_intercept(request).await.unwrap();
        assert_eq!(intercepted.source, ResponseSource::Cache);
        assert_eq!(intercepted.response.body, "cached");
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(worker.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_intercept_hit_from_older_bucket() {
        let fetcher = Arc::new(StubFetcher::new());
        let (worker, storage) = worker(&[], fetcher.clone());
        let request = get("/static/icons/icon-192.png");
        storage
            .open("mailcraft-cache-old")
            .await
            .unwrap()
            .put(&request, Response::new(200, "old icon"))
            .await
            .unwrap();

        let intercepted = worker.on_intercept(request).await.unwrap();
        assert_eq!(intercepted.response.body, "old icon");
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_intercept_miss_then_offline_hit() {
        let fetcher = Arc::new(
            StubFetcher::new().route("http://app.test/static/css/style.css", Response::new(200, "X")),
        );
        let (worker, storage) = worker(&[], fetcher.clone());

        let first = worker
            .on_intercept(get("/static/css/style.css"))
            .await
            .unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        assert_eq!(first.response.body, "X");

        worker.settle().await;
        let bucket = storage.open("mailcraft-cache-v1").await.unwrap();
        assert!(bucket
            .match_request(&get("/static/css/style.css"))
            .await
            .unwrap()
            .is_some());

        // Network gone
        fetcher.clear();
        let second = worker
            .on_intercept(get("/static/css/style.css"))
            .await
            .unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.response.body, "X");
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(worker.stats().stored, 1);
    }

    #[tokio::test]
    async fn test_intercept_does_not_store_unsuitable_responses() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .route("http://app.test/missing", Response::new(404, "nope"))
                .route("http://app.test/partial", Response::new(206, "part"))
                .route(
                    "https://cdn.test/lib.css",
                    Response::new(200, "lib").with_type(ResponseType::Cors),
                )
                .route(
                    "https://cdn.test/pixel.gif",
                    Response::new(200, "gif").with_type(ResponseType::Opaque),
                )
                .route("http://app.test/flaky", Response::error()),
        );
        let (worker, storage) = worker(&[], fetcher);

        let requests = [
            get("/missing"),
            get("/partial"),
            Request::get(Url::parse("https://cdn.test/lib.css").unwrap()),
            Request::get(Url::parse("https://cdn.test/pixel.gif").unwrap()),
            get("/flaky"),
        ];
        for request in requests.clone() {
            let intercepted = worker.on_intercept(request).await.unwrap();
            assert_eq!(intercepted.source, ResponseSource::Network);
        }
        worker.settle().await;

        for request in &requests {
            assert!(storage.match_request(request).await.unwrap().is_none());
        }
        assert_eq!(worker.stats().stored, 0);
    }

    #[tokio::test]
    async fn test_intercept_error_response_passes_through() {
        let fetcher = Arc::new(StubFetcher::new().route("http://app.test/flaky", Response::error()));
        let (worker, _storage) = worker(&[], fetcher);

        let intercepted = worker.on_intercept(get("/flaky")).await.unwrap();
        assert_eq!(intercepted.source, ResponseSource::Network);
        assert_eq!(intercepted.response.response_type, ResponseType::Error);
        assert_eq!(intercepted.response.status, 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_both_fetch_and_one_entry_remains() {
        let fetcher = Arc::new(
            StubFetcher::new().route("http://app.test/templates/7", Response::new(200, "seven")),
        );
        let (worker, storage) = worker(&[], fetcher.clone());

        let (a, b) = tokio::join!(
            worker.on_intercept(get("/templates/7")),
            worker.on_intercept(get("/templates/7")),
        );
        assert_eq!(a.unwrap().source, ResponseSource::Network);
        assert_eq!(b.unwrap().source, ResponseSource::Network);
        worker.settle().await;

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(worker.stats().misses, 2);
        assert_eq!(worker.stats().stored, 2);

        let bucket = storage.open("mailcraft-cache-v1").await.unwrap();
        let keys = bucket.keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].url, "http://app.test/templates/7");

        let hit = worker.on_intercept(get("/templates/7")).await.unwrap();
        assert_eq!(hit.source, ResponseSource::Cache);
        assert_eq!(hit.response.body, "seven");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_intercept_refetches_over_corrupt_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(DiskCacheStorage::new(dir.path().to_path_buf()).unwrap());
        let fetcher = Arc::new(
            StubFetcher::new().route("http://app.test/templates/7", Response::new(200, "stale")),
        );
        let worker = CacheWorker::new(config(&[]), storage, fetcher.clone());

        worker.on_intercept(get("/templates/7")).await.unwrap();
        worker.settle().await;

        // Clobber every stored entry
        for bucket_dir in std::fs::read_dir(dir.path()).unwrap() {
            for file in std::fs::read_dir(bucket_dir.unwrap().path()).unwrap() {
                let path = file.unwrap().path();
                if path.extension().and_then(|e| e.to_str()) == Some("entry") {
                    std::fs::write(&path, b"garbage").unwrap();
                }
            }
        }

        fetcher.set("http://app.test/templates/7", Response::new(200, "fresh"));
        let refetched = worker.on_intercept(get("/templates/7")).await.unwrap();
        assert_eq!(refetched.source, ResponseSource::Network);
        assert_eq!(refetched.response.body, "fresh");
        assert_eq!(fetcher.calls(), 2);
        worker.settle().await;

        let hit = worker.on_intercept(get("/templates/7")).await.unwrap();
        assert_eq!(hit.source, ResponseSource::Cache);
        assert_eq!(hit.response.body, "fresh");
    }

    #[tokio::test]
    async fn test_intercept_post_is_fetched_but_not_stored() {
        let fetcher = Arc::new(StubFetcher::new().route("http://app.test/save", Response::new(200, "saved")));
        let (worker, storage) = worker(&[], fetcher);
        let post = Request::new(Method::POST, Url::parse("http://app.test/save").unwrap());

        let intercepted = worker.on_intercept(post).await.unwrap();
        assert_eq!(intercepted.response.body, "saved");

        worker.settle().await;
        assert!(storage
            .match_request(&get("/save"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(worker.stats().stored, 0);
    }

    #[tokio::test]
    async fn test_intercept_network_failure_propagates() {
        let fetcher = Arc::new(StubFetcher::new());
        let (worker, _storage) = worker(&[], fetcher);

        let err = worker.on_intercept(get("/offline")).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_buckets() {
        let fetcher = Arc::new(StubFetcher::new());
        let (worker, storage) = worker(&[], fetcher);
        storage.open("mailcraft-cache-v1").await.unwrap();
        storage.open("mailcraft-cache-old").await.unwrap();

        let report = worker.on_activate().await.unwrap();
        assert_eq!(report.deleted, vec!["mailcraft-cache-old"]);
        assert!(report.claim_clients);
        assert_eq!(storage.keys().await.unwrap(), vec!["mailcraft-cache-v1"]);
    }

    #[tokio::test]
    async fn test_activate_without_current_bucket() {
        let fetcher = Arc::new(StubFetcher::new());
        let (worker, storage) = worker(&[], fetcher);
        storage.open("mailcraft-cache-v0").await.unwrap();

        let report = worker.on_activate().await.unwrap();
        assert_eq!(report.deleted, vec!["mailcraft-cache-v0"]);
        assert!(storage.keys().await.unwrap().is_empty());
    }
}
