//! Offline-first asset cache.
//!
//! A versioned cache that precaches a fixed asset list, answers requests
//! cache-first with network fallback, and garbage-collects buckets left
//! behind by older versions. The lifecycle is driven by a host through
//! `WorkerHost`, which dispatches setup, intercept and activation to a
//! `LifecycleHandler` (normally `CacheWorker`).

pub mod config;
pub mod error;
pub mod host;
pub mod metrics;
pub mod models;
pub mod network;
pub mod storage;
pub mod worker;

pub use config::{AppConfig, CacheConfig};
pub use error::{CacheError, ConfigError, Error, FetchError, Result};
pub use host::{Registration, WorkerHost, WorkerState};
pub use metrics::CacheStats;
pub use models::{Request, Response, ResponseType};
pub use network::{Fetcher, HttpFetcher};
pub use reqwest::Method;
pub use storage::{CacheBucket, CacheStorage, CachedEntryInfo, DiskCacheStorage, MemoryCacheStorage};
pub use worker::{ActivateReport, CacheWorker, Intercepted, LifecycleHandler, ResponseSource, SetupReport};
