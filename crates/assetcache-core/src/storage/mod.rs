//! Versioned response storage.
//!
//! A `CacheStorage` owns any number of named buckets. Each `CacheBucket`
//! maps a request identity (its URL, GET only) to a stored response.
//! Backends:
//! - `MemoryCacheStorage`: in-process, lost on exit
//! - `DiskCacheStorage`: one directory per bucket under the cache dir
//!
//! Individual reads and writes are serialised by the backend; nothing
//! here provides atomicity across operations except `put_all`.

pub mod disk;
pub mod memory;

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::debug;

use crate::error::CacheError;
use crate::models::{Request, Response};
use crate::network::Fetcher;

/// Summary of one stored entry, for listing
#[derive(Debug, Clone)]
pub struct CachedEntryInfo {
    pub url: String,
    pub status: u16,
    pub size_bytes: usize,
    pub cached_at: DateTime<Utc>,
}

impl CachedEntryInfo {
    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

#[async_trait]
pub trait CacheBucket: Send + Sync {
    fn name(&self) -> &str;

    /// Stored response for `request`, if any. Non-GET requests never match.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError>;

    /// Store a response, replacing any previous entry for the same request.
    /// Fails with `UnsupportedMethod` for non-GET requests.
    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError>;

    /// Store every entry or none of them.
    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError>;

    /// Remove the entry for `request`. Returns true if one existed.
    async fn delete(&self, request: &Request) -> Result<bool, CacheError>;

    async fn keys(&self) -> Result<Vec<CachedEntryInfo>, CacheError>;
}

#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open the named bucket, creating it if absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>, CacheError>;

    /// The named bucket if it exists. Never creates one.
    async fn get(&self, name: &str) -> Result<Option<Arc<dyn CacheBucket>>, CacheError>;

    /// Bucket names in creation order
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a bucket and its entries. Returns true if it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.keys().await?.iter().any(|k| k == name))
    }

    /// First match across all buckets, oldest bucket first.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        if !request.is_cacheable_method() {
            return Ok(None);
        }
        for name in self.keys().await? {
            // Deleted since listing
            let Some(bucket) = self.get(&name).await? else {
                continue;
            };
            if let Some(response) = bucket.match_request(request).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

/// Fetch every request and store the results as one batch.
///
/// All fetches run concurrently. If any fetch fails or returns a status
/// outside 200-299 nothing is written and the whole batch fails. Returns
/// the number of entries stored.
pub async fn add_all(
    bucket: &dyn CacheBucket,
    fetcher: &dyn Fetcher,
    requests: Vec<Request>,
) -> Result<usize, CacheError> {
    if let Some(bad) = requests.iter().find(|r| !r.is_cacheable_method()) {
        return Err(CacheError::UnsupportedMethod(bad.method.to_string()));
    }

    let fetches = requests.into_iter().map(|request| async move {
        let response = fetcher
            .fetch(&request)
            .await
            .map_err(|source| CacheError::Fetch {
                url: request.url.to_string(),
                source,
            })?;

        if !response.ok() {
            debug!(
                url = %request.url,
                status = response.status,
                body = %CacheError::body_preview(&response.body),
                "Batch entry rejected"
            );
            return Err(CacheError::BadResponse {
                url: request.url.to_string(),
                status: response.status,
            });
        }

        Ok::<_, CacheError>((request, response))
    });

    let entries = try_join_all(fetches).await?;
    let count = entries.len();
    bucket.put_all(entries).await?;

    debug!(bucket = bucket.name(), count, "Batch stored");
    Ok(count)
}
