use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{CacheBucket, CacheStorage, CachedEntryInfo};
use crate::error::CacheError;
use crate::models::{Request, Response};

struct MemoryEntry {
    response: Response,
    cached_at: DateTime<Utc>,
}

pub struct MemoryBucket {
    name: String,
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryBucket {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CacheBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        if !request.is_cacheable_method() {
            return Ok(None);
        }
        let entries = self.entries.read().await;
        Ok(entries.get(&request.cache_key()).map(|e| e.response.clone()))
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        if !request.is_cacheable_method() {
            return Err(CacheError::UnsupportedMethod(request.method.to_string()));
        }
        let entry = MemoryEntry {
            response,
            cached_at: Utc::now(),
        };
        self.entries.write().await.insert(request.cache_key(), entry);
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        if let Some((bad, _)) = entries.iter().find(|(r, _)| !r.is_cacheable_method()) {
            return Err(CacheError::UnsupportedMethod(bad.method.to_string()));
        }
        // Single write guard, so readers never see half a batch
        let mut map = self.entries.write().await;
        let now = Utc::now();
        for (request, response) in entries {
            map.insert(
                request.cache_key(),
                MemoryEntry {
                    response,
                    cached_at: now,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .write()
            .await
            .remove(&request.cache_key())
            .is_some())
    }

    async fn keys(&self) -> Result<Vec<CachedEntryInfo>, CacheError> {
        let entries = self.entries.read().await;
        let mut infos: Vec<CachedEntryInfo> = entries
            .iter()
            .map(|(url, e)| CachedEntryInfo {
                url: url.clone(),
                status: e.response.status,
                size_bytes: e.response.body.len(),
                cached_at: e.cached_at,
            })
            .collect();
        infos.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(infos)
    }
}

/// In-process storage. Buckets are kept in creation order.
#[derive(Default)]
pub struct MemoryCacheStorage {
    buckets: RwLock<Vec<Arc<MemoryBucket>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>, CacheError> {
        let mut buckets = self.buckets.write().await;
        if let Some(existing) = buckets.iter().find(|b| b.name == name) {
            return Ok(existing.clone());
        }
        let bucket = Arc::new(MemoryBucket::new(name));
        buckets.push(bucket.clone());
        Ok(bucket)
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<dyn CacheBucket>>, CacheError> {
        Ok(self
            .buckets
            .read()
            .await
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.clone() as Arc<dyn CacheBucket>))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self
            .buckets
            .read()
            .await
            .iter()
            .map(|b| b.name.clone())
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|b| b.name != name);
        Ok(buckets.len() != before)
    }
}
