//! Persistent bucket storage.
//!
//! Layout under the root directory:
//!
//! ```text
//! <sha256(bucket name)>/bucket.json         bucket name + creation time
//! <sha256(bucket name)>/<sha256(key)>.entry one line of JSON metadata, then the raw body
//! ```
//!
//! Entries are written to a temp file and renamed into place, so a reader
//! never sees a partial entry and concurrent writers resolve last-write-wins.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use super::{CacheBucket, CacheStorage, CachedEntryInfo};
use crate::error::CacheError;
use crate::models::{Request, Response, ResponseType};

const BUCKET_META_FILE: &str = "bucket.json";
const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";

/// Temp files older than this were left behind by an interrupted write
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Distinguishes temp files written by concurrent tasks in one process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedData<T> {
    data: T,
    cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketMeta {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    url: Option<Url>,
    response_type: ResponseType,
}

impl StoredEntry {
    fn from_response(key: String, response: &Response) -> Self {
        Self {
            key,
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            url: response.url.clone(),
            response_type: response.response_type,
        }
    }

    fn into_response(self, body: Bytes) -> Response {
        Response {
            status: self.status,
            status_text: self.status_text,
            headers: self.headers,
            body,
            url: self.url,
            response_type: self.response_type,
        }
    }
}

fn digest_hex(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}

fn temp_path(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("{}.{}.{}", std::process::id(), n, TEMP_EXTENSION))
}

/// Write to a temp file next to `path`. The caller renames it into place.
fn write_temp(path: &Path, contents: &[u8]) -> Result<PathBuf, CacheError> {
    let temp = temp_path(path);
    if let Err(e) = std::fs::write(&temp, contents) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(temp)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let temp = write_temp(path, contents)?;
    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        CacheError::from(e)
    })
}

/// Rename `temp` over `path`, first moving any existing file aside.
/// Returns where the previous file went, if there was one.
fn commit_one(temp: &Path, path: &Path) -> Result<Option<PathBuf>, CacheError> {
    let backup = if path.is_file() {
        let backup = temp_path(path);
        std::fs::rename(path, &backup)?;
        Some(backup)
    } else {
        None
    };
    if let Err(e) = std::fs::rename(temp, path) {
        if let Some(backup) = &backup {
            let _ = std::fs::rename(backup, path);
        }
        return Err(e.into());
    }
    Ok(backup)
}

/// Rename every staged `(temp, path)` pair into place as one unit.
///
/// If any rename fails, entries already committed are restored to what
/// they were before (or removed if they are new) and the remaining temp
/// files are deleted.
fn commit_all(staged: Vec<(PathBuf, PathBuf)>) -> Result<(), CacheError> {
    let mut committed: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(staged.len());
    let mut pending = staged.into_iter();

    while let Some((temp, path)) = pending.next() {
        match commit_one(&temp, &path) {
            Ok(backup) => committed.push((path, backup)),
            Err(e) => {
                let _ = std::fs::remove_file(&temp);
                for (temp, _) in pending.by_ref() {
                    let _ = std::fs::remove_file(&temp);
                }
                // Reverse order so a key staged twice ends up at its original contents
                for (path, backup) in committed.into_iter().rev() {
                    match backup {
                        Some(backup) => {
                            let _ = std::fs::rename(&backup, &path);
                        }
                        None => {
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
                return Err(e);
            }
        }
    }

    for (_, backup) in committed {
        if let Some(backup) = backup {
            let _ = std::fs::remove_file(&backup);
        }
    }
    Ok(())
}

fn encode_entry(request: &Request, response: &Response) -> Result<Vec<u8>, CacheError> {
    let stored = CachedData::new(StoredEntry::from_response(request.cache_key(), response));
    // Compact JSON never contains a raw newline, so the first one ends the header
    let mut contents = serde_json::to_vec(&stored)?;
    contents.push(b'\n');
    contents.extend_from_slice(&response.body);
    Ok(contents)
}

fn decode_entry(path: &Path, raw: Vec<u8>) -> Result<(CachedData<StoredEntry>, Bytes), CacheError> {
    let split = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| CacheError::CorruptEntry(path.display().to_string()))?;
    let stored: CachedData<StoredEntry> = serde_json::from_slice(&raw[..split])?;
    let body = Bytes::from(raw).slice(split + 1..);
    Ok((stored, body))
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match std::fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub struct DiskBucket {
    name: String,
    dir: PathBuf,
}

impl DiskBucket {
    fn entry_path(&self, request: &Request) -> PathBuf {
        self.dir
            .join(format!("{}.{}", digest_hex(&request.cache_key()), ENTRY_EXTENSION))
    }
}

#[async_trait]
impl CacheBucket for DiskBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        if !request.is_cacheable_method() {
            return Ok(None);
        }
        let path = self.entry_path(request);
        let Some(raw) = read_file(&path)? else {
            return Ok(None);
        };
        match decode_entry(&path, raw) {
            Ok((stored, body)) => Ok(Some(stored.data.into_response(body))),
            Err(e) => {
                // Treat as a miss so the next network fetch replaces it
                warn!(bucket = %self.name, path = %path.display(), error = %e, "Dropping unreadable cache entry");
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        if !request.is_cacheable_method() {
            return Err(CacheError::UnsupportedMethod(request.method.to_string()));
        }
        let contents = encode_entry(request, &response)?;
        write_atomic(&self.entry_path(request), &contents)
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        if let Some((bad, _)) = entries.iter().find(|(r, _)| !r.is_cacheable_method()) {
            return Err(CacheError::UnsupportedMethod(bad.method.to_string()));
        }

        // Stage everything first; only commit once every entry is on disk
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(entries.len());
        for (request, response) in &entries {
            let path = self.entry_path(request);
            let staged_file = encode_entry(request, response).and_then(|c| write_temp(&path, &c));
            match staged_file {
                Ok(temp) => staged.push((temp, path)),
                Err(e) => {
                    for (temp, _) in &staged {
                        let _ = std::fs::remove_file(temp);
                    }
                    return Err(e);
                }
            }
        }

        commit_all(staged)
    }

    async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        match std::fs::remove_file(self.entry_path(request)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<CachedEntryInfo>, CacheError> {
        let mut infos = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(raw) = read_file(&path)? else {
                // Deleted while listing
                continue;
            };
            match decode_entry(&path, raw) {
                Ok((stored, body)) => infos.push(CachedEntryInfo {
                    url: stored.data.key,
                    status: stored.data.status,
                    size_bytes: body.len(),
                    cached_at: stored.cached_at,
                }),
                Err(e) => {
                    warn!(bucket = %self.name, path = %path.display(), error = %e, "Skipping unreadable cache entry");
                }
            }
        }
        infos.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(infos)
    }
}

pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    pub fn new(root: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&root)?;
        let storage = Self { root };
        storage.sweep_temps(STALE_TEMP_AGE);
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, name: &str) -> PathBuf {
        self.root.join(digest_hex(name))
    }

    /// Remove temp files older than `max_age` from every bucket directory.
    /// Returns how many were removed.
    fn sweep_temps(&self, max_age: Duration) -> usize {
        let Ok(buckets) = std::fs::read_dir(&self.root) else {
            return 0;
        };

        let mut removed = 0;
        for dir in buckets.filter_map(|e| e.ok()).map(|e| e.path()) {
            if !dir.is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(&dir) else {
                continue;
            };
            for path in files.filter_map(|e| e.ok()).map(|e| e.path()) {
                if path.extension().and_then(|e| e.to_str()) != Some(TEMP_EXTENSION) {
                    continue;
                }
                let stale = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .map(|t| t.elapsed().unwrap_or_default() >= max_age)
                    .unwrap_or(false);
                if stale && std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(root = %self.root.display(), removed, "Removed stale temp files");
        }
        removed
    }

    fn load_meta(dir: &Path) -> Result<Option<CachedData<BucketMeta>>, CacheError> {
        match read_file(&dir.join(BUCKET_META_FILE))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>, CacheError> {
        let dir = self.bucket_dir(name);
        if Self::load_meta(&dir)?.is_none() {
            std::fs::create_dir_all(&dir)?;
            let meta = CachedData::new(BucketMeta {
                name: name.to_string(),
            });
            write_atomic(&dir.join(BUCKET_META_FILE), &serde_json::to_vec_pretty(&meta)?)?;
            debug!(bucket = name, dir = %dir.display(), "Created cache bucket");
        }
        Ok(Arc::new(DiskBucket {
            name: name.to_string(),
            dir,
        }))
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<dyn CacheBucket>>, CacheError> {
        let dir = self.bucket_dir(name);
        if Self::load_meta(&dir)?.is_none() {
            return Ok(None);
        }
        Ok(Some(Arc::new(DiskBucket {
            name: name.to_string(),
            dir,
        })))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut buckets = Vec::new();
        for dir_entry in std::fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if !path.is_dir() {
                continue;
            }
            match Self::load_meta(&path) {
                Ok(Some(meta)) => buckets.push((meta.cached_at, meta.data.name)),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache bucket");
                }
            }
        }
        buckets.sort();
        Ok(buckets.into_iter().map(|(_, name)| name).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let dir = self.bucket_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
