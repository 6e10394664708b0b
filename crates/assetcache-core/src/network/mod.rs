//! Network access for requests the cache cannot answer.
//!
//! `Fetcher` is the seam the lifecycle manager fetches through; the
//! production implementation is `HttpFetcher`.

pub mod client;

pub use client::HttpFetcher;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::models::{Request, Response};

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. Any HTTP status is a response; only transport
    /// failures are errors.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}
