//! HTTP fetcher backed by reqwest.
//!
//! Classifies every response against the application origin: responses
//! whose final URL (after redirects) shares the origin are `Basic`,
//! everything else is `Cors`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::debug;
use url::Url;

use super::Fetcher;
use crate::error::FetchError;
use crate::models::{Request, Response, ResponseType};

/// HTTP request timeout in seconds.
/// Network failure is the only thing that makes a miss fail, so don't hang on it.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: Url,
}

impl HttpFetcher {
    pub fn new(origin: Url) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn response_type(&self, final_url: &Url) -> ResponseType {
        if final_url.origin() == self.origin.origin() {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        }
    }

    fn request_headers(request: &Request) -> Result<header::HeaderMap, FetchError> {
        let mut headers = header::HeaderMap::new();
        for (name, value) in &request.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| FetchError::InvalidRequest(format!("header {}: {}", name, e)))?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

/// Response headers as strings. Values that aren't visible ASCII can't be
/// stored and are dropped.
fn response_headers(url: &Url, headers: &header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(value) => Some((name.to_string(), value.to_string())),
            Err(_) => {
                debug!(%url, header = %name, "Dropping non-ASCII response header");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(Self::request_headers(request)?);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;

        let status = response.status();
        let final_url = response.url().clone();
        let headers = response_headers(&final_url, response.headers());
        let body = response.bytes().await?;

        let response_type = self.response_type(&final_url);
        debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            ?response_type,
            bytes = body.len(),
            "Fetched from network"
        );

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            url: Some(final_url),
            response_type,
        })
    }
}
