use thiserror::Error;

use crate::host::WorkerState;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    #[error("Request method {0} is not supported by the cache")]
    UnsupportedMethod(String),

    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("Bad response for {url}: status {status}")]
    BadResponse { url: String, status: u16 },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not find {0} directory")]
    NoDirectory(&'static str),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid origin {origin}: {source}")]
    InvalidOrigin {
        origin: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Origin {0} must be an http(s) URL")]
    UnsupportedOrigin(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Worker is not controlling requests (state: {0})")]
    NotControlling(WorkerState),

    #[error("Cannot {action} a worker in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: WorkerState,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl CacheError {
    /// Truncate a response body so a failed batch doesn't log whole assets
    pub fn body_preview(body: &[u8]) -> String {
        let text = String::from_utf8_lossy(body);
        if text.len() <= MAX_ERROR_BODY_LENGTH {
            text.into_owned()
        } else {
            let cut: String = text.chars().take(MAX_ERROR_BODY_LENGTH).collect();
            format!("{}... (truncated, {} total bytes)", cut, body.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_preview_short() {
        assert_eq!(CacheError::body_preview(b"not found"), "not found");
    }

    #[test]
    fn test_body_preview_truncates() {
        let body = vec![b'a'; 500];
        let preview = CacheError::body_preview(&body);
        assert!(preview.starts_with(&"a".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(preview.ends_with("(truncated, 500 total bytes)"));
    }

    #[test]
    fn test_serialization_message_covers_reads() {
        let parse_err = serde_json::from_slice::<serde_json::Value>(b"{not json").unwrap_err();
        let err = CacheError::from(parse_err);
        assert!(err.to_string().starts_with("Cache metadata serialization error:"));
    }

    #[test]
    fn test_not_controlling_message() {
        let err = Error::NotControlling(WorkerState::Installed);
        assert_eq!(
            err.to_string(),
            "Worker is not controlling requests (state: installed)"
        );
    }
}
