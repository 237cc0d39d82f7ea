//! Turns a job's `content` into a decoded bitmap.
//!
//! HTTP(S) content is downloaded with a bounded timeout and size; anything else is
//! treated as base64 image data, optionally behind a data-URI header. A
//! failed download is final: a URL is never retried as base64.

use std::time::Duration;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use image::DynamicImage;
use thiserror::Error;
use tracing::debug;

/// Default bound on a single image download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on a downloaded image body.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Standard alphabet, padding optional.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Content resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Image download failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Image download returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Image download exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Could not decode image: {0}")]
    Decode(String),

    #[error("Job content is empty")]
    Empty,
}

/// Where a bitmap came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Remote,
    Embedded,
}

/// A decoded bitmap ready for the printer.
#[derive(Debug)]
pub struct Resolved {
    pub image: DynamicImage,
    pub source: ContentSource,
}

#[derive(Debug, Clone)]
pub struct ContentResolver {
    http: reqwest::Client,
    fetch_timeout: Duration,
    max_download_bytes: usize,
}

impl ContentResolver {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }

    #[must_use]
    pub const fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_download_bytes(mut self, limit: usize) -> Self {
        self.max_download_bytes = limit;
        self
    }

    /// Resolve `content` into a bitmap. Network I/O is async; base64 and
    /// image decoding run on the blocking pool.
    pub async fn resolve(&self, content: &str) -> Result<Resolved, ResolveError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ResolveError::Empty);
        }

        if is_remote(content) {
            let bytes = self.fetch(content).await?;
            let image = decode_blocking(move || Ok(bytes)).await?;
            return Ok(Resolved {
                image,
                source: ContentSource::Remote,
            });
        }

        let payload = content.to_string();
        let image = decode_blocking(move || embedded_bytes(&payload)).await?;
        Ok(Resolved {
            image,
            source: ContentSource::Embedded,
        })
    }

    /// Download `url`. The body is read in chunks and abandoned once it
    /// passes the size cap.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ResolveError> {
        debug!(url, "Downloading job image");
        let mut resp = self
            .http
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(ResolveError::HttpStatus(status.as_u16()));
        }
        let limit = self.max_download_bytes;
        let max = u64::try_from(limit).unwrap_or(u64::MAX);
        if resp.content_length().is_some_and(|len| len > max) {
            return Err(ResolveError::TooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(ResolveError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn is_remote(content: &str) -> bool {
    let lower = content.get(..8).unwrap_or(content).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Base64 payload bytes, with any `data:...;base64,` header and whitespace
/// removed.
fn embedded_bytes(content: &str) -> Result<Vec<u8>, ResolveError> {
    let payload = content.split_once(',').map_or(content, |(_, rest)| rest);
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ResolveError::Empty);
    }
    Ok(LENIENT_BASE64.decode(compact)?)
}

async fn decode_blocking<F>(load: F) -> Result<DynamicImage, ResolveError>
where
    F: FnOnce() -> Result<Vec<u8>, ResolveError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let bytes = load()?;
        image::load_from_memory(&bytes).map_err(|e| ResolveError::Decode(e.to_string()))
    })
    .await
    .map_err(|e| ResolveError::Decode(format!("decode task failed: {e}")))?
}

#[cfg(test)]
#[path = "content_tests.rs"]
mod tests;
