//! Fetcher - Retrieves a dataset's CSV text from a URL or local path

use crate::config::SourceLocation;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Unprocessed CSV text of one resource, held whole in memory.
#[derive(Clone, Debug)]
pub struct RawResource {
    /// Where the text came from (URL or path), for messages.
    pub origin: String,
    pub text: String,
}

/// Source of raw CSV text.
///
/// Implementations:
/// - Fetcher: HTTP(S) via reqwest, local files via tokio::fs
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Single read of the whole resource. No retries.
    async fn fetch(&self, location: &SourceLocation) -> Result<RawResource>;
}

pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_url(&self, url: &str) -> Result<RawResource> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::unavailable(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::unavailable(url, format!("HTTP {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| IngestError::unavailable(url, e))?;
        let text = String::from_utf8(body.to_vec())
            .map_err(|e| IngestError::unavailable(url, format!("body is not UTF-8: {}", e)))?;

        debug!("Fetched {} bytes from {}", text.len(), url);
        Ok(RawResource {
            origin: url.to_string(),
            text,
        })
    }
}

#[async_trait]
impl ResourceFetcher for Fetcher {
    async fn fetch(&self, location: &SourceLocation) -> Result<RawResource> {
        match location {
            SourceLocation::Url(url) => self.fetch_url(url).await,
            SourceLocation::Path(path) => {
                let origin = path.display().to_string();
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| IngestError::unavailable(origin.clone(), e))?;
                debug!("Read {} bytes from {}", text.len(), origin);
                Ok(RawResource { origin, text })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_fetch_local_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "id,name\n1,a\n").unwrap();

        let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();
        let raw = fetcher
            .fetch(&SourceLocation::Path(file.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(raw.text, "id,name\n1,a\n");
    }

    #[tokio::test]
    async fn test_missing_local_file_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(&SourceLocation::Path(dir.path().join("missing.csv")))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ResourceUnavailable { .. }));
    }
}
