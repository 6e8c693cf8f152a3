//! HTTP tile source.
//!
//! Fetches tiles from `<base_url>/<source>/<tile_id>.<type>.<hierarchy>.pbf` on a
//! private tokio runtime so callers stay synchronous. Transient failures
//! (request errors, 429 and 5xx) are retried with exponential backoff. A 404
//! is an empty tile, the same as a missing file in [`DirectoryTileSource`].
//!
//! Wrap in [`CachedTileSource`] to keep fetched tiles on disk.
//!
//! [`DirectoryTileSource`]: crate::tiles::DirectoryTileSource
//! [`CachedTileSource`]: crate::tiles::CachedTileSource

use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, StatusCode};
use tokio::runtime::Runtime;

use crate::error::{MatchError, Result};
use crate::tiles::{TilePath, TileSource};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_IDLE_PER_HOST: usize = 8;

pub struct HttpTileSource {
    client: Client,
    runtime: Runtime,
    base_url: String,
}

impl HttpTileSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| MatchError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        let runtime = Runtime::new().map_err(|e| MatchError::Config {
            message: format!("Failed to create tokio runtime: {}", e),
        })?;

        Ok(Self {
            client,
            runtime,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &TilePath) -> String {
        format!("{}/{}", self.base_url, path.to_path_string())
    }

    async fn fetch_with_retry(&self, path: &TilePath) -> Result<Vec<u8>> {
        let url = self.url(path);
        let fail = |message: String| MatchError::TileFetch {
            path: url.clone(),
            message,
        };
        let mut retries = 0;

        loop {
            let error = match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        debug!("[HttpTileSource] {} not found, treating as empty", url);
                        return Ok(Vec::new());
                    }
                    if status.is_success() {
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| fail(format!("Body error: {}", e)))?;
                        debug!("[HttpTileSource] fetched {} ({} bytes)", url, bytes.len());
                        return Ok(bytes.to_vec());
                    }
                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        return Err(fail(format!("HTTP {}", status)));
                    }
                    format!("HTTP {}", status)
                }
                Err(e) => format!("Request error: {}", e),
            };

            retries += 1;
            if retries > MAX_RETRIES {
                return Err(fail(error));
            }

            // Exponential backoff: 1s, 2s, 4s
            let backoff = Duration::from_millis(500 * (1 << retries));
            warn!(
                "[HttpTileSource] {} for {}, retry {} after {:?}",
                error, url, retries, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

impl TileSource for HttpTileSource {
    fn fetch(&self, path: &TilePath) -> Result<Vec<u8>> {
        self.runtime.block_on(self.fetch_with_retry(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::{TileParams, TileType};

    #[test]
    fn test_url_layout() {
        let source = HttpTileSource::new("https://tiles.example.org/").unwrap();
        let path = TilePath::new(&TileParams::default(), "12345", TileType::Reference);
        assert_eq!(
            source.url(&path),
            "https://tiles.example.org/osm/planet-181224/12345.reference.6.pbf"
        );
        assert!(!source.url(&path).contains("org//"));
    }
}
