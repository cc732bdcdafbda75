//! HTTP fetcher for the blocklist feed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::FeedConfig;
use crate::utils::format_bytes;

/// Source of raw blocklist bytes.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Download the current feed snapshot. Attempted once.
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// HTTP client for the configured feed URL
pub struct Fetcher {
    client: Client,
    url: String,
    max_bytes: usize,
}

impl Fetcher {
    /// Create a new fetcher from the feed configuration
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("ipflip/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            max_bytes: config.max_bytes,
        })
    }
}

#[async_trait]
impl FeedSource for Fetcher {
    async fn fetch(&self) -> Result<Vec<u8>> {
        info!("Fetching blocklist from {}...", self.url);

        let mut response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", self.url))?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP {} from {}", response.status(), self.url);
        }

        if let Some(content_length) = response.content_length() {
            check_size(content_length as usize, self.max_bytes)?;
        }

        // Content-Length may be absent or wrong, so the limit is enforced while reading.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read response body")?
        {
            check_size(body.len() + chunk.len(), self.max_bytes)?;
            body.extend_from_slice(&chunk);
        }

        debug!("Downloaded {} from {}", format_bytes(body.len() as u64), self.url);
        Ok(body)
    }
}

fn check_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        anyhow::bail!(
            "Feed too large: {} bytes (max: {} bytes)",
            size,
            max
        );
    }
    Ok(())
}
