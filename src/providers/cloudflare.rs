//! Cloudflare DNS (API v4).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::DnsUpdater;
use crate::config::{CloudflareConfig, SecureString};

/// Every v4 response is wrapped in this envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
}

/// Record type that can hold `address`
fn record_type_for(address: &IpAddr) -> &'static str {
    match address {
        IpAddr::V4(_) => "A",
        IpAddr::V6(_) => "AAAA",
    }
}

/// Updates one record in one zone
pub struct CloudflareDns {
    client: Client,
    api_url: String,
    zone: String,
    record: String,
    email: String,
    key: SecureString,
}

impl CloudflareDns {
    pub fn new(config: &CloudflareConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("ipflip/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            zone: config.zone.clone(),
            record: config.record.clone(),
            email: config.email.clone(),
            key: config.get_key(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .header("X-Auth-Email", &self.email)
            .header("X-Auth-Key", self.key.as_str())
            .send()
            .await
            .with_context(|| format!("Cloudflare: {} request failed", what))?;

        let status = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|| format!("Cloudflare: {} returned HTTP {} with invalid body", what, status))?;

        if !status.is_success() || !envelope.success {
            let errors: Vec<String> = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect();
            anyhow::bail!("Cloudflare: {} failed with HTTP {}: {}", what, status, errors.join(", "));
        }

        envelope
            .result
            .with_context(|| format!("Cloudflare: {} returned no result", what))
    }

    async fn find_zone(&self) -> Result<Zone> {
        let request = self
            .client
            .get(format!("{}/zones", self.api_url))
            .query(&[("name", self.zone.as_str())]);
        let zones: Vec<Zone> = self.call(request, "list zones").await?;

        zones
            .into_iter()
            .find(|z| z.name == self.zone)
            .with_context(|| format!("Cloudflare: zone {} not found", self.zone))
    }

    async fn find_records(&self, zone: &Zone, record_type: &str) -> Result<Vec<DnsRecord>> {
        let request = self
            .client
            .get(format!("{}/zones/{}/dns_records", self.api_url, zone.id))
            .query(&[("name", self.record.as_str()), ("type", record_type)]);
        let records: Vec<DnsRecord> = self.call(request, "list records").await?;

        Ok(records
            .into_iter()
            .filter(|r| r.name == self.record && r.record_type == record_type)
            .collect())
    }
}

#[async_trait]
impl DnsUpdater for CloudflareDns {
    async fn update_record(&self, address: IpAddr) -> Result<()> {
        let zone = self.find_zone().await?;
        let record_type = record_type_for(&address);
        let records = self.find_records(&zone, record_type).await?;

        if records.is_empty() {
            anyhow::bail!(
                "Cloudflare: no {} record named {} in zone {}",
                record_type,
                self.record,
                self.zone
            );
        }

        let content = address.to_string();
        for record in records {
            if record.content == content {
                debug!("DNS record {} ({}) already points to {}", record.name, record.id, content);
                continue;
            }
            let request = self
                .client
                .patch(format!(
                    "{}/zones/{}/dns_records/{}",
                    self.api_url, zone.id, record.id
                ))
                .json(&json!({ "content": content }));
            let _: serde_json::Value = self.call(request, "patch record").await?;
            info!("Updated DNS record {} from {} to {}", record.name, record.content, content);
        }

        Ok(())
    }
}
