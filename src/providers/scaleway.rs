//! Scaleway flexible IPs (Instance API).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ScalewayConfig, SecureString};
use crate::rotator::{AddressAllocator, AddressCandidate, AddressRecord, ServerRef};

const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct IpList {
    ips: Vec<FlexibleIp>,
    #[serde(default)]
    total_count: usize,
}

#[derive(Debug, Deserialize)]
struct IpEnvelope {
    ip: FlexibleIp,
}

#[derive(Debug, Deserialize)]
struct FlexibleIp {
    id: String,
    address: IpAddr,
    #[serde(default)]
    server: Option<ServerSummary>,
}

#[derive(Debug, Deserialize)]
struct ServerSummary {
    id: String,
    name: String,
}

impl From<FlexibleIp> for AddressRecord {
    fn from(ip: FlexibleIp) -> Self {
        AddressRecord {
            id: ip.id,
            address: ip.address,
            server: ip.server.map(|s| ServerRef {
                id: s.id,
                name: s.name,
            }),
        }
    }
}

/// Allocates and moves flexible IPs in one zone
pub struct ScalewayAllocator {
    client: Client,
    base_url: String,
    project: String,
    token: SecureString,
}

impl ScalewayAllocator {
    pub fn new(config: &ScalewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("ipflip/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: format!(
                "{}/instance/v1/zones/{}",
                config.api_url.trim_end_matches('/'),
                config.zone
            ),
            project: config.project.clone(),
            token: config.get_token(),
        })
    }

    fn ips_url(&self) -> String {
        format!("{}/ips", self.base_url)
    }

    fn ip_url(&self, id: &str) -> String {
        format!("{}/ips/{}", self.base_url, id)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .header("X-Auth-Token", self.token.as_str())
            .send()
            .await
            .with_context(|| format!("Scaleway: {} request failed", what))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Scaleway: {} returned HTTP {}: {}", what, status, body.trim());
        }
        Ok(response)
    }

    /// Move an address to (`Some`) or away from (`None`) a server
    async fn set_server(&self, id: &str, server_id: Option<&str>, what: &str) -> Result<()> {
        let request = self
            .client
            .patch(self.ip_url(id))
            .json(&json!({ "server": server_id }));
        self.send(request, what).await?;
        Ok(())
    }
}

#[async_trait]
impl AddressAllocator for ScalewayAllocator {
    async fn list_server_addresses(&self) -> Result<Vec<AddressRecord>> {
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let request = self
                .client
                .get(self.ips_url())
                .query(&[("page", page), ("per_page", PAGE_SIZE)]);
            let list: IpList = self
                .send(request, "list IPs")
                .await?
                .json()
                .await
                .context("Scaleway: invalid IP list")?;

            let fetched = list.ips.len();
            records.extend(list.ips.into_iter().map(AddressRecord::from));

            if fetched < PAGE_SIZE || records.len() >= list.total_count {
                break;
            }
            page += 1;
        }

        debug!("Scaleway: {} flexible IPs in zone", records.len());
        Ok(records)
    }

    async fn allocate_address(&self) -> Result<AddressCandidate> {
        let request = self
            .client
            .post(self.ips_url())
            .json(&json!({ "project": self.project }));
        let created: IpEnvelope = self
            .send(request, "create IP")
            .await?
            .json()
            .await
            .context("Scaleway: invalid create IP response")?;

        debug!("Scaleway: allocated {} ({})", created.ip.address, created.ip.id);
        Ok(AddressCandidate {
            id: created.ip.id,
            address: created.ip.address,
        })
    }

    async fn release_address(&self, id: &str) -> Result<()> {
        self.send(self.client.delete(self.ip_url(id)), "delete IP")
            .await?;
        debug!("Scaleway: released {}", id);
        Ok(())
    }

    async fn detach(&self, id: &str) -> Result<()> {
        self.set_server(id, None, "detach IP").await?;
        info!("Detached address {} from its server", id);
        Ok(())
    }

    async fn attach(&self, id: &str, server_id: &str) -> Result<()> {
        self.set_server(id, Some(server_id), "attach IP").await?;
        info!("Attached address {} to server {}", id, server_id);
        Ok(())
    }
}
