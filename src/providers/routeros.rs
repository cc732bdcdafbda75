//! MikroTik RouterOS (REST API, RouterOS 7+).

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

use super::TunnelPeerUpdater;
use crate::config::{RouterOsConfig, SecureString};

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = ".id")]
    id: String,
}

/// Menu holding a tunnel setting, and the property that carries the address
struct Menu {
    path: &'static str,
    property: &'static str,
}

const PEER: Menu = Menu {
    path: "ip/ipsec/peer",
    property: "address",
};

const POLICY: Menu = Menu {
    path: "ip/ipsec/policy",
    property: "sa-dst-address",
};

/// Peers store a prefix, policies a bare address
fn peer_value(ip: IpAddr) -> String {
    IpNet::from(ip).to_string()
}

pub struct RouterOsClient {
    client: Client,
    url: String,
    username: String,
    password: SecureString,
}

impl RouterOsClient {
    pub fn new(config: &RouterOsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.get_password(),
        })
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .basic_auth(&self.username, Some(self.password.as_str()))
            .send()
            .await
            .with_context(|| format!("RouterOS: {} request failed", what))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("RouterOS: {} returned HTTP {}: {}", what, status, body.trim());
        }
        Ok(response)
    }

    /// Point the first entry whose `property` equals `old` at `new`.
    ///
    /// Returns false when nothing matched.
    async fn replace_first(&self, menu: &Menu, old: &str, new: &str) -> Result<bool> {
        let what = format!("{} print", menu.path);
        let request = self
            .client
            .get(format!("{}/rest/{}", self.url, menu.path))
            .query(&[(menu.property, old)]);
        let entries: Vec<Entry> = self
            .send(request, &what)
            .await?
            .json()
            .await
            .with_context(|| format!("RouterOS: invalid {} response", what))?;

        let Some(entry) = entries.first() else {
            return Ok(false);
        };

        let what = format!("{} set", menu.path);
        let request = self
            .client
            .patch(format!("{}/rest/{}/{}", self.url, menu.path, entry.id))
            .json(&json!({ menu.property: new }));
        self.send(request, &what).await?;
        Ok(true)
    }
}

#[async_trait]
impl TunnelPeerUpdater for RouterOsClient {
    async fn update_peer(&self, old: IpAddr, new: IpAddr) -> Result<()> {
        if !self
            .replace_first(&PEER, &peer_value(old), &peer_value(new))
            .await?
        {
            warn!("RouterOS: no IPsec peer with address {}", peer_value(old));
        }

        if !self
            .replace_first(&POLICY, &old.to_string(), &new.to_string())
            .await?
        {
            warn!("RouterOS: no IPsec policy with sa-dst-address {}", old);
        }

        info!("Changed IPsec peer on router from {} to {}", old, new);
        Ok(())
    }
}
