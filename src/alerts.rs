//! Operator notifications (Telegram, Gotify, email, webhook).
//!
//! Delivery is best-effort: a destination that fails is logged and skipped,
//! and never changes the outcome of a run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use reqwest::Client;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::AlertsConfig;
use crate::error::RemediationError;
use crate::workflow::Stage;

/// Timeout for alert HTTP requests (30s for slow networks/SMTP)
const TIMEOUT_SECS: u64 = 30;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Error,
}

impl AlertLevel {
    fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Error => "ERROR",
        }
    }

    fn gotify_priority(&self) -> u8 {
        match self {
            AlertLevel::Info => 2,
            AlertLevel::Error => 8,
        }
    }
}

/// Sink for human-readable status messages
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, level: AlertLevel, title: &str, message: &str);
}

/// Used when no destination is enabled
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, level: AlertLevel, title: &str, _message: &str) {
        debug!("No alert destination enabled, dropping {} alert: {}", level.as_str(), title);
    }
}

/// Fans an alert out to every enabled destination
pub struct AlertManager {
    config: AlertsConfig,
    client: Client,
}

impl AlertManager {
    pub fn new(config: AlertsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for alerts")?;

        Ok(Self { config, client })
    }

    /// Send to all enabled destinations; returns how many accepted it
    pub async fn send(&self, level: AlertLevel, title: &str, message: &str) -> usize {
        let mut delivered = 0;
        let mut destinations = Vec::new();

        if self.config.telegram.enabled {
            destinations.push("Telegram");
            match self.send_telegram(level, title, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Telegram alert failed: {:#}", e),
            }
        }

        if self.config.gotify.enabled {
            destinations.push("Gotify");
            match self.send_gotify(level, title, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Gotify alert failed: {:#}", e),
            }
        }

        if self.config.email.enabled {
            destinations.push("Email");
            match self.send_email(level, title, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Email alert failed: {:#}", e),
            }
        }

        if self.config.webhook.enabled {
            destinations.push("Webhook");
            match self.send_webhook(level, title, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Webhook alert failed: {:#}", e),
            }
        }

        if !destinations.is_empty() {
            debug!(
                "Alert sent to {}/{} destinations: {}",
                delivered,
                destinations.len(),
                destinations.join(", ")
            );
        }
        delivered
    }

    /// Send alert via the Telegram Bot API
    async fn send_telegram(&self, level: AlertLevel, title: &str, message: &str) -> Result<()> {
        let token = self.config.telegram.get_token();
        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.telegram.api_url.trim_end_matches('/'),
            token.as_str()
        );

        #[derive(Serialize)]
        struct SendMessage<'a> {
            chat_id: &'a str,
            text: String,
        }

        let payload = SendMessage {
            chat_id: &self.config.telegram.chat_id,
            text: format!("[{}] {}\n\n{}", level.as_str(), title, message),
        };

        // The URL carries the token, so reqwest errors must not be printed with it
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send Telegram alert: {}", e.without_url()))?;

        if !response.status().is_success() {
            let status = response.status();
            error!("Telegram alert failed with status: {}", status);
            anyhow::bail!("Telegram returned {}", status);
        }

        debug!("Telegram alert sent successfully");
        Ok(())
    }

    /// Send alert via Gotify
    async fn send_gotify(&self, level: AlertLevel, title: &str, message: &str) -> Result<()> {
        let url = format!("{}/message", self.config.gotify.url.trim_end_matches('/'));

        #[derive(Serialize)]
        struct GotifyMessage<'a> {
            title: &'a str,
            message: &'a str,
            priority: u8,
        }

        let payload = GotifyMessage {
            title,
            message,
            priority: level.gotify_priority(),
        };

        // SecureString is zeroed on drop
        let token = self.config.gotify.get_token();

        let response = self
            .client
            .post(&url)
            .header("X-Gotify-Key", token.as_str())
            .json(&payload)
            .send()
            .await
            .context("Failed to send Gotify alert")?;

        if !response.status().is_success() {
            let status = response.status();
            // Don't log response body as it may contain sensitive info
            error!("Gotify alert failed with status: {}", status);
            anyhow::bail!("Gotify returned {}", status);
        }

        debug!("Gotify alert sent successfully");
        Ok(())
    }

    /// Send alert via email (SMTP is blocking, so it runs off the executor)
    async fn send_email(&self, level: AlertLevel, title: &str, message: &str) -> Result<()> {
        let email_config = self.config.email.clone();
        let level_str = level.as_str().to_string();
        let title = title.to_string();
        let message = message.to_string();

        tokio::task::spawn_blocking(move || {
            let subject = format!("[ipflip {}] {}", level_str, title);
            let body = format!(
                "ipflip alert\n\
                 ============\n\n\
                 Level: {}\n\
                 Title: {}\n\n\
                 {}\n",
                level_str, title, message
            );

            let email = Message::builder()
                .from(
                    email_config
                        .from
                        .parse()
                        .context("Invalid 'from' email address")?,
                )
                .to(email_config
                    .to
                    .parse()
                    .context("Invalid 'to' email address")?)
                .subject(subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body)
                .context("Failed to build email")?;

            let password = email_config.get_password();
            let creds = Credentials::new(
                email_config.smtp_user.clone(),
                password.as_str().to_string(),
            );

            let mailer = SmtpTransport::relay(&email_config.smtp_host)
                .context("Failed to create SMTP transport")?
                .port(email_config.smtp_port)
                .credentials(creds)
                .build();

            mailer.send(&email).context("Failed to send email")?;

            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("Email task panicked")??;

        debug!("Email alert sent successfully");
        Ok(())
    }

    /// Send alert via webhook
    async fn send_webhook(&self, level: AlertLevel, title: &str, message: &str) -> Result<()> {
        #[derive(Serialize)]
        struct WebhookPayload<'a> {
            level: &'a str,
            title: &'a str,
            message: &'a str,
            timestamp: String,
            source: &'a str,
        }

        let payload = WebhookPayload {
            level: level.as_str(),
            title,
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
            source: "ipflip",
        };

        let mut request = self.client.post(&self.config.webhook.url).json(&payload);

        // Header names and values were checked for CR/LF when the config was loaded
        for (key, value) in &self.config.webhook.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.context("Failed to send webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook returned {}", response.status());
        }

        debug!("Webhook alert sent successfully");
        Ok(())
    }
}

#[async_trait]
impl Notifier for AlertManager {
    async fn notify(&self, level: AlertLevel, title: &str, message: &str) {
        self.send(level, title, message).await;
    }
}

/// Messages for the events a run reports
pub struct AlertTypes;

impl AlertTypes {
    /// The server moved to a clean address and answers again
    pub fn remediated(old: IpAddr, new: IpAddr, rejected: usize) -> (AlertLevel, String, String) {
        let mut body = format!(
            "Address {} was found in the blocklist.\n\
             The server now uses {}; DNS, router and tunnel were updated.",
            old, new
        );
        if rejected > 0 {
            body.push_str(&format!(
                "\n{} blocklisted candidate(s) were drawn and released.",
                rejected
            ));
        }
        (AlertLevel::Info, "Address rotated".to_string(), body)
    }

    /// A stage failed; the operator has to step in
    pub fn failed(stage: Stage, cause: &RemediationError) -> (AlertLevel, String, String) {
        let mut body = format!("Stage: {}\nCause: {}", stage, cause);
        if cause.leaves_partial_state() {
            body.push_str(
                "\n\nThe old address was detached and could not be re-attached, \
                 so the server has no public address. Manual intervention required.",
            );
        } else if stage.leaves_partial_state() {
            body.push_str(
                "\n\nThe server may already use its new address while downstream \
                 configuration is inconsistent. Manual intervention required.",
            );
        }
        (
            AlertLevel::Error,
            format!("Remediation failed at {}", stage),
            body,
        )
    }
}
