//! Configuration management for ipflip.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ipflip/config.yaml";

/// Secure string type that zeroizes memory on drop
/// Used for sensitive data like tokens and passwords
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Resolve a secret: custom env var, then the default env var, then the file value.
fn resolve_secret(custom_env: &Option<String>, default_env: &str, value: &SecureString) -> SecureString {
    if let Some(ref name) = custom_env {
        if let Ok(val) = env::var(name) {
            return SecureString::new(val);
        }
    }
    if let Ok(val) = env::var(default_env) {
        return SecureString::new(val);
    }
    value.clone()
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Blocklist feed
    pub feed: FeedConfig,

    /// Cloud address allocator (Scaleway instance API)
    pub scaleway: ScalewayConfig,

    /// DNS record to repoint (Cloudflare)
    pub cloudflare: CloudflareConfig,

    /// IPsec peer on the router (RouterOS REST API)
    pub routeros: RouterOsConfig,

    /// IPsec config on the rotated host, reached over SSH
    pub ssh: SshConfig,

    /// Post-rotation connectivity check
    pub reachability: ReachabilityConfig,

    /// Replacement address acquisition
    pub rotation: RotationConfig,

    /// Alert destinations
    pub alerts: AlertsConfig,

    /// Lock file preventing overlapping runs
    pub lock_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            scaleway: ScalewayConfig::default(),
            cloudflare: CloudflareConfig::default(),
            routeros: RouterOsConfig::default(),
            ssh: SshConfig::default(),
            reachability: ReachabilityConfig::default(),
            rotation: RotationConfig::default(),
            alerts: AlertsConfig::default(),
            lock_file: PathBuf::from("/var/run/ipflip.lock"),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::read(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise use defaults.
    ///
    /// Only the feed and reachability sections are validated; used by the
    /// commands that never touch the cloud, DNS, or router APIs.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Config::default());
        }
        let config = Self::read(path.as_ref())?;
        config.validate_feed()?;
        config.validate_reachability()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.validate_feed()?;
        self.validate_reachability()?;

        if self.scaleway.server_name.is_empty() {
            anyhow::bail!("scaleway.server_name must be set");
        }
        if self.scaleway.project.is_empty() {
            anyhow::bail!("scaleway.project must be set");
        }
        require_https("scaleway.api_url", &self.scaleway.api_url)?;

        if self.cloudflare.zone.is_empty() || self.cloudflare.record.is_empty() {
            anyhow::bail!("cloudflare.zone and cloudflare.record must be set");
        }
        require_https("cloudflare.api_url", &self.cloudflare.api_url)?;

        if self.routeros.username.is_empty() {
            anyhow::bail!("routeros.username must be set");
        }
        require_https("routeros.url", &self.routeros.url)?;

        if self.ssh.user.is_empty() {
            anyhow::bail!("ssh.user must be set");
        }
        if self.ssh.identity_file.as_os_str().is_empty() {
            anyhow::bail!("ssh.identity_file must be set");
        }

        if self.rotation.max_attempts == Some(0) {
            anyhow::bail!("rotation.max_attempts must be at least 1 (omit it for no limit)");
        }

        // Validate alert endpoints use HTTPS if enabled
        if self.alerts.webhook.enabled {
            require_https("Webhook URL", &self.alerts.webhook.url)?;
        }
        if self.alerts.gotify.enabled {
            require_https("Gotify URL", &self.alerts.gotify.url)?;
        }
        if self.alerts.telegram.enabled && self.alerts.telegram.chat_id.is_empty() {
            anyhow::bail!("alerts.telegram.chat_id must be set when Telegram is enabled");
        }

        Ok(())
    }

    fn validate_feed(&self) -> Result<()> {
        require_https("feed.url", &self.feed.url)?;
        if self.feed.max_bytes == 0 {
            anyhow::bail!("feed.max_bytes must be greater than zero");
        }
        Ok(())
    }

    fn validate_reachability(&self) -> Result<()> {
        let r = &self.reachability;
        if r.interval_ms == 0 {
            anyhow::bail!("reachability.interval_ms must be greater than zero");
        }
        if r.deadline() < r.interval() {
            anyhow::bail!(
                "reachability.deadline_secs ({}s) must be at least one interval ({}ms)",
                r.deadline_secs,
                r.interval_ms
            );
        }
        if r.probe_timeout_ms == 0 {
            anyhow::bail!("reachability.probe_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

fn require_https(what: &str, url: &str) -> Result<()> {
    if !url.starts_with("https://") {
        anyhow::bail!("{} must use HTTPS: {}", what, url);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    pub timeout_secs: u64,
    /// Largest accepted feed body
    pub max_bytes: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "https://raw.githubusercontent.com/zapret-info/z-i/master/dump.csv".to_string(),
            timeout_secs: 120,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalewayConfig {
    pub api_url: String,
    /// Availability zone, e.g. "nl-ams-1"
    pub zone: String,
    /// Project that new flexible IPs are billed to
    pub project: String,
    /// Name of the server whose address is watched
    pub server_name: String,
    /// Secret key; IPFLIP_SCW_TOKEN overrides it
    pub token: SecureString,
    pub token_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ScalewayConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.scaleway.com".to_string(),
            zone: "nl-ams-1".to_string(),
            project: String::new(),
            server_name: String::new(),
            token: SecureString::default(),
            token_env: None,
            timeout_secs: 30,
        }
    }
}

impl ScalewayConfig {
    pub fn get_token(&self) -> SecureString {
        resolve_secret(&self.token_env, "IPFLIP_SCW_TOKEN", &self.token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    pub api_url: String,
    /// Zone name, e.g. "example.com"
    pub zone: String,
    /// Fully qualified record name, e.g. "vpn.example.com"
    pub record: String,
    pub email: String,
    /// Global API key; IPFLIP_CLOUDFLARE_KEY overrides it
    pub key: SecureString,
    pub key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.cloudflare.com/client/v4".to_string(),
            zone: String::new(),
            record: String::new(),
            email: String::new(),
            key: SecureString::default(),
            key_env: None,
            timeout_secs: 30,
        }
    }
}

impl CloudflareConfig {
    pub fn get_key(&self) -> SecureString {
        resolve_secret(&self.key_env, "IPFLIP_CLOUDFLARE_KEY", &self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterOsConfig {
    /// Base URL of the router's REST API, e.g. "https://192.168.88.1"
    pub url: String,
    pub username: String,
    /// IPFLIP_ROUTEROS_PASSWORD overrides it
    pub password: SecureString,
    pub password_env: Option<String>,
    /// Routers usually serve a self-signed certificate
    pub accept_invalid_certs: bool,
    pub timeout_secs: u64,
}

impl Default for RouterOsConfig {
    fn default() -> Self {
        Self {
            url: "https://192.168.88.1".to_string(),
            username: String::new(),
            password: SecureString::default(),
            password_env: None,
            accept_invalid_certs: false,
            timeout_secs: 30,
        }
    }
}

impl RouterOsConfig {
    pub fn get_password(&self) -> SecureString {
        resolve_secret(&self.password_env, "IPFLIP_ROUTEROS_PASSWORD", &self.password)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    /// Private key used for authentication
    pub identity_file: PathBuf,
    /// strongSwan config holding `leftsourceip=`
    pub ipsec_config: String,
    pub reload_command: String,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            identity_file: PathBuf::new(),
            ipsec_config: "/etc/ipsec.conf".to_string(),
            reload_command: "ipsec restart".to_string(),
            connect_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// Address to probe after rotation; the new address when unset
    pub target: Option<IpAddr>,
    pub interval_ms: u64,
    pub deadline_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            target: None,
            interval_ms: 1000,
            deadline_secs: 15,
            probe_timeout_ms: 1000,
        }
    }
}

impl ReachabilityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RotationConfig {
    /// Stop after this many blocked candidates; unlimited when unset
    pub max_attempts: Option<u32>,
    /// Release the old (blocked) address once it is detached
    pub release_old_address: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlertsConfig {
    pub telegram: TelegramConfig,
    pub gotify: GotifyConfig,
    pub email: EmailConfig,
    pub webhook: WebhookConfig,
}

impl AlertsConfig {
    pub fn any_enabled(&self) -> bool {
        self.telegram.enabled || self.gotify.enabled || self.email.enabled || self.webhook.enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub api_url: String,
    /// IPFLIP_TELEGRAM_BOT_TOKEN overrides it
    pub bot_token: SecureString,
    pub bot_token_env: Option<String>,
    pub chat_id: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://api.telegram.org".to_string(),
            bot_token: SecureString::default(),
            bot_token_env: None,
            chat_id: String::new(),
        }
    }
}

impl TelegramConfig {
    pub fn get_token(&self) -> SecureString {
        resolve_secret(&self.bot_token_env, "IPFLIP_TELEGRAM_BOT_TOKEN", &self.bot_token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GotifyConfig {
    pub enabled: bool,
    pub url: String,
    /// IPFLIP_GOTIFY_TOKEN overrides it
    pub token: SecureString,
    pub token_env: Option<String>,
}

impl GotifyConfig {
    pub fn get_token(&self) -> SecureString {
        resolve_secret(&self.token_env, "IPFLIP_GOTIFY_TOKEN", &self.token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    /// IPFLIP_SMTP_PASSWORD overrides it
    pub smtp_password: SecureString,
    pub smtp_password_env: Option<String>,
    pub from: String,
    pub to: String,
}

impl EmailConfig {
    pub fn get_password(&self) -> SecureString {
        resolve_secret(&self.smtp_password_env, "IPFLIP_SMTP_PASSWORD", &self.smtp_password)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    #[serde(deserialize_with = "deserialize_headers")]
    pub headers: HashMap<String, String>,
}

/// Deserialize and validate HTTP headers (reject injection attempts)
fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let headers: HashMap<String, String> = HashMap::deserialize(deserializer)?;

    for (key, value) in &headers {
        if key.contains('\r') || key.contains('\n') || value.contains('\r') || value.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header '{}': contains newline characters",
                key
            )));
        }
        // RFC 7230 token characters only
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_".contains(c))
        {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains invalid characters",
                key
            )));
        }
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.scaleway.project = "11111111-2222-3333-4444-555555555555".to_string();
        config.scaleway.server_name = "vpn-gw".to_string();
        config.cloudflare.zone = "example.com".to_string();
        config.cloudflare.record = "vpn.example.com".to_string();
        config.routeros.username = "admin".to_string();
        config.ssh.identity_file = PathBuf::from("/root/.ssh/id_ed25519");
        config
    }

    #[test]
    fn test_default_reachability_cadence() {
        let config = Config::default();
        assert_eq!(config.reachability.interval(), Duration::from_secs(1));
        assert_eq!(config.reachability.deadline(), Duration::from_secs(15));
        assert!(config.reachability.target.is_none());
    }

    #[test]
    fn test_default_rotation_is_unbounded() {
        let config = Config::default();
        assert!(config.rotation.max_attempts.is_none());
        assert!(!config.rotation.release_old_address);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_default_config_missing_server_rejected() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("server_name"));
    }

    #[test]
    fn test_feed_http_rejected() {
        let mut config = valid_config();
        config.feed.url = "http://example.com/dump.csv".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("HTTPS"));
    }

    #[test]
    fn test_deadline_shorter_than_interval_rejected() {
        let mut config = valid_config();
        config.reachability.interval_ms = 5000;
        config.reachability.deadline_secs = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("deadline_secs"));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = valid_config();
        config.rotation.max_attempts = Some(0);
        assert!(config.validate().is_err());

        config.rotation.max_attempts = Some(5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_webhook_http_rejected() {
        let mut config = valid_config();
        config.alerts.webhook = WebhookConfig {
            enabled: true,
            url: "http://example.com/hook".to_string(),
            headers: HashMap::new(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Webhook"));
    }

    #[test]
    fn test_telegram_requires_chat_id() {
        let mut config = valid_config();
        config.alerts.telegram.enabled = true;
        assert!(config.validate().is_err());
        config.alerts.telegram.chat_id = "-100123".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let yaml = r#"
scaleway:
  zone: fr-par-1
  project: "p-1"
  server_name: vpn-gw
  token: "scw-secret"
cloudflare:
  zone: example.com
  record: vpn.example.com
  email: ops@example.com
  key: "cf-key"
routeros:
  url: "https://10.0.0.1"
  username: admin
  accept_invalid_certs: true
ssh:
  identity_file: /root/.ssh/id_ed25519
reachability:
  target: 10.8.0.1
rotation:
  max_attempts: 20
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.scaleway.zone, "fr-par-1");
        assert_eq!(config.scaleway.token.as_str(), "scw-secret");
        assert!(config.routeros.accept_invalid_certs);
        assert_eq!(config.reachability.target, Some("10.8.0.1".parse().unwrap()));
        assert_eq!(config.rotation.max_attempts, Some(20));
        // Untouched sections keep defaults
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.reachability.deadline_secs, 15);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/ipflip.yaml").unwrap();
        assert_eq!(config.feed.url, FeedConfig::default().url);
    }

    #[test]
    fn test_load_or_default_skips_remediation_sections() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"feed:\n  url: https://example.com/dump.csv\n")
            .unwrap();
        let config = Config::load_or_default(file.path()).unwrap();
        assert_eq!(config.feed.url, "https://example.com/dump.csv");
    }

    #[test]
    fn test_secret_custom_env_wins() {
        let config = ScalewayConfig {
            token: SecureString::from("from-file"),
            token_env: Some("IPFLIP_TEST_SCW_TOKEN_CUSTOM".to_string()),
            ..Default::default()
        };
        env::set_var("IPFLIP_TEST_SCW_TOKEN_CUSTOM", "from-env");
        assert_eq!(config.get_token().as_str(), "from-env");
        env::remove_var("IPFLIP_TEST_SCW_TOKEN_CUSTOM");
    }

    #[test]
    fn test_secret_falls_back_to_file_value() {
        let secret = resolve_secret(
            &Some("IPFLIP_TEST_UNSET_VAR".to_string()),
            "IPFLIP_TEST_UNSET_DEFAULT",
            &SecureString::from("from-file"),
        );
        assert_eq!(secret.as_str(), "from-file");
    }

    #[test]
    fn test_secure_string_debug_redacted() {
        let secret = SecureString::new("my-secret-token".to_string());
        let debug_str = format!("{:?}", secret);
        assert_eq!(debug_str, "[REDACTED]");
        assert!(!format!("{:?}", valid_config().cloudflare).contains("my-secret-token"));
    }

    #[test]
    fn test_header_validation_rejects_newlines() {
        let yaml = r#"
enabled: true
url: "https://example.com/webhook"
headers:
  "X-Evil": "value\r\ninjected"
"#;
        let result: Result<WebhookConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_header_validation_accepts_valid() {
        let yaml = r#"
enabled: true
url: "https://example.com/webhook"
headers:
  "X-Custom-Header": "some-value"
  "Authorization": "Bearer token"
"#;
        let config: WebhookConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.headers.len(), 2);
    }

    #[test]
    fn test_alerts_any_enabled() {
        let mut alerts = AlertsConfig::default();
        assert!(!alerts.any_enabled());
        alerts.gotify.enabled = true;
        assert!(alerts.any_enabled());
    }
}
