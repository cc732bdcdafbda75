//! Check command implementation.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

use super::parse_ip;
use crate::blocklist::{is_blocked, parse_blocklist};
use crate::config::Config;
use crate::fetcher::{FeedSource, Fetcher};
use crate::utils::format_count;

/// Run the check command
pub async fn run(ip_str: &str, config_path: &Path) -> Result<()> {
    let ip = parse_ip(ip_str)?;

    let config = Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let fetcher = Fetcher::new(&config.feed)?;

    let blocked = lookup(&fetcher, ip).await?;

    println!();
    if blocked {
        println!("IP {} is BLOCKED", ip);
    } else {
        println!("IP {} is NOT blocked", ip);
    }
    println!();

    Ok(())
}

/// Fetch the feed and test `ip` against it
async fn lookup(feed: &dyn FeedSource, ip: IpAddr) -> Result<bool> {
    let body = feed.fetch().await.context("Failed to fetch blocklist")?;
    let blocklist = parse_blocklist(&body).context("Failed to parse blocklist")?;
    info!("Blocklist: {} addresses", format_count(blocklist.len()));
    Ok(is_blocked(&blocklist, &ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::mock::StaticFeed;

    const FEED: &str = "Updated: now\n1.1.1.1;x\n2.2.2.2 | 3.3.3.3xxx;y\n";

    #[tokio::test]
    async fn test_lookup_listed_and_unlisted() {
        let feed = StaticFeed::new(FEED);
        assert!(lookup(&feed, "2.2.2.2".parse().unwrap()).await.unwrap());
        assert!(!lookup(&feed, "3.3.3.3".parse().unwrap()).await.unwrap());
        assert_eq!(feed.fetches(), 2);
    }

    #[tokio::test]
    async fn test_lookup_mapped_address() {
        let feed = StaticFeed::new(FEED);
        assert!(lookup(&feed, "::ffff:1.1.1.1".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_fetch_error() {
        let feed = StaticFeed::failing("connection refused");
        let err = lookup(&feed, "1.1.1.1".parse().unwrap()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("connection refused"));
    }

    #[tokio::test]
    async fn test_invalid_ip_rejected_before_fetch() {
        let err = run("not-an-ip", Path::new("/nonexistent/config.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid IP address"));
    }
}
