//! Probe command implementation.

use anyhow::{Context, Result};
use std::path::Path;

use super::parse_ip;
use crate::config::Config;
use crate::probe::{check_root, IcmpProbe};
use crate::signal::{ShutdownGuard, ShutdownToken};
use crate::waiter::ReachabilityWaiter;

/// Run the probe command
pub async fn run(ip_str: &str, config_path: &Path) -> Result<()> {
    let ip = parse_ip(ip_str)?;
    check_root()?;

    let config = Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let shutdown = ShutdownToken::new();
    let _signals = ShutdownGuard::new(shutdown.clone());

    let probe = IcmpProbe::new(config.reachability.probe_timeout());
    let attempts = ReachabilityWaiter::from_config(&config.reachability)
        .wait(&probe, ip, &shutdown)
        .await?;

    println!("[OK] {} answered after {} probe(s)", ip, attempts);
    Ok(())
}
