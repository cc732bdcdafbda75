//! CLI command implementations.

pub mod check;
pub mod probe;
pub mod run;

use anyhow::Result;
use std::net::IpAddr;

/// Parse a command-line address argument
fn parse_ip(ip_str: &str) -> Result<IpAddr> {
    ip_str
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", ip_str))
}
