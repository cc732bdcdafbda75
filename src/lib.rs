//! # ipflip - blocklisted address remediation
//!
//! Watches the public address of a cloud server against a published
//! blocklist. When the address shows up, ipflip draws a fresh address that is
//! not listed, moves it onto the server, points every dependent system at it
//! and waits until the server answers on its new address.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ipflip                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, check, probe, version                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Workflow                                                   │
//! │    ├── Fetcher (reqwest + rustls) -> Blocklist parser       │
//! │    ├── AddressRotator (AddressAllocator trait)              │
//! │    ├── Providers: Scaleway, Cloudflare, RouterOS, ssh       │
//! │    └── ReachabilityWaiter -> IcmpProbe (pnet)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Alerts (telegram, gotify, smtp, webhook)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use ipflip::blocklist::{is_blocked, parse_blocklist};
//! use ipflip::config::Config;
//! use ipflip::fetcher::{FeedSource, Fetcher};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/ipflip/config.yaml")?;
//!
//!     let body = Fetcher::new(&config.feed)?.fetch().await?;
//!     let blocklist = parse_blocklist(&body)?;
//!
//!     let ip = "203.0.113.7".parse()?;
//!     println!("blocked: {}", is_blocked(&blocklist, &ip));
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`alerts`] - Alert destinations (Telegram, Gotify, Email, Webhook)
//! - [`blocklist`] - Feed tokenizer and address set
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External command execution
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Stage error taxonomy
//! - [`fetcher`] - HTTP client for the blocklist feed
//! - [`lock`] - File locking against overlapping runs
//! - [`probe`] - ICMP echo probe
//! - [`providers`] - Cloud, DNS, router and host integrations
//! - [`rotator`] - Clean address acquisition
//! - [`signal`] - Graceful shutdown signal handling
//! - [`utils`] - Formatting helpers
//! - [`waiter`] - Reachability polling
//! - [`workflow`] - The remediation state machine

pub mod alerts;
pub mod blocklist;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod lock;
pub mod probe;
pub mod providers;
pub mod rotator;
pub mod signal;
pub mod utils;
pub mod waiter;
pub mod workflow;

#[cfg(test)]
mod http_stub;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::RemediationError;
pub use workflow::{RemediationWorkflow, Stage, WorkflowOutcome};
