//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "ipflip")]
#[command(author, version, about = "Moves a server off a blocklisted address")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (for cron/systemd timer)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check the server's address and rotate it if blocklisted
    Run {
        /// Stop after checking; report whether a rotation would happen
        #[arg(long)]
        dry_run: bool,
    },

    /// Check whether an address is in the blocklist
    Check {
        /// IP address to check
        ip: String,
    },

    /// Wait until an address answers ICMP echo (needs root)
    Probe {
        /// IP address to probe
        ip: String,
    },

    /// Show version
    Version,
}
