//! strongSwan on the rotated server, reconfigured over `ssh`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use super::RemoteHostConfigurer;
use crate::cmd_abstraction::CommandExecutor;
use crate::config::SshConfig;

const SSH: &str = "ssh";

/// Quote for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Escape regex metacharacters that can appear in an address
fn sed_escape(s: &str) -> String {
    s.replace('.', r"\.")
}

pub struct SshRemoteHost {
    config: SshConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl SshRemoteHost {
    pub fn new(config: &SshConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            config: config.clone(),
            executor,
        }
    }

    fn ssh_args(&self, host: IpAddr) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.config.identity_file.display().to_string(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            format!("{}@{}", self.config.user, host),
            "sh".to_string(),
            "-s".to_string(),
        ]
    }

    /// Shell script run on the host
    fn script(&self, old: IpAddr, new: IpAddr) -> String {
        format!(
            "sed -i {} {} && {}\n",
            shell_quote(&format!(
                "s/leftsourceip={}/leftsourceip={}/g",
                sed_escape(&old.to_string()),
                new
            )),
            shell_quote(&self.config.ipsec_config),
            self.config.reload_command
        )
    }
}

#[async_trait]
impl RemoteHostConfigurer for SshRemoteHost {
    async fn reconfigure(&self, old: IpAddr, new: IpAddr) -> Result<()> {
        let args = self.ssh_args(new);
        let script = self.script(old, new);
        debug!("Running on {}: {}", new, script.trim_end());

        let executor = self.executor.clone();
        let output = tokio::task::spawn_blocking(move || executor.run(SSH, &args, Some(script)))
            .await
            .context("ssh task failed")??;

        if !output.success {
            let code = output
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            anyhow::bail!(
                "ssh to {} exited with {}: {}",
                new,
                code,
                output.stderr_summary()
            );
        }

        info!("Changed IPsec source address on {} from {} to {}", new, old, new);
        Ok(())
    }
}
