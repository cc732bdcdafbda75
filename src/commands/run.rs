//! Run command implementation: one full remediation pass.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::alerts::{AlertManager, NoopNotifier, Notifier};
use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::lock::LockGuard;
use crate::probe::{check_root, IcmpProbe};
use crate::providers::cloudflare::CloudflareDns;
use crate::providers::remote_host::SshRemoteHost;
use crate::providers::routeros::RouterOsClient;
use crate::providers::scaleway::ScalewayAllocator;
use crate::signal::{ShutdownGuard, ShutdownToken};
use crate::workflow::{Collaborators, RemediationWorkflow, WorkflowOutcome, WorkflowSettings};

/// Run the remediation workflow
pub async fn run(dry_run: bool, config_path: &Path) -> Result<WorkflowOutcome> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    if !dry_run {
        check_root()?;
    }

    let _lock = LockGuard::acquire(&config.lock_file)?;

    let shutdown = ShutdownToken::new();
    let _signals = ShutdownGuard::new(shutdown.clone());

    let feed = Fetcher::new(&config.feed)?;
    let allocator = ScalewayAllocator::new(&config.scaleway)?;
    let dns = CloudflareDns::new(&config.cloudflare)?;
    let router = RouterOsClient::new(&config.routeros)?;
    let host = SshRemoteHost::new(&config.ssh, Arc::new(RealCommandExecutor::new()));
    let probe = IcmpProbe::new(config.reachability.probe_timeout());
    let notifier: Box<dyn Notifier> = if config.alerts.any_enabled() {
        Box::new(AlertManager::new(config.alerts.clone())?)
    } else {
        Box::new(NoopNotifier)
    };

    let mut settings = WorkflowSettings::from_config(&config);
    settings.dry_run = dry_run;

    let workflow = RemediationWorkflow::new(
        Collaborators {
            feed: &feed,
            allocator: &allocator,
            dns: &dns,
            router: &router,
            host: &host,
            probe: &probe,
            notifier: notifier.as_ref(),
        },
        settings,
    );

    let outcome = workflow.run(&shutdown).await;
    println!("{}", summary(&outcome));
    Ok(outcome)
}

/// One-line status for the terminal
fn summary(outcome: &WorkflowOutcome) -> String {
    match outcome {
        WorkflowOutcome::NoActionNeeded { address } => {
            format!("[OK] {} is not blocklisted, nothing to do", address)
        }
        WorkflowOutcome::WouldRotate { address } => {
            format!("[DRY-RUN] {} is blocklisted and would be rotated", address)
        }
        WorkflowOutcome::Remediated { old, new, probes, .. } => format!(
            "[OK] Rotated {} -> {} (reachable after {} probe(s))",
            old, new, probes
        ),
        WorkflowOutcome::Failed { stage, cause } => {
            format!("[FAILED] {}: {}", stage, cause)
        }
    }
}
