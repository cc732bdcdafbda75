//! One remediation run, start to finish.
//!
//! ```text
//! FetchBlocklist -> CheckCurrentAddress -+-> not blocked: NoActionNeeded
//!                                        |
//!                                        +-> blocked: RotateAddress
//!                                              -> ReconfigureDownstream (DNS, router, host)
//!                                              -> AwaitReachability -> Remediated
//! ```
//!
//! Any stage error ends the run as [`WorkflowOutcome::Failed`] carrying the
//! stage and its cause. Nothing is retried across stages and nothing is
//! rolled back.

use std::fmt;
use std::net::IpAddr;
use tracing::{error, info, warn};

use crate::alerts::{AlertTypes, Notifier};
use crate::blocklist::{is_blocked, parse_blocklist, Blocklist};
use crate::config::Config;
use crate::error::RemediationError;
use crate::fetcher::FeedSource;
use crate::probe::ReachabilityProbe;
use crate::providers::{DnsUpdater, RemoteHostConfigurer, TunnelPeerUpdater};
use crate::rotator::{AddressAllocator, AddressCandidate, AddressRecord, AddressRotator};
use crate::signal::ShutdownToken;
use crate::waiter::ReachabilityWaiter;

/// Workflow stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchBlocklist,
    CheckCurrentAddress,
    RotateAddress,
    ReconfigureDownstream,
    AwaitReachability,
}

impl Stage {
    /// Whether failing here can leave the server and its peers disagreeing
    /// about the address
    pub fn leaves_partial_state(&self) -> bool {
        matches!(self, Stage::ReconfigureDownstream | Stage::AwaitReachability)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FetchBlocklist => "FetchBlocklist",
            Stage::CheckCurrentAddress => "CheckCurrentAddress",
            Stage::RotateAddress => "RotateAddress",
            Stage::ReconfigureDownstream => "ReconfigureDownstream",
            Stage::AwaitReachability => "AwaitReachability",
        };
        f.write_str(name)
    }
}

/// How a run ended
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// The current address is not blocklisted
    NoActionNeeded { address: IpAddr },
    /// Dry run: the address is blocklisted and would be rotated
    WouldRotate { address: IpAddr },
    Remediated {
        old: IpAddr,
        new: IpAddr,
        /// Blocklisted candidates drawn (and released) before the clean one
        rejected: usize,
        /// Probes sent before the server answered
        probes: u32,
    },
    Failed {
        stage: Stage,
        cause: RemediationError,
    },
}

impl WorkflowOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, WorkflowOutcome::Failed { .. })
    }
}

/// Run parameters taken from the configuration
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Server whose address is watched
    pub server_name: String,
    pub max_attempts: Option<u32>,
    pub release_old_address: bool,
    /// Probe target; the new address when unset
    pub reachability_target: Option<IpAddr>,
    pub waiter: ReachabilityWaiter,
    /// Stop after CheckCurrentAddress
    pub dry_run: bool,
}

impl WorkflowSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_name: config.scaleway.server_name.clone(),
            max_attempts: config.rotation.max_attempts,
            release_old_address: config.rotation.release_old_address,
            reachability_target: config.reachability.target,
            waiter: ReachabilityWaiter::from_config(&config.reachability),
            dry_run: false,
        }
    }
}

/// Everything the workflow talks to
pub struct Collaborators<'a> {
    pub feed: &'a dyn FeedSource,
    pub allocator: &'a dyn AddressAllocator,
    pub dns: &'a dyn DnsUpdater,
    pub router: &'a dyn TunnelPeerUpdater,
    pub host: &'a dyn RemoteHostConfigurer,
    pub probe: &'a dyn ReachabilityProbe,
    pub notifier: &'a dyn Notifier,
}

type StageResult<T> = Result<T, (Stage, RemediationError)>;

fn at(stage: Stage) -> impl FnOnce(RemediationError) -> (Stage, RemediationError) {
    move |cause| (stage, cause)
}

pub struct RemediationWorkflow<'a> {
    with: Collaborators<'a>,
    settings: WorkflowSettings,
}

impl<'a> RemediationWorkflow<'a> {
    pub fn new(with: Collaborators<'a>, settings: WorkflowSettings) -> Self {
        Self { with, settings }
    }

    /// Execute every stage and report the outcome.
    ///
    /// Remediations and failures are sent to the notifier; no-action runs
    /// are not.
    pub async fn run(&self, shutdown: &ShutdownToken) -> WorkflowOutcome {
        let outcome = match self.execute(shutdown).await {
            Ok(outcome) => outcome,
            Err((stage, cause)) => WorkflowOutcome::Failed { stage, cause },
        };

        match &outcome {
            WorkflowOutcome::Remediated {
                old, new, rejected, ..
            } => {
                let (level, title, body) = AlertTypes::remediated(*old, *new, *rejected);
                self.with.notifier.notify(level, &title, &body).await;
            }
            WorkflowOutcome::Failed { stage, cause } => {
                error!("Remediation failed at {}: {}", stage, cause);
                let (level, title, body) = AlertTypes::failed(*stage, cause);
                self.with.notifier.notify(level, &title, &body).await;
            }
            WorkflowOutcome::NoActionNeeded { .. } | WorkflowOutcome::WouldRotate { .. } => {}
        }

        outcome
    }

    async fn execute(&self, shutdown: &ShutdownToken) -> StageResult<WorkflowOutcome> {
        self.enter(Stage::FetchBlocklist, shutdown)?;
        let blocklist = self
            .fetch_blocklist()
            .await
            .map_err(at(Stage::FetchBlocklist))?;

        self.enter(Stage::CheckCurrentAddress, shutdown)?;
        let current = self
            .current_address()
            .await
            .map_err(at(Stage::CheckCurrentAddress))?;

        if !is_blocked(&blocklist, &current.address) {
            info!(
                "Current address {} is not in the blocklist, nothing to do",
                current.address
            );
            return Ok(WorkflowOutcome::NoActionNeeded {
                address: current.address,
            });
        }
        warn!(ip = %current.address, "Current address is blocklisted");

        if self.settings.dry_run {
            info!("Dry run: would rotate {}", current.address);
            return Ok(WorkflowOutcome::WouldRotate {
                address: current.address,
            });
        }

        self.enter(Stage::RotateAddress, shutdown)?;
        let (new, rejected) = self
            .rotate(&blocklist, &current, shutdown)
            .await
            .map_err(at(Stage::RotateAddress))?;

        self.enter(Stage::ReconfigureDownstream, shutdown)?;
        self.reconfigure(current.address, new.address)
            .await
            .map_err(at(Stage::ReconfigureDownstream))?;

        self.enter(Stage::AwaitReachability, shutdown)?;
        let target = self.settings.reachability_target.unwrap_or(new.address);
        let probes = self
            .settings
            .waiter
            .wait(self.with.probe, target, shutdown)
            .await
            .map_err(at(Stage::AwaitReachability))?;

        info!("Remediated: {} -> {}", current.address, new.address);
        Ok(WorkflowOutcome::Remediated {
            old: current.address,
            new: new.address,
            rejected,
            probes,
        })
    }

    fn enter(&self, stage: Stage, shutdown: &ShutdownToken) -> StageResult<()> {
        if shutdown.is_cancelled() {
            return Err((stage, RemediationError::Cancelled));
        }
        info!("Stage: {}", stage);
        Ok(())
    }

    async fn fetch_blocklist(&self) -> Result<Blocklist, RemediationError> {
        let body = self
            .with
            .feed
            .fetch()
            .await
            .map_err(|e| RemediationError::Fetch(format!("{:#}", e)))?;
        let blocklist = parse_blocklist(&body)?;
        info!("Parsed blocklist: {} unique addresses", blocklist.len());
        Ok(blocklist)
    }

    /// The address attached to the configured server
    async fn current_address(&self) -> Result<AddressRecord, RemediationError> {
        let records = self
            .with
            .allocator
            .list_server_addresses()
            .await
            .map_err(RemediationError::allocation)?;

        let record = records
            .into_iter()
            .find(|r| {
                r.server
                    .as_ref()
                    .is_some_and(|s| s.name == self.settings.server_name)
            })
            .ok_or_else(|| {
                RemediationError::Allocation(format!(
                    "no address attached to server {}",
                    self.settings.server_name
                ))
            })?;

        info!(
            "Current address for server {}: {}",
            self.settings.server_name, record.address
        );
        Ok(record)
    }

    /// Acquire a clean address and move it onto the server
    async fn rotate(
        &self,
        blocklist: &Blocklist,
        current: &AddressRecord,
        shutdown: &ShutdownToken,
    ) -> Result<(AddressCandidate, usize), RemediationError> {
        let allocator = self.with.allocator;
        let server = current.server.as_ref().ok_or_else(|| {
            RemediationError::Allocation(format!("address {} has no server", current.address))
        })?;

        let rotation = AddressRotator::new(allocator)
            .with_max_attempts(self.settings.max_attempts)
            .with_shutdown(shutdown.clone())
            .acquire(blocklist)
            .await?;
        let candidate = rotation.candidate;

        if let Err(e) = allocator.detach(&current.id).await {
            self.release_unused(&candidate).await;
            return Err(RemediationError::allocation(e));
        }
        info!(
            "Detached blocklisted address {} from server {}",
            current.address, server.name
        );

        if let Err(e) = allocator.attach(&candidate.id, &server.id).await {
            self.release_unused(&candidate).await;
            warn!(
                "Attaching {} failed, restoring {} on server {}",
                candidate, current.address, server.name
            );
            return match allocator.attach(&current.id, &server.id).await {
                Ok(()) => Err(RemediationError::allocation(e)),
                Err(restore) => Err(RemediationError::ServerUnattached {
                    server: server.name.clone(),
                    message: format!(
                        "attach of {} failed ({:#}), re-attach of {} failed ({:#})",
                        candidate, e, current.address, restore
                    ),
                }),
            };
        }
        info!(
            "Attached clean address {} to server {}",
            candidate.address, server.name
        );

        if self.settings.release_old_address {
            match allocator.release_address(&current.id).await {
                Ok(()) => info!("Released old address {}", current.address),
                Err(e) => warn!("Failed to release old address {}: {:#}", current.address, e),
            }
        }

        Ok((candidate, rotation.rejected))
    }

    async fn release_unused(&self, candidate: &AddressCandidate) {
        if let Err(e) = self.with.allocator.release_address(&candidate.id).await {
            warn!("Failed to release unused address {}: {:#}", candidate, e);
        }
    }

    /// DNS, then router, then the host itself
    async fn reconfigure(&self, old: IpAddr, new: IpAddr) -> Result<(), RemediationError> {
        self.with
            .dns
            .update_record(new)
            .await
            .map_err(|e| RemediationError::reconfiguration("DNS", e))?;

        self.with
            .router
            .update_peer(old, new)
            .await
            .map_err(|e| RemediationError::reconfiguration("router", e))?;

        self.with
            .host
            .reconfigure(old, new)
            .await
            .map_err(|e| RemediationError::reconfiguration("remote host", e))?;

        Ok(())
    }
}
