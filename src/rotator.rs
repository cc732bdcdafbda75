//! Replacement address acquisition.
//!
//! [`AddressRotator`] asks the allocator for fresh addresses until one is not
//! on the blocklist. Every rejected candidate is released afterwards, on
//! success and on failure alike, so no address stays allocated without an
//! owner.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use tracing::{info, warn};

use crate::blocklist::{is_blocked, Blocklist};
use crate::error::RemediationError;
use crate::signal::ShutdownToken;

/// Server an address is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRef {
    pub id: String,
    pub name: String,
}

/// An address known to the allocator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub id: String,
    pub address: IpAddr,
    pub server: Option<ServerRef>,
}

/// A freshly allocated address not yet attached to anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCandidate {
    pub id: String,
    pub address: IpAddr,
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.id)
    }
}

/// Cloud provider address lifecycle
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// All addresses in the account, attached or not
    async fn list_server_addresses(&self) -> Result<Vec<AddressRecord>>;

    /// Reserve a new address
    async fn allocate_address(&self) -> Result<AddressCandidate>;

    /// Give an address back to the provider
    async fn release_address(&self, id: &str) -> Result<()>;

    /// Detach an address from whatever server holds it
    async fn detach(&self, id: &str) -> Result<()>;

    /// Attach an address to a server
    async fn attach(&self, id: &str, server_id: &str) -> Result<()>;
}

/// Result of a successful rotation
#[derive(Debug, Clone)]
pub struct Rotation {
    /// The clean address
    pub candidate: AddressCandidate,
    /// Blocked candidates that were drawn before it
    pub rejected: usize,
    /// Rejected candidates whose release failed
    pub release_failures: usize,
}

/// Draws addresses from an allocator until one is absent from the blocklist
pub struct AddressRotator<'a> {
    allocator: &'a dyn AddressAllocator,
    max_attempts: Option<u32>,
    shutdown: Option<ShutdownToken>,
}

impl<'a> AddressRotator<'a> {
    /// Unbounded rotator
    pub fn new(allocator: &'a dyn AddressAllocator) -> Self {
        Self {
            allocator,
            max_attempts: None,
            shutdown: None,
        }
    }

    /// Give up after `max` allocations (`None` keeps trying forever)
    pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    /// Stop drawing candidates once the token is cancelled
    pub fn with_shutdown(mut self, token: ShutdownToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Acquire an address for which `is_blocked(blocklist, ..)` is false.
    ///
    /// An allocator failure ends the loop immediately. Rejected candidates are
    /// released best-effort before returning; release failures are logged
    /// and counted but never turn a found address into an error.
    pub async fn acquire(&self, blocklist: &Blocklist) -> Result<Rotation, RemediationError> {
        let mut rejected: Vec<AddressCandidate> = Vec::new();

        let outcome = loop {
            if let Some(max) = self.max_attempts {
                if rejected.len() as u64 >= u64::from(max) {
                    break Err(RemediationError::RotationExhausted { attempts: max });
                }
            }
            if self.shutdown.as_ref().is_some_and(|t| t.is_cancelled()) {
                break Err(RemediationError::Cancelled);
            }

            match self.allocator.allocate_address().await {
                Err(e) => break Err(RemediationError::allocation(e)),
                Ok(candidate) if is_blocked(blocklist, &candidate.address) => {
                    warn!(ip = %candidate.address, "Allocated address is blocklisted, drawing another");
                    rejected.push(candidate);
                }
                Ok(candidate) => break Ok(candidate),
            }
        };

        let release_failures = self.release_all(&rejected).await;

        let candidate = outcome?;
        info!("Got new clean address: {}", candidate.address);

        Ok(Rotation {
            candidate,
            rejected: rejected.len(),
            release_failures,
        })
    }

    /// Release every candidate once; returns how many releases failed
    async fn release_all(&self, candidates: &[AddressCandidate]) -> usize {
        let mut failures = 0;
        for candidate in candidates {
            if let Err(e) = self.allocator.release_address(&candidate.id).await {
                warn!("Failed to release rejected address {}: {:#}", candidate, e);
                failures += 1;
            }
        }
        failures
    }
}
