//! Downstream systems that follow the server to its new address.
//!
//! Each system sits behind a small trait so the workflow can run against
//! fakes. Implementations:
//!
//! - [`scaleway::ScalewayAllocator`]: flexible IPs ([`crate::rotator::AddressAllocator`])
//! - [`cloudflare::CloudflareDns`]: the public DNS record
//! - [`routeros::RouterOsClient`]: IPsec peer and policy on the office router
//! - [`remote_host::SshRemoteHost`]: strongSwan on the server itself

pub mod cloudflare;
pub mod remote_host;
pub mod routeros;
pub mod scaleway;

use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;

/// Keeps a DNS record pointed at the server
#[async_trait]
pub trait DnsUpdater: Send + Sync {
    /// Set the configured record's value to `address`.
    async fn update_record(&self, address: IpAddr) -> Result<()>;
}

/// Router side of the IPsec tunnel
#[async_trait]
pub trait TunnelPeerUpdater: Send + Sync {
    /// Rewrite peer and policy entries that reference `old` to use `new`.
    async fn update_peer(&self, old: IpAddr, new: IpAddr) -> Result<()>;
}

/// Server side of the IPsec tunnel
#[async_trait]
pub trait RemoteHostConfigurer: Send + Sync {
    /// Rewrite the host's tunnel source address and reload the service.
    ///
    /// The host is reached at `new`, since `old` is no longer attached.
    async fn reconfigure(&self, old: IpAddr, new: IpAddr) -> Result<()>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records every call and fails on demand
    #[derive(Default)]
    pub struct MockDownstream {
        pub dns_updates: Mutex<Vec<IpAddr>>,
        pub peer_updates: Mutex<Vec<(IpAddr, IpAddr)>>,
        pub host_updates: Mutex<Vec<(IpAddr, IpAddr)>>,
        pub fail_dns: bool,
        pub fail_peer: bool,
        pub fail_host: bool,
    }

    impl MockDownstream {
        pub fn new() -> Self {
            Self::default()
        }

        /// Total number of calls across the three systems
        pub fn calls(&self) -> usize {
            self.dns_updates.lock().unwrap().len()
                + self.peer_updates.lock().unwrap().len()
                + self.host_updates.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DnsUpdater for MockDownstream {
        async fn update_record(&self, address: IpAddr) -> Result<()> {
            self.dns_updates.lock().unwrap().push(address);
            if self.fail_dns {
                anyhow::bail!("record not found");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TunnelPeerUpdater for MockDownstream {
        async fn update_peer(&self, old: IpAddr, new: IpAddr) -> Result<()> {
            self.peer_updates.lock().unwrap().push((old, new));
            if self.fail_peer {
                anyhow::bail!("router unreachable");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteHostConfigurer for MockDownstream {
        async fn reconfigure(&self, old: IpAddr, new: IpAddr) -> Result<()> {
            self.host_updates.lock().unwrap().push((old, new));
            if self.fail_host {
                anyhow::bail!("ssh exited with status 255");
            }
            Ok(())
        }
    }
}
