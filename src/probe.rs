//! Single-shot ICMP echo probe.

use async_trait::async_trait;
use pnet::packet::icmp::{self, echo_reply, echo_request, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{self, Icmpv6Packet, Icmpv6Types};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;
use pnet::transport::{
    self, TransportChannelType, TransportProtocol, TransportReceiver, TransportSender,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

const TRANSPORT_BUFFER_SIZE: usize = 4096;
const ECHO_PAYLOAD: &[u8] = b"1234567890";
const ECHO_HEADER_LEN: usize = 8;

const CHANNEL_TYPE_ICMP: TransportChannelType =
    TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Icmp));
const CHANNEL_TYPE_ICMPV6: TransportChannelType =
    TransportChannelType::Layer4(TransportProtocol::Ipv6(IpNextHeaderProtocols::Icmpv6));

/// Why a probe attempt did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no echo reply before timeout")]
    Timeout,

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("echo reply came from {actual}, expected {expected}")]
    WrongSource { expected: IpAddr, actual: IpAddr },
}

/// Outcome of one probe attempt
pub type ProbeResult = Result<(), ProbeFailure>;

/// Fail early when raw ICMP sockets will be refused.
pub fn check_root() -> anyhow::Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "ICMP probing requires root privileges. Please run with sudo.\n\
             Alternatively, give the binary the CAP_NET_RAW capability."
        )
    }
    Ok(())
}

/// One liveness check against a target. Never retries internally.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self, target: IpAddr) -> ProbeResult;
}

/// ICMP echo over a raw socket (needs root or CAP_NET_RAW)
pub struct IcmpProbe {
    timeout: Duration,
    identifier: u16,
    sequence: AtomicU16,
}

impl IcmpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            identifier: (std::process::id() & 0xffff) as u16,
            sequence: AtomicU16::new(1),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for IcmpProbe {
    async fn probe(&self, target: IpAddr) -> ProbeResult {
        let echo = Echo {
            target,
            identifier: self.identifier,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timeout: self.timeout,
        };

        // pnet sockets are blocking
        tokio::task::spawn_blocking(move || echo.run())
            .await
            .unwrap_or_else(|e| Err(ProbeFailure::Transport(format!("probe task failed: {}", e))))
    }
}

/// What arrived on the socket, reduced to what the verdict needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    EchoReply { identifier: u16, sequence: u16 },
    /// Our own request looped back, or someone else's ping
    EchoRequest,
    /// Any other ICMP message type
    Other(u8),
    Truncated,
}

struct Echo {
    target: IpAddr,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
}

impl Echo {
    fn run(self) -> ProbeResult {
        match self.target {
            IpAddr::V4(_) => self.run_v4(),
            IpAddr::V6(_) => self.run_v6(),
        }
    }

    fn open(channel: TransportChannelType) -> Result<(TransportSender, TransportReceiver), ProbeFailure> {
        transport::transport_channel(TRANSPORT_BUFFER_SIZE, channel)
            .map_err(|e| ProbeFailure::Transport(format!("cannot open ICMP socket: {}", e)))
    }

    fn run_v4(self) -> ProbeResult {
        let (mut tx, mut rx) = Self::open(CHANNEL_TYPE_ICMP)?;

        let mut buf = vec![0u8; ECHO_HEADER_LEN + ECHO_PAYLOAD.len()];
        let mut request = echo_request::MutableEchoRequestPacket::new(&mut buf)
            .ok_or_else(|| ProbeFailure::Transport("echo request buffer too small".to_string()))?;
        request.set_icmp_type(IcmpTypes::EchoRequest);
        request.set_icmp_code(echo_request::IcmpCodes::NoCode);
        request.set_identifier(self.identifier);
        request.set_sequence_number(self.sequence);
        request.set_payload(ECHO_PAYLOAD);
        let csum = IcmpPacket::new(request.packet())
            .map(|p| icmp::checksum(&p))
            .unwrap_or(0);
        request.set_checksum(csum);

        tx.send_to(request, self.target)
            .map_err(|e| ProbeFailure::Transport(format!("send to {}: {}", self.target, e)))?;

        let started = Instant::now();
        let mut replies = transport::icmp_packet_iter(&mut rx);
        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(ProbeFailure::Timeout);
            }
            let (packet, source) = match replies.next_with_timeout(remaining) {
                Ok(Some(received)) => received,
                Ok(None) => return Err(ProbeFailure::Timeout),
                Err(e) => return Err(ProbeFailure::Transport(format!("receive: {}", e))),
            };

            let kind = match packet.get_icmp_type() {
                IcmpTypes::EchoReply => match echo_reply::EchoReplyPacket::new(packet.packet()) {
                    Some(reply) => Received::EchoReply {
                        identifier: reply.get_identifier(),
                        sequence: reply.get_sequence_number(),
                    },
                    None => Received::Truncated,
                },
                IcmpTypes::EchoRequest => Received::EchoRequest,
                other => Received::Other(other.0),
            };

            if let Some(verdict) = self.judge(kind, source) {
                return verdict;
            }
        }
    }

    fn run_v6(self) -> ProbeResult {
        let (mut tx, mut rx) = Self::open(CHANNEL_TYPE_ICMPV6)?;

        let mut buf = vec![0u8; ECHO_HEADER_LEN + ECHO_PAYLOAD.len()];
        let mut request = icmpv6::echo_request::MutableEchoRequestPacket::new(&mut buf)
            .ok_or_else(|| ProbeFailure::Transport("echo request buffer too small".to_string()))?;
        request.set_icmpv6_type(Icmpv6Types::EchoRequest);
        request.set_icmpv6_code(icmpv6::Icmpv6Code(0));
        request.set_identifier(self.identifier);
        request.set_sequence_number(self.sequence);
        request.set_payload(ECHO_PAYLOAD);
        // The kernel fills in the ICMPv6 checksum on raw sockets.
        request.set_checksum(0);

        tx.send_to(request, self.target)
            .map_err(|e| ProbeFailure::Transport(format!("send to {}: {}", self.target, e)))?;

        let started = Instant::now();
        let mut replies = transport::icmpv6_packet_iter(&mut rx);
        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(ProbeFailure::Timeout);
            }
            let (packet, source): (Icmpv6Packet, IpAddr) = match replies.next_with_timeout(remaining) {
                Ok(Some(received)) => received,
                Ok(None) => return Err(ProbeFailure::Timeout),
                Err(e) => return Err(ProbeFailure::Transport(format!("receive: {}", e))),
            };

            let kind = match packet.get_icmpv6_type() {
                Icmpv6Types::EchoReply => {
                    match icmpv6::echo_reply::EchoReplyPacket::new(packet.packet()) {
                        Some(reply) => Received::EchoReply {
                            identifier: reply.get_identifier(),
                            sequence: reply.get_sequence_number(),
                        },
                        None => Received::Truncated,
                    }
                }
                Icmpv6Types::EchoRequest => Received::EchoRequest,
                other => Received::Other(other.0),
            };

            if let Some(verdict) = self.judge(kind, source) {
                return verdict;
            }
        }
    }

    /// Decide what a received message means for this attempt.
    ///
    /// `None` means the message is unrelated and the wait continues.
    fn judge(&self, received: Received, source: IpAddr) -> Option<ProbeResult> {
        let from_target = source.to_canonical() == self.target.to_canonical();

        match received {
            Received::EchoReply {
                identifier,
                sequence,
            } if identifier == self.identifier && sequence == self.sequence => {
                if from_target {
                    Some(Ok(()))
                } else {
                    Some(Err(ProbeFailure::WrongSource {
                        expected: self.target,
                        actual: source,
                    }))
                }
            }
            Received::EchoReply { .. } | Received::EchoRequest => None,
            Received::Truncated if from_target => Some(Err(ProbeFailure::MalformedReply(
                "truncated echo reply".to_string(),
            ))),
            Received::Other(kind) if from_target => Some(Err(ProbeFailure::MalformedReply(
                format!("expected echo reply, got ICMP type {}", kind),
            ))),
            Received::Truncated | Received::Other(_) => None,
        }
    }
}
