//! Error types for ipflip.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::blocklist::ParseError;

/// Errors that end a remediation run.
///
/// Every variant is fatal to the run; the workflow attaches the stage in
/// which it occurred (see [`crate::workflow::WorkflowOutcome`]).
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error("Blocklist fetch failed: {0}")]
    Fetch(String),

    #[error("Blocklist parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("Address allocator error: {0}")]
    Allocation(String),

    #[error("Gave up rotating address after {attempts} blocked candidates")]
    RotationExhausted { attempts: u32 },

    #[error("Connectivity check [{target}]: no reply within {}s", deadline.as_secs())]
    ReachabilityTimeout { target: IpAddr, deadline: Duration },

    #[error("Reconfiguration of {system} failed: {message}")]
    Reconfiguration {
        system: &'static str,
        message: String,
    },

    #[error("Server {server} was left without a public address: {message}")]
    ServerUnattached { server: String, message: String },

    #[error("Cancelled by shutdown request")]
    Cancelled,
}

impl RemediationError {
    /// Build a reconfiguration error from any collaborator failure.
    pub fn reconfiguration(system: &'static str, err: anyhow::Error) -> Self {
        RemediationError::Reconfiguration {
            system,
            message: format!("{:#}", err),
        }
    }

    /// Whether the failure itself left the server in a state an operator
    /// has to repair, whatever stage it happened in.
    pub fn leaves_partial_state(&self) -> bool {
        matches!(self, RemediationError::ServerUnattached { .. })
    }

    /// Build an allocation error, keeping the full context chain.
    pub fn allocation(err: anyhow::Error) -> Self {
        RemediationError::Allocation(format!("{:#}", err))
    }
}
