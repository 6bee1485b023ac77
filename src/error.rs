/**
 * error.rs
 *
 * Error types for rendezvous, traversal and channels
 */

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by `Dialer::dial` and `Listener::listen`.
#[derive(Debug, Error)]
pub enum P2pError {
    /// No reply from the peer before the dial deadline.
    #[error("no signalling reply from peer within {0:?}")]
    SignalingTimeout(Duration),

    /// Reply did not verify against the expected identity.
    #[error("peer signature verification failed")]
    Verification,

    #[error("NAT traversal failed: {0}")]
    Traversal(#[from] TraversalError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("relay error: {0:#}")]
    Relay(anyhow::Error),

    #[error("public IP resolution failed: {0:#}")]
    IpResolution(anyhow::Error),

    #[error("signing failed: {0}")]
    Signing(#[from] IdentityError),

    #[error("invalid signalling message: {0}")]
    InvalidMessage(String),

    #[error("network error: {0}")]
    Network(#[from] io::Error),
}

/// Errors from the NAT traversal engine.
#[derive(Debug, Error)]
pub enum TraversalError {
    /// Not a single pairing became live.
    #[error("no live connection after {0:?}")]
    Timeout(Duration),

    /// The caller demanded an exact count that was not reached.
    #[error("only {live} of {desired} required connections became live")]
    Partial { live: usize, desired: usize },

    #[error("invalid port candidates: {0}")]
    Candidates(String),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request timed out")]
    Timeout,

    #[error("channel closed")]
    Closed,

    #[error("no handler for topic {0:?}")]
    UnknownTopic(String),

    /// The peer's handler answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("frame of {size} bytes exceeds datagram limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no key for identity {0}")]
    UnknownIdentity(String),

    #[error("malformed identity: {0}")]
    Malformed(String),
}

impl P2pError {
    /// True when a fresh `dial` with new candidates may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            P2pError::SignalingTimeout(_) | P2pError::Traversal(_) | P2pError::Network(_)
        )
    }
}

/// Result type alias for rendezvous operations.
pub type P2pResult<T> = Result<T, P2pError>;
