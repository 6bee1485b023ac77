/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use crate::config::P2pConfig;
use crate::error::TraversalError;
use std::net::IpAddr;
use std::time::Duration;

/// Which side of the rendezvous is probing. The algorithm is the same for
/// both; only the starting TTL differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// First mover: starts with a low TTL so its probes open the local NAT
    /// mapping without reaching the consumer's NAT too early
    Provider,
    Consumer,
}

impl PeerRole {
    pub fn initial_ttl(self, config: &P2pConfig) -> u32 {
        match self {
            PeerRole::Provider => config.provider_initial_ttl,
            PeerRole::Consumer => config.consumer_initial_ttl,
        }
    }
}

/// One traversal attempt. Ports are paired by index and must not be reused
/// by a later attempt.
#[derive(Debug, Clone)]
pub struct TraversalParams {
    pub role: PeerRole,
    pub peer_ip: IpAddr,
    pub local_ports: Vec<u16>,
    pub remote_ports: Vec<u16>,
    pub initial_ttl: u32,
    /// Live connections to wait for
    pub desired: usize,
    /// Fail instead of returning fewer than `desired` connections
    pub exact: bool,
    /// Per-attempt token carried in every probe
    pub token: u64,
    pub timeout: Duration,
}

impl TraversalParams {
    pub fn validate(&self) -> Result<(), TraversalError> {
        if self.local_ports.is_empty() {
            return Err(TraversalError::Candidates("no local ports".into()));
        }
        if self.local_ports.len() != self.remote_ports.len() {
            return Err(TraversalError::Candidates(format!(
                "{} local ports but {} remote ports",
                self.local_ports.len(),
                self.remote_ports.len()
            )));
        }
        if self.desired == 0 || self.desired > self.local_ports.len() {
            return Err(TraversalError::Candidates(format!(
                "cannot establish {} connections from {} pairs",
                self.desired,
                self.local_ports.len()
            )));
        }
        if self.remote_ports.contains(&0) || self.local_ports.contains(&0) {
            return Err(TraversalError::Candidates("port 0 is not a candidate".into()));
        }
        Ok(())
    }
}

/// Dialer progress through the signalling state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialState {
    Idle,
    RequestPublished,
    AwaitingPeerCandidate,
    CandidateReceived,
    Traversing,
    ChannelReady,
    Failed(String),
}

/// Listener progress for one inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenState {
    Subscribed,
    RequestReceived,
    VerificationPending,
    CandidatePublished,
    Traversing,
    ChannelReady,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn params(local: Vec<u16>, remote: Vec<u16>, desired: usize) -> TraversalParams {
        TraversalParams {
            role: PeerRole::Consumer,
            peer_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_ports: local,
            remote_ports: remote,
            initial_ttl: 128,
            desired,
            exact: false,
            token: 1,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn accepts_matching_pairs() {
        assert!(params(vec![1000, 1001], vec![2000, 2001], 2).validate().is_ok());
    }

    #[test]
    fn rejects_bad_candidates() {
        assert!(params(vec![], vec![], 1).validate().is_err());
        assert!(params(vec![1000], vec![2000, 2001], 1).validate().is_err());
        assert!(params(vec![1000], vec![2000], 2).validate().is_err());
        assert!(params(vec![1000], vec![0], 1).validate().is_err());
    }

    #[test]
    fn provider_starts_lower_than_consumer() {
        let config = P2pConfig::default();
        assert!(PeerRole::Provider.initial_ttl(&config) < PeerRole::Consumer.initial_ttl(&config));
    }
}
