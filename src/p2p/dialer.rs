/**
 * p2p/dialer.rs
 *
 * Consumer side of the rendezvous: request a provider's candidates over the
 * relay, punch through, and hand back a channel
 */

use super::channel::Channel;
use super::messages::{
    now_ms, reply_topic, service_topic, PeerCandidate, SignalingRequest, SignalingResponse, SignedEnvelope,
};
use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::identity::{Identity, Signer, Verifier};
use crate::nat_traversal::{DialState, IpResolver, NatPinger, PeerRole, PortPool, TraversalParams};
use crate::relay::{Relay, SubscriptionCallback};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Establishes channels to providers
pub struct Dialer {
    relay: Arc<dyn Relay>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    ip_resolver: Arc<dyn IpResolver>,
    pinger: Arc<dyn NatPinger>,
    config: P2pConfig,
    ports: Arc<PortPool>,
}

impl Dialer {
    pub fn new(
        relay: Arc<dyn Relay>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
        ip_resolver: Arc<dyn IpResolver>,
        pinger: Arc<dyn NatPinger>,
    ) -> Self {
        let config = P2pConfig::default();
        Self {
            relay,
            signer,
            verifier,
            ip_resolver,
            pinger,
            ports: Arc::new(PortPool::new(config.bind_ip)),
            config,
        }
    }

    pub fn with_config(mut self, config: P2pConfig) -> Self {
        self.ports = Arc::new(PortPool::new(config.bind_ip));
        self.config = config;
        self
    }

    /// Share a port pool with a listener in the same process so the two
    /// never offer the same local port
    pub fn with_port_pool(mut self, ports: Arc<PortPool>) -> Self {
        self.ports = ports;
        self
    }

    /// Connect to `peer_id`'s `service_type`. `timeout` bounds the whole
    /// attempt, signalling and traversal included.
    pub async fn dial(
        &self,
        self_id: &Identity,
        peer_id: &Identity,
        service_type: &str,
        timeout: Duration,
    ) -> P2pResult<Channel> {
        let mut state = DialState::Idle;
        match self.run(self_id, peer_id, service_type, timeout, &mut state).await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                transition(&mut state, DialState::Failed(e.to_string()));
                warn!(peer = %peer_id, service = service_type, error = %e, "dial failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        self_id: &Identity,
        peer_id: &Identity,
        service_type: &str,
        timeout: Duration,
        state: &mut DialState,
    ) -> P2pResult<Channel> {
        let deadline = Instant::now() + timeout;
        let token: u64 = rand::random();
        let reply_topic = reply_topic(self_id, service_type, token);

        // Step 1: Listen for the answer before asking
        let (tx, mut replies) = mpsc::unbounded_channel();
        let callback: SubscriptionCallback = Arc::new(move |payload| {
            let _ = tx.send(payload);
        });
        let subscription = self
            .relay
            .subscribe(&reply_topic, callback)
            .await
            .map_err(P2pError::Relay)?;

        // Step 2: Publish our candidates and wait for the provider's
        let exchange = tokio::time::timeout_at(
            deadline,
            self.exchange(self_id, peer_id, service_type, token, &reply_topic, &mut replies, state),
        )
        .await;

        // Step 3: The reply topic is single-use
        if let Err(e) = self.relay.unsubscribe(&reply_topic, subscription).await {
            debug!(topic = %reply_topic, error = %e, "unsubscribe failed");
        }

        let (local_ports, provider) = match exchange {
            Ok(result) => result?,
            Err(_) => return Err(P2pError::SignalingTimeout(timeout)),
        };

        let peer_ip: IpAddr = provider
            .public_ip
            .parse()
            .map_err(|_| P2pError::InvalidMessage(format!("bad provider address {:?}", provider.public_ip)))?;

        // Step 4: Hole punching with whatever time is left
        transition(state, DialState::Traversing);
        let params = TraversalParams {
            role: PeerRole::Consumer,
            peer_ip,
            desired: self.config.required_connections.min(local_ports.len()),
            local_ports,
            remote_ports: provider.local_ports,
            initial_ttl: PeerRole::Consumer.initial_ttl(&self.config),
            exact: false,
            token,
            timeout: deadline.saturating_duration_since(Instant::now()),
        };
        let sockets = self.pinger.ping_peer(params).await?;

        // Step 5: Wrap the live sockets
        let channel = Channel::new(sockets, self.config.resend_interval())?;
        transition(state, DialState::ChannelReady);
        info!(
            peer = %peer_id,
            service = service_type,
            sockets = channel.socket_count(),
            "channel established"
        );
        Ok(channel)
    }

    /// Publish the signed request and return our ports plus the provider's
    /// verified candidate
    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        self_id: &Identity,
        peer_id: &Identity,
        service_type: &str,
        token: u64,
        reply_topic: &str,
        replies: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        state: &mut DialState,
    ) -> P2pResult<(Vec<u16>, PeerCandidate)> {
        let public_ip = self
            .ip_resolver
            .resolve_public_ip()
            .await
            .map_err(P2pError::IpResolution)?;
        let local_ports = self.ports.acquire(self.config.ports_per_attempt)?;

        let request = SignalingRequest {
            service_type: service_type.to_string(),
            consumer: PeerCandidate {
                public_ip,
                local_ports: local_ports.clone(),
                remote_ports: Vec::new(),
            },
            reply_topic: reply_topic.to_string(),
            token,
            timestamp_ms: now_ms(),
        };
        let envelope = SignedEnvelope::seal(self.signer.as_ref(), self_id, &request)?;
        self.relay
            .publish(&service_topic(peer_id, service_type), envelope.to_bytes()?)
            .await
            .map_err(P2pError::Relay)?;
        transition(state, DialState::RequestPublished);
        transition(state, DialState::AwaitingPeerCandidate);

        loop {
            let Some(payload) = replies.recv().await else {
                return Err(P2pError::Relay(anyhow::anyhow!("reply subscription ended")));
            };
            let envelope = match SignedEnvelope::from_bytes(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(error = %e, "ignoring undecodable reply");
                    continue;
                }
            };

            transition(state, DialState::CandidateReceived);
            let response: SignalingResponse = envelope.open(self.verifier.as_ref(), Some(peer_id))?;
            if response.token != token {
                debug!(token = response.token, "ignoring stale reply");
                transition(state, DialState::AwaitingPeerCandidate);
                continue;
            }

            let provider = response.provider;
            if provider.remote_ports != local_ports || provider.local_ports.len() != local_ports.len() {
                return Err(P2pError::InvalidMessage(format!(
                    "provider paired {} ports against {:?}, we offered {:?}",
                    provider.local_ports.len(),
                    provider.remote_ports,
                    local_ports
                )));
            }
            return Ok((local_ports, provider));
        }
    }
}

fn transition(state: &mut DialState, next: DialState) {
    debug!(from = ?state, to = ?next, "dial state");
    *state = next;
}
