/**
 * p2p/listener.rs
 *
 * Provider side of the rendezvous: answer verified requests with our own
 * candidates and hand each traversed channel to the caller
 */

use super::channel::Channel;
use super::messages::{
    now_ms, reply_topic_prefix, service_topic, PeerCandidate, SignalingRequest, SignalingResponse, SignedEnvelope,
};
use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::identity::{Identity, Signer, Verifier};
use crate::nat_traversal::{IpResolver, ListenState, NatPinger, PeerRole, PortPool, TraversalParams};
use crate::relay::{Relay, SubscriptionCallback, SubscriptionId};
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Requests remembered for duplicate suppression
const SEEN_REQUESTS: usize = 1024;

/// Largest candidate list accepted from a consumer
const MAX_CANDIDATE_PORTS: usize = 64;

/// Accepts channels from consumers
pub struct Listener {
    relay: Arc<dyn Relay>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    ip_resolver: Arc<dyn IpResolver>,
    pinger: Arc<dyn NatPinger>,
    config: P2pConfig,
    ports: Arc<PortPool>,
}

/// Live subscription returned by `Listener::listen`
pub struct ListenerHandle {
    relay: Arc<dyn Relay>,
    topic: String,
    subscription: SubscriptionId,
}

impl ListenerHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop accepting requests. Channels already handed out stay open.
    pub async fn stop(self) -> P2pResult<()> {
        self.relay
            .unsubscribe(&self.topic, self.subscription)
            .await
            .map_err(P2pError::Relay)?;
        info!(topic = %self.topic, "listener stopped");
        Ok(())
    }
}

/// Signer + token pairs already answered
#[derive(Default)]
struct SeenRequests {
    order: VecDeque<(Identity, u64)>,
    set: HashSet<(Identity, u64)>,
}

impl SeenRequests {
    /// Returns false if the pair was already seen
    fn insert(&mut self, key: (Identity, u64)) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.order.len() == SEEN_REQUESTS {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.set.insert(key);
        true
    }
}

/// Everything a request task needs, shared across tasks of one `listen`
struct Responder {
    relay: Arc<dyn Relay>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    ip_resolver: Arc<dyn IpResolver>,
    pinger: Arc<dyn NatPinger>,
    config: P2pConfig,
    ports: Arc<PortPool>,
    self_id: Identity,
    service_type: String,
    seen: Mutex<SeenRequests>,
    on_channel: Box<dyn Fn(Channel) + Send + Sync>,
}

impl Listener {
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

    pub fn with_port_pool(mut self, ports: Arc<PortPool>) -> Self {
        self.ports = ports;
        self
    }

    /// Subscribe to `service_type` requests addressed to `self_id`. Each
    /// request is served on its own task; `on_channel` is called once per
    /// established channel, possibly concurrently, before the channel starts
    /// dispatching requests.
    pub async fn listen<F>(&self, self_id: &Identity, service_type: &str, on_channel: F) -> P2pResult<ListenerHandle>
    where
        F: Fn(Channel) + Send + Sync + 'static,
    {
        let topic = service_topic(self_id, service_type);
        let responder = Arc::new(Responder {
            relay: Arc::clone(&self.relay),
            signer: Arc::clone(&self.signer),
            verifier: Arc::clone(&self.verifier),
            ip_resolver: Arc::clone(&self.ip_resolver),
            pinger: Arc::clone(&self.pinger),
            config: self.config.clone(),
            ports: Arc::clone(&self.ports),
            self_id: self_id.clone(),
            service_type: service_type.to_string(),
            seen: Mutex::new(SeenRequests::default()),
            on_channel: Box::new(on_channel),
        });

        let callback: SubscriptionCallback = Arc::new(move |payload| {
            let responder = Arc::clone(&responder);
            tokio::spawn(async move { responder.serve(payload).await });
        });
        let subscription = self
            .relay
            .subscribe(&topic, callback)
            .await
            .map_err(P2pError::Relay)?;

        info!(topic = %topic, state = ?ListenState::Subscribed, "listening");
        Ok(ListenerHandle {
            relay: Arc::clone(&self.relay),
            topic,
            subscription,
        })
    }
}

impl Responder {
    async fn serve(&self, payload: Vec<u8>) {
        let mut state = ListenState::RequestReceived;
        debug!(state = ?state, "signalling request");

        let Some((consumer, request)) = self.validate(&payload, &mut state) else {
            transition(&mut state, ListenState::Rejected);
            return;
        };

        match self.answer(&consumer, request, &mut state).await {
            Ok(channel) => {
                transition(&mut state, ListenState::ChannelReady);
                info!(
                    consumer = %consumer,
                    service = %self.service_type,
                    sockets = channel.socket_count(),
                    "channel established"
                );
                (self.on_channel)(channel.clone());
                channel.start();
            }
            Err(e) => {
                warn!(consumer = %consumer, state = ?state, error = %e, "request failed");
            }
        }
    }

    /// Every failed check drops the request without a reply
    fn validate(&self, payload: &[u8], state: &mut ListenState) -> Option<(Identity, SignalingRequest)> {
        let envelope = match SignedEnvelope::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "undecodable request");
                return None;
            }
        };

        transition(state, ListenState::VerificationPending);
        let request: SignalingRequest = match envelope.open(self.verifier.as_ref(), None) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "request rejected");
                return None;
            }
        };
        let consumer = envelope.signer;

        if request.service_type != self.service_type {
            debug!(service = %request.service_type, "request for another service");
            return None;
        }

        let age_ms = now_ms().saturating_sub(request.timestamp_ms);
        if age_ms > self.config.max_request_age().as_millis() as u64 {
            debug!(consumer = %consumer, age_ms, "stale request");
            return None;
        }

        // The reply must go to a topic owned by the signer
        if !request
            .reply_topic
            .starts_with(&reply_topic_prefix(&consumer, &self.service_type))
        {
            debug!(consumer = %consumer, topic = %request.reply_topic, "reply topic not owned by signer");
            return None;
        }

        let offered = request.consumer.local_ports.len();
        if offered == 0 || offered > MAX_CANDIDATE_PORTS {
            debug!(consumer = %consumer, offered, "unusable candidate list");
            return None;
        }

        let fresh = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((consumer.clone(), request.token));
        if !fresh {
            debug!(consumer = %consumer, token = request.token, "duplicate request");
            return None;
        }

        Some((consumer, request))
    }

    async fn answer(
        &self,
        consumer: &Identity,
        request: SignalingRequest,
        state: &mut ListenState,
    ) -> P2pResult<Channel> {
        let peer_ip: IpAddr = request
            .consumer
            .public_ip
            .parse()
            .map_err(|_| P2pError::InvalidMessage(format!("bad consumer address {:?}", request.consumer.public_ip)))?;

        let public_ip = self
            .ip_resolver
            .resolve_public_ip()
            .await
            .map_err(P2pError::IpResolution)?;
        let local_ports = self.ports.acquire(request.consumer.local_ports.len())?;

        let response = SignalingResponse {
            provider: PeerCandidate {
                public_ip,
                local_ports: local_ports.clone(),
                remote_ports: request.consumer.local_ports.clone(),
            },
            token: request.token,
        };
        let envelope = SignedEnvelope::seal(self.signer.as_ref(), &self.self_id, &response)?;
        self.relay
            .publish(&request.reply_topic, envelope.to_bytes()?)
            .await
            .map_err(P2pError::Relay)?;
        transition(state, ListenState::CandidatePublished);

        transition(state, ListenState::Traversing);
        debug!(consumer = %consumer, peer = %peer_ip, "punching towards consumer");
        let params = TraversalParams {
            role: PeerRole::Provider,
            peer_ip,
            desired: self.config.required_connections.min(local_ports.len()),
            local_ports,
            remote_ports: request.consumer.local_ports,
            initial_ttl: PeerRole::Provider.initial_ttl(&self.config),
            exact: false,
            token: request.token,
            timeout: self.config.traversal_timeout(),
        };
        let sockets = self.pinger.ping_peer(params).await?;

        Ok(Channel::idle(sockets, self.config.resend_interval())?)
    }
}

fn transition(state: &mut ListenState, next: ListenState) {
    debug!(from = ?state, to = ?next, "listen state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Ed25519Verifier, Keystore};
    use crate::nat_traversal::{StaticIpResolver, UdpPinger};
    use crate::p2p::messages::reply_topic;
    use crate::relay::MemoryBroker;
    use std::time::Duration;

    struct Fixture {
        broker: MemoryBroker,
        keystore: Arc<Keystore>,
        provider: Identity,
        consumer: Identity,
        _handle: ListenerHandle,
    }

    async fn listening() -> Fixture {
        let broker = MemoryBroker::new();
        let keystore = Arc::new(Keystore::new());
        let provider = keystore.generate();
        let consumer = keystore.generate();
        let config = P2pConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            traversal_timeout_ms: 200,
            ..P2pConfig::default()
        };
        let listener = Listener::new(
            Arc::new(broker.clone()),
            keystore.clone(),
            Arc::new(Ed25519Verifier),
            Arc::new(StaticIpResolver::new("127.0.0.1")),
            Arc::new(UdpPinger::new(&config)),
        )
        .with_config(config);
        let handle = listener.listen(&provider, "wireguard", |_| {}).await.unwrap();
        Fixture {
            broker,
            keystore,
            provider,
            consumer,
            _handle: handle,
        }
    }

    fn request(consumer: &Identity, token: u64) -> SignalingRequest {
        SignalingRequest {
            service_type: "wireguard".into(),
            consumer: PeerCandidate {
                public_ip: "127.0.0.1".into(),
                local_ports: vec![41001, 41002],
                remote_ports: Vec::new(),
            },
            reply_topic: reply_topic(consumer, "wireguard", token),
            token,
            timestamp_ms: now_ms(),
        }
    }

    async fn deliver(fx: &Fixture, signer: &Identity, request: &SignalingRequest) {
        let envelope = SignedEnvelope::seal(fx.keystore.as_ref(), signer, request).unwrap();
        fx.broker
            .publish(&service_topic(&fx.provider, "wireguard"), envelope.to_bytes().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn valid_request_gets_signed_candidates() {
        let fx = listening().await;
        let sent = request(&fx.consumer, 11);
        deliver(&fx, &fx.consumer, &sent).await;

        let replies = fx.broker.published(&sent.reply_topic);
        assert_eq!(replies.len(), 1);
        let envelope = SignedEnvelope::from_bytes(&replies[0]).unwrap();
        let response: SignalingResponse = envelope.open(&Ed25519Verifier, Some(&fx.provider)).unwrap();
        assert_eq!(response.token, 11);
        assert_eq!(response.provider.remote_ports, sent.consumer.local_ports);
        assert_eq!(response.provider.local_ports.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_answered_once() {
        let fx = listening().await;
        let sent = request(&fx.consumer, 12);
        deliver(&fx, &fx.consumer, &sent).await;
        deliver(&fx, &fx.consumer, &sent).await;
        assert_eq!(fx.broker.published(&sent.reply_topic).len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_get_no_reply() {
        let fx = listening().await;

        let mut forged = SignedEnvelope::seal(fx.keystore.as_ref(), &fx.consumer, &request(&fx.consumer, 1)).unwrap();
        forged.signature[0] ^= 0xff;
        fx.broker
            .publish(&service_topic(&fx.provider, "wireguard"), forged.to_bytes().unwrap())
            .await
            .unwrap();

        let mut other_service = request(&fx.consumer, 2);
        other_service.service_type = "openvpn".into();
        deliver(&fx, &fx.consumer, &other_service).await;

        let mut stale = request(&fx.consumer, 3);
        stale.timestamp_ms -= 120_000;
        deliver(&fx, &fx.consumer, &stale).await;

        // Signed by one identity, answer routed to another's topic
        let hijack = request(&fx.provider, 4);
        deliver(&fx, &fx.consumer, &hijack).await;

        let mut empty = request(&fx.consumer, 5);
        empty.consumer.local_ports.clear();
        deliver(&fx, &fx.consumer, &empty).await;

        fx.broker
            .publish(&service_topic(&fx.provider, "wireguard"), b"not json".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for token in 1..=5 {
            assert!(fx.broker.published(&reply_topic(&fx.consumer, "wireguard", token)).is_empty());
            assert!(fx.broker.published(&reply_topic(&fx.provider, "wireguard", token)).is_empty());
        }
    }

    #[tokio::test]
    async fn stop_unsubscribes() {
        let broker = MemoryBroker::new();
        let keystore = Arc::new(Keystore::new());
        let provider = keystore.generate();
        let listener = Listener::new(
            Arc::new(broker.clone()),
            keystore.clone(),
            Arc::new(Ed25519Verifier),
            Arc::new(StaticIpResolver::new("127.0.0.1")),
            Arc::new(UdpPinger::new(&P2pConfig::default())),
        );

        let handle = listener.listen(&provider, "wireguard", |_| {}).await.unwrap();
        assert_eq!(broker.subscribed_topics(), vec![service_topic(&provider, "wireguard")]);
        assert_eq!(handle.topic(), service_topic(&provider, "wireguard"));
        handle.stop().await.unwrap();
        assert!(broker.subscribed_topics().is_empty());
    }

    #[test]
    fn seen_requests_forget_oldest() {
        let mut seen = SeenRequests::default();
        let id = Identity::from_address("aa");
        assert!(seen.insert((id.clone(), 0)));
        assert!(!seen.insert((id.clone(), 0)));
        for token in 1..=SEEN_REQUESTS as u64 {
            assert!(seen.insert((id.clone(), token)));
        }
        assert!(seen.insert((id, 0)));
    }
}
