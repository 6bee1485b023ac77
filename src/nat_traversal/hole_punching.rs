/**
 * nat_traversal/hole_punching.rs
 *
 * UDP hole punching over many port pairs with escalating TTL
 */

use super::types::TraversalParams;
use crate::config::P2pConfig;
use crate::error::TraversalError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

const PROBE_MAGIC: &[u8; 4] = b"P2PP";
const PROBE_LEN: usize = 14;

/// Acks sent when a pair goes live, so the peer completes its round trip too
const PONG_BURST: usize = 3;

/// Once one pair is live, how long the others get before a partial result is returned
const SETTLE_WINDOW: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Ping,
    Pong,
}

/// Hole punching probe datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePacket {
    pub kind: ProbeKind,
    /// Attempt token from signalling; probes from other attempts are ignored
    pub token: u64,
    /// TTL the probe was sent with
    pub ttl: u8,
}

impl ProbePacket {
    pub fn ping(token: u64, ttl: u32) -> Self {
        Self {
            kind: ProbeKind::Ping,
            token,
            ttl: ttl.min(u8::MAX as u32) as u8,
        }
    }

    pub fn pong(token: u64, ttl: u32) -> Self {
        Self {
            kind: ProbeKind::Pong,
            ..Self::ping(token, ttl)
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; PROBE_LEN] {
        let mut bytes = [0u8; PROBE_LEN];

        // Magic marker (4 bytes)
        bytes[0..4].copy_from_slice(PROBE_MAGIC);

        // Kind (1 byte)
        bytes[4] = match self.kind {
            ProbeKind::Ping => 0,
            ProbeKind::Pong => 1,
        };

        // Token (8 bytes)
        bytes[5..13].copy_from_slice(&self.token.to_be_bytes());

        // TTL (1 byte)
        bytes[13] = self.ttl;

        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != PROBE_LEN {
            return Err(anyhow!("Invalid probe packet length: {}", data.len()));
        }
        if &data[0..4] != PROBE_MAGIC {
            return Err(anyhow!("Invalid probe packet magic"));
        }

        let kind = match data[4] {
            0 => ProbeKind::Ping,
            1 => ProbeKind::Pong,
            other => return Err(anyhow!("Unknown probe kind: {}", other)),
        };

        let mut token = [0u8; 8];
        token.copy_from_slice(&data[5..13]);

        Ok(Self {
            kind,
            token: u64::from_be_bytes(token),
            ttl: data[13],
        })
    }
}

/// NAT traversal engine
#[async_trait]
pub trait NatPinger: Send + Sync {
    /// Probe every port pair concurrently and return the live sockets,
    /// each connected to the peer address it was reached on
    async fn ping_peer(&self, params: TraversalParams) -> Result<Vec<UdpSocket>, TraversalError>;
}

/// Hole puncher using plain UDP sockets
#[derive(Debug, Clone)]
pub struct UdpPinger {
    bind_ip: IpAddr,
    probe_interval: Duration,
    max_ttl: u32,
}

impl UdpPinger {
    pub fn new(config: &P2pConfig) -> Self {
        Self {
            bind_ip: config.bind_ip,
            probe_interval: config.probe_interval(),
            max_ttl: config.max_ttl,
        }
    }
}

#[async_trait]
impl NatPinger for UdpPinger {
    async fn ping_peer(&self, params: TraversalParams) -> Result<Vec<UdpSocket>, TraversalError> {
        params.validate()?;

        info!(
            role = ?params.role,
            peer = %params.peer_ip,
            pairs = params.local_ports.len(),
            desired = params.desired,
            initial_ttl = params.initial_ttl,
            "starting UDP hole punching"
        );

        let mut pairs = JoinSet::new();
        for (index, (&local_port, &remote_port)) in
            params.local_ports.iter().zip(&params.remote_ports).enumerate()
        {
            let pair = PairProbe {
                local: SocketAddr::new(self.bind_ip, local_port),
                remote: SocketAddr::new(params.peer_ip, remote_port),
                token: params.token,
                ttl: params.initial_ttl.min(self.max_ttl),
                max_ttl: self.max_ttl,
                interval: self.probe_interval,
            };
            pairs.spawn(async move { (index, pair.run().await) });
        }

        let started = Instant::now();
        let mut deadline = started + params.timeout;
        let mut live = Vec::with_capacity(params.desired);

        while live.len() < params.desired {
            match tokio::time::timeout_at(deadline, pairs.join_next()).await {
                Err(_) => {
                    debug!(live = live.len(), "traversal window closed");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok((index, Ok(socket))))) => {
                    debug!(index, peer = ?socket.peer_addr().ok(), "pair is live");
                    live.push(socket);
                    if !params.exact {
                        deadline = deadline.min(Instant::now() + SETTLE_WINDOW);
                    }
                }
                Ok(Some(Ok((index, Err(e))))) => {
                    warn!(index, error = %e, "pair probe failed");
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "pair probe task aborted");
                }
            }
        }
        pairs.abort_all();

        if live.is_empty() {
            warn!(peer = %params.peer_ip, elapsed = ?started.elapsed(), "hole punching failed");
            return Err(TraversalError::Timeout(params.timeout));
        }
        if params.exact && live.len() < params.desired {
            return Err(TraversalError::Partial {
                live: live.len(),
                desired: params.desired,
            });
        }

        info!(
            live = live.len(),
            elapsed = ?started.elapsed(),
            "UDP hole punched"
        );
        Ok(live)
    }
}

/// Probing state for one local/remote port pair
struct PairProbe {
    local: SocketAddr,
    remote: SocketAddr,
    token: u64,
    ttl: u32,
    max_ttl: u32,
    interval: Duration,
}

impl PairProbe {
    async fn run(mut self) -> io::Result<UdpSocket> {
        let socket = bind_reusable(self.local)?;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = [0u8; 64];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    set_hop_limit(&socket, self.remote, self.ttl)?;
                    let ping = ProbePacket::ping(self.token, self.ttl).to_bytes();
                    if let Err(e) = socket.send_to(&ping, self.remote).await {
                        trace!(remote = %self.remote, error = %e, "probe send failed");
                    }
                    self.ttl = (self.ttl + 1).min(self.max_ttl);
                }
                received = socket.recv_from(&mut buffer) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            trace!(local = %self.local, error = %e, "probe receive failed");
                            continue;
                        }
                    };
                    if from.ip() != self.remote.ip() {
                        trace!(%from, "ignoring datagram from unexpected address");
                        continue;
                    }
                    match ProbePacket::from_bytes(&buffer[..len]) {
                        Ok(probe) if probe.token == self.token => {
                            trace!(%from, kind = ?probe.kind, "probe received");
                            return self.go_live(socket, from).await;
                        }
                        Ok(_) => trace!(%from, "probe for another attempt"),
                        Err(e) => trace!(%from, error = %e, "not a probe"),
                    }
                }
            }
        }
    }

    /// Any valid probe from the peer proves the inbound path; answer with a
    /// PONG burst so the peer learns its outbound path works as well
    async fn go_live(self, socket: UdpSocket, from: SocketAddr) -> io::Result<UdpSocket> {
        set_hop_limit(&socket, self.remote, self.max_ttl)?;
        socket.connect(from).await?;
        let pong = ProbePacket::pong(self.token, self.max_ttl).to_bytes();
        for _ in 0..PONG_BURST {
            if let Err(e) = socket.send(&pong).await {
                trace!(%from, error = %e, "pong send failed");
            }
        }
        Ok(socket)
    }
}

/// IPv4 TTL or IPv6 unicast hop limit, whichever family the peer uses
fn set_hop_limit(socket: &UdpSocket, remote: SocketAddr, hops: u32) -> io::Result<()> {
    if remote.is_ipv6() {
        SockRef::from(socket).set_unicast_hops_v6(hops)
    } else {
        socket.set_ttl(hops)
    }
}

fn bind_reusable(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::ports::PortPool;
    use crate::nat_traversal::types::PeerRole;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn loopback_pinger() -> UdpPinger {
        UdpPinger::new(&P2pConfig {
            bind_ip: LOCALHOST,
            ..P2pConfig::default()
        })
    }

    fn params(role: PeerRole, local: Vec<u16>, remote: Vec<u16>, desired: usize, timeout: Duration) -> TraversalParams {
        TraversalParams {
            role,
            peer_ip: LOCALHOST,
            local_ports: local,
            remote_ports: remote,
            initial_ttl: PeerRole::initial_ttl(role, &P2pConfig::default()),
            desired,
            exact: false,
            token: 42,
            timeout,
        }
    }

    #[test]
    fn probe_packet_layout() {
        let bytes = ProbePacket::pong(0x0102030405060708, 300).to_bytes();
        assert_eq!(&bytes[0..4], b"P2PP");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[13], 255);

        let parsed = ProbePacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind, ProbeKind::Pong);
        assert_eq!(parsed.token, 0x0102030405060708);
    }

    #[test]
    fn rejects_foreign_datagrams() {
        assert!(ProbePacket::from_bytes(b"P2PC\x00\x00").is_err());
        let mut bytes = ProbePacket::ping(1, 2).to_bytes();
        bytes[4] = 9;
        assert!(ProbePacket::from_bytes(&bytes).is_err());
    }

    #[tokio::test]
    async fn both_sides_get_connected_sockets() {
        let pool = PortPool::new(LOCALHOST);
        let provider_ports = pool.acquire(3).unwrap();
        let consumer_ports = pool.acquire(3).unwrap();
        let timeout = Duration::from_secs(5);

        let provider_pinger = loopback_pinger();
        let consumer_pinger = loopback_pinger();
        let provider = provider_pinger.ping_peer(params(
            PeerRole::Provider,
            provider_ports.clone(),
            consumer_ports.clone(),
            3,
            timeout,
        ));
        let consumer = consumer_pinger.ping_peer(params(
            PeerRole::Consumer,
            consumer_ports,
            provider_ports,
            3,
            timeout,
        ));
        let (provider, consumer) = tokio::join!(provider, consumer);
        let provider = provider.unwrap();
        let consumer = consumer.unwrap();
        assert!(!provider.is_empty() && provider.len() <= 3);
        assert!(!consumer.is_empty() && consumer.len() <= 3);

        // Each socket on one side is connected to a socket on the other
        let target = consumer[0].peer_addr().unwrap();
        let peer = provider
            .iter()
            .find(|s| s.local_addr().unwrap().port() == target.port())
            .expect("consumer socket points at a live provider socket");
        consumer[0].send(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        loop {
            let n = peer.recv(&mut buf).await.unwrap();
            if &buf[..n] == b"hello" {
                break;
            }
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let pool = PortPool::new(LOCALHOST);
        let local = pool.acquire(2).unwrap();
        // Bound but never answering
        let silent_a = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let silent_b = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let remote = vec![
            silent_a.local_addr().unwrap().port(),
            silent_b.local_addr().unwrap().port(),
        ];

        let result = loopback_pinger()
            .ping_peer(params(PeerRole::Consumer, local, remote, 1, Duration::from_millis(300)))
            .await;
        assert!(matches!(result, Err(TraversalError::Timeout(_))));
    }

    #[tokio::test]
    async fn mismatched_candidates_fail_fast() {
        let result = loopback_pinger()
            .ping_peer(params(PeerRole::Consumer, vec![40000], vec![], 1, Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(TraversalError::Candidates(_))));
    }
    #[tokio::test]
    async fn exact_count_short_of_desired_is_partial() {
        let pool = PortPool::new(LOCALHOST);
        let local = pool.acquire(3).unwrap();

        // Only the first remote port answers probes
        let answering = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let silent_a = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let silent_b = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let remote = vec![
            answering.local_addr().unwrap().port(),
            silent_a.local_addr().unwrap().port(),
            silent_b.local_addr().unwrap().port(),
        ];
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((_, from)) = answering.recv_from(&mut buf).await else {
                    return;
                };
                let _ = answering.send_to(&ProbePacket::pong(42, 64).to_bytes(), from).await;
            }
        });

        let mut exact = params(PeerRole::Provider, local, remote, 3, Duration::from_millis(600));
        exact.exact = true;
        let result = loopback_pinger().ping_peer(exact).await;
        assert!(matches!(result, Err(TraversalError::Partial { live: 1, desired: 3 })));
    }

    #[tokio::test]
    async fn lenient_count_returns_live_subset() {
        let pool = PortPool::new(LOCALHOST);
        let local = pool.acquire(2).unwrap();

        let answering = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let silent = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let remote = vec![answering.local_addr().unwrap().port(), silent.local_addr().unwrap().port()];
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((_, from)) = answering.recv_from(&mut buf).await {
                let _ = answering.send_to(&ProbePacket::pong(42, 64).to_bytes(), from).await;
            }
        });

        let live = loopback_pinger()
            .ping_peer(params(PeerRole::Consumer, local, remote, 2, Duration::from_secs(3)))
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn hop_limit_follows_peer_family() {
        let v4 = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        set_hop_limit(&v4, "127.0.0.1:9".parse().unwrap(), 7).unwrap();
        assert_eq!(v4.ttl().unwrap(), 7);

        // Hosts without IPv6 loopback skip the rest
        let Ok(v6) = UdpSocket::bind("[::1]:0").await else {
            return;
        };
        set_hop_limit(&v6, "[::1]:9".parse().unwrap(), 9).unwrap();
        assert_eq!(SockRef::from(&v6).unicast_hops_v6().unwrap(), 9);
    }
}
