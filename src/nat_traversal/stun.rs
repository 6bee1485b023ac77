/**
 * nat_traversal/stun.rs
 *
 * Public IP resolution: fixed address or STUN binding request
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Supplies the public IP advertised in outgoing peer candidates
#[async_trait]
pub trait IpResolver: Send + Sync {
    async fn resolve_public_ip(&self) -> Result<String>;
}

/// Always answers with the same address. Useful on a LAN and in tests.
#[derive(Debug, Clone)]
pub struct StaticIpResolver {
    ip: String,
}

impl StaticIpResolver {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }
}

#[async_trait]
impl IpResolver for StaticIpResolver {
    async fn resolve_public_ip(&self) -> Result<String> {
        Ok(self.ip.clone())
    }
}

/// Learns the NAT's external address from a STUN server
#[derive(Debug, Clone)]
pub struct StunResolver {
    server: String,
    timeout: Duration,
}

impl StunResolver {
    /// `server` is `host:port`
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            timeout: STUN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query the server for our external address
    pub async fn query(&self) -> Result<SocketAddr> {
        let server = tokio::net::lookup_host(&self.server)
            .await
            .with_context(|| format!("Failed to resolve STUN server {}", self.server))?
            .next()
            .ok_or_else(|| anyhow!("STUN server {} has no address", self.server))?;

        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind)
            .await
            .context("Failed to bind UDP socket")?;

        let transaction_id: [u8; 12] = rand::random();
        socket
            .send_to(&binding_request(&transaction_id), server)
            .await
            .context("Failed to send STUN request")?;

        let mut buffer = [0u8; 1024];
        loop {
            let (len, from) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buffer))
                .await
                .map_err(|_| anyhow!("STUN server {} did not answer", self.server))?
                .context("Failed to receive STUN response")?;
            if from != server {
                continue;
            }
            let mapped = parse_binding_response(&buffer[..len], &transaction_id)?;
            debug!(server = %server, external = %mapped, "STUN mapping");
            return Ok(mapped);
        }
    }
}

#[async_trait]
impl IpResolver for StunResolver {
    async fn resolve_public_ip(&self) -> Result<String> {
        Ok(self.query().await?.ip().to_string())
    }
}

/// Build a STUN binding request (header only, no attributes)
pub(crate) fn binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(20);
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);
    request
}

/// Extract the mapped address from a binding response, preferring
/// XOR-MAPPED-ADDRESS over MAPPED-ADDRESS
pub(crate) fn parse_binding_response(data: &[u8], expected_transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if data.len() < 20 {
        return Err(anyhow!("STUN response too short"));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(anyhow!("Invalid STUN response type: 0x{:04x}", msg_type));
    }

    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(anyhow!("Invalid magic cookie"));
    }

    if &data[8..20] != expected_transaction_id {
        return Err(anyhow!("Transaction ID mismatch"));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(anyhow!("STUN response truncated"));
    }

    let mut fallback = None;
    let mut offset = 20;
    while offset + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > data.len() {
            break;
        }
        let attr = &data[offset..offset + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(attr, Some(expected_transaction_id)),
            ATTR_MAPPED_ADDRESS => fallback = Some(decode_address(attr, None)?),
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    fallback.ok_or_else(|| anyhow!("No address attribute found in STUN response"))
}

/// Decode an address attribute; XOR-ed when a transaction id is given
fn decode_address(data: &[u8], xor_with: Option<&[u8; 12]>) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(anyhow!("Address attribute too short"));
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor_with.is_some() {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut octets = [data[4], data[5], data[6], data[7]];
            if xor_with.is_some() {
                for (octet, key) in octets.iter_mut().zip(STUN_MAGIC_COOKIE.to_be_bytes()) {
                    *octet ^= key;
                }
            }
            IpAddr::from(octets)
        }
        0x02 => {
            if data.len() < 20 {
                return Err(anyhow!("Invalid IPv6 address length"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            if let Some(transaction_id) = xor_with {
                let mut key = [0u8; 16];
                key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
                key[4..16].copy_from_slice(transaction_id);
                for (octet, k) in octets.iter_mut().zip(key) {
                    *octet ^= k;
                }
            }
            IpAddr::from(octets)
        }
        _ => return Err(anyhow!("Unknown address family: {}", family)),
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// Binding response carrying a single XOR-MAPPED-ADDRESS for an IPv4 address
    fn xor_response(transaction_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let IpAddr::V4(ip) = addr.ip() else {
            panic!("test helper only builds IPv4 responses");
        };
        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        attr.extend_from_slice(&(u32::from(ip) ^ STUN_MAGIC_COOKIE).to_be_bytes());

        let mut msg = Vec::new();
        msg.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&((4 + attr.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(transaction_id);
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        msg.extend_from_slice(&attr);
        msg
    }

    #[test]
    fn request_header_layout() {
        let tid = [9u8; 12];
        let req = binding_request(&tid);
        assert_eq!(req.len(), 20);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&req[8..20], &tid);
    }

    #[test]
    fn parses_xor_mapped_address() {
        let tid = [3u8; 12];
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 40123);
        assert_eq!(parse_binding_response(&xor_response(&tid, addr), &tid).unwrap(), addr);
    }

    #[test]
    fn rejects_foreign_transaction() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 40123);
        let response = xor_response(&[1u8; 12], addr);
        assert!(parse_binding_response(&response, &[2u8; 12]).is_err());
        assert!(parse_binding_response(&response[..10], &[1u8; 12]).is_err());
    }

    #[tokio::test]
    async fn resolves_through_local_stun_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 20);
            let mut tid = [0u8; 12];
            tid.copy_from_slice(&buf[8..20]);
            server.send_to(&xor_response(&tid, from), from).await.unwrap();
        });

        let resolver = StunResolver::new(server_addr.to_string());
        assert_eq!(resolver.resolve_public_ip().await.unwrap(), "127.0.0.1");
    }

    #[tokio::test]
    async fn silent_server_fails_after_configured_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = StunResolver::new(silent.local_addr().unwrap().to_string())
            .with_timeout(Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        let err = resolver.resolve_public_ip().await.unwrap_err();
        assert!(err.to_string().contains("did not answer"));
        assert!(started.elapsed() < STUN_TIMEOUT);
    }

    #[tokio::test]
    async fn static_resolver_returns_configured_ip() {
        let resolver = StaticIpResolver::new("198.51.100.1");
        assert_eq!(resolver.resolve_public_ip().await.unwrap(), "198.51.100.1");
    }
}
