/**
 * config.rs
 *
 * Tunables for traversal, signalling and channels
 */

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by `Dialer`, `Listener`, `UdpPinger` and `Channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Local address probe sockets bind to
    pub bind_ip: IpAddr,

    /// Candidate ports offered per dial attempt
    pub ports_per_attempt: usize,

    /// Live connections a traversal waits for before returning
    pub required_connections: usize,

    /// First-mover TTL; low enough that early probes die before the peer NAT
    pub provider_initial_ttl: u32,

    pub consumer_initial_ttl: u32,

    pub max_ttl: u32,

    pub probe_interval_ms: u64,

    /// Upper bound for one traversal attempt on the listener side
    pub traversal_timeout_ms: u64,

    /// Retransmission interval for channel requests awaiting a reply
    pub resend_interval_ms: u64,

    /// Listener rejects signalling requests older than this
    pub max_request_age_secs: u64,

    /// Accept self-signed relay certificates (development only)
    pub accept_invalid_certs: bool,

    /// How long to wait for a STUN binding response
    pub stun_timeout_ms: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports_per_attempt: 5,
            required_connections: 2,
            provider_initial_ttl: 2,
            consumer_initial_ttl: 128,
            max_ttl: 128,
            probe_interval_ms: 20,
            traversal_timeout_ms: 15_000,
            resend_interval_ms: 250,
            max_request_age_secs: 60,
            accept_invalid_certs: false,
            stun_timeout_ms: 5_000,
        }
    }
}

impl P2pConfig {
    /// Build a config from `P2P_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(ip) = env_parse::<IpAddr>("P2P_BIND_IP")? {
            config.bind_ip = ip;
        }
        if let Some(n) = env_parse("P2P_PORTS_PER_ATTEMPT")? {
            config.ports_per_attempt = n;
        }
        if let Some(n) = env_parse("P2P_REQUIRED_CONNECTIONS")? {
            config.required_connections = n;
        }
        if let Some(ttl) = env_parse("P2P_PROVIDER_INITIAL_TTL")? {
            config.provider_initial_ttl = ttl;
        }
        if let Some(ttl) = env_parse("P2P_CONSUMER_INITIAL_TTL")? {
            config.consumer_initial_ttl = ttl;
        }
        if let Some(ttl) = env_parse("P2P_MAX_TTL")? {
            config.max_ttl = ttl;
        }
        if let Some(ms) = env_parse("P2P_PROBE_INTERVAL_MS")? {
            config.probe_interval_ms = ms;
        }
        if let Some(ms) = env_parse("P2P_TRAVERSAL_TIMEOUT_MS")? {
            config.traversal_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("P2P_RESEND_INTERVAL_MS")? {
            config.resend_interval_ms = ms;
        }
        if let Some(secs) = env_parse("P2P_MAX_REQUEST_AGE_SECS")? {
            config.max_request_age_secs = secs;
        }
        if let Some(accept) = env_parse("P2P_ACCEPT_INVALID_CERTS")? {
            config.accept_invalid_certs = accept;
        }
        if let Some(ms) = env_parse("P2P_STUN_TIMEOUT_MS")? {
            config.stun_timeout_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports_per_attempt == 0 {
            return Err(anyhow!("ports_per_attempt must be at least 1"));
        }
        if self.required_connections == 0 {
            return Err(anyhow!("required_connections must be at least 1"));
        }
        if self.required_connections > self.ports_per_attempt {
            return Err(anyhow!(
                "required_connections ({}) exceeds ports_per_attempt ({})",
                self.required_connections,
                self.ports_per_attempt
            ));
        }
        for (name, ttl) in [
            ("provider_initial_ttl", self.provider_initial_ttl),
            ("consumer_initial_ttl", self.consumer_initial_ttl),
            ("max_ttl", self.max_ttl),
        ] {
            if ttl == 0 || ttl > 255 {
                return Err(anyhow!("{} must be in 1..=255, got {}", name, ttl));
            }
        }
        if self.probe_interval_ms == 0 || self.resend_interval_ms == 0 {
            return Err(anyhow!("probe and resend intervals must be non-zero"));
        }
        if self.stun_timeout_ms == 0 {
            return Err(anyhow!("stun_timeout_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn traversal_timeout(&self) -> Duration {
        Duration::from_millis(self.traversal_timeout_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn max_request_age(&self) -> Duration {
        Duration::from_secs(self.max_request_age_secs)
    }

    pub fn stun_timeout(&self) -> Duration {
        Duration::from_millis(self.stun_timeout_ms)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value for {}: {}", key, e)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow!("Invalid value for {}: {}", key, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = P2pConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.required_connections, 2);
        assert!(config.provider_initial_ttl < config.consumer_initial_ttl);
    }

    #[test]
    fn rejects_more_connections_than_ports() {
        let config = P2pConfig {
            ports_per_attempt: 1,
            required_connections: 2,
            ..P2pConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_ttl() {
        let config = P2pConfig {
            max_ttl: 300,
            ..P2pConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: P2pConfig =
            serde_json::from_str(r#"{"bind_ip": "127.0.0.1", "ports_per_attempt": 3}"#).unwrap();
        assert_eq!(config.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.ports_per_attempt, 3);
        assert_eq!(config.max_ttl, 128);
    }

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = env::temp_dir().join(format!("p2p-rendezvous-{}-{}.json", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_reads_json_file() {
        let path = write_temp("valid", r#"{"ports_per_attempt": 4, "stun_timeout_ms": 1500}"#);
        let config = P2pConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.ports_per_attempt, 4);
        assert_eq!(config.stun_timeout(), Duration::from_millis(1500));
        assert_eq!(config.required_connections, 2);
    }

    #[test]
    fn load_rejects_invalid_files() {
        let missing = env::temp_dir().join("p2p-rendezvous-does-not-exist.json");
        assert!(P2pConfig::load(&missing).is_err());

        let garbled = write_temp("garbled", "{ports_per_attempt");
        assert!(P2pConfig::load(&garbled).is_err());
        std::fs::remove_file(&garbled).unwrap();

        let out_of_range = write_temp("range", r#"{"ports_per_attempt": 1, "required_connections": 3}"#);
        let err = P2pConfig::load(&out_of_range).unwrap_err();
        std::fs::remove_file(&out_of_range).unwrap();
        assert!(err.to_string().contains("required_connections"));
    }
}
