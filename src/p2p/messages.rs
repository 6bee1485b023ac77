/**
 * p2p/messages.rs
 *
 * Signalling messages exchanged through the relay
 */

use crate::error::P2pError;
use crate::identity::{Identity, Signer, Verifier};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Address information one side offers for hole punching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub public_ip: String,
    pub local_ports: Vec<u16>,
    /// Ports of the other side these were paired against (empty in a request)
    #[serde(default)]
    pub remote_ports: Vec<u16>,
}

/// Consumer -> provider, published on the service topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingRequest {
    pub service_type: String,
    pub consumer: PeerCandidate,
    pub reply_topic: String,
    /// Per-attempt token, echoed in the response and carried by every probe
    pub token: u64,
    pub timestamp_ms: u64,
}

/// Provider -> consumer, published on the request's reply topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingResponse {
    pub provider: PeerCandidate,
    pub token: u64,
}

/// Payload plus the signer's claimed identity and signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub signer: Identity,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    /// Serialize `body` and sign it as `identity`
    pub fn seal<T: Serialize>(signer: &dyn Signer, identity: &Identity, body: &T) -> Result<Self, P2pError> {
        let payload = serde_json::to_vec(body).map_err(|e| P2pError::InvalidMessage(e.to_string()))?;
        let signature = signer.sign(identity, &payload)?;
        Ok(Self {
            payload,
            signer: identity.clone(),
            signature,
        })
    }

    /// Verify the signature and decode the payload. With `expected` set, the
    /// envelope must also come from that identity. Every mismatch is reported
    /// as the same `Verification` error.
    pub fn open<T: DeserializeOwned>(&self, verifier: &dyn Verifier, expected: Option<&Identity>) -> Result<T, P2pError> {
        if expected.is_some_and(|id| *id != self.signer) {
            return Err(P2pError::Verification);
        }
        if !verifier.verify(&self.signer, &self.payload, &self.signature) {
            return Err(P2pError::Verification);
        }
        serde_json::from_slice(&self.payload).map_err(|e| P2pError::InvalidMessage(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, P2pError> {
        serde_json::to_vec(self).map_err(|e| P2pError::InvalidMessage(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, P2pError> {
        serde_json::from_slice(data).map_err(|e| P2pError::InvalidMessage(e.to_string()))
    }
}

/// Topic a provider listens on for one service type
pub fn service_topic(provider: &Identity, service_type: &str) -> String {
    format!("{}.p2p.{}", provider, service_type)
}

/// Prefix every reply topic of `consumer` for `service_type` starts with
pub fn reply_topic_prefix(consumer: &Identity, service_type: &str) -> String {
    format!("{}.p2p.{}.reply.", consumer, service_type)
}

/// Single-use topic the consumer awaits the provider's answer on
pub fn reply_topic(consumer: &Identity, service_type: &str, token: u64) -> String {
    format!("{}{:016x}", reply_topic_prefix(consumer, service_type), token)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Ed25519Verifier, Keystore};

    fn request() -> SignalingRequest {
        SignalingRequest {
            service_type: "wireguard".into(),
            consumer: PeerCandidate {
                public_ip: "127.0.0.1".into(),
                local_ports: vec![50000, 50001],
                remote_ports: vec![],
            },
            reply_topic: "c.p2p.wireguard.reply.01".into(),
            token: 7,
            timestamp_ms: now_ms(),
        }
    }

    #[test]
    fn sealed_envelope_opens_for_verifier() {
        let keystore = Keystore::new();
        let consumer = keystore.generate();
        let sent = request();
        let envelope = SignedEnvelope::seal(&keystore, &consumer, &sent).unwrap();

        let wire = envelope.to_bytes().unwrap();
        let decoded = SignedEnvelope::from_bytes(&wire).unwrap();
        let opened: SignalingRequest = decoded.open(&Ed25519Verifier, Some(&consumer)).unwrap();
        assert_eq!(opened, sent);
    }

    #[test]
    fn wrong_signer_and_tampering_look_identical() {
        let keystore = Keystore::new();
        let consumer = keystore.generate();
        let other = keystore.generate();
        let envelope = SignedEnvelope::seal(&keystore, &consumer, &request()).unwrap();

        let wrong_expected = envelope.open::<SignalingRequest>(&Ed25519Verifier, Some(&other));
        assert!(matches!(wrong_expected, Err(P2pError::Verification)));

        let mut forged = envelope.clone();
        forged.signer = other;
        assert!(matches!(
            forged.open::<SignalingRequest>(&Ed25519Verifier, None),
            Err(P2pError::Verification)
        ));

        let mut tampered = envelope;
        tampered.payload[0] ^= 0xff;
        assert!(matches!(
            tampered.open::<SignalingRequest>(&Ed25519Verifier, None),
            Err(P2pError::Verification)
        ));
    }

    #[test]
    fn byte_fields_travel_as_hex() {
        let envelope = SignedEnvelope {
            payload: vec![0xab, 0xcd],
            signer: Identity::from_address("ff"),
            signature: vec![0x01],
        };
        let json = String::from_utf8(envelope.to_bytes().unwrap()).unwrap();
        assert!(json.contains(r#""payload":"abcd""#));
        assert!(json.contains(r#""signature":"01""#));
    }

    #[test]
    fn topics_are_scoped_by_identity_and_service() {
        let provider = Identity::from_address("aa");
        let consumer = Identity::from_address("bb");
        assert_eq!(service_topic(&provider, "wireguard"), "aa.p2p.wireguard");
        assert_ne!(service_topic(&provider, "wireguard"), service_topic(&provider, "openvpn"));

        let reply = reply_topic(&consumer, "wireguard", 255);
        assert_eq!(reply, "bb.p2p.wireguard.reply.00000000000000ff");
        assert!(reply.starts_with(&reply_topic_prefix(&consumer, "wireguard")));
    }
}
