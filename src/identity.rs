/**
 * identity.rs
 *
 * Party identities, signing and signature verification
 */

use crate::error::IdentityError;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Prefix mixed into every signed signalling payload
const SIGNING_DOMAIN: &[u8] = b"P2P_RENDEZVOUS_SIGNAL";

/// Stable address of a party: lowercase hex of its Ed25519 public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn from_address(address: impl Into<String>) -> Self {
        Self(address.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&self.0, &mut bytes)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| IdentityError::Malformed(e.to_string()))
    }
}

impl From<&VerifyingKey> for Identity {
    fn from(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.to_bytes()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signs outgoing signalling payloads on behalf of an identity
pub trait Signer: Send + Sync {
    fn sign(&self, identity: &Identity, payload: &[u8]) -> Result<Vec<u8>, IdentityError>;
}

/// Checks a signature against the identity that claims to have produced it
pub trait Verifier: Send + Sync {
    fn verify(&self, claimed: &Identity, payload: &[u8], signature: &[u8]) -> bool;
}

/// In-memory keystore holding unlocked Ed25519 keys
#[derive(Default)]
pub struct Keystore {
    keys: RwLock<HashMap<Identity, SigningKey>>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh key and return its identity
    pub fn generate(&self) -> Identity {
        self.insert(SigningKey::generate(&mut OsRng))
    }

    /// Import an existing 32-byte secret key
    pub fn import(&self, secret: &[u8; 32]) -> Identity {
        self.insert(SigningKey::from_bytes(secret))
    }

    fn insert(&self, key: SigningKey) -> Identity {
        let identity = Identity::from(&key.verifying_key());
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), key);
        identity
    }
}

impl Signer for Keystore {
    fn sign(&self, identity: &Identity, payload: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let key = keys
            .get(identity)
            .ok_or_else(|| IdentityError::UnknownIdentity(identity.to_string()))?;
        Ok(key.sign(&message_to_sign(payload)).to_bytes().to_vec())
    }
}

/// Verifies signatures made by `Keystore` keys
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, claimed: &Identity, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = claimed.verifying_key() else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(&message_to_sign(payload), &signature).is_ok()
    }
}

fn message_to_sign(payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGNING_DOMAIN.len() + payload.len());
    message.extend_from_slice(SIGNING_DOMAIN);
    message.extend_from_slice(payload);
    message
}
