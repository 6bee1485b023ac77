#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod error;
pub mod identity;
pub mod nat_traversal;
pub mod p2p;
pub mod relay;

pub use config::P2pConfig;
pub use error::{ChannelError, IdentityError, P2pError, P2pResult, TraversalError};
pub use identity::{Ed25519Verifier, Identity, Keystore, Signer, Verifier};
pub use p2p::{Channel, Context, Dialer, Listener, ListenerHandle, Message};
