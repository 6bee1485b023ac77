/**
 * p2p/mod.rs
 *
 * Rendezvous and peer channels:
 * - Signed signalling messages
 * - Channel frame codec
 * - Multiplexed request/reply channel
 * - Dialer (consumer) and Listener (provider)
 */

mod channel;
mod dialer;
mod frame;
mod listener;
pub mod messages;

pub use channel::{Channel, Context, Message};
pub use dialer::Dialer;
pub use frame::MAX_FRAME_LEN;
pub use listener::{Listener, ListenerHandle};
pub use messages::{PeerCandidate, SignalingRequest, SignalingResponse, SignedEnvelope};
