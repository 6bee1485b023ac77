/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - Public IP discovery (STUN or fixed)
 * - Fresh local port candidates
 * - UDP hole punching over multiple port pairs
 */

mod hole_punching;
mod ports;
mod stun;
mod types;

pub use hole_punching::{NatPinger, ProbeKind, ProbePacket, UdpPinger};
pub use ports::PortPool;
pub use stun::{IpResolver, StaticIpResolver, StunResolver};
pub use types::{DialState, ListenState, PeerRole, TraversalParams};
