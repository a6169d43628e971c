//! flipmesh-core: peer addressing, wire format, and configuration.
//! All other flipmesh crates depend on this one.

pub mod config;
pub mod peer;
pub mod wire;

pub use peer::{AddressFamily, Peer, PeerError};
pub use wire::{AddPeer, ChangeState, Packet, PacketTag, Timestamp, WireError};
