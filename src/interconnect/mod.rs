//! On-chip transport: the snooping-free bus between cache levels and the NIC/router network
//! between the last-level cache and the directory.

pub mod bus;
pub mod config;
pub mod nic;
pub mod router;

use crate::hier::message::CoherenceMessage;

pub use bus::Bus;
pub use nic::Nic;
pub use router::Router;

/// Network id: the router port a NIC hangs off.
pub type NetId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_net: NetId,
    pub dst_net: NetId,
    pub seq: u64,
    pub msg: CoherenceMessage,
    pub flits: u32,
    /// Buffer footprint, `flits * flit_size`.
    pub bytes: u32,
}
