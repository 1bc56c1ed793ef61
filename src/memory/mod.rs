//! Off-chip side: the memory controller in front of the directory and the stacked DRAM timing
//! model behind it.

pub mod backing;
pub mod config;
pub mod controller;
pub mod stacked;

use crate::base::ComponentId;

pub use backing::BackingStore;
pub use controller::MemoryController;
pub use stacked::{Reject, RejectReason, StackedBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRequest {
    pub id: u64,
    pub addr: u64,
    pub write: bool,
    pub size: u32,
    /// Bytes to store, for writes.
    pub data: Option<Vec<u8>>,
    pub src: ComponentId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemResponse {
    pub id: u64,
    pub addr: u64,
    pub write: bool,
    /// Bytes read, for reads.
    pub data: Option<Vec<u8>>,
}
