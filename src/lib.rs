pub mod base;
pub mod hier;
pub mod interconnect;
pub mod memory;
pub mod sim;
pub mod timeq;
