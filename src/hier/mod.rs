//! The cache hierarchy proper: line storage, miss tracking, the MSI controllers at every level,
//! the directory and the traffic source that drives them.

pub mod cache;
pub mod config;
pub mod cpu;
pub mod directory;
pub mod l1;
pub mod line;
pub mod message;
pub mod mshr;

pub use cache::InnerCache;
pub use cpu::{CpuOp, TrafficCpu};
pub use directory::Directory;
pub use l1::L1Cache;
pub use line::LineState;
