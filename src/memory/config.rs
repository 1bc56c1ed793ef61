use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::sim::config::Config;
use crate::sim::units::{Bytes, Frequency, Latency};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingMode {
    /// Keep written data in a sparse line map.
    #[default]
    Malloc,
    /// Discard writes and read zeros.
    None,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub clock: Frequency,
    pub backing: BackingMode,
    /// Largest request handed to the backend; bigger ones are split.
    pub request_width: Bytes,
    pub addr_range_start: u64,
    pub addr_range_end: u64,
}

impl Config for MemoryConfig {}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            clock: Frequency::ghz(1),
            backing: BackingMode::Malloc,
            request_width: Bytes(64),
            addr_range_start: 0,
            addr_range_end: (512 << 20) - 1,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.clock.0 > 0, "clock must be > 0");
        ensure!(self.request_width.0 > 0, "request_width must be > 0");
        ensure!(
            self.addr_range_end >= self.addr_range_start,
            "addr_range_end {:#x} < addr_range_start {:#x}",
            self.addr_range_end,
            self.addr_range_start
        );
        Ok(())
    }

    pub fn covers(&self, addr: u64, size: u32) -> bool {
        let last = addr.saturating_add((size as u64).max(1) - 1);
        addr >= self.addr_range_start && last <= self.addr_range_end
    }
}

/// HMC-like stacked DRAM timing parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub clock: Frequency,
    pub access_time: Latency,
    pub mem_size: Bytes,
    pub device_count: u64,
    pub link_count: u64,
    /// Outstanding requests per device.
    pub queue_depth: usize,
    pub bank_count: u64,
    /// Vaults per device.
    pub dram_count: u64,
    /// GiB per device.
    pub capacity_per_device: u64,
    /// Outstanding requests per link crossbar.
    pub xbar_depth: usize,
    pub max_req_size: Bytes,
    pub tag_count: usize,
    /// Bank cycles per access.
    pub dram_latency: u64,
    /// 0 = unlimited.
    pub max_requests_per_cycle: usize,
}

impl Config for BackendConfig {}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            clock: Frequency::ghz(1),
            access_time: Latency::ns(2),
            mem_size: Bytes::mib(512),
            device_count: 1,
            link_count: 4,
            queue_depth: 64,
            bank_count: 16,
            dram_count: 20,
            capacity_per_device: 4,
            xbar_depth: 128,
            max_req_size: Bytes(64),
            tag_count: 512,
            dram_latency: 30,
            max_requests_per_cycle: 4,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.clock.0 > 0, "clock must be > 0");
        ensure!(
            self.device_count > 0
                && self.link_count > 0
                && self.bank_count > 0
                && self.dram_count > 0
                && self.queue_depth > 0
                && self.xbar_depth > 0
                && self.tag_count > 0,
            "device, link, bank, vault, queue, crossbar and tag counts must all be > 0"
        );
        ensure!(self.max_req_size.0 > 0, "max_req_size must be > 0");
        let capacity = self.device_count * (self.capacity_per_device << 30);
        ensure!(
            self.mem_size.0 <= capacity,
            "mem_size {} exceeds {} devices of {} GiB",
            self.mem_size,
            self.device_count,
            self.capacity_per_device
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_capacity_is_checked() {
        assert!(BackendConfig::default().validate().is_ok());
        let config = BackendConfig {
            mem_size: Bytes(8 << 30),
            ..BackendConfig::default()
        };
        assert!(config.validate().is_err());
        let config = BackendConfig {
            bank_count: 0,
            ..BackendConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn range_covers_whole_request() {
        let memory = MemoryConfig {
            addr_range_end: 0xFFF,
            ..MemoryConfig::default()
        };
        assert!(memory.covers(0xFC0, 64));
        assert!(!memory.covers(0xFC1, 64));
    }

    #[test]
    fn backing_mode_names() {
        #[derive(Deserialize)]
        struct Wrap {
            backing: BackingMode,
        }
        let wrap: Wrap = toml::from_str("backing = \"none\"").unwrap();
        assert_eq!(BackingMode::None, wrap.backing);
        assert!(toml::from_str::<Wrap>("backing = \"mmap\"").is_err());
    }
}
