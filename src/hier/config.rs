use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::hier::line::ReplacementPolicy;
use crate::sim::config::Config;
use crate::sim::units::{Bytes, Frequency};

pub fn ensure_msi(protocol: &str) -> anyhow::Result<()> {
    ensure!(
        protocol.eq_ignore_ascii_case("msi"),
        "unsupported coherence protocol '{}', only MSI is modelled",
        protocol
    );
    Ok(())
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_size: Bytes,
    pub associativity: usize,
    pub cache_line_size: Bytes,
    pub replacement_policy: ReplacementPolicy,
    pub coherence_protocol: String,
    pub cache_frequency: Frequency,
    pub access_latency_cycles: u64,
    pub mshr_latency_cycles: u64,
    pub mshr_num_entries: usize,
    /// Seed for the `random` replacement policy.
    pub seed: u64,
}

impl Config for CacheConfig {}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::l1()
    }
}

impl CacheConfig {
    pub fn l1() -> Self {
        Self {
            cache_size: Bytes::kib(4),
            associativity: 4,
            cache_line_size: Bytes(64),
            replacement_policy: ReplacementPolicy::Lru,
            coherence_protocol: "MSI".to_string(),
            cache_frequency: Frequency::ghz(2),
            access_latency_cycles: 5,
            mshr_latency_cycles: 2,
            mshr_num_entries: 16,
            seed: 1,
        }
    }

    pub fn l2() -> Self {
        Self {
            cache_size: Bytes::kib(32),
            associativity: 8,
            access_latency_cycles: 20,
            mshr_latency_cycles: 4,
            mshr_num_entries: 32,
            ..Self::l1()
        }
    }

    pub fn l3() -> Self {
        Self {
            cache_size: Bytes::kib(64),
            associativity: 16,
            access_latency_cycles: 100,
            mshr_latency_cycles: 6,
            mshr_num_entries: 64,
            ..Self::l1()
        }
    }

    pub fn line_size(&self) -> u64 {
        self.cache_line_size.0
    }

    pub fn num_sets(&self) -> usize {
        let way_bytes = self.associativity as u64 * self.cache_line_size.0;
        if way_bytes == 0 {
            return 0;
        }
        (self.cache_size.0 / way_bytes) as usize
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.associativity > 0, "associativity must be > 0");
        let line = self.cache_line_size.0;
        ensure!(line >= 8 && line % 8 == 0, "cache_line_size {} must be a multiple of 8", line);
        let way_bytes = self.associativity as u64 * line;
        ensure!(
            self.cache_size.0 >= way_bytes && self.cache_size.0 % way_bytes == 0,
            "cache_size {} is not a multiple of associativity * cache_line_size ({})",
            self.cache_size,
            way_bytes
        );
        ensure!(
            self.num_sets().is_power_of_two(),
            "set count {} must be a power of two",
            self.num_sets()
        );
        ensure!(self.mshr_num_entries > 0, "mshr_num_entries must be > 0");
        ensure!(self.cache_frequency.0 > 0, "cache_frequency must be > 0");
        ensure_msi(&self.coherence_protocol)
    }
}

/// Synthetic load/store generator attached to each L1.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CpuConfig {
    pub clock: Frequency,
    /// Cycles between two issued requests.
    pub comm_freq: u64,
    pub num_loadstore: u64,
    pub do_write: bool,
    /// Seed of core 0; core `n` uses `rngseed + 200 * n`.
    pub rngseed: u64,
    pub mem_size: Bytes,
    pub max_outstanding: usize,
}

impl Config for CpuConfig {}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            clock: Frequency::ghz(2),
            comm_freq: 100,
            num_loadstore: 1000,
            do_write: true,
            rngseed: 101,
            mem_size: Bytes(0x10_0000),
            max_outstanding: 10,
        }
    }
}

impl CpuConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.clock.0 > 0, "clock must be > 0");
        ensure!(self.comm_freq > 0, "comm_freq must be > 0");
        ensure!(self.max_outstanding > 0, "max_outstanding must be > 0");
        ensure!(self.mem_size.0 >= 8, "mem_size must cover at least one word");
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DirectoryConfig {
    pub coherence_protocol: String,
    pub clock: Frequency,
    pub entry_cache_size: usize,
    pub addr_range_start: u64,
    pub addr_range_end: u64,
    pub access_latency_cycles: u64,
    /// Extra lookup cost when an entry is not in the entry cache.
    pub entry_miss_latency_cycles: u64,
    pub cache_line_size: Bytes,
}

impl Config for DirectoryConfig {}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            coherence_protocol: "MSI".to_string(),
            clock: Frequency::ghz(1),
            entry_cache_size: 32768,
            addr_range_start: 0,
            addr_range_end: 0x1F00_0000,
            access_latency_cycles: 2,
            entry_miss_latency_cycles: 10,
            cache_line_size: Bytes(64),
        }
    }
}

impl DirectoryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.addr_range_end >= self.addr_range_start,
            "addr_range_end {:#x} < addr_range_start {:#x}",
            self.addr_range_end,
            self.addr_range_start
        );
        ensure!(self.entry_cache_size > 0, "entry_cache_size must be > 0");
        ensure!(self.clock.0 > 0, "clock must be > 0");
        ensure!(
            self.cache_line_size.0.is_power_of_two(),
            "cache_line_size must be a power of two"
        );
        ensure_msi(&self.coherence_protocol)
    }

    pub fn covers(&self, addr: u64) -> bool {
        (self.addr_range_start..=self.addr_range_end).contains(&addr)
    }
}
