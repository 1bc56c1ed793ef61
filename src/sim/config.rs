use std::path::PathBuf;

use anyhow::{ensure, Context};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::hier::config::{CacheConfig, CpuConfig, DirectoryConfig};
use crate::interconnect::config::{BusConfig, NetworkConfig};
use crate::memory::config::{BackendConfig, MemoryConfig};
use crate::sim::units::Latency;

pub trait Config: DeserializeOwned + Serialize + Default {
    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        Self::from_section_or(section, Self::default())
    }

    /// Deserialize `section`, taking every key it leaves out from `defaults`.
    fn from_section_or(section: Option<&Value>, defaults: Self) -> anyhow::Result<Self> {
        let Some(section) = section else {
            warn!("config section not found, using defaults");
            return Ok(defaults);
        };
        let mut merged = Value::try_from(&defaults).context("cannot serialize config defaults")?;
        match (section, &mut merged) {
            (Value::Table(overrides), Value::Table(base)) => {
                for (key, value) in overrides {
                    base.insert(key.clone(), value.clone());
                }
            }
            _ => anyhow::bail!("config section must be a table"),
        }
        merged.try_into().context("cannot deserialize config")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub num_cores: usize,
    pub cores_per_l2: usize,
    pub log_level: u64,
    /// Simulated time limit; zero runs until the event queue drains.
    pub max_time: Latency,
    pub stats_json: Option<PathBuf>,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_cores: 4,
            cores_per_l2: 2,
            log_level: 0,
            max_time: Latency(0),
            stats_json: None,
        }
    }
}

/// One-way latency of every link kind in the reference topology.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LinkConfig {
    pub cpu_l1: Latency,
    pub l1_bus: Latency,
    pub bus_l2: Latency,
    pub l2_bus: Latency,
    pub bus_l3: Latency,
    pub l3_nic: Latency,
    pub nic_router: Latency,
    pub router_nic: Latency,
    pub nic_dir: Latency,
    pub dir_mem: Latency,
}

impl Config for LinkConfig {}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            cpu_l1: Latency(1_000),
            l1_bus: Latency(10_000),
            bus_l2: Latency(10_000),
            l2_bus: Latency(10_000),
            bus_l3: Latency(10_000),
            l3_nic: Latency(0),
            nic_router: Latency(10_000),
            router_nic: Latency(2_000),
            nic_dir: Latency(0),
            dir_mem: Latency(10_000),
        }
    }
}

/// Every section of a run's configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub sim: SimConfig,
    pub cpu: CpuConfig,
    pub l1: CacheConfig,
    pub l2: CacheConfig,
    pub l3: CacheConfig,
    pub bus: BusConfig,
    pub network: NetworkConfig,
    pub directory: DirectoryConfig,
    pub memory: MemoryConfig,
    pub backend: BackendConfig,
    pub links: LinkConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            sim: SimConfig::default(),
            cpu: CpuConfig::default(),
            l1: CacheConfig::l1(),
            l2: CacheConfig::l2(),
            l3: CacheConfig::l3(),
            bus: BusConfig::default(),
            network: NetworkConfig::default(),
            directory: DirectoryConfig::default(),
            memory: MemoryConfig::default(),
            backend: BackendConfig::default(),
            links: LinkConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_table(table: &Table) -> anyhow::Result<Self> {
        Ok(Self {
            sim: SimConfig::from_section(table.get("sim")).context("[sim]")?,
            cpu: CpuConfig::from_section(table.get("cpu")).context("[cpu]")?,
            l1: CacheConfig::from_section_or(table.get("l1"), CacheConfig::l1()).context("[l1]")?,
            l2: CacheConfig::from_section_or(table.get("l2"), CacheConfig::l2()).context("[l2]")?,
            l3: CacheConfig::from_section_or(table.get("l3"), CacheConfig::l3()).context("[l3]")?,
            bus: BusConfig::from_section(table.get("bus")).context("[bus]")?,
            network: NetworkConfig::from_section(table.get("network")).context("[network]")?,
            directory: DirectoryConfig::from_section(table.get("directory"))
                .context("[directory]")?,
            memory: MemoryConfig::from_section(table.get("memory")).context("[memory]")?,
            backend: BackendConfig::from_section(table.get("backend")).context("[backend]")?,
            links: LinkConfig::from_section(table.get("links")).context("[links]")?,
        })
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let table: Table = toml::from_str(text).context("cannot parse config toml")?;
        Self::from_table(&table)
    }

    /// Reject every out-of-range or contradictory parameter before anything is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.sim.num_cores > 0, "[sim] num_cores must be > 0");
        ensure!(self.sim.cores_per_l2 > 0, "[sim] cores_per_l2 must be > 0");
        ensure!(
            self.sim.num_cores % self.sim.cores_per_l2 == 0,
            "[sim] num_cores ({}) must be a multiple of cores_per_l2 ({})",
            self.sim.num_cores,
            self.sim.cores_per_l2
        );
        self.cpu.validate().context("[cpu]")?;
        self.l1.validate().context("[l1]")?;
        self.l2.validate().context("[l2]")?;
        self.l3.validate().context("[l3]")?;
        ensure!(
            self.l1.cache_line_size == self.l2.cache_line_size
                && self.l2.cache_line_size == self.l3.cache_line_size,
            "all cache levels must use the same line size"
        );
        let line = self.l1.cache_line_size.0;
        ensure!(
            self.directory.cache_line_size.0 == line,
            "[directory] cache_line_size must match the caches"
        );
        self.bus.validate().context("[bus]")?;
        self.network.validate(line).context("[network]")?;
        self.directory.validate().context("[directory]")?;
        self.memory.validate().context("[memory]")?;
        self.backend.validate().context("[backend]")?;
        ensure!(
            self.memory.request_width.0 <= self.backend.max_req_size.0,
            "[memory] request_width ({}) exceeds [backend] max_req_size ({})",
            self.memory.request_width,
            self.backend.max_req_size
        );
        ensure!(
            self.directory.addr_range_end <= self.memory.addr_range_end,
            "[directory] addr_range_end {:#x} lies beyond [memory] addr_range_end {:#x}",
            self.directory.addr_range_end,
            self.memory.addr_range_end
        );
        ensure!(
            self.cpu.mem_size.0 <= self.directory.addr_range_end.saturating_add(1),
            "[cpu] mem_size {:#x} is not covered by the directory",
            self.cpu.mem_size.0
        );
        Ok(())
    }
}
