use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::hier::message::HEADER_BYTES;
use crate::sim::config::Config;
use crate::sim::units::{Bandwidth, Bytes, Frequency};
use crate::timeq::Cycle;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub bus_frequency: Frequency,
    pub bus_latency_cycles: u64,
}

impl Config for BusConfig {}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_frequency: Frequency::ghz(2),
            bus_latency_cycles: 1,
        }
    }
}

impl BusConfig {
    pub fn latency(&self) -> Cycle {
        self.bus_frequency.cycles(self.bus_latency_cycles)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.bus_frequency.0 > 0, "bus_frequency must be > 0");
        ensure!(self.bus_latency_cycles > 0, "bus_latency_cycles must be > 0");
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// NIC injection bandwidth.
    pub network_bw: Bandwidth,
    pub xbar_bw: Bandwidth,
    pub link_bw: Bandwidth,
    pub flit_size: Bytes,
    /// Router input buffer per port; the NIC's credit pool.
    pub input_buf_size: Bytes,
    pub output_buf_size: Bytes,
}

impl Config for NetworkConfig {}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_bw: Bandwidth::gb_per_sec(25),
            xbar_bw: Bandwidth::gb_per_sec(1),
            link_bw: Bandwidth::gb_per_sec(1),
            flit_size: Bytes(72),
            input_buf_size: Bytes::kib(1),
            output_buf_size: Bytes::kib(1),
        }
    }
}

impl NetworkConfig {
    pub fn flits(&self, bytes: u32) -> u32 {
        bytes.div_ceil(self.flit_size.0.max(1) as u32)
    }

    /// Buffer space a packet of `bytes` occupies, in whole flits.
    pub fn footprint(&self, bytes: u32) -> u32 {
        self.flits(bytes) * self.flit_size.0 as u32
    }

    pub fn validate(&self, line_size: u64) -> anyhow::Result<()> {
        ensure!(self.flit_size.0 > 0, "flit_size must be > 0");
        ensure!(
            self.network_bw.0 > 0 && self.xbar_bw.0 > 0 && self.link_bw.0 > 0,
            "network bandwidths must be > 0"
        );
        let largest = self.footprint(HEADER_BYTES + line_size as u32) as u64;
        ensure!(
            self.input_buf_size.0 >= largest,
            "input_buf_size {} cannot hold a {}-byte packet",
            self.input_buf_size,
            largest
        );
        ensure!(
            self.output_buf_size.0 >= largest,
            "output_buf_size {} cannot hold a {}-byte packet",
            self.output_buf_size,
            largest
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_round_up_to_whole_flits() {
        let net = NetworkConfig::default();
        assert_eq!(1, net.flits(72));
        assert_eq!(2, net.flits(73));
        assert_eq!(72, net.footprint(HEADER_BYTES + 64));
        assert_eq!(144, net.footprint(HEADER_BYTES + 128));
        assert!(net.validate(64).is_ok());
    }

    #[test]
    fn buffers_must_hold_one_packet() {
        let net = NetworkConfig {
            input_buf_size: Bytes(64),
            ..NetworkConfig::default()
        };
        assert!(net.validate(64).is_err());
        let exact = NetworkConfig {
            output_buf_size: Bytes(72),
            ..NetworkConfig::default()
        };
        assert!(exact.validate(64).is_ok());
        let zero = NetworkConfig {
            flit_size: Bytes(0),
            ..NetworkConfig::default()
        };
        assert!(zero.validate(64).is_err());
    }

    #[test]
    fn bus_latency_in_picoseconds() {
        let bus = BusConfig {
            bus_latency_cycles: 3,
            ..BusConfig::default()
        };
        assert_eq!(1500, bus.latency());
    }
}
