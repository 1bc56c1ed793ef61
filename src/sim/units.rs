//! Unit-bearing configuration quantities.
//!
//! Every quantity accepts a bare integer (bytes, Hz, picoseconds, bytes per second) or a string
//! with a unit suffix, e.g. `"4 KB"`, `"2GHz"`, `"1000ps"`, `"25GB/s"`.  Sizes use binary
//! multiples, bandwidths decimal ones.

use std::fmt;

use anyhow::{anyhow, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::timeq::Cycle;

pub const PS_PER_SEC: u64 = 1_000_000_000_000;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Int(u64),
    Text(String),
}

fn split_unit(text: &str) -> anyhow::Result<(f64, String)> {
    let text = text.trim();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '_'))
        .unwrap_or(text.len());
    let number = text[..end].replace('_', "");
    ensure!(!number.is_empty(), "'{}' does not start with a number", text);
    let value: f64 = number
        .parse()
        .map_err(|_| anyhow!("'{}' is not a valid number", number))?;
    Ok((value, text[end..].trim().to_ascii_lowercase()))
}

fn scaled(value: f64, scale: u64) -> u64 {
    (value * scale as f64).round() as u64
}

pub fn parse_size(text: &str) -> anyhow::Result<u64> {
    let (value, unit) = split_unit(text)?;
    let scale = match unit.as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        _ => bail!("unknown size unit in '{}'", text),
    };
    Ok(scaled(value, scale))
}

pub fn parse_frequency(text: &str) -> anyhow::Result<u64> {
    let (value, unit) = split_unit(text)?;
    let scale = match unit.as_str() {
        "" | "hz" => 1,
        "khz" => 1_000,
        "mhz" => 1_000_000,
        "ghz" => 1_000_000_000,
        _ => bail!("unknown frequency unit in '{}'", text),
    };
    Ok(scaled(value, scale))
}

pub fn parse_latency(text: &str) -> anyhow::Result<Cycle> {
    let (value, unit) = split_unit(text)?;
    let scale = match unit.as_str() {
        "" | "ps" => 1,
        "ns" => 1_000,
        "us" => 1_000_000,
        "ms" => 1_000_000_000,
        "s" => PS_PER_SEC,
        _ => bail!("unknown time unit in '{}'", text),
    };
    Ok(scaled(value, scale))
}

pub fn parse_bandwidth(text: &str) -> anyhow::Result<u64> {
    let (value, unit) = split_unit(text)?;
    let scale = match unit.as_str() {
        "" | "b/s" => 1,
        "kb/s" => 1_000,
        "mb/s" => 1_000_000,
        "gb/s" => 1_000_000_000,
        "kib/s" => 1 << 10,
        "mib/s" => 1 << 20,
        "gib/s" => 1 << 30,
        _ => bail!("unknown bandwidth unit in '{}'", text),
    };
    Ok(scaled(value, scale))
}

macro_rules! quantity {
    ($name:ident, $parse:ident, $what:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
        #[serde(try_from = "RawQuantity")]
        pub struct $name(pub u64);

        impl TryFrom<RawQuantity> for $name {
            type Error = String;

            fn try_from(raw: RawQuantity) -> Result<Self, Self::Error> {
                match raw {
                    RawQuantity::Int(value) => Ok(Self(value)),
                    RawQuantity::Text(text) => $parse(&text)
                        .map(Self)
                        .map_err(|err| format!("invalid {}: {}", $what, err)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

quantity!(Bytes, parse_size, "size");
quantity!(Frequency, parse_frequency, "frequency");
quantity!(Latency, parse_latency, "latency");
quantity!(Bandwidth, parse_bandwidth, "bandwidth");

impl Bytes {
    pub fn kib(n: u64) -> Self {
        Self(n << 10)
    }

    pub fn mib(n: u64) -> Self {
        Self(n << 20)
    }
}

impl Frequency {
    pub fn ghz(n: u64) -> Self {
        Self(n * 1_000_000_000)
    }

    /// Clock period in picoseconds, never zero.
    pub fn period(&self) -> Cycle {
        (PS_PER_SEC / self.0.max(1)).max(1)
    }

    /// Duration of `cycles` clock periods.
    pub fn cycles(&self, cycles: u64) -> Cycle {
        self.period().saturating_mul(cycles)
    }
}

impl Latency {
    pub fn ns(n: u64) -> Self {
        Self(n * 1_000)
    }
}

impl Bandwidth {
    pub fn gb_per_sec(n: u64) -> Self {
        Self(n * 1_000_000_000)
    }

    /// Picoseconds needed to move `bytes`, rounded up.
    pub fn transfer_time(&self, bytes: u64) -> Cycle {
        let bw = self.0.max(1) as u128;
        let ps = (bytes as u128 * PS_PER_SEC as u128).div_ceil(bw);
        ps.min(u64::MAX as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_binary() {
        assert_eq!(4096, parse_size("4 KB").unwrap());
        assert_eq!(32 << 10, parse_size("32KiB").unwrap());
        assert_eq!(512 << 20, parse_size("512MiB").unwrap());
        assert_eq!(72, parse_size("72B").unwrap());
        assert!(parse_size("4 KQ").is_err());
    }

    #[test]
    fn frequency_period() {
        let f = Frequency(parse_frequency("2 GHz").unwrap());
        assert_eq!(500, f.period());
        assert_eq!(1000, Frequency::ghz(1).period());
        assert_eq!(2000, Frequency(parse_frequency("500MHz").unwrap()).period());
    }

    #[test]
    fn latency_and_bandwidth() {
        assert_eq!(2000, parse_latency("2ns").unwrap());
        assert_eq!(10_000, parse_latency("10000ps").unwrap());
        let bw = Bandwidth(parse_bandwidth("25GB/s").unwrap());
        // 72 bytes at 25 GB/s = 2.88 ns
        assert_eq!(2880, bw.transfer_time(72));
        assert_eq!(72_000, Bandwidth::gb_per_sec(1).transfer_time(72));
    }

    #[test]
    fn quantities_deserialize_from_int_or_text() {
        #[derive(Deserialize)]
        struct Section {
            size: Bytes,
            clock: Frequency,
        }
        let section: Section = toml::from_str("size = \"4KB\"\nclock = 1000000000").unwrap();
        assert_eq!(Bytes::kib(4), section.size);
        assert_eq!(1000, section.clock.period());
        assert!(toml::from_str::<Section>("size = \"lots\"\nclock = 1").is_err());
    }
}
