use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::Serialize;

use crate::timeq::Cycle;

/// Passive statistics hook.  Recording must never feed back into simulated state.
pub trait StatSink {
    fn record(&mut self, name: &str, value: u64);

    fn incr(&mut self, name: &str) {
        self.record(name, 1);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl Stat {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    fn push(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count = self.count.saturating_add(1);
        self.sum = self.sum.saturating_add(value);
    }
}

impl AddAssign for Stat {
    fn add_assign(&mut self, rhs: Self) {
        if rhs.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = rhs;
            return;
        }
        self.count = self.count.saturating_add(rhs.count);
        self.sum = self.sum.saturating_add(rhs.sum);
        self.min = self.min.min(rhs.min);
        self.max = self.max.max(rhs.max);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct StatSet {
    stats: BTreeMap<String, Stat>,
}

impl StatSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Stat> {
        self.stats.get(name)
    }

    /// Number of samples recorded under `name`; for event counters this is the event count.
    pub fn count(&self, name: &str) -> u64 {
        self.stats.get(name).map_or(0, |stat| stat.count)
    }

    pub fn sum(&self, name: &str) -> u64 {
        self.stats.get(name).map_or(0, |stat| stat.sum)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Stat)> {
        self.stats.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

impl StatSink for StatSet {
    fn record(&mut self, name: &str, value: u64) {
        match self.stats.get_mut(name) {
            Some(stat) => stat.push(value),
            None => {
                let mut stat = Stat::default();
                stat.push(value);
                self.stats.insert(name.to_string(), stat);
            }
        }
    }
}

impl AddAssign<&StatSet> for StatSet {
    fn add_assign(&mut self, rhs: &StatSet) {
        for (name, stat) in rhs.iter() {
            *self.stats.entry(name.clone()).or_default() += *stat;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub end_time_ps: Cycle,
    pub events: u64,
    pub components: BTreeMap<String, StatSet>,
}

impl RunSummary {
    /// Sum of one statistic across every component whose name starts with `prefix`.
    pub fn total(&self, prefix: &str, stat: &str) -> u64 {
        self.components
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, set)| set.count(stat))
            .sum()
    }
}
