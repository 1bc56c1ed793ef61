use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// MSI permission a cache holds on a resident line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineState {
    Invalid,
    Shared,
    Modified,
}

impl LineState {
    pub fn short(self) -> &'static str {
        match self {
            LineState::Invalid => "I",
            LineState::Shared => "S",
            LineState::Modified => "M",
        }
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    #[default]
    Lru,
    Mru,
    Random,
    Fifo,
}

impl FromStr for ReplacementPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "mru" => Ok(Self::Mru),
            "random" => Ok(Self::Random),
            "fifo" => Ok(Self::Fifo),
            _ => Err(format!(
                "unsupported replacement policy '{}', expected one of: lru, mru, random, fifo",
                value
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheLine<M> {
    pub addr: u64,
    pub state: LineState,
    pub dirty: bool,
    pub data: Vec<u8>,
    pub meta: M,
    last_access: u64,
    inserted: u64,
}

impl<M: Default> CacheLine<M> {
    pub fn new(addr: u64, state: LineState, data: Vec<u8>) -> Self {
        Self {
            addr,
            state,
            dirty: false,
            data,
            meta: M::default(),
            last_access: 0,
            inserted: 0,
        }
    }
}

impl<M> CacheLine<M> {
    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn read_word(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    pub fn write_word(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }
}

#[derive(Debug)]
pub enum InsertOutcome<M> {
    Installed,
    /// The line went in and pushed out this victim.
    Evicted(CacheLine<M>),
    /// Every way of the set is busy; the line is handed back uninstalled.
    Bypassed(CacheLine<M>),
}

/// Set-associative line storage.  Holds state and data; coherence decisions belong to the owning
/// controller.
#[derive(Debug)]
pub struct CacheArray<M> {
    line_size: u64,
    ways: usize,
    sets: Vec<Vec<CacheLine<M>>>,
    policy: ReplacementPolicy,
    stamp: u64,
    rng: StdRng,
}

impl<M> CacheArray<M> {
    pub fn new(num_sets: usize, ways: usize, line_size: u64, policy: ReplacementPolicy, seed: u64) -> Self {
        let num_sets = num_sets.max(1);
        let ways = ways.max(1);
        Self {
            line_size,
            ways,
            sets: (0..num_sets).map(|_| Vec::with_capacity(ways)).collect(),
            policy,
            stamp: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    pub fn line_addr(&self, addr: u64) -> u64 {
        addr - addr % self.line_size
    }

    pub fn set_index(&self, addr: u64) -> usize {
        ((addr / self.line_size) % self.sets.len() as u64) as usize
    }

    pub fn len(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.get(addr).is_some()
    }

    pub fn get(&self, addr: u64) -> Option<&CacheLine<M>> {
        let line = self.line_addr(addr);
        self.sets[self.set_index(line)].iter().find(|l| l.addr == line)
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut CacheLine<M>> {
        let line = self.line_addr(addr);
        let set = self.set_index(line);
        self.sets[set].iter_mut().find(|l| l.addr == line)
    }

    /// Look a line up and mark it as most recently used.
    pub fn access(&mut self, addr: u64) -> Option<&mut CacheLine<M>> {
        self.stamp += 1;
        let stamp = self.stamp;
        let line = self.get_mut(addr)?;
        line.last_access = stamp;
        Some(line)
    }

    pub fn remove(&mut self, addr: u64) -> Option<CacheLine<M>> {
        let line = self.line_addr(addr);
        let set = self.set_index(line);
        let pos = self.sets[set].iter().position(|l| l.addr == line)?;
        Some(self.sets[set].swap_remove(pos))
    }

    /// Whether `addr` could be installed right now, either into a free way or over a victim
    /// that `busy` does not protect.
    pub fn can_install(&self, addr: u64, busy: impl Fn(u64) -> bool) -> bool {
        let set = &self.sets[self.set_index(addr)];
        set.len() < self.ways || set.iter().any(|l| !busy(l.addr))
    }

    /// Install `line`, evicting a non-busy victim chosen by the replacement policy if the set is
    /// full.  A line already resident under the same tag is replaced in place.
    pub fn insert(&mut self, mut line: CacheLine<M>, busy: impl Fn(u64) -> bool) -> InsertOutcome<M> {
        line.addr = self.line_addr(line.addr);
        self.stamp += 1;
        line.last_access = self.stamp;
        line.inserted = self.stamp;
        let set_idx = self.set_index(line.addr);

        if let Some(pos) = self.sets[set_idx].iter().position(|l| l.addr == line.addr) {
            let old = std::mem::replace(&mut self.sets[set_idx][pos], line);
            return InsertOutcome::Evicted(old);
        }
        if self.sets[set_idx].len() < self.ways {
            self.sets[set_idx].push(line);
            return InsertOutcome::Installed;
        }

        let candidates: Vec<usize> = self.sets[set_idx]
            .iter()
            .enumerate()
            .filter(|(_, l)| !busy(l.addr))
            .map(|(way, _)| way)
            .collect();
        if candidates.is_empty() {
            return InsertOutcome::Bypassed(line);
        }
        let set = &self.sets[set_idx];
        let way = match self.policy {
            ReplacementPolicy::Lru => candidates.iter().copied().min_by_key(|&w| set[w].last_access),
            ReplacementPolicy::Mru => candidates.iter().copied().max_by_key(|&w| set[w].last_access),
            ReplacementPolicy::Fifo => candidates.iter().copied().min_by_key(|&w| set[w].inserted),
            ReplacementPolicy::Random => Some(candidates[self.rng.gen_range(0..candidates.len())]),
        };
        match way {
            Some(way) => InsertOutcome::Evicted(std::mem::replace(&mut self.sets[set_idx][way], line)),
            None => InsertOutcome::Bypassed(line),
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &CacheLine<M>> {
        self.sets.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(addr: u64) -> CacheLine<()> {
        CacheLine::new(addr, LineState::Shared, vec![0; 64])
    }

    fn array(policy: ReplacementPolicy) -> CacheArray<()> {
        // one set, two ways
        CacheArray::new(1, 2, 64, policy, 7)
    }

    fn evicted(outcome: InsertOutcome<()>) -> Option<u64> {
        match outcome {
            InsertOutcome::Evicted(victim) => Some(victim.addr),
            _ => None,
        }
    }

    #[test]
    fn lru_evicts_least_recently_touched() {
        let mut cache = array(ReplacementPolicy::Lru);
        cache.insert(line(0), |_| false);
        cache.insert(line(64), |_| false);
        cache.access(0);
        assert_eq!(Some(64), evicted(cache.insert(line(128), |_| false)));
        assert!(cache.contains(0));
        assert!(cache.contains(130));
    }

    #[test]
    fn mru_and_fifo_pick_differently() {
        let mut mru = array(ReplacementPolicy::Mru);
        let mut fifo = array(ReplacementPolicy::Fifo);
        for cache in [&mut mru, &mut fifo] {
            cache.insert(line(0), |_| false);
            cache.insert(line(64), |_| false);
            cache.access(0);
        }
        assert_eq!(Some(0), evicted(mru.insert(line(128), |_| false)));
        assert_eq!(Some(0), evicted(fifo.insert(line(128), |_| false)));
        assert!(fifo.contains(64));
    }

    #[test]
    fn busy_lines_are_never_victims() {
        let mut cache = array(ReplacementPolicy::Lru);
        cache.insert(line(0), |_| false);
        cache.insert(line(64), |_| false);
        assert_eq!(Some(64), evicted(cache.insert(line(128), |addr| addr == 0)));
        let outcome = cache.insert(line(192), |_| true);
        assert!(matches!(outcome, InsertOutcome::Bypassed(l) if l.addr == 192));
        assert!(!cache.can_install(256, |_| true));
        assert_eq!(2, cache.len());
    }

    #[test]
    fn set_index_uses_line_number() {
        let cache: CacheArray<()> = CacheArray::new(4, 1, 64, ReplacementPolicy::Lru, 0);
        assert_eq!(0, cache.set_index(0));
        assert_eq!(1, cache.set_index(64));
        assert_eq!(0, cache.set_index(256));
        assert_eq!(128, cache.line_addr(130));
    }

    #[test]
    fn words_are_little_endian() {
        let mut l = line(0);
        l.write_word(8, 0x0102_0304);
        assert_eq!(0x0102_0304, l.read_word(8));
        assert_eq!(4, l.data[8]);
        assert!(l.dirty);
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!(Ok(ReplacementPolicy::Random), "random".parse());
        assert!("plru".parse::<ReplacementPolicy>().is_err());
    }
}
