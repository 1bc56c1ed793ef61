use std::collections::BTreeMap;
use std::fmt;

use crate::memory::config::BackendConfig;
use crate::timeq::{Cycle, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// `max_requests_per_cycle` already issued this cycle.
    IssueLimit,
    /// The target device already holds `queue_depth` requests.
    QueueFull,
    TagsExhausted,
    /// The link's crossbar already holds `xbar_depth` requests.
    XbarFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    pub reason: RejectReason,
    pub retry_at: Cycle,
}

/// Where a request lands inside the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub device: usize,
    pub link: usize,
    pub vault: usize,
    pub bank: usize,
}

#[derive(Debug)]
struct Inflight<T> {
    loc: Location,
    ticket: Ticket,
    payload: T,
}

/// Timing model of an HMC-like stacked memory: devices of vaults of banks behind a few links.
/// Storage lives elsewhere; this only decides when requests are accepted and completed.
#[derive(Debug)]
pub struct StackedBackend<T> {
    config: BackendConfig,
    period: Cycle,
    device_outstanding: Vec<usize>,
    xbar_outstanding: Vec<usize>,
    tags_in_use: usize,
    bank_busy: Vec<Cycle>,
    cycle: Cycle,
    issued_this_cycle: usize,
    inflight: BTreeMap<(Cycle, u64), Inflight<T>>,
    seq: u64,
    accepted: u64,
    completed: u64,
    reads: u64,
    writes: u64,
    peak_outstanding: usize,
}

impl<T> StackedBackend<T> {
    pub fn new(config: &BackendConfig) -> Self {
        let devices = config.device_count as usize;
        Self {
            config: config.clone(),
            period: config.clock.period(),
            device_outstanding: vec![0; devices],
            xbar_outstanding: vec![0; devices * config.link_count as usize],
            tags_in_use: 0,
            bank_busy: vec![0; devices * (config.dram_count * config.bank_count) as usize],
            cycle: 0,
            issued_this_cycle: 0,
            inflight: BTreeMap::new(),
            seq: 0,
            accepted: 0,
            completed: 0,
            reads: 0,
            writes: 0,
            peak_outstanding: 0,
        }
    }

    pub fn locate(&self, addr: u64) -> Location {
        let c = &self.config;
        let block = addr / c.max_req_size.0.max(1);
        let local = block / c.device_count;
        Location {
            device: (block % c.device_count) as usize,
            link: (local % c.link_count) as usize,
            vault: (local % c.dram_count) as usize,
            bank: ((local / c.dram_count) % c.bank_count) as usize,
        }
    }

    fn bank_index(&self, loc: &Location) -> usize {
        let per_device = (self.config.dram_count * self.config.bank_count) as usize;
        loc.device * per_device + loc.vault * self.config.bank_count as usize + loc.bank
    }

    fn xbar_index(&self, loc: &Location) -> usize {
        loc.device * self.config.link_count as usize + loc.link
    }

    fn retry_when_something_completes(&self, now: Cycle) -> Cycle {
        self.next_completion().unwrap_or(now + self.period).max(now)
    }

    /// Try to accept a request of `size` bytes.  Rejections carry the earliest time a retry can
    /// succeed.
    pub fn issue(&mut self, now: Cycle, addr: u64, write: bool, size: u32, payload: T) -> Result<Ticket, Reject> {
        debug_assert!(size as u64 <= self.config.max_req_size.0);
        let cycle = now / self.period;
        if cycle != self.cycle {
            self.cycle = cycle;
            self.issued_this_cycle = 0;
        }
        let limit = self.config.max_requests_per_cycle;
        if limit > 0 && self.issued_this_cycle >= limit {
            return Err(Reject {
                reason: RejectReason::IssueLimit,
                retry_at: (cycle + 1) * self.period,
            });
        }

        let loc = self.locate(addr);
        let reason = if self.device_outstanding[loc.device] >= self.config.queue_depth {
            Some(RejectReason::QueueFull)
        } else if self.tags_in_use >= self.config.tag_count {
            Some(RejectReason::TagsExhausted)
        } else if self.xbar_outstanding[self.xbar_index(&loc)] >= self.config.xbar_depth {
            Some(RejectReason::XbarFull)
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(Reject {
                reason,
                retry_at: self.retry_when_something_completes(now),
            });
        }

        let bank = self.bank_index(&loc);
        let dram = self.config.dram_latency * self.period;
        let start = (now + self.period).max(self.bank_busy[bank]);
        self.bank_busy[bank] = start + dram;
        let ready_at = start + dram + self.config.access_time.0;
        let ticket = Ticket::new(now, ready_at, size);

        self.issued_this_cycle += 1;
        self.device_outstanding[loc.device] += 1;
        let xbar = self.xbar_index(&loc);
        self.xbar_outstanding[xbar] += 1;
        self.tags_in_use += 1;
        self.accepted += 1;
        if write {
            self.writes += 1;
        } else {
            self.reads += 1;
        }
        self.seq += 1;
        self.inflight.insert(
            (ready_at, self.seq),
            Inflight {
                loc,
                ticket,
                payload,
            },
        );
        self.peak_outstanding = self.peak_outstanding.max(self.inflight.len());
        Ok(ticket)
    }

    /// Hand every request finished by `now` to `f`, earliest first.
    pub fn drain_completed<F>(&mut self, now: Cycle, mut f: F)
    where
        F: FnMut(T, Ticket),
    {
        while let Some(entry) = self.inflight.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let done = entry.remove();
            self.device_outstanding[done.loc.device] -= 1;
            let xbar = self.xbar_index(&done.loc);
            self.xbar_outstanding[xbar] -= 1;
            self.tags_in_use -= 1;
            self.completed += 1;
            f(done.payload, done.ticket);
        }
    }

    pub fn next_completion(&self) -> Option<Cycle> {
        self.inflight.keys().next().map(|(at, _)| *at)
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn peak_outstanding(&self) -> usize {
        self.peak_outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(f: impl FnOnce(&mut BackendConfig)) -> StackedBackend<u32> {
        let mut config = BackendConfig::default();
        f(&mut config);
        StackedBackend::new(&config)
    }

    #[test]
    fn address_map_interleaves_links_and_vaults() {
        let b = backend(|_| {});
        let loc = b.locate(64 * 21);
        assert_eq!((0, 1, 1, 1), (loc.device, loc.link, loc.vault, loc.bank));
        let b = backend(|c| c.device_count = 2);
        assert_eq!(1, b.locate(64).device);
        assert_eq!(0, b.locate(128).device);
    }

    #[test]
    fn one_request_per_bank_at_a_time() {
        let mut b = backend(|_| {});
        let first = b.issue(0, 0, false, 64, 1).unwrap();
        // 1ns crossbar cycle, 30 bank cycles, 2ns access
        assert_eq!(1_000 + 30_000 + 2_000, first.ready_at());
        // same bank: waits for the bank, not for the access time
        let second = b.issue(0, 64 * 20 * 16, false, 64, 2).unwrap();
        assert_eq!(31_000 + 30_000 + 2_000, second.ready_at());
        // another vault starts right away
        let other = b.issue(0, 64, false, 64, 3).unwrap();
        assert_eq!(first.ready_at(), other.ready_at());
    }

    #[test]
    fn issue_limit_resets_each_cycle() {
        let mut b = backend(|c| c.max_requests_per_cycle = 2);
        b.issue(0, 0, false, 64, 0).unwrap();
        b.issue(0, 64, false, 64, 0).unwrap();
        let reject = b.issue(500, 128, false, 64, 0).unwrap_err();
        assert_eq!(RejectReason::IssueLimit, reject.reason);
        assert_eq!(1_000, reject.retry_at);
        assert!(b.issue(1_000, 128, false, 64, 0).is_ok());
    }

    #[test]
    fn tags_and_crossbar_bound_outstanding_work() {
        let mut b = backend(|c| {
            c.tag_count = 2;
            c.max_requests_per_cycle = 0;
        });
        b.issue(0, 0, false, 64, 0).unwrap();
        b.issue(0, 64, false, 64, 0).unwrap();
        assert_eq!(RejectReason::TagsExhausted, b.issue(0, 128, false, 64, 0).unwrap_err().reason);

        let mut b = backend(|c| {
            c.xbar_depth = 1;
            c.max_requests_per_cycle = 0;
        });
        b.issue(0, 0, false, 64, 0).unwrap();
        let reject = b.issue(0, 64 * 4, false, 64, 0).unwrap_err();
        assert_eq!(RejectReason::XbarFull, reject.reason);
        assert_eq!(b.next_completion(), Some(reject.retry_at));
    }

    #[test]
    fn queue_depth_bounds_outstanding_and_nothing_is_dropped() {
        let mut b = backend(|c| c.max_requests_per_cycle = 0);
        let mut accepted = Vec::new();
        let mut first_reject = None;
        for i in 0..128u32 {
            match b.issue(0, i as u64 * 64, i % 2 == 0, 64, i) {
                Ok(_) => accepted.push(i),
                Err(reject) => {
                    first_reject.get_or_insert((i, reject.reason));
                }
            }
        }
        assert_eq!((0..64).collect::<Vec<_>>(), accepted);
        assert_eq!(Some((64, RejectReason::QueueFull)), first_reject);
        assert_eq!(64, b.peak_outstanding());

        let mut done = Vec::new();
        b.drain_completed(Cycle::MAX, |id, _| done.push(id));
        done.sort_unstable();
        assert_eq!(accepted, done);
        assert_eq!(b.accepted(), b.completed());
        assert_eq!(0, b.outstanding());
    }
}
