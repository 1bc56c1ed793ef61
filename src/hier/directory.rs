use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use anyhow::{anyhow, bail};
use log::{debug, warn};
use smallvec::SmallVec;

use crate::base::{Component, ComponentId, Ctx, Event, Payload, PortId, ProtocolViolation};
use crate::hier::config::DirectoryConfig;
use crate::hier::message::{CohKind, CoherenceMessage, Grant, MessageIds};
use crate::memory::{MemRequest, MemResponse};
use crate::sim::stats::{StatSet, StatSink};
use crate::timeq::Cycle;

pub const NET_PORT: PortId = 0;
pub const MEM_PORT: PortId = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DirState {
    #[default]
    Unowned,
    Shared,
    Exclusive,
}

impl fmt::Display for DirState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DirState::Unowned => "U",
            DirState::Shared => "S",
            DirState::Exclusive => "E",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub state: DirState,
    pub sharers: SmallVec<[ComponentId; 4]>,
    pub owner: Option<ComponentId>,
}

/// LRU set of line addresses whose directory entries are on chip.  The directory state itself is
/// never lost; missing here only costs latency.
#[derive(Debug)]
struct EntryCache {
    capacity: usize,
    stamps: HashMap<u64, u64>,
    order: BTreeMap<u64, u64>,
    clock: u64,
}

impl EntryCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stamps: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Mark `line` most recently used; returns whether it was already cached.
    fn touch(&mut self, line: u64) -> bool {
        self.clock += 1;
        let hit = match self.stamps.insert(line, self.clock) {
            Some(old) => {
                self.order.remove(&old);
                true
            }
            None => false,
        };
        self.order.insert(self.clock, line);
        while self.stamps.len() > self.capacity {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            self.stamps.remove(&victim);
        }
        hit
    }
}

/// A Get being resolved.  It completes once memory (if asked) and every child have answered.
#[derive(Debug)]
struct Txn {
    req: CoherenceMessage,
    issued_at: Cycle,
    awaiting_mem: bool,
    pending: u32,
    data: Option<Vec<u8>>,
    /// Owner asked to drop to Shared by a FwdGetS.
    downgrade: Option<ComponentId>,
}

/// Home node for `[addr_range_start, addr_range_end]`: tracks every line's sharers and owner,
/// blocks per line while a Get is in flight and serves data from memory.
#[derive(Debug)]
pub struct DirectoryController {
    name: String,
    id: ComponentId,
    config: DirectoryConfig,
    entries: HashMap<u64, DirEntry>,
    cache: EntryCache,
    busy: HashMap<u64, Txn>,
    waiting: HashMap<u64, VecDeque<CoherenceMessage>>,
    ids: MessageIds,
    mem_ids: u64,
    to_net: Vec<CoherenceMessage>,
    to_mem: Vec<MemRequest>,
    stats: StatSet,
}

impl DirectoryController {
    pub fn new(name: impl Into<String>, id: ComponentId, config: &DirectoryConfig) -> Self {
        Self {
            name: name.into(),
            id,
            config: config.clone(),
            entries: HashMap::new(),
            cache: EntryCache::new(config.entry_cache_size),
            busy: HashMap::new(),
            waiting: HashMap::new(),
            ids: MessageIds::new(id),
            mem_ids: 0,
            to_net: Vec::new(),
            to_mem: Vec::new(),
            stats: StatSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &StatSet {
        &self.stats
    }

    pub fn entry(&self, addr: u64) -> Option<&DirEntry> {
        self.entries.get(&self.line_addr(addr))
    }

    /// Directory entries currently held in the on-chip entry cache.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn is_idle(&self) -> bool {
        self.busy.is_empty() && self.waiting.values().all(VecDeque::is_empty)
    }

    pub fn take_net_messages(&mut self) -> Vec<CoherenceMessage> {
        std::mem::take(&mut self.to_net)
    }

    pub fn take_mem_requests(&mut self) -> Vec<MemRequest> {
        std::mem::take(&mut self.to_mem)
    }

    fn line_addr(&self, addr: u64) -> u64 {
        let line = self.config.cache_line_size.0.max(1);
        addr - addr % line
    }

    fn violation(&self, addr: u64, message: impl Into<String>) -> anyhow::Error {
        let state = match self.busy.contains_key(&addr) {
            true => "busy".to_string(),
            false => self.entries.get(&addr).map_or(DirState::Unowned, |e| e.state).to_string(),
        };
        ProtocolViolation::new(self.name.clone(), addr, state, message).into()
    }

    /// Touch the entry cache for `addr`; returns the extra latency a miss costs.
    pub fn lookup_latency(&mut self, addr: u64) -> u64 {
        let line = self.line_addr(addr);
        if self.cache.touch(line) {
            self.stats.incr("entry_cache_hits");
            0
        } else {
            self.stats.incr("entry_cache_misses");
            self.config.clock.cycles(self.config.entry_miss_latency_cycles)
        }
    }

    fn send(&mut self, kind: CohKind, dst: ComponentId, addr: u64) -> &mut CoherenceMessage {
        let mut msg = CoherenceMessage::new(kind, self.id, dst, addr);
        msg.id = self.ids.next();
        self.stats.incr(&format!("eventSent_{}", kind));
        self.to_net.push(msg);
        let last = self.to_net.len() - 1;
        &mut self.to_net[last]
    }

    fn mem(&mut self, addr: u64, data: Option<Vec<u8>>) {
        self.mem_ids += 1;
        let write = data.is_some();
        self.stats.incr(if write { "mem_writes" } else { "mem_reads" });
        self.to_mem.push(MemRequest {
            id: self.mem_ids,
            addr,
            write,
            size: self.config.cache_line_size.0 as u32,
            data,
            src: self.id,
        });
    }

    fn check_range(&self, addr: u64) -> anyhow::Result<()> {
        if self.config.covers(addr) {
            Ok(())
        } else {
            Err(self.violation(addr, "address outside the directory's range"))
        }
    }

    /// A GetS/GetM, after the directory access latency.
    pub fn handle_request(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line = self.line_addr(msg.addr);
        self.check_range(line)?;
        if self.busy.contains_key(&line) {
            self.stats.incr("blocked");
            self.waiting.entry(line).or_default().push_back(msg);
            return Ok(());
        }
        self.start(msg, now)
    }

    fn start(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line = self.line_addr(msg.addr);
        self.stats.incr(&format!("recv_{}", msg.kind));
        let entry = self.entries.entry(line).or_default().clone();
        let requester = msg.src;
        let mut txn = Txn {
            req: msg,
            issued_at: now,
            awaiting_mem: false,
            pending: 0,
            data: None,
            downgrade: None,
        };

        match (txn.req.kind, entry.state) {
            (_, DirState::Exclusive) if entry.owner == Some(requester) => {
                return Err(self.violation(line, format!("{} from the owner", txn.req.kind)));
            }
            (CohKind::GetS, DirState::Exclusive) => {
                let owner = entry
                    .owner
                    .ok_or_else(|| anyhow!("{}: exclusive {:#x} without an owner", self.name, line))?;
                self.send(CohKind::FwdGetS, owner, line);
                self.stats.incr("fwd_GetS");
                txn.pending = 1;
                txn.downgrade = Some(owner);
            }
            (CohKind::GetM, DirState::Exclusive) => {
                let owner = entry
                    .owner
                    .ok_or_else(|| anyhow!("{}: exclusive {:#x} without an owner", self.name, line))?;
                self.send(CohKind::FwdGetM, owner, line);
                self.stats.incr("fwd_GetM");
                if let Some(e) = self.entries.get_mut(&line) {
                    e.owner = None;
                }
                txn.pending = 1;
            }
            (CohKind::GetM, _) => {
                let others: SmallVec<[ComponentId; 4]> =
                    entry.sharers.iter().copied().filter(|s| *s != requester).collect();
                for sharer in others.iter().copied() {
                    self.send(CohKind::Inv, sharer, line);
                    self.stats.incr("inv_sent");
                }
                if let Some(e) = self.entries.get_mut(&line) {
                    e.sharers.retain(|s| *s == requester);
                }
                txn.pending = others.len() as u32;
                txn.awaiting_mem = true;
                self.mem(line, None);
            }
            (CohKind::GetS, _) => {
                txn.awaiting_mem = true;
                self.mem(line, None);
            }
            (kind, _) => return Err(self.violation(line, format!("{} is not a request", kind))),
        }
        self.busy.insert(line, txn);
        Ok(())
    }

    /// Puts are applied on arrival and always acknowledged.
    pub fn handle_put(&mut self, msg: CoherenceMessage) -> anyhow::Result<()> {
        let line = self.line_addr(msg.addr);
        self.check_range(line)?;
        self.stats.incr(&format!("recv_{}", msg.kind));
        let entry = self.entries.entry(line).or_default();
        let mut writeback = None;
        let stale = match msg.kind {
            CohKind::PutM if entry.owner == Some(msg.src) => {
                entry.owner = None;
                entry.state = DirState::Unowned;
                writeback = msg.data;
                false
            }
            CohKind::PutS if entry.sharers.contains(&msg.src) => {
                entry.sharers.retain(|s| *s != msg.src);
                if entry.sharers.is_empty() && entry.state == DirState::Shared {
                    entry.state = DirState::Unowned;
                }
                false
            }
            _ => true,
        };
        if stale {
            self.stats.incr("stale_puts");
        }
        if let Some(data) = writeback {
            self.mem(line, Some(data));
        }
        self.send(CohKind::Ack, msg.src, line);
        Ok(())
    }

    /// Data or Ack from a child answering an Inv or forward.
    pub fn handle_response(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line = self.line_addr(msg.addr);
        self.stats.incr(&format!("recv_{}", msg.kind));
        let Some(txn) = self.busy.get_mut(&line).filter(|t| t.pending > 0) else {
            return Err(self.violation(line, format!("unexpected {} from {}", msg.kind, msg.src)));
        };
        txn.pending -= 1;
        if msg.kind == CohKind::Data {
            txn.data = msg.data;
        }
        self.try_finish(line, now)
    }

    pub fn handle_mem_response(&mut self, resp: MemResponse, now: Cycle) -> anyhow::Result<()> {
        if resp.write {
            return Ok(());
        }
        let line = self.line_addr(resp.addr);
        let Some(txn) = self.busy.get_mut(&line).filter(|t| t.awaiting_mem) else {
            warn!("{}: memory data for {:#x} nobody is waiting on", self.name, line);
            return Ok(());
        };
        txn.awaiting_mem = false;
        if txn.data.is_none() {
            txn.data = resp.data;
        }
        self.try_finish(line, now)
    }

    fn try_finish(&mut self, line: u64, now: Cycle) -> anyhow::Result<()> {
        if self
            .busy
            .get(&line)
            .map_or(true, |txn| txn.awaiting_mem || txn.pending > 0)
        {
            return Ok(());
        }
        let Some(txn) = self.busy.remove(&line) else {
            return Ok(());
        };
        let data = txn
            .data
            .unwrap_or_else(|| vec![0; self.config.cache_line_size.0 as usize]);
        let requester = txn.req.src;
        let entry = self.entries.entry(line).or_default();
        let grant = match txn.req.kind {
            CohKind::GetS => {
                if txn.downgrade.is_some() && entry.owner == txn.downgrade {
                    entry.owner = None;
                    if let Some(old) = txn.downgrade {
                        entry.sharers.push(old);
                    }
                }
                if !entry.sharers.contains(&requester) {
                    entry.sharers.push(requester);
                }
                entry.state = DirState::Shared;
                Grant::Shared
            }
            _ => {
                entry.sharers.clear();
                entry.owner = Some(requester);
                entry.state = DirState::Exclusive;
                Grant::Modified
            }
        };
        if txn.downgrade.is_some() {
            self.mem(line, Some(data.clone()));
        }
        self.stats
            .record(&format!("latency_{}", txn.req.kind), now.saturating_sub(txn.issued_at));
        let reply = self.send(CohKind::Data, requester, line);
        reply.grant = Some(grant);
        reply.data = Some(data);

        let next = self.waiting.get_mut(&line).and_then(VecDeque::pop_front);
        if self.waiting.get(&line).is_some_and(VecDeque::is_empty) {
            self.waiting.remove(&line);
        }
        if let Some(next) = next {
            self.start(next, now)?;
        }
        Ok(())
    }
}

const ARRIVAL_TOKEN_BASE: u64 = 1;

pub struct Directory {
    ctrl: DirectoryController,
    access_latency: Cycle,
    arriving: HashMap<u64, CoherenceMessage>,
    next_token: u64,
}

impl Directory {
    pub fn new(name: impl Into<String>, id: ComponentId, config: &DirectoryConfig) -> Self {
        Self {
            ctrl: DirectoryController::new(name, id, config),
            access_latency: config.clock.cycles(config.access_latency_cycles),
            arriving: HashMap::new(),
            next_token: ARRIVAL_TOKEN_BASE,
        }
    }

    pub fn controller(&self) -> &DirectoryController {
        &self.ctrl
    }

    fn flush(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        for msg in self.ctrl.take_net_messages() {
            debug!("{} @{}: send {}", self.ctrl.name(), ctx.now(), msg);
            ctx.send(NET_PORT, Payload::Coh(msg))?;
        }
        for req in self.ctrl.take_mem_requests() {
            ctx.send(MEM_PORT, Payload::MemReq(req))?;
        }
        Ok(())
    }
}

impl Component for Directory {
    fn name(&self) -> &str {
        self.ctrl.name()
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Link {
                port: NET_PORT,
                payload: Payload::Coh(msg),
            } => {
                debug!("{} @{}: recv {}", self.ctrl.name(), ctx.now(), msg);
                match msg.kind {
                    kind if kind.is_get() => {
                        let delay = self.access_latency + self.ctrl.lookup_latency(msg.addr);
                        let token = self.next_token;
                        self.next_token += 1;
                        self.arriving.insert(token, msg);
                        ctx.schedule(delay, token);
                        return Ok(());
                    }
                    kind if kind.is_put() => {
                        self.ctrl.lookup_latency(msg.addr);
                        self.ctrl.handle_put(msg)?;
                    }
                    _ => self.ctrl.handle_response(msg, ctx.now())?,
                }
            }
            Event::Link {
                port: MEM_PORT,
                payload: Payload::MemResp(resp),
            } => self.ctrl.handle_mem_response(resp, ctx.now())?,
            Event::Timer(token) => {
                let msg = self
                    .arriving
                    .remove(&token)
                    .ok_or_else(|| anyhow!("{}: unknown timer {}", self.ctrl.name(), token))?;
                self.ctrl.handle_request(msg, ctx.now())?;
            }
            Event::Link { port, payload } => {
                bail!("{}: unexpected {} on port {}", self.ctrl.name(), payload.kind(), port)
            }
        }
        self.flush(ctx)
    }

    fn stats(&self) -> &StatSet {
        self.ctrl.stats()
    }

    fn is_quiescent(&self) -> bool {
        self.arriving.is_empty() && self.ctrl.is_idle()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: ComponentId = 0;
    const A: ComponentId = 5;
    const B: ComponentId = 6;

    fn dir(entry_cache_size: usize) -> DirectoryController {
        let config = DirectoryConfig {
            entry_cache_size,
            addr_range_end: 0xFFFF,
            ..DirectoryConfig::default()
        };
        DirectoryController::new("dir", DIR, &config)
    }

    fn req(kind: CohKind, src: ComponentId, addr: u64) -> CoherenceMessage {
        CoherenceMessage::new(kind, src, DIR, addr)
    }

    fn mem_data(addr: u64, byte: u8) -> MemResponse {
        MemResponse {
            id: 0,
            addr,
            write: false,
            data: Some(vec![byte; 64]),
        }
    }

    fn sent(d: &mut DirectoryController) -> Vec<(CohKind, ComponentId)> {
        d.take_net_messages().into_iter().map(|m| (m.kind, m.dst)).collect()
    }

    #[test]
    fn gets_reads_memory_then_grants_shared() {
        let mut d = dir(16);
        d.handle_request(req(CohKind::GetS, A, 0x40), 0).unwrap();
        let reads = d.take_mem_requests();
        assert_eq!(1, reads.len());
        assert!(!reads[0].write);
        d.handle_mem_response(mem_data(0x40, 7), 100).unwrap();
        let grant = d.take_net_messages();
        assert_eq!(Some(Grant::Shared), grant[0].grant);
        assert_eq!(7, grant[0].data.as_ref().unwrap()[0]);
        assert_eq!(DirState::Shared, d.entry(0x40).unwrap().state);
        assert!(d.is_idle());
    }

    #[test]
    fn gets_to_exclusive_line_forwards_and_writes_back() {
        let mut d = dir(16);
        d.handle_request(req(CohKind::GetM, A, 0x0), 0).unwrap();
        d.handle_mem_response(mem_data(0x0, 0), 10).unwrap();
        d.take_net_messages();
        d.take_mem_requests();
        assert_eq!(Some(A), d.entry(0x0).unwrap().owner);

        d.handle_request(req(CohKind::GetS, B, 0x0), 20).unwrap();
        assert_eq!(vec![(CohKind::FwdGetS, A)], sent(&mut d));
        let reply = CoherenceMessage::new(CohKind::Data, A, DIR, 0x0).with_data(vec![3; 64], true);
        d.handle_response(reply, 30).unwrap();
        assert_eq!(vec![(CohKind::Data, B)], sent(&mut d));
        let writes = d.take_mem_requests();
        assert!(writes[0].write);
        assert_eq!(Some(vec![3; 64]), writes[0].data);
        let entry = d.entry(0x0).unwrap();
        assert_eq!(DirState::Shared, entry.state);
        assert_eq!(None, entry.owner);
        assert!(entry.sharers.contains(&A) && entry.sharers.contains(&B));
    }

    #[test]
    fn getm_waits_for_invalidation_acks() {
        let mut d = dir(16);
        for src in [A, B] {
            d.handle_request(req(CohKind::GetS, src, 0x0), 0).unwrap();
            d.handle_mem_response(mem_data(0x0, 0), 1).unwrap();
        }
        d.take_net_messages();
        d.handle_request(req(CohKind::GetM, B, 0x0), 10).unwrap();
        assert_eq!(vec![(CohKind::Inv, A)], sent(&mut d));
        d.handle_mem_response(mem_data(0x0, 0), 20).unwrap();
        assert!(sent(&mut d).is_empty());
        d.handle_response(CoherenceMessage::new(CohKind::Ack, A, DIR, 0x0), 30).unwrap();
        let grant = d.take_net_messages();
        assert_eq!(Some(Grant::Modified), grant[0].grant);
        assert_eq!(Some(B), d.entry(0x0).unwrap().owner);
    }

    #[test]
    fn requests_to_a_busy_line_wait_their_turn() {
        let mut d = dir(16);
        d.handle_request(req(CohKind::GetS, A, 0x0), 0).unwrap();
        d.handle_request(req(CohKind::GetM, B, 0x0), 1).unwrap();
        assert_eq!(1, d.take_mem_requests().len());
        d.handle_mem_response(mem_data(0x0, 0), 5).unwrap();
        // A's grant goes out and B's GetM starts by invalidating A
        assert_eq!(vec![(CohKind::Data, A), (CohKind::Inv, A)], sent(&mut d));
        assert!(!d.is_idle());
    }

    #[test]
    fn put_from_owner_writes_memory_and_stale_put_is_acked() {
        let mut d = dir(16);
        d.handle_request(req(CohKind::GetM, A, 0x80), 0).unwrap();
        d.handle_mem_response(mem_data(0x80, 0), 1).unwrap();
        d.take_net_messages();
        d.take_mem_requests();

        d.handle_put(req(CohKind::PutM, B, 0x80)).unwrap();
        assert_eq!(vec![(CohKind::Ack, B)], sent(&mut d));
        assert!(d.take_mem_requests().is_empty());
        assert_eq!(1, d.stats().count("stale_puts"));

        d.handle_put(req(CohKind::PutM, A, 0x80).with_data(vec![1; 64], true)).unwrap();
        assert!(d.take_mem_requests()[0].write);
        assert_eq!(DirState::Unowned, d.entry(0x80).unwrap().state);
    }

    #[test]
    fn entry_cache_stays_within_capacity() {
        let mut d = dir(4);
        let miss = d.lookup_latency(0x0);
        assert!(miss > 0);
        for line in 0..32u64 {
            d.lookup_latency(line * 64);
            assert!(d.cached_entries() <= 4);
        }
        // the most recent lines hit, the oldest were dropped
        assert_eq!(0, d.lookup_latency(31 * 64));
        assert_eq!(miss, d.lookup_latency(0));
    }

    #[test]
    fn out_of_range_address_is_a_violation() {
        let mut d = dir(4);
        let err = d.handle_request(req(CohKind::GetS, A, 0x10_0000), 0).unwrap_err();
        assert!(err.downcast_ref::<ProtocolViolation>().is_some());
    }
}
