use std::any::Any;
use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail};
use log::{debug, trace, warn};
use smallvec::SmallVec;

use crate::base::{Component, ComponentId, Ctx, Event, Payload, PortId, ProtocolViolation};
use crate::hier::config::CacheConfig;
use crate::hier::line::{CacheArray, CacheLine, InsertOutcome, LineState};
use crate::hier::message::{CohKind, CoherenceMessage, Grant, MessageIds};
use crate::hier::mshr::MshrTable;
use crate::sim::stats::{StatSet, StatSink};
use crate::timeq::Cycle;

pub const PARENT_PORT: PortId = 0;
pub const CHILD_PORT: PortId = 1;

const ACCESS_TOKEN: u64 = 0;

/// Which children hold a line below this cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tracking {
    pub sharers: SmallVec<[ComponentId; 4]>,
    pub owner: Option<ComponentId>,
}

impl Tracking {
    pub fn holders(&self) -> SmallVec<[ComponentId; 4]> {
        let mut holders: SmallVec<[ComponentId; 4]> = self.owner.into_iter().collect();
        holders.extend(self.sharers.iter().copied());
        holders
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.sharers.is_empty()
    }

    fn add_sharer(&mut self, child: ComponentId) {
        if !self.sharers.contains(&child) {
            self.sharers.push(child);
        }
    }

    fn remove_sharer(&mut self, child: ComponentId) -> bool {
        let before = self.sharers.len();
        self.sharers.retain(|c| *c != child);
        before != self.sharers.len()
    }
}

/// A line that has left the array but still owes its parent an answer.
#[derive(Debug, Clone)]
struct Victim {
    state: LineState,
    dirty: bool,
    data: Vec<u8>,
}

impl Victim {
    fn from_line(line: CacheLine<Tracking>) -> Self {
        Self {
            state: line.state,
            dirty: line.dirty,
            data: line.data,
        }
    }
}

#[derive(Debug)]
enum Txn {
    /// Waiting for the parent's Data before `req` can be served.
    Fetch { req: CoherenceMessage },
    /// Waiting for children to answer invalidations/forwards issued for `req`.  `downgrade` is
    /// the owner asked to drop to Shared.
    Collect {
        req: CoherenceMessage,
        downgrade: Option<ComponentId>,
    },
    /// Evicted line: back-invalidating children, then (once `put_sent`) waiting for the put-ack.
    Evict { victim: Victim, put_sent: bool },
}

impl Txn {
    fn name(&self) -> &'static str {
        match self {
            Txn::Fetch { .. } => "Fetch",
            Txn::Collect { .. } => "Collect",
            Txn::Evict { put_sent: false, .. } => "EvictInv",
            Txn::Evict { put_sent: true, .. } => "EvictPut",
        }
    }
}

/// A snoop from the parent being resolved against the children.
#[derive(Debug)]
struct Snoop {
    kind: CohKind,
    pending: u32,
    /// The line's contents if the snoop took it out of the array.
    held: Option<Victim>,
    downgrade: Option<ComponentId>,
    /// Child requests for the line that arrived meanwhile.
    waiting: Vec<CoherenceMessage>,
}

/// Inclusive, blocking-per-line MSI cache that is home node for its children and an MSI child
/// of its own parent.
#[derive(Debug)]
pub struct InnerController {
    name: String,
    id: ComponentId,
    parent: ComponentId,
    array: CacheArray<Tracking>,
    mshr: MshrTable<Txn, CoherenceMessage>,
    snoops: HashMap<u64, Snoop>,
    deferred: HashMap<u64, CoherenceMessage>,
    stalled: VecDeque<CoherenceMessage>,
    parked: VecDeque<CoherenceMessage>,
    ids: MessageIds,
    to_parent: Vec<CoherenceMessage>,
    to_children: Vec<CoherenceMessage>,
    stats: StatSet,
}

impl InnerController {
    pub fn new(name: impl Into<String>, id: ComponentId, parent: ComponentId, config: &CacheConfig) -> Self {
        Self {
            name: name.into(),
            id,
            parent,
            array: CacheArray::new(
                config.num_sets(),
                config.associativity,
                config.line_size(),
                config.replacement_policy,
                config.seed,
            ),
            mshr: MshrTable::new(config.mshr_num_entries),
            snoops: HashMap::new(),
            deferred: HashMap::new(),
            stalled: VecDeque::new(),
            parked: VecDeque::new(),
            ids: MessageIds::new(id),
            to_parent: Vec::new(),
            to_children: Vec::new(),
            stats: StatSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &StatSet {
        &self.stats
    }

    pub fn state_of(&self, addr: u64) -> LineState {
        self.array.get(addr).map_or(LineState::Invalid, |line| line.state)
    }

    pub fn tracking(&self, addr: u64) -> Option<&Tracking> {
        self.array.get(addr).map(|line| &line.meta)
    }

    pub fn line(&self, addr: u64) -> Option<&CacheLine<Tracking>> {
        self.array.get(addr)
    }

    pub fn outstanding(&self) -> usize {
        self.mshr.len()
    }

    pub fn is_idle(&self) -> bool {
        self.mshr.is_empty()
            && self.snoops.is_empty()
            && self.deferred.is_empty()
            && self.stalled.is_empty()
            && self.parked.is_empty()
    }

    pub fn take_parent_messages(&mut self) -> Vec<CoherenceMessage> {
        std::mem::take(&mut self.to_parent)
    }

    pub fn take_child_messages(&mut self) -> Vec<CoherenceMessage> {
        std::mem::take(&mut self.to_children)
    }

    fn state_name(&self, line_addr: u64) -> &'static str {
        if self.snoops.contains_key(&line_addr) {
            return "Snoop";
        }
        match self.mshr.lookup(line_addr) {
            Some(entry) => entry.kind.name(),
            None => self.state_of(line_addr).short(),
        }
    }

    fn violation(&self, addr: u64, message: impl Into<String>) -> anyhow::Error {
        ProtocolViolation::new(self.name.clone(), addr, self.state_name(addr), message).into()
    }

    fn busy(&self, line_addr: u64) -> bool {
        self.mshr.has_entry(line_addr) || self.snoops.contains_key(&line_addr)
    }

    fn message(&mut self, kind: CohKind, dst: ComponentId, addr: u64) -> CoherenceMessage {
        let mut msg = CoherenceMessage::new(kind, self.id, dst, addr);
        msg.id = self.ids.next();
        msg
    }

    fn send_parent(&mut self, kind: CohKind, addr: u64, data: Option<(Vec<u8>, bool)>) {
        let mut msg = self.message(kind, self.parent, addr);
        if let Some((data, dirty)) = data {
            msg = msg.with_data(data, dirty);
        }
        self.stats.incr(&format!("eventSent_{}", kind));
        self.to_parent.push(msg);
    }

    fn send_child(&mut self, msg: CoherenceMessage) {
        self.stats.incr(&format!("eventSent_{}", msg.kind));
        self.to_children.push(msg);
    }

    fn requeue_front(&mut self, reqs: Vec<CoherenceMessage>) {
        for req in reqs.into_iter().rev() {
            self.stalled.push_front(req);
        }
    }

    /// A GetS/GetM from a child, after the access latency.
    pub fn handle_child_request(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        self.stats.incr(&format!("recv_{}", msg.kind));
        if !self.stalled.is_empty() {
            self.stats.incr("mshr_stall");
            self.stalled.push_back(msg);
        } else if let Some(msg) = self.try_request(msg, now)? {
            self.stats.incr("mshr_stall");
            self.stalled.push_back(msg);
        }
        self.settle(now)
    }

    /// Serve, start or queue a child request.  Hands it back when no MSHR entry is free.
    fn try_request(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<Option<CoherenceMessage>> {
        let line_addr = self.array.line_addr(msg.addr);
        if !msg.kind.is_get() {
            return Err(self.violation(line_addr, format!("{} is not a child request", msg.kind)));
        }
        if let Some(snoop) = self.snoops.get_mut(&line_addr) {
            snoop.waiting.push(msg);
            return Ok(None);
        }
        if let Some(entry) = self.mshr.lookup_mut(line_addr) {
            entry.merged.push(msg);
            self.stats.incr("mshr_coalesced");
            return Ok(None);
        }

        let resident = self.array.access(line_addr).map(|line| (line.state, line.meta.owner));
        match (msg.kind, resident) {
            (CohKind::GetS, Some((_, owner))) => match owner.filter(|o| *o != msg.src) {
                Some(owner) => {
                    if self.mshr.is_full() {
                        return Ok(Some(msg));
                    }
                    let fwd = self.message(CohKind::FwdGetS, owner, line_addr);
                    self.open(line_addr, Txn::Collect { req: msg, downgrade: Some(owner) }, now, 1)?;
                    self.stats.incr("fwd_GetS");
                    self.send_child(fwd);
                }
                None => {
                    self.stats.incr("hits");
                    self.grant(line_addr, &msg, Grant::Shared)?;
                }
            },
            (CohKind::GetM, Some((LineState::Modified, _))) => {
                let others = self.holders_except(line_addr, msg.src);
                if others.is_empty() {
                    self.stats.incr("hits");
                    self.grant(line_addr, &msg, Grant::Modified)?;
                } else {
                    if self.mshr.is_full() {
                        return Ok(Some(msg));
                    }
                    let requester = msg.src;
                    self.open(line_addr, Txn::Collect { req: msg, downgrade: None }, now, 0)?;
                    let pending = self.invalidate_children(line_addr, Some(requester));
                    self.set_pending(line_addr, pending);
                }
            }
            (CohKind::GetM, Some(_)) => {
                if self.mshr.is_full() {
                    return Ok(Some(msg));
                }
                self.open(line_addr, Txn::Fetch { req: msg }, now, 0)?;
                self.stats.incr("upgrades");
                self.send_parent(CohKind::GetM, line_addr, None);
            }
            (kind, None) => {
                if self.mshr.is_full() {
                    return Ok(Some(msg));
                }
                self.open(line_addr, Txn::Fetch { req: msg }, now, 0)?;
                self.stats.incr("misses");
                self.send_parent(kind, line_addr, None);
            }
            (kind, Some(_)) => {
                return Err(self.violation(line_addr, format!("cannot serve {}", kind)));
            }
        }
        Ok(None)
    }

    fn open(&mut self, line_addr: u64, txn: Txn, now: Cycle, pending: u32) -> anyhow::Result<()> {
        if !self.mshr.reserve(line_addr, txn, self.id, now) {
            bail!("{}: no MSHR entry for {:#x}", self.name, line_addr);
        }
        self.set_pending(line_addr, pending);
        Ok(())
    }

    fn set_pending(&mut self, line_addr: u64, pending: u32) {
        if let Some(entry) = self.mshr.lookup_mut(line_addr) {
            entry.pending = pending;
        }
    }

    fn holders_except(&self, line_addr: u64, keep: ComponentId) -> SmallVec<[ComponentId; 4]> {
        self.array
            .get(line_addr)
            .map(|line| line.meta.holders().into_iter().filter(|c| *c != keep).collect())
            .unwrap_or_default()
    }

    /// Invalidate every child holding the line except `keep`; the owner gets a FwdGetM.
    /// Children stop being tracked as soon as their message is sent.
    fn invalidate_children(&mut self, line_addr: u64, keep: Option<ComponentId>) -> u32 {
        let Some(line) = self.array.get_mut(line_addr) else {
            return 0;
        };
        let owner = line.meta.owner.filter(|o| Some(*o) != keep);
        let sharers: SmallVec<[ComponentId; 4]> =
            line.meta.sharers.iter().copied().filter(|c| Some(*c) != keep).collect();
        if owner.is_some() {
            line.meta.owner = None;
        }
        line.meta.sharers.retain(|c| Some(*c) == keep);

        let mut pending = 0;
        if let Some(owner) = owner {
            let fwd = self.message(CohKind::FwdGetM, owner, line_addr);
            self.stats.incr("fwd_GetM");
            self.send_child(fwd);
            pending += 1;
        }
        for child in sharers {
            let inv = self.message(CohKind::Inv, child, line_addr);
            self.stats.incr("inv_sent");
            self.send_child(inv);
            pending += 1;
        }
        pending
    }

    fn grant(&mut self, line_addr: u64, req: &CoherenceMessage, grant: Grant) -> anyhow::Result<()> {
        let line = self
            .array
            .get_mut(line_addr)
            .ok_or_else(|| anyhow!("{}: granting {:#x} which is not resident", self.name, line_addr))?;
        match grant {
            Grant::Shared => line.meta.add_sharer(req.src),
            Grant::Modified => {
                line.meta.sharers.clear();
                line.meta.owner = Some(req.src);
            }
        }
        let data = line.data.clone();
        let msg = self
            .message(CohKind::Data, req.src, line_addr)
            .with_grant(grant)
            .with_data(data, false);
        self.send_child(msg);
        Ok(())
    }

    /// Grant `req` now that this cache holds the permission it needs, or start collecting the
    /// children that stand in the way.
    fn serve_or_collect(&mut self, line_addr: u64, req: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        if req.kind == CohKind::GetS {
            return self.grant(line_addr, &req, Grant::Shared);
        }
        if self.state_of(line_addr) != LineState::Modified {
            return Err(self.violation(line_addr, "parent granted Shared for a GetM"));
        }
        let others = self.holders_except(line_addr, req.src);
        if others.is_empty() {
            return self.grant(line_addr, &req, Grant::Modified);
        }
        let requester = req.src;
        self.open(line_addr, Txn::Collect { req, downgrade: None }, now, 0)?;
        let pending = self.invalidate_children(line_addr, Some(requester));
        self.set_pending(line_addr, pending);
        Ok(())
    }

    /// Child puts are applied at once and always acknowledged.
    pub fn handle_child_put(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        self.stats.incr(&format!("recv_{}", msg.kind));
        let mut stale = true;
        if let Some(line) = self.array.get_mut(line_addr) {
            match msg.kind {
                CohKind::PutM if line.meta.owner == Some(msg.src) => {
                    line.meta.owner = None;
                    if let Some(data) = msg.data {
                        line.data = data;
                    }
                    line.dirty = true;
                    stale = false;
                }
                CohKind::PutS => stale = !line.meta.remove_sharer(msg.src),
                _ => {}
            }
        }
        if stale {
            self.stats.incr("stale_puts");
        }
        let ack = self.message(CohKind::Ack, msg.src, line_addr);
        self.send_child(ack);
        self.settle(now)
    }

    /// Data or Ack from a child answering an Inv/FwdGetS/FwdGetM.
    pub fn handle_child_response(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        self.stats.incr(&format!("recv_{}", msg.kind));
        let data = msg.data.filter(|_| msg.kind == CohKind::Data);

        if let Some(snoop) = self.snoops.get_mut(&line_addr) {
            if snoop.pending == 0 {
                return Err(self.violation(line_addr, "child response with no pending snoop"));
            }
            snoop.pending -= 1;
            let done = snoop.pending == 0;
            if let Some(data) = data {
                match snoop.held.as_mut() {
                    Some(held) => {
                        held.data = data;
                        held.dirty |= msg.dirty;
                    }
                    None => {
                        if let Some(line) = self.array.get_mut(line_addr) {
                            line.data = data;
                            line.dirty |= msg.dirty;
                        }
                    }
                }
            }
            if done {
                self.finish_snoop(line_addr)?;
            }
            return self.settle(now);
        }

        let step = match self.mshr.lookup_mut(line_addr) {
            Some(entry) if entry.pending > 0 => {
                let collecting = match &mut entry.kind {
                    Txn::Collect { .. } => Some(true),
                    Txn::Evict { victim, put_sent: false } => {
                        if let Some(data) = data.clone() {
                            victim.data = data;
                            victim.dirty |= msg.dirty;
                        }
                        Some(false)
                    }
                    _ => None,
                };
                if collecting.is_some() {
                    entry.pending -= 1;
                }
                collecting.map(|collecting| (entry.pending == 0, collecting))
            }
            _ => None,
        };
        let Some((done, collecting)) = step else {
            return Err(self.violation(line_addr, format!("unexpected {} from child", msg.kind)));
        };
        if collecting {
            if let (Some(data), Some(line)) = (data, self.array.get_mut(line_addr)) {
                line.data = data;
                line.dirty |= msg.dirty;
            }
        }
        if done {
            if collecting {
                self.finish_collect(line_addr)?;
            } else {
                self.send_put(line_addr);
            }
        }
        self.settle(now)
    }

    fn finish_collect(&mut self, line_addr: u64) -> anyhow::Result<()> {
        let Some(entry) = self.mshr.complete(line_addr) else {
            return Ok(());
        };
        let Txn::Collect { req, downgrade } = entry.kind else {
            bail!("{}: {:#x} finished collecting without a collect entry", self.name, line_addr);
        };
        if req.kind == CohKind::GetS {
            if let Some(line) = self.array.get_mut(line_addr) {
                if downgrade.is_some() && line.meta.owner == downgrade {
                    line.meta.owner = None;
                    if let Some(old) = downgrade {
                        line.meta.add_sharer(old);
                    }
                }
            }
            self.grant(line_addr, &req, Grant::Shared)?;
        } else {
            self.grant(line_addr, &req, Grant::Modified)?;
        }
        self.requeue_front(entry.merged.into_vec());
        Ok(())
    }

    fn send_put(&mut self, line_addr: u64) {
        let Some(entry) = self.mshr.lookup_mut(line_addr) else {
            return;
        };
        let Txn::Evict { victim, put_sent } = &mut entry.kind else {
            return;
        };
        *put_sent = true;
        let (kind, data) = match victim.state {
            LineState::Modified => (CohKind::PutM, Some((victim.data.clone(), victim.dirty))),
            _ => (CohKind::PutS, None),
        };
        self.send_parent(kind, line_addr, data);
    }

    fn start_eviction(&mut self, victim: CacheLine<Tracking>, now: Cycle) -> anyhow::Result<()> {
        let line_addr = victim.addr;
        self.stats.incr("evictions");
        self.stats.incr(&format!("evict_{}", victim.state.short()));
        let holders = victim.meta.holders();
        self.open(
            line_addr,
            Txn::Evict {
                victim: Victim::from_line(victim),
                put_sent: false,
            },
            now,
            holders.len() as u32,
        )?;
        for child in holders {
            let inv = self.message(CohKind::Inv, child, line_addr);
            self.stats.incr("inv_sent");
            self.send_child(inv);
        }
        if self.mshr.lookup(line_addr).is_some_and(|entry| entry.pending == 0) {
            self.send_put(line_addr);
        }
        Ok(())
    }

    /// Any message from the parent.
    pub fn handle_parent_message(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        self.stats.incr(&format!("recv_{}", msg.kind));
        match msg.kind {
            CohKind::Data => self.handle_fill(msg, now)?,
            CohKind::Ack => self.handle_put_ack(line_addr)?,
            kind if kind.is_snoop() => self.handle_parent_snoop(msg)?,
            kind => return Err(self.violation(line_addr, format!("unexpected {} from parent", kind))),
        }
        self.settle(now)
    }

    fn handle_fill(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        let Some(grant) = msg.grant else {
            return Err(self.violation(line_addr, "data without a grant"));
        };
        if !matches!(self.mshr.lookup(line_addr).map(|e| &e.kind), Some(Txn::Fetch { .. })) {
            return Err(self.violation(line_addr, "data with no matching MSHR entry"));
        }
        let latency = self
            .mshr
            .lookup(line_addr)
            .map_or(0, |entry| now.saturating_sub(entry.issued_at));

        if let Some(line) = self.array.access(line_addr) {
            // upgrade completed in place
            line.state = grant.state();
            if let Some(data) = msg.data {
                line.data = data;
            }
            let Some(entry) = self.mshr.complete(line_addr) else {
                return Ok(());
            };
            self.stats.record("latency_upgrade", latency);
            let Txn::Fetch { req } = entry.kind else {
                return Ok(());
            };
            self.requeue_front(entry.merged.into_vec());
            return self.serve_or_collect(line_addr, req, now);
        }

        let (array, mshr, snoops) = (&self.array, &self.mshr, &self.snoops);
        if !array.can_install(line_addr, |a| mshr.has_entry(a) || snoops.contains_key(&a)) {
            self.stats.incr("parked_fills");
            self.parked.push_back(msg);
            return Ok(());
        }

        let Some(entry) = self.mshr.complete(line_addr) else {
            return Ok(());
        };
        self.stats.record("latency_miss", latency);
        let data = msg
            .data
            .unwrap_or_else(|| vec![0; self.array.line_size() as usize]);
        let line = CacheLine::new(line_addr, grant.state(), data);
        let (mshr, snoops) = (&self.mshr, &self.snoops);
        match self
            .array
            .insert(line, |a| mshr.has_entry(a) || snoops.contains_key(&a))
        {
            InsertOutcome::Installed => {}
            InsertOutcome::Evicted(victim) => self.start_eviction(victim, now)?,
            InsertOutcome::Bypassed(_) => bail!("{}: no way for {:#x} after checking", self.name, line_addr),
        }
        let Txn::Fetch { req } = entry.kind else {
            return Ok(());
        };
        self.requeue_front(entry.merged.into_vec());
        self.serve_or_collect(line_addr, req, now)
    }

    fn handle_put_ack(&mut self, line_addr: u64) -> anyhow::Result<()> {
        if !matches!(
            self.mshr.lookup(line_addr).map(|e| &e.kind),
            Some(Txn::Evict { put_sent: true, .. })
        ) {
            return Err(self.violation(line_addr, "put-ack with no pending writeback"));
        }
        if let Some(entry) = self.mshr.complete(line_addr) {
            self.requeue_front(entry.merged.into_vec());
        }
        Ok(())
    }

    fn handle_parent_snoop(&mut self, msg: CoherenceMessage) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        if self.snoops.contains_key(&line_addr) || self.deferred.contains_key(&line_addr) {
            return Err(self.violation(line_addr, format!("second {} while one is pending", msg.kind)));
        }
        let upgrading = self.array.contains(line_addr);
        match self.mshr.lookup(line_addr).map(|e| &e.kind) {
            None => self.start_snoop(msg),
            Some(Txn::Fetch { .. }) if msg.kind == CohKind::Inv && upgrading => {
                // the upgrade lost the race; it continues as a miss once the children answer
                self.stats.incr("upgrade_lost_race");
                self.start_snoop(msg)
            }
            Some(Txn::Evict { put_sent: true, .. }) => self.answer_from_victim(msg),
            Some(_) => {
                self.stats.incr("snoop_deferred");
                self.deferred.insert(line_addr, msg);
                Ok(())
            }
        }
    }

    fn start_snoop(&mut self, msg: CoherenceMessage) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        let state = self.state_of(line_addr);
        if state == LineState::Invalid {
            return Err(self.violation(line_addr, format!("{} for a line that is not resident", msg.kind)));
        }
        if msg.kind != CohKind::Inv && state != LineState::Modified {
            return Err(self.violation(line_addr, format!("{} for a line not held in M", msg.kind)));
        }

        let snoop = if msg.kind == CohKind::FwdGetS {
            let owner = self.array.get(line_addr).and_then(|line| line.meta.owner);
            if let Some(owner) = owner {
                let fwd = self.message(CohKind::FwdGetS, owner, line_addr);
                self.stats.incr("fwd_GetS");
                self.send_child(fwd);
            }
            Snoop {
                kind: msg.kind,
                pending: owner.is_some() as u32,
                held: None,
                downgrade: owner,
                waiting: Vec::new(),
            }
        } else {
            let holders = self
                .array
                .get(line_addr)
                .map(|line| line.meta.holders())
                .unwrap_or_default();
            for child in holders.iter().copied() {
                let inv = self.message(CohKind::Inv, child, line_addr);
                self.stats.incr("inv_sent");
                self.send_child(inv);
            }
            let held = self.array.remove(line_addr).map(Victim::from_line);
            Snoop {
                kind: msg.kind,
                pending: holders.len() as u32,
                held,
                downgrade: None,
                waiting: Vec::new(),
            }
        };
        let done = snoop.pending == 0;
        self.snoops.insert(line_addr, snoop);
        if done {
            self.finish_snoop(line_addr)?;
        }
        Ok(())
    }

    fn finish_snoop(&mut self, line_addr: u64) -> anyhow::Result<()> {
        let Some(snoop) = self.snoops.remove(&line_addr) else {
            return Ok(());
        };
        match (snoop.kind, snoop.held) {
            (CohKind::FwdGetS, _) => {
                let Some(line) = self.array.get_mut(line_addr) else {
                    bail!("{}: {:#x} left the array during a FwdGetS", self.name, line_addr);
                };
                if snoop.downgrade.is_some() && line.meta.owner == snoop.downgrade {
                    line.meta.owner = None;
                    if let Some(old) = snoop.downgrade {
                        line.meta.add_sharer(old);
                    }
                }
                line.state = LineState::Shared;
                let data = (line.data.clone(), line.dirty);
                line.dirty = false;
                self.send_parent(CohKind::Data, line_addr, Some(data));
            }
            (CohKind::Inv, Some(held)) if held.state != LineState::Modified => {
                self.send_parent(CohKind::Ack, line_addr, None);
            }
            (_, Some(held)) => {
                self.send_parent(CohKind::Data, line_addr, Some((held.data, held.dirty)));
            }
            (kind, None) => bail!("{}: {} finished without the line", self.name, kind),
        }
        self.requeue_front(snoop.waiting);
        Ok(())
    }

    fn answer_from_victim(&mut self, msg: CoherenceMessage) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        let reply = match self.mshr.lookup_mut(line_addr).map(|e| &mut e.kind) {
            Some(Txn::Evict { victim, .. }) => {
                let held_m = victim.state == LineState::Modified;
                match msg.kind {
                    CohKind::Inv => {
                        victim.state = LineState::Invalid;
                        Ok(held_m.then(|| (victim.data.clone(), victim.dirty)))
                    }
                    _ if held_m => {
                        victim.state = if msg.kind == CohKind::FwdGetS {
                            LineState::Shared
                        } else {
                            LineState::Invalid
                        };
                        Ok(Some((victim.data.clone(), victim.dirty)))
                    }
                    _ => Err(()),
                }
            }
            _ => Err(()),
        };
        match reply {
            Ok(Some(data)) => self.send_parent(CohKind::Data, line_addr, Some(data)),
            Ok(None) => self.send_parent(CohKind::Ack, line_addr, None),
            Err(()) => {
                return Err(self.violation(line_addr, format!("{} for a line not held in M", msg.kind)))
            }
        }
        Ok(())
    }

    /// Resume whatever was waiting on lines that just became free.
    fn settle(&mut self, now: Cycle) -> anyhow::Result<()> {
        let mut ready: Vec<u64> = self
            .deferred
            .keys()
            .copied()
            .filter(|line| {
                !self.snoops.contains_key(line)
                    && match self.mshr.lookup(*line).map(|e| &e.kind) {
                        None => true,
                        Some(Txn::Evict { put_sent, .. }) => *put_sent,
                        Some(_) => false,
                    }
            })
            .collect();
        ready.sort_unstable();
        for line in ready {
            if let Some(msg) = self.deferred.remove(&line) {
                self.handle_parent_snoop(msg)?;
            }
        }

        for _ in 0..self.parked.len() {
            if let Some(msg) = self.parked.pop_front() {
                self.handle_fill(msg, now)?;
            }
        }

        while let Some(msg) = self.stalled.pop_front() {
            if let Some(msg) = self.try_request(msg, now)? {
                self.stalled.push_front(msg);
                break;
            }
        }
        Ok(())
    }
}

/// A shared L2/L3 bank.
pub struct InnerCache {
    ctrl: InnerController,
    access_latency: Cycle,
    mshr_latency: Cycle,
    arriving: VecDeque<CoherenceMessage>,
}

impl InnerCache {
    pub fn new(name: impl Into<String>, id: ComponentId, parent: ComponentId, config: &CacheConfig) -> Self {
        Self {
            ctrl: InnerController::new(name, id, parent, config),
            access_latency: config.cache_frequency.cycles(config.access_latency_cycles),
            mshr_latency: config.cache_frequency.cycles(config.mshr_latency_cycles),
            arriving: VecDeque::new(),
        }
    }

    pub fn controller(&self) -> &InnerController {
        &self.ctrl
    }

    fn flush(&mut self, ctx: &mut Ctx, child_delay: Cycle) -> anyhow::Result<()> {
        for msg in self.ctrl.take_parent_messages() {
            debug!("{} @{}: send {}", self.ctrl.name(), ctx.now(), msg);
            ctx.send(PARENT_PORT, Payload::Coh(msg))?;
        }
        for msg in self.ctrl.take_child_messages() {
            debug!("{} @{}: send {}", self.ctrl.name(), ctx.now(), msg);
            ctx.send_after(CHILD_PORT, Payload::Coh(msg), child_delay)?;
        }
        Ok(())
    }
}

impl Component for InnerCache {
    fn name(&self) -> &str {
        self.ctrl.name()
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Link {
                port: CHILD_PORT,
                payload: Payload::Coh(msg),
            } => {
                debug!("{} @{}: recv {}", self.ctrl.name(), ctx.now(), msg);
                match msg.kind {
                    kind if kind.is_get() => {
                        self.arriving.push_back(msg);
                        ctx.schedule(self.access_latency, ACCESS_TOKEN);
                        Ok(())
                    }
                    kind if kind.is_put() => {
                        self.ctrl.handle_child_put(msg, ctx.now())?;
                        self.flush(ctx, 0)
                    }
                    _ => {
                        self.ctrl.handle_child_response(msg, ctx.now())?;
                        self.flush(ctx, 0)
                    }
                }
            }
            Event::Link {
                port: PARENT_PORT,
                payload: Payload::Coh(msg),
            } => {
                debug!("{} @{}: recv {}", self.ctrl.name(), ctx.now(), msg);
                self.ctrl.handle_parent_message(msg, ctx.now())?;
                self.flush(ctx, self.mshr_latency)
            }
            Event::Timer(ACCESS_TOKEN) => {
                let msg = self
                    .arriving
                    .pop_front()
                    .ok_or_else(|| anyhow!("{}: access timer without a request", self.ctrl.name()))?;
                trace!("{} @{}: access {}", self.ctrl.name(), ctx.now(), msg);
                self.ctrl.handle_child_request(msg, ctx.now())?;
                self.flush(ctx, 0)
            }
            Event::Link { port, payload } => {
                warn!("{}: dropping {} on port {}", self.ctrl.name(), payload.kind(), port);
                bail!("{}: unexpected {} on port {}", self.ctrl.name(), payload.kind(), port)
            }
            Event::Timer(token) => bail!("{}: unknown timer {}", self.ctrl.name(), token),
        }
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
    use crate::sim::units::Bytes;

    const ME: ComponentId = 10;
    const PARENT: ComponentId = 20;
    const A: ComponentId = 1;
    const B: ComponentId = 2;

    // one set of two ways
    fn small(mshr: usize) -> InnerController {
        let config = CacheConfig {
            cache_size: Bytes(128),
            associativity: 2,
            mshr_num_entries: mshr,
            ..CacheConfig::l2()
        };
        InnerController::new("l2", ME, PARENT, &config)
    }

    fn from_child(kind: CohKind, child: ComponentId, addr: u64) -> CoherenceMessage {
        CoherenceMessage::new(kind, child, ME, addr)
    }

    fn from_parent(kind: CohKind, addr: u64) -> CoherenceMessage {
        CoherenceMessage::new(kind, PARENT, ME, addr)
    }

    fn fill(addr: u64, grant: Grant, word: u64) -> CoherenceMessage {
        let mut data = vec![0; 64];
        data[..8].copy_from_slice(&word.to_le_bytes());
        from_parent(CohKind::Data, addr).with_grant(grant).with_data(data, false)
    }

    fn kinds(msgs: Vec<CoherenceMessage>) -> Vec<(CohKind, ComponentId)> {
        msgs.into_iter().map(|m| (m.kind, m.dst)).collect()
    }

    /// A owns 0x0 in M below this cache.
    fn owned_by_a() -> InnerController {
        let mut l2 = small(4);
        l2.handle_child_request(from_child(CohKind::GetM, A, 0x0), 0).unwrap();
        l2.handle_parent_message(fill(0x0, Grant::Modified, 1), 10).unwrap();
        l2.take_parent_messages();
        l2.take_child_messages();
        l2
    }

    #[test]
    fn miss_fetches_then_grants() {
        let mut l2 = small(4);
        l2.handle_child_request(from_child(CohKind::GetS, A, 0x40), 0).unwrap();
        assert_eq!(vec![(CohKind::GetS, PARENT)], kinds(l2.take_parent_messages()));
        l2.handle_parent_message(fill(0x40, Grant::Shared, 5), 10).unwrap();
        let grants = l2.take_child_messages();
        assert_eq!(Some(Grant::Shared), grants[0].grant);
        assert_eq!(A, grants[0].dst);
        assert_eq!(&[A], l2.tracking(0x40).unwrap().sharers.as_slice());
        assert!(l2.is_idle());
    }

    #[test]
    fn gets_to_owned_line_forwards_to_owner() {
        let mut l2 = owned_by_a();
        assert_eq!(Some(A), l2.tracking(0x0).unwrap().owner);
        l2.handle_child_request(from_child(CohKind::GetS, B, 0x0), 20).unwrap();
        assert_eq!(vec![(CohKind::FwdGetS, A)], kinds(l2.take_child_messages()));

        let reply = from_child(CohKind::Data, A, 0x0).with_data(vec![9; 64], true);
        l2.handle_child_response(reply, 30).unwrap();
        let grant = l2.take_child_messages();
        assert_eq!((CohKind::Data, B), (grant[0].kind, grant[0].dst));
        assert_eq!(vec![9; 64], grant[0].data.clone().unwrap());
        let tracking = l2.tracking(0x0).unwrap();
        assert_eq!(None, tracking.owner);
        assert!(tracking.sharers.contains(&A) && tracking.sharers.contains(&B));
        assert_eq!(1, l2.stats().count("fwd_GetS"));
    }

    #[test]
    fn getm_invalidates_other_sharers_first() {
        let mut l2 = small(4);
        l2.handle_child_request(from_child(CohKind::GetS, A, 0x0), 0).unwrap();
        l2.handle_parent_message(fill(0x0, Grant::Modified, 0), 5).unwrap();
        l2.handle_child_request(from_child(CohKind::GetS, B, 0x0), 6).unwrap();
        l2.take_child_messages();
        l2.handle_child_request(from_child(CohKind::GetM, B, 0x0), 7).unwrap();
        assert_eq!(vec![(CohKind::Inv, A)], kinds(l2.take_child_messages()));
        l2.handle_child_response(from_child(CohKind::Ack, A, 0x0), 8).unwrap();
        let grant = l2.take_child_messages();
        assert_eq!(Some(Grant::Modified), grant[0].grant);
        assert_eq!(Some(B), l2.tracking(0x0).unwrap().owner);
    }

    #[test]
    fn eviction_back_invalidates_then_puts() {
        let mut l2 = owned_by_a();
        l2.handle_child_request(from_child(CohKind::GetS, B, 0x40), 20).unwrap();
        l2.handle_parent_message(fill(0x40, Grant::Shared, 0), 30).unwrap();
        l2.take_child_messages();
        l2.take_parent_messages();
        // third line in a two-way set evicts 0x0, which A still owns
        l2.handle_child_request(from_child(CohKind::GetS, B, 0x80), 40).unwrap();
        l2.handle_parent_message(fill(0x80, Grant::Shared, 0), 50).unwrap();
        let to_children = kinds(l2.take_child_messages());
        assert!(to_children.contains(&(CohKind::Inv, A)));
        assert!(l2.take_parent_messages().iter().all(|m| m.kind != CohKind::PutM));

        l2.handle_child_response(from_child(CohKind::Data, A, 0x0).with_data(vec![4; 64], true), 60)
            .unwrap();
        let put = l2.take_parent_messages();
        assert_eq!(CohKind::PutM, put[0].kind);
        assert_eq!(vec![4; 64], put[0].data.clone().unwrap());
        // a child request for the victim waits for the put-ack
        l2.handle_child_request(from_child(CohKind::GetS, A, 0x0), 70).unwrap();
        assert!(l2.take_parent_messages().is_empty());
        l2.handle_parent_message(from_parent(CohKind::Ack, 0x0), 80).unwrap();
        assert_eq!(vec![(CohKind::GetS, PARENT)], kinds(l2.take_parent_messages()));
    }

    #[test]
    fn parent_inv_collects_children_before_answering() {
        let mut l2 = owned_by_a();
        l2.handle_parent_message(from_parent(CohKind::Inv, 0x0), 20).unwrap();
        assert_eq!(vec![(CohKind::Inv, A)], kinds(l2.take_child_messages()));
        assert!(l2.take_parent_messages().is_empty());
        l2.handle_child_response(from_child(CohKind::Data, A, 0x0).with_data(vec![2; 64], true), 30)
            .unwrap();
        let reply = l2.take_parent_messages();
        assert_eq!(CohKind::Data, reply[0].kind);
        assert!(reply[0].dirty);
        assert_eq!(LineState::Invalid, l2.state_of(0x0));
    }

    #[test]
    fn snoop_during_collect_is_deferred() {
        let mut l2 = owned_by_a();
        l2.handle_child_request(from_child(CohKind::GetS, B, 0x0), 20).unwrap();
        l2.take_child_messages();
        l2.handle_parent_message(from_parent(CohKind::FwdGetM, 0x0), 25).unwrap();
        assert!(l2.take_parent_messages().is_empty());
        l2.handle_child_response(from_child(CohKind::Data, A, 0x0).with_data(vec![3; 64], true), 30)
            .unwrap();
        // B got its grant, then the deferred FwdGetM invalidated both children
        let to_children = kinds(l2.take_child_messages());
        assert_eq!((CohKind::Data, B), to_children[0]);
        assert!(to_children.contains(&(CohKind::Inv, A)));
        assert!(to_children.contains(&(CohKind::Inv, B)));
        l2.handle_child_response(from_child(CohKind::Ack, A, 0x0), 40).unwrap();
        l2.handle_child_response(from_child(CohKind::Ack, B, 0x0), 41).unwrap();
        assert_eq!(vec![(CohKind::Data, PARENT)], kinds(l2.take_parent_messages()));
        assert!(l2.is_idle());
    }

    #[test]
    fn stale_put_is_still_acked() {
        let mut l2 = owned_by_a();
        l2.handle_child_put(from_child(CohKind::PutM, B, 0x0), 20).unwrap();
        assert_eq!(vec![(CohKind::Ack, B)], kinds(l2.take_child_messages()));
        assert_eq!(Some(A), l2.tracking(0x0).unwrap().owner);
        assert_eq!(1, l2.stats().count("stale_puts"));

        l2.handle_child_put(from_child(CohKind::PutM, A, 0x0).with_data(vec![8; 64], true), 30)
            .unwrap();
        let line = l2.line(0x0).unwrap();
        assert!(line.dirty);
        assert_eq!(8, line.data[0]);
        assert!(line.meta.is_empty());
    }

    #[test]
    fn full_mshr_stalls_child_requests() {
        let mut l2 = small(1);
        l2.handle_child_request(from_child(CohKind::GetS, A, 0x0), 0).unwrap();
        l2.handle_child_request(from_child(CohKind::GetS, B, 0x40), 1).unwrap();
        assert_eq!(1, l2.take_parent_messages().len());
        l2.handle_parent_message(fill(0x0, Grant::Shared, 0), 10).unwrap();
        assert_eq!(vec![(CohKind::GetS, PARENT)], kinds(l2.take_parent_messages()));
        assert_eq!(1, l2.stats().count("mshr_stall"));
    }
}
