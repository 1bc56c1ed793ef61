use std::any::Any;
use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail};
use log::{debug, trace};

use crate::base::{Component, ComponentId, Ctx, Event, Payload, PortId, ProtocolViolation};
use crate::hier::config::CacheConfig;
use crate::hier::line::{CacheArray, CacheLine, InsertOutcome, LineState};
use crate::hier::message::{self, CohKind, CoherenceMessage, CpuRequest, CpuResponse, MessageIds};
use crate::hier::mshr::{Allocation, MshrTable};
use crate::sim::stats::{StatSet, StatSink};
use crate::timeq::Cycle;

pub const CPU_PORT: PortId = 0;
pub const PARENT_PORT: PortId = 1;

const ACCESS_TOKEN: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
    Read,
    Write,
    /// Write to a Shared line: GetM outstanding while the line stays readable.
    Upgrade,
    Writeback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    Hit(CpuResponse),
    Miss,
    Coalesced,
    Stall,
}

enum Attempt {
    Done(AccessOutcome),
    Stalled(CpuRequest),
}

/// An evicted line waiting for the parent's put-ack.
#[derive(Debug)]
struct WritebackBuffer {
    state: LineState,
    data: Vec<u8>,
    dirty: bool,
}

/// MSI state machine of one L1.  Pure: it never touches the kernel, it only fills its outboxes
/// (`take_parent_messages`, `take_cpu_responses`).
#[derive(Debug)]
pub struct L1Controller {
    name: String,
    id: ComponentId,
    parent: ComponentId,
    array: CacheArray<()>,
    mshr: MshrTable<MissKind, CpuRequest>,
    writebacks: HashMap<u64, WritebackBuffer>,
    stalled: VecDeque<CpuRequest>,
    ids: MessageIds,
    to_parent: Vec<CoherenceMessage>,
    to_cpu: Vec<CpuResponse>,
    stats: StatSet,
}

impl L1Controller {
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
            writebacks: HashMap::new(),
            stalled: VecDeque::new(),
            ids: MessageIds::new(id),
            to_parent: Vec::new(),
            to_cpu: Vec::new(),
            stats: StatSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &StatSet {
        &self.stats
    }

    pub fn mshr(&self) -> &MshrTable<MissKind, CpuRequest> {
        &self.mshr
    }

    pub fn stalled(&self) -> usize {
        self.stalled.len()
    }

    pub fn line(&self, addr: u64) -> Option<&CacheLine<()>> {
        self.array.get(addr)
    }

    /// Stable MSI state of `addr`; transient states report the permission currently held.
    pub fn state_of(&self, addr: u64) -> LineState {
        self.array.get(addr).map_or(LineState::Invalid, |line| line.state)
    }

    pub fn is_idle(&self) -> bool {
        self.mshr.is_empty() && self.stalled.is_empty() && self.writebacks.is_empty()
    }

    pub fn take_parent_messages(&mut self) -> Vec<CoherenceMessage> {
        std::mem::take(&mut self.to_parent)
    }

    pub fn take_cpu_responses(&mut self) -> Vec<CpuResponse> {
        std::mem::take(&mut self.to_cpu)
    }

    fn state_name(&self, line_addr: u64) -> &'static str {
        let resident = self.array.get(line_addr).map(|line| line.state);
        match self.mshr.lookup(line_addr).map(|entry| entry.kind) {
            Some(MissKind::Read) => "IS",
            Some(MissKind::Write) => "IM",
            Some(MissKind::Upgrade) if resident.is_some() => "SM",
            Some(MissKind::Upgrade) => "IM",
            Some(MissKind::Writeback) => match self.writebacks.get(&line_addr).map(|wb| wb.state) {
                Some(LineState::Modified) => "MI",
                Some(LineState::Shared) => "SI",
                _ => "II",
            },
            None => resident.unwrap_or(LineState::Invalid).short(),
        }
    }

    fn violation(&self, addr: u64, message: impl Into<String>) -> anyhow::Error {
        ProtocolViolation::new(self.name.clone(), addr, self.state_name(addr), message).into()
    }

    fn send_parent(&mut self, kind: CohKind, addr: u64, data: Option<(Vec<u8>, bool)>) {
        let mut msg = CoherenceMessage::new(kind, self.id, self.parent, addr);
        msg.id = self.ids.next();
        if let Some((data, dirty)) = data {
            msg = msg.with_data(data, dirty);
        }
        self.stats.incr(&format!("eventSent_{}", kind));
        self.to_parent.push(msg);
    }

    /// A load or store arriving from the CPU, after the access latency.
    pub fn handle_local_access(&mut self, req: CpuRequest, now: Cycle) -> anyhow::Result<AccessOutcome> {
        message::check_word_access(req.addr, self.array.line_size())
            .map_err(|e| anyhow!("{}: request #{} rejected: {}", self.name, req.id, e))?;
        if !self.stalled.is_empty() {
            self.stats.incr("mshr_stall");
            self.stalled.push_back(req);
            return Ok(AccessOutcome::Stall);
        }
        match self.try_access(req, now)? {
            Attempt::Done(outcome) => Ok(outcome),
            Attempt::Stalled(req) => {
                self.stats.incr("mshr_stall");
                self.stalled.push_back(req);
                Ok(AccessOutcome::Stall)
            }
        }
    }

    fn try_access(&mut self, req: CpuRequest, now: Cycle) -> anyhow::Result<Attempt> {
        let line_addr = self.array.line_addr(req.addr);
        let cmd = if req.write { "GetM" } else { "GetS" };
        let event = format!("stateEvent_{}_{}", cmd, self.state_name(line_addr));
        self.stats.incr(&event);

        if let Some(entry) = self.mshr.lookup_mut(line_addr) {
            entry.merged.push(req);
            self.stats.incr("mshr_coalesced");
            return Ok(Attempt::Done(AccessOutcome::Coalesced));
        }

        let resident = self.array.access(line_addr).map(|line| line.state);
        let kind = match (resident, req.write) {
            (Some(LineState::Modified), _) | (Some(LineState::Shared), false) => {
                self.stats.incr("hits");
                let value = self.serve(line_addr, &req)?;
                return Ok(Attempt::Done(AccessOutcome::Hit(CpuResponse::for_request(&req, value))));
            }
            (Some(LineState::Shared), true) => MissKind::Upgrade,
            (_, true) => MissKind::Write,
            (_, false) => MissKind::Read,
        };

        match self.mshr.allocate(line_addr, kind, self.id, now, req) {
            Allocation::Full(req) => Ok(Attempt::Stalled(req)),
            Allocation::Secondary => Ok(Attempt::Done(AccessOutcome::Coalesced)),
            Allocation::Primary => {
                self.stats.incr("misses");
                let cmd = if kind == MissKind::Read { CohKind::GetS } else { CohKind::GetM };
                self.send_parent(cmd, line_addr, None);
                Ok(Attempt::Done(AccessOutcome::Miss))
            }
        }
    }

    /// Apply a request to a resident line and return the value the CPU observes.
    fn serve(&mut self, line_addr: u64, req: &CpuRequest) -> anyhow::Result<u64> {
        let offset = (req.addr - line_addr) as usize;
        let line = self
            .array
            .get_mut(line_addr)
            .ok_or_else(|| anyhow!("{}: serving {:#x} from a line that is not resident", self.name, req.addr))?;
        if req.write {
            line.write_word(offset, req.value);
            Ok(req.value)
        } else {
            Ok(line.read_word(offset))
        }
    }

    /// A message from the parent.  Frees MSHR entries and retries stalled requests.
    pub fn handle_incoming_message(&mut self, msg: CoherenceMessage, now: Cycle) -> anyhow::Result<()> {
        let line_addr = self.array.line_addr(msg.addr);
        let event = format!("stateEvent_{}_{}", msg.kind, self.state_name(line_addr));
        self.stats.incr(&event);
        match msg.kind {
            CohKind::Data => self.handle_data(msg, line_addr, now)?,
            CohKind::Ack => self.handle_put_ack(line_addr)?,
            CohKind::Inv => self.handle_inv(line_addr)?,
            CohKind::FwdGetS | CohKind::FwdGetM => self.handle_forward(msg.kind, line_addr)?,
            _ => return Err(self.violation(line_addr, format!("unexpected {} from parent", msg.kind))),
        }
        self.retry_stalled(now)
    }

    fn handle_data(&mut self, msg: CoherenceMessage, line_addr: u64, now: Cycle) -> anyhow::Result<()> {
        let Some(grant) = msg.grant else {
            return Err(self.violation(line_addr, "data without a grant"));
        };
        match self.mshr.lookup(line_addr).map(|entry| entry.kind) {
            Some(MissKind::Read | MissKind::Write | MissKind::Upgrade) => {}
            _ => return Err(self.violation(line_addr, "data with no matching MSHR entry")),
        }
        let Some(entry) = self.mshr.complete(line_addr) else {
            return Err(self.violation(line_addr, "data with no matching MSHR entry"));
        };

        let state = grant.state();
        let resident = self.array.contains(line_addr);
        let latency = now.saturating_sub(entry.issued_at);
        match entry.kind {
            MissKind::Read => self.stats.record("latency_GetS_IS", latency),
            MissKind::Upgrade if resident => self.stats.record("latency_GetM_SM", latency),
            _ => self.stats.record("latency_GetM_IM", latency),
        }

        let mut bypassed = None;
        if let Some(line) = self.array.access(line_addr) {
            line.state = state;
            if let Some(data) = msg.data {
                line.data = data;
            }
        } else {
            let data = msg
                .data
                .unwrap_or_else(|| vec![0; self.array.line_size() as usize]);
            let line = CacheLine::new(line_addr, state, data);
            let mshr = &self.mshr;
            match self.array.insert(line, |addr| mshr.has_entry(addr)) {
                InsertOutcome::Installed => {}
                InsertOutcome::Evicted(victim) => self.start_writeback(victim, now)?,
                InsertOutcome::Bypassed(line) => {
                    self.stats.incr("bypass");
                    bypassed = Some(line);
                }
            }
        }

        let mut waiting = entry.merged.into_iter();
        while let Some(req) = waiting.next() {
            if req.write && state != LineState::Modified {
                // a Shared grant cannot absorb stores: they go back through the access path
                let rest: Vec<_> = std::iter::once(req).chain(waiting).collect();
                for req in rest.into_iter().rev() {
                    self.stalled.push_front(req);
                }
                break;
            }
            let value = match bypassed.as_mut() {
                Some(line) => {
                    let offset = (req.addr - line_addr) as usize;
                    if req.write {
                        line.write_word(offset, req.value);
                        req.value
                    } else {
                        line.read_word(offset)
                    }
                }
                None => self.serve(line_addr, &req)?,
            };
            self.to_cpu.push(CpuResponse::for_request(&req, value));
        }

        if let Some(line) = bypassed {
            self.start_writeback(line, now)?;
        }
        Ok(())
    }

    fn start_writeback(&mut self, victim: CacheLine<()>, now: Cycle) -> anyhow::Result<()> {
        self.stats.incr(&format!("evict_{}", victim.state.short()));
        if !self.mshr.reserve(victim.addr, MissKind::Writeback, self.id, now) {
            bail!("{}: no MSHR entry left to write back {:#x}", self.name, victim.addr);
        }
        if victim.state == LineState::Modified {
            self.send_parent(CohKind::PutM, victim.addr, Some((victim.data.clone(), victim.dirty)));
        } else {
            self.send_parent(CohKind::PutS, victim.addr, None);
        }
        self.writebacks.insert(
            victim.addr,
            WritebackBuffer {
                state: victim.state,
                data: victim.data,
                dirty: victim.dirty,
            },
        );
        Ok(())
    }

    fn handle_put_ack(&mut self, line_addr: u64) -> anyhow::Result<()> {
        if self.mshr.lookup(line_addr).map(|entry| entry.kind) != Some(MissKind::Writeback) {
            return Err(self.violation(line_addr, "put-ack with no pending writeback"));
        }
        self.writebacks.remove(&line_addr);
        if let Some(entry) = self.mshr.complete(line_addr) {
            for req in entry.merged.into_iter().rev() {
                self.stalled.push_front(req);
            }
        }
        Ok(())
    }

    fn handle_inv(&mut self, line_addr: u64) -> anyhow::Result<()> {
        if let Some(wb) = self.writebacks.get_mut(&line_addr) {
            let reply = (wb.state == LineState::Modified).then(|| (wb.data.clone(), wb.dirty));
            wb.state = LineState::Invalid;
            match reply {
                Some(data) => self.send_parent(CohKind::Data, line_addr, Some(data)),
                None => self.send_parent(CohKind::Ack, line_addr, None),
            }
            return Ok(());
        }

        match self.array.get(line_addr).map(|line| line.state) {
            Some(LineState::Modified) => {
                if let Some(line) = self.array.remove(line_addr) {
                    self.stats.incr("inv_M");
                    self.send_parent(CohKind::Data, line_addr, Some((line.data, line.dirty)));
                }
                Ok(())
            }
            Some(LineState::Shared) => {
                self.array.remove(line_addr);
                if let Some(entry) = self.mshr.lookup_mut(line_addr) {
                    // lost the race: the upgrade continues as a plain write miss
                    entry.kind = MissKind::Write;
                    self.stats.incr("upgrade_lost_race");
                }
                self.send_parent(CohKind::Ack, line_addr, None);
                Ok(())
            }
            _ => Err(self.violation(
                line_addr,
                "invalidate for a line that is neither resident nor pending writeback",
            )),
        }
    }

    fn handle_forward(&mut self, kind: CohKind, line_addr: u64) -> anyhow::Result<()> {
        let next = if kind == CohKind::FwdGetS {
            LineState::Shared
        } else {
            LineState::Invalid
        };

        if let Some(wb) = self.writebacks.get_mut(&line_addr) {
            if wb.state != LineState::Modified {
                return Err(self.violation(line_addr, format!("{} for a line not held in M", kind)));
            }
            wb.state = next;
            let data = (wb.data.clone(), wb.dirty);
            self.send_parent(CohKind::Data, line_addr, Some(data));
            return Ok(());
        }

        let data = match self.array.get_mut(line_addr) {
            Some(line) if line.state == LineState::Modified => {
                let data = (line.data.clone(), line.dirty);
                line.state = next;
                line.dirty = false;
                data
            }
            _ => return Err(self.violation(line_addr, format!("{} for a line not held in M", kind))),
        };
        if next == LineState::Invalid {
            self.array.remove(line_addr);
        }
        self.send_parent(CohKind::Data, line_addr, Some(data));
        Ok(())
    }

    fn retry_stalled(&mut self, now: Cycle) -> anyhow::Result<()> {
        while let Some(req) = self.stalled.pop_front() {
            match self.try_access(req, now)? {
                Attempt::Done(AccessOutcome::Hit(resp)) => self.to_cpu.push(resp),
                Attempt::Done(_) => {}
                Attempt::Stalled(req) => {
                    self.stalled.push_front(req);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// An L1 cache bank: the MSI controller plus its access and MSHR latencies.
pub struct L1Cache {
    ctrl: L1Controller,
    access_latency: Cycle,
    mshr_latency: Cycle,
    arriving: VecDeque<CpuRequest>,
}

impl L1Cache {
    pub fn new(name: impl Into<String>, id: ComponentId, parent: ComponentId, config: &CacheConfig) -> Self {
        Self {
            ctrl: L1Controller::new(name, id, parent, config),
            access_latency: config.cache_frequency.cycles(config.access_latency_cycles),
            mshr_latency: config.cache_frequency.cycles(config.mshr_latency_cycles),
            arriving: VecDeque::new(),
        }
    }

    pub fn controller(&self) -> &L1Controller {
        &self.ctrl
    }

    pub fn state_of(&self, addr: u64) -> LineState {
        self.ctrl.state_of(addr)
    }

    /// Send everything the controller produced.  Responses that complete a miss pay the MSHR
    /// latency.
    fn flush(&mut self, ctx: &mut Ctx, cpu_delay: Cycle) -> anyhow::Result<()> {
        for msg in self.ctrl.take_parent_messages() {
            debug!("{} @{}: send {}", self.ctrl.name(), ctx.now(), msg);
            ctx.send(PARENT_PORT, Payload::Coh(msg))?;
        }
        for resp in self.ctrl.take_cpu_responses() {
            ctx.send_after(CPU_PORT, Payload::CpuResp(resp), cpu_delay)?;
        }
        Ok(())
    }
}

impl Component for L1Cache {
    fn name(&self) -> &str {
        self.ctrl.name()
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Link {
                port: CPU_PORT,
                payload: Payload::Cpu(req),
            } => {
                trace!("{} @{}: cpu request {:?}", self.ctrl.name(), ctx.now(), req);
                self.arriving.push_back(req);
                ctx.schedule(self.access_latency, ACCESS_TOKEN);
                Ok(())
            }
            Event::Link {
                port: PARENT_PORT,
                payload: Payload::Coh(msg),
            } => {
                debug!("{} @{}: recv {}", self.ctrl.name(), ctx.now(), msg);
                self.ctrl.handle_incoming_message(msg, ctx.now())?;
                self.flush(ctx, self.mshr_latency)
            }
            Event::Timer(ACCESS_TOKEN) => {
                let req = self
                    .arriving
                    .pop_front()
                    .ok_or_else(|| anyhow!("{}: access timer without a request", self.ctrl.name()))?;
                if let AccessOutcome::Hit(resp) = self.ctrl.handle_local_access(req, ctx.now())? {
                    ctx.send(CPU_PORT, Payload::CpuResp(resp))?;
                }
                self.flush(ctx, 0)
            }
            Event::Link { port, payload } => {
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
