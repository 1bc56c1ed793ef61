use std::any::Any;
use std::collections::{HashMap, VecDeque};

use anyhow::bail;
use log::{debug, trace};

use crate::base::{Component, ComponentId, Ctx, Event, Payload, PortId, ProtocolViolation};
use crate::memory::backing::BackingStore;
use crate::memory::config::{BackendConfig, MemoryConfig};
use crate::memory::stacked::StackedBackend;
use crate::memory::{MemRequest, MemResponse};
use crate::sim::stats::{StatSet, StatSink};
use crate::timeq::{Cycle, EventId};

pub const DIR_PORT: PortId = 0;

const TICK: u64 = 0;
const COMPLETE: u64 = 1;

/// One backend-sized piece of a directory request.
#[derive(Debug, Clone, Copy)]
struct Part {
    key: u64,
    addr: u64,
    write: bool,
    size: u32,
}

#[derive(Debug)]
struct Open {
    resp: MemResponse,
    src: ComponentId,
    parts_left: u32,
    arrived_at: Cycle,
}

/// Serves directory reads and writes: data moves through the backing store on arrival, timing
/// comes from splitting each request into `request_width` pieces and pushing them through the
/// stacked backend in order, one clock edge at a time.
pub struct MemoryController {
    name: String,
    config: MemoryConfig,
    period: Cycle,
    backing: BackingStore,
    backend: StackedBackend<u64>,
    queue: VecDeque<Part>,
    open: HashMap<u64, Open>,
    next_key: u64,
    ticking: bool,
    completion_timer: Option<(Cycle, EventId)>,
    stats: StatSet,
}

impl MemoryController {
    pub fn new(name: impl Into<String>, config: &MemoryConfig, backend: &BackendConfig, line_size: u64) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            period: config.clock.period(),
            backing: BackingStore::new(config.backing, line_size),
            backend: StackedBackend::new(backend),
            queue: VecDeque::new(),
            open: HashMap::new(),
            next_key: 0,
            ticking: false,
            completion_timer: None,
            stats: StatSet::new(),
        }
    }

    pub fn backend(&self) -> &StackedBackend<u64> {
        &self.backend
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    fn next_edge(&self, now: Cycle) -> Cycle {
        (now / self.period + 1) * self.period
    }

    fn accept(&mut self, req: MemRequest, ctx: &mut Ctx) -> anyhow::Result<()> {
        let now = ctx.now();
        if !self.config.covers(req.addr, req.size) {
            return Err(ProtocolViolation::new(
                self.name.clone(),
                req.addr,
                "-",
                format!("{}-byte access outside {:#x}..={:#x}", req.size, self.config.addr_range_start, self.config.addr_range_end),
            )
            .into());
        }
        let data = if req.write {
            self.stats.incr("writes");
            if let Some(data) = &req.data {
                self.backing.write(req.addr, data);
            }
            None
        } else {
            self.stats.incr("reads");
            Some(self.backing.read(req.addr, req.size))
        };

        self.next_key += 1;
        let key = self.next_key;
        let width = self.config.request_width.0.max(1) as u32;
        let mut parts = 0;
        let mut offset = 0;
        while offset < req.size.max(1) {
            let size = width.min(req.size.max(1) - offset);
            self.queue.push_back(Part {
                key,
                addr: req.addr + offset as u64,
                write: req.write,
                size,
            });
            offset += size;
            parts += 1;
        }
        self.stats.record("parts_per_request", parts as u64);
        self.open.insert(
            key,
            Open {
                resp: MemResponse {
                    id: req.id,
                    addr: req.addr,
                    write: req.write,
                    data,
                },
                src: req.src,
                parts_left: parts,
                arrived_at: now,
            },
        );
        if !self.ticking {
            self.ticking = true;
            ctx.schedule_at(self.next_edge(now), TICK)?;
        }
        Ok(())
    }

    fn tick(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        let now = ctx.now();
        while let Some(part) = self.queue.front().copied() {
            match self.backend.issue(now, part.addr, part.write, part.size, part.key) {
                Ok(ticket) => {
                    trace!("{} @{}: part of #{} ready at {}", self.name, now, part.key, ticket.ready_at());
                    self.queue.pop_front();
                    self.stats.incr("parts_issued");
                }
                Err(reject) => {
                    self.stats.incr(&format!("reject_{}", reject.reason));
                    break;
                }
            }
        }
        if self.queue.is_empty() {
            self.ticking = false;
        } else {
            ctx.schedule_at(self.next_edge(now), TICK)?;
        }
        self.arm_completion(ctx)
    }

    fn arm_completion(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        let Some(next) = self.backend.next_completion() else {
            return Ok(());
        };
        match self.completion_timer {
            Some((at, _)) if at <= next => {}
            Some((_, id)) => {
                ctx.cancel(id);
                self.completion_timer = Some((next, ctx.schedule_at(next, COMPLETE)?));
            }
            None => self.completion_timer = Some((next, ctx.schedule_at(next, COMPLETE)?)),
        }
        Ok(())
    }

    fn complete(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        let now = ctx.now();
        self.completion_timer = None;
        let mut finished = Vec::new();
        let open = &mut self.open;
        self.backend.drain_completed(now, |key, _| {
            if let Some(entry) = open.get_mut(&key) {
                entry.parts_left -= 1;
                if entry.parts_left == 0 {
                    finished.push(key);
                }
            }
        });
        for key in finished {
            let Some(done) = self.open.remove(&key) else {
                continue;
            };
            self.stats.record("latency", now - done.arrived_at);
            debug!("{} @{}: done {:#x} for {}", self.name, now, done.resp.addr, done.src);
            ctx.send(DIR_PORT, Payload::MemResp(done.resp))?;
        }
        self.arm_completion(ctx)
    }
}

impl Component for MemoryController {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Link {
                port: DIR_PORT,
                payload: Payload::MemReq(req),
            } => {
                debug!("{} @{}: {} {:#x}", self.name, ctx.now(), if req.write { "write" } else { "read" }, req.addr);
                self.accept(req, ctx)
            }
            Event::Timer(TICK) => self.tick(ctx),
            Event::Timer(COMPLETE) => self.complete(ctx),
            Event::Link { port, payload } => {
                bail!("{}: unexpected {} on port {}", self.name, payload.kind(), port)
            }
            Event::Timer(token) => bail!("{}: unknown timer {}", self.name, token),
        }
    }

    fn stats(&self) -> &StatSet {
        &self.stats
    }

    fn is_quiescent(&self) -> bool {
        self.queue.is_empty() && self.open.is_empty() && self.backend.outstanding() == 0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
