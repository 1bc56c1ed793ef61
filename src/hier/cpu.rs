use std::any::Any;
use std::collections::{HashMap, VecDeque};

use anyhow::bail;
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::base::{Component, Ctx, Event, Payload, PortId};
use crate::hier::config::CpuConfig;
use crate::hier::message::{CpuRequest, CpuResponse};
use crate::sim::stats::{StatSet, StatSink};
use crate::timeq::Cycle;

pub const L1_PORT: PortId = 0;
pub const TICK: u64 = 0;

/// Word-sized operation queued on a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuOp {
    Read(u64),
    Write(u64, u64),
}

/// Load/store traffic generator in front of one L1.
pub struct TrafficCpu {
    name: String,
    core: usize,
    config: CpuConfig,
    issue_period: Cycle,
    rng: StdRng,
    random_left: u64,
    script: VecDeque<CpuOp>,
    outstanding: HashMap<u64, CpuRequest>,
    next_id: u64,
    ticking: bool,
    completed: Vec<CpuResponse>,
    stats: StatSet,
}

impl TrafficCpu {
    pub fn new(name: impl Into<String>, core: usize, config: &CpuConfig) -> Self {
        Self {
            name: name.into(),
            core,
            config: config.clone(),
            issue_period: config.clock.cycles(config.comm_freq.max(1)),
            rng: StdRng::seed_from_u64(config.rngseed + 200 * core as u64),
            random_left: config.num_loadstore,
            script: VecDeque::new(),
            outstanding: HashMap::new(),
            next_id: 0,
            ticking: false,
            completed: Vec::new(),
            stats: StatSet::new(),
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn completed(&self) -> &[CpuResponse] {
        &self.completed
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn has_work(&self) -> bool {
        !self.script.is_empty() || self.random_left > 0
    }

    /// Queue a scripted op.  Returns true when the CPU is idle and needs a `TICK` to start.
    pub fn push_op(&mut self, op: CpuOp) -> bool {
        self.script.push_back(op);
        if self.ticking {
            false
        } else {
            self.ticking = true;
            true
        }
    }

    fn next_op(&mut self) -> Option<CpuOp> {
        if let Some(op) = self.script.pop_front() {
            return Some(op);
        }
        if self.random_left == 0 {
            return None;
        }
        self.random_left -= 1;
        let words = (self.config.mem_size.0 / 8).max(1);
        let addr = self.rng.gen_range(0..words) * 8;
        if self.config.do_write && self.rng.gen_bool(0.5) {
            Some(CpuOp::Write(addr, self.rng.gen()))
        } else {
            Some(CpuOp::Read(addr))
        }
    }

    fn tick(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        if self.outstanding.len() >= self.config.max_outstanding {
            self.stats.incr("stall_outstanding");
            self.ticking = false;
            return Ok(());
        }
        if let Some(op) = self.next_op() {
            self.next_id += 1;
            let (addr, write, value) = match op {
                CpuOp::Read(addr) => (addr, false, 0),
                CpuOp::Write(addr, value) => (addr, true, value),
            };
            let req = CpuRequest {
                id: self.next_id,
                addr,
                write,
                value,
                issued_at: ctx.now(),
            };
            trace!("{} @{}: issue {:?}", self.name, ctx.now(), req);
            self.stats.incr(if write { "writes" } else { "reads" });
            self.outstanding.insert(req.id, req);
            ctx.send(L1_PORT, Payload::Cpu(req))?;
        }
        if self.has_work() {
            ctx.schedule(self.issue_period, TICK);
        } else {
            self.ticking = false;
        }
        Ok(())
    }
}

impl Component for TrafficCpu {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        if self.has_work() && !self.ticking {
            self.ticking = true;
            ctx.schedule(self.issue_period, TICK);
        }
        Ok(())
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Timer(TICK) => self.tick(ctx),
            Event::Link {
                port: L1_PORT,
                payload: Payload::CpuResp(resp),
            } => {
                let Some(req) = self.outstanding.remove(&resp.id) else {
                    bail!("{}: response for unknown request {}", self.name, resp.id);
                };
                debug!("{} @{}: done {:#x} = {:#x}", self.name, ctx.now(), resp.addr, resp.value);
                let latency = ctx.now().saturating_sub(req.issued_at);
                self.stats
                    .record(if req.write { "latency_write" } else { "latency_read" }, latency);
                self.completed.push(resp);
                if !self.ticking && self.has_work() {
                    self.ticking = true;
                    ctx.schedule(self.issue_period, TICK);
                }
                if !self.has_work() && self.outstanding.is_empty() {
                    info!("{}: all {} accesses completed at {}ps", self.name, self.completed.len(), ctx.now());
                }
                Ok(())
            }
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
        self.outstanding.is_empty() && !self.has_work()
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

    fn cpu(num_loadstore: u64, core: usize) -> TrafficCpu {
        let config = CpuConfig {
            num_loadstore,
            mem_size: crate::sim::units::Bytes(4096),
            ..CpuConfig::default()
        };
        TrafficCpu::new(format!("cpu{}", core), core, &config)
    }

    #[test]
    fn scripted_ops_come_before_random_traffic() {
        let mut c = cpu(3, 0);
        c.push_op(CpuOp::Write(0x40, 7));
        assert_eq!(Some(CpuOp::Write(0x40, 7)), c.next_op());
        for _ in 0..3 {
            match c.next_op() {
                Some(CpuOp::Read(addr)) | Some(CpuOp::Write(addr, _)) => {
                    assert_eq!(0, addr % 8);
                    assert!(addr < 4096);
                }
                None => panic!("random op expected"),
            }
        }
        assert_eq!(None, c.next_op());
    }

    #[test]
    fn cores_get_distinct_streams() {
        let mut a = cpu(8, 0);
        let mut b = cpu(8, 1);
        let xs: Vec<_> = (0..8).filter_map(|_| a.next_op()).collect();
        let ys: Vec<_> = (0..8).filter_map(|_| b.next_op()).collect();
        assert_ne!(xs, ys);
        let mut again = cpu(8, 0);
        let zs: Vec<_> = (0..8).filter_map(|_| again.next_op()).collect();
        assert_eq!(xs, zs);
    }

    #[test]
    fn push_op_wakes_an_idle_cpu_once() {
        let mut c = cpu(0, 0);
        assert!(c.is_quiescent());
        assert!(c.push_op(CpuOp::Read(0)));
        assert!(!c.push_op(CpuOp::Read(8)));
        assert!(!c.is_quiescent());
    }
}
