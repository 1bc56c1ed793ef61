use anyhow::{anyhow, bail, Context};
use log::{info, warn};

use crate::base::ComponentId;
use crate::hier::cache::{self, InnerCache};
use crate::hier::cpu::{self, CpuOp, TrafficCpu};
use crate::hier::directory::{self, Directory};
use crate::hier::l1::{self, L1Cache};
use crate::hier::line::LineState;
use crate::hier::message::check_word_access;
use crate::interconnect::bus::{self, Bus};
use crate::interconnect::nic::{self, Nic};
use crate::interconnect::{NetId, Router};
use crate::memory::controller::{self, MemoryController};
use crate::sim::config::SystemConfig;
use crate::sim::simulation::Simulation;
use crate::sim::stats::{RunSummary, StatSet, StatSink};
use crate::timeq::Cycle;

const DIR_NET: NetId = 0;
const L3_NET: NetId = 1;

/// The reference machine: per-core CPU and L1, one bus and L2 per `cores_per_l2` cores, a shared
/// bus into the L3, a two-port network to the directory and the memory behind it.
pub struct System {
    config: SystemConfig,
    sim: Simulation,
    cpus: Vec<ComponentId>,
    l1s: Vec<ComponentId>,
    l2s: Vec<ComponentId>,
    l3: ComponentId,
    directory: ComponentId,
    memory: ComponentId,
}

impl System {
    pub fn build(config: SystemConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let mut sim = Simulation::new();
        let cores = config.sim.num_cores;
        let clusters = cores / config.sim.cores_per_l2;
        let links = &config.links;

        let memory = sim.add(MemoryController::new(
            "memory",
            &config.memory,
            &config.backend,
            config.l1.line_size(),
        ));
        let directory = sim.next_id();
        sim.add(Directory::new("directory", directory, &config.directory));
        let l3 = sim.next_id();
        sim.add(InnerCache::new("l3", l3, directory, &config.l3));
        let l2s: Vec<ComponentId> = (0..clusters)
            .map(|i| {
                let id = sim.next_id();
                sim.add(InnerCache::new(format!("l2_{}", i), id, l3, &config.l2))
            })
            .collect();
        let l1s: Vec<ComponentId> = (0..cores)
            .map(|core| {
                let id = sim.next_id();
                let parent = l2s[core / config.sim.cores_per_l2];
                sim.add(L1Cache::new(format!("l1_{}", core), id, parent, &config.l1))
            })
            .collect();
        let cpus: Vec<ComponentId> = (0..cores)
            .map(|core| sim.add(TrafficCpu::new(format!("cpu{}", core), core, &config.cpu)))
            .collect();

        for core in 0..cores {
            sim.connect((cpus[core], cpu::L1_PORT), (l1s[core], l1::CPU_PORT), links.cpu_l1.0)?;
        }

        for (i, &l2) in l2s.iter().enumerate() {
            let mut l2_bus = Bus::new(format!("bus_l2_{}", i), &config.bus);
            let members = &l1s[i * config.sim.cores_per_l2..(i + 1) * config.sim.cores_per_l2];
            for (slot, &l1) in members.iter().enumerate() {
                l2_bus.add_route(l1, bus::child_port(slot));
            }
            let bus_id = sim.add(l2_bus);
            for (slot, &l1) in members.iter().enumerate() {
                sim.connect((l1, l1::PARENT_PORT), (bus_id, bus::child_port(slot)), links.l1_bus.0)?;
            }
            sim.connect((bus_id, bus::LOW_PORT), (l2, cache::CHILD_PORT), links.bus_l2.0)?;
        }

        let mut l3_bus = Bus::new("bus_l3", &config.bus);
        for (slot, &l2) in l2s.iter().enumerate() {
            l3_bus.add_route(l2, bus::child_port(slot));
        }
        let l3_bus = sim.add(l3_bus);
        for (slot, &l2) in l2s.iter().enumerate() {
            sim.connect((l2, cache::PARENT_PORT), (l3_bus, bus::child_port(slot)), links.l2_bus.0)?;
        }
        sim.connect((l3_bus, bus::LOW_PORT), (l3, cache::CHILD_PORT), links.bus_l3.0)?;

        let mut l3_nic = Nic::new("nic_l3", L3_NET, &config.network);
        l3_nic.add_route(directory, DIR_NET);
        let l3_nic = sim.add(l3_nic);
        let mut dir_nic = Nic::new("nic_dir", DIR_NET, &config.network);
        dir_nic.add_route(l3, L3_NET);
        let dir_nic = sim.add(dir_nic);
        let router = sim.add(Router::new("router", 2, &config.network));

        sim.connect((l3, cache::PARENT_PORT), (l3_nic, nic::LOCAL_PORT), links.l3_nic.0)?;
        sim.connect((l3_nic, nic::NET_PORT), (router, L3_NET), links.nic_router.0)?;
        sim.connect((router, DIR_NET), (dir_nic, nic::NET_PORT), links.router_nic.0)?;
        sim.connect((dir_nic, nic::LOCAL_PORT), (directory, directory::NET_PORT), links.nic_dir.0)?;
        sim.connect((directory, directory::MEM_PORT), (memory, controller::DIR_PORT), links.dir_mem.0)?;

        info!(
            "built {} cores, {} L2s, {} components",
            cores,
            clusters,
            sim.next_id()
        );
        Ok(Self {
            config,
            sim,
            cpus,
            l1s,
            l2s,
            l3,
            directory,
            memory,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    pub fn now(&self) -> Cycle {
        self.sim.now()
    }

    pub fn step(&mut self) -> anyhow::Result<bool> {
        self.sim.step()
    }

    /// Run until nothing is left to do or `sim.max_time` passes.
    pub fn run(&mut self) -> anyhow::Result<Cycle> {
        let end = self.sim.run(self.config.sim.max_time.0)?;
        if !self.sim.is_quiescent() {
            warn!("stopped at {}ps with work in flight: {:?}", end, self.sim.busy_components());
        }
        Ok(end)
    }

    /// Run and require every component to have drained.
    pub fn run_until_quiescent(&mut self) -> anyhow::Result<Cycle> {
        let end = self.sim.run(self.config.sim.max_time.0)?;
        if !self.sim.is_quiescent() {
            bail!("not quiescent at {}ps: {:?} still busy", end, self.sim.busy_components());
        }
        Ok(end)
    }

    pub fn cores(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, core: usize) -> Option<&TrafficCpu> {
        self.sim.component(*self.cpus.get(core)?)
    }

    pub fn l1(&self, core: usize) -> Option<&L1Cache> {
        self.sim.component(*self.l1s.get(core)?)
    }

    pub fn l2(&self, index: usize) -> Option<&InnerCache> {
        self.sim.component(*self.l2s.get(index)?)
    }

    pub fn l3(&self) -> Option<&InnerCache> {
        self.sim.component(self.l3)
    }

    pub fn directory(&self) -> Option<&Directory> {
        self.sim.component(self.directory)
    }

    pub fn memory(&self) -> Option<&MemoryController> {
        self.sim.component(self.memory)
    }

    /// Queue a scripted load or store on `core`, waking its CPU if it was idle.
    pub fn push_op(&mut self, core: usize, op: CpuOp) -> anyhow::Result<()> {
        let addr = match op {
            CpuOp::Read(addr) | CpuOp::Write(addr, _) => addr,
        };
        check_word_access(addr, self.config.l1.line_size())
            .with_context(|| format!("core {} op rejected", core))?;
        let id = *self
            .cpus
            .get(core)
            .ok_or_else(|| anyhow!("no core {}", core))?;
        let cpu = self
            .sim
            .component_mut::<TrafficCpu>(id)
            .context("cpu component has the wrong type")?;
        if cpu.push_op(op) {
            self.sim.schedule(id, 0, cpu::TICK);
        }
        Ok(())
    }

    /// Cores whose L1 holds `addr` in M.
    pub fn modified_holders(&self, addr: u64) -> Vec<usize> {
        (0..self.cores())
            .filter(|&core| self.l1(core).is_some_and(|l1| l1.state_of(addr) == LineState::Modified))
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = self.sim.collect_stats();
        if let Some(memory) = self.memory() {
            let backend = memory.backend();
            let mut stats = StatSet::new();
            stats.record("accepted", backend.accepted());
            stats.record("completed", backend.completed());
            stats.record("reads", backend.reads());
            stats.record("writes", backend.writes());
            stats.record("peak_outstanding", backend.peak_outstanding() as u64);
            summary.components.insert("backend".to_string(), stats);
        }
        summary
    }
}
