use std::any::Any;

use anyhow::{anyhow, bail};
use log::{debug, trace};

use crate::base::{Component, Ctx, Event, Payload, PortId};
use crate::interconnect::config::NetworkConfig;
use crate::interconnect::Packet;
use crate::sim::stats::{StatSet, StatSink};
use crate::sim::units::Bandwidth;
use crate::timeq::{ServerConfig, ServiceRequest, TimedServer};

const XBAR_DONE: u64 = 0;

fn bandwidth_server(bw: Bandwidth) -> ServerConfig {
    ServerConfig {
        base_latency: 0,
        bytes_per_cycle: 1,
        cycle_time: bw.transfer_time(1).max(1),
        queue_capacity: usize::MAX,
    }
}

/// Single crossbar router.  Port `n` leads to the NIC with network id `n`.  A packet crosses the
/// crossbar, returns its credit to the input port, then serialises onto its output link.
pub struct Router {
    name: String,
    xbar: TimedServer<(PortId, Packet)>,
    outputs: Vec<TimedServer<()>>,
    stats: StatSet,
}

impl Router {
    pub fn new(name: impl Into<String>, ports: usize, config: &NetworkConfig) -> Self {
        Self {
            name: name.into(),
            xbar: TimedServer::new(bandwidth_server(config.xbar_bw)),
            outputs: (0..ports)
                .map(|_| TimedServer::new(bandwidth_server(config.link_bw)))
                .collect(),
            stats: StatSet::new(),
        }
    }

    pub fn ports(&self) -> usize {
        self.outputs.len()
    }

    fn traverse(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        let now = ctx.now();
        let mut crossed = Vec::new();
        self.xbar.service_ready(now, |done| crossed.push(done.payload));
        for (input, packet) in crossed {
            ctx.send(input, Payload::Credit { bytes: packet.bytes })?;
            let out = packet.dst_net as PortId;
            let server = self
                .outputs
                .get_mut(out as usize)
                .ok_or_else(|| anyhow!("{}: no output port {} for packet #{}", self.name, out, packet.seq))?;
            server.service_ready(now, |_| {});
            let ticket = server
                .try_enqueue(now, ServiceRequest::new((), packet.bytes))
                .map_err(|_| anyhow!("{}: output {} overflowed", self.name, out))?;
            let delay = ticket.ready_at() - now;
            self.stats.record("output_delay", delay);
            trace!("{} @{}: #{} {} -> {} in {}ps", self.name, now, packet.seq, input, out, delay);
            ctx.send_after(out, Payload::Packet(packet), delay)?;
        }
        Ok(())
    }
}

impl Component for Router {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Link {
                port,
                payload: Payload::Packet(packet),
            } => {
                debug!("{} @{}: #{} in on port {}", self.name, ctx.now(), packet.seq, port);
                self.stats.incr("packets");
                self.stats.record("flits", packet.flits as u64);
                let bytes = packet.bytes;
                let ticket = self
                    .xbar
                    .try_enqueue(ctx.now(), ServiceRequest::new((port, packet), bytes))
                    .map_err(|_| anyhow!("{}: crossbar overflowed", self.name))?;
                ctx.schedule_at(ticket.ready_at(), XBAR_DONE)?;
                Ok(())
            }
            Event::Timer(XBAR_DONE) => self.traverse(ctx),
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
        self.xbar.outstanding() == 0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
