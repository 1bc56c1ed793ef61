use std::any::Any;
use std::collections::HashMap;

use anyhow::{anyhow, bail};
use log::{debug, trace};

use crate::base::{Component, ComponentId, Ctx, Event, Payload, PortId};
use crate::hier::message::CoherenceMessage;
use crate::interconnect::config::BusConfig;
use crate::sim::stats::{StatSet, StatSink};
use crate::timeq::{Backpressure, ServerConfig, ServiceRequest, TimedServer};

/// Port towards the parent cache; children sit on ports `1..=n`.
pub const LOW_PORT: PortId = 0;

pub fn child_port(index: usize) -> PortId {
    index as PortId + 1
}

/// Shared bus between a parent cache and its children.  Each direction carries one message per
/// latency window, first come first served; downward messages are steered by destination id.
pub struct Bus {
    name: String,
    up: TimedServer<()>,
    down: TimedServer<()>,
    routes: HashMap<ComponentId, PortId>,
    stats: StatSet,
}

impl Bus {
    pub fn new(name: impl Into<String>, config: &BusConfig) -> Self {
        let server = ServerConfig {
            base_latency: 0,
            bytes_per_cycle: u32::MAX,
            cycle_time: config.latency().max(1),
            queue_capacity: usize::MAX,
        };
        Self {
            name: name.into(),
            up: TimedServer::new(server),
            down: TimedServer::new(server),
            routes: HashMap::new(),
            stats: StatSet::new(),
        }
    }

    /// Deliver messages addressed to `child` through `port`.
    pub fn add_route(&mut self, child: ComponentId, port: PortId) {
        self.routes.insert(child, port);
    }

    fn forward(&mut self, ctx: &mut Ctx, upward: bool, port: PortId, msg: CoherenceMessage) -> anyhow::Result<()> {
        let now = ctx.now();
        let server = if upward { &mut self.up } else { &mut self.down };
        server.service_ready(now, |_| {});
        let ticket = server
            .try_enqueue(now, ServiceRequest::new((), msg.size_bytes()))
            .map_err(|Backpressure::QueueFull { capacity, .. }| {
                anyhow!("{}: bus queue of {} overflowed", self.name, capacity)
            })?;
        let delay = ticket.ready_at() - now;
        self.stats.record(if upward { "delay_up" } else { "delay_down" }, delay);
        trace!("{} @{}: {} via port {} in {}ps", self.name, now, msg, port, delay);
        ctx.send_after(port, Payload::Coh(msg), delay)
    }
}

impl Component for Bus {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Link {
                port: LOW_PORT,
                payload: Payload::Coh(msg),
            } => {
                debug!("{} @{}: recv {} from below", self.name, ctx.now(), msg);
                let Some(&out) = self.routes.get(&msg.dst) else {
                    bail!("{}: no route to component {} for {}", self.name, msg.dst, msg);
                };
                self.stats.incr("msgs_down");
                self.forward(ctx, false, out, msg)
            }
            Event::Link {
                port,
                payload: Payload::Coh(msg),
            } => {
                debug!("{} @{}: recv {} on port {}", self.name, ctx.now(), msg, port);
                self.stats.incr("msgs_up");
                self.forward(ctx, true, LOW_PORT, msg)
            }
            other => bail!("{}: unexpected {:?}", self.name, other),
        }
    }

    fn stats(&self) -> &StatSet {
        &self.stats
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
