use std::any::Any;

use anyhow::anyhow;

use crate::base::{Component, Ctx, Event, Payload, PortId};
use crate::hier::message::CoherenceMessage;
use crate::memory::MemResponse;
use crate::sim::stats::StatSet;
use crate::timeq::Cycle;

/// Stand-in for a cache, directory or router port.  Timer `n` sends the `n`th scripted payload;
/// everything delivered to it is logged with its arrival time.
pub struct Endpoint {
    name: String,
    script: Vec<Option<(PortId, Payload)>>,
    pub received: Vec<(Cycle, PortId, Payload)>,
    stats: StatSet,
}

impl Endpoint {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Vec::new(),
            received: Vec::new(),
            stats: StatSet::new(),
        }
    }

    /// Queue `payload` for `port`; returns the timer token that sends it.
    pub fn script(&mut self, port: PortId, payload: Payload) -> u64 {
        self.script.push(Some((port, payload)));
        (self.script.len() - 1) as u64
    }

    pub fn coherence(&self) -> Vec<(Cycle, &CoherenceMessage)> {
        self.received
            .iter()
            .filter_map(|(at, _, payload)| match payload {
                Payload::Coh(msg) => Some((*at, msg)),
                _ => None,
            })
            .collect()
    }

    pub fn packets(&self) -> Vec<(Cycle, u64)> {
        self.received
            .iter()
            .filter_map(|(at, _, payload)| match payload {
                Payload::Packet(packet) => Some((*at, packet.seq)),
                _ => None,
            })
            .collect()
    }

    pub fn memory_responses(&self) -> Vec<(Cycle, &MemResponse)> {
        self.received
            .iter()
            .filter_map(|(at, _, payload)| match payload {
                Payload::MemResp(resp) => Some((*at, resp)),
                _ => None,
            })
            .collect()
    }
}

impl Component for Endpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Timer(token) => {
                let (port, payload) = self
                    .script
                    .get_mut(token as usize)
                    .and_then(Option::take)
                    .ok_or_else(|| anyhow!("{}: nothing scripted for timer {}", self.name, token))?;
                ctx.send(port, payload)
            }
            Event::Link { port, payload } => {
                self.received.push((ctx.now(), port, payload));
                Ok(())
            }
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
