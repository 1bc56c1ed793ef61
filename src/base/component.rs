use std::any::Any;

use anyhow::anyhow;

use crate::base::link::{LinkTable, PortRef};
use crate::hier::message::{CoherenceMessage, CpuRequest, CpuResponse};
use crate::interconnect::Packet;
use crate::memory::{MemRequest, MemResponse};
use crate::sim::stats::StatSet;
use crate::timeq::{Cycle, EventId, EventQueue};

pub type ComponentId = usize;
pub type PortId = u32;

/// Everything that can travel over a link.
#[derive(Debug, Clone)]
pub enum Payload {
    Cpu(CpuRequest),
    CpuResp(CpuResponse),
    Coh(CoherenceMessage),
    MemReq(MemRequest),
    MemResp(MemResponse),
    Packet(Packet),
    Credit { bytes: u32 },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Cpu(_) => "cpu",
            Payload::CpuResp(_) => "cpu_resp",
            Payload::Coh(_) => "coh",
            Payload::MemReq(_) => "mem_req",
            Payload::MemResp(_) => "mem_resp",
            Payload::Packet(_) => "packet",
            Payload::Credit { .. } => "credit",
        }
    }
}

#[derive(Debug)]
pub enum Event {
    /// A payload arriving on one of the component's ports.
    Link { port: PortId, payload: Payload },
    /// A callback the component scheduled for itself.
    Timer(u64),
}

#[derive(Debug)]
pub struct Delivery {
    pub target: ComponentId,
    pub event: Event,
}

/// Handle a component uses to talk to the kernel while it handles one event.
pub struct Ctx<'a> {
    id: ComponentId,
    now: Cycle,
    queue: &'a mut EventQueue<Delivery>,
    links: &'a LinkTable,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        id: ComponentId,
        queue: &'a mut EventQueue<Delivery>,
        links: &'a LinkTable,
    ) -> Self {
        let now = queue.now();
        Self {
            id,
            now,
            queue,
            links,
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    pub fn send(&mut self, port: PortId, payload: Payload) -> anyhow::Result<()> {
        self.send_after(port, payload, 0)
    }

    /// Deliver `payload` to the other end of `port` after `delay` plus the link latency.
    pub fn send_after(&mut self, port: PortId, payload: Payload, delay: Cycle) -> anyhow::Result<()> {
        let peer = self
            .links
            .peer(PortRef::new(self.id, port))
            .ok_or_else(|| anyhow!("component {} sent on unbound port {}", self.id, port))?;
        self.queue.push_after(
            delay.saturating_add(peer.latency),
            Delivery {
                target: peer.endpoint.component,
                event: Event::Link {
                    port: peer.endpoint.port,
                    payload,
                },
            },
        );
        Ok(())
    }

    pub fn schedule(&mut self, delay: Cycle, token: u64) -> EventId {
        self.queue.push_after(
            delay,
            Delivery {
                target: self.id,
                event: Event::Timer(token),
            },
        )
    }

    /// Wake this component at absolute time `at`, which must not be in the past.
    pub fn schedule_at(&mut self, at: Cycle, token: u64) -> anyhow::Result<EventId> {
        self.queue.push(
            at,
            Delivery {
                target: self.id,
                event: Event::Timer(token),
            },
        )
    }

    pub fn cancel(&mut self, id: EventId) -> bool {
        self.queue.cancel(id)
    }
}

pub trait Component: Any {
    fn name(&self) -> &str;

    /// Called once before the first event is dispatched.
    fn setup(&mut self, _ctx: &mut Ctx) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()>;

    fn stats(&self) -> &StatSet;

    /// True when the component holds no in-flight work.
    fn is_quiescent(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
