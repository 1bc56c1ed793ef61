use std::any::Any;
use std::collections::{HashMap, VecDeque};

use anyhow::bail;
use log::{debug, trace, warn};

use crate::base::{Component, ComponentId, Ctx, Event, Payload, PortId};
use crate::hier::message::CoherenceMessage;
use crate::interconnect::config::NetworkConfig;
use crate::interconnect::{NetId, Packet};
use crate::sim::stats::{StatSet, StatSink};
use crate::sim::units::Bandwidth;
use crate::timeq::{BoundedBuffer, Cycle};

/// Towards the attached endpoint (cache or directory).
pub const LOCAL_PORT: PortId = 0;
/// Towards the router.
pub const NET_PORT: PortId = 1;

const TX_DONE: u64 = 0;

/// Network interface: packetises coherence messages, holds them in a byte-bounded output buffer
/// and injects them one at a time while the router has credit for them.
pub struct Nic {
    name: String,
    net_id: NetId,
    routes: HashMap<ComponentId, NetId>,
    flit_size: u32,
    network_bw: Bandwidth,
    pending: VecDeque<Packet>,
    out_buf: BoundedBuffer<Packet>,
    credits: u32,
    transmitting: bool,
    seq: u64,
    stats: StatSet,
}

impl Nic {
    pub fn new(name: impl Into<String>, net_id: NetId, config: &NetworkConfig) -> Self {
        Self {
            name: name.into(),
            net_id,
            routes: HashMap::new(),
            flit_size: config.flit_size.0 as u32,
            network_bw: config.network_bw,
            pending: VecDeque::new(),
            out_buf: BoundedBuffer::with_byte_limit(usize::MAX, Some(config.output_buf_size.0 as u32)),
            credits: config.input_buf_size.0 as u32,
            transmitting: false,
            seq: 0,
            stats: StatSet::new(),
        }
    }

    pub fn net_id(&self) -> NetId {
        self.net_id
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// Messages for `dst` leave towards network id `net`.
    pub fn add_route(&mut self, dst: ComponentId, net: NetId) {
        self.routes.insert(dst, net);
    }

    fn packetize(&mut self, msg: CoherenceMessage) -> anyhow::Result<Packet> {
        let Some(&dst_net) = self.routes.get(&msg.dst) else {
            bail!("{}: no network route to component {}", self.name, msg.dst);
        };
        let flits = msg.size_bytes().div_ceil(self.flit_size.max(1));
        self.seq += 1;
        Ok(Packet {
            src_net: self.net_id,
            dst_net,
            seq: self.seq,
            msg,
            flits,
            bytes: flits * self.flit_size,
        })
    }

    fn pump(&mut self, ctx: &mut Ctx) -> anyhow::Result<()> {
        while let Some(packet) = self.pending.pop_front() {
            let bytes = packet.bytes;
            if let Err((packet, _)) = self.out_buf.try_push(packet, bytes) {
                self.pending.push_front(packet);
                self.stats.incr("output_buffer_full");
                break;
            }
        }
        if self.transmitting {
            return Ok(());
        }
        let Some((_, bytes)) = self.out_buf.front() else {
            return Ok(());
        };
        if bytes > self.credits {
            self.stats.incr("credit_stall");
            trace!("{} @{}: waiting for {} bytes of credit", self.name, ctx.now(), bytes);
            return Ok(());
        }
        let Some((packet, bytes)) = self.out_buf.pop_front() else {
            return Ok(());
        };
        self.credits -= bytes;
        self.transmitting = true;
        let serialise: Cycle = self.network_bw.transfer_time(bytes as u64);
        self.stats.record("flits_sent", packet.flits as u64);
        debug!("{} @{}: inject #{} {} ({} flits)", self.name, ctx.now(), packet.seq, packet.msg, packet.flits);
        ctx.send_after(NET_PORT, Payload::Packet(packet), serialise)?;
        ctx.schedule(serialise, TX_DONE);
        Ok(())
    }
}

impl Component for Nic {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, event: Event, ctx: &mut Ctx) -> anyhow::Result<()> {
        match event {
            Event::Link {
                port: LOCAL_PORT,
                payload: Payload::Coh(msg),
            } => {
                let packet = self.packetize(msg)?;
                self.pending.push_back(packet);
                self.pump(ctx)
            }
            Event::Link {
                port: NET_PORT,
                payload: Payload::Packet(packet),
            } => {
                if packet.dst_net != self.net_id {
                    warn!("{}: packet for net {} delivered to net {}", self.name, packet.dst_net, self.net_id);
                    bail!("{}: misrouted packet #{} from net {}", self.name, packet.seq, packet.src_net);
                }
                self.stats.incr("packets_received");
                debug!("{} @{}: eject #{} {}", self.name, ctx.now(), packet.seq, packet.msg);
                ctx.send(LOCAL_PORT, Payload::Coh(packet.msg))
            }
            Event::Link {
                port: NET_PORT,
                payload: Payload::Credit { bytes },
            } => {
                self.credits += bytes;
                self.pump(ctx)
            }
            Event::Timer(TX_DONE) => {
                self.transmitting = false;
                self.pump(ctx)
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
        self.pending.is_empty() && self.out_buf.is_empty() && !self.transmitting
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
