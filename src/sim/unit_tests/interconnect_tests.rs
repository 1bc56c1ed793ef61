use super::endpoint::Endpoint;
use crate::base::{ComponentId, Payload};
use crate::hier::message::{CohKind, CoherenceMessage};
use crate::interconnect::bus::{self, Bus};
use crate::interconnect::config::{BusConfig, NetworkConfig};
use crate::interconnect::nic::{self, Nic};
use crate::interconnect::Router;
use crate::sim::units::{Bandwidth, Bytes};
use crate::sim::Simulation;
use crate::timeq::Cycle;

// 72-byte packets: 1000ps to inject, 72ps across the crossbar and again on the output link
fn network() -> NetworkConfig {
    NetworkConfig {
        network_bw: Bandwidth::gb_per_sec(72),
        xbar_bw: Bandwidth::gb_per_sec(1000),
        link_bw: Bandwidth::gb_per_sec(1000),
        ..NetworkConfig::default()
    }
}

fn request(kind: CohKind, src: ComponentId, dst: ComponentId, addr: u64) -> Payload {
    Payload::Coh(CoherenceMessage::new(kind, src, dst, addr))
}

fn arrivals(sim: &Simulation, id: ComponentId) -> Vec<(Cycle, CohKind, u64)> {
    sim.component::<Endpoint>(id)
        .unwrap()
        .coherence()
        .into_iter()
        .map(|(at, msg)| (at, msg.kind, msg.addr))
        .collect()
}

#[test]
fn bus_serialises_each_direction_first_come_first_served() {
    let mut sim = Simulation::new();
    let parent = sim.next_id();
    let (c0, c1) = (parent + 1, parent + 2);

    let mut top = Endpoint::new("parent");
    let inv = top.script(0, request(CohKind::Inv, parent, c1, 0x80));
    let mut left = Endpoint::new("c0");
    let first = left.script(0, request(CohKind::GetS, c0, parent, 0x0));
    let third = left.script(0, request(CohKind::GetM, c0, parent, 0x100));
    let mut right = Endpoint::new("c1");
    let second = right.script(0, request(CohKind::GetS, c1, parent, 0x40));
    assert_eq!(parent, sim.add(top));
    assert_eq!(c0, sim.add(left));
    assert_eq!(c1, sim.add(right));

    // 2GHz, one cycle per message
    let mut shared = Bus::new("bus", &BusConfig::default());
    shared.add_route(c0, bus::child_port(0));
    shared.add_route(c1, bus::child_port(1));
    let shared = sim.add(shared);
    sim.connect((c0, 0), (shared, bus::child_port(0)), 10).unwrap();
    sim.connect((c1, 0), (shared, bus::child_port(1)), 10).unwrap();
    sim.connect((shared, bus::LOW_PORT), (parent, 0), 10).unwrap();

    sim.schedule(c0, 0, first);
    sim.schedule(c1, 0, second);
    sim.schedule(parent, 0, inv);
    sim.schedule(c0, 0, third);
    sim.run(0).unwrap();

    assert_eq!(
        vec![
            (520, CohKind::GetS, 0x0),
            (1020, CohKind::GetS, 0x40),
            (1520, CohKind::GetM, 0x100),
        ],
        arrivals(&sim, parent)
    );
    // the downward direction is not held up by the upward queue
    assert_eq!(vec![(520, CohKind::Inv, 0x80)], arrivals(&sim, c1));
    assert!(arrivals(&sim, c0).is_empty());
    assert_eq!(3, sim.component_stats(shared).unwrap().count("msgs_up"));
}

#[test]
fn network_delivers_in_order_between_a_pair() {
    let net = network();
    let mut sim = Simulation::new();
    let src = sim.next_id();
    let dst = src + 1;

    let mut sender = Endpoint::new("src");
    let tokens: Vec<u64> = [0x0, 0x40, 0x80]
        .into_iter()
        .map(|addr| sender.script(0, request(CohKind::GetS, src, dst, addr)))
        .collect();
    assert_eq!(src, sim.add(sender));
    assert_eq!(dst, sim.add(Endpoint::new("dst")));

    let mut nic0 = Nic::new("nic0", 0, &net);
    nic0.add_route(dst, 1);
    let nic0 = sim.add(nic0);
    let mut nic1 = Nic::new("nic1", 1, &net);
    nic1.add_route(src, 0);
    let nic1 = sim.add(nic1);
    let router = sim.add(Router::new("router", 2, &net));

    sim.connect((src, 0), (nic0, nic::LOCAL_PORT), 1).unwrap();
    sim.connect((nic0, nic::NET_PORT), (router, 0), 1).unwrap();
    sim.connect((router, 1), (nic1, nic::NET_PORT), 1).unwrap();
    sim.connect((nic1, nic::LOCAL_PORT), (dst, 0), 1).unwrap();

    for token in tokens {
        sim.schedule(src, 0, token);
    }
    sim.run(0).unwrap();

    assert_eq!(
        vec![
            (1148, CohKind::GetS, 0x0),
            (2148, CohKind::GetS, 0x40),
            (3148, CohKind::GetS, 0x80),
        ],
        arrivals(&sim, dst)
    );
    // every credit came back
    assert_eq!(net.input_buf_size.0 as u32, sim.component::<Nic>(nic0).unwrap().credits());
    assert!(sim.is_quiescent());
}

#[test]
fn nic_waits_for_credit_and_output_space() {
    let net = NetworkConfig {
        input_buf_size: Bytes(72),
        output_buf_size: Bytes(72),
        ..network()
    };
    let mut sim = Simulation::new();
    let src = sim.next_id();
    let sink = src + 1;

    let mut sender = Endpoint::new("src");
    let tokens: Vec<u64> = [0x0, 0x40, 0x80]
        .into_iter()
        .map(|addr| sender.script(0, request(CohKind::GetS, src, sink, addr)))
        .collect();
    let mut router_port = Endpoint::new("router_port");
    let early = router_port.script(0, Payload::Credit { bytes: 72 });
    let late = router_port.script(0, Payload::Credit { bytes: 72 });
    assert_eq!(src, sim.add(sender));
    assert_eq!(sink, sim.add(router_port));

    let mut nic0 = Nic::new("nic0", 0, &net);
    nic0.add_route(sink, 1);
    let nic0 = sim.add(nic0);
    sim.connect((src, 0), (nic0, nic::LOCAL_PORT), 1).unwrap();
    sim.connect((nic0, nic::NET_PORT), (sink, 0), 1).unwrap();

    for token in tokens {
        sim.schedule(src, 0, token);
    }
    sim.schedule(sink, 5_000, early);
    sim.schedule(sink, 8_000, late);
    sim.run(0).unwrap();

    // one packet of credit: each injection waits for the previous packet's credit
    assert_eq!(
        vec![(1002, 1), (6002, 2), (9002, 3)],
        sim.component::<Endpoint>(sink).unwrap().packets()
    );
    let stats = sim.component_stats(nic0).unwrap();
    assert_eq!(2, stats.count("credit_stall"));
    assert_eq!(3, stats.count("output_buffer_full"));
    assert_eq!(0, sim.component::<Nic>(nic0).unwrap().credits());
}
