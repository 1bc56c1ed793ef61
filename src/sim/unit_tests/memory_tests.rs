use super::endpoint::Endpoint;
use crate::base::{ComponentId, Payload};
use crate::memory::config::{BackendConfig, MemoryConfig};
use crate::memory::controller::{self, MemoryController};
use crate::memory::MemRequest;
use crate::sim::units::Bytes;
use crate::sim::Simulation;

fn read(id: u64, addr: u64, src: ComponentId) -> Payload {
    Payload::MemReq(MemRequest {
        id,
        addr,
        write: false,
        size: 64,
        data: None,
        src,
    })
}

/// A directory stand-in wired to a controller; each payload is sent at t=0 in order.
fn with_controller(
    memory: MemoryConfig,
    backend: BackendConfig,
    requests: impl FnOnce(ComponentId) -> Vec<Payload>,
) -> (Simulation, ComponentId, ComponentId) {
    let mut sim = Simulation::new();
    let dir = sim.next_id();
    let mut stand_in = Endpoint::new("directory");
    let tokens: Vec<u64> = requests(dir)
        .into_iter()
        .map(|payload| stand_in.script(0, payload))
        .collect();
    sim.add(stand_in);
    let mem = sim.add(MemoryController::new("memory", &memory, &backend, 64));
    sim.connect((dir, 0), (mem, controller::DIR_PORT), 1).unwrap();
    for token in tokens {
        sim.schedule(dir, 0, token);
    }
    (sim, dir, mem)
}

#[test]
fn full_backend_queue_blocks_the_head_and_keeps_order() {
    let backend = BackendConfig {
        queue_depth: 64,
        max_requests_per_cycle: 0,
        ..BackendConfig::default()
    };
    let (mut sim, dir, mem) = with_controller(MemoryConfig::default(), backend, |dir| {
        (0..128).map(|i| read(i, i * 64, dir)).collect()
    });
    sim.run(0).unwrap();

    let responses = sim.component::<Endpoint>(dir).unwrap().memory_responses();
    let ids: Vec<u64> = responses.iter().map(|(_, resp)| resp.id).collect();
    assert_eq!((0..128).collect::<Vec<_>>(), ids);
    // first 64 issue on the 1ns edge and finish 33ns later; the rest wait for that
    assert!(responses[..64].iter().all(|(at, _)| *at == 34_001));
    assert!(responses[64..].iter().all(|(at, _)| *at == 67_001));

    let stats = sim.component_stats(mem).unwrap();
    // one rejected retry on every edge from 1ns to 33ns
    assert_eq!(33, stats.count("reject_QueueFull"));
    assert_eq!(128, stats.count("parts_issued"));

    let backend = sim.component::<MemoryController>(mem).unwrap().backend();
    assert_eq!(64, backend.peak_outstanding());
    assert_eq!(128, backend.accepted());
    assert_eq!(backend.accepted(), backend.completed());
    assert!(sim.is_quiescent());
}

#[test]
fn split_request_replies_after_its_last_part() {
    let memory = MemoryConfig {
        request_width: Bytes(32),
        ..MemoryConfig::default()
    };
    let (mut sim, dir, mem) = with_controller(memory, BackendConfig::default(), |dir| {
        vec![Payload::MemReq(MemRequest {
            id: 7,
            addr: 0x40,
            write: true,
            size: 64,
            data: Some(vec![0xab; 64]),
            src: dir,
        })]
    });
    sim.run(0).unwrap();

    let responses = sim.component::<Endpoint>(dir).unwrap().memory_responses();
    assert_eq!(1, responses.len());
    let (at, resp) = responses[0];
    assert_eq!(7, resp.id);
    assert!(resp.write);
    // both halves land on the same bank, so the second waits 30 bank cycles for the first
    assert_eq!(64_001, at);

    let controller = sim.component::<MemoryController>(mem).unwrap();
    assert_eq!(vec![0xab; 64], controller.backing().read(0x40, 64));
    assert_eq!(2, sim.component_stats(mem).unwrap().count("parts_issued"));
}

#[test]
fn request_outside_the_range_is_fatal() {
    let memory = MemoryConfig {
        addr_range_end: 0xFFF,
        ..MemoryConfig::default()
    };
    let (mut sim, _, _) = with_controller(memory, BackendConfig::default(), |dir| vec![read(1, 0x1000, dir)]);
    assert!(sim.run(0).is_err());
}
