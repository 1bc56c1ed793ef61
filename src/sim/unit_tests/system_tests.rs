use crate::hier::cpu::CpuOp;
use crate::sim::config::SystemConfig;
use crate::sim::units::Bytes;
use crate::sim::System;

fn scripted(f: impl FnOnce(&mut SystemConfig)) -> System {
    let mut config = SystemConfig::default();
    config.cpu.num_loadstore = 0;
    f(&mut config);
    System::build(config).expect("system should build")
}

#[test]
fn builds_the_reference_topology() {
    let system = scripted(|_| {});
    assert_eq!(4, system.cores());
    assert!(system.l1(3).is_some());
    assert!(system.l2(1).is_some());
    assert!(system.l2(2).is_none());
    assert!(system.l3().is_some());
    assert!(system.directory().is_some());
    assert!(system.memory().is_some());
}

#[test]
fn invalid_config_is_rejected_before_building() {
    let mut config = SystemConfig::default();
    config.l1.associativity = 0;
    assert!(System::build(config).is_err());
}

#[test]
fn single_write_then_read_reaches_memory_once() {
    let mut system = scripted(|_| {});
    system.push_op(0, CpuOp::Write(0x1000, 0xbeef)).unwrap();
    system.push_op(0, CpuOp::Read(0x1000)).unwrap();
    system.run_until_quiescent().unwrap();

    let done = system.cpu(0).unwrap().completed();
    assert_eq!(2, done.len());
    let read = done.iter().find(|resp| !resp.write).unwrap();
    assert_eq!(0xbeef, read.value);
    assert_eq!(vec![0], system.modified_holders(0x1000));

    let summary = system.summary();
    assert_eq!(1, summary.components["directory"].count("mem_reads"));
    assert_eq!(1, summary.components["backend"].sum("accepted"));
}

#[test]
fn word_crossing_a_line_is_rejected_up_front() {
    let mut system = scripted(|_| {});
    assert!(system.push_op(0, CpuOp::Write(0x103C, 7)).is_err());
    assert!(system.push_op(0, CpuOp::Read(0x107F)).is_err());
    system.push_op(0, CpuOp::Write(0x1038, 7)).unwrap();
    system.run_until_quiescent().unwrap();
    let done = system.cpu(0).unwrap().completed();
    assert_eq!(1, done.len());
    assert_eq!(0x1038, done[0].addr);
}

#[test]
fn mshr_occupancy_is_bounded_and_misses_stall() {
    let mut system = scripted(|c| c.l1.mshr_num_entries = 2);
    for i in 0..10u64 {
        system.push_op(1, CpuOp::Read(0x2000 + i * 64)).unwrap();
    }
    system.run_until_quiescent().unwrap();

    let l1 = system.l1(1).unwrap().controller();
    assert_eq!(2, l1.mshr().capacity());
    assert!(l1.mshr().peak() <= 2);
    assert!(l1.stats().count("mshr_stall") > 0);
    assert_eq!(10, system.cpu(1).unwrap().completed().len());
}

#[test]
fn random_traffic_drains_without_losing_requests() {
    let mut system = scripted(|c| {
        c.cpu.num_loadstore = 200;
        c.cpu.mem_size = Bytes::kib(256);
        c.directory.entry_cache_size = 64;
    });
    system.run_until_quiescent().unwrap();

    for core in 0..system.cores() {
        assert_eq!(200, system.cpu(core).unwrap().completed().len());
    }
    let backend = system.memory().unwrap().backend();
    assert!(backend.accepted() > 0);
    assert_eq!(backend.accepted(), backend.completed());
    assert!(backend.peak_outstanding() <= system.config().backend.queue_depth);
    assert!(system.directory().unwrap().controller().cached_entries() <= 64);

    let summary = system.summary();
    assert_eq!(800, summary.total("cpu", "reads") + summary.total("cpu", "writes"));
    assert!(summary.total("l1", "evict_M") + summary.total("l1", "evict_S") > 0);
}

#[test]
fn same_seed_gives_the_same_run() {
    let run = || {
        let mut system = scripted(|c| {
            c.cpu.num_loadstore = 50;
            c.cpu.mem_size = Bytes::kib(16);
        });
        let end = system.run_until_quiescent().unwrap();
        (end, system.simulation().events())
    };
    assert_eq!(run(), run());
}

#[test]
fn time_limit_stops_a_busy_run() {
    let mut system = scripted(|c| {
        c.cpu.num_loadstore = 1000;
        c.sim.max_time = crate::sim::units::Latency::ns(1_000);
    });
    let end = system.run().unwrap();
    assert!(end <= 1_000_000);
    assert!(!system.simulation().is_quiescent());
    assert!(system.run_until_quiescent().is_err());
}
