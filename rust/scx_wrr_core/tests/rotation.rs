// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use scx_wrr_core::*;

mod common;

fn spin(weight: u32) -> Workload {
    Workload::Spin { weight, cpus: None }
}

/// Equal weights on one CPU take turns in admission order.
#[test]
fn test_fifo_rotation() {
    common::setup_test();
    let cluster = Cluster::new(1, common::config(1, 2000)).unwrap();
    let mut sim = Simulator::new(cluster);
    let pids: Vec<Pid> = (0..4).map(|_| sim.spawn(0, &spin(1)).unwrap()).collect();
    sim.run_ticks(12).unwrap();

    let order: Vec<Pid> = sim
        .trace()
        .events()
        .iter()
        .filter_map(|e| match e.kind {
            TraceKind::Scheduled { pid } => Some(pid),
            _ => None,
        })
        .collect();
    let expected: Vec<Pid> = pids.iter().cycle().take(12).copied().collect();
    assert_eq!(order, expected);
    common::assert_accounting(sim.cluster());
}

/// A task of weight w keeps the CPU for exactly w * base_quantum ticks.
#[test]
fn test_turn_length_follows_weight() {
    common::setup_test();
    let cluster = Cluster::new(1, WrrConfig::default()).unwrap();
    let tick = cluster.config().tick_ns();
    let mut sim = Simulator::new(cluster);
    let a = sim.spawn(0, &spin(3)).unwrap();
    let b = sim.spawn(0, &spin(1)).unwrap();
    sim.run_ticks(200).unwrap();
    sim.trace().dump();

    let ta = common::turns(sim.trace(), a);
    let tb = common::turns(sim.trace(), b);
    assert!(ta.len() >= 4, "a got {} turns", ta.len());
    assert!(tb.len() >= 4, "b got {} turns", tb.len());
    for (start, end) in ta {
        assert_eq!(end - start, 30 * tick);
    }
    for (start, end) in tb {
        assert_eq!(end - start, 10 * tick);
    }
    // 3:1 split of the CPU over whole rounds.
    let (ra, rb) = (sim.trace().total_runtime(a), sim.trace().total_runtime(b));
    assert_eq!(ra + rb, 199 * tick);
    assert!(ra >= 3 * (rb - 10 * tick), "a={ra} b={rb}");
}

/// A single runnable task is never preempted, its slice just refills.
#[test]
fn test_lone_task_keeps_cpu() {
    common::setup_test();
    let cluster = Cluster::new(1, common::config(1, 2000)).unwrap();
    let mut sim = Simulator::new(cluster);
    let pid = sim.spawn(0, &spin(2)).unwrap();
    // First tick schedules it, the next 50 charge it.
    sim.run_ticks(51).unwrap();
    assert_eq!(sim.trace().schedule_count(pid), 1);
    assert!(common::turns(sim.trace(), pid).is_empty());
    assert_eq!(sim.cluster().task(pid).unwrap().wrr.time_slice, 2);
}

/// Yielding gives up the CPU but keeps what is left of the slice.
#[test]
fn test_yield_keeps_slice() {
    common::setup_test();
    let cluster = Cluster::new(1, WrrConfig::default()).unwrap();
    let tick = cluster.config().tick_ns();
    let mut sim = Simulator::new(cluster);
    let a = sim.spawn(0, &spin(5)).unwrap();
    let b = sim.spawn(0, &spin(5)).unwrap();

    sim.run_ticks(3).unwrap();
    assert_eq!(sim.cluster().current(CpuId(0)), Some(a));
    assert_eq!(sim.yield_cpu(CpuId(0)).unwrap(), Some(b));
    assert_eq!(sim.cluster().task(a).unwrap().wrr.time_slice, 48);

    sim.run_ticks(120).unwrap();
    let tb = common::turns(sim.trace(), b);
    assert_eq!(tb[0], (3 * tick, 53 * tick));
    let ta = common::turns(sim.trace(), a);
    assert_eq!(ta[0], (53 * tick, 101 * tick));
    assert!(sim
        .trace()
        .events()
        .iter()
        .any(|e| e.kind == TraceKind::Yielded { pid: a }));
}

/// Accounting holds through every kind of state change.
#[test]
fn test_accounting_under_churn() {
    common::setup_test();
    let c = Cluster::new(4, common::config(1, 1)).unwrap();
    let root = Credentials::root(Pid(1));
    let mut lb = LoadBalancer::new();
    let tick = c.config().tick_ns();

    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move |n: u64| {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed % n
    };

    let mut live: Vec<Pid> = vec![];
    for step in 1..=400u64 {
        match next(8) {
            0 | 1 => {
                let w = next(20) as u32 + 1;
                let spec = if next(4) == 0 {
                    let cpu = next(4) as usize;
                    TaskSpec::wrr("pinned", 0)
                        .weight(w)
                        .cpus(common::mask(4, &[cpu]))
                } else {
                    TaskSpec::wrr("free", 0).weight(w)
                };
                live.push(c.admit(spec).unwrap());
            }
            2 if !live.is_empty() => {
                let pid = live[next(live.len() as u64) as usize];
                c.sleep(pid).unwrap();
            }
            3 if !live.is_empty() => {
                let pid = live[next(live.len() as u64) as usize];
                c.wake(pid).unwrap();
            }
            4 if !live.is_empty() => {
                let pid = live[next(live.len() as u64) as usize];
                let w = next(20) as i64 + 1;
                let _ = set_weight(&c, &root, pid.0 as i64, w);
            }
            5 if !live.is_empty() => {
                let pid = live[next(live.len() as u64) as usize];
                let policy = if next(2) == 0 { Policy::Normal } else { Policy::Wrr };
                c.set_scheduler(pid, policy).unwrap();
            }
            6 if live.len() > 4 => {
                let pid = live.swap_remove(next(live.len() as u64) as usize);
                c.exit(pid).unwrap();
            }
            _ => {
                lb.load_balance(&c).unwrap();
            }
        }
        for cpu in 0..4 {
            c.tick(CpuId(cpu), step * tick).unwrap();
        }
        common::assert_accounting(&c);
    }
    assert_eq!(c.nr_tasks(), live.len());
}
