// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use std::time::Duration;

use scx_wrr_core::*;
use simplelog::ConfigBuilder;
use simplelog::LevelFilter;
use simplelog::TestLogger;

/// Initialize logging for a test. Verbosity follows `WRR_TEST_LOG`
/// ("debug", "trace", ...), warnings only otherwise. Repeated calls in the
/// same process are ignored.
pub fn setup_test() {
    let level = std::env::var("WRR_TEST_LOG")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(LevelFilter::Warn);
    let config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Error)
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    let _ = TestLogger::init(level, config);
}

/// Config with a small quantum so scenarios stay short.
pub fn config(base_quantum: u32, balance_ms: u64) -> WrrConfig {
    WrrConfig {
        base_quantum,
        balance_interval: Duration::from_millis(balance_ms),
        ..Default::default()
    }
}

pub fn mask(nr_cpus: usize, cpus: &[usize]) -> Cpumask {
    let mut mask = Cpumask::new(nr_cpus);
    for &cpu in cpus {
        mask.set_cpu(cpu).unwrap();
    }
    mask
}

/// Every CPU's published load equals the weight of its linked WRR entities.
pub fn assert_accounting(cluster: &Cluster) {
    for core in cluster.cores() {
        let rq = core.lock();
        let linked: Vec<&Task> = rq
            .tasks
            .values()
            .filter(|t| t.is_wrr() && t.wrr.on_rq)
            .collect();
        let weight: u64 = linked.iter().map(|t| t.wrr.weight as u64).sum();
        assert_eq!(rq.wrr.nr_running() as usize, linked.len(), "cpu {}", rq.cpu);
        assert_eq!(rq.wrr.total_weight(), weight, "cpu {}", rq.cpu);
        assert_eq!(core.load(), weight, "cpu {} published load", rq.cpu);
        for pid in rq.wrr.iter() {
            assert!(linked.iter().any(|t| t.pid == pid), "cpu {} stray {}", rq.cpu, pid);
        }
    }
}

/// Times at which `pid` was scheduled and preempted, in trace order.
pub fn turns(trace: &Trace, pid: Pid) -> Vec<(TimeNs, TimeNs)> {
    let mut out = vec![];
    let mut start = None;
    for e in trace.events() {
        match e.kind {
            TraceKind::Scheduled { pid: p } if p == pid => start = Some(e.time_ns),
            TraceKind::Preempted { pid: p } if p == pid => {
                if let Some(s) = start.take() {
                    out.push((s, e.time_ns));
                }
            }
            _ => {}
        }
    }
    out
}
