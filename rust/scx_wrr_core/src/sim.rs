// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Lockstep simulator
//!
//! Drives a `Cluster` in virtual time. Every step advances the clock by one
//! tick and ticks each online CPU in index order, so a given scenario always
//! produces the same trace. Balancing rounds use the same single-flight
//! trigger as the threaded setup but run inline after the CPU ticks.
//!
//!```
//!     use scx_wrr_core::*;
//!
//!     let cluster = Cluster::new(2, WrrConfig::default()).unwrap();
//!     let mut sim = Simulator::new(cluster);
//!     let pid = sim.spawn(0, &Workload::Spin { weight: 5, cpus: None }).unwrap();
//!     sim.run_ticks(100).unwrap();
//!     assert!(sim.trace().total_runtime(pid) > 0);
//!```

use std::collections::BTreeMap;

use anyhow::Result;
use log::info;

use crate::cluster::Cluster;
use crate::load_balance::BalanceOutcome;
use crate::load_balance::BalanceTrigger;
use crate::load_balance::LoadBalancer;
use crate::sched_class::TickAction;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::workload::Workload;
use crate::workload::WorkloadTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Scheduled { pid: Pid },
    /// Slice expired with other tasks waiting.
    Preempted { pid: Pid },
    Yielded { pid: Pid },
    Migrated { pid: Pid, from: CpuId, to: CpuId },
    Completed { pid: Pid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub time_ns: TimeNs,
    pub cpu: CpuId,
    pub kind: TraceKind,
}

#[derive(Debug, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
    runtime: BTreeMap<Pid, TimeNs>,
}

impl Trace {
    fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, cpu, kind });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn total_runtime(&self, pid: Pid) -> TimeNs {
        self.runtime.get(&pid).copied().unwrap_or(0)
    }

    pub fn schedule_count(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| e.kind == TraceKind::Scheduled { pid })
            .count()
    }

    pub fn completion_time(&self, pid: Pid) -> Option<TimeNs> {
        self.events
            .iter()
            .find(|e| e.kind == TraceKind::Completed { pid })
            .map(|e| e.time_ns)
    }

    pub fn migrations(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::Migrated { .. }))
    }

    pub fn dump(&self) {
        for e in self.events.iter() {
            info!("[{:>12}] CPU {:2} {:?}", e.time_ns, e.cpu.0, e.kind);
        }
    }
}

#[derive(Debug)]
pub struct Simulator {
    cluster: Cluster,
    tracker: WorkloadTracker,
    trigger: BalanceTrigger,
    lb: LoadBalancer,
    now: TimeNs,
    trace: Trace,
}

impl Simulator {
    pub fn new(cluster: Cluster) -> Self {
        let trigger = BalanceTrigger::new(cluster.config().balance_interval_ns());
        Self {
            cluster,
            tracker: WorkloadTracker::new(),
            trigger,
            lb: LoadBalancer::new(),
            now: 0,
            trace: Trace::default(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn tracker(&self) -> &WorkloadTracker {
        &self.tracker
    }

    pub fn now(&self) -> TimeNs {
        self.now
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn spawn(&mut self, uid: u32, workload: &Workload) -> Result<Pid> {
        self.tracker.spawn(&self.cluster, uid, workload, self.now)
    }

    /// The current task of `cpu` yields immediately.
    pub fn yield_cpu(&mut self, cpu: CpuId) -> Result<Option<Pid>> {
        let prev = self.cluster.current(cpu);
        let next = self.cluster.yield_current(cpu)?;
        if let Some(pid) = prev {
            self.trace.record(self.now, cpu, TraceKind::Yielded { pid });
        }
        if let Some(pid) = next.filter(|_| next != prev) {
            self.trace.record(self.now, cpu, TraceKind::Scheduled { pid });
        }
        Ok(next)
    }

    pub fn step(&mut self) -> Result<()> {
        self.now += self.cluster.config().tick_ns();
        let now = self.now;

        for idx in 0..self.cluster.nr_cpus() {
            let cpu = CpuId(idx as u32);
            if !self.cluster.cores()[idx].is_online() {
                continue;
            }
            let r = self.cluster.tick(cpu, now)?;
            if let Some(prev) = r.prev {
                *self.trace.runtime.entry(prev).or_default() += r.delta;
                if r.action == Some(TickAction::Rotated) {
                    self.trace.record(now, cpu, TraceKind::Preempted { pid: prev });
                }
            }
            if let Some(next) = r.next.filter(|_| r.switched()) {
                self.trace.record(now, cpu, TraceKind::Scheduled { pid: next });
            }

            if let Some(done) = self.tracker.reap(&self.cluster, cpu, now)? {
                self.trace
                    .record(now, cpu, TraceKind::Completed { pid: done.pid });
                if let Some(next) = self.cluster.current(cpu) {
                    self.trace.record(now, cpu, TraceKind::Scheduled { pid: next });
                }
            }
        }

        if self.trigger.try_claim(now) {
            let outcome = self.lb.load_balance(&self.cluster);
            self.trigger.complete();
            if let BalanceOutcome::Migrated { pid, from, to, .. } = outcome? {
                self.trace.record(now, to, TraceKind::Migrated { pid, from, to });
            }
        }
        Ok(())
    }

    pub fn run_ticks(&mut self, n: u64) -> Result<()> {
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    /// Step until every finite workload completed. False if `max_ticks`
    /// ran out first.
    pub fn run_until_done(&mut self, max_ticks: u64) -> Result<bool> {
        for _ in 0..max_ticks {
            if self.tracker.pending() == 0 {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(self.tracker.pending() == 0)
    }
}
