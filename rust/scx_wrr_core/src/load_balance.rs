// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # WRR load balancer
//!
//! The balancer equalizes aggregate WRR weight across CPUs. Each round
//! moves at most one task, from the most loaded online CPU to the least
//! loaded one. It is a best effort control loop: skipping or delaying a
//! round degrades fairness across CPUs, never correctness.
//!
//! Round structure
//! ---------------
//!
//! 1. Read every online CPU's published load and pick the busiest and the
//!    idlest CPU. Ties go to the lowest index for both. If they are the
//!    same CPU, stop.
//!
//! 2. Lock both runqueues, lower CPU index first.
//!
//! 3. Walk the busiest CPU's queue in dispatch order looking for the
//!    heaviest task that
//!
//!    - is not running right now,
//!    - satisfies `min_load + w < max_load - w` so that the move cannot
//!      invert the imbalance,
//!    - allows the idlest CPU in its affinity mask.
//!
//!    Among equally heavy candidates the first one in queue order wins.
//!    The loads used here are the ones read under the locks, not the
//!    lock-free snapshot from step 1.
//!
//! 4. Move the task to the head of the idlest CPU's queue and ask that
//!    CPU to reschedule, so the migrated task runs at its next tick.
//!
//! Finding nothing to move is the steady state of a balanced cluster and
//! is only logged at debug level.
//!
//! Triggering
//! ----------
//!
//! Rounds are single-flight and rate limited by `BalanceTrigger`: the tick
//! path calls `try_claim()` which grants at most one round per
//! `balance_interval` and none while a claimed round is still in flight.
//! `BalanceWorker` runs claimed rounds on its own thread. The tick path
//! only posts a `BalanceDue` message, it never balances inline.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::channel::TrySendError;
use log::debug;
use log::info;
use log::warn;

use crate::cluster::Cluster;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::TimeNs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOutcome {
    /// No online CPU.
    Idle,
    /// Busiest and idlest CPU are the same.
    SameCore,
    /// No task qualified for migration.
    NoCandidate,
    Migrated {
        pid: Pid,
        weight: u32,
        from: CpuId,
        to: CpuId,
    },
}

impl BalanceOutcome {
    pub fn migrated(&self) -> bool {
        matches!(self, BalanceOutcome::Migrated { .. })
    }
}

impl fmt::Display for BalanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceOutcome::Idle => write!(f, "IDLE"),
            BalanceOutcome::SameCore => write!(f, "BALANCED"),
            BalanceOutcome::NoCandidate => write!(f, "NO-CANDIDATE"),
            BalanceOutcome::Migrated {
                pid,
                weight,
                from,
                to,
            } => write!(
                f,
                "MIGRATED [pid: {:05}](weight: {}) CPU {} --> CPU {}",
                pid.0, weight, from, to
            ),
        }
    }
}

/// Loads seen by one balancing round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceStat {
    pub max_cpu: CpuId,
    pub max_load: u64,
    pub min_cpu: CpuId,
    pub min_load: u64,
    pub outcome: BalanceOutcome,
}

impl fmt::Display for BalanceStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max=CPU[{:02}] load={} min=CPU[{:02}] load={} imbal={} {}",
            self.max_cpu.0,
            self.max_load,
            self.min_cpu.0,
            self.min_load,
            self.max_load.saturating_sub(self.min_load),
            self.outcome
        )
    }
}

/// Heaviest migratable entry of `queue`, scanning in order. A later entry
/// replaces the best so far only if strictly heavier.
pub fn find_candidate<I>(queue: I, max_load: u64, min_load: u64) -> Option<(Pid, u32)>
where
    I: IntoIterator<Item = (Pid, u32)>,
{
    let mut best: Option<(Pid, u32)> = None;
    for (pid, weight) in queue {
        let w = weight as u64;
        if max_load < w || min_load + w >= max_load - w {
            continue;
        }
        if best.map_or(true, |(_, bw)| weight > bw) {
            best = Some((pid, weight));
        }
    }
    best
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    nr_rounds: u64,
    nr_migrations: u64,
    last: Option<BalanceStat>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nr_rounds(&self) -> u64 {
        self.nr_rounds
    }

    pub fn nr_migrations(&self) -> u64 {
        self.nr_migrations
    }

    pub fn last_stat(&self) -> Option<&BalanceStat> {
        self.last.as_ref()
    }

    fn snapshot(cluster: &Cluster) -> Option<((CpuId, u64), (CpuId, u64))> {
        let mut max: Option<(CpuId, u64)> = None;
        let mut min: Option<(CpuId, u64)> = None;
        for core in cluster.cores().iter().filter(|c| c.is_online()) {
            let load = core.load();
            if max.map_or(true, |(_, m)| load > m) {
                max = Some((core.id(), load));
            }
            if min.map_or(true, |(_, m)| load < m) {
                min = Some((core.id(), load));
            }
        }
        Some((max?, min?))
    }

    /// Run one balancing round.
    pub fn load_balance(&mut self, cluster: &Cluster) -> Result<BalanceOutcome> {
        self.nr_rounds += 1;
        cluster.note_balance_round();

        let Some(((max_cpu, max_snap), (min_cpu, min_snap))) = Self::snapshot(cluster) else {
            return Ok(BalanceOutcome::Idle);
        };
        if max_cpu == min_cpu {
            self.last = Some(BalanceStat {
                max_cpu,
                max_load: max_snap,
                min_cpu,
                min_load: min_snap,
                outcome: BalanceOutcome::SameCore,
            });
            return Ok(BalanceOutcome::SameCore);
        }

        let (mut src, mut dst) = cluster.lock_two(max_cpu, min_cpu)?;
        let max_load = src.wrr.total_weight();
        let min_load = dst.wrr.total_weight();

        let curr = src.curr;
        let queue = src.wrr.iter().filter_map(|pid| {
            let task = src.tasks.get(&pid)?;
            if Some(pid) == curr || !task.cpus_allowed.allows(min_cpu) {
                return None;
            }
            Some((pid, task.wrr.weight))
        });
        let candidate = find_candidate(queue, max_load, min_load);

        let outcome = match candidate {
            None => {
                debug!(
                    "lb: CPU {} (load {}) --> CPU {} (load {}): nothing to migrate",
                    max_cpu, max_load, min_cpu, min_load
                );
                BalanceOutcome::NoCandidate
            }
            Some((pid, weight)) => {
                cluster
                    .migrate_locked(&mut src, &mut dst, pid)
                    .with_context(|| format!("migrating pid {} to CPU {}", pid, min_cpu))?;
                dst.resched_curr();
                self.nr_migrations += 1;
                debug!(
                    "lb: CPU {} sending [pid: {:05}](weight: {}) --> CPU {}",
                    max_cpu, pid.0, weight, min_cpu
                );
                BalanceOutcome::Migrated {
                    pid,
                    weight,
                    from: max_cpu,
                    to: min_cpu,
                }
            }
        };

        self.last = Some(BalanceStat {
            max_cpu,
            max_load,
            min_cpu,
            min_load,
            outcome,
        });
        Ok(outcome)
    }
}

#[derive(Debug)]
struct TriggerState {
    next_balance: TimeNs,
    in_flight: bool,
}

/// Single-flight gate deciding when a balancing round is due.
#[derive(Debug)]
pub struct BalanceTrigger {
    interval: TimeNs,
    state: Mutex<TriggerState>,
}

impl BalanceTrigger {
    /// The first round becomes due one interval after time zero.
    pub fn new(interval: TimeNs) -> Self {
        Self {
            interval,
            state: Mutex::new(TriggerState {
                next_balance: interval,
                in_flight: false,
            }),
        }
    }

    /// Claim the round due at `now`. True for exactly one caller per round.
    pub fn try_claim(&self, now: TimeNs) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_flight || now < state.next_balance {
            return false;
        }
        state.in_flight = true;
        state.next_balance = now + self.interval;
        true
    }

    /// Release the claim taken by `try_claim()`.
    pub fn complete(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
    }
}

#[derive(Debug)]
pub enum BalanceMsg {
    BalanceDue { at: TimeNs },
    Shutdown,
}

/// Tick-side handle of a `BalanceWorker`.
#[derive(Debug, Clone)]
pub struct BalanceHandle {
    tx: Sender<BalanceMsg>,
    trigger: Arc<BalanceTrigger>,
}

impl BalanceHandle {
    /// Post a round if one is due at `now`. Returns whether one was posted.
    pub fn kick(&self, now: TimeNs) -> bool {
        if !self.trigger.try_claim(now) {
            return false;
        }
        match self.tx.try_send(BalanceMsg::BalanceDue { at: now }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.trigger.complete();
                false
            }
        }
    }
}

/// Background thread running balancing rounds posted through a
/// `BalanceHandle`.
#[derive(Debug)]
pub struct BalanceWorker {
    handle: BalanceHandle,
    join: Option<thread::JoinHandle<LoadBalancer>>,
}

impl BalanceWorker {
    pub fn spawn(cluster: Arc<Cluster>) -> Result<Self> {
        let trigger = Arc::new(BalanceTrigger::new(cluster.config().balance_interval_ns()));
        let (tx, rx) = channel::bounded(1);
        let worker_trigger = trigger.clone();
        let join = thread::Builder::new()
            .name("wrr-balance".into())
            .spawn(move || Self::run(cluster, worker_trigger, rx))
            .context("Failed to spawn balancer thread")?;

        Ok(Self {
            handle: BalanceHandle { tx, trigger },
            join: Some(join),
        })
    }

    fn run(
        cluster: Arc<Cluster>,
        trigger: Arc<BalanceTrigger>,
        rx: Receiver<BalanceMsg>,
    ) -> LoadBalancer {
        let mut lb = LoadBalancer::new();
        while let Ok(msg) = rx.recv() {
            match msg {
                BalanceMsg::BalanceDue { at } => {
                    match lb.load_balance(&cluster) {
                        Ok(outcome) if outcome.migrated() => {
                            info!("lb: t={}ms {}", at / 1_000_000, outcome)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("lb: round at {}ns failed: {:#}", at, e),
                    }
                    trigger.complete();
                }
                BalanceMsg::Shutdown => break,
            }
        }
        lb
    }

    pub fn handle(&self) -> BalanceHandle {
        self.handle.clone()
    }

    /// Stop the worker and return its balancer.
    pub fn shutdown(mut self) -> Result<LoadBalancer> {
        // Blocks until any round in flight drains from the channel.
        let _ = self.handle.tx.send(BalanceMsg::Shutdown);
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("balancer thread panicked")),
            None => Ok(LoadBalancer::new()),
        }
    }
}
