// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::cpumask::Cpumask;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::Policy;
use crate::types::TimeNs;

/// Per-task WRR state. `on_rq` is true iff the entity is linked into the
/// `WrrRq` of the core the task is assigned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrrEntity {
    pub weight: u32,
    /// Ticks left in the current turn.
    pub time_slice: u32,
    pub on_rq: bool,
}

impl WrrEntity {
    pub fn new(weight: u32, base_quantum: u32) -> Self {
        Self {
            weight,
            time_slice: weight * base_quantum,
            on_rq: false,
        }
    }

    pub fn refill(&mut self, base_quantum: u32) {
        self.time_slice = self.weight * base_quantum;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    /// Runqueue clock when the task last became current or was accounted.
    pub exec_start: TimeNs,
    pub sum_exec_runtime: TimeNs,
    /// Longest single stretch accounted by `update_curr`.
    pub exec_max: TimeNs,
    pub nr_switches: u64,
    pub nr_migrations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Sleeping,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub pid: Pid,
    pub comm: String,
    /// Owner uid, checked by weight control.
    pub uid: u32,
    pub policy: Policy,
    pub cpus_allowed: Cpumask,
    /// Core whose runqueue holds the task, runnable or not.
    pub cpu: CpuId,
    pub state: TaskState,
    pub wrr: WrrEntity,
    pub stats: ExecStats,
}

impl Task {
    pub fn is_wrr(&self) -> bool {
        self.policy == Policy::Wrr
    }
}

/// Admission request for a new task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub comm: String,
    pub uid: u32,
    pub policy: Policy,
    /// Initial weight, the configured default when `None`.
    pub weight: Option<u32>,
    /// Allowed CPUs, every CPU when `None`.
    pub cpus_allowed: Option<Cpumask>,
    /// CPU the task last ran on, if any.
    pub cpu_hint: Option<CpuId>,
}

impl TaskSpec {
    pub fn wrr(comm: &str, uid: u32) -> Self {
        Self {
            comm: comm.to_string(),
            uid,
            policy: Policy::Wrr,
            weight: None,
            cpus_allowed: None,
            cpu_hint: None,
        }
    }

    pub fn normal(comm: &str, uid: u32) -> Self {
        Self {
            policy: Policy::Normal,
            ..Self::wrr(comm, uid)
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn cpus(mut self, mask: Cpumask) -> Self {
        self.cpus_allowed = Some(mask);
        self
    }

    pub fn hint(mut self, cpu: CpuId) -> Self {
        self.cpu_hint = Some(cpu);
        self
    }
}
