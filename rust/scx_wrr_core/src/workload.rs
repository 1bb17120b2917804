// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Result;
use log::info;

use crate::cluster::Cluster;
use crate::cpumask::Cpumask;
use crate::task::TaskSpec;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::TimeNs;

/// Synthetic CPU bound task.
#[derive(Debug, Clone)]
pub enum Workload {
    /// Spins until stopped.
    Spin {
        weight: u32,
        cpus: Option<Cpumask>,
    },
    /// Needs `work` ns of CPU time, then exits.
    Finite { weight: u32, work: TimeNs },
}

impl Workload {
    pub fn weight(&self) -> u32 {
        match self {
            Workload::Spin { weight, .. } | Workload::Finite { weight, .. } => *weight,
        }
    }

    fn spec(&self, uid: u32) -> TaskSpec {
        match self {
            Workload::Spin { weight, cpus } => {
                let spec = TaskSpec::wrr(&format!("spin-w{weight}"), uid).weight(*weight);
                match cpus {
                    Some(mask) => spec.cpus(mask.clone()),
                    None => spec,
                }
            }
            Workload::Finite { weight, .. } => {
                TaskSpec::wrr(&format!("turnaround-w{weight}"), uid).weight(*weight)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub pid: Pid,
    pub weight: u32,
    pub cpu: CpuId,
    pub admitted_at: TimeNs,
    pub finished_at: TimeNs,
}

impl Completion {
    pub fn turnaround(&self) -> TimeNs {
        self.finished_at.saturating_sub(self.admitted_at)
    }
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    weight: u32,
    work: TimeNs,
    admitted_at: TimeNs,
}

/// Tracks finite workloads and retires them once they got their CPU time.
#[derive(Debug, Default)]
pub struct WorkloadTracker {
    budgets: Mutex<BTreeMap<Pid, Budget>>,
    done: Mutex<Vec<Completion>>,
}

impl WorkloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, cluster: &Cluster, uid: u32, workload: &Workload, now: TimeNs) -> Result<Pid> {
        let pid = cluster.admit(workload.spec(uid))?;
        if let Workload::Finite { weight, work } = workload {
            self.budgets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    pid,
                    Budget {
                        weight: *weight,
                        work: *work,
                        admitted_at: now,
                    },
                );
        }
        Ok(pid)
    }

    /// Retire the current task of `cpu` if it used up its budget. The CPU
    /// is rescheduled right away.
    pub fn reap(&self, cluster: &Cluster, cpu: CpuId, now: TimeNs) -> Result<Option<Completion>> {
        let Some(pid) = cluster.current(cpu) else {
            return Ok(None);
        };
        let mut budgets = self.budgets.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(budget) = budgets.get(&pid).copied() else {
            return Ok(None);
        };
        let ran = cluster
            .task(pid)
            .map_or(0, |t| t.stats.sum_exec_runtime);
        if ran < budget.work {
            return Ok(None);
        }

        budgets.remove(&pid);
        drop(budgets);
        cluster.exit(pid)?;
        cluster.schedule(cpu)?;

        let done = Completion {
            pid,
            weight: budget.weight,
            cpu,
            admitted_at: budget.admitted_at,
            finished_at: now,
        };
        info!(
            "workload: pid {} weight {:2} done on cpu {} after {:.3}s",
            pid,
            done.weight,
            cpu,
            done.turnaround() as f64 / 1_000_000_000.0
        );
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(done.clone());
        Ok(Some(done))
    }

    pub fn pending(&self) -> usize {
        self.budgets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
