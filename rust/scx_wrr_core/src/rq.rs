// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::runqueue::WrrRq;
use crate::task::Task;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::TimeNs;

/// Everything one CPU owns, guarded by that CPU's lock in `Core`.
///
/// `tasks` holds every task assigned to this CPU whether it is runnable or
/// sleeping. A task is present in exactly one `Rq` at a time.
#[derive(Debug)]
pub struct Rq {
    pub cpu: CpuId,
    pub clock: TimeNs,
    pub curr: Option<Pid>,
    pub tasks: BTreeMap<Pid, Task>,
    pub wrr: WrrRq,
    /// FIFO of runnable tasks outside SCHED_WRR.
    pub fallback: VecDeque<Pid>,
    pub nr_switches: u64,
    resched: bool,
}

impl Rq {
    pub fn new(cpu: CpuId, load: Arc<AtomicU64>) -> Self {
        Self {
            cpu,
            clock: 0,
            curr: None,
            tasks: BTreeMap::new(),
            wrr: WrrRq::new(load),
            fallback: VecDeque::new(),
            nr_switches: 0,
            resched: false,
        }
    }

    /// Ask for `schedule()` at the next opportunity on this CPU.
    pub fn resched_curr(&mut self) {
        self.resched = true;
    }

    pub fn need_resched(&self) -> bool {
        self.resched
    }

    pub(crate) fn clear_resched(&mut self) {
        self.resched = false;
    }

    /// Advance the clock. It never moves backwards.
    pub fn update_clock(&mut self, now: TimeNs) {
        self.clock = self.clock.max(now);
    }

    pub fn curr_task(&self) -> Option<&Task> {
        self.curr.and_then(|pid| self.tasks.get(&pid))
    }

    pub fn nr_running(&self) -> usize {
        self.wrr.nr_running() as usize + self.fallback.len()
    }

    /// Charge the time since `exec_start` to the current task. Returns the
    /// amount charged.
    pub fn account_curr(&mut self) -> TimeNs {
        let now = self.clock;
        let Some(task) = self.curr.and_then(|pid| self.tasks.get_mut(&pid)) else {
            return 0;
        };
        let stats = &mut task.stats;
        let delta = now.saturating_sub(stats.exec_start);
        if delta == 0 {
            return 0;
        }
        stats.exec_max = stats.exec_max.max(delta);
        stats.sum_exec_runtime += delta;
        stats.exec_start = now;
        delta
    }
}
