// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Scheduling classes
//!
//! A `SchedClass` implements one family of policies on top of an `Rq`. The
//! `ClassChain` holds the classes in priority order and the core scheduler
//! asks each in turn for the next task, the first one that has a runnable
//! task wins. WRR is the first class of the chain, everything else falls
//! through to the FIFO `FallbackClass`.

use std::fmt;

use anyhow::anyhow;
use anyhow::Result;
use log::warn;

use crate::cluster::Core;
use crate::cpumask::Cpumask;
use crate::rq::Rq;
use crate::runqueue::EnqueuePos;
use crate::task::Task;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::Policy;
use crate::wrr::WrrClass;

/// What the tick did to the current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Slice still running.
    Continue,
    /// Slice expired and was refilled, the task keeps the CPU.
    Refilled,
    /// Slice expired, the task went to the tail and a reschedule was asked.
    Rotated,
}

pub trait SchedClass: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, policy: Policy) -> bool;

    fn enqueue_task(&self, rq: &mut Rq, pid: Pid, pos: EnqueuePos);

    fn dequeue_task(&self, rq: &mut Rq, pid: Pid);

    /// Give up the rest of the current turn.
    fn yield_task(&self, rq: &mut Rq);

    /// Return the previously running task to the class before a pick.
    fn put_prev_task(&self, rq: &mut Rq, prev: Pid);

    fn pick_next_task(&self, rq: &mut Rq) -> Option<Pid>;

    fn task_tick(&self, rq: &mut Rq, pid: Pid) -> TickAction;

    fn update_curr(&self, rq: &mut Rq) {
        rq.account_curr();
    }

    /// Length of a full turn of `task`, in ticks. Zero when unbounded.
    fn get_rr_interval(&self, task: &Task) -> u32;

    fn select_task_rq(&self, cores: &[Core], allowed: &Cpumask, hint: CpuId) -> Result<CpuId>;

    /// Called after `task` moved into this class.
    fn switched_to(&self, _task: &mut Task) {}

    fn nr_running(&self, rq: &Rq) -> usize;
}

/// FIFO service for every policy WRR does not handle. Tasks run until
/// they block, yield or a higher class has work.
#[derive(Debug, Default)]
pub struct FallbackClass;

impl SchedClass for FallbackClass {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn handles(&self, policy: Policy) -> bool {
        policy != Policy::Wrr
    }

    fn enqueue_task(&self, rq: &mut Rq, pid: Pid, pos: EnqueuePos) {
        if rq.fallback.contains(&pid) {
            warn!("fallback: double enqueue of pid {} ignored", pid);
            return;
        }
        match pos {
            EnqueuePos::Head => rq.fallback.push_front(pid),
            EnqueuePos::Tail => rq.fallback.push_back(pid),
        }
    }

    fn dequeue_task(&self, rq: &mut Rq, pid: Pid) {
        rq.fallback.retain(|&p| p != pid);
    }

    fn yield_task(&self, rq: &mut Rq) {
        if let Some(curr) = rq.curr {
            if let Some(idx) = rq.fallback.iter().position(|&p| p == curr) {
                rq.fallback.remove(idx);
                rq.fallback.push_back(curr);
            }
        }
        rq.resched_curr();
    }

    fn put_prev_task(&self, _rq: &mut Rq, _prev: Pid) {}

    fn pick_next_task(&self, rq: &mut Rq) -> Option<Pid> {
        rq.fallback.front().copied()
    }

    fn task_tick(&self, rq: &mut Rq, _pid: Pid) -> TickAction {
        self.update_curr(rq);
        TickAction::Continue
    }

    fn get_rr_interval(&self, _task: &Task) -> u32 {
        0
    }

    /// Stay on the hint if it is usable, otherwise the first allowed
    /// online CPU.
    fn select_task_rq(&self, cores: &[Core], allowed: &Cpumask, hint: CpuId) -> Result<CpuId> {
        let usable = |core: &&Core| core.is_online() && allowed.allows(core.id());
        if let Some(core) = cores.get(hint.index()).filter(|c| usable(c)) {
            return Ok(core.id());
        }
        cores
            .iter()
            .find(usable)
            .map(|core| core.id())
            .ok_or_else(|| anyhow!("no online CPU in affinity mask {}", allowed))
    }

    fn nr_running(&self, rq: &Rq) -> usize {
        rq.fallback.len()
    }
}

/// Scheduling classes in descending priority.
#[derive(Debug)]
pub struct ClassChain {
    classes: Vec<Box<dyn SchedClass>>,
}

impl ClassChain {
    pub fn new(base_quantum: u32) -> Self {
        Self {
            classes: vec![
                Box::new(WrrClass::new(base_quantum)),
                Box::new(FallbackClass),
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn SchedClass> {
        self.classes.iter().map(|c| c.as_ref())
    }

    pub fn class_for(&self, policy: Policy) -> &dyn SchedClass {
        // The fallback handles every policy WRR does not.
        self.iter()
            .find(|c| c.handles(policy))
            .unwrap_or_else(|| self.classes[self.classes.len() - 1].as_ref())
    }

    pub fn class_of(&self, rq: &Rq, pid: Pid) -> Option<&dyn SchedClass> {
        rq.tasks.get(&pid).map(|t| self.class_for(t.policy))
    }

    /// Pick the next task for `rq`, trying classes in priority order.
    pub fn pick_next_task(&self, rq: &mut Rq) -> Option<Pid> {
        self.iter().find_map(|class| class.pick_next_task(rq))
    }

    pub fn nr_running(&self, rq: &Rq) -> usize {
        self.iter().map(|class| class.nr_running(rq)).sum()
    }
}
