// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Weighted round-robin class
//!
//! Dispatch order is plain round-robin by queue position. Weight only
//! decides how long a task keeps the CPU once picked: a task of weight `w`
//! runs for `w * base_quantum` ticks before it rotates to the tail.
//!
//! The running task stays linked at the head of its queue while it runs.
//! `pick_next()` first puts the previous task back at the tail and then
//! takes the head, so an expired or yielding task is only picked again
//! after every other runnable task had its turn.
//!
//! A task that is alone on its CPU is never rotated. Its slice is simply
//! refilled when it runs out.

use anyhow::Result;
use log::trace;
use log::warn;

use crate::cluster::Core;
use crate::cpumask::Cpumask;
use crate::placement::select_least_loaded;
use crate::rq::Rq;
use crate::runqueue::EnqueuePos;
use crate::sched_class::SchedClass;
use crate::sched_class::TickAction;
use crate::task::Task;
use crate::task::WrrEntity;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::Policy;

#[derive(Debug)]
pub struct WrrClass {
    base_quantum: u32,
}

impl WrrClass {
    pub fn new(base_quantum: u32) -> Self {
        Self { base_quantum }
    }

    /// Full slice of an entity, `weight * base_quantum`.
    pub fn get_timeslice(&self, se: &WrrEntity) -> u32 {
        se.weight * self.base_quantum
    }

    fn requeue(&self, rq: &mut Rq, pid: Pid) -> bool {
        match rq.tasks.get(&pid).filter(|t| t.is_wrr()) {
            Some(task) => rq.wrr.requeue_to_tail(pid, &task.wrr),
            None => false,
        }
    }

    /// Put `prev` back at the tail, then return the head without unlinking
    /// it. `None` leaves the CPU to lower classes.
    pub fn pick_next(&self, rq: &mut Rq, prev: Option<Pid>) -> Option<Pid> {
        if let Some(prev) = prev {
            self.put_prev_task(rq, prev);
        }
        rq.wrr.peek_first()
    }
}

impl SchedClass for WrrClass {
    fn name(&self) -> &'static str {
        "wrr"
    }

    fn handles(&self, policy: Policy) -> bool {
        policy == Policy::Wrr
    }

    fn enqueue_task(&self, rq: &mut Rq, pid: Pid, pos: EnqueuePos) {
        match rq.tasks.get_mut(&pid) {
            Some(task) => {
                rq.wrr.enqueue(pid, &mut task.wrr, pos);
            }
            None => warn!("wrr: enqueue of pid {} unknown to cpu {}", pid, rq.cpu),
        }
    }

    fn dequeue_task(&self, rq: &mut Rq, pid: Pid) {
        if let Some(task) = rq.tasks.get_mut(&pid) {
            rq.wrr.dequeue(pid, &mut task.wrr);
        }
    }

    /// The slice is left as is, the task resumes it on its next turn.
    fn yield_task(&self, rq: &mut Rq) {
        if let Some(curr) = rq.curr {
            self.requeue(rq, curr);
        }
        rq.resched_curr();
    }

    fn put_prev_task(&self, rq: &mut Rq, prev: Pid) {
        self.requeue(rq, prev);
    }

    fn pick_next_task(&self, rq: &mut Rq) -> Option<Pid> {
        self.pick_next(rq, None)
    }

    fn task_tick(&self, rq: &mut Rq, pid: Pid) -> TickAction {
        self.update_curr(rq);

        let base_quantum = self.base_quantum;
        let Some(task) = rq.tasks.get_mut(&pid).filter(|t| t.is_wrr()) else {
            return TickAction::Continue;
        };
        let se = &mut task.wrr;
        se.time_slice = se.time_slice.saturating_sub(1);
        if se.time_slice > 0 {
            return TickAction::Continue;
        }
        se.refill(base_quantum);
        trace!(
            "wrr: cpu {} pid {} slice expired, refilled to {}",
            rq.cpu,
            pid,
            se.time_slice
        );

        if rq.wrr.nr_running() > 1 {
            self.requeue(rq, pid);
            rq.resched_curr();
            TickAction::Rotated
        } else {
            TickAction::Refilled
        }
    }

    fn update_curr(&self, rq: &mut Rq) {
        if rq.curr_task().map_or(false, |t| t.is_wrr()) {
            rq.account_curr();
        }
    }

    fn get_rr_interval(&self, task: &Task) -> u32 {
        self.get_timeslice(&task.wrr)
    }

    fn select_task_rq(&self, cores: &[Core], allowed: &Cpumask, _hint: CpuId) -> Result<CpuId> {
        select_least_loaded(cores, allowed)
    }

    fn switched_to(&self, task: &mut Task) {
        task.wrr.refill(self.base_quantum);
    }

    fn nr_running(&self, rq: &Rq) -> usize {
        rq.wrr.nr_running() as usize
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::*;
    use crate::task::ExecStats;
    use crate::task::TaskState;

    const QUANTUM: u32 = 2;

    fn setup(weights: &[u32]) -> (WrrClass, Rq) {
        let class = WrrClass::new(QUANTUM);
        let mut rq = Rq::new(CpuId(0), Arc::new(AtomicU64::new(0)));
        for (i, &w) in weights.iter().enumerate() {
            let pid = Pid(i as i32 + 1);
            rq.tasks.insert(
                pid,
                Task {
                    pid,
                    comm: format!("w{w}"),
                    uid: 0,
                    policy: Policy::Wrr,
                    cpus_allowed: Cpumask::all(1),
                    cpu: CpuId(0),
                    state: TaskState::Runnable,
                    wrr: WrrEntity::new(w, QUANTUM),
                    stats: ExecStats::default(),
                },
            );
            class.enqueue_task(&mut rq, pid, EnqueuePos::Tail);
        }
        (class, rq)
    }

    #[test]
    fn test_fifo_rotation_period() {
        let (class, mut rq) = setup(&[1, 5, 3, 2]);
        let mut prev = None;
        let mut order = vec![];
        for _ in 0..12 {
            let next = class.pick_next(&mut rq, prev);
            order.push(next.unwrap().0);
            prev = next;
        }
        assert_eq!(order, vec![1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(rq.wrr.nr_running(), 4);
        assert_eq!(rq.wrr.total_weight(), 11);
    }

    #[test]
    fn test_pick_next_empty() {
        let (class, mut rq) = setup(&[]);
        assert_eq!(class.pick_next(&mut rq, None), None);
    }

    #[test]
    fn test_tick_rotates_after_full_slice() {
        let (class, mut rq) = setup(&[3, 1]);
        rq.curr = class.pick_next(&mut rq, None);
        assert_eq!(rq.curr, Some(Pid(1)));

        let slice = 3 * QUANTUM;
        for _ in 1..slice {
            assert_eq!(class.task_tick(&mut rq, Pid(1)), TickAction::Continue);
            assert!(!rq.need_resched());
        }
        assert_eq!(class.task_tick(&mut rq, Pid(1)), TickAction::Rotated);
        assert!(rq.need_resched());
        assert_eq!(rq.tasks[&Pid(1)].wrr.time_slice, slice);
        assert_eq!(rq.wrr.peek_first(), Some(Pid(2)));
    }

    #[test]
    fn test_singleton_is_refilled_not_rotated() {
        let (class, mut rq) = setup(&[1]);
        rq.curr = class.pick_next(&mut rq, None);
        assert_eq!(class.task_tick(&mut rq, Pid(1)), TickAction::Continue);
        assert_eq!(class.task_tick(&mut rq, Pid(1)), TickAction::Refilled);
        assert!(!rq.need_resched());
        assert_eq!(rq.tasks[&Pid(1)].wrr.time_slice, QUANTUM);
    }

    #[test]
    fn test_yield_keeps_slice() {
        let (class, mut rq) = setup(&[4, 4]);
        rq.curr = class.pick_next(&mut rq, None);
        class.task_tick(&mut rq, Pid(1));
        let left = rq.tasks[&Pid(1)].wrr.time_slice;

        class.yield_task(&mut rq);
        assert!(rq.need_resched());
        assert_eq!(rq.tasks[&Pid(1)].wrr.time_slice, left);
        assert_eq!(rq.wrr.iter().collect::<Vec<_>>(), vec![Pid(2), Pid(1)]);
    }

    #[test]
    fn test_get_timeslice() {
        let class = WrrClass::new(7);
        assert_eq!(class.get_timeslice(&WrrEntity::new(20, 7)), 140);
        assert_eq!(class.get_timeslice(&WrrEntity::new(1, 7)), 7);
    }
}
