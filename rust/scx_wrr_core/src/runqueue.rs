// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-CPU WRR runqueue
//!
//! A `WrrRq` is the ordered collection of runnable WRR entities of one
//! CPU. Insertion order is dispatch order. Alongside the queue it keeps two
//! aggregates, `nr_running` and `total_weight`, which always equal the
//! count and the weight sum of the linked entities once a method returns.
//!
//! The queue stores pids, the entities themselves live in the task table
//! of the owning `Rq`. Callers pass the entity alongside its pid so the
//! `on_rq` flag and the queue contents move together.
//!
//! `total_weight` is also published through a shared `AtomicU64` so that
//! placement can read the load of every CPU without taking their locks.
//! Each individual read is consistent, a scan across CPUs is not a
//! snapshot.
//!
//! Invariant faults (double enqueue, counter underflow) are reported with
//! `warn!` and the offending update is clamped or skipped. They never
//! panic.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::warn;

use crate::task::WrrEntity;
use crate::types::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnqueuePos {
    /// Re-admission of a task that was only detached temporarily.
    Head,
    #[default]
    Tail,
}

#[derive(Debug)]
pub struct WrrRq {
    queue: VecDeque<Pid>,
    nr_running: u32,
    total_weight: u64,
    load: Arc<AtomicU64>,
}

impl WrrRq {
    pub fn new(load: Arc<AtomicU64>) -> Self {
        load.store(0, Ordering::Relaxed);
        Self {
            queue: VecDeque::new(),
            nr_running: 0,
            total_weight: 0,
            load,
        }
    }

    pub fn nr_running(&self) -> u32 {
        self.nr_running
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.queue.contains(&pid)
    }

    /// Pids in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.queue.iter().copied()
    }

    pub fn peek_first(&self) -> Option<Pid> {
        self.queue.front().copied()
    }

    /// Link `pid` into the queue. Returns false and leaves everything
    /// untouched if the entity is already linked.
    pub fn enqueue(&mut self, pid: Pid, se: &mut WrrEntity, pos: EnqueuePos) -> bool {
        if se.on_rq || self.contains(pid) {
            warn!("wrr: double enqueue of pid {} ignored", pid);
            return false;
        }

        match pos {
            EnqueuePos::Head => self.queue.push_front(pid),
            EnqueuePos::Tail => self.queue.push_back(pid),
        }
        se.on_rq = true;
        self.nr_running += 1;
        self.total_weight += se.weight as u64;
        self.publish();
        true
    }

    /// Unlink `pid`. A no-op returning false if it is not linked.
    pub fn dequeue(&mut self, pid: Pid, se: &mut WrrEntity) -> bool {
        if !se.on_rq {
            return false;
        }

        match self.queue.iter().position(|&p| p == pid) {
            Some(idx) => {
                self.queue.remove(idx);
            }
            None => warn!("wrr: pid {} flagged on_rq but missing from queue", pid),
        }
        se.on_rq = false;

        self.nr_running = match self.nr_running.checked_sub(1) {
            Some(v) => v,
            None => {
                warn!("wrr: nr_running underflow dequeuing pid {}", pid);
                0
            }
        };
        self.total_weight = self.sub_weight(se.weight as u64, pid);
        self.publish();
        true
    }

    /// Move a linked entity to the tail. Counters are unchanged.
    pub fn requeue_to_tail(&mut self, pid: Pid, se: &WrrEntity) -> bool {
        if !se.on_rq {
            return false;
        }
        match self.queue.iter().position(|&p| p == pid) {
            Some(idx) => {
                if idx + 1 != self.queue.len() {
                    self.queue.remove(idx);
                    self.queue.push_back(pid);
                }
                true
            }
            None => {
                warn!("wrr: requeue of pid {} which is not queued", pid);
                false
            }
        }
    }

    /// Change the weight of `se`, moving `total_weight` by the delta when
    /// the entity is linked.
    pub fn reweight(&mut self, pid: Pid, se: &mut WrrEntity, weight: u32) {
        let old = se.weight;
        se.weight = weight;
        if !se.on_rq {
            return;
        }
        if weight >= old {
            self.total_weight += (weight - old) as u64;
        } else {
            self.total_weight = self.sub_weight((old - weight) as u64, pid);
        }
        self.publish();
    }

    fn sub_weight(&self, weight: u64, pid: Pid) -> u64 {
        match self.total_weight.checked_sub(weight) {
            Some(v) => v,
            None => {
                warn!(
                    "wrr: total_weight underflow ({} - {}) for pid {}",
                    self.total_weight, weight, pid
                );
                0
            }
        }
    }

    fn publish(&self) {
        self.load.store(self.total_weight, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rq() -> (WrrRq, Arc<AtomicU64>) {
        let load = Arc::new(AtomicU64::new(0));
        (WrrRq::new(load.clone()), load)
    }

    fn check_aggregates(rq: &WrrRq, entities: &[(Pid, WrrEntity)]) {
        let linked: Vec<&WrrEntity> = entities
            .iter()
            .filter(|(_, se)| se.on_rq)
            .map(|(_, se)| se)
            .collect();
        assert_eq!(rq.nr_running() as usize, linked.len());
        assert_eq!(
            rq.total_weight(),
            linked.iter().map(|se| se.weight as u64).sum::<u64>()
        );
    }

    #[test]
    fn test_enqueue_dequeue_accounting() {
        let (mut rq, load) = rq();
        let mut ents: Vec<(Pid, WrrEntity)> = (1..=5)
            .map(|i| (Pid(i), WrrEntity::new(i as u32 * 3, 10)))
            .collect();

        // Interleave links and unlinks, checking after every step.
        let ops = [0, 1, 2, 1, 3, 0, 4, 2, 1, 3, 4];
        for (step, &i) in ops.iter().enumerate() {
            let (pid, se) = &mut ents[i];
            if se.on_rq {
                assert!(rq.dequeue(*pid, se));
            } else {
                let pos = if step % 2 == 0 {
                    EnqueuePos::Tail
                } else {
                    EnqueuePos::Head
                };
                assert!(rq.enqueue(*pid, se, pos));
            }
            check_aggregates(&rq, &ents);
            assert_eq!(load.load(Ordering::Relaxed), rq.total_weight());
        }
    }

    #[test]
    fn test_double_link_and_missing_unlink_are_noops() {
        let (mut rq, _) = rq();
        let mut se = WrrEntity::new(4, 10);
        assert!(rq.enqueue(Pid(1), &mut se, EnqueuePos::Tail));
        assert!(!rq.enqueue(Pid(1), &mut se, EnqueuePos::Head));
        assert_eq!(rq.nr_running(), 1);
        assert_eq!(rq.total_weight(), 4);

        let mut other = WrrEntity::new(7, 10);
        assert!(!rq.dequeue(Pid(2), &mut other));
        assert_eq!(rq.total_weight(), 4);

        assert!(rq.dequeue(Pid(1), &mut se));
        assert!(!rq.dequeue(Pid(1), &mut se));
        assert_eq!(rq.nr_running(), 0);
        assert_eq!(rq.total_weight(), 0);
    }

    #[test]
    fn test_counters_clamp_on_underflow() {
        let (mut rq, _) = rq();
        // An entity that claims to be linked without ever being counted.
        let mut bogus = WrrEntity::new(9, 10);
        bogus.on_rq = true;
        assert!(rq.dequeue(Pid(3), &mut bogus));
        assert_eq!(rq.nr_running(), 0);
        assert_eq!(rq.total_weight(), 0);
        assert!(!bogus.on_rq);
    }

    #[test]
    fn test_head_tail_and_requeue_order() {
        let (mut rq, _) = rq();
        let mut a = WrrEntity::new(1, 10);
        let mut b = WrrEntity::new(1, 10);
        let mut c = WrrEntity::new(1, 10);
        rq.enqueue(Pid(1), &mut a, EnqueuePos::Tail);
        rq.enqueue(Pid(2), &mut b, EnqueuePos::Tail);
        rq.enqueue(Pid(3), &mut c, EnqueuePos::Head);
        assert_eq!(rq.iter().collect::<Vec<_>>(), vec![Pid(3), Pid(1), Pid(2)]);

        assert!(rq.requeue_to_tail(Pid(3), &c));
        assert_eq!(rq.peek_first(), Some(Pid(1)));
        assert_eq!(rq.iter().collect::<Vec<_>>(), vec![Pid(1), Pid(2), Pid(3)]);
        assert_eq!(rq.nr_running(), 3);

        let unlinked = WrrEntity::new(1, 10);
        assert!(!rq.requeue_to_tail(Pid(9), &unlinked));
    }

    #[test]
    fn test_reweight_only_moves_linked_load() {
        let (mut rq, load) = rq();
        let mut a = WrrEntity::new(10, 10);
        let mut b = WrrEntity::new(10, 10);
        rq.enqueue(Pid(1), &mut a, EnqueuePos::Tail);

        rq.reweight(Pid(1), &mut a, 4);
        assert_eq!(rq.total_weight(), 4);
        rq.reweight(Pid(1), &mut a, 20);
        assert_eq!(rq.total_weight(), 20);
        assert_eq!(load.load(Ordering::Relaxed), 20);

        rq.reweight(Pid(2), &mut b, 1);
        assert_eq!(b.weight, 1);
        assert_eq!(rq.total_weight(), 20);
    }
}
