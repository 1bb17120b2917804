// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cluster
//!
//! A `Cluster` is the set of CPUs the WRR class schedules, each owning its
//! `Rq` behind its own lock. There is no global state: every operation
//! goes through a `&Cluster` handle.
//!
//! Locking rules:
//!
//! - A task's fields are protected by the lock of the CPU it is assigned to.
//!   `task_rq_lock()` finds that CPU through the pid index and retries if
//!   the task moved while the lock was being taken.
//!
//! - When two runqueues must be held together, `lock_two()` acquires them
//!   in ascending CPU order.
//!
//! - The pid index lock nests inside runqueue locks.
//!
//! - Placement reads the per-CPU published load without any runqueue lock.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;

use crate::config::WrrConfig;
use crate::cpumask::Cpumask;
use crate::rq::Rq;
use crate::runqueue::EnqueuePos;
use crate::sched_class::ClassChain;
use crate::sched_class::TickAction;
use crate::stats::ClusterStats;
use crate::stats::RqStats;
use crate::task::ExecStats;
use crate::task::Task;
use crate::task::TaskSpec;
use crate::task::TaskState;
use crate::task::WrrEntity;
use crate::types::weight_in_range;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::Policy;
use crate::types::TimeNs;

fn lock_rq(m: &Mutex<Rq>) -> MutexGuard<'_, Rq> {
    // Poisoning is ignored, scheduling must go on.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct Core {
    id: CpuId,
    rq: Mutex<Rq>,
    load: Arc<AtomicU64>,
    online: AtomicBool,
}

impl Core {
    fn new(id: CpuId) -> Self {
        let load = Arc::new(AtomicU64::new(0));
        Self {
            id,
            rq: Mutex::new(Rq::new(id, load.clone())),
            load,
            online: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, Rq> {
        lock_rq(&self.rq)
    }

    /// Aggregate WRR weight, read without the runqueue lock.
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Outcome of one clock tick on one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub cpu: CpuId,
    /// Task that was current when the tick fired.
    pub prev: Option<Pid>,
    /// Task current after the tick.
    pub next: Option<Pid>,
    pub action: Option<TickAction>,
    /// Time charged to `prev`.
    pub delta: TimeNs,
}

impl TickReport {
    pub fn switched(&self) -> bool {
        self.prev != self.next
    }
}

#[derive(Debug)]
pub struct Cluster {
    cfg: WrrConfig,
    cores: Vec<Core>,
    chain: ClassChain,
    pids: Mutex<HashMap<Pid, CpuId>>,
    next_pid: AtomicI32,
    nr_migrations: AtomicU64,
    nr_balance_rounds: AtomicU64,
}

impl Cluster {
    pub fn new(nr_cpus: usize, cfg: WrrConfig) -> Result<Self> {
        cfg.validate()?;
        if nr_cpus == 0 {
            bail!("a cluster needs at least one CPU");
        }
        info!(
            "wrr: {} CPUs, base quantum {} ticks, tick {:?}, balance every {:?}",
            nr_cpus, cfg.base_quantum, cfg.tick_interval, cfg.balance_interval
        );
        Ok(Self {
            chain: ClassChain::new(cfg.base_quantum),
            cfg,
            cores: (0..nr_cpus).map(|i| Core::new(CpuId(i as u32))).collect(),
            pids: Mutex::new(HashMap::new()),
            next_pid: AtomicI32::new(1),
            nr_migrations: AtomicU64::new(0),
            nr_balance_rounds: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &WrrConfig {
        &self.cfg
    }

    pub fn nr_cpus(&self) -> usize {
        self.cores.len()
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn core(&self, cpu: CpuId) -> Result<&Core> {
        self.cores
            .get(cpu.index())
            .ok_or_else(|| anyhow!("CPU {} does not exist", cpu))
    }

    fn pid_index(&self) -> MutexGuard<'_, HashMap<Pid, CpuId>> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_cpu(&self, pid: Pid) -> Option<CpuId> {
        self.pid_index().get(&pid).copied()
    }

    pub fn nr_tasks(&self) -> usize {
        self.pid_index().len()
    }

    /// Lock the runqueue currently holding `pid`. `None` if no such task.
    pub fn task_rq_lock(&self, pid: Pid) -> Option<MutexGuard<'_, Rq>> {
        loop {
            let cpu = self.task_cpu(pid)?;
            let rq = self.cores.get(cpu.index())?.lock();
            if rq.tasks.contains_key(&pid) {
                return Some(rq);
            }
            // Migrated between the index read and the lock, or exited.
            if self.task_cpu(pid) == Some(cpu) {
                return None;
            }
        }
    }

    /// Lock two distinct runqueues in ascending CPU order. The guards are
    /// returned in argument order.
    pub fn lock_two(
        &self,
        a: CpuId,
        b: CpuId,
    ) -> Result<(MutexGuard<'_, Rq>, MutexGuard<'_, Rq>)> {
        if a == b {
            bail!("lock_two on the same CPU {}", a);
        }
        let (ca, cb) = (self.core(a)?, self.core(b)?);
        if a < b {
            let ga = ca.lock();
            let gb = cb.lock();
            Ok((ga, gb))
        } else {
            let gb = cb.lock();
            let ga = ca.lock();
            Ok((ga, gb))
        }
    }

    /// Current task of `cpu`.
    pub fn current(&self, cpu: CpuId) -> Option<Pid> {
        self.cores.get(cpu.index()).and_then(|c| c.lock().curr)
    }

    pub fn task(&self, pid: Pid) -> Option<Task> {
        self.task_rq_lock(pid).and_then(|rq| rq.tasks.get(&pid).cloned())
    }

    pub fn select_task_rq(&self, policy: Policy, allowed: &Cpumask, hint: CpuId) -> Result<CpuId> {
        self.chain
            .class_for(policy)
            .select_task_rq(&self.cores, allowed, hint)
    }

    /// Create a runnable task and place it.
    pub fn admit(&self, spec: TaskSpec) -> Result<Pid> {
        let weight = spec.weight.unwrap_or(self.cfg.default_weight);
        if !weight_in_range(weight as i64) {
            bail!("weight {} is out of range for {}", weight, spec.comm);
        }
        let allowed = spec
            .cpus_allowed
            .unwrap_or_else(|| Cpumask::all(self.nr_cpus()));
        if allowed.len() != self.nr_cpus() {
            bail!(
                "affinity mask covers {} CPUs, cluster has {}",
                allowed.len(),
                self.nr_cpus()
            );
        }
        let hint = spec.cpu_hint.unwrap_or_default();
        let cpu = self.select_task_rq(spec.policy, &allowed, hint)?;

        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let mut task = Task {
            pid,
            comm: spec.comm,
            uid: spec.uid,
            policy: spec.policy,
            cpus_allowed: allowed,
            cpu,
            state: TaskState::Runnable,
            wrr: WrrEntity::new(weight, self.cfg.base_quantum),
            stats: ExecStats::default(),
        };

        let mut guard = self.core(cpu)?.lock();
        let rq = &mut *guard;
        let class = self.chain.class_for(task.policy);
        class.switched_to(&mut task);
        debug!(
            "wrr: admit {}[{}] {} weight {} on cpu {}",
            task.comm, pid, task.policy, weight, cpu
        );
        rq.tasks.insert(pid, task);
        self.pid_index().insert(pid, cpu);
        class.enqueue_task(rq, pid, EnqueuePos::Tail);
        if rq.curr.is_none() {
            rq.resched_curr();
        }
        Ok(pid)
    }

    /// Make a sleeping task runnable again, possibly on another CPU. Waking
    /// a task that is already runnable is a no-op.
    pub fn wake(&self, pid: Pid) -> Result<CpuId> {
        loop {
            let (old, policy, allowed) = {
                let rq = self
                    .task_rq_lock(pid)
                    .ok_or_else(|| anyhow!("no task {}", pid))?;
                let task = &rq.tasks[&pid];
                if task.state == TaskState::Runnable {
                    return Ok(task.cpu);
                }
                (task.cpu, task.policy, task.cpus_allowed.clone())
            };
            let cpu = self.select_task_rq(policy, &allowed, old)?;

            if cpu == old {
                let mut guard = self.core(cpu)?.lock();
                let rq = &mut *guard;
                let Some(task) = rq.tasks.get_mut(&pid) else {
                    // Moved by a concurrent wake, look it up again.
                    continue;
                };
                if task.state == TaskState::Sleeping {
                    task.state = TaskState::Runnable;
                    let class = self.chain.class_for(task.policy);
                    class.enqueue_task(rq, pid, EnqueuePos::Tail);
                    if rq.curr.is_none() {
                        rq.resched_curr();
                    }
                }
                return Ok(cpu);
            }

            let (mut src, mut dst) = self.lock_two(old, cpu)?;
            match src.tasks.get(&pid).map(|t| t.state) {
                Some(TaskState::Sleeping) => {}
                Some(TaskState::Runnable) => return Ok(old),
                None => continue,
            }
            let Some(mut task) = src.tasks.remove(&pid) else {
                continue;
            };
            task.state = TaskState::Runnable;
            task.cpu = cpu;
            task.stats.nr_migrations += 1;
            let class = self.chain.class_for(task.policy);
            dst.tasks.insert(pid, task);
            self.pid_index().insert(pid, cpu);
            class.enqueue_task(&mut dst, pid, EnqueuePos::Tail);
            if dst.curr.is_none() {
                dst.resched_curr();
            }
            debug!("wrr: woke {} on cpu {} (was {})", pid, cpu, old);
            return Ok(cpu);
        }
    }

    /// Block a task. A running task leaves its CPU at once and the CPU
    /// reschedules, so a sleeping task is never current anywhere.
    pub fn sleep(&self, pid: Pid) -> Result<()> {
        let mut guard = self
            .task_rq_lock(pid)
            .ok_or_else(|| anyhow!("no task {}", pid))?;
        let rq = &mut *guard;
        let class = self.chain.class_for(rq.tasks[&pid].policy);
        if rq.curr == Some(pid) {
            class.update_curr(rq);
            rq.curr = None;
            rq.resched_curr();
        }
        class.dequeue_task(rq, pid);
        if let Some(task) = rq.tasks.get_mut(&pid) {
            task.state = TaskState::Sleeping;
        }
        Ok(())
    }

    /// Remove a task. Returns its final state.
    pub fn exit(&self, pid: Pid) -> Result<Task> {
        let mut guard = self
            .task_rq_lock(pid)
            .ok_or_else(|| anyhow!("no task {}", pid))?;
        let rq = &mut *guard;
        if rq.curr == Some(pid) {
            if let Some(class) = self.chain.class_of(rq, pid) {
                class.update_curr(rq);
            }
            rq.curr = None;
            rq.resched_curr();
        }
        let class = self.chain.class_for(rq.tasks[&pid].policy);
        class.dequeue_task(rq, pid);
        let task = rq
            .tasks
            .remove(&pid)
            .ok_or_else(|| anyhow!("task {} vanished on exit", pid))?;
        self.pid_index().remove(&pid);
        debug!(
            "wrr: exit {}[{}] ran {}ns",
            task.comm, pid, task.stats.sum_exec_runtime
        );
        Ok(task)
    }

    /// Run the core scheduler on a locked runqueue.
    pub fn schedule_locked(&self, rq: &mut Rq) -> Option<Pid> {
        let prev = rq.curr;
        if let Some(prev) = prev {
            if let Some(class) = self.chain.class_of(rq, prev) {
                class.update_curr(rq);
                class.put_prev_task(rq, prev);
            }
        }
        rq.clear_resched();

        let next = self.chain.pick_next_task(rq);
        if next != prev {
            rq.nr_switches += 1;
            let now = rq.clock;
            if let Some(task) = next.and_then(|pid| rq.tasks.get_mut(&pid)) {
                task.stats.exec_start = now;
                task.stats.nr_switches += 1;
            }
        }
        rq.curr = next;
        next
    }

    pub fn schedule(&self, cpu: CpuId) -> Result<Option<Pid>> {
        let mut rq = self.core(cpu)?.lock();
        Ok(self.schedule_locked(&mut rq))
    }

    /// Scheduler clock tick on `cpu` at time `now`.
    pub fn tick(&self, cpu: CpuId, now: TimeNs) -> Result<TickReport> {
        let mut guard = self.core(cpu)?.lock();
        let rq = &mut *guard;
        rq.update_clock(now);

        let prev = rq.curr;
        let before = rq.curr_task().map_or(0, |t| t.stats.sum_exec_runtime);
        let action = match prev {
            Some(pid) => self.chain.class_of(rq, pid).map(|c| c.task_tick(rq, pid)),
            None => None,
        };
        let delta = rq
            .curr_task()
            .map_or(0, |t| t.stats.sum_exec_runtime.saturating_sub(before));

        if rq.need_resched() || (rq.curr.is_none() && self.chain.nr_running(rq) > 0) {
            self.schedule_locked(rq);
        }

        Ok(TickReport {
            cpu,
            prev,
            next: rq.curr,
            action,
            delta,
        })
    }

    /// Current task of `cpu` gives up the rest of its turn.
    pub fn yield_current(&self, cpu: CpuId) -> Result<Option<Pid>> {
        let mut guard = self.core(cpu)?.lock();
        let rq = &mut *guard;
        let Some(curr) = rq.curr else {
            return Ok(None);
        };
        if let Some(class) = self.chain.class_of(rq, curr) {
            class.yield_task(rq);
        }
        Ok(self.schedule_locked(rq))
    }

    /// Move a task to another policy. Entering SCHED_WRR resets the
    /// weight to the configured default.
    pub fn set_scheduler(&self, pid: Pid, policy: Policy) -> Result<()> {
        let mut guard = self
            .task_rq_lock(pid)
            .ok_or_else(|| anyhow!("no task {}", pid))?;
        let rq = &mut *guard;
        let old = rq.tasks[&pid].policy;
        let runnable = rq.tasks[&pid].state == TaskState::Runnable;
        let old_class = self.chain.class_for(old);
        let new_class = self.chain.class_for(policy);

        if rq.curr == Some(pid) {
            old_class.update_curr(rq);
        }
        old_class.dequeue_task(rq, pid);
        if let Some(task) = rq.tasks.get_mut(&pid) {
            task.policy = policy;
            if policy == Policy::Wrr {
                task.wrr.weight = self.cfg.default_weight;
            }
            new_class.switched_to(task);
        }
        if runnable {
            new_class.enqueue_task(rq, pid, EnqueuePos::Tail);
        }
        rq.resched_curr();
        debug!("wrr: pid {} {} -> {}", pid, old, policy);
        Ok(())
    }

    /// Take a CPU in or out of placement and balancing. Tasks already on it
    /// stay.
    pub fn set_online(&self, cpu: CpuId, online: bool) -> Result<()> {
        let core = self.core(cpu)?;
        core.online.store(online, Ordering::Release);
        info!("wrr: cpu {} {}", cpu, if online { "online" } else { "offline" });
        Ok(())
    }

    /// Move `pid` between two locked runqueues. The task must not be
    /// running on `src`.
    pub(crate) fn migrate_locked(&self, src: &mut Rq, dst: &mut Rq, pid: Pid) -> Result<()> {
        if src.curr == Some(pid) {
            bail!("pid {} is running on cpu {}", pid, src.cpu);
        }
        let class = self
            .chain
            .class_of(src, pid)
            .ok_or_else(|| anyhow!("pid {} is not on cpu {}", pid, src.cpu))?;
        let runnable = src.tasks[&pid].state == TaskState::Runnable;
        class.dequeue_task(src, pid);
        let mut task = src
            .tasks
            .remove(&pid)
            .ok_or_else(|| anyhow!("pid {} vanished from cpu {}", pid, src.cpu))?;
        task.cpu = dst.cpu;
        task.stats.nr_migrations += 1;
        dst.tasks.insert(pid, task);
        self.pid_index().insert(pid, dst.cpu);
        if runnable {
            class.enqueue_task(dst, pid, EnqueuePos::Head);
        }
        self.nr_migrations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn note_balance_round(&self) {
        self.nr_balance_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ClusterStats {
        let cpus = self
            .cores
            .iter()
            .map(|core| {
                let rq = core.lock();
                RqStats::from_rq(&rq, core.is_online())
            })
            .collect();
        ClusterStats {
            cpus,
            nr_tasks: self.nr_tasks(),
            nr_migrations: self.nr_migrations.load(Ordering::Relaxed),
            nr_balance_rounds: self.nr_balance_rounds.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(nr_cpus: usize) -> Cluster {
        let cfg = WrrConfig {
            base_quantum: 1,
            ..Default::default()
        };
        Cluster::new(nr_cpus, cfg).unwrap()
    }

    #[test]
    fn test_admit_places_on_least_loaded() {
        let c = cluster(3);
        let a = c.admit(TaskSpec::wrr("a", 0).weight(10)).unwrap();
        let b = c.admit(TaskSpec::wrr("b", 0).weight(5)).unwrap();
        let d = c.admit(TaskSpec::wrr("d", 0).weight(1)).unwrap();
        let e = c.admit(TaskSpec::wrr("e", 0).weight(1)).unwrap();
        assert_eq!(c.task_cpu(a), Some(CpuId(0)));
        assert_eq!(c.task_cpu(b), Some(CpuId(1)));
        assert_eq!(c.task_cpu(d), Some(CpuId(2)));
        assert_eq!(c.task_cpu(e), Some(CpuId(2)));
        assert_eq!(c.cores()[2].load(), 2);
    }

    #[test]
    fn test_admit_rejects_bad_input() {
        let c = cluster(2);
        assert!(c.admit(TaskSpec::wrr("w", 0).weight(0)).is_err());
        assert!(c.admit(TaskSpec::wrr("w", 0).weight(21)).is_err());
        assert!(c
            .admit(TaskSpec::wrr("w", 0).cpus(Cpumask::new(2)))
            .is_err());
        assert!(c
            .admit(TaskSpec::wrr("w", 0).cpus(Cpumask::all(4)))
            .is_err());
        assert_eq!(c.nr_tasks(), 0);
    }

    #[test]
    fn test_tick_schedules_idle_cpu() {
        let c = cluster(1);
        let pid = c.admit(TaskSpec::wrr("t", 0).weight(2)).unwrap();
        let r = c.tick(CpuId(0), 1_000_000).unwrap();
        assert_eq!(r.prev, None);
        assert_eq!(r.next, Some(pid));
        assert!(r.switched());
    }

    #[test]
    fn test_rotation_and_runtime() {
        let c = cluster(1);
        let a = c.admit(TaskSpec::wrr("a", 0).weight(2)).unwrap();
        let b = c.admit(TaskSpec::wrr("b", 0).weight(1)).unwrap();
        c.schedule(CpuId(0)).unwrap();
        assert_eq!(c.current(CpuId(0)), Some(a));

        let tick = c.config().tick_ns();
        assert_eq!(c.tick(CpuId(0), tick).unwrap().next, Some(a));
        let r = c.tick(CpuId(0), 2 * tick).unwrap();
        assert_eq!(r.action, Some(TickAction::Rotated));
        assert_eq!(r.next, Some(b));
        assert_eq!(c.task(a).unwrap().stats.sum_exec_runtime, 2 * tick);

        let r = c.tick(CpuId(0), 3 * tick).unwrap();
        assert_eq!(r.next, Some(a));
        assert_eq!(c.task(b).unwrap().stats.sum_exec_runtime, tick);
    }

    #[test]
    fn test_sleep_wake_and_exit() {
        let c = cluster(2);
        let a = c.admit(TaskSpec::wrr("a", 0).weight(4)).unwrap();
        assert_eq!(c.cores()[0].load(), 4);
        c.schedule(CpuId(0)).unwrap();

        c.sleep(a).unwrap();
        assert_eq!(c.cores()[0].load(), 0);
        assert_eq!(c.tick(CpuId(0), 1).unwrap().next, None);

        let busy = c.admit(TaskSpec::wrr("busy", 0).weight(6)).unwrap();
        assert_eq!(c.task_cpu(busy), Some(CpuId(0)));
        // cpu 0 now carries 6, waking moves the sleeper to cpu 1.
        assert_eq!(c.wake(a).unwrap(), CpuId(1));
        assert_eq!(c.cores()[1].load(), 4);
        assert_eq!(c.task(a).unwrap().stats.nr_migrations, 1);

        let t = c.exit(a).unwrap();
        assert_eq!(t.pid, a);
        assert_eq!(c.cores()[1].load(), 0);
        assert!(c.task(a).is_none());
        assert!(c.exit(a).is_err());
    }

    #[test]
    fn test_sleeping_task_leaves_cpu() {
        let c = cluster(2);
        let tick = c.config().tick_ns();
        let a = c.admit(TaskSpec::wrr("a", 0).weight(4)).unwrap();
        c.schedule(CpuId(0)).unwrap();
        c.tick(CpuId(0), tick).unwrap();

        c.sleep(a).unwrap();
        assert_eq!(c.current(CpuId(0)), None);
        assert_eq!(c.task(a).unwrap().stats.sum_exec_runtime, tick);

        // Woken elsewhere before cpu 0 ticks again.
        c.admit(TaskSpec::wrr("busy", 0).weight(6)).unwrap();
        assert_eq!(c.wake(a).unwrap(), CpuId(1));
        c.tick(CpuId(1), 2 * tick).unwrap();
        assert_eq!(c.current(CpuId(1)), Some(a));
        assert_ne!(c.current(CpuId(0)), Some(a));
        let r = c.tick(CpuId(0), 2 * tick).unwrap();
        assert_ne!(r.next, Some(a));
        assert!(!c.cores()[0].lock().tasks.contains_key(&a));
    }

    #[test]
    fn test_set_scheduler_resets_weight() {
        let c = cluster(1);
        let pid = c.admit(TaskSpec::wrr("t", 0).weight(3)).unwrap();
        c.set_scheduler(pid, Policy::Normal).unwrap();
        assert_eq!(c.cores()[0].load(), 0);
        assert_eq!(c.stats().cpus[0].nr_running, 1);

        c.set_scheduler(pid, Policy::Wrr).unwrap();
        let task = c.task(pid).unwrap();
        assert_eq!(task.wrr.weight, 10);
        assert_eq!(task.wrr.time_slice, 10);
        assert_eq!(c.cores()[0].load(), 10);
    }

    #[test]
    fn test_lock_two_rejects_same_cpu() {
        let c = cluster(2);
        assert!(c.lock_two(CpuId(1), CpuId(1)).is_err());
        let (a, b) = c.lock_two(CpuId(1), CpuId(0)).unwrap();
        assert_eq!(a.cpu, CpuId(1));
        assert_eq!(b.cpu, CpuId(0));
    }
}
