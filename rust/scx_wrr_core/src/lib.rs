// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # scx_wrr_core
//!
//! Weighted round-robin scheduling class for a multi-CPU machine.
//!
//! Every runnable task carries a weight in [1, 20]. Tasks on a CPU take
//! turns in FIFO order, and a task of weight `w` keeps the CPU for
//! `w * base_quantum` ticks per turn. Across CPUs, new and waking tasks are
//! placed on the CPU with the lowest aggregate weight, and a periodic
//! balancer moves at most one task per round from the heaviest to the
//! lightest CPU.
//!
//! # Architecture
//!
//! - **Runqueue**: per-CPU FIFO of WRR entities with weight accounting
//! - **Classes**: `SchedClass` trait, WRR first and a FIFO fallback below
//! - **Cluster**: per-CPU locked runqueues, admission, wake/sleep/exit, tick
//! - **Placement**: least loaded CPU within the task's affinity mask
//! - **Load balancer**: single-flight periodic migration, inline or on a
//!   background worker
//! - **Weight control**: `sched_setweight`/`sched_getweight` with
//!   permission checks
//! - **Simulator**: deterministic lockstep driver for tests and experiments

#[macro_use]
extern crate static_assertions;

pub mod cluster;
pub mod config;
pub mod cpumask;
pub mod load_balance;
pub mod placement;
pub mod rq;
pub mod runqueue;
pub mod sched_class;
pub mod sim;
pub mod stats;
pub mod task;
pub mod types;
pub mod weight;
pub mod workload;
pub mod wrr;

pub use cluster::Cluster;
pub use cluster::Core;
pub use cluster::TickReport;
pub use config::WrrConfig;
pub use cpumask::Cpumask;
pub use load_balance::BalanceHandle;
pub use load_balance::BalanceOutcome;
pub use load_balance::BalanceStat;
pub use load_balance::BalanceTrigger;
pub use load_balance::BalanceWorker;
pub use load_balance::LoadBalancer;
pub use placement::select_least_loaded;
pub use runqueue::EnqueuePos;
pub use runqueue::WrrRq;
pub use sched_class::SchedClass;
pub use sched_class::TickAction;
pub use sim::Simulator;
pub use sim::Trace;
pub use sim::TraceEvent;
pub use sim::TraceKind;
pub use stats::ClusterStats;
pub use stats::RqStats;
pub use task::Task;
pub use task::TaskSpec;
pub use task::WrrEntity;
pub use types::CpuId;
pub use types::Pid;
pub use types::Policy;
pub use types::TimeNs;
pub use types::WRR_DEFAULT_WEIGHT;
pub use types::WRR_MAX_WEIGHT;
pub use types::WRR_MIN_WEIGHT;
pub use weight::get_weight;
pub use weight::set_weight;
pub use weight::syscall;
pub use weight::Credentials;
pub use weight::SchedError;
pub use workload::Completion;
pub use workload::Workload;
pub use workload::WorkloadTracker;
