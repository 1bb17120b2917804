// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use metrics::counter;
use metrics::histogram;
use scx_wrr_core::BalanceHandle;
use scx_wrr_core::Cluster;
use scx_wrr_core::CpuId;
use scx_wrr_core::TickAction;
use scx_wrr_core::TimeNs;
use scx_wrr_core::WorkloadTracker;

/// One thread per CPU driving its scheduler tick in wall-clock time.
pub struct Tickers {
    threads: Vec<thread::JoinHandle<Result<()>>>,
}

impl Tickers {
    pub fn spawn(
        cluster: &Arc<Cluster>,
        tracker: &Arc<WorkloadTracker>,
        balance: Option<BalanceHandle>,
        started_at: Instant,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut threads = vec![];
        for core in cluster.cores() {
            let cpu = core.id();
            let cluster = cluster.clone();
            let tracker = tracker.clone();
            let balance = balance.clone();
            let shutdown = shutdown.clone();
            let join = thread::Builder::new()
                .name(format!("wrr-cpu{}", cpu))
                .spawn(move || {
                    tick_loop(cpu, &cluster, &tracker, balance.as_ref(), started_at, &shutdown)
                })
                .with_context(|| format!("Failed to spawn ticker for CPU {}", cpu))?;
            threads.push(join);
        }
        Ok(Self { threads })
    }

    /// Wait for every ticker. Fails with the first error any of them hit.
    pub fn join(self) -> Result<()> {
        let mut res = Ok(());
        for join in self.threads {
            let r = join
                .join()
                .map_err(|_| anyhow!("ticker thread panicked"))
                .and_then(|r| r);
            if res.is_ok() {
                res = r;
            }
        }
        res
    }
}

fn tick_loop(
    cpu: CpuId,
    cluster: &Cluster,
    tracker: &WorkloadTracker,
    balance: Option<&BalanceHandle>,
    started_at: Instant,
    shutdown: &AtomicBool,
) -> Result<()> {
    let interval = cluster.config().tick_interval;
    let switches = counter!("wrr_context_switches_total", "cpu" => cpu.to_string());
    let rotations = counter!("wrr_slice_expired_total", "cpu" => cpu.to_string());
    let turnaround = histogram!("wrr_turnaround_ms");
    let mut next_tick_at = Instant::now() + interval;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next_tick_at {
            thread::sleep(next_tick_at - now);
            continue;
        }

        let ts = started_at.elapsed().as_nanos() as TimeNs;
        let r = cluster.tick(cpu, ts)?;
        if r.switched() {
            switches.increment(1);
        }
        if r.action == Some(TickAction::Rotated) {
            rotations.increment(1);
        }
        if let Some(done) = tracker.reap(cluster, cpu, ts)? {
            turnaround.record(done.turnaround() as f64 / 1_000_000.0);
        }
        if let Some(balance) = balance {
            balance.kick(ts);
        }

        next_tick_at += interval;
        if next_tick_at < now {
            // Overran by more than a tick, don't try to catch up.
            next_tick_at = now + interval;
        }
    }
    debug!("ticker for CPU {} exiting", cpu);
    Ok(())
}
