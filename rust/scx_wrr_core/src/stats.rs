// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use anyhow::Result;

use crate::rq::Rq;
use crate::types::CpuId;
use crate::types::Pid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub pid: Pid,
    pub weight: u32,
    pub time_slice: u32,
    pub sum_exec_runtime: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RqStats {
    pub cpu: CpuId,
    pub online: bool,
    pub curr: Option<Pid>,
    /// Runnable tasks of every class.
    pub nr_running: usize,
    pub wrr_nr_running: u32,
    pub total_weight: u64,
    pub nr_switches: u64,
    /// WRR queue in dispatch order.
    pub queue: Vec<QueueEntry>,
}

impl RqStats {
    pub fn from_rq(rq: &Rq, online: bool) -> Self {
        let queue = rq
            .wrr
            .iter()
            .filter_map(|pid| rq.tasks.get(&pid))
            .map(|t| QueueEntry {
                pid: t.pid,
                weight: t.wrr.weight,
                time_slice: t.wrr.time_slice,
                sum_exec_runtime: t.stats.sum_exec_runtime,
            })
            .collect();
        Self {
            cpu: rq.cpu,
            online,
            curr: rq.curr,
            nr_running: rq.nr_running(),
            wrr_nr_running: rq.wrr.nr_running(),
            total_weight: rq.wrr.total_weight(),
            nr_switches: rq.nr_switches,
            queue,
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let curr = match self.curr {
            Some(pid) => format!("{:>6}", pid.0),
            None => format!("{:>6}", "-"),
        };
        writeln!(
            w,
            "  CPU[{:02}]{} curr={} nr_running={:3} wrr={:3} total_weight={:4} switches={}",
            self.cpu.0,
            if self.online { "" } else { " (offline)" },
            curr,
            self.nr_running,
            self.wrr_nr_running,
            self.total_weight,
            self.nr_switches
        )?;
        for e in self.queue.iter() {
            writeln!(
                w,
                "    [pid: {:05}] weight={:2} slice={:4} runtime={:.3}s",
                e.pid.0,
                e.weight,
                e.time_slice,
                e.sum_exec_runtime as f64 / 1_000_000_000.0
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClusterStats {
    pub cpus: Vec<RqStats>,
    pub nr_tasks: usize,
    pub nr_migrations: u64,
    pub nr_balance_rounds: u64,
}

impl ClusterStats {
    pub fn total_weight(&self) -> u64 {
        self.cpus.iter().map(|c| c.total_weight).sum()
    }

    /// Heaviest minus lightest online CPU.
    pub fn imbalance(&self) -> u64 {
        let online = || self.cpus.iter().filter(|c| c.online).map(|c| c.total_weight);
        match (online().max(), online().min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        }
    }

    pub fn format<W: Write>(&self, w: &mut W, verbose: bool) -> Result<()> {
        writeln!(
            w,
            "tasks={:4} total_weight={:5} imbal={:4} lb_rounds={} migrations={}",
            self.nr_tasks,
            self.total_weight(),
            self.imbalance(),
            self.nr_balance_rounds,
            self.nr_migrations
        )?;
        for cpu in self.cpus.iter() {
            if verbose {
                cpu.format(w)?;
            } else {
                RqStats {
                    queue: vec![],
                    ..cpu.clone()
                }
                .format(w)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::config::WrrConfig;
    use crate::task::TaskSpec;

    #[test]
    fn test_format_dump() {
        let c = Cluster::new(2, WrrConfig::default()).unwrap();
        c.admit(TaskSpec::wrr("a", 0).weight(7)).unwrap();
        c.admit(TaskSpec::wrr("b", 0).weight(2)).unwrap();
        c.set_online(CpuId(1), false).unwrap();

        let stats = c.stats();
        assert_eq!(stats.total_weight(), 9);
        assert_eq!(stats.imbalance(), 0);

        let mut out = Vec::new();
        stats.format(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("tasks=   2 total_weight=    9"));
        assert!(text.contains("CPU[01] (offline)"));
        assert!(text.contains("[pid: 00001] weight= 7 slice=  70"));
    }
}
