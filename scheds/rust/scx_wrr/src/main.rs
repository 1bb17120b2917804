// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod ticker;
use ticker::Tickers;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics_exporter_prometheus::PrometheusBuilder;
use scx_wrr_core::BalanceWorker;
use scx_wrr_core::Cluster;
use scx_wrr_core::Cpumask;
use scx_wrr_core::Workload;
use scx_wrr_core::WorkloadTracker;
use scx_wrr_core::WrrConfig;
use scx_wrr_core::WRR_MAX_WEIGHT;
use scx_wrr_core::WRR_MIN_WEIGHT;

/// scx_wrr: A weighted round-robin scheduler
///
/// Every task carries a weight between 1 and 20. Tasks on a CPU are served
/// in FIFO order and a task of weight W keeps the CPU for W times the base
/// quantum before it rotates to the back of the queue. New and waking tasks
/// go to the CPU with the lowest total weight among those they may run on.
///
/// Periodically, the load balancer compares the heaviest and the lightest
/// CPU and moves at most one queued task between them, provided the move
/// leaves the two CPUs closer together than they were.
///
/// CPUs are modeled by ticker threads, one per CPU, running the scheduler
/// tick in wall-clock time over synthetic CPU bound tasks given with
/// --task. The balancer runs on its own thread, kicked by the tickers.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of CPUs to model.
    #[clap(short = 'n', long, default_value = "4")]
    cpus: usize,

    /// Scheduler tick period in microseconds.
    #[clap(short = 't', long, default_value = "1000")]
    tick_us: u64,

    /// Ticks granted per unit of weight.
    #[clap(short = 'q', long, default_value = "10")]
    quantum: u32,

    /// Load balance interval in milliseconds.
    #[clap(short = 'i', long, default_value = "2000")]
    balance_interval_ms: u64,

    /// Disable load balancing.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_load_balance: bool,

    /// Spinning task as WEIGHT[@CPULIST], e.g. 10 or 5@0-1,3. May be given
    /// multiple times.
    #[clap(long = "task", value_name = "WEIGHT[@CPULIST]")]
    tasks: Vec<String>,

    /// Turnaround run: add one task of every weight needing this many ticks
    /// of CPU time and exit once all of them completed.
    #[clap(long, value_name = "WORK_TICKS")]
    turnaround: Option<u64>,

    /// Stop after this many seconds.
    #[clap(short = 'd', long)]
    duration: Option<f64>,

    /// Statistics reporting interval in seconds.
    #[clap(short = 's', long, default_value = "1.0")]
    stats_interval: f64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

fn parse_task(arg: &str, nr_cpus: usize) -> Result<Workload> {
    let (weight, cpus) = match arg.split_once('@') {
        Some((w, list)) => (w, Some(Cpumask::from_cpulist(nr_cpus, list)?)),
        None => (arg, None),
    };
    let weight: u32 = weight
        .trim()
        .parse()
        .with_context(|| format!("Invalid weight in task {:?}", arg))?;
    if !(WRR_MIN_WEIGHT..=WRR_MAX_WEIGHT).contains(&weight) {
        bail!(
            "Task weight {} is outside [{}, {}]",
            weight,
            WRR_MIN_WEIGHT,
            WRR_MAX_WEIGHT
        );
    }
    Ok(Workload::Spin { weight, cpus })
}

struct Metrics {
    nr_tasks: Gauge,
    total_weight: Gauge,
    imbalance: Histogram,
    migrations: Counter,
    lb_rounds: Counter,
}

impl Metrics {
    fn new() -> Self {
        Metrics {
            nr_tasks: gauge!("wrr_tasks"),
            total_weight: gauge!("wrr_total_weight"),
            imbalance: histogram!("wrr_load_imbalance"),
            migrations: counter!("wrr_migrations_total"),
            lb_rounds: counter!("wrr_load_balance_total"),
        }
    }
}

struct Scheduler {
    cluster: Arc<Cluster>,
    tracker: Arc<WorkloadTracker>,
    balancer: Option<BalanceWorker>,
    stats_interval: Duration,
    duration: Option<Duration>,
    turnaround: bool,
    verbose: bool,
    metrics: Metrics,
}

impl Scheduler {
    fn init(opts: &Opts) -> Result<Self> {
        if opts.tick_us == 0 {
            bail!("--tick-us must be positive");
        }
        if opts.stats_interval <= 0.0 {
            bail!("--stats-interval must be positive");
        }
        let cfg = WrrConfig {
            base_quantum: opts.quantum,
            tick_interval: Duration::from_micros(opts.tick_us),
            balance_interval: Duration::from_millis(opts.balance_interval_ms),
            ..Default::default()
        };
        let cluster = Arc::new(Cluster::new(opts.cpus, cfg)?);
        let tracker = Arc::new(WorkloadTracker::new());

        for arg in opts.tasks.iter() {
            let workload = parse_task(arg, opts.cpus)?;
            let pid = tracker.spawn(&cluster, 0, &workload, 0)?;
            info!("Task {} weight {} from {:?}", pid, workload.weight(), arg);
        }
        if let Some(ticks) = opts.turnaround {
            let work = ticks * cluster.config().tick_ns();
            for weight in WRR_MIN_WEIGHT..=WRR_MAX_WEIGHT {
                tracker.spawn(&cluster, 0, &Workload::Finite { weight, work }, 0)?;
            }
        }
        if cluster.nr_tasks() == 0 {
            warn!("No tasks given, CPUs will stay idle");
        }

        let balancer = if opts.no_load_balance {
            None
        } else {
            Some(BalanceWorker::spawn(cluster.clone())?)
        };

        info!("WRR scheduler started");
        Ok(Self {
            cluster,
            tracker,
            balancer,
            stats_interval: Duration::from_secs_f64(opts.stats_interval),
            duration: opts.duration.map(Duration::from_secs_f64),
            turnaround: opts.turnaround.is_some(),
            verbose: opts.verbose > 0,
            metrics: Metrics::new(),
        })
    }

    fn report(&mut self, elapsed: Duration) -> Result<()> {
        let stats = self.cluster.stats();
        self.metrics.nr_tasks.set(stats.nr_tasks as f64);
        self.metrics.total_weight.set(stats.total_weight() as f64);
        self.metrics.imbalance.record(stats.imbalance() as f64);
        self.metrics.migrations.absolute(stats.nr_migrations);
        self.metrics.lb_rounds.absolute(stats.nr_balance_rounds);

        let mut buf = Vec::new();
        stats.format(&mut buf, self.verbose)?;
        info!("t={:.1}s", elapsed.as_secs_f64());
        for line in String::from_utf8_lossy(&buf).lines() {
            info!("{}", line);
        }
        Ok(())
    }

    fn report_turnaround(&self) {
        let mut done = self.tracker.completions();
        done.sort_by_key(|c| c.weight);
        info!("Turnaround by weight:");
        for c in done.iter() {
            info!(
                "  weight {:2}: {:8.3}ms on CPU {}",
                c.weight,
                c.turnaround() as f64 / 1_000_000.0,
                c.cpu
            );
        }
        if self.tracker.pending() > 0 {
            warn!("{} tasks did not complete", self.tracker.pending());
        }
    }

    fn finished(&self, elapsed: Duration) -> bool {
        if self.duration.map_or(false, |d| elapsed >= d) {
            return true;
        }
        self.turnaround && self.tracker.pending() == 0
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let started_at = Instant::now();
        let tickers = Tickers::spawn(
            &self.cluster,
            &self.tracker,
            self.balancer.as_ref().map(|b| b.handle()),
            started_at,
            &shutdown,
        )?;

        let mut next_stats_at = started_at + self.stats_interval;
        while !shutdown.load(Ordering::Relaxed) && !self.finished(started_at.elapsed()) {
            let now = Instant::now();
            if now >= next_stats_at {
                self.report(now.duration_since(started_at))?;
                next_stats_at += self.stats_interval;
                if next_stats_at < now {
                    next_stats_at = now + self.stats_interval;
                }
            }
            std::thread::sleep(
                next_stats_at
                    .saturating_duration_since(Instant::now())
                    .min(Duration::from_millis(100)),
            );
        }

        shutdown.store(true, Ordering::Relaxed);
        tickers.join()?;
        if let Some(balancer) = self.balancer.take() {
            let lb = balancer.shutdown()?;
            info!(
                "Load balancer: {} rounds, {} migrations",
                lb.nr_rounds(),
                lb.nr_migrations()
            );
        }
        self.report(started_at.elapsed())?;
        if self.turnaround {
            self.report_turnaround();
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let mut sched = Scheduler::init(&opts)?;
    sched.run(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task() {
        match parse_task("7", 4).unwrap() {
            Workload::Spin { weight, cpus } => {
                assert_eq!(weight, 7);
                assert!(cpus.is_none());
            }
            w => panic!("unexpected {:?}", w),
        }
        match parse_task("3@1-2", 4).unwrap() {
            Workload::Spin { weight, cpus } => {
                assert_eq!(weight, 3);
                let cpus = cpus.unwrap();
                assert_eq!(cpus.iter().collect::<Vec<_>>(), vec![1, 2]);
            }
            w => panic!("unexpected {:?}", w),
        }
        assert!(parse_task("0", 4).is_err());
        assert!(parse_task("21", 4).is_err());
        assert!(parse_task("x", 4).is_err());
        assert!(parse_task("5@9", 4).is_err());
    }
}
