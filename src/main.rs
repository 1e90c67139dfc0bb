// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;

use scx_rmsdemo::config::DEFAULT_FIRST_CPU;
use scx_rmsdemo::workload::WorkloadPreset;
use scx_rmsdemo::Clock;
use scx_rmsdemo::CoreMode;
use scx_rmsdemo::LockProtocol;
use scx_rmsdemo::Regime;
use scx_rmsdemo::SchedPolicy;
use scx_rmsdemo::TaskSetConfig;
use scx_rmsdemo::Workload;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// scx_rmsdemo: fixed-priority periodic tasks on SCHED_FIFO threads.
///
/// Runs three periodic tasks (100ms, 200ms, 300ms) with rate-monotonic
/// priorities and reports, every period, whether each one met its deadline.
/// With --regime priority-inversion the fastest and the slowest task share
/// a lock that the slowest one holds for 120ms, which makes the fastest
/// task miss deadlines. Real-time priorities need CAP_SYS_NICE.
#[derive(Debug, Parser)]
#[command(version = VERSION)]
struct Opts {
    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Task set as a JSON file path or inline JSON. Replaces the built-in
    /// three-task set; --cores, --cpu and --workload are then ignored.
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Scheduling regime.
    #[clap(short = 'r', long, value_enum)]
    regime: Option<Regime>,

    /// Pin all tasks to one CPU, or each task to its own.
    #[clap(long, value_enum, default_value = "single")]
    cores: CoreMode,

    /// First CPU to pin to.
    #[clap(long, default_value_t = DEFAULT_FIRST_CPU)]
    cpu: usize,

    /// Synthetic workload per period.
    #[clap(short = 'w', long, value_enum, default_value = "fixed")]
    workload: WorkloadPreset,

    /// OS scheduling policy. "other" runs without real-time priorities.
    #[clap(short = 'p', long, value_enum)]
    policy: Option<SchedPolicy>,

    /// Clock used for release times.
    #[clap(long, value_enum)]
    clock: Option<Clock>,

    /// Use a priority-inheritance mutex for the shared resource.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    inherit: bool,

    /// Stop after this many seconds (0 = run until interrupted).
    #[clap(short = 'd', long, default_value = "0")]
    duration: u64,

    /// Print the effective task set as JSON and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_config: bool,
}

fn init_logger(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);

    Ok(simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?)
}

fn build_config(opts: &Opts) -> Result<TaskSetConfig> {
    let mut cfg = match &opts.config {
        Some(input) => TaskSetConfig::parse(input)?,
        None => TaskSetConfig::three_task(
            opts.regime.unwrap_or_default(),
            opts.cores,
            opts.cpu,
            Workload::preset(opts.workload),
        ),
    };

    if let Some(regime) = opts.regime {
        cfg.regime = regime;
    }
    if let Some(policy) = opts.policy {
        cfg.policy = policy;
    }
    if let Some(clock) = opts.clock {
        cfg.clock = clock;
    }
    if opts.inherit {
        cfg.lock_protocol = LockProtocol::Inherit;
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    init_logger(opts.verbose)?;
    let cfg = build_config(&opts)?;

    if opts.dump_config {
        println!("{}", cfg.to_json()?);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    info!("scx_rmsdemo {}", VERSION);
    let set = scx_rmsdemo::launch(&cfg, shutdown.clone())?;

    let deadline = (opts.duration > 0).then(|| Instant::now() + Duration::from_secs(opts.duration));
    while !shutdown.load(Ordering::Relaxed) && !set.is_finished() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down");
    set.shutdown();
    let stats = set.join()?;
    for (name, snap) in &stats {
        snap.log_summary(name);
    }
    Ok(())
}
