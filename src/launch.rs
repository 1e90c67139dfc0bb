// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task set start-up and tear-down.
//!
//! Every task gets its own OS thread, which applies its scheduling policy
//! and affinity to itself and reports back before any task loop begins.
//! Tasks are released together only once all of them are configured; if
//! any one fails, the whole launch fails and nobody runs. A task that fails
//! later raises the shutdown flag so the rest of the set stops with it.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel;
use log::debug;
use log::info;
use log::warn;

use crate::config::utilization_bound;
use crate::config::TaskSetConfig;
use crate::policy;
use crate::resource::SharedResource;
use crate::stats::TaskStats;
use crate::stats::TaskStatsSnapshot;
use crate::task::PeriodicTask;

type Step = Box<dyn FnOnce() -> Result<()> + Send>;

/// What one task thread does: configure itself, then run.
struct TaskThread {
    name: String,
    stats: Arc<TaskStats>,
    setup: Step,
    body: Step,
}

struct RunningTask {
    name: String,
    stats: Arc<TaskStats>,
    handle: JoinHandle<Result<()>>,
}

pub struct TaskSet {
    tasks: Vec<RunningTask>,
    shutdown: Arc<AtomicBool>,
}

/// Estimated workload time over period, summed over the set.
pub fn estimate_utilization(cfg: &TaskSetConfig) -> f64 {
    cfg.tasks
        .iter()
        .map(|t| t.workload.estimate_ns() as f64 / (t.period_us as f64 * 1000.0))
        .sum()
}

fn check_cpus_present(cfg: &TaskSetConfig) -> Result<()> {
    let nr_cpus = policy::nr_cpus_configured();
    for task in &cfg.tasks {
        if let Some(&cpu) = task.cpus.iter().find(|&&c| c >= nr_cpus) {
            bail!(
                "{}: CPU {} requested but only {} CPUs are configured",
                task.name,
                cpu,
                nr_cpus
            );
        }
    }
    Ok(())
}

/// Configure and start every task in `cfg`. Raising `shutdown` later stops
/// them at their next suspension point.
pub fn launch(cfg: &TaskSetConfig, shutdown: Arc<AtomicBool>) -> Result<TaskSet> {
    cfg.validate()?;
    check_cpus_present(cfg)?;

    for (a, b) in cfg.rate_monotonic_violations() {
        warn!("{} has a shorter period than {} but not a higher priority", a, b);
    }

    let util = estimate_utilization(cfg);
    info!(
        "Regime: {:?}, policy: {:?}, clock: {:?}, utilization ~{:.3} (RM bound {:.3})",
        cfg.regime,
        cfg.policy,
        cfg.clock,
        util,
        utilization_bound(cfg.tasks.len())
    );

    // Created before any task starts, freed once the last holder is gone.
    let resource = if cfg.needs_resource() {
        let resource = SharedResource::new(cfg.lock_protocol)?;
        info!("Shared resource lock protocol: {:?}", resource.protocol());
        Some(Arc::new(resource))
    } else {
        None
    };

    let built = cfg
        .tasks
        .iter()
        .map(|spec| {
            PeriodicTask::new(
                spec.clone(),
                cfg.regime,
                cfg.clock,
                resource.clone(),
                shutdown.clone(),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    for spec in &cfg.tasks {
        info!(
            "{}: period {}us, priority {}, cpus {:?}, resource {}",
            spec.name,
            spec.period_us,
            spec.priority,
            spec.cpus,
            spec.contends(cfg.regime)
        );
    }

    let threads = cfg
        .tasks
        .iter()
        .zip(built)
        .map(|(spec, task)| {
            let name = spec.name.clone();
            let sched_policy = cfg.policy;
            let priority = spec.priority;
            let cpus = spec.cpus.clone();
            TaskThread {
                name: spec.name.clone(),
                stats: task.stats(),
                setup: Box::new(move || -> Result<()> {
                    policy::apply_current_thread(sched_policy, priority)?;
                    policy::pin_current_thread(&cpus)?;
                    let (achieved, prio) = policy::current_thread_policy()?;
                    debug!(
                        "{}: running {:?} priority {} on CPUs {:?}",
                        name,
                        achieved,
                        prio,
                        policy::current_affinity()?
                    );
                    Ok(())
                }),
                body: Box::new(move || task.run()),
            }
        })
        .collect();

    start(threads, shutdown)
}

/// Spawn one thread per entry, wait for every setup to report, then release
/// them all at once. Any setup failure stops the whole set before a single
/// body runs.
fn start(threads: Vec<TaskThread>, shutdown: Arc<AtomicBool>) -> Result<TaskSet> {
    let (ready_tx, ready_rx) = channel::unbounded::<(usize, Result<()>)>();
    // Never sent on. Dropping it releases every task at once.
    let (start_tx, start_rx) = channel::bounded::<()>(0);

    let names: Vec<String> = threads.iter().map(|t| t.name.clone()).collect();
    let mut tasks: Vec<RunningTask> = Vec::with_capacity(threads.len());
    for (idx, entry) in threads.into_iter().enumerate() {
        let TaskThread {
            name,
            stats,
            setup,
            body,
        } = entry;
        let ready_tx = ready_tx.clone();
        let start_rx = start_rx.clone();
        let shutdown_clone = shutdown.clone();

        let spawned = thread::Builder::new()
            .name(format!("rmstask{}", idx + 1))
            .spawn(move || -> Result<()> {
                let setup = setup();
                let ok = setup.is_ok();
                let _ = ready_tx.send((idx, setup));
                drop(ready_tx);

                // Err once the launcher drops the start sender.
                let _ = start_rx.recv();
                if !ok || shutdown_clone.load(Ordering::Relaxed) {
                    return Ok(());
                }

                let res = body();
                if res.is_err() {
                    // Others may be blocked on a resource this task held.
                    shutdown_clone.store(true, Ordering::Relaxed);
                }
                res
            });

        match spawned {
            Ok(handle) => tasks.push(RunningTask {
                name,
                stats,
                handle,
            }),
            Err(e) => {
                abort(&shutdown, start_tx, tasks);
                return Err(anyhow!(e).context(format!("Failed to spawn thread for {}", name)));
            }
        }
    }
    drop(ready_tx);

    let mut failure: Option<anyhow::Error> = None;
    for _ in 0..tasks.len() {
        match ready_rx.recv() {
            Ok((_, Ok(()))) => {}
            Ok((idx, Err(e))) => {
                if failure.is_none() {
                    failure = Some(e.context(format!("Failed to configure {}", names[idx])));
                }
            }
            Err(_) => {
                failure.get_or_insert_with(|| anyhow!("A task thread exited during start-up"));
                break;
            }
        }
    }

    if let Some(e) = failure {
        abort(&shutdown, start_tx, tasks);
        return Err(e);
    }

    drop(start_tx);
    Ok(TaskSet { tasks, shutdown })
}

fn abort(shutdown: &AtomicBool, start_tx: channel::Sender<()>, tasks: Vec<RunningTask>) {
    shutdown.store(true, Ordering::Relaxed);
    drop(start_tx);
    for task in tasks {
        let _ = task.handle.join();
    }
}

impl TaskSet {
    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// True once every task thread has returned.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.handle.is_finished())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for every task to return. The first task error, or a panic,
    /// is returned after all threads are joined.
    pub fn join(self) -> Result<Vec<(String, TaskStatsSnapshot)>> {
        let mut first_err: Option<anyhow::Error> = None;
        let mut out = Vec::with_capacity(self.tasks.len());

        for task in self.tasks {
            let res = match task.handle.join() {
                Ok(res) => res.with_context(|| format!("{} failed", task.name)),
                Err(_) => Err(anyhow!("{} panicked", task.name)),
            };
            if let Err(e) = res {
                self.shutdown.store(true, Ordering::Relaxed);
                first_err.get_or_insert(e);
            }
            out.push((task.name, task.stats.snapshot()));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Regime;
    use crate::config::TaskSpec;
    use crate::policy::SchedPolicy;
    use crate::resource::LockProtocol;
    use crate::time::Clock;
    use crate::workload::Workload;
    use std::time::Duration;
    use std::time::Instant;

    fn one_task_config(cpus: Vec<usize>) -> TaskSetConfig {
        let mut spec = TaskSpec::new("Task 1", 10_000, 1);
        spec.workload = Workload { outer: 1, inner: 10 };
        spec.cpus = cpus;
        spec.max_cycles = Some(2);
        TaskSetConfig {
            regime: Regime::RateMonotonic,
            policy: SchedPolicy::Other,
            clock: Clock::Monotonic,
            lock_protocol: LockProtocol::None,
            tasks: vec![spec],
        }
    }

    // A real periodic task that only stops on shutdown.
    fn endless_thread(name: &str, shutdown: &Arc<AtomicBool>) -> TaskThread {
        let mut spec = TaskSpec::new(name, 10_000, 1);
        spec.workload = Workload { outer: 1, inner: 10 };
        let task = PeriodicTask::new(
            spec,
            Regime::RateMonotonic,
            Clock::Monotonic,
            None,
            shutdown.clone(),
        )
        .unwrap();
        TaskThread {
            name: name.to_string(),
            stats: task.stats(),
            setup: Box::new(|| Ok(())),
            body: Box::new(move || task.run()),
        }
    }

    #[test]
    fn test_launch_and_join() {
        let set = launch(&one_task_config(vec![]), Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(set.names(), vec!["Task 1"]);
        let stats = set.join().unwrap();
        assert_eq!(stats[0].1.cycles, 2);
    }

    #[test]
    fn test_missing_cpu_is_fatal() {
        let cfg = one_task_config(vec![policy::nr_cpus_configured()]);
        assert!(launch(&cfg, Arc::new(AtomicBool::new(false))).is_err());
    }

    #[test]
    fn test_bad_priority_is_fatal() {
        let mut cfg = one_task_config(vec![]);
        cfg.policy = SchedPolicy::Fifo;
        cfg.tasks[0].priority = 1000;
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(launch(&cfg, shutdown.clone()).is_err());
        assert!(shutdown.load(Ordering::Relaxed));
    }

    #[test]
    fn test_one_setup_failure_runs_no_task() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = vec![
            endless_thread("Task 1", &shutdown),
            endless_thread("Task 2", &shutdown),
            endless_thread("Task 3", &shutdown),
        ];
        threads[1].setup = Box::new(|| -> Result<()> { bail!("no such CPU") });
        let stats: Vec<Arc<TaskStats>> = threads.iter().map(|t| t.stats.clone()).collect();

        let err = start(threads, shutdown.clone()).err().unwrap();
        assert!(format!("{:#}", err).contains("Failed to configure Task 2"));
        assert!(shutdown.load(Ordering::Relaxed));
        for s in &stats {
            assert_eq!(s.snapshot().cycles, 0);
        }
    }

    #[test]
    fn test_task_error_stops_the_set() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let failing = TaskThread {
            name: "Task 3".to_string(),
            stats: Arc::new(TaskStats::new()),
            setup: Box::new(|| Ok(())),
            body: Box::new(|| -> Result<()> {
                thread::sleep(Duration::from_millis(50));
                bail!("pthread_mutex_unlock failed")
            }),
        };
        let set = start(
            vec![endless_thread("Task 1", &shutdown), failing],
            shutdown.clone(),
        )
        .unwrap();

        let begin = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            assert!(begin.elapsed() < Duration::from_secs(2), "SHUTDOWN NEVER RAISED");
            thread::sleep(Duration::from_millis(10));
        }

        let err = set.join().err().unwrap();
        assert!(format!("{:#}", err).contains("Task 3 failed"));
        assert!(begin.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_estimate_utilization_nonnegative() {
        let cfg = one_task_config(vec![]);
        let u = estimate_utilization(&cfg);
        assert!(u >= 0.0);
        assert!(u < 1.0);
    }
}
