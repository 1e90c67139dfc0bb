// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The periodic task loop.
//!
//! Each period a task optionally takes the shared resource, burns its
//! workload, advances its release time by exactly one period and compares
//! the completion time against it, then sleeps until that absolute release
//! time. A miss is reported and the task simply continues with the next
//! period; it never tries to catch up on the one it lost.

use std::cmp::Ordering;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::config::Regime;
use crate::config::TaskSpec;
use crate::resource::SharedResource;
use crate::stats::TaskStats;
use crate::time::compare;
use crate::time::diff_ns;
use crate::time::elapsed;
use crate::time::sleep_until_or_shutdown;
use crate::time::Clock;
use crate::time::TimePoint;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    Met { slack_ns: u64 },
    Missed { late_ns: u64 },
}

impl Deadline {
    pub fn is_missed(&self) -> bool {
        matches!(self, Deadline::Missed { .. })
    }
}

/// Timing state owned by a single task thread.
#[derive(Clone, Copy, Debug)]
pub struct TaskRunState {
    next_release: TimePoint,
    last_completion: TimePoint,
}

impl TaskRunState {
    pub fn new(baseline: TimePoint) -> Self {
        Self {
            next_release: baseline,
            last_completion: baseline,
        }
    }

    pub fn next_release(&self) -> TimePoint {
        self.next_release
    }

    pub fn last_completion(&self) -> TimePoint {
        self.last_completion
    }

    /// Close the current period at `now`.
    ///
    /// The release time moves forward by exactly `period_us` whatever the
    /// outcome, and `now` is checked against the advanced value. Completing
    /// at or after it is a miss.
    pub fn complete_period(&mut self, period_us: u64, now: TimePoint) -> Deadline {
        self.next_release = self.next_release.advance(period_us);
        self.last_completion = now;
        match compare(&now, &self.next_release) {
            Ordering::Less => Deadline::Met {
                slack_ns: diff_ns(&self.next_release, &now) as u64,
            },
            _ => Deadline::Missed {
                late_ns: diff_ns(&now, &self.next_release) as u64,
            },
        }
    }
}

pub struct PeriodicTask {
    spec: TaskSpec,
    clock: Clock,
    resource: Option<Arc<SharedResource>>,
    stats: Arc<TaskStats>,
    shutdown: Arc<AtomicBool>,
}

impl PeriodicTask {
    /// The resource handle is kept only if the task contends for it under
    /// `regime`.
    pub fn new(
        spec: TaskSpec,
        regime: Regime,
        clock: Clock,
        resource: Option<Arc<SharedResource>>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let resource = if spec.contends(regime) {
            match resource {
                Some(r) => Some(r),
                None => bail!("{}: uses the shared resource but none was provided", spec.name),
            }
        } else {
            None
        };

        Ok(Self {
            spec,
            clock,
            resource,
            stats: Arc::new(TaskStats::new()),
            shutdown,
        })
    }

    pub fn stats(&self) -> Arc<TaskStats> {
        self.stats.clone()
    }

    /// Run until shutdown, `max_cycles`, or an unrecoverable error.
    pub fn run(&self) -> Result<()> {
        let mut state =
            TaskRunState::new(TimePoint::now(self.clock).advance(self.spec.offset_us));
        if self.spec.offset_us > 0 && !self.sleep_until(state.next_release())? {
            return Ok(());
        }

        let mut cycles: u64 = 0;
        while !self.shutdown.load(AtomicOrdering::Relaxed) {
            if !self.access_resource()? {
                break;
            }

            self.spec.workload.run();

            let outcome = state.complete_period(self.spec.period_us, TimePoint::now(self.clock));
            self.report(outcome);
            cycles += 1;

            if self.spec.max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            if !self.sleep_until(state.next_release())? {
                break;
            }
        }

        debug!("{}: stopped after {} periods", self.spec.name, cycles);
        Ok(())
    }

    fn sleep_until(&self, t: TimePoint) -> Result<bool> {
        sleep_until_or_shutdown(t, self.clock, &self.shutdown)
    }

    // Returns false if shutdown interrupted the critical section.
    fn access_resource(&self) -> Result<bool> {
        let resource = match &self.resource {
            Some(r) => r,
            None => return Ok(true),
        };
        let name = &self.spec.name;

        info!("{}: Trying to access shared resource", name);
        let start = TimePoint::now(self.clock);
        let guard = match resource.acquire(&self.shutdown)? {
            Some(guard) => guard,
            None => return Ok(false),
        };
        let acquired = TimePoint::now(self.clock);
        self.stats.record_acquisition(diff_ns(&acquired, &start).max(0) as u64);
        debug!("{}: blocked {:.6}s on shared resource", name, elapsed(&acquired, &start));

        if self.spec.hold_us == 0 {
            guard.release()?;
            info!("{}: Accessed shared resource", name);
            return Ok(true);
        }

        info!("{}: Holding shared resource for {}us", name, self.spec.hold_us);
        let until = TimePoint::now(self.clock).advance(self.spec.hold_us);
        let completed = self.sleep_until(until)?;
        guard.release()?;
        info!("{}: Released shared resource", name);
        Ok(completed)
    }

    fn report(&self, outcome: Deadline) {
        match outcome {
            Deadline::Met { slack_ns } => {
                self.stats.record_met();
                info!("{}: Deadline met", self.spec.name);
                debug!("{}: slack {:.3}ms", self.spec.name, slack_ns as f64 / 1_000_000.0);
            }
            Deadline::Missed { late_ns } => {
                self.stats.record_missed(late_ns);
                warn!(
                    "{}: Missed deadline (late by {:.3}ms)",
                    self.spec.name,
                    late_ns as f64 / 1_000_000.0
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::LockProtocol;
    use crate::workload::Workload;
    use std::time::Instant;

    const PERIOD_US: u64 = 100_000;

    fn tiny_spec(name: &str, period_us: u64) -> TaskSpec {
        let mut spec = TaskSpec::new(name, period_us, 1);
        spec.workload = Workload { outer: 1, inner: 10 };
        spec
    }

    #[test]
    fn test_release_advances_by_period_when_met() {
        let base = TimePoint::new(1_000, 0);
        let mut state = TaskRunState::new(base);

        let outcome = state.complete_period(PERIOD_US, base.advance(10_000));
        assert_eq!(outcome, Deadline::Met { slack_ns: 90_000_000 });
        assert_eq!(state.next_release(), base.advance(PERIOD_US));
        assert_eq!(state.last_completion(), base.advance(10_000));
    }

    #[test]
    fn test_release_advances_by_period_when_missed() {
        let base = TimePoint::new(1_000, 0);
        let mut state = TaskRunState::new(base);

        // Overrun by 250ms: still exactly one period forward, no catch-up.
        let outcome = state.complete_period(PERIOD_US, base.advance(350_000));
        assert_eq!(outcome, Deadline::Missed { late_ns: 250_000_000 });
        assert_eq!(state.next_release(), base.advance(PERIOD_US));

        let outcome = state.complete_period(PERIOD_US, base.advance(360_000));
        assert!(outcome.is_missed());
        assert_eq!(state.next_release(), base.advance(2 * PERIOD_US));
    }

    #[test]
    fn test_release_sequence_is_strictly_periodic() {
        let base = TimePoint::new(7, 999_000_000);
        let mut state = TaskRunState::new(base);
        let completions = [5_000, 250_000, 210_000, 390_000, 410_000, 800_000];

        let mut prev = state.next_release();
        for (i, &done_us) in completions.iter().enumerate() {
            state.complete_period(PERIOD_US, base.advance(done_us));
            assert!(state.next_release() > prev);
            assert_eq!(state.next_release(), base.advance((i as u64 + 1) * PERIOD_US));
            prev = state.next_release();
        }
    }

    #[test]
    fn test_completion_on_boundary_is_missed() {
        let base = TimePoint::new(0, 0);
        let mut state = TaskRunState::new(base);
        let outcome = state.complete_period(PERIOD_US, base.advance(PERIOD_US));
        assert_eq!(outcome, Deadline::Missed { late_ns: 0 });
    }

    #[test]
    fn test_contending_task_requires_resource() {
        let mut spec = tiny_spec("Task 1", PERIOD_US);
        spec.uses_resource = true;
        let shutdown = Arc::new(AtomicBool::new(false));

        assert!(PeriodicTask::new(
            spec.clone(),
            Regime::PriorityInversion,
            Clock::Realtime,
            None,
            shutdown.clone()
        )
        .is_err());

        // No contention under rate-monotonic, so no resource needed.
        assert!(
            PeriodicTask::new(spec, Regime::RateMonotonic, Clock::Realtime, None, shutdown)
                .is_ok()
        );
    }

    #[test]
    fn test_run_stops_after_max_cycles() {
        let mut spec = tiny_spec("Task 1", 5_000);
        spec.max_cycles = Some(4);
        let task = PeriodicTask::new(
            spec,
            Regime::RateMonotonic,
            Clock::Monotonic,
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let start = Instant::now();
        task.run().unwrap();
        // Three sleeps between four completions.
        assert!(start.elapsed().as_micros() >= 15_000);

        let snap = task.stats().snapshot();
        assert_eq!(snap.cycles, 4);
        assert_eq!(snap.met + snap.missed, 4);
        assert_eq!(snap.acquisitions, 0);
    }

    #[test]
    fn test_run_returns_on_shutdown() {
        let task = PeriodicTask::new(
            tiny_spec("Task 2", PERIOD_US),
            Regime::RateMonotonic,
            Clock::Realtime,
            None,
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        task.run().unwrap();
        assert_eq!(task.stats().snapshot().cycles, 0);
    }

    #[test]
    fn test_resource_user_acquires_each_period() {
        let mut spec = tiny_spec("Task 3", 5_000);
        spec.uses_resource = true;
        spec.hold_us = 1_000;
        spec.max_cycles = Some(3);
        let resource = Arc::new(SharedResource::new(LockProtocol::None).unwrap());
        let task = PeriodicTask::new(
            spec,
            Regime::PriorityInversion,
            Clock::Realtime,
            Some(resource.clone()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        task.run().unwrap();
        assert_eq!(task.stats().snapshot().acquisitions, 3);
        // Released after every hold.
        assert!(resource.try_acquire().unwrap().is_some());
    }
}
