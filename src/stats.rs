// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::info;

/// Counters a task thread updates and the launcher reads. Written by one
/// thread only, so relaxed ordering is enough.
#[derive(Debug, Default)]
pub struct TaskStats {
    cycles: AtomicU64,
    met: AtomicU64,
    missed: AtomicU64,
    max_late_ns: AtomicU64,
    acquisitions: AtomicU64,
    max_blocked_ns: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskStatsSnapshot {
    pub cycles: u64,
    pub met: u64,
    pub missed: u64,
    pub max_late_ns: u64,
    pub acquisitions: u64,
    pub max_blocked_ns: u64,
}

impl TaskStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_met(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.met.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed(&self, late_ns: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.missed.fetch_add(1, Ordering::Relaxed);
        self.max_late_ns.fetch_max(late_ns, Ordering::Relaxed);
    }

    pub fn record_acquisition(&self, blocked_ns: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.max_blocked_ns.fetch_max(blocked_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TaskStatsSnapshot {
        TaskStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            met: self.met.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            max_late_ns: self.max_late_ns.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            max_blocked_ns: self.max_blocked_ns.load(Ordering::Relaxed),
        }
    }
}

impl TaskStatsSnapshot {
    pub fn log_summary(&self, name: &str) {
        info!(
            "{}: cycles={} met={} missed={} max_late={:.3}ms lock={} max_blocked={:.3}ms",
            name,
            self.cycles,
            self.met,
            self.missed,
            self.max_late_ns as f64 / 1_000_000.0,
            self.acquisitions,
            self.max_blocked_ns as f64 / 1_000_000.0,
        );
    }
}
