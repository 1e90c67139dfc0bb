// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// Synthetic CPU-bound work. Nested counting loops, no I/O, never yields.

use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

pub const OUTER_LOOPS: u32 = 10_000;
pub const INNER_LOOPS_FIXED: u32 = 1_000;
pub const INNER_LOOPS_VARIABLE: u32 = 2_400;

/// Most iterations [`Workload::estimate_ns`] will actually execute.
pub const ESTIMATE_SAMPLE_ITERATIONS: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkloadPreset {
    /// 10000 x 1000 iterations, well under every period.
    Fixed,
    /// 10000 x 2400 iterations, enough to stress the longest period.
    Variable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub outer: u32,
    pub inner: u32,
}

impl Default for Workload {
    fn default() -> Self {
        Self::preset(WorkloadPreset::Fixed)
    }
}

impl Workload {
    pub fn preset(preset: WorkloadPreset) -> Self {
        let inner = match preset {
            WorkloadPreset::Fixed => INNER_LOOPS_FIXED,
            WorkloadPreset::Variable => INNER_LOOPS_VARIABLE,
        };
        Self {
            outer: OUTER_LOOPS,
            inner,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.outer as u64 * self.inner as u64
    }

    /// Burn the configured number of iterations.
    pub fn run(&self) -> u64 {
        let mut acc: u64 = 0;
        for _ in 0..self.outer {
            for j in 0..self.inner {
                // black_box keeps the optimizer from folding the loops away.
                acc = std::hint::black_box(acc.wrapping_add(j as u64 / 2));
            }
        }
        acc
    }

    /// Wall time of a single run on the calling thread, in nanoseconds.
    pub fn measure_ns(&self) -> u64 {
        let start = Instant::now();
        std::hint::black_box(self.run());
        start.elapsed().as_nanos() as u64
    }

    /// Like [`Workload::measure_ns`], but runs at most
    /// [`ESTIMATE_SAMPLE_ITERATIONS`] and scales the result up.
    pub fn estimate_ns(&self) -> u64 {
        let total = self.iterations();
        if total <= ESTIMATE_SAMPLE_ITERATIONS {
            return self.measure_ns();
        }

        let inner = self.inner.min(ESTIMATE_SAMPLE_ITERATIONS as u32);
        let sample = Workload {
            outer: (ESTIMATE_SAMPLE_ITERATIONS / inner as u64).max(1) as u32,
            inner,
        };
        let scaled = sample.measure_ns() as u128 * total as u128 / sample.iterations() as u128;
        scaled.min(u64::MAX as u128) as u64
    }
}
