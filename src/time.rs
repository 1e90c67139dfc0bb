// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Absolute time points and the arithmetic periodic tasks schedule with.
//!
//! Release times are absolute instants on a POSIX clock. Tasks advance
//! them by whole periods and sleep until them with `TIMER_ABSTIME`, so an
//! overrun in one period never shifts the rest of the schedule.

use std::cmp::Ordering;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;
pub const NSEC_PER_USEC: i64 = 1_000;
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Longest uninterrupted sleep before the shutdown flag is looked at again.
pub const SLEEP_SLICE_US: u64 = 10_000;

/// Clock the task set samples and sleeps on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Clock {
    /// Wall-clock time (CLOCK_REALTIME).
    #[default]
    Realtime,
    /// Time since boot, immune to wall-clock steps (CLOCK_MONOTONIC).
    Monotonic,
}

impl Clock {
    pub fn as_clockid(self) -> libc::clockid_t {
        match self {
            Clock::Realtime => libc::CLOCK_REALTIME,
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
        }
    }
}

/// An absolute instant with nanosecond resolution. `nsec` is always in
/// `[0, NSEC_PER_SEC)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TimePoint {
    sec: i64,
    nsec: i64,
}

impl TimePoint {
    /// Build a time point, folding any out-of-range nanoseconds into seconds.
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self {
            sec: sec + nsec.div_euclid(NSEC_PER_SEC),
            nsec: nsec.rem_euclid(NSEC_PER_SEC),
        }
    }

    pub fn now(clock: Clock) -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Only fails for an invalid clock id, and both of ours are valid.
        unsafe {
            libc::clock_gettime(clock.as_clockid(), &mut ts);
        }
        Self::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn nsec(&self) -> i64 {
        self.nsec
    }

    pub fn as_nanos(&self) -> i128 {
        self.sec as i128 * NSEC_PER_SEC as i128 + self.nsec as i128
    }

    pub fn advance(self, us: u64) -> Self {
        advance(self, us)
    }

    pub(crate) fn as_timespec(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }
}

impl Ord for TimePoint {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl PartialOrd for TimePoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `t` plus `us` microseconds, with sub-second overflow carried into seconds.
pub fn advance(t: TimePoint, us: u64) -> TimePoint {
    let whole_secs = (us / USEC_PER_SEC) as i64;
    let rem_nsec = (us % USEC_PER_SEC) as i64 * NSEC_PER_USEC;
    TimePoint::new(t.sec + whole_secs, t.nsec + rem_nsec)
}

/// Total order over time points: `Less` is earlier, `Greater` is later.
pub fn compare(a: &TimePoint, b: &TimePoint) -> Ordering {
    a.sec.cmp(&b.sec).then(a.nsec.cmp(&b.nsec))
}

/// Absolute distance between `a` and `b` in seconds. Diagnostics only.
pub fn elapsed(a: &TimePoint, b: &TimePoint) -> f64 {
    (a.as_nanos() - b.as_nanos()).abs() as f64 / NSEC_PER_SEC as f64
}

/// Signed `later - earlier` in nanoseconds, saturated to the `i64` range.
pub fn diff_ns(later: &TimePoint, earlier: &TimePoint) -> i64 {
    let d = later.as_nanos() - earlier.as_nanos();
    d.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Suspend the calling thread until `t` on `clock`. Absolute, so the wake-up
/// instant does not depend on when the call was made.
pub fn sleep_until(t: TimePoint, clock: Clock) -> Result<()> {
    let ts = t.as_timespec();
    loop {
        let ret = unsafe {
            libc::clock_nanosleep(
                clock.as_clockid(),
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        match ret {
            0 => return Ok(()),
            libc::EINTR => continue,
            err => bail!(
                "clock_nanosleep failed: {}",
                std::io::Error::from_raw_os_error(err)
            ),
        }
    }
}

/// Like [`sleep_until`], but wakes at least every [`SLEEP_SLICE_US`] to check
/// `shutdown`. Each slice is itself an absolute sleep capped at `t`, so the
/// final wake-up instant is unchanged. Returns `false` if interrupted.
pub fn sleep_until_or_shutdown(
    t: TimePoint,
    clock: Clock,
    shutdown: &AtomicBool,
) -> Result<bool> {
    loop {
        if shutdown.load(AtomicOrdering::Relaxed) {
            return Ok(false);
        }
        let now = TimePoint::now(clock);
        if now >= t {
            return Ok(true);
        }
        sleep_until(now.advance(SLEEP_SLICE_US).min(t), clock)?;
    }
}
