// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-thread OS scheduling setup: fixed-priority policy and CPU affinity.
//!
//! Both calls act on the calling thread (`pid == 0`), so every task thread
//! configures itself before entering its loop. Failures are errors, never
//! a quiet fallback to the default time-sharing class.

use std::io;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    /// SCHED_FIFO: strict priority preemption, no time slicing.
    #[default]
    Fifo,
    /// SCHED_OTHER: the default time-sharing class. Priorities are ignored.
    Other,
}

impl SchedPolicy {
    fn as_libc(self) -> libc::c_int {
        match self {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::Other => libc::SCHED_OTHER,
        }
    }

    pub fn priority_range(self) -> Result<(i32, i32)> {
        let (min, max) = unsafe {
            (
                libc::sched_get_priority_min(self.as_libc()),
                libc::sched_get_priority_max(self.as_libc()),
            )
        };
        if min < 0 || max < 0 {
            return Err(anyhow!(io::Error::last_os_error())
                .context(format!("Failed to query {:?} priority range", self)));
        }
        Ok((min, max))
    }

    pub fn from_libc(policy: libc::c_int) -> Option<Self> {
        match policy {
            libc::SCHED_FIFO => Some(SchedPolicy::Fifo),
            libc::SCHED_OTHER => Some(SchedPolicy::Other),
            _ => None,
        }
    }
}

/// Switch the calling thread to `policy` at `priority`.
pub fn apply_current_thread(policy: SchedPolicy, priority: i32) -> Result<()> {
    let sched_priority = match policy {
        SchedPolicy::Fifo => {
            let (min, max) = policy.priority_range()?;
            if priority < min || priority > max {
                bail!(
                    "Priority {} out of range for {:?} ({}..={})",
                    priority,
                    policy,
                    min,
                    max
                );
            }
            priority
        }
        SchedPolicy::Other => 0,
    };

    let param = libc::sched_param { sched_priority };
    if unsafe { libc::sched_setscheduler(0, policy.as_libc(), &param) } != 0 {
        return Err(anyhow!(io::Error::last_os_error()).context(format!(
            "Failed to set {:?} priority {} (real-time policies need CAP_SYS_NICE)",
            policy, priority
        )));
    }
    Ok(())
}

/// Policy and priority of the calling thread.
pub fn current_thread_policy() -> Result<(Option<SchedPolicy>, i32)> {
    let policy = unsafe { libc::sched_getscheduler(0) };
    if policy < 0 {
        return Err(anyhow!(io::Error::last_os_error()).context("sched_getscheduler failed"));
    }
    let mut param = libc::sched_param { sched_priority: 0 };
    if unsafe { libc::sched_getparam(0, &mut param) } != 0 {
        return Err(anyhow!(io::Error::last_os_error()).context("sched_getparam failed"));
    }
    Ok((SchedPolicy::from_libc(policy), param.sched_priority))
}

/// Restrict the calling thread to `cpus`. An empty set leaves it unpinned.
pub fn pin_current_thread(cpus: &[usize]) -> Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }

    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in cpus {
        if cpu >= libc::CPU_SETSIZE as usize {
            bail!("CPU {} exceeds CPU_SETSIZE ({})", cpu, libc::CPU_SETSIZE);
        }
        unsafe {
            libc::CPU_SET(cpu, &mut set);
        }
    }

    if unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) } != 0 {
        return Err(anyhow!(io::Error::last_os_error())
            .context(format!("Failed to pin thread to CPUs {:?}", cpus)));
    }
    Ok(())
}

/// CPUs the calling thread may run on.
pub fn current_affinity() -> Result<Vec<usize>> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    if unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) } != 0
    {
        return Err(anyhow!(io::Error::last_os_error()).context("sched_getaffinity failed"));
    }
    Ok((0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .collect())
}

/// Number of CPUs the system is configured with, online or not.
pub fn nr_cpus_configured() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}
