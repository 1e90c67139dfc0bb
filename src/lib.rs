// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Fixed-priority real-time scheduling on Linux threads.
//!
//! A small set of periodic tasks, each on its own SCHED_FIFO thread with a
//! rate-monotonic priority and a fixed CPU affinity. In the
//! priority-inversion regime some of them also contend for one shared
//! lock, which lets a low-priority holder make a high-priority task miss
//! its deadlines.

pub mod config;
pub mod launch;
pub mod policy;
pub mod resource;
pub mod stats;
pub mod task;
pub mod time;
pub mod workload;

pub use config::CoreMode;
pub use config::Regime;
pub use config::TaskSetConfig;
pub use config::TaskSpec;
pub use launch::launch;
pub use launch::TaskSet;
pub use policy::SchedPolicy;
pub use resource::LockProtocol;
pub use resource::SharedResource;
pub use task::Deadline;
pub use task::PeriodicTask;
pub use task::TaskRunState;
pub use time::Clock;
pub use time::TimePoint;
pub use workload::Workload;
