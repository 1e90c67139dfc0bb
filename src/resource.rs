// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The shared resource tasks contend for in the priority-inversion regime.
//!
//! A plain pthread mutex. With [`LockProtocol::None`] it knows nothing about
//! the priorities of its waiters, which is what lets a low-priority holder
//! stall a high-priority waiter. [`LockProtocol::Inherit`] is available to
//! contrast that with PTHREAD_PRIO_INHERIT, but is never chosen implicitly.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Result;
use log::error;
use serde::Deserialize;
use serde::Serialize;

use crate::time::Clock;
use crate::time::TimePoint;
use crate::time::SLEEP_SLICE_US;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LockProtocol {
    /// Priority-agnostic mutex.
    #[default]
    None,
    /// The holder runs at the priority of its highest-priority waiter.
    Inherit,
}

impl LockProtocol {
    fn as_pthread_protocol(self) -> libc::c_int {
        match self {
            LockProtocol::None => libc::PTHREAD_PRIO_NONE,
            LockProtocol::Inherit => libc::PTHREAD_PRIO_INHERIT,
        }
    }
}

fn check(ret: libc::c_int, what: &str) -> Result<()> {
    if ret != 0 {
        bail!("{} failed: {}", what, std::io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

pub struct SharedResource {
    // Boxed so the pthread object never moves after initialization.
    mutex: Box<UnsafeCell<libc::pthread_mutex_t>>,
    protocol: LockProtocol,
}

// The pthread mutex is designed to be shared between threads; all access
// goes through the pthread API.
unsafe impl Send for SharedResource {}
unsafe impl Sync for SharedResource {}

impl SharedResource {
    pub fn new(protocol: LockProtocol) -> Result<Self> {
        let mutex = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr), "pthread_mutexattr_init")?;
            let mut ret =
                libc::pthread_mutexattr_setprotocol(&mut attr, protocol.as_pthread_protocol());
            if ret == 0 {
                ret = libc::pthread_mutex_init(mutex.get(), &attr);
            }
            libc::pthread_mutexattr_destroy(&mut attr);
            check(ret, "pthread_mutex_init")?;
        }
        Ok(Self { mutex, protocol })
    }

    pub fn protocol(&self) -> LockProtocol {
        self.protocol
    }

    /// Block until the calling thread owns the resource.
    ///
    /// The wait is a series of short timed locks so a pending shutdown is
    /// noticed; waiter order is whatever the kernel picks. Returns
    /// `Ok(None)` if `shutdown` was raised while waiting.
    pub fn acquire(&self, shutdown: &AtomicBool) -> Result<Option<ResourceGuard<'_>>> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            // pthread_mutex_timedlock always measures against CLOCK_REALTIME.
            let ts = TimePoint::now(Clock::Realtime)
                .advance(SLEEP_SLICE_US)
                .as_timespec();
            let ret = unsafe { libc::pthread_mutex_timedlock(self.mutex.get(), &ts) };
            match ret {
                0 => {
                    let guard = ResourceGuard::new(self);
                    // Handed over by a holder that was itself shutting down.
                    if shutdown.load(Ordering::Relaxed) {
                        guard.release()?;
                        return Ok(None);
                    }
                    return Ok(Some(guard));
                }
                libc::ETIMEDOUT | libc::EINTR => continue,
                err => bail!(
                    "pthread_mutex_timedlock failed: {}",
                    std::io::Error::from_raw_os_error(err)
                ),
            }
        }
    }

    /// Take the resource only if nobody holds it.
    pub fn try_acquire(&self) -> Result<Option<ResourceGuard<'_>>> {
        let ret = unsafe { libc::pthread_mutex_trylock(self.mutex.get()) };
        match ret {
            0 => Ok(Some(ResourceGuard::new(self))),
            libc::EBUSY => Ok(None),
            err => bail!(
                "pthread_mutex_trylock failed: {}",
                std::io::Error::from_raw_os_error(err)
            ),
        }
    }

    fn unlock(&self) -> Result<()> {
        check(
            unsafe { libc::pthread_mutex_unlock(self.mutex.get()) },
            "pthread_mutex_unlock",
        )
    }
}

impl Drop for SharedResource {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.mutex.get());
        }
    }
}

/// Ownership of the shared resource. Released on drop, on the thread that
/// acquired it.
pub struct ResourceGuard<'a> {
    resource: &'a SharedResource,
    // pthread mutexes must be unlocked by their owner.
    _not_send: PhantomData<*const ()>,
}

impl<'a> ResourceGuard<'a> {
    fn new(resource: &'a SharedResource) -> Self {
        Self {
            resource,
            _not_send: PhantomData,
        }
    }

    /// Release explicitly, surfacing an unlock failure to the caller.
    pub fn release(self) -> Result<()> {
        let resource = self.resource;
        std::mem::forget(self);
        resource.unlock()
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.resource.unlock() {
            error!("Shared resource release failed: {:#}", e);
        }
    }
}
