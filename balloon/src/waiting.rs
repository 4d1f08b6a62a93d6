// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use crate::locking::SpinLock;
use crate::platform::{BalloonPlatform, WaiterId};
use alloc::vec::Vec;

/// Wait queue for host acknowledgements.
///
/// A waiter registers itself before checking its condition and then blocks
/// through the platform. [`WaitQueue::wakeup`] hands the registered waiters
/// to the platform to run again, so nothing polls while the host is busy.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: SpinLock<Vec<WaiterId>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(Vec::new()),
        }
    }

    fn enqueue(&self, waiter: WaiterId) {
        let mut waiters = self.waiters.lock();
        if !waiters.contains(&waiter) {
            waiters.push(waiter);
        }
    }

    fn dequeue(&self, waiter: WaiterId) {
        self.waiters.lock().retain(|w| *w != waiter);
    }

    /// Takes every registered waiter off the queue and returns them.
    fn take_waiters(&self) -> Vec<WaiterId> {
        core::mem::take(&mut *self.waiters.lock())
    }

    /// Wakes every context blocked in [`WaitQueue::wait_event`]. Returns the
    /// number of contexts woken.
    pub fn wakeup(&self, platform: &dyn BalloonPlatform) -> usize {
        let waiters = self.take_waiters();
        for waiter in waiters.iter() {
            platform.wake(*waiter);
        }
        waiters.len()
    }

    /// Blocks until `cond` returns true.
    ///
    /// The waiter is registered before `cond` runs, so a wakeup for an event
    /// that happens after the check always finds it.
    pub fn wait_event<F>(&self, platform: &dyn BalloonPlatform, mut cond: F)
    where
        F: FnMut() -> bool,
    {
        let me = platform.current_waiter();
        loop {
            self.enqueue(me);
            if cond() {
                self.dequeue(me);
                return;
            }
            platform.block_current();
        }
    }

    #[cfg(test)]
    fn num_waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::testutils::TestPlatform;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn wait_returns_when_condition_holds() {
        let wq = WaitQueue::new();
        let platform = TestPlatform::new();
        let mut calls = 0;
        wq.wait_event(&platform, || {
            calls += 1;
            true
        });
        assert_eq!(calls, 1);
        assert_eq!(wq.num_waiters(), 0);
        assert_eq!(platform.blocks(), 0);
    }

    #[test]
    fn wakeup_without_waiters() {
        let wq = WaitQueue::new();
        let platform = TestPlatform::new();
        assert_eq!(wq.wakeup(&platform), 0);
    }

    #[test]
    fn wait_for_wakeup_from_other_thread() {
        let wq = Arc::new(WaitQueue::new());
        let done = Arc::new(AtomicBool::new(false));
        let platform = Arc::new(TestPlatform::new());

        let waker = {
            let wq = wq.clone();
            let done = done.clone();
            let platform = platform.clone();
            thread::spawn(move || {
                // Only signal once the waiter is parked on the queue
                while wq.num_waiters() == 0 {
                    thread::yield_now();
                }
                done.store(true, Ordering::Release);
                wq.wakeup(&*platform)
            })
        };

        wq.wait_event(&*platform, || done.load(Ordering::Acquire));
        assert_eq!(waker.join().unwrap(), 1);
        assert!(done.load(Ordering::Acquire));
        assert_eq!(wq.num_waiters(), 0);
    }

    #[test]
    fn waiting_blocks_instead_of_polling() {
        let wq = Arc::new(WaitQueue::new());
        let done = Arc::new(AtomicBool::new(false));
        let platform = Arc::new(TestPlatform::new());
        let checks = Arc::new(core::sync::atomic::AtomicUsize::new(0));

        let waiter = {
            let wq = wq.clone();
            let done = done.clone();
            let platform = platform.clone();
            let checks = checks.clone();
            thread::spawn(move || {
                wq.wait_event(&*platform, || {
                    checks.fetch_add(1, Ordering::Relaxed);
                    done.load(Ordering::Acquire)
                })
            })
        };

        while platform.blocks() == 0 {
            thread::yield_now();
        }
        thread::sleep(std::time::Duration::from_millis(20));
        // One check before blocking, then nothing until the wakeup
        assert_eq!(checks.load(Ordering::Relaxed), 1);
        assert_eq!(platform.schedules(), 0);

        done.store(true, Ordering::Release);
        assert_eq!(wq.wakeup(&*platform), 1);
        waiter.join().unwrap();
        assert_eq!(checks.load(Ordering::Relaxed), 2);
    }
}
