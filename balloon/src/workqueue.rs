// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Freezable queue for the deferred balloon work items.
//!
//! Each work item is either idle, pending or running (or running and pending
//! again). Queueing a pending item is a no-op. Worker contexts provided by the
//! embedder pull items with [`WorkQueue::run_one`]; distinct items may run in
//! parallel, one item never runs twice at the same time.

use crate::locking::SpinLock;
use crate::platform::BalloonPlatform;
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalloonWork {
    /// Converge the balloon towards the host target
    UpdateSize,
    /// Refresh and resend memory statistics
    UpdateStats,
    /// Run a free page hinting session
    ReportFreePage,
}

const NR_WORK: usize = 3;

impl BalloonWork {
    const ALL: [BalloonWork; NR_WORK] = [
        BalloonWork::UpdateSize,
        BalloonWork::UpdateStats,
        BalloonWork::ReportFreePage,
    ];

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for BalloonWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UpdateSize => "update_balloon_size",
            Self::UpdateStats => "update_balloon_stats",
            Self::ReportFreePage => "report_free_page",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct WorkState {
    pending: u8,
    running: u8,
    frozen: bool,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: SpinLock<WorkState>,
}

impl WorkQueue {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(WorkState {
                pending: 0,
                running: 0,
                frozen: false,
            }),
        }
    }

    /// Marks `work` pending. Returns false if it already was.
    pub fn queue_work(&self, work: BalloonWork) -> bool {
        let mut state = self.state.lock();
        if state.pending & work.bit() != 0 {
            return false;
        }
        state.pending |= work.bit();
        true
    }

    fn take_next(&self) -> Option<BalloonWork> {
        let mut state = self.state.lock();
        if state.frozen {
            return None;
        }
        let work = BalloonWork::ALL
            .into_iter()
            .find(|w| state.pending & w.bit() != 0 && state.running & w.bit() == 0)?;
        state.pending &= !work.bit();
        state.running |= work.bit();
        Some(work)
    }

    /// Runs one pending work item with `f`, returning the item that ran.
    pub fn run_one<F: FnOnce(BalloonWork)>(&self, f: F) -> Option<BalloonWork> {
        let work = self.take_next()?;
        f(work);
        self.state.lock().running &= !work.bit();
        Some(work)
    }

    pub fn is_pending(&self, work: BalloonWork) -> bool {
        self.state.lock().pending & work.bit() != 0
    }

    pub fn is_running(&self, work: BalloonWork) -> bool {
        self.state.lock().running & work.bit() != 0
    }

    /// True if any item could be dispatched right now.
    pub fn has_work(&self) -> bool {
        let state = self.state.lock();
        !state.frozen && state.pending & !state.running != 0
    }

    /// Drops a pending instance of `work` and waits for a running one to
    /// finish. Requeueing from the running instance is dropped as well.
    pub fn cancel_work_sync(&self, work: BalloonWork, platform: &dyn BalloonPlatform) {
        loop {
            {
                let mut state = self.state.lock();
                state.pending &= !work.bit();
                if state.running & work.bit() == 0 {
                    return;
                }
            }
            platform.schedule();
        }
    }

    /// Stops dispatching work and waits for running items. Pending items are
    /// kept until [`WorkQueue::thaw`].
    pub fn freeze(&self, platform: &dyn BalloonPlatform) {
        self.state.lock().frozen = true;
        while self.state.lock().running != 0 {
            platform.schedule();
        }
    }

    pub fn thaw(&self) {
        self.state.lock().frozen = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::TestPlatform;

    #[test]
    fn queue_is_idempotent() {
        let wq = WorkQueue::new();
        assert!(wq.queue_work(BalloonWork::UpdateSize));
        assert!(!wq.queue_work(BalloonWork::UpdateSize));
        assert_eq!(wq.run_one(|_| ()), Some(BalloonWork::UpdateSize));
        assert_eq!(wq.run_one(|_| ()), None);
    }

    #[test]
    fn requeue_while_running() {
        let wq = WorkQueue::new();
        wq.queue_work(BalloonWork::UpdateSize);
        let ran = wq.run_one(|w| {
            assert!(wq.is_running(w));
            // Not pending while running, so requeueing works
            assert!(wq.queue_work(w));
            // but the same item is not dispatched twice at once
            assert_eq!(wq.run_one(|_| ()), None);
        });
        assert_eq!(ran, Some(BalloonWork::UpdateSize));
        assert!(wq.is_pending(BalloonWork::UpdateSize));
        assert!(!wq.is_running(BalloonWork::UpdateSize));
    }

    #[test]
    fn distinct_items_run_nested() {
        let wq = WorkQueue::new();
        wq.queue_work(BalloonWork::UpdateSize);
        wq.queue_work(BalloonWork::UpdateStats);
        wq.run_one(|w| {
            assert_eq!(w, BalloonWork::UpdateSize);
            assert_eq!(wq.run_one(|_| ()), Some(BalloonWork::UpdateStats));
        });
        assert!(!wq.has_work());
    }

    #[test]
    fn freeze_keeps_pending() {
        let wq = WorkQueue::new();
        let platform = TestPlatform::new();
        wq.freeze(&platform);
        assert!(wq.queue_work(BalloonWork::ReportFreePage));
        assert!(!wq.has_work());
        assert_eq!(wq.run_one(|_| ()), None);
        wq.thaw();
        assert_eq!(wq.run_one(|_| ()), Some(BalloonWork::ReportFreePage));
    }

    #[test]
    fn cancel_drops_pending() {
        let wq = WorkQueue::new();
        let platform = TestPlatform::new();
        wq.queue_work(BalloonWork::UpdateStats);
        wq.cancel_work_sync(BalloonWork::UpdateStats, &platform);
        assert!(!wq.is_pending(BalloonWork::UpdateStats));
        assert_eq!(wq.run_one(|_| ()), None);
    }
}
