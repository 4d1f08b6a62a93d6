// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use core::fmt;

/// Names a context that can block in [`BalloonPlatform::block_current`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaiterId(pub u64);

/// Scheduler services the balloon needs from its environment.
pub trait BalloonPlatform: fmt::Debug + Send + Sync {
    /// Give up the CPU to other runnable contexts. The caller stays runnable.
    fn schedule(&self);

    /// Sleep for at least `ms` milliseconds.
    fn msleep(&self, ms: u32);

    /// The calling context.
    fn current_waiter(&self) -> WaiterId;

    /// Blocks the calling context until [`BalloonPlatform::wake`] is called
    /// for it. A wake issued after the caller took its [`WaiterId`] but
    /// before it blocked makes this return immediately. Spurious returns are
    /// allowed.
    fn block_current(&self);

    /// Makes `waiter` runnable again.
    fn wake(&self, waiter: WaiterId);
}
