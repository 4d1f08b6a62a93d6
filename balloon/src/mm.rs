// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Interface to the guest physical memory manager.

use crate::address::PhysAddr;
use crate::types::BALLOON_PFN_SHIFT;
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Allocation policy passed through to the memory manager.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Any zone is fine, including memory without a kernel mapping.
        const HIGHUSER   = 1 << 0;
        /// The page may be moved by compaction later.
        const MOVABLE    = 1 << 1;
        /// Fail instead of retrying hard or reclaiming.
        const NORETRY    = 1 << 2;
        /// Do not warn about allocation failures.
        const NOWARN     = 1 << 3;
        /// Never dip into emergency reserves.
        const NOMEMALLOC = 1 << 4;
    }
}

impl AllocFlags {
    /// Policy for pages handed to the host on inflate.
    pub const fn balloon_page() -> Self {
        Self::HIGHUSER
            .union(Self::MOVABLE)
            .union(Self::NOMEMALLOC)
            .union(Self::NORETRY)
            .union(Self::NOWARN)
    }

    /// Policy for free page hinting blocks.
    pub const fn free_page_hint() -> Self {
        Self::NORETRY.union(Self::NOWARN).union(Self::NOMEMALLOC)
    }
}

/// Identifies a memory zone. Pages only count against the managed page total
/// of the zone they live in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneId(pub u32);

/// Cumulative virtual memory event counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmEvents {
    /// Pages swapped in
    pub swap_in: u64,
    /// Pages swapped out
    pub swap_out: u64,
    pub major_faults: u64,
    pub minor_faults: u64,
    /// Successful huge page allocations, if huge pages are supported
    pub htlb_pgalloc: Option<u64>,
    /// Failed huge page allocations, if huge pages are supported
    pub htlb_pgfail: Option<u64>,
}

/// Memory usage snapshot, all values in native pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub free: u64,
    pub total: u64,
    pub available: u64,
    pub caches: u64,
}

pub trait MemoryManager: fmt::Debug + Send + Sync {
    /// log2 of the native page size.
    fn page_shift(&self) -> usize {
        12
    }

    /// Allocates `1 << order` contiguous native pages.
    fn alloc_pages(&self, order: usize, flags: AllocFlags) -> Option<PhysAddr>;

    fn free_pages(&self, addr: PhysAddr, order: usize);

    /// Adjusts the number of pages managed by the zone `addr` belongs to.
    fn adjust_managed_page_count(&self, addr: PhysAddr, delta: isize);

    /// Marks a page as logically offline, so nobody touches its contents.
    fn set_page_offline(&self, addr: PhysAddr, offline: bool);

    /// Registers (or unregisters) a page with the balloon migration hooks.
    fn set_page_movable(&self, addr: PhysAddr, movable: bool);

    fn page_zone(&self, addr: PhysAddr) -> ZoneId;

    fn vm_events(&self) -> VmEvents;

    fn meminfo(&self) -> MemInfo;

    /// Freed pages are zeroed by the memory manager.
    fn want_init_on_free(&self) -> bool {
        false
    }

    /// Freed pages are filled with a poison pattern.
    fn page_poisoning_enabled(&self) -> bool {
        false
    }
}

/// Helpers derived from the native page size.
pub trait MemoryManagerExt: MemoryManager {
    fn page_size(&self) -> usize {
        1 << self.page_shift()
    }

    /// Number of 4KiB balloon frames backed by one native page.
    fn balloon_frames_per_page(&self) -> usize {
        self.page_size() >> BALLOON_PFN_SHIFT
    }
}

impl<T: MemoryManager + ?Sized> MemoryManagerExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::TestMemory;

    #[test]
    fn alloc_policies() {
        let flags = AllocFlags::balloon_page();
        assert!(flags.contains(AllocFlags::MOVABLE | AllocFlags::NORETRY));
        assert!(!AllocFlags::free_page_hint().contains(AllocFlags::MOVABLE));
        assert!(AllocFlags::free_page_hint().contains(AllocFlags::NOMEMALLOC));
    }

    #[test]
    fn frames_per_page() {
        let mem = TestMemory::new(16);
        assert_eq!(mem.page_size(), 4096);
        assert_eq!(mem.balloon_frames_per_page(), 1);

        let mem = TestMemory::with_page_shift(16, 16);
        assert_eq!(mem.balloon_frames_per_page(), 16);
    }
}
