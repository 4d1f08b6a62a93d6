// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Carlos López <carlos.lopez@suse.com>

use crate::types::BALLOON_PFN_SHIFT;
use core::fmt;

// The backing type to represent an address;
type InnerAddr = usize;

pub trait Address:
    Copy + From<InnerAddr> + Into<InnerAddr> + PartialEq + Eq + PartialOrd + Ord
{
    /// Transform the address into its inner representation for easier
    /// arithmetic manipulation
    #[inline]
    fn bits(&self) -> InnerAddr {
        (*self).into()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(InnerAddr);

impl PhysAddr {
    #[inline]
    pub const fn new(p: InnerAddr) -> Self {
        Self(p)
    }

    /// The 32-bit frame number the host uses for the 4KiB frame starting at
    /// this address. Like the device, this truncates frames above 16TiB.
    #[inline]
    pub const fn balloon_pfn(&self) -> u32 {
        (self.0 >> BALLOON_PFN_SHIFT) as u32
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<InnerAddr> for PhysAddr {
    #[inline]
    fn from(addr: InnerAddr) -> PhysAddr {
        Self(addr)
    }
}

impl From<PhysAddr> for InnerAddr {
    #[inline]
    fn from(addr: PhysAddr) -> InnerAddr {
        addr.0
    }
}

impl Address for PhysAddr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balloon_pfn_is_4k_frame() {
        assert_eq!(PhysAddr::new(0x1000).balloon_pfn(), 1);
        assert_eq!(PhysAddr::new(0x12345678).balloon_pfn(), 0x12345);
        // 64KiB native page spans 16 balloon frames starting at 0x30
        assert_eq!(PhysAddr::new(0x30000).balloon_pfn(), 0x30);
        assert_eq!(PhysAddr::new(0x3f000).balloon_pfn(), 0x3f);
    }

    #[test]
    fn frames_above_16t_truncate() {
        let addr = PhysAddr::new(0x1234_5678_9000);
        assert_eq!(addr.bits(), 0x1234_5678_9000);
        assert_eq!(addr.balloon_pfn(), 0x2345_6789);
    }
}
