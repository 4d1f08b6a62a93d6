// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use crate::mm::MemoryManager;
use bitflags::bitflags;

bitflags! {
    /// Balloon device feature bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct BalloonFeatures: u64 {
        /// Tell the host before reusing deflated pages
        const MUST_TELL_HOST = 1 << 0;
        /// Memory statistics queue
        const STATS_VQ       = 1 << 1;
        /// Give pages back when the guest runs out of memory
        const DEFLATE_ON_OOM = 1 << 2;
        /// Free page hinting through command ids
        const FREE_PAGE_HINT = 1 << 3;
        /// The guest tells the host how freed pages are poisoned
        const PAGE_POISON    = 1 << 4;
        /// Free page reporting queue
        const REPORTING      = 1 << 5;
    }
}

impl Default for BalloonFeatures {
    fn default() -> Self {
        Self::all()
    }
}

impl BalloonFeatures {
    /// Drops device features the guest memory setup cannot honour.
    pub fn validate(self, mm: &dyn MemoryManager) -> Self {
        let mut features = self;
        if !mm.want_init_on_free() && !mm.page_poisoning_enabled() {
            features.remove(Self::PAGE_POISON);
        } else if !features.contains(Self::PAGE_POISON) {
            // Reported pages would come back with stale contents
            features.remove(Self::REPORTING);
        }
        features
    }

    /// Feature set both sides agree on. Unknown device bits are ignored.
    /// Validation runs on the intersection, so a feature the driver leaves
    /// out still takes its dependents with it.
    pub fn negotiate(driver: Self, device_bits: u64, mm: &dyn MemoryManager) -> Self {
        (driver & Self::from_bits_truncate(device_bits)).validate(mm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::TestMemory;

    #[test]
    fn feature_bits() {
        assert_eq!(BalloonFeatures::MUST_TELL_HOST.bits(), 1);
        assert_eq!(BalloonFeatures::STATS_VQ.bits(), 2);
        assert_eq!(BalloonFeatures::DEFLATE_ON_OOM.bits(), 4);
        assert_eq!(BalloonFeatures::FREE_PAGE_HINT.bits(), 8);
        assert_eq!(BalloonFeatures::PAGE_POISON.bits(), 16);
        assert_eq!(BalloonFeatures::REPORTING.bits(), 32);
    }

    #[test]
    fn poison_dropped_without_poisoning() {
        let mem = TestMemory::new(16);
        let f = BalloonFeatures::all().validate(&mem);
        assert!(!f.contains(BalloonFeatures::PAGE_POISON));
        // Poisoning is off altogether, so reporting stays
        assert!(f.contains(BalloonFeatures::REPORTING));
    }

    #[test]
    fn reporting_needs_poison_when_poisoning() {
        let mem = TestMemory::new(16);
        mem.set_page_poisoning(true);
        let f = (BalloonFeatures::all() - BalloonFeatures::PAGE_POISON).validate(&mem);
        assert!(!f.contains(BalloonFeatures::REPORTING));

        let f = BalloonFeatures::all().validate(&mem);
        assert!(f.contains(BalloonFeatures::REPORTING | BalloonFeatures::PAGE_POISON));
    }

    #[test]
    fn negotiate_intersects() {
        let mem = TestMemory::new(16);
        let driver = BalloonFeatures::STATS_VQ | BalloonFeatures::DEFLATE_ON_OOM;
        let device = (BalloonFeatures::STATS_VQ | BalloonFeatures::MUST_TELL_HOST).bits() | (1 << 40);
        assert_eq!(
            BalloonFeatures::negotiate(driver, device, &mem),
            BalloonFeatures::STATS_VQ
        );
    }

    #[test]
    fn driver_without_poison_loses_reporting() {
        let mem = TestMemory::new(16);
        mem.set_page_poisoning(true);
        let driver = BalloonFeatures::all() - BalloonFeatures::PAGE_POISON;
        let f = BalloonFeatures::negotiate(driver, BalloonFeatures::all().bits(), &mem);
        assert!(!f.contains(BalloonFeatures::PAGE_POISON));
        assert!(!f.contains(BalloonFeatures::REPORTING));
        assert!(f.contains(BalloonFeatures::FREE_PAGE_HINT | BalloonFeatures::STATS_VQ));
    }
}
