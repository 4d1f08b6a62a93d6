// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Memory pressure entry points: the out-of-memory notifier and the shrinker
//! for hinted free page blocks.

use super::BalloonDevice;
use core::sync::atomic::Ordering;

impl BalloonDevice {
    /// Out-of-memory notifier. Deflates one batch and returns the number of
    /// native pages given back. Does nothing unless DEFLATE_ON_OOM was
    /// negotiated.
    pub fn oom_notify(&self) -> usize {
        if !self.oom_registered.load(Ordering::Acquire) {
            return 0;
        }
        let freed = match self.leak_balloon(self.options.oom_nr_pages) {
            Ok(num) => num / self.pages_per_page,
            Err(e) => {
                log::warn!("balloon: deflate on OOM failed: {e}");
                0
            }
        };
        self.update_balloon_size();
        freed
    }

    /// Native pages the shrinker could reclaim right now.
    pub fn shrinker_count(&self) -> usize {
        if !self.shrinker_registered.load(Ordering::Acquire) {
            return 0;
        }
        self.hint
            .as_ref()
            .map_or(0, |hint| hint.num_blocks() * hint.pages_per_block())
    }

    /// Returns hinted blocks covering at least `nr_to_scan` native pages to
    /// the allocator. Returns the number of native pages freed.
    pub fn shrinker_scan(&self, nr_to_scan: usize) -> usize {
        if !self.shrinker_registered.load(Ordering::Acquire) {
            return 0;
        }
        let Some(hint) = &self.hint else {
            return 0;
        };
        let pages_per_block = hint.pages_per_block();
        let blocks_to_free = nr_to_scan.div_ceil(pages_per_block);
        self.return_free_pages_to_mm(blocks_to_free) * pages_per_block
    }
}

#[cfg(test)]
mod tests {
    use crate::features::BalloonFeatures;
    use crate::options::BalloonOptions;
    use crate::testutils::{TestBalloon, TestMemory, TestTransport};
    use crate::transport::QueueId;

    #[test]
    fn oom_without_feature() {
        let tb = TestBalloon::new(BalloonFeatures::empty());
        tb.dev.fill_balloon(16).unwrap();
        assert_eq!(tb.dev.oom_notify(), 0);
        assert_eq!(tb.dev.num_pages(), 16);
    }

    #[test]
    fn oom_deflates_one_batch() {
        let tb = TestBalloon::new(BalloonFeatures::DEFLATE_ON_OOM);
        tb.set_target(600);
        tb.run_until_idle();
        assert_eq!(tb.dev.num_pages(), 600);

        assert_eq!(tb.dev.oom_notify(), 256);
        assert_eq!(tb.dev.num_pages(), 344);
        assert_eq!(tb.transport.config().actual(), 344);
        // The host target is untouched
        assert_eq!(tb.dev.towards_target(), 256);
    }

    #[test]
    fn shrinker_frees_whole_blocks() {
        let tb = TestBalloon::setup(
            TestTransport::new(BalloonFeatures::FREE_PAGE_HINT),
            TestMemory::new(64),
            BalloonOptions {
                hint_block_order: 3,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(tb.dev.shrinker_count(), 0);

        tb.transport.config().set_cmd_id(4);
        tb.dev.config_changed();
        tb.run_until_idle();
        assert_eq!(tb.dev.shrinker_count(), 64);

        // Rounded up to one block of 8 pages
        assert_eq!(tb.dev.shrinker_scan(1), 8);
        assert_eq!(tb.dev.shrinker_count(), 56);
        assert_eq!(tb.dev.shrinker_scan(17), 24);
        assert_eq!(tb.dev.shrinker_count(), 32);
        assert_eq!(tb.mem.used_pages(), 32);
        assert_eq!(tb.dev.shrinker_scan(usize::MAX / 2), 32);
        assert_eq!(tb.dev.shrinker_count(), 0);
    }

    #[test]
    fn no_shrinker_without_hinting() {
        let tb = TestBalloon::try_new(
            TestTransport::new(BalloonFeatures::FREE_PAGE_HINT).with_queue_size(QueueId::FreePage, 1),
        )
        .unwrap();
        assert!(!tb.dev.features().contains(BalloonFeatures::FREE_PAGE_HINT));
        assert_eq!(tb.dev.shrinker_count(), 0);
        assert_eq!(tb.dev.shrinker_scan(100), 0);
    }
}
