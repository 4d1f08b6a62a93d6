// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Inflating, deflating and the convergence pass towards the host target.

use super::BalloonDevice;
use crate::address::PhysAddr;
use crate::error::BalloonError;
use crate::mm::AllocFlags;
use crate::pool::BalloonPage;
use crate::transport::QueueId;
use crate::workqueue::BalloonWork;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use zerocopy::byteorder::{LittleEndian, U32};

impl BalloonDevice {
    /// Appends the balloon frames backing the native page at `addr`.
    pub(super) fn set_page_pfns(&self, pfns: &mut Vec<U32<LittleEndian>>, addr: PhysAddr) {
        let base = addr.balloon_pfn();
        for i in 0..self.pages_per_page {
            pfns.push(U32::new(base.wrapping_add(i as u32)));
        }
    }

    /// Gives up to `num` frames to the host. Returns the number of frames
    /// the host acknowledged.
    pub(super) fn fill_balloon(&self, num: usize) -> Result<usize, BalloonError> {
        let num = num.min(self.options.pfns_max);
        let mut pages: Vec<PhysAddr> = Vec::with_capacity(num / self.pages_per_page);
        let mut num_pfns = 0;

        while num_pfns + self.pages_per_page <= num {
            let Some(addr) = self.mm.alloc_pages(0, AllocFlags::balloon_page()) else {
                if !self.out_of_puff.swap(true, Ordering::Relaxed) {
                    log::info!(
                        "balloon: out of puff, can't get {} frames",
                        self.pages_per_page
                    );
                }
                // Sleep for at least 1/5 of a second before trying again
                self.platform.msleep(self.options.inflate_retry_delay_ms);
                break;
            };
            pages.push(addr);
            num_pfns += self.pages_per_page;
        }
        if num_pfns + self.pages_per_page > num {
            self.out_of_puff.store(false, Ordering::Relaxed);
        }

        if pages.is_empty() {
            return Ok(0);
        }

        let mut batch = self.lock_balloon();
        batch.pfns.clear();
        for addr in pages.iter() {
            self.set_page_pfns(&mut batch.pfns, *addr);
        }

        if let Err(e) = self.tell_host(QueueId::Inflate, &batch.pfns) {
            drop(batch);
            for addr in pages {
                self.mm.free_pages(addr, 0);
            }
            return Err(e.into());
        }

        for addr in pages {
            self.dev_info.enqueue(BalloonPage::new(addr));
            self.num_pages
                .fetch_add(self.pages_per_page as u32, Ordering::AcqRel);
            if !self.deflate_on_oom() {
                self.mm.adjust_managed_page_count(addr, -1);
            }
        }

        Ok(num_pfns)
    }

    /// Takes up to `num` frames back from the host. Pages are only reused
    /// after the host acknowledged the deflate message. Never allocates.
    pub(super) fn leak_balloon(&self, num: usize) -> Result<usize, BalloonError> {
        let num = num.min(self.options.pfns_max);

        let mut guard = self.lock_balloon();
        let batch = &mut *guard;
        let num = num.min(self.num_pages() as usize);
        batch.pfns.clear();

        let mut num_pfns = 0;
        while num_pfns + self.pages_per_page <= num {
            let Some(page) = self.dev_info.dequeue() else {
                break;
            };
            self.set_page_pfns(&mut batch.pfns, page.addr());
            batch.pages.push(page);
            num_pfns += self.pages_per_page;
        }

        if num_pfns == 0 {
            return Ok(0);
        }

        if let Err(e) = self.tell_host(QueueId::Deflate, &batch.pfns) {
            self.dev_info.list_enqueue(&mut batch.pages);
            return Err(e.into());
        }

        self.num_pages
            .fetch_sub(num_pfns as u32, Ordering::AcqRel);
        for page in batch.pages.drain(..) {
            self.release_page(page.addr());
        }

        Ok(num_pfns)
    }

    fn release_page(&self, addr: PhysAddr) {
        if !self.deflate_on_oom() {
            self.mm.adjust_managed_page_count(addr, 1);
        }
        self.mm.free_pages(addr, 0);
    }

    /// One convergence pass. Requeues itself while the target is not met.
    pub(super) fn update_balloon_size_func(&self) {
        let diff = self.towards_target();
        if diff == 0 {
            return;
        }

        let want = diff.unsigned_abs() as usize;
        if want < self.pages_per_page {
            // Not expressible in native pages
            log::debug!("balloon: ignoring {diff} frames below page granularity");
            return;
        }

        let result = if diff > 0 {
            self.fill_balloon(want)
        } else {
            self.leak_balloon(want)
        };
        self.update_balloon_size();

        let done = match result {
            Ok(done) => done,
            Err(e) => {
                let op = if diff > 0 { "inflate" } else { "deflate" };
                log::error!("balloon: {op} failed: {e}");
                return;
            }
        };

        log::debug!(
            "balloon: {} {done} frames, now {}",
            if diff > 0 { "inflated" } else { "deflated" },
            self.num_pages()
        );

        if want - done >= self.pages_per_page {
            if done == 0 && diff < 0 {
                // Everything left is isolated by compaction
                self.platform.msleep(self.options.inflate_retry_delay_ms);
            }
            self.queue_work_unless_stopped(BalloonWork::UpdateSize);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{BalloonError, ChannelError};
    use crate::features::BalloonFeatures;
    use crate::mm::ZoneId;
    use crate::testutils::{TestBalloon, TestMemory, TestTransport};
    use crate::transport::QueueId;
    use crate::BalloonOptions;

    #[test]
    fn fill_is_bounded_by_batch_size() {
        let tb = TestBalloon::new(BalloonFeatures::empty());
        assert_eq!(tb.dev.fill_balloon(1000).unwrap(), 256);
        assert_eq!(tb.dev.num_pages(), 256);
        let msgs = tb.transport.channel(QueueId::Inflate).pfn_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].len(), 256);
        assert_eq!(tb.mem.managed_delta(ZoneId(0)), -256);
        assert_eq!(tb.dev.pool().len(), 256);
    }

    #[test]
    fn fill_is_bounded_by_free_memory() {
        let tb = TestBalloon::setup(
            TestTransport::new(BalloonFeatures::empty()),
            TestMemory::new(10),
            BalloonOptions::default(),
        )
        .unwrap();
        assert_eq!(tb.dev.fill_balloon(100).unwrap(), 10);
        assert_eq!(tb.platform.slept_ms(), 200);

        // Nothing left: no message, just the backoff
        assert_eq!(tb.dev.fill_balloon(100).unwrap(), 0);
        assert_eq!(tb.platform.slept_ms(), 400);
        assert_eq!(tb.transport.channel(QueueId::Inflate).pfn_messages().len(), 1);
    }

    #[test]
    fn leak_restores_memory() {
        let tb = TestBalloon::new(BalloonFeatures::empty());
        tb.dev.fill_balloon(40).unwrap();
        let inflated = tb.transport.channel(QueueId::Inflate).pfn_messages();

        assert_eq!(tb.dev.leak_balloon(40).unwrap(), 40);
        assert_eq!(tb.dev.num_pages(), 0);
        assert_eq!(tb.mem.used_pages(), 0);
        assert_eq!(tb.mem.managed_delta(ZoneId(0)), 0);

        // LIFO: the deflate message holds the inflated frames in reverse
        let mut deflated = tb.transport.channel(QueueId::Deflate).pfn_messages();
        assert_eq!(deflated.len(), 1);
        deflated[0].reverse();
        assert_eq!(deflated[0], inflated[0]);
    }

    #[test]
    fn leak_is_bounded_by_balloon_size() {
        let tb = TestBalloon::new(BalloonFeatures::empty());
        tb.dev.fill_balloon(5).unwrap();
        assert_eq!(tb.dev.leak_balloon(100).unwrap(), 5);
        assert_eq!(tb.dev.leak_balloon(100).unwrap(), 0);
        assert_eq!(tb.transport.channel(QueueId::Deflate).pfn_messages().len(), 1);
    }

    #[test]
    fn deflate_on_oom_keeps_managed_count() {
        let tb = TestBalloon::new(BalloonFeatures::DEFLATE_ON_OOM);
        tb.dev.fill_balloon(8).unwrap();
        assert_eq!(tb.mem.managed_delta(ZoneId(0)), 0);
        tb.dev.leak_balloon(8).unwrap();
        assert_eq!(tb.mem.managed_delta(ZoneId(0)), 0);
    }

    #[test]
    fn failed_inflate_post_rolls_back() {
        let tb = TestBalloon::new(BalloonFeatures::empty());
        tb.transport.channel(QueueId::Inflate).set_fail_posts(true);
        assert_eq!(
            tb.dev.fill_balloon(16),
            Err(BalloonError::Channel(ChannelError::Broken))
        );
        assert_eq!(tb.dev.num_pages(), 0);
        assert_eq!(tb.mem.used_pages(), 0);
        assert!(tb.dev.pool().is_empty());
    }

    #[test]
    fn failed_deflate_post_keeps_pages() {
        let tb = TestBalloon::new(BalloonFeatures::empty());
        tb.dev.fill_balloon(16).unwrap();
        tb.transport.channel(QueueId::Deflate).set_fail_posts(true);
        assert!(tb.dev.leak_balloon(16).is_err());
        assert_eq!(tb.dev.num_pages(), 16);
        assert_eq!(tb.dev.pool().len(), 16);
        assert_eq!(tb.mem.used_pages(), 16);
    }

    #[test]
    fn large_native_pages() {
        // 16KiB pages: four balloon frames each
        let tb = TestBalloon::setup(
            TestTransport::new(BalloonFeatures::empty()),
            TestMemory::with_page_shift(64, 14),
            BalloonOptions::default(),
        )
        .unwrap();
        assert_eq!(tb.dev.pages_per_page(), 4);
        assert_eq!(tb.dev.fill_balloon(10).unwrap(), 8);
        assert_eq!(tb.dev.num_pages(), 8);
        let msgs = tb.transport.channel(QueueId::Inflate).pfn_messages();
        let first = msgs[0][0];
        assert_eq!(&msgs[0][..4], &[first, first + 1, first + 2, first + 3]);
        assert_eq!(tb.mem.used_pages(), 2);

        assert_eq!(tb.dev.leak_balloon(3).unwrap(), 0);
        assert_eq!(tb.dev.leak_balloon(8).unwrap(), 8);
    }
}
