// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use super::BalloonDevice;
use crate::error::BalloonError;
use crate::transport::{BufferDesc, QueueId};
use crate::types::PAGE_REPORTING_CAPACITY;
use core::sync::atomic::Ordering;

/// Parameters for the free page reporting facility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageReportingInfo {
    /// Maximum number of blocks per report
    pub capacity: usize,
    /// Preferred block order, if the driver has one
    pub order: Option<usize>,
}

impl BalloonDevice {
    /// Reporting parameters, `None` unless reporting is enabled.
    pub fn page_reporting_info(&self) -> Option<PageReportingInfo> {
        self.reporting_registered
            .load(Ordering::Acquire)
            .then_some(PageReportingInfo {
                capacity: PAGE_REPORTING_CAPACITY,
                order: self.options.reporting_order,
            })
    }

    /// Reports a batch of free blocks and waits until the host processed
    /// them. The reporting facility must not reuse the blocks before this
    /// returns and must serialize its calls.
    pub fn report_free_pages(&self, blocks: &[BufferDesc]) -> Result<(), BalloonError> {
        if !self.reporting_registered.load(Ordering::Acquire) {
            return Err(BalloonError::NotSupported);
        }
        if blocks.len() > PAGE_REPORTING_CAPACITY {
            return Err(BalloonError::TooLarge);
        }
        if blocks.is_empty() {
            return Ok(());
        }

        let vq = self.queue(QueueId::Reporting)?;
        if let Err(e) = vq.add_inbufs(blocks) {
            if !self.reporting_warned.swap(true, Ordering::Relaxed) {
                log::warn!("balloon: failed to report free pages: {e}");
            }
            return Err(e.into());
        }
        vq.kick();

        self.acked
            .wait_event(&*self.platform, || vq.get_buf().is_some());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PhysAddr;
    use crate::error::ChannelError;
    use crate::features::BalloonFeatures;
    use crate::testutils::{Posted, TestBalloon, TestTransport};
    use alloc::vec::Vec;

    fn blocks(n: usize) -> Vec<BufferDesc> {
        (0..n)
            .map(|i| BufferDesc {
                addr: PhysAddr::new(0x4000_0000 + i * 0x20_0000),
                len: 0x20_0000,
            })
            .collect()
    }

    #[test]
    fn report_batch() {
        let tb = TestBalloon::new(BalloonFeatures::REPORTING);
        let info = tb.dev.page_reporting_info().unwrap();
        assert_eq!(info.capacity, 32);
        assert_eq!(info.order, None);

        let batch = blocks(32);
        tb.dev.report_free_pages(&batch).unwrap();
        let posted = tb.transport.channel(QueueId::Reporting).posted();
        assert_eq!(posted, [Posted::In(batch)]);

        assert_eq!(
            tb.dev.report_free_pages(&blocks(33)),
            Err(BalloonError::TooLarge)
        );
    }

    #[test]
    fn small_queue_disables_reporting() {
        let tb = TestBalloon::try_new(
            TestTransport::new(BalloonFeatures::REPORTING).with_queue_size(QueueId::Reporting, 16),
        )
        .unwrap();
        assert!(!tb.dev.features().contains(BalloonFeatures::REPORTING));
        assert!(tb.dev.page_reporting_info().is_none());
        assert_eq!(
            tb.dev.report_free_pages(&blocks(1)),
            Err(BalloonError::NotSupported)
        );
    }

    #[test]
    fn failed_report() {
        let tb = TestBalloon::new(BalloonFeatures::REPORTING);
        tb.transport.channel(QueueId::Reporting).set_fail_posts(true);
        assert_eq!(
            tb.dev.report_free_pages(&blocks(2)),
            Err(BalloonError::Channel(ChannelError::Broken))
        );
        // Still usable afterwards
        tb.transport.channel(QueueId::Reporting).set_fail_posts(false);
        assert!(tb.dev.report_free_pages(&blocks(2)).is_ok());
    }
}
