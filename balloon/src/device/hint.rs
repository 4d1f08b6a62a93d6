// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Free page hinting.
//!
//! The host starts a hinting session by publishing a new command id. The
//! driver then grabs as many free blocks as the allocator hands out and
//! posts them to the host, which may drop their contents. The blocks stay
//! allocated until the host sends the DONE id, or until the memory manager
//! asks for them back through the shrinker.

use super::BalloonDevice;
use crate::address::PhysAddr;
use crate::error::ChannelError;
use crate::locking::SpinLock;
use crate::mm::{AllocFlags, MemoryManagerExt};
use crate::transport::{BufferDesc, HostChannel, QueueId};
use crate::types::{CMD_ID_DONE, CMD_ID_STOP};
use crate::workqueue::BalloonWork;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::IntoBytes;

#[derive(Debug)]
pub(super) struct FreePageHint {
    /// Order of the hinted blocks
    order: usize,
    /// The command id in config space must be re-read
    config_read_pending: AtomicBool,
    cmd_id_received_cache: AtomicU32,
    /// Id of the running or last session
    cmd_id_active: AtomicU32,
    /// Blocks currently hinted to the host
    blocks: SpinLock<Vec<PhysAddr>>,
    num_blocks: AtomicUsize,
}

impl FreePageHint {
    pub(super) fn new(order: usize) -> Self {
        Self {
            order,
            config_read_pending: AtomicBool::new(false),
            cmd_id_received_cache: AtomicU32::new(CMD_ID_STOP),
            cmd_id_active: AtomicU32::new(CMD_ID_STOP),
            blocks: SpinLock::new(Vec::new()),
            num_blocks: AtomicUsize::new(0),
        }
    }

    pub(super) fn pages_per_block(&self) -> usize {
        1 << self.order
    }

    pub(super) fn num_blocks(&self) -> usize {
        self.num_blocks.load(Ordering::Acquire)
    }
}

fn drain_used(vq: &dyn HostChannel) {
    while vq.get_buf().is_some() {}
}

impl BalloonDevice {
    pub(super) fn queue_free_page_work(&self) {
        let Some(hint) = &self.hint else {
            return;
        };
        if !hint.config_read_pending.swap(true, Ordering::AcqRel) {
            self.wq.queue_work(BalloonWork::ReportFreePage);
        }
    }

    fn cmd_id_received(&self, hint: &FreePageHint) -> u32 {
        if hint.config_read_pending.swap(false, Ordering::AcqRel) {
            hint.cmd_id_received_cache
                .store(self.config.free_page_hint_cmd_id(), Ordering::Release);
        }
        hint.cmd_id_received_cache.load(Ordering::Acquire)
    }

    fn send_cmd_id(vq: &dyn HostChannel, cmd_id: u32) -> Result<(), ChannelError> {
        drain_used(vq);
        vq.add_outbuf(U32::<LittleEndian>::new(cmd_id).as_bytes())?;
        vq.kick();
        Ok(())
    }

    fn send_cmd_id_start(&self, hint: &FreePageHint, vq: &dyn HostChannel) -> Result<(), ChannelError> {
        let cmd_id = self.cmd_id_received(hint);
        hint.cmd_id_active.store(cmd_id, Ordering::Release);
        Self::send_cmd_id(vq, cmd_id)
    }

    /// Hints one block. Returns false once the allocator ran dry.
    fn get_free_page_and_send(
        &self,
        hint: &FreePageHint,
        vq: &dyn HostChannel,
    ) -> Result<bool, ChannelError> {
        drain_used(vq);

        let Some(addr) = self.mm.alloc_pages(hint.order, AllocFlags::free_page_hint()) else {
            return Ok(false);
        };

        if vq.num_free() > 1 {
            let desc = BufferDesc {
                addr,
                len: self.mm.page_size() << hint.order,
            };
            if let Err(e) = vq.add_inbufs(&[desc]) {
                self.mm.free_pages(addr, hint.order);
                return Err(e);
            }
            vq.kick();
            hint.blocks.lock().push(addr);
            hint.num_blocks.fetch_add(1, Ordering::AcqRel);
        } else {
            // Queue full, the block was free anyway
            self.mm.free_pages(addr, hint.order);
        }
        Ok(true)
    }

    fn send_free_pages(&self, hint: &FreePageHint, vq: &dyn HostChannel) -> Result<(), ChannelError> {
        loop {
            // Stop as soon as the host changed the command id
            if hint.cmd_id_active.load(Ordering::Acquire) != self.cmd_id_received(hint) {
                break;
            }
            if !self.get_free_page_and_send(hint, vq)? {
                break;
            }
        }
        Ok(())
    }

    fn report_free_page(&self, hint: &FreePageHint) {
        let vq = match self.queue(QueueId::FreePage) {
            Ok(vq) => vq,
            Err(e) => {
                log::warn!("balloon: no free page queue: {e}");
                return;
            }
        };

        match self.send_cmd_id_start(hint, &*vq) {
            Ok(()) => {
                if let Err(e) = self.send_free_pages(hint, &*vq) {
                    log::error!("balloon: failed to hint free pages: {e}");
                }
            }
            Err(e) => log::error!("balloon: failed to send start command id: {e}"),
        }

        if let Err(e) = Self::send_cmd_id(&*vq, CMD_ID_STOP) {
            log::error!("balloon: failed to send stop command id: {e}");
        }
        log::debug!(
            "balloon: hinting session {} holds {} blocks",
            hint.cmd_id_active.load(Ordering::Acquire),
            hint.num_blocks()
        );
    }

    pub(super) fn report_free_page_func(&self) {
        let Some(hint) = &self.hint else {
            return;
        };
        let cmd_id = self.cmd_id_received(hint);
        if cmd_id == CMD_ID_DONE {
            let n = self.return_free_pages_to_mm(usize::MAX);
            log::debug!("balloon: host done with {n} hinted blocks");
        } else if cmd_id != CMD_ID_STOP && cmd_id != hint.cmd_id_active.load(Ordering::Acquire) {
            self.report_free_page(hint);
        }
    }

    /// Gives up to `num_to_return` hinted blocks back to the allocator.
    pub(super) fn return_free_pages_to_mm(&self, num_to_return: usize) -> usize {
        let Some(hint) = &self.hint else {
            return 0;
        };
        let mut blocks = hint.blocks.lock();
        let mut num_returned = 0;
        while num_returned < num_to_return {
            let Some(addr) = blocks.pop() else {
                break;
            };
            self.mm.free_pages(addr, hint.order);
            num_returned += 1;
        }
        hint.num_blocks.fetch_sub(num_returned, Ordering::AcqRel);
        num_returned
    }

    /// Number of blocks currently hinted to the host.
    pub fn free_page_hint_blocks(&self) -> usize {
        self.hint.as_ref().map_or(0, FreePageHint::num_blocks)
    }

    /// Command id of the running or last hinting session.
    pub fn free_page_hint_cmd_id(&self) -> Option<u32> {
        self.hint
            .as_ref()
            .map(|hint| hint.cmd_id_active.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::BalloonFeatures;
    use crate::options::BalloonOptions;
    use crate::testutils::{Posted, TestBalloon, TestMemory, TestTransport};
    use alloc::sync::Arc;

    fn hint_balloon(capacity: usize) -> TestBalloon {
        let options = BalloonOptions {
            hint_block_order: 2,
            ..Default::default()
        };
        TestBalloon::setup(
            TestTransport::new(BalloonFeatures::FREE_PAGE_HINT),
            TestMemory::new(capacity),
            options,
        )
        .unwrap()
    }

    fn cmd_ids(posted: &[Posted]) -> Vec<u32> {
        posted
            .iter()
            .filter_map(|p| match p {
                Posted::Out(data) => Some(u32::from_le_bytes(data[..4].try_into().unwrap())),
                Posted::In(_) => None,
            })
            .collect()
    }

    #[test]
    fn session_hints_all_free_memory() {
        let tb = hint_balloon(64);
        tb.transport.config().set_cmd_id(5);
        tb.dev.config_changed();
        tb.run_until_idle();

        // 64 pages in blocks of 4
        assert_eq!(tb.dev.free_page_hint_blocks(), 16);
        assert_eq!(tb.dev.free_page_hint_cmd_id(), Some(5));
        assert_eq!(tb.mem.used_pages(), 64);

        let posted = tb.transport.channel(QueueId::FreePage).posted();
        assert_eq!(cmd_ids(&posted), [5, CMD_ID_STOP]);
        let inbufs: Vec<_> = posted
            .iter()
            .filter_map(|p| match p {
                Posted::In(bufs) => Some(bufs[0]),
                Posted::Out(_) => None,
            })
            .collect();
        assert_eq!(inbufs.len(), 16);
        assert!(inbufs.iter().all(|b| b.len == 4 * 4096));
    }

    #[test]
    fn same_id_does_not_restart() {
        let tb = hint_balloon(16);
        tb.transport.config().set_cmd_id(7);
        tb.dev.config_changed();
        tb.run_until_idle();
        let posted = tb.transport.channel(QueueId::FreePage).posted().len();

        tb.dev.config_changed();
        tb.run_until_idle();
        assert_eq!(tb.transport.channel(QueueId::FreePage).posted().len(), posted);
    }

    #[test]
    fn done_returns_blocks() {
        let tb = hint_balloon(32);
        tb.transport.config().set_cmd_id(9);
        tb.dev.config_changed();
        tb.run_until_idle();
        assert_eq!(tb.dev.free_page_hint_blocks(), 8);

        tb.transport.config().set_cmd_id(CMD_ID_DONE);
        tb.dev.config_changed();
        tb.run_until_idle();
        assert_eq!(tb.dev.free_page_hint_blocks(), 0);
        assert_eq!(tb.mem.used_pages(), 0);
    }

    #[test]
    fn id_change_stops_session() {
        let tb = hint_balloon(64);
        let config = tb.transport.config().clone();
        let dev = Arc::downgrade(&tb.dev);
        let mut hinted = 0;
        tb.transport
            .channel(QueueId::FreePage)
            .set_on_post(move |posted| {
                if let Posted::In(_) = posted {
                    hinted += 1;
                    if hinted == 3 {
                        config.set_cmd_id(CMD_ID_STOP);
                        if let Some(dev) = dev.upgrade() {
                            dev.config_changed();
                        }
                    }
                }
            });

        tb.transport.config().set_cmd_id(11);
        tb.dev.config_changed();
        tb.run_until_idle();

        // The block posted with the id change is kept, then the session ends
        assert_eq!(tb.dev.free_page_hint_blocks(), 3);
        let posted = tb.transport.channel(QueueId::FreePage).posted();
        assert_eq!(cmd_ids(&posted), [11, CMD_ID_STOP]);
        assert!(matches!(posted.last(), Some(Posted::Out(_))));
    }

    #[test]
    fn full_queue_frees_blocks() {
        let tb = TestBalloon::setup(
            TestTransport::new(BalloonFeatures::FREE_PAGE_HINT)
                .with_queue_size(QueueId::FreePage, 2)
                .with_auto_complete(QueueId::FreePage, false),
            TestMemory::new(16),
            BalloonOptions {
                hint_block_order: 2,
                ..Default::default()
            },
        )
        .unwrap();
        // The host never returns the start id, so each block goes straight
        // back until the allocator gives up
        tb.mem.fail_allocs_after(5);
        tb.transport.config().set_cmd_id(3);
        tb.dev.config_changed();
        tb.run_until_idle();

        assert_eq!(tb.dev.free_page_hint_blocks(), 0);
        assert_eq!(tb.mem.used_pages(), 0);
        assert_eq!(tb.mem.alloc_calls(), 6);
        let posted = tb.transport.channel(QueueId::FreePage).posted();
        assert_eq!(posted.len(), 2);
        assert_eq!(cmd_ids(&posted), [3, CMD_ID_STOP]);
    }
}
