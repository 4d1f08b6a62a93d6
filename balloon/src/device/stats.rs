// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use super::BalloonDevice;
use crate::error::BalloonError;
use crate::locking::SpinLock;
use crate::mm::MemoryManager;
use crate::transport::QueueId;
use crate::workqueue::BalloonWork;
use alloc::vec::Vec;
use zerocopy::byteorder::{LittleEndian, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum StatTag {
    /// Bytes swapped in
    SwapIn = 0,
    /// Bytes swapped out
    SwapOut = 1,
    MajFlt = 2,
    MinFlt = 3,
    /// Free memory in bytes
    MemFree = 4,
    /// Total memory in bytes
    MemTot = 5,
    /// Available memory in bytes, as estimated by the guest
    Avail = 6,
    /// Disk caches in bytes
    Caches = 7,
    HtlbPgAlloc = 8,
    HtlbPgFail = 9,
}

pub const NR_STAT_TAGS: usize = 10;

/// One statistics entry as sent to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BalloonStat {
    pub tag: U16<LittleEndian>,
    pub val: U64<LittleEndian>,
}

impl BalloonStat {
    fn new(tag: StatTag, val: u64) -> Self {
        Self {
            tag: U16::new(tag as u16),
            val: U64::new(val),
        }
    }
}

#[derive(Debug)]
struct StatsBuffer {
    stats: [BalloonStat; NR_STAT_TAGS],
    num: usize,
}

impl StatsBuffer {
    fn push(&mut self, tag: StatTag, val: u64) {
        self.stats[self.num] = BalloonStat::new(tag, val);
        self.num += 1;
    }

    fn entries(&self) -> &[BalloonStat] {
        &self.stats[..self.num]
    }
}

#[derive(Debug)]
pub(super) struct StatsReporter {
    buf: SpinLock<StatsBuffer>,
}

impl StatsReporter {
    pub(super) fn new() -> Self {
        Self {
            buf: SpinLock::new(StatsBuffer {
                stats: [BalloonStat::default(); NR_STAT_TAGS],
                num: 0,
            }),
        }
    }

    fn update(&self, mm: &dyn MemoryManager) {
        let events = mm.vm_events();
        let info = mm.meminfo();
        let shift = mm.page_shift();
        let bytes = |pages: u64| pages << shift;

        let mut buf = self.buf.lock();
        buf.num = 0;
        buf.push(StatTag::SwapIn, bytes(events.swap_in));
        buf.push(StatTag::SwapOut, bytes(events.swap_out));
        buf.push(StatTag::MajFlt, events.major_faults);
        buf.push(StatTag::MinFlt, events.minor_faults);
        if let Some(alloc) = events.htlb_pgalloc {
            buf.push(StatTag::HtlbPgAlloc, alloc);
        }
        if let Some(fail) = events.htlb_pgfail {
            buf.push(StatTag::HtlbPgFail, fail);
        }
        buf.push(StatTag::MemFree, bytes(info.free));
        buf.push(StatTag::MemTot, bytes(info.total));
        buf.push(StatTag::Avail, bytes(info.available));
        buf.push(StatTag::Caches, bytes(info.caches));
    }
}

impl BalloonDevice {
    /// Posts the first statistics buffer, which the host keeps until it
    /// wants fresh numbers.
    pub(super) fn prime_stats(&self) -> Result<(), BalloonError> {
        let Some(stats) = &self.stats else {
            return Ok(());
        };
        stats.update(&*self.mm);
        let vq = self.queue(QueueId::Stats)?;
        vq.add_outbuf(stats.buf.lock().entries().as_bytes())?;
        vq.kick();
        Ok(())
    }

    /// Host returned the statistics buffer.
    pub(super) fn stats_request(&self) {
        let stop_update = self.stop_update.lock();
        if !*stop_update {
            self.wq.queue_work(BalloonWork::UpdateStats);
        }
    }

    pub(super) fn update_balloon_stats_func(&self) {
        let Some(stats) = &self.stats else {
            return;
        };
        let Ok(vq) = self.queue(QueueId::Stats) else {
            return;
        };

        stats.update(&*self.mm);

        // Only one buffer is ever outstanding; resend once the host is done
        if vq.get_buf().is_none() {
            return;
        }
        if let Err(e) = vq.add_outbuf(stats.buf.lock().entries().as_bytes()) {
            log::error!("balloon: failed to post stats: {e}");
            return;
        }
        vq.kick();
    }

    /// The most recently computed statistics.
    pub fn stats_snapshot(&self) -> Option<Vec<BalloonStat>> {
        let stats = self.stats.as_ref()?;
        let buf = stats.buf.lock();
        Some(buf.entries().to_vec())
    }
}
