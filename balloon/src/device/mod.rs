// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! The balloon device: feature negotiation, queue setup, work dispatch and
//! teardown. The engines driving the individual host protocols live in the
//! submodules.

mod hint;
mod migrate;
mod pressure;
mod reporting;
mod size;
mod stats;

pub use migrate::{MigrateMode, MovablePageOps};
pub use reporting::PageReportingInfo;
pub use stats::{BalloonStat, StatTag, NR_STAT_TAGS};

use crate::config::BalloonConfigAccess;
use crate::error::{BalloonError, ChannelError};
use crate::features::BalloonFeatures;
use crate::locking::{LockGuard, SpinLock};
use crate::mm::{MemoryManager, MemoryManagerExt};
use crate::options::BalloonOptions;
use crate::platform::BalloonPlatform;
use crate::pool::{BalloonDevInfo, BalloonPageRef};
use crate::transport::{BalloonTransport, HostChannel, QueueId, NR_QUEUES};
use crate::types::{PAGE_POISON_VAL, PAGE_REPORTING_CAPACITY};
use crate::waiting::WaitQueue;
use crate::workqueue::{BalloonWork, WorkQueue};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use hint::FreePageHint;
use stats::StatsReporter;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::IntoBytes;

#[derive(Debug, Default)]
struct BalloonQueues {
    queues: [Option<Arc<dyn HostChannel>>; NR_QUEUES],
}

impl BalloonQueues {
    fn get(&self, id: QueueId) -> Option<Arc<dyn HostChannel>> {
        self.queues[id.index()].clone()
    }
}

/// Scratch buffers for host messages, preallocated so that deflating never
/// needs memory.
#[derive(Debug)]
struct BalloonBatch {
    pfns: Vec<U32<LittleEndian>>,
    pages: Vec<BalloonPageRef>,
}

#[derive(Debug)]
pub struct BalloonDevice {
    transport: Arc<dyn BalloonTransport>,
    config: BalloonConfigAccess,
    mm: Arc<dyn MemoryManager>,
    platform: Arc<dyn BalloonPlatform>,
    options: BalloonOptions,
    /// Features agreed with the device
    negotiated: BalloonFeatures,
    /// Negotiated features minus those the queues turned out too small for
    features: BalloonFeatures,
    /// Balloon frames per native page
    pages_per_page: usize,
    queues: SpinLock<BalloonQueues>,
    wq: WorkQueue,
    /// Set on removal, no new work gets queued afterwards
    stop_update: SpinLock<bool>,
    /// Woken from the inflate, deflate and reporting queue interrupts
    acked: WaitQueue,
    /// Balloon size in 4KiB frames, as acknowledged by the host
    num_pages: AtomicU32,
    /// Serializes inflate, deflate and migration traffic. Held across host
    /// round trips.
    balloon_lock: SpinLock<BalloonBatch>,
    dev_info: BalloonDevInfo,
    out_of_puff: AtomicBool,
    stats: Option<StatsReporter>,
    hint: Option<FreePageHint>,
    oom_registered: AtomicBool,
    shrinker_registered: AtomicBool,
    reporting_registered: AtomicBool,
    reporting_warned: AtomicBool,
}

impl BalloonDevice {
    /// Negotiates features, sets up the queues and brings the device up.
    ///
    /// If the host already asks for a balloon, the first convergence pass is
    /// queued before returning.
    pub fn attach(
        transport: Arc<dyn BalloonTransport>,
        mm: Arc<dyn MemoryManager>,
        platform: Arc<dyn BalloonPlatform>,
        options: BalloonOptions,
    ) -> Result<Arc<Self>, BalloonError> {
        options.validate()?;

        let Some(space) = transport.config_space() else {
            log::error!("balloon: config space is not accessible");
            return Err(BalloonError::NoConfigAccess);
        };

        let pages_per_page = mm.balloon_frames_per_page();
        if pages_per_page == 0 || pages_per_page > options.pfns_max {
            log::error!(
                "balloon: native page size {:#x} not supported",
                mm.page_size()
            );
            return Err(BalloonError::IncompatiblePageSize);
        }

        let negotiated =
            BalloonFeatures::negotiate(options.features, transport.device_features(), &*mm);
        transport.set_driver_features(negotiated.bits());

        let queues = Self::find_queues(&*transport, negotiated)?;

        let mut features = negotiated;
        if features.contains(BalloonFeatures::FREE_PAGE_HINT) {
            let size = queues.get(QueueId::FreePage).map_or(0, |vq| vq.size());
            if size < 2 {
                log::warn!("balloon: free page queue too small ({size}), hinting disabled");
                features.remove(BalloonFeatures::FREE_PAGE_HINT);
            }
        }
        if features.contains(BalloonFeatures::REPORTING) {
            let capacity = queues.get(QueueId::Reporting).map_or(0, |vq| vq.size());
            if capacity < PAGE_REPORTING_CAPACITY {
                log::warn!("balloon: reporting queue too small ({capacity}), reporting disabled");
                features.remove(BalloonFeatures::REPORTING);
            }
        }

        let batch = BalloonBatch {
            pfns: Vec::with_capacity(options.pfns_max),
            pages: Vec::with_capacity(options.pfns_max / pages_per_page),
        };

        let dev = Arc::new(Self {
            config: BalloonConfigAccess::new(space),
            dev_info: BalloonDevInfo::new(mm.clone()),
            stats: features
                .contains(BalloonFeatures::STATS_VQ)
                .then(StatsReporter::new),
            hint: features
                .contains(BalloonFeatures::FREE_PAGE_HINT)
                .then(|| FreePageHint::new(options.hint_block_order)),
            transport,
            mm,
            platform,
            options,
            negotiated,
            features,
            pages_per_page,
            queues: SpinLock::new(queues),
            wq: WorkQueue::new(),
            stop_update: SpinLock::new(false),
            acked: WaitQueue::new(),
            num_pages: AtomicU32::new(0),
            balloon_lock: SpinLock::new(batch),
            out_of_puff: AtomicBool::new(false),
            oom_registered: AtomicBool::new(false),
            shrinker_registered: AtomicBool::new(false),
            reporting_registered: AtomicBool::new(false),
            reporting_warned: AtomicBool::new(false),
        });

        if let Err(e) = dev.prime_stats() {
            log::error!("balloon: failed to post initial stats: {e}");
            dev.transport.del_queues();
            return Err(e);
        }

        if dev.features.contains(BalloonFeatures::FREE_PAGE_HINT) {
            dev.shrinker_registered.store(true, Ordering::Release);
        }
        if dev.features.contains(BalloonFeatures::DEFLATE_ON_OOM) {
            dev.oom_registered.store(true, Ordering::Release);
        }
        if dev.features.contains(BalloonFeatures::PAGE_POISON) {
            let poison_val = if dev.mm.want_init_on_free() {
                0
            } else {
                PAGE_POISON_VAL
            };
            dev.config.set_poison_val(poison_val);
        }
        if dev.features.contains(BalloonFeatures::REPORTING) {
            dev.reporting_registered.store(true, Ordering::Release);
        }

        dev.transport.device_ready();
        log::info!("balloon: attached, features {:?}", dev.features);

        if dev.towards_target() != 0 {
            dev.config_changed();
        }

        Ok(dev)
    }

    fn find_queues(
        transport: &dyn BalloonTransport,
        features: BalloonFeatures,
    ) -> Result<BalloonQueues, BalloonError> {
        let mut queues = BalloonQueues::default();
        for id in QueueId::ALL {
            let wanted = match id {
                QueueId::Inflate | QueueId::Deflate => true,
                QueueId::Stats => features.contains(BalloonFeatures::STATS_VQ),
                QueueId::FreePage => features.contains(BalloonFeatures::FREE_PAGE_HINT),
                QueueId::Reporting => features.contains(BalloonFeatures::REPORTING),
            };
            if !wanted {
                continue;
            }
            match transport.find_queue(id) {
                Ok(vq) => queues.queues[id.index()] = Some(vq),
                Err(e) => {
                    log::error!("balloon: failed to set up {id} queue: {e}");
                    transport.del_queues();
                    return Err(e.into());
                }
            }
        }
        Ok(queues)
    }

    fn queue(&self, id: QueueId) -> Result<Arc<dyn HostChannel>, ChannelError> {
        self.queues.lock().get(id).ok_or(ChannelError::NotPresent)
    }

    /// Takes the balloon lock. Its holder may be blocked on a host round
    /// trip, so a contended acquire gives the CPU away instead of spinning.
    fn lock_balloon(&self) -> LockGuard<'_, BalloonBatch> {
        loop {
            if let Some(guard) = self.balloon_lock.try_lock() {
                return guard;
            }
            self.platform.schedule();
        }
    }

    /// Posts a frame number array and waits until the host returned it.
    fn tell_host(&self, id: QueueId, pfns: &[U32<LittleEndian>]) -> Result<(), ChannelError> {
        let vq = self.queue(id)?;
        vq.add_outbuf(pfns.as_bytes())?;
        vq.kick();
        self.acked
            .wait_event(&*self.platform, || vq.get_buf().is_some());
        Ok(())
    }

    /// Host notification about a config space change.
    pub fn config_changed(&self) {
        let stop_update = self.stop_update.lock();
        if !*stop_update {
            self.wq.queue_work(BalloonWork::UpdateSize);
            self.queue_free_page_work();
        }
    }

    /// Queue interrupt handler. Only signals waiters or queues work.
    pub fn handle_queue_interrupt(&self, id: QueueId) {
        match id {
            QueueId::Inflate | QueueId::Deflate | QueueId::Reporting => {
                self.acked.wakeup(&*self.platform);
            }
            QueueId::Stats => self.stats_request(),
            QueueId::FreePage => {}
        }
    }

    fn queue_work_unless_stopped(&self, work: BalloonWork) -> bool {
        let stop_update = self.stop_update.lock();
        !*stop_update && self.wq.queue_work(work)
    }

    /// Runs one pending work item in the caller's context.
    pub fn run_work(&self) -> Option<BalloonWork> {
        self.wq.run_one(|work| match work {
            BalloonWork::UpdateSize => self.update_balloon_size_func(),
            BalloonWork::UpdateStats => self.update_balloon_stats_func(),
            BalloonWork::ReportFreePage => self.report_free_page_func(),
        })
    }

    pub fn has_pending_work(&self) -> bool {
        self.wq.has_work()
    }

    /// Frames still to inflate (positive) or deflate (negative) to reach the
    /// host target.
    pub fn towards_target(&self) -> i64 {
        i64::from(self.config.num_pages()) - i64::from(self.num_pages())
    }

    /// Publishes the acknowledged balloon size to the host.
    fn update_balloon_size(&self) {
        self.config.set_actual(self.num_pages());
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Acquire)
    }

    pub fn features(&self) -> BalloonFeatures {
        self.features
    }

    pub fn options(&self) -> &BalloonOptions {
        &self.options
    }

    pub fn pages_per_page(&self) -> usize {
        self.pages_per_page
    }

    pub fn pool(&self) -> &BalloonDevInfo {
        &self.dev_info
    }

    fn deflate_on_oom(&self) -> bool {
        self.features.contains(BalloonFeatures::DEFLATE_ON_OOM)
    }

    /// Detaches the driver: stops all work, gives every page back to the
    /// guest and shuts the device down.
    pub fn detach(&self) {
        self.reporting_registered.store(false, Ordering::Release);
        self.oom_registered.store(false, Ordering::Release);
        self.shrinker_registered.store(false, Ordering::Release);

        *self.stop_update.lock() = true;
        self.wq
            .cancel_work_sync(BalloonWork::UpdateSize, &*self.platform);
        self.wq
            .cancel_work_sync(BalloonWork::UpdateStats, &*self.platform);
        self.wq
            .cancel_work_sync(BalloonWork::ReportFreePage, &*self.platform);

        self.remove_common();
        log::info!("balloon: detached");
    }

    fn remove_common(&self) {
        // Isolated pages come back through putback or migration
        while self.num_pages() != 0 {
            match self.leak_balloon(self.num_pages() as usize) {
                Ok(0) => self.platform.schedule(),
                Ok(_) => {}
                Err(e) => {
                    log::error!("balloon: failed to drain balloon: {e}");
                    break;
                }
            }
        }
        self.update_balloon_size();

        if self.hint.is_some() {
            self.return_free_pages_to_mm(usize::MAX);
        }

        self.transport.reset();
        self.transport.del_queues();
        *self.queues.lock() = BalloonQueues::default();
    }

    /// Suspend: stops dispatching work and releases the balloon. Must not be
    /// called from a worker running [`BalloonDevice::run_work`].
    pub fn freeze(&self) {
        self.wq.freeze(&*self.platform);
        self.remove_common();
        log::debug!("balloon: frozen");
    }

    /// Resume after [`BalloonDevice::freeze`].
    pub fn restore(&self) -> Result<(), BalloonError> {
        let queues = Self::find_queues(&*self.transport, self.negotiated)?;
        *self.queues.lock() = queues;
        self.prime_stats()?;

        self.transport.device_ready();

        if self.towards_target() != 0 {
            self.config_changed();
        }
        self.update_balloon_size();
        self.wq.thaw();
        log::debug!("balloon: restored");
        Ok(())
    }
}
