// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! In-memory stand-ins for the memory manager, the transport and the
//! scheduler, used by unit tests and fuzzing.

extern crate std;

use crate::address::{Address, PhysAddr};
use crate::config::{BalloonConfig, ConfigSpace};
use crate::device::BalloonDevice;
use crate::error::{BalloonError, ChannelError};
use crate::features::BalloonFeatures;
use crate::locking::SpinLock;
use crate::mm::{AllocFlags, MemInfo, MemoryManager, VmEvents, ZoneId};
use crate::options::BalloonOptions;
use crate::platform::{BalloonPlatform, WaiterId};
use crate::transport::{BalloonTransport, BufferDesc, HostChannel, QueueId, NR_QUEUES};
use crate::workqueue::BalloonWork;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use zerocopy::IntoBytes;

/// Native pages of the memory manager behind [`TestBalloon::new`].
pub const TEST_MEMORY_PAGES: usize = 4096;

const TEST_MEMORY_BASE: usize = 0x10_0000;
const MAX_WORK_ITEMS: usize = 100_000;

static NEXT_WAITER: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static CURRENT_WAITER: WaiterId = WaiterId(NEXT_WAITER.fetch_add(1, Ordering::Relaxed));
}

/// A platform running every context on its own host thread. Blocking waits
/// on a per-waiter wakeup permit.
#[derive(Debug, Default)]
pub struct TestPlatform {
    slept_ms: AtomicU64,
    schedules: AtomicU64,
    blocks: AtomicU64,
    permits: Mutex<BTreeSet<WaiterId>>,
    woken: Condvar,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total time the code under test asked to sleep.
    pub fn slept_ms(&self) -> u64 {
        self.slept_ms.load(Ordering::Relaxed)
    }

    pub fn schedules(&self) -> u64 {
        self.schedules.load(Ordering::Relaxed)
    }

    /// Number of times a context blocked waiting for a wakeup.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

impl BalloonPlatform for TestPlatform {
    fn schedule(&self) {
        self.schedules.fetch_add(1, Ordering::Relaxed);
        std::thread::yield_now();
    }

    fn msleep(&self, ms: u32) {
        self.slept_ms.fetch_add(u64::from(ms), Ordering::Relaxed);
    }

    fn current_waiter(&self) -> WaiterId {
        CURRENT_WAITER.with(|id| *id)
    }

    fn block_current(&self) {
        let me = self.current_waiter();
        self.blocks.fetch_add(1, Ordering::Relaxed);
        let mut permits = self.permits.lock().unwrap();
        while !permits.remove(&me) {
            permits = self.woken.wait(permits).unwrap();
        }
    }

    fn wake(&self, waiter: WaiterId) {
        self.permits.lock().unwrap().insert(waiter);
        self.woken.notify_all();
    }
}

#[derive(Debug)]
struct MemState {
    capacity: usize,
    used: usize,
    next: usize,
    free: BTreeMap<usize, Vec<PhysAddr>>,
    allocated: BTreeMap<PhysAddr, usize>,
    offline: BTreeSet<PhysAddr>,
    movable: BTreeSet<PhysAddr>,
    managed: BTreeMap<ZoneId, isize>,
    zone_boundary: usize,
    allocs_left: Option<usize>,
    alloc_calls: usize,
    events: VmEvents,
}

/// A memory manager with `capacity` native pages above 1MiB. Addresses
/// below the zone boundary are zone 0, the rest zone 1.
#[derive(Debug)]
pub struct TestMemory {
    page_shift: usize,
    state: SpinLock<MemState>,
    poisoning: AtomicBool,
    init_on_free: AtomicBool,
}

impl TestMemory {
    pub fn new(capacity: usize) -> Self {
        Self::with_page_shift(capacity, 12)
    }

    pub fn with_page_shift(capacity: usize, page_shift: usize) -> Self {
        Self {
            page_shift,
            state: SpinLock::new(MemState {
                capacity,
                used: 0,
                next: TEST_MEMORY_BASE,
                free: BTreeMap::new(),
                allocated: BTreeMap::new(),
                offline: BTreeSet::new(),
                movable: BTreeSet::new(),
                managed: BTreeMap::new(),
                zone_boundary: usize::MAX,
                allocs_left: None,
                alloc_calls: 0,
                events: VmEvents::default(),
            }),
            poisoning: AtomicBool::new(false),
            init_on_free: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Native pages currently allocated.
    pub fn used_pages(&self) -> usize {
        self.state.lock().used
    }

    pub fn alloc_calls(&self) -> usize {
        self.state.lock().alloc_calls
    }

    /// Lets `n` more allocations succeed, failing all after that.
    pub fn fail_allocs_after(&self, n: usize) {
        self.state.lock().allocs_left = Some(n);
    }

    pub fn set_zone_boundary(&self, boundary: usize) {
        self.state.lock().zone_boundary = boundary;
    }

    /// Address the next fresh allocation starts at.
    pub fn next_addr(&self) -> usize {
        self.state.lock().next
    }

    /// Sum of managed page adjustments for `zone`.
    pub fn managed_delta(&self, zone: ZoneId) -> isize {
        self.state
            .lock()
            .managed
            .get(&zone)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_offline(&self, addr: PhysAddr) -> bool {
        self.state.lock().offline.contains(&addr)
    }

    pub fn is_movable(&self, addr: PhysAddr) -> bool {
        self.state.lock().movable.contains(&addr)
    }

    pub fn set_vm_events(&self, events: VmEvents) {
        self.state.lock().events = events;
    }

    pub fn set_page_poisoning(&self, enabled: bool) {
        self.poisoning.store(enabled, Ordering::Relaxed);
    }

    pub fn set_init_on_free(&self, enabled: bool) {
        self.init_on_free.store(enabled, Ordering::Relaxed);
    }
}

impl MemoryManager for TestMemory {
    fn page_shift(&self) -> usize {
        self.page_shift
    }

    fn alloc_pages(&self, order: usize, _flags: AllocFlags) -> Option<PhysAddr> {
        let mut state = self.state.lock();
        state.alloc_calls += 1;
        if let Some(left) = state.allocs_left {
            if left == 0 {
                return None;
            }
            state.allocs_left = Some(left - 1);
        }

        let pages = 1usize << order;
        if state.used + pages > state.capacity {
            return None;
        }

        let reused = state.free.get_mut(&order).and_then(|list| list.pop());
        let addr = match reused {
            Some(addr) => addr,
            None => {
                let size = pages << self.page_shift;
                let start = state.next.next_multiple_of(size);
                state.next = start + size;
                PhysAddr::new(start)
            }
        };
        state.used += pages;
        state.allocated.insert(addr, order);
        Some(addr)
    }

    fn free_pages(&self, addr: PhysAddr, order: usize) {
        let mut state = self.state.lock();
        assert_eq!(
            state.allocated.remove(&addr),
            Some(order),
            "bad free of {addr:#x}"
        );
        assert!(!state.offline.contains(&addr), "freeing offline page {addr:#x}");
        state.used -= 1 << order;
        state.free.entry(order).or_default().push(addr);
    }

    fn adjust_managed_page_count(&self, addr: PhysAddr, delta: isize) {
        let zone = self.page_zone(addr);
        *self.state.lock().managed.entry(zone).or_default() += delta;
    }

    fn set_page_offline(&self, addr: PhysAddr, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(addr);
        } else {
            state.offline.remove(&addr);
        }
    }

    fn set_page_movable(&self, addr: PhysAddr, movable: bool) {
        let mut state = self.state.lock();
        if movable {
            state.movable.insert(addr);
        } else {
            state.movable.remove(&addr);
        }
    }

    fn page_zone(&self, addr: PhysAddr) -> ZoneId {
        if addr.bits() < self.state.lock().zone_boundary {
            ZoneId(0)
        } else {
            ZoneId(1)
        }
    }

    fn vm_events(&self) -> VmEvents {
        self.state.lock().events
    }

    fn meminfo(&self) -> MemInfo {
        let state = self.state.lock();
        let free = (state.capacity - state.used) as u64;
        MemInfo {
            free,
            total: state.capacity as u64,
            available: free,
            caches: 0,
        }
    }

    fn want_init_on_free(&self) -> bool {
        self.init_on_free.load(Ordering::Relaxed)
    }

    fn page_poisoning_enabled(&self) -> bool {
        self.poisoning.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct TestConfigSpace {
    config: SpinLock<BalloonConfig>,
}

impl TestConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host side: publish a new target.
    pub fn set_num_pages(&self, num_pages: u32) {
        self.config.lock().num_pages.set(num_pages);
    }

    /// Host side: publish a new hinting command id.
    pub fn set_cmd_id(&self, cmd_id: u32) {
        self.config.lock().free_page_hint_cmd_id.set(cmd_id);
    }

    pub fn actual(&self) -> u32 {
        self.config.lock().actual.get()
    }

    pub fn config(&self) -> BalloonConfig {
        *self.config.lock()
    }

    pub fn bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(self.config.lock().as_bytes());
        bytes
    }
}

impl ConfigSpace for TestConfigSpace {
    fn read(&self, offset: usize, data: &mut [u8]) {
        let config = self.config.lock();
        data.copy_from_slice(&config.as_bytes()[offset..offset + data.len()]);
    }

    fn write(&self, offset: usize, data: &[u8]) {
        let mut config = self.config.lock();
        config.as_mut_bytes()[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// A buffer posted by the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Posted {
    Out(Vec<u8>),
    In(Vec<BufferDesc>),
}

#[derive(Debug, Default)]
struct ChannelState {
    size: usize,
    /// Descriptor counts of chains the host has not returned yet
    inflight: VecDeque<usize>,
    /// Descriptor counts of returned chains not reaped yet
    used: VecDeque<usize>,
    posted: Vec<Posted>,
    auto_complete: bool,
    fail_posts: bool,
    deleted: bool,
    kicks: usize,
}

impl ChannelState {
    fn num_free(&self) -> usize {
        self.size - self.inflight.iter().sum::<usize>() - self.used.iter().sum::<usize>()
    }
}

type PostHook = Box<dyn FnMut(&Posted) + Send>;

/// A host channel recording everything posted to it. With auto-completion
/// the host returns all buffers as soon as it is kicked.
pub struct TestChannel {
    id: QueueId,
    state: SpinLock<ChannelState>,
    on_post: SpinLock<Option<PostHook>>,
}

impl fmt::Debug for TestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestChannel")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TestChannel {
    pub fn new(id: QueueId, size: usize, auto_complete: bool) -> Self {
        Self {
            id,
            state: SpinLock::new(ChannelState {
                size,
                auto_complete,
                ..Default::default()
            }),
            on_post: SpinLock::new(None),
        }
    }

    fn post(&self, posted: Posted, descs: usize) -> Result<(), ChannelError> {
        {
            let mut state = self.state.lock();
            if state.deleted {
                return Err(ChannelError::NotPresent);
            }
            if state.fail_posts {
                return Err(ChannelError::Broken);
            }
            if descs > state.num_free() {
                return Err(ChannelError::NoSpace);
            }
            state.inflight.push_back(descs);
            state.posted.push(posted.clone());
        }
        if let Some(hook) = self.on_post.lock().as_mut() {
            hook(&posted);
        }
        Ok(())
    }

    /// Runs `hook` after every successful post.
    pub fn set_on_post<F: FnMut(&Posted) + Send + 'static>(&self, hook: F) {
        *self.on_post.lock() = Some(Box::new(hook));
    }

    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().auto_complete = auto_complete;
    }

    pub fn set_fail_posts(&self, fail: bool) {
        self.state.lock().fail_posts = fail;
    }

    /// Host side: return every outstanding buffer.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        let done: Vec<usize> = state.inflight.drain(..).collect();
        state.used.extend(done);
    }

    /// Chains posted and not reaped yet.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.inflight.len() + state.used.len()
    }

    pub fn kicks(&self) -> usize {
        self.state.lock().kicks
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    fn delete(&self) {
        self.state.lock().deleted = true;
    }

    pub fn posted(&self) -> Vec<Posted> {
        self.state.lock().posted.clone()
    }

    /// Outbound messages decoded as little endian frame number arrays.
    pub fn pfn_messages(&self) -> Vec<Vec<u32>> {
        self.posted()
            .into_iter()
            .filter_map(|posted| match posted {
                Posted::Out(data) => Some(
                    data.chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
                Posted::In(_) => None,
            })
            .collect()
    }
}

impl HostChannel for TestChannel {
    fn size(&self) -> usize {
        self.state.lock().size
    }

    fn num_free(&self) -> usize {
        self.state.lock().num_free()
    }

    fn add_outbuf(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.post(Posted::Out(data.to_vec()), 1)
    }

    fn add_inbufs(&self, bufs: &[BufferDesc]) -> Result<(), ChannelError> {
        self.post(Posted::In(bufs.to_vec()), bufs.len())
    }

    fn kick(&self) {
        let mut state = self.state.lock();
        state.kicks += 1;
        if state.auto_complete {
            let done: Vec<usize> = state.inflight.drain(..).collect();
            state.used.extend(done);
        }
    }

    fn get_buf(&self) -> Option<usize> {
        self.state.lock().used.pop_front().map(|_| 0)
    }
}

/// A transport whose queues are [`TestChannel`]s. The stats queue does not
/// auto-complete, like a host that holds the buffer until it wants an update.
#[derive(Debug)]
pub struct TestTransport {
    device_features: u64,
    driver_features: AtomicU64,
    config: Option<Arc<TestConfigSpace>>,
    queue_sizes: [usize; NR_QUEUES],
    auto_complete: [bool; NR_QUEUES],
    channels: SpinLock<[Option<Arc<TestChannel>>; NR_QUEUES]>,
    ready: AtomicBool,
    resets: AtomicUsize,
}

impl TestTransport {
    pub fn new(features: BalloonFeatures) -> Self {
        Self {
            device_features: features.bits(),
            driver_features: AtomicU64::new(0),
            config: Some(Arc::new(TestConfigSpace::new())),
            queue_sizes: [128; NR_QUEUES],
            auto_complete: [true, true, false, true, true],
            channels: SpinLock::new(Default::default()),
            ready: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn without_config(features: BalloonFeatures) -> Self {
        Self {
            config: None,
            ..Self::new(features)
        }
    }

    pub fn with_queue_size(mut self, id: QueueId, size: usize) -> Self {
        self.queue_sizes[id.index()] = size;
        self
    }

    pub fn with_auto_complete(mut self, id: QueueId, auto_complete: bool) -> Self {
        self.auto_complete[id.index()] = auto_complete;
        self
    }

    pub fn config(&self) -> &Arc<TestConfigSpace> {
        self.config
            .as_ref()
            .expect("transport has no config space")
    }

    /// The most recently created channel for `id`.
    pub fn channel(&self, id: QueueId) -> Arc<TestChannel> {
        self.channels.lock()[id.index()]
            .clone()
            .expect("queue was never set up")
    }

    pub fn has_channel(&self, id: QueueId) -> bool {
        self.channels.lock()[id.index()].is_some()
    }

    pub fn driver_features(&self) -> BalloonFeatures {
        BalloonFeatures::from_bits_truncate(self.driver_features.load(Ordering::Relaxed))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }
}

impl BalloonTransport for TestTransport {
    fn device_features(&self) -> u64 {
        self.device_features
    }

    fn set_driver_features(&self, features: u64) {
        self.driver_features.store(features, Ordering::Relaxed);
    }

    fn config_space(&self) -> Option<Arc<dyn ConfigSpace>> {
        self.config
            .clone()
            .map(|config| config as Arc<dyn ConfigSpace>)
    }

    fn find_queue(&self, id: QueueId) -> Result<Arc<dyn HostChannel>, ChannelError> {
        let size = self.queue_sizes[id.index()];
        if size == 0 {
            return Err(ChannelError::NotPresent);
        }
        let channel = Arc::new(TestChannel::new(id, size, self.auto_complete[id.index()]));
        self.channels.lock()[id.index()] = Some(channel.clone());
        Ok(channel)
    }

    fn del_queues(&self) {
        for channel in self.channels.lock().iter().flatten() {
            channel.delete();
        }
    }

    fn device_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
        self.ready.store(false, Ordering::Relaxed);
    }
}

/// A balloon attached to test doubles.
#[derive(Debug)]
pub struct TestBalloon {
    pub dev: Arc<BalloonDevice>,
    pub transport: Arc<TestTransport>,
    pub mem: Arc<TestMemory>,
    pub platform: Arc<TestPlatform>,
}

impl TestBalloon {
    pub fn setup(
        transport: TestTransport,
        mem: TestMemory,
        options: BalloonOptions,
    ) -> Result<Self, BalloonError> {
        let transport = Arc::new(transport);
        let mem = Arc::new(mem);
        let platform = Arc::new(TestPlatform::new());
        let dev = BalloonDevice::attach(transport.clone(), mem.clone(), platform.clone(), options)?;
        Ok(Self {
            dev,
            transport,
            mem,
            platform,
        })
    }

    pub fn try_new(transport: TestTransport) -> Result<Self, BalloonError> {
        Self::setup(
            transport,
            TestMemory::new(TEST_MEMORY_PAGES),
            BalloonOptions::default(),
        )
    }

    pub fn new(features: BalloonFeatures) -> Self {
        Self::try_new(TestTransport::new(features)).expect("balloon attach failed")
    }

    /// Host side: request a balloon of `num_pages` frames.
    pub fn set_target(&self, num_pages: u32) {
        self.transport.config().set_num_pages(num_pages);
        self.dev.config_changed();
    }

    /// Runs work items until none is pending, returning how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.dev.run_work().is_some() {
            ran += 1;
            assert!(ran < MAX_WORK_ITEMS, "balloon work does not settle");
        }
        ran
    }

    /// Like [`TestBalloon::run_until_idle`], counting only `work`.
    pub fn run_counting(&self, work: BalloonWork) -> usize {
        let mut ran = 0;
        let mut count = 0;
        while let Some(w) = self.dev.run_work() {
            ran += 1;
            assert!(ran < MAX_WORK_ITEMS, "balloon work does not settle");
            if w == work {
                count += 1;
            }
        }
        count
    }

    /// Runs at most `n` work items.
    pub fn run_at_most(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.dev.run_work().is_some()).count()
    }
}
