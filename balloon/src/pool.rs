// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Pool of pages currently owned by the balloon.
//!
//! Enqueued pages sit on an intrusive list protected by the pool lock. Memory
//! compaction can isolate single pages from the list, after which it either
//! puts them back or migrates their balloon ownership to another page.

use crate::address::PhysAddr;
use crate::locking::SpinLock;
use crate::mm::MemoryManager;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Owned by the allocator or by a caller, not by the balloon
    Free = 0,
    /// On the balloon list
    Enqueued = 1,
    /// Taken off the list by compaction
    Isolated = 2,
}

impl PageState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Enqueued,
            2 => Self::Isolated,
            _ => Self::Free,
        }
    }
}

/// A native page handed to the host.
#[derive(Debug)]
pub struct BalloonPage {
    addr: PhysAddr,
    state: AtomicU8,
    /// Id of the pool the page belongs to, 0 if none
    owner: AtomicU64,
    link: LinkedListAtomicLink,
}

// SAFETY: All members of BalloonPage are Send + Sync except for the
// intrusive_collection link, which is only Send. The link is only touched by
// intrusive_adapter! generated code while holding the pool lock.
unsafe impl Sync for BalloonPage {}

pub type BalloonPageRef = Arc<BalloonPage>;

intrusive_adapter!(pub BalloonPageAdapter = BalloonPageRef: BalloonPage { link: LinkedListAtomicLink });

impl BalloonPage {
    pub fn new(addr: PhysAddr) -> BalloonPageRef {
        Arc::new(Self {
            addr,
            state: AtomicU8::new(PageState::Free as u8),
            owner: AtomicU64::new(0),
            link: LinkedListAtomicLink::new(),
        })
    }

    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

/// Balloon related vm event counters.
#[derive(Debug, Default)]
pub struct BalloonEvents {
    inflate: AtomicU64,
    deflate: AtomicU64,
    migrate: AtomicU64,
}

impl BalloonEvents {
    pub fn inflated(&self) -> u64 {
        self.inflate.load(Ordering::Relaxed)
    }

    pub fn deflated(&self) -> u64 {
        self.deflate.load(Ordering::Relaxed)
    }

    pub fn migrated(&self) -> u64 {
        self.migrate.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct PoolInner {
    pages: LinkedList<BalloonPageAdapter>,
    nr_pages: usize,
    isolated_pages: usize,
}

/// The balloon page pool.
#[derive(Debug)]
pub struct BalloonDevInfo {
    id: u64,
    mm: Arc<dyn MemoryManager>,
    inner: SpinLock<PoolInner>,
    events: BalloonEvents,
}

impl BalloonDevInfo {
    pub fn new(mm: Arc<dyn MemoryManager>) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            mm,
            inner: SpinLock::new(PoolInner {
                pages: LinkedList::new(BalloonPageAdapter::new()),
                nr_pages: 0,
                isolated_pages: 0,
            }),
            events: BalloonEvents::default(),
        }
    }

    // Caller holds the pool lock.
    fn insert(&self, inner: &mut PoolInner, page: BalloonPageRef) {
        assert_eq!(page.state(), PageState::Free, "balloon page already owned");
        self.mm.set_page_offline(page.addr(), true);
        self.mm.set_page_movable(page.addr(), true);
        page.owner.store(self.id, Ordering::Release);
        page.set_state(PageState::Enqueued);
        inner.pages.push_front(page);
        inner.nr_pages += 1;
    }

    // Page must already be off the list.
    fn delete(&self, page: &BalloonPage) {
        self.mm.set_page_movable(page.addr(), false);
        self.mm.set_page_offline(page.addr(), false);
        page.owner.store(0, Ordering::Release);
        page.set_state(PageState::Free);
    }

    /// Inserts a page into the balloon.
    pub fn enqueue(&self, page: BalloonPageRef) {
        let mut inner = self.inner.lock();
        self.insert(&mut inner, page);
        self.events.inflate.fetch_add(1, Ordering::Relaxed);
    }

    /// Inserts all pages of `pages` into the balloon, leaving it empty.
    pub fn list_enqueue(&self, pages: &mut Vec<BalloonPageRef>) -> usize {
        let mut inner = self.inner.lock();
        let n = pages.len();
        for page in pages.drain(..) {
            self.insert(&mut inner, page);
        }
        self.events.inflate.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Takes up to `n_req_pages` pages out of the balloon. Isolated pages are
    /// not on the list and therefore never returned.
    pub fn list_dequeue(&self, pages: &mut Vec<BalloonPageRef>, n_req_pages: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut n = 0;
        while n < n_req_pages {
            let Some(page) = inner.pages.pop_front() else {
                break;
            };
            inner.nr_pages -= 1;
            self.delete(&page);
            pages.push(page);
            n += 1;
        }
        self.events.deflate.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Takes the most recently enqueued page out of the balloon.
    ///
    /// Returns `None` when every remaining page is isolated. Callers only
    /// dequeue while they account for pages in the balloon, so an empty pool
    /// without isolated pages means the bookkeeping is broken beyond repair.
    pub fn dequeue(&self) -> Option<BalloonPageRef> {
        let mut inner = self.inner.lock();
        match inner.pages.pop_front() {
            Some(page) => {
                inner.nr_pages -= 1;
                self.delete(&page);
                self.events.deflate.fetch_add(1, Ordering::Relaxed);
                Some(page)
            }
            None => {
                if inner.isolated_pages == 0 {
                    panic!("balloon: pages lost, pool empty with nothing isolated");
                }
                None
            }
        }
    }

    /// Takes a page off the list for migration. Fails if the page is not
    /// enqueued in this pool.
    pub fn isolate(&self, page: &BalloonPageRef) -> bool {
        let mut inner = self.inner.lock();
        if page.owner() != self.id || page.state() != PageState::Enqueued {
            return false;
        }
        // SAFETY: the page is owned by this pool and enqueued, so it is
        // linked into `inner.pages`, which we hold the lock for.
        let mut cursor = unsafe { inner.pages.cursor_mut_from_ptr(Arc::as_ptr(page)) };
        cursor.remove();
        inner.nr_pages -= 1;
        inner.isolated_pages += 1;
        page.set_state(PageState::Isolated);
        true
    }

    /// Returns an isolated page to the list after a failed migration.
    pub fn putback(&self, page: &BalloonPageRef) -> bool {
        let mut inner = self.inner.lock();
        if page.owner() != self.id || page.state() != PageState::Isolated {
            return false;
        }
        page.set_state(PageState::Enqueued);
        inner.pages.push_front(page.clone());
        inner.nr_pages += 1;
        inner.isolated_pages -= 1;
        true
    }

    /// Inserts the replacement for an isolated page, consuming one isolated
    /// slot.
    pub fn insert_migrated(&self, page: BalloonPageRef) {
        let mut inner = self.inner.lock();
        assert!(inner.isolated_pages > 0, "balloon: migration without isolation");
        self.insert(&mut inner, page);
        inner.isolated_pages -= 1;
        self.events.migrate.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops balloon ownership of a page whose isolated slot was consumed by
    /// [`BalloonDevInfo::insert_migrated`].
    pub fn delete_isolated(&self, page: &BalloonPageRef) {
        let _inner = self.inner.lock();
        self.delete(page);
    }

    pub fn is_isolated_here(&self, page: &BalloonPageRef) -> bool {
        page.owner() == self.id && page.state() == PageState::Isolated
    }

    /// Looks up the enqueued page at `addr`.
    pub fn find_page(&self, addr: PhysAddr) -> Option<BalloonPageRef> {
        let inner = self.inner.lock();
        let mut cursor = inner.pages.front();
        while let Some(page) = cursor.get() {
            if page.addr() == addr {
                return cursor.clone_pointer();
            }
            cursor.move_next();
        }
        None
    }

    /// Number of enqueued pages.
    pub fn len(&self) -> usize {
        self.inner.lock().nr_pages
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn isolated(&self) -> usize {
        self.inner.lock().isolated_pages
    }

    pub fn events(&self) -> &BalloonEvents {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::AllocFlags;
    use crate::testutils::TestMemory;

    fn setup(n: usize) -> (Arc<TestMemory>, BalloonDevInfo, Vec<BalloonPageRef>) {
        let mem = Arc::new(TestMemory::new(64));
        let pool = BalloonDevInfo::new(mem.clone());
        let pages = (0..n)
            .map(|_| BalloonPage::new(mem.alloc_pages(0, AllocFlags::balloon_page()).unwrap()))
            .collect();
        (mem, pool, pages)
    }

    #[test]
    fn enqueue_dequeue_lifo() {
        let (mem, pool, pages) = setup(3);
        for page in pages.iter() {
            pool.enqueue(page.clone());
            assert!(mem.is_offline(page.addr()));
            assert!(mem.is_movable(page.addr()));
        }
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.events().inflated(), 3);

        let page = pool.dequeue().unwrap();
        assert_eq!(page.addr(), pages[2].addr());
        assert_eq!(page.state(), PageState::Free);
        assert!(!mem.is_offline(page.addr()));
        assert!(!mem.is_movable(page.addr()));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.events().deflated(), 1);
    }

    #[test]
    fn isolate_and_putback() {
        let (_mem, pool, pages) = setup(2);
        let mut list = pages.clone();
        assert_eq!(pool.list_enqueue(&mut list), 2);
        assert!(list.is_empty());

        assert!(pool.isolate(&pages[0]));
        assert!(!pool.isolate(&pages[0]));
        assert_eq!(pages[0].state(), PageState::Isolated);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.isolated(), 1);

        // Isolated pages are never dequeued
        let mut out = Vec::new();
        assert_eq!(pool.list_dequeue(&mut out, 2), 1);
        assert_eq!(out[0].addr(), pages[1].addr());
        assert!(pool.dequeue().is_none());

        assert!(pool.putback(&pages[0]));
        assert!(!pool.putback(&pages[0]));
        assert_eq!(pool.isolated(), 0);
        assert_eq!(pool.dequeue().unwrap().addr(), pages[0].addr());
    }

    #[test]
    fn isolate_foreign_page() {
        let (mem, pool, pages) = setup(1);
        let other = BalloonDevInfo::new(mem.clone());
        other.enqueue(pages[0].clone());
        assert!(!pool.isolate(&pages[0]));
        assert!(other.isolate(&pages[0]));
    }

    #[test]
    fn migrate_keeps_count() {
        let (mem, pool, pages) = setup(2);
        pool.enqueue(pages[0].clone());
        assert!(pool.isolate(&pages[0]));

        pool.insert_migrated(pages[1].clone());
        pool.delete_isolated(&pages[0]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.isolated(), 0);
        assert_eq!(pool.events().migrated(), 1);
        assert_eq!(pages[0].state(), PageState::Free);
        assert!(!mem.is_offline(pages[0].addr()));
        assert_eq!(pool.find_page(pages[1].addr()).unwrap().addr(), pages[1].addr());
        assert!(pool.find_page(pages[0].addr()).is_none());
    }

    #[test]
    #[should_panic(expected = "pages lost")]
    fn dequeue_from_corrupted_pool() {
        let (_mem, pool, _pages) = setup(0);
        let _ = pool.dequeue();
    }
}
