// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

#![no_main]

use arbitrary::Arbitrary;
use balloon::address::PhysAddr;
use balloon::mm::{AllocFlags, MemoryManager};
use balloon::pool::BalloonPageRef;
use balloon::testutils::{Posted, TestBalloon, TestMemory, TestTransport};
use balloon::transport::QueueId;
use balloon::{BalloonFeatures, BalloonOptions, MigrateMode, MovablePageOps};
use libfuzzer_sys::fuzz_target;

const MEM_PAGES: usize = 1024;
const HINT_ORDER: usize = 2;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    features: u8,
    actions: Vec<Action>,
}

/// Host and guest events during a fuzzing run
#[derive(Debug, Arbitrary)]
enum Action {
    /// Host publishes a new target
    SetTarget(u16),
    /// A worker runs one pending item
    RunWork,
    /// Guest runs out of memory
    Oom,
    /// Compaction isolates the most recently inflated page
    Isolate,
    /// Compaction gives up on an isolated page
    Putback(usize),
    /// Compaction moves an isolated page
    Migrate(usize, bool),
    /// Host starts or ends a hinting session
    SetCmdId(u8),
    /// Guest memory pressure hits the hinting shrinker
    Shrink(u16),
    /// Host returns the stats buffer
    StatsRequest,
    /// Host starts or stops rejecting deflate messages
    FailDeflate(bool),
    /// Suspend and resume the device
    FreezeRestore,
}

#[inline]
fn get_idx<T>(v: &[T], idx: usize) -> Option<usize> {
    idx.checked_rem(v.len())
}

fn last_inflated(tb: &TestBalloon) -> Option<BalloonPageRef> {
    let posted = tb.transport.channel(QueueId::Inflate).posted();
    let Some(Posted::Out(data)) = posted.last() else {
        return None;
    };
    data.chunks_exact(4).rev().find_map(|c| {
        let pfn = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        tb.dev
            .pool()
            .find_page(PhysAddr::new((pfn as usize) << 12))
    })
}

fn check_accounting(tb: &TestBalloon) {
    let pool = tb.dev.pool();
    let ballooned = pool.len() + pool.isolated();
    assert_eq!(tb.dev.num_pages() as usize, ballooned);
    assert_eq!(
        tb.mem.used_pages(),
        ballooned + (tb.dev.free_page_hint_blocks() << HINT_ORDER)
    );
}

fuzz_target!(|inp: FuzzInput| {
    let options = BalloonOptions {
        hint_block_order: HINT_ORDER,
        ..Default::default()
    };
    let Ok(tb) = TestBalloon::setup(
        TestTransport::new(BalloonFeatures::from_bits_truncate(u64::from(inp.features))),
        TestMemory::new(MEM_PAGES),
        options,
    ) else {
        return;
    };

    // Pages taken off the balloon by compaction
    let mut isolated: Vec<BalloonPageRef> = Vec::new();

    for action in inp.actions.into_iter() {
        match action {
            Action::SetTarget(target) => tb.set_target(u32::from(target) % (MEM_PAGES as u32 * 2)),
            Action::RunWork => {
                let _ = tb.dev.run_work();
            }
            Action::Oom => {
                let _ = tb.dev.oom_notify();
            }
            Action::Isolate => {
                if let Some(page) = last_inflated(&tb) {
                    if tb.dev.isolate_page(&page) {
                        isolated.push(page);
                    }
                }
            }
            Action::Putback(idx) => {
                if let Some(idx) = get_idx(&isolated, idx) {
                    let page = isolated.swap_remove(idx);
                    assert!(tb.dev.putback_page(&page));
                }
            }
            Action::Migrate(idx, sync) => {
                let Some(idx) = get_idx(&isolated, idx) else {
                    continue;
                };
                let Some(new) = tb.mem.alloc_pages(0, AllocFlags::balloon_page()) else {
                    continue;
                };
                let old = isolated.swap_remove(idx);
                let mode = if sync {
                    MigrateMode::Sync
                } else {
                    MigrateMode::Async
                };
                match tb.dev.migrate_page(new, &old, mode) {
                    Ok(()) => tb.mem.free_pages(old.addr(), 0),
                    Err(balloon::error::MigrateError::HostOutOfSync) => {}
                    Err(_) => {
                        tb.mem.free_pages(new, 0);
                        assert!(tb.dev.putback_page(&old));
                    }
                }
            }
            Action::SetCmdId(id) => {
                tb.transport.config().set_cmd_id(u32::from(id % 8));
                tb.dev.config_changed();
            }
            Action::Shrink(n) => {
                let _ = tb.dev.shrinker_scan(usize::from(n));
            }
            Action::StatsRequest => {
                if tb.transport.has_channel(QueueId::Stats) {
                    tb.transport.channel(QueueId::Stats).complete_all();
                }
                tb.dev.handle_queue_interrupt(QueueId::Stats);
            }
            Action::FailDeflate(fail) => tb
                .transport
                .channel(QueueId::Deflate)
                .set_fail_posts(fail),
            Action::FreezeRestore => {
                // Suspend waits for compaction to hand pages back
                if !isolated.is_empty() {
                    continue;
                }
                tb.transport
                    .channel(QueueId::Deflate)
                    .set_fail_posts(false);
                tb.dev.freeze();
                assert_eq!(tb.dev.num_pages(), 0);
                tb.dev.restore().unwrap();
            }
        }
        check_accounting(&tb);
    }

    for page in isolated.drain(..) {
        assert!(tb.dev.putback_page(&page));
    }
    tb.transport
        .channel(QueueId::Deflate)
        .set_fail_posts(false);
    tb.dev.detach();
    assert_eq!(tb.dev.num_pages(), 0);
    assert_eq!(tb.mem.used_pages(), 0);
});
