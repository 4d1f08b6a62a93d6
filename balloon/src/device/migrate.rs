// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Hooks that let memory compaction move ballooned pages.

use super::BalloonDevice;
use crate::address::PhysAddr;
use crate::error::MigrateError;
use crate::pool::{BalloonPage, BalloonPageRef};
use crate::transport::QueueId;
use crate::workqueue::BalloonWork;
use core::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateMode {
    Async,
    SyncLight,
    Sync,
    /// Synchronous without copying the contents, not supported for balloon
    /// pages
    SyncNoCopy,
}

/// Movable page operations for pages owned by a driver.
pub trait MovablePageOps {
    /// Takes `page` off the driver's lists. Returns false if the page cannot
    /// be isolated.
    fn isolate_page(&self, page: &BalloonPageRef) -> bool;

    /// Returns an isolated page after a failed migration.
    fn putback_page(&self, page: &BalloonPageRef) -> bool;

    /// Moves the driver's ownership from the isolated page `old` to `new`.
    /// On success `old` may be freed by the caller.
    fn migrate_page(
        &self,
        new: PhysAddr,
        old: &BalloonPageRef,
        mode: MigrateMode,
    ) -> Result<(), MigrateError>;
}

impl MovablePageOps for BalloonDevice {
    fn isolate_page(&self, page: &BalloonPageRef) -> bool {
        self.dev_info.isolate(page)
    }

    fn putback_page(&self, page: &BalloonPageRef) -> bool {
        self.dev_info.putback(page)
    }

    fn migrate_page(
        &self,
        new: PhysAddr,
        old: &BalloonPageRef,
        mode: MigrateMode,
    ) -> Result<(), MigrateError> {
        // Only the balloon frame numbers move, there is nothing to copy
        if mode == MigrateMode::SyncNoCopy {
            return Err(MigrateError::Invalid);
        }
        if !self.dev_info.is_isolated_here(old) {
            return Err(MigrateError::NotIsolated);
        }

        // Never block compaction behind host traffic
        let Some(mut batch) = self.balloon_lock.try_lock() else {
            return Err(MigrateError::Again);
        };

        let fix_zones =
            !self.deflate_on_oom() && self.mm.page_zone(old.addr()) != self.mm.page_zone(new);
        if fix_zones {
            self.mm.adjust_managed_page_count(old.addr(), 1);
            self.mm.adjust_managed_page_count(new, -1);
        }

        batch.pfns.clear();
        self.set_page_pfns(&mut batch.pfns, new);
        if let Err(e) = self.tell_host(QueueId::Inflate, &batch.pfns) {
            if fix_zones {
                self.mm.adjust_managed_page_count(old.addr(), -1);
                self.mm.adjust_managed_page_count(new, 1);
            }
            return Err(e.into());
        }
        self.dev_info.insert_migrated(BalloonPage::new(new));

        self.dev_info.delete_isolated(old);
        batch.pfns.clear();
        self.set_page_pfns(&mut batch.pfns, old.addr());
        if let Err(e) = self.tell_host(QueueId::Deflate, &batch.pfns) {
            log::error!(
                "balloon: host kept migrated page {:#x}: {e}",
                old.addr()
            );
            // The host holds both pages now, so the balloon does too
            self.dev_info.enqueue(old.clone());
            self.num_pages
                .fetch_add(self.pages_per_page as u32, Ordering::AcqRel);
            if !self.deflate_on_oom() {
                self.mm.adjust_managed_page_count(old.addr(), -1);
            }
            drop(batch);
            self.update_balloon_size();
            self.queue_work_unless_stopped(BalloonWork::UpdateSize);
            return Err(MigrateError::HostOutOfSync);
        }

        Ok(())
    }
}
