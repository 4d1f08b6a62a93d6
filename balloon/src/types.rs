// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

/// The host always talks about 4KiB frames, whatever the guest page size is.
pub const BALLOON_PFN_SHIFT: usize = 12;

/// Maximum number of frame numbers in one inflate or deflate message.
pub const BALLOON_ARRAY_PFNS_MAX: usize = 256;

/// Number of balloon frames to give back per out-of-memory notification.
pub const BALLOON_OOM_NR_PAGES: usize = 256;

pub const MAX_ORDER: usize = 11;
/// Order of the blocks used for free page hinting.
pub const FREE_PAGE_HINT_ORDER: usize = MAX_ORDER - 1;
pub const MAX_HINT_BLOCK_ORDER: usize = MAX_ORDER - 1;

/// Command id telling the driver to stop the current hinting session.
pub const CMD_ID_STOP: u32 = 0;
/// Command id telling the driver to release all hinted pages.
pub const CMD_ID_DONE: u32 = 1;

/// Minimum number of descriptors the reporting queue must provide.
pub const PAGE_REPORTING_CAPACITY: usize = 32;

pub const PAGE_POISON: u8 = 0xaa;
pub const PAGE_POISON_VAL: u32 = u32::from_ne_bytes([PAGE_POISON; 4]);

/// Backoff after a failed balloon page allocation.
pub const INFLATE_RETRY_DELAY_MS: u32 = 200;
