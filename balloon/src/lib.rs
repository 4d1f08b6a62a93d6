// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Guest side of a memory balloon device.
//!
//! The host asks the guest to give up (inflate) or take back (deflate) memory
//! by publishing a target size. [`BalloonDevice`] converges the balloon
//! towards that target by allocating pages from the guest memory manager and
//! handing their frame numbers to the host, keeps ballooned pages movable for
//! memory compaction, reports memory statistics and hints free memory to the
//! host.
//!
//! Everything outside the driver core is reached through small traits: the
//! physical memory manager ([`mm::MemoryManager`]), the device transport
//! ([`transport::BalloonTransport`]) and the scheduler
//! ([`platform::BalloonPlatform`]).

#![no_std]

extern crate alloc;

pub mod address;
pub mod config;
pub mod device;
pub mod error;
pub mod features;
pub mod locking;
pub mod mm;
pub mod options;
pub mod platform;
pub mod pool;
pub mod transport;
pub mod types;
pub mod waiting;
pub mod workqueue;

#[cfg(any(test, fuzzing))]
pub mod testutils;


pub use device::{BalloonDevice, MigrateMode, MovablePageOps};
pub use error::BalloonError;
pub use features::BalloonFeatures;
pub use options::BalloonOptions;
