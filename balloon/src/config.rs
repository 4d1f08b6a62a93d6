// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use alloc::sync::Arc;
use core::fmt;
use core::mem::offset_of;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Layout of the balloon device config space.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BalloonConfig {
    /// Target size requested by the host, in 4KiB frames.
    pub num_pages: U32<LittleEndian>,
    /// Size of the balloon as confirmed by the driver.
    pub actual: U32<LittleEndian>,
    /// Current free page hinting command id.
    pub free_page_hint_cmd_id: U32<LittleEndian>,
    /// Poison pattern of freed guest pages.
    pub poison_val: U32<LittleEndian>,
}

/// Byte-wise access to the device config space.
pub trait ConfigSpace: fmt::Debug + Send + Sync {
    fn read(&self, offset: usize, data: &mut [u8]);
    fn write(&self, offset: usize, data: &[u8]);
}

/// Typed accessors for the [`BalloonConfig`] registers.
#[derive(Debug, Clone)]
pub struct BalloonConfigAccess {
    space: Arc<dyn ConfigSpace>,
}

impl BalloonConfigAccess {
    pub fn new(space: Arc<dyn ConfigSpace>) -> Self {
        Self { space }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut val = U32::<LittleEndian>::ZERO;
        self.space.read(offset, val.as_mut_bytes());
        val.get()
    }

    fn write_u32(&self, offset: usize, val: u32) {
        self.space.write(offset, U32::<LittleEndian>::new(val).as_bytes());
    }

    pub fn num_pages(&self) -> u32 {
        self.read_u32(offset_of!(BalloonConfig, num_pages))
    }

    pub fn actual(&self) -> u32 {
        self.read_u32(offset_of!(BalloonConfig, actual))
    }

    pub fn set_actual(&self, actual: u32) {
        self.write_u32(offset_of!(BalloonConfig, actual), actual);
    }

    pub fn free_page_hint_cmd_id(&self) -> u32 {
        self.read_u32(offset_of!(BalloonConfig, free_page_hint_cmd_id))
    }

    pub fn set_poison_val(&self, val: u32) {
        self.write_u32(offset_of!(BalloonConfig, poison_val), val);
    }
}
