// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

//! Transport abstraction: device feature negotiation, config space access
//! and the message queues shared with the host.

use crate::address::PhysAddr;
use crate::config::ConfigSpace;
use crate::error::ChannelError;
use alloc::sync::Arc;
use core::fmt;

/// The queues of a balloon device, in device order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum QueueId {
    Inflate = 0,
    Deflate = 1,
    Stats = 2,
    FreePage = 3,
    Reporting = 4,
}

pub const NR_QUEUES: usize = 5;

impl QueueId {
    pub const ALL: [QueueId; NR_QUEUES] = [
        QueueId::Inflate,
        QueueId::Deflate,
        QueueId::Stats,
        QueueId::FreePage,
        QueueId::Reporting,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            QueueId::Inflate => "inflate",
            QueueId::Deflate => "deflate",
            QueueId::Stats => "stats",
            QueueId::FreePage => "free_page_vq",
            QueueId::Reporting => "reporting_vq",
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Guest memory region handed to the host as a device-writable buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub addr: PhysAddr,
    pub len: usize,
}

/// One message queue to the host.
///
/// Outbound data is copied by the transport when posted. Every posted buffer
/// occupies one descriptor until the host returned it and the driver reaped
/// it with [`HostChannel::get_buf`].
pub trait HostChannel: fmt::Debug + Send + Sync {
    /// Total number of descriptors.
    fn size(&self) -> usize;

    /// Descriptors currently available for posting.
    fn num_free(&self) -> usize;

    fn add_outbuf(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// Posts device-writable buffers as one chain.
    fn add_inbufs(&self, bufs: &[BufferDesc]) -> Result<(), ChannelError>;

    /// Notifies the host about new buffers.
    fn kick(&self);

    /// Reaps one buffer returned by the host, giving the number of bytes the
    /// host wrote into it.
    fn get_buf(&self) -> Option<usize>;
}

pub trait BalloonTransport: fmt::Debug + Send + Sync {
    fn device_features(&self) -> u64;

    fn set_driver_features(&self, features: u64);

    /// Config space of the device, if the transport can reach it.
    fn config_space(&self) -> Option<Arc<dyn ConfigSpace>>;

    /// Sets up one queue. Queue interrupts are delivered to
    /// `BalloonDevice::handle_queue_interrupt`.
    fn find_queue(&self, id: QueueId) -> Result<Arc<dyn HostChannel>, ChannelError>;

    /// Tears down all queues.
    fn del_queues(&self);

    /// Lets the device start using the queues.
    fn device_ready(&self);

    /// Resets the device, returning all buffers to the driver.
    fn reset(&self);
}
