// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use core::fmt;

// Module-private functions may use the leaf error types, public functions
// return a BalloonError wrapping them. Migration reports MigrateError directly
// to the compaction caller.

/// Errors reported by a host channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// The queue was not set up, or has been torn down.
    NotPresent,
    /// No free descriptor to post the buffer.
    NoSpace,
    /// The transport gave up on the queue.
    Broken,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPresent => write!(f, "queue not present"),
            Self::NoSpace => write!(f, "no free descriptors"),
            Self::Broken => write!(f, "queue broken"),
        }
    }
}

/// Errors of a balloon page migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateError {
    /// The balloon is busy talking to the host, try again later.
    Again,
    /// The requested migration mode is not supported.
    Invalid,
    /// The page is not isolated from this balloon.
    NotIsolated,
    /// The host accepted the new page but not the release of the old one.
    /// Both pages stay in the balloon.
    HostOutOfSync,
    /// Posting to the host failed before anything changed.
    Channel(ChannelError),
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Again => write!(f, "balloon busy"),
            Self::Invalid => write!(f, "unsupported migration mode"),
            Self::NotIsolated => write!(f, "page not isolated from this balloon"),
            Self::HostOutOfSync => write!(f, "host did not release the old page"),
            Self::Channel(e) => write!(f, "channel error: {e}"),
        }
    }
}

impl From<ChannelError> for MigrateError {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalloonError {
    /// The transport does not provide access to the config space
    NoConfigAccess,
    /// Driver options out of range
    InvalidOptions,
    /// Native page size is not expressible in balloon frames
    IncompatiblePageSize,
    /// Errors related to host channels
    Channel(ChannelError),
    /// The feature was not negotiated with the device
    NotSupported,
    /// Request exceeds what the device accepts in one go
    TooLarge,
}

impl fmt::Display for BalloonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConfigAccess => write!(f, "no access to the device config space"),
            Self::InvalidOptions => write!(f, "invalid balloon options"),
            Self::IncompatiblePageSize => write!(f, "unsupported native page size"),
            Self::Channel(e) => write!(f, "channel error: {e}"),
            Self::NotSupported => write!(f, "feature not negotiated"),
            Self::TooLarge => write!(f, "request too large"),
        }
    }
}

impl From<ChannelError> for BalloonError {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}
