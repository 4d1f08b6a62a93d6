// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 Coconut-SVSM Authors
//
// Author: Coconut-SVSM balloon driver developers

use crate::error::BalloonError;
use crate::features::BalloonFeatures;
use crate::types::{
    BALLOON_ARRAY_PFNS_MAX, BALLOON_OOM_NR_PAGES, FREE_PAGE_HINT_ORDER, INFLATE_RETRY_DELAY_MS,
    MAX_HINT_BLOCK_ORDER,
};

/// Driver side tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BalloonOptions {
    /// Features the driver offers. The device may accept fewer.
    pub features: BalloonFeatures,
    /// Frame numbers per inflate or deflate message.
    pub pfns_max: usize,
    /// Balloon frames released per out-of-memory notification.
    pub oom_nr_pages: usize,
    /// Order of free page hinting blocks.
    pub hint_block_order: usize,
    /// Backoff after an inflate allocation failure.
    pub inflate_retry_delay_ms: u32,
    /// Block order for free page reporting, `None` leaves the choice to the
    /// reporting facility.
    pub reporting_order: Option<usize>,
}

impl Default for BalloonOptions {
    fn default() -> Self {
        Self {
            features: BalloonFeatures::all(),
            pfns_max: BALLOON_ARRAY_PFNS_MAX,
            oom_nr_pages: BALLOON_OOM_NR_PAGES,
            hint_block_order: FREE_PAGE_HINT_ORDER,
            inflate_retry_delay_ms: INFLATE_RETRY_DELAY_MS,
            reporting_order: None,
        }
    }
}

impl BalloonOptions {
    pub fn validate(&self) -> Result<(), BalloonError> {
        if self.pfns_max == 0 || self.pfns_max > BALLOON_ARRAY_PFNS_MAX {
            return Err(BalloonError::InvalidOptions);
        }
        if self.hint_block_order > MAX_HINT_BLOCK_ORDER {
            return Err(BalloonError::InvalidOptions);
        }
        if self
            .reporting_order
            .is_some_and(|order| order > MAX_HINT_BLOCK_ORDER)
        {
            return Err(BalloonError::InvalidOptions);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = BalloonOptions::default();
        assert_eq!(opts.pfns_max, 256);
        assert_eq!(opts.oom_nr_pages, 256);
        assert_eq!(opts.hint_block_order, 10);
        assert_eq!(opts.inflate_retry_delay_ms, 200);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn out_of_range() {
        let opts = BalloonOptions {
            pfns_max: 0,
            ..Default::default()
        };
        assert_eq!(opts.validate(), Err(BalloonError::InvalidOptions));

        let opts = BalloonOptions {
            pfns_max: 257,
            ..Default::default()
        };
        assert_eq!(opts.validate(), Err(BalloonError::InvalidOptions));

        let opts = BalloonOptions {
            hint_block_order: 11,
            ..Default::default()
        };
        assert_eq!(opts.validate(), Err(BalloonError::InvalidOptions));
    }
}
