//! Queue-tier selection for remote analysis.
//!
//! Larger change sets go to queues backed by bigger workers. Selection is a
//! pure step function over the estimated changed-line count.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTier {
    Small,
    Medium,
    Large,
}

impl QueueTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for QueueTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive upper bounds (in changed lines) for each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            small: 500,
            medium: 5_000,
            large: u64::MAX,
        }
    }
}

impl TierThresholds {
    pub fn is_ascending(&self) -> bool {
        self.small <= self.medium && self.medium <= self.large
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierSelectionError {
    #[error("no queue tier accepts {count} changed lines (large tier limit is {limit})")]
    Unmatched { count: u64, limit: u64 },
}

/// Pick the tier for `count` changed lines.
///
/// `count < small` is Small, `small <= count < medium` is Medium and
/// `medium <= count < large` is Large. Anything at or beyond `large` matches
/// no tier.
pub fn select_tier(count: u64, thresholds: &TierThresholds) -> Result<QueueTier, TierSelectionError> {
    if count < thresholds.small {
        Ok(QueueTier::Small)
    } else if count < thresholds.medium {
        Ok(QueueTier::Medium)
    } else if count < thresholds.large {
        Ok(QueueTier::Large)
    } else {
        Err(TierSelectionError::Unmatched {
            count,
            limit: thresholds.large,
        })
    }
}
