//! Usage quota arithmetic shared by the checker and the accountant.

use crate::db::MAX_COUNTER;
use crate::ledger::models::{KeyRecord, Remaining};

/// Quota position of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Usage limit (None = unlimited)
    pub max_usage: Option<u64>,

    /// Units consumed so far
    pub usage_count: u64,
}

impl Quota {
    /// Extract the quota from a ledger row.
    pub fn of(record: &KeyRecord) -> Self {
        Self {
            max_usage: record.max_usage,
            usage_count: record.usage_count,
        }
    }

    /// Check if `additional` more units fit under the quota.
    pub fn allows_usage(&self, additional: u64) -> bool {
        match self.max_usage {
            Some(limit) => self
                .usage_count
                .checked_add(additional)
                .is_some_and(|total| total <= limit),
            None => true,
        }
    }

    /// Check if the counter can absorb `additional` more units without
    /// leaving the storable range, quota or not.
    pub fn fits_counter(&self, additional: u64) -> bool {
        self.usage_count
            .checked_add(additional)
            .is_some_and(|total| total <= MAX_COUNTER)
    }

    /// Whether a quota is set and nothing is left.
    pub fn is_exhausted(&self) -> bool {
        !self.allows_usage(1)
    }

    /// Units left.
    pub fn remaining(&self) -> Remaining {
        Remaining::compute(self.max_usage, self.usage_count)
    }

    /// Check if any quota exists.
    pub fn has_cap(&self) -> bool {
        self.max_usage.is_some()
    }
}
