//! Usage accountant: charges quota after successful work.
//!
//! Device binding and quota headroom are re-verified inside the same
//! transaction that increments the counter. A gateway that received an
//! ALLOW may still lose the quota to a concurrent charger; that surfaces
//! as [`ChargeError::QuotaExceeded`] and nothing is charged.

use crate::clock::Clock;
use crate::db::{Database, MAX_COUNTER};
use crate::fingerprint::key_fingerprint;
use crate::ledger::models::{Module, Remaining};
use crate::ledger::store;
use crate::policy::quota::Quota;
use crate::policy::validity::OutcomeClass;
use crate::KeywardenError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// Why a charge was not applied.
#[derive(Debug, Error)]
pub enum ChargeError {
    /// No such key in this module.
    #[error("Key does not exist")]
    KeyNotFound,

    /// Key is bound to a different device.
    #[error("Key is bound to another device")]
    DeviceMismatch,

    /// The device is already bound to another key in this module.
    #[error("Device is already bound to key {other_key}")]
    DeviceBoundToOtherKey {
        /// Key the device belongs to.
        other_key: String,
    },

    /// The charge would take usage past the quota.
    #[error("Usage quota exceeded: {used} used, {requested} requested, {max} allowed")]
    QuotaExceeded {
        /// Units consumed before this charge.
        used: u64,
        /// Units requested.
        requested: u64,
        /// Quota.
        max: u64,
    },

    /// Charge count is zero or larger than a counter can hold.
    #[error("Charge count must be between 1 and {max}", max = MAX_COUNTER)]
    InvalidCount,

    /// The counter would leave the storable range. Only reachable on
    /// keys without a quota.
    #[error("Usage counter overflow: {used} used, {requested} requested")]
    CounterOverflow {
        /// Units consumed before this charge.
        used: u64,
        /// Units requested.
        requested: u64,
    },

    /// Storage failure. Nothing was charged.
    #[error(transparent)]
    Storage(#[from] KeywardenError),
}

impl ChargeError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ChargeError::KeyNotFound => "KEY_NOT_FOUND",
            ChargeError::DeviceMismatch => "DEVICE_MISMATCH",
            ChargeError::DeviceBoundToOtherKey { .. } => "DEVICE_BOUND_TO_OTHER_KEY",
            ChargeError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ChargeError::InvalidCount => "INVALID_COUNT",
            ChargeError::CounterOverflow { .. } => "COUNTER_OVERFLOW",
            ChargeError::Storage(_) => "STORAGE_FAULT",
        }
    }

    /// True only when the quota was lost to a concurrent charge.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChargeError::QuotaExceeded { .. })
    }

    /// How the gateway should treat this outcome.
    pub fn class(&self) -> OutcomeClass {
        match self {
            ChargeError::InvalidCount | ChargeError::CounterOverflow { .. } => {
                OutcomeClass::BadInput
            }
            ChargeError::Storage(_) => OutcomeClass::Fault,
            _ => OutcomeClass::Denied,
        }
    }
}

impl From<rusqlite::Error> for ChargeError {
    fn from(e: rusqlite::Error) -> Self {
        ChargeError::Storage(KeywardenError::Storage(e))
    }
}

/// Applies usage charges to the key ledger.
pub struct UsageAccountant {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl UsageAccountant {
    /// Create an accountant over the ledger database.
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Charge `count` units against `(key, module)`.
    ///
    /// An unbound key is bound to `device_id` as part of the charge, unless
    /// the device already belongs to another key in the module. A blank
    /// `device_id` skips the binding check. Returns the remaining balance
    /// after the charge.
    pub fn charge(
        &self,
        key: &str,
        device_id: &str,
        module: Module,
        count: u64,
    ) -> Result<Remaining, ChargeError> {
        if count == 0 || count > MAX_COUNTER {
            return Err(ChargeError::InvalidCount);
        }
        let key = key.trim();
        let device_id = device_id.trim();
        let now = self.clock.now_utc();

        let result: Result<Remaining, ChargeError> = self.db.write(|tx| {
            let Some(record) = store::find(tx, key, module)? else {
                return Err(ChargeError::KeyNotFound);
            };

            if !device_id.is_empty() {
                match record.bound_device() {
                    None => {
                        if let Some(other_key) =
                            store::find_other_binding(tx, module, device_id, key)?
                        {
                            return Err(ChargeError::DeviceBoundToOtherKey { other_key });
                        }
                        store::bind_device(tx, key, module, device_id, now)?;
                        info!(
                            key = %key_fingerprint(key),
                            module = %module,
                            "bound key to device at charge"
                        );
                    }
                    Some(bound) if bound == device_id => {}
                    Some(_) => return Err(ChargeError::DeviceMismatch),
                }
            }

            let quota = Quota::of(&record);
            if !quota.allows_usage(count) {
                return Err(ChargeError::QuotaExceeded {
                    used: quota.usage_count,
                    requested: count,
                    max: quota.max_usage.unwrap_or(0),
                });
            }
            if !quota.fits_counter(count) {
                return Err(ChargeError::CounterOverflow {
                    used: quota.usage_count,
                    requested: count,
                });
            }

            store::add_usage(tx, key, module, count, now)?;
            Ok(Quota {
                usage_count: quota.usage_count.saturating_add(count),
                ..quota
            }
            .remaining())
        });

        match &result {
            Ok(remaining) => debug!(
                key = %key_fingerprint(key),
                module = %module,
                count,
                remaining = %remaining,
                "charged usage"
            ),
            Err(ChargeError::Storage(e)) => error!(
                key = %key_fingerprint(key),
                module = %module,
                error = %e,
                "charge failed"
            ),
            Err(e) => debug!(
                key = %key_fingerprint(key),
                module = %module,
                reason = e.code(),
                "charge refused"
            ),
        }
        result
    }
}
