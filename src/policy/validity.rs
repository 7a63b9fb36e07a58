//! Key validity checking.
//!
//! A request for `(key, device_id, module)` is checked in a fixed order,
//! stopping at the first failure:
//! 1. no other key in the module is bound to the device
//! 2. the key exists
//! 3. the key is active
//! 4. the key has a parseable expiry
//! 5. the expiry has not passed
//! 6. the key is unbound (and gets bound now) or bound to this device
//! 7. the quota is not exhausted
//!
//! Steps 1-7 run inside one database transaction, so a device cannot be
//! bound to two keys by racing first uses.

use crate::clock::Clock;
use crate::db::Database;
use crate::fingerprint::key_fingerprint;
use crate::ledger::expiry::{format_expiry, ExpiryError};
use crate::ledger::models::{KeyRecord, KeyStatus, Module, Remaining};
use crate::ledger::store;
use crate::policy::quota::Quota;
use crate::KeywardenError;
use chrono::{FixedOffset, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// How the gateway should treat an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    /// Request may proceed.
    Allowed,
    /// The caller sent incomplete input.
    BadInput,
    /// Access refused.
    Denied,
    /// Storage failure.
    Fault,
}

impl OutcomeClass {
    /// Conventional HTTP status for this class.
    pub fn http_status(self) -> u16 {
        match self {
            OutcomeClass::Allowed => 200,
            OutcomeClass::BadInput => 400,
            OutcomeClass::Denied => 403,
            OutcomeClass::Fault => 500,
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    /// `key` or `device_id` was blank.
    #[error("Missing required field: {field}")]
    MissingParameter {
        /// Name of the blank field.
        field: &'static str,
    },

    /// The device already holds a different key in this module.
    #[error("This device is already used with another key ({other_key})")]
    DeviceBoundToOtherKey {
        /// The key the device is bound to.
        other_key: String,
    },

    /// No such key in this module.
    #[error("Key does not exist")]
    KeyNotFound,

    /// Key status is not active.
    #[error("Key is locked")]
    KeyLocked,

    /// Key has no expiry date.
    #[error("Key has no expiry date")]
    KeyHasNoExpiry,

    /// Stored expiry could not be parsed.
    #[error("Invalid expiry date format")]
    InvalidExpiryFormat {
        /// The stored value.
        raw: String,
    },

    /// Expiry has passed.
    #[error("Key has expired")]
    KeyExpired,

    /// Key is bound to a different device.
    #[error("Key is bound to another device")]
    DeviceMismatch,

    /// Quota fully consumed.
    #[error("Usage quota exhausted ({usage_count}/{max_usage})")]
    QuotaExhausted {
        /// Units consumed.
        usage_count: u64,
        /// Quota.
        max_usage: u64,
    },
}

impl DenyReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::MissingParameter { .. } => "MISSING_PARAMETER",
            DenyReason::DeviceBoundToOtherKey { .. } => "DEVICE_BOUND_TO_OTHER_KEY",
            DenyReason::KeyNotFound => "KEY_NOT_FOUND",
            DenyReason::KeyLocked => "KEY_LOCKED",
            DenyReason::KeyHasNoExpiry => "KEY_HAS_NO_EXPIRY",
            DenyReason::InvalidExpiryFormat { .. } => "INVALID_EXPIRY_FORMAT",
            DenyReason::KeyExpired => "KEY_EXPIRED",
            DenyReason::DeviceMismatch => "DEVICE_MISMATCH",
            DenyReason::QuotaExhausted { .. } => "QUOTA_EXHAUSTED",
        }
    }

    /// Bad input or access denied.
    pub fn class(&self) -> OutcomeClass {
        match self {
            DenyReason::MissingParameter { .. } => OutcomeClass::BadInput,
            _ => OutcomeClass::Denied,
        }
    }
}

/// A permitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Parsed expiry of the key.
    pub expires: NaiveDateTime,
    /// Units left before this request is charged.
    pub remaining: Remaining,
}

/// A refused request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Why.
    pub reason: DenyReason,
    /// Expiry, reported once it has been established (steps 5-7).
    pub expires: Option<NaiveDateTime>,
    /// Remaining units, reported only for an exhausted quota.
    pub remaining: Option<Remaining>,
}

impl Denial {
    fn new(reason: DenyReason) -> Self {
        Self {
            reason,
            expires: None,
            remaining: None,
        }
    }

    fn with_expiry(reason: DenyReason, expires: NaiveDateTime) -> Self {
        Self {
            reason,
            expires: Some(expires),
            remaining: None,
        }
    }
}

/// Outcome of a validity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed.
    Allow(Grant),
    /// Refuse.
    Deny(Denial),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// The denial reason, if denied.
    pub fn reason(&self) -> Option<&DenyReason> {
        match self {
            Decision::Allow(_) => None,
            Decision::Deny(denial) => Some(&denial.reason),
        }
    }

    /// `"OK"` or the denial's stable code.
    pub fn code(&self) -> &'static str {
        self.reason().map_or("OK", DenyReason::code)
    }

    /// `"OK"` or the denial's human-readable message.
    pub fn message(&self) -> String {
        self.reason()
            .map_or_else(|| "OK".to_string(), ToString::to_string)
    }

    /// Expiry reported to the caller, if any.
    pub fn expires(&self) -> Option<NaiveDateTime> {
        match self {
            Decision::Allow(grant) => Some(grant.expires),
            Decision::Deny(denial) => denial.expires,
        }
    }

    /// Expiry as `YYYY-MM-DD`, if reported.
    pub fn expires_display(&self) -> Option<String> {
        self.expires().as_ref().map(format_expiry)
    }

    /// Remaining units reported to the caller, if any.
    pub fn remaining(&self) -> Option<Remaining> {
        match self {
            Decision::Allow(grant) => Some(grant.remaining),
            Decision::Deny(denial) => denial.remaining,
        }
    }

    /// How the gateway should treat this outcome.
    pub fn class(&self) -> OutcomeClass {
        self.reason().map_or(OutcomeClass::Allowed, DenyReason::class)
    }
}

/// Result of evaluating steps 3-7 against a fetched row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    /// The row is unbound and must be bound to the caller's device.
    ///
    /// Set whenever step 6 was reached on an unbound row, even if step 7
    /// then denies: the bind stands regardless of quota.
    pub bind_device: bool,
    /// The decision.
    pub decision: Decision,
}

/// Evaluate steps 3-7 for an existing row. Pure: performs no writes.
pub fn assess(record: &KeyRecord, device_id: &str, now: NaiveDateTime) -> Assessment {
    let deny = |denial: Denial| Assessment {
        bind_device: false,
        decision: Decision::Deny(denial),
    };

    // 3. status
    if record.status != KeyStatus::Active {
        return deny(Denial::new(DenyReason::KeyLocked));
    }

    // 4. expiry presence and format
    let expires = match record.expiry() {
        Ok(expires) => expires,
        Err(ExpiryError::Missing) => return deny(Denial::new(DenyReason::KeyHasNoExpiry)),
        Err(ExpiryError::InvalidFormat(raw)) => {
            return deny(Denial::new(DenyReason::InvalidExpiryFormat { raw }))
        }
    };

    // 5. expiry
    if expires < now {
        return deny(Denial::with_expiry(DenyReason::KeyExpired, expires));
    }

    // 6. device binding
    let bind_device = match record.bound_device() {
        None => true,
        Some(bound) if bound == device_id => false,
        Some(_) => return deny(Denial::with_expiry(DenyReason::DeviceMismatch, expires)),
    };

    // 7. quota
    let quota = Quota::of(record);
    let decision = match (quota.is_exhausted(), quota.max_usage) {
        (true, Some(max_usage)) => Decision::Deny(Denial {
            reason: DenyReason::QuotaExhausted {
                usage_count: quota.usage_count,
                max_usage,
            },
            expires: Some(expires),
            remaining: Some(Remaining::Units(0)),
        }),
        _ => Decision::Allow(Grant {
            expires,
            remaining: quota.remaining(),
        }),
    };

    Assessment {
        bind_device,
        decision,
    }
}

/// Decides whether a `(key, device_id, module)` request may proceed.
pub struct ValidityChecker {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl ValidityChecker {
    /// Create a checker over the ledger database.
    ///
    /// `offset` is the zone stored expiry dates are written in.
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self { db, clock, offset }
    }

    /// Run the full check, binding the device on first valid use.
    ///
    /// Denials are returned as values; only storage faults are errors.
    pub fn check(
        &self,
        key: &str,
        device_id: &str,
        module: Module,
    ) -> Result<Decision, KeywardenError> {
        let key = key.trim();
        let device_id = device_id.trim();
        if key.is_empty() {
            return Ok(Decision::Deny(Denial::new(DenyReason::MissingParameter {
                field: "key",
            })));
        }
        if device_id.is_empty() {
            return Ok(Decision::Deny(Denial::new(DenyReason::MissingParameter {
                field: "device_id",
            })));
        }

        let now_utc = self.clock.now_utc();
        let now_local = self.clock.now_local(self.offset);

        let decision = self.db.write(|tx| {
            // 1. device exclusivity, before the key's own existence
            if let Some(other_key) = store::find_other_binding(tx, module, device_id, key)? {
                return Ok(Decision::Deny(Denial::new(
                    DenyReason::DeviceBoundToOtherKey { other_key },
                )));
            }

            // 2. existence
            let Some(record) = store::find(tx, key, module)? else {
                return Ok(Decision::Deny(Denial::new(DenyReason::KeyNotFound)));
            };

            let assessment = assess(&record, device_id, now_local);
            if assessment.bind_device {
                store::bind_device(tx, key, module, device_id, now_utc)?;
                info!(
                    key = %key_fingerprint(key),
                    module = %module,
                    "bound key to device"
                );
            }
            Ok::<_, KeywardenError>(assessment.decision)
        })?;

        if let Decision::Deny(denial) = &decision {
            debug!(
                key = %key_fingerprint(key),
                module = %module,
                reason = denial.reason.code(),
                "validity check denied"
            );
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ledger::models::NewKey;
    use crate::ledger::store::KeyLedger;
    use chrono::{NaiveDate, TimeZone, Utc};

    const NOW: &str = "2025-06-15T05:00:00Z"; // 12:00 at UTC+7

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn setup() -> (KeyLedger, ValidityChecker) {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::from_rfc3339(NOW));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ledger = KeyLedger::new(db.clone(), clock.clone());
        let checker = ValidityChecker::new(db, clock, offset());
        (ledger, checker)
    }

    fn local_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn record(expires: Option<&str>, max_usage: Option<u64>, usage_count: u64) -> KeyRecord {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        KeyRecord {
            key: "K".into(),
            module: Module::Voice,
            device_id: None,
            status: KeyStatus::Active,
            expires: expires.map(String::from),
            max_usage,
            usage_count,
            note: String::new(),
            created_at: ts,
            updated_at: ts,
        }
    }

    fn reason(decision: &Decision) -> &DenyReason {
        decision.reason().expect("expected denial")
    }

    #[test]
    fn assess_allows_and_requests_bind() {
        let assessment = assess(&record(Some("2025-06-16"), Some(3), 0), "dev1", local_now());
        assert!(assessment.bind_device);
        assert_eq!(assessment.decision.remaining(), Some(Remaining::Units(3)));
        assert_eq!(assessment.decision.code(), "OK");
        assert_eq!(assessment.decision.message(), "OK");
    }

    #[test]
    fn assess_reports_unlimited() {
        let assessment = assess(&record(Some("2099-01-01"), None, 40), "dev1", local_now());
        assert_eq!(assessment.decision.remaining(), Some(Remaining::Unlimited));
    }

    #[test]
    fn assess_locked_before_expiry() {
        let mut rec = record(None, None, 0);
        rec.status = KeyStatus::Locked;
        let assessment = assess(&rec, "dev1", local_now());
        assert_eq!(reason(&assessment.decision), &DenyReason::KeyLocked);
        assert!(!assessment.bind_device);
    }

    #[test]
    fn assess_expiry_presence_and_format() {
        let a = assess(&record(None, None, 0), "d", local_now());
        assert_eq!(reason(&a.decision), &DenyReason::KeyHasNoExpiry);

        let a = assess(&record(Some("soon"), None, 0), "d", local_now());
        assert_eq!(
            reason(&a.decision),
            &DenyReason::InvalidExpiryFormat { raw: "soon".into() }
        );
        assert_eq!(a.decision.expires(), None);
    }

    #[test]
    fn assess_expired_reports_expiry() {
        let a = assess(&record(Some("2025-06-14"), None, 0), "d", local_now());
        assert_eq!(reason(&a.decision), &DenyReason::KeyExpired);
        assert_eq!(a.decision.expires_display().as_deref(), Some("2025-06-14"));
        assert!(!a.bind_device);
    }

    #[test]
    fn assess_date_only_expiry_ends_at_midnight() {
        // Expiring "today" means midnight this morning, already past at noon.
        let a = assess(&record(Some("2025-06-15"), None, 0), "d", local_now());
        assert_eq!(reason(&a.decision), &DenyReason::KeyExpired);

        let a = assess(&record(Some("2025-06-15 23:59:59"), None, 0), "d", local_now());
        assert!(a.decision.is_allowed());
    }

    #[test]
    fn assess_device_mismatch() {
        let mut rec = record(Some("2025-07-01"), None, 0);
        rec.device_id = Some("dev1".into());
        let a = assess(&rec, "dev2", local_now());
        assert_eq!(reason(&a.decision), &DenyReason::DeviceMismatch);
        assert!(a.decision.expires().is_some());

        let a = assess(&rec, "dev1", local_now());
        assert!(a.decision.is_allowed());
        assert!(!a.bind_device);
    }

    #[test]
    fn assess_quota_boundary() {
        let a = assess(&record(Some("2025-07-01"), Some(5), 5), "d", local_now());
        assert_eq!(
            reason(&a.decision),
            &DenyReason::QuotaExhausted {
                usage_count: 5,
                max_usage: 5
            }
        );
        assert_eq!(a.decision.remaining(), Some(Remaining::Units(0)));
        // The unbound row is still bound even though quota denies.
        assert!(a.bind_device);

        let a = assess(&record(Some("2025-07-01"), Some(5), 4), "d", local_now());
        assert_eq!(a.decision.remaining(), Some(Remaining::Units(1)));
    }

    #[test]
    fn check_rejects_blank_parameters() {
        let (_, checker) = setup();
        let d = checker.check("  ", "dev", Module::Voice).unwrap();
        assert_eq!(reason(&d), &DenyReason::MissingParameter { field: "key" });
        assert_eq!(d.class(), OutcomeClass::BadInput);

        let d = checker.check("K", "", Module::Voice).unwrap();
        assert_eq!(reason(&d), &DenyReason::MissingParameter { field: "device_id" });
    }

    #[test]
    fn check_binds_on_first_use() {
        let (ledger, checker) = setup();
        ledger
            .insert(&NewKey::new("ABC", Module::Voice).expires("2025-06-16").max_usage(3))
            .unwrap();

        let d = checker.check("ABC", "dev1", Module::Voice).unwrap();
        assert!(d.is_allowed());
        assert_eq!(d.remaining(), Some(Remaining::Units(3)));

        let row = ledger.get("ABC", Module::Voice).unwrap().unwrap();
        assert_eq!(row.bound_device(), Some("dev1"));

        let d = checker.check("ABC", "dev2", Module::Voice).unwrap();
        assert_eq!(reason(&d), &DenyReason::DeviceMismatch);
    }

    #[test]
    fn check_device_exclusivity_precedes_existence() {
        let (ledger, checker) = setup();
        ledger
            .insert(&NewKey::new("real1", Module::Voice).expires("2025-12-31"))
            .unwrap();
        assert!(checker.check("real1", "D1", Module::Voice).unwrap().is_allowed());

        let d = checker.check("ghost", "D1", Module::Voice).unwrap();
        assert_eq!(
            reason(&d),
            &DenyReason::DeviceBoundToOtherKey {
                other_key: "real1".into()
            }
        );

        // Same device in another module is a separate namespace.
        let d = checker.check("ghost", "D1", Module::Image).unwrap();
        assert_eq!(reason(&d), &DenyReason::KeyNotFound);
    }

    #[test]
    fn check_locked_key_is_not_bound() {
        let (ledger, checker) = setup();
        ledger
            .insert(
                &NewKey::new("L", Module::Music)
                    .expires("2025-12-31")
                    .status(KeyStatus::Locked),
            )
            .unwrap();
        let d = checker.check("L", "dev", Module::Music).unwrap();
        assert_eq!(reason(&d), &DenyReason::KeyLocked);
        assert_eq!(ledger.get("L", Module::Music).unwrap().unwrap().device_id, None);
    }

    #[test]
    fn deny_reason_codes_are_stable() {
        assert_eq!(DenyReason::KeyNotFound.code(), "KEY_NOT_FOUND");
        assert_eq!(DenyReason::DeviceMismatch.code(), "DEVICE_MISMATCH");
        assert_eq!(OutcomeClass::Denied.http_status(), 403);
        assert_eq!(
            DenyReason::QuotaExhausted {
                usage_count: 5,
                max_usage: 5
            }
            .to_string(),
            "Usage quota exhausted (5/5)"
        );
    }
}
