//! Key Manager - the main public API for Keywarden.
//!
//! The `KeyManager` ties the ledger, the validity checker, the usage
//! accountant, the access logger and the row cache together:
//! - Gateway surface: `authorize`, `check_validity`, `charge`, `status`
//! - Administrative surface: key CRUD with activity snapshots, key
//!   queries, log listings, dashboard counts and log cleanup

use crate::audit::entries::{
    ActivityAction, ActivityLogEntry, AdminContext, DecisionLogEntry, FeedItem, NewActivityEntry,
    NewDecisionEntry, RequestContext,
};
use crate::audit::logger::AccessLogger;
use crate::audit::query::{
    ActivityLogFilters, ActivityStats, CleanupCriteria, CleanupReport, DecisionLogFilters,
    DecisionStats, Page,
};
use crate::cache::rows::RowCache;
use crate::clock::{Clock, SystemClock};
use crate::config::KeywardenConfig;
use crate::db::Database;
use crate::fingerprint::key_fingerprint;
use crate::ledger::expiry::{parse_expiry, ExpiryError};
use crate::ledger::models::{KeyPatch, KeyRecord, KeyStatus, Module, NewKey, Remaining};
use crate::ledger::store::KeyLedger;
use crate::meter::accountant::{ChargeError, UsageAccountant};
use crate::policy::validity::{Decision, ValidityChecker};
use crate::KeywardenError;
use chrono::{FixedOffset, NaiveDateTime};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Placeholder logged for a field the caller did not send.
const UNKNOWN: &str = "unknown";

/// One gateway request as seen by [`KeyManager::authorize`].
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    /// Module the handler serves.
    pub module: Module,
    /// Key as sent, if sent.
    pub key: Option<String>,
    /// Device as sent, if sent.
    pub device_id: Option<String>,
    /// Transport details for the decision log.
    pub context: RequestContext,
}

impl GatewayRequest {
    /// A request for `module` with no parameters yet.
    pub fn new(module: Module) -> Self {
        Self {
            module,
            key: None,
            device_id: None,
            context: RequestContext::default(),
        }
    }

    /// Set the key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the device.
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Set the endpoint name.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.context.endpoint = Some(endpoint.into());
        self
    }

    /// Set the caller IP.
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.context.ip = Some(ip.into());
        self
    }

    /// Set the caller user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.context.user_agent = Some(user_agent.into());
        self
    }

    /// Attach request parameters for the decision log.
    pub fn request_data(mut self, data: serde_json::Value) -> Self {
        self.context.request_data = Some(data);
        self
    }
}

/// Client-facing view of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatusView {
    /// License key.
    pub key: String,
    /// Module.
    pub module: Module,
    /// Bound device.
    pub device_id: Option<String>,
    /// Administrative status.
    pub status: KeyStatus,
    /// Expiry as stored.
    pub expires: Option<String>,
    /// Quota.
    pub max_usage: Option<u64>,
    /// Units consumed.
    pub usage_count: u64,
    /// Free text.
    pub note: String,
    /// Units left.
    pub remaining: Remaining,
    /// Whether the expiry has passed.
    pub is_expired: bool,
    /// Whether the key is bound to the asking device.
    pub bound_to_caller: bool,
}

/// Aggregate key counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStatistics {
    /// All keys.
    pub total_keys: u64,
    /// Keys with status active.
    pub active_keys: u64,
    /// Keys whose expiry has passed.
    pub expired_keys: u64,
    /// Sum of usage counts.
    pub total_usage: u64,
    /// Sum of quotas over keys that have one.
    pub total_max_usage: u64,
    /// `total_usage / total_max_usage` as a percentage, 0 without quotas.
    pub usage_percentage: f64,
}

/// Key counts for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleKeyStats {
    /// Module.
    pub module: Module,
    /// All keys.
    pub total: u64,
    /// Active keys.
    pub active: u64,
    /// Expired keys.
    pub expired: u64,
    /// Keys with a fully consumed quota.
    pub used_up: u64,
}

/// Main entry point for Keywarden.
///
/// Create one instance per process and share it across request handlers;
/// every method takes `&self` and is safe to call concurrently.
pub struct KeyManager {
    config: KeywardenConfig,
    offset: FixedOffset,
    clock: Arc<dyn Clock>,
    ledger: KeyLedger,
    checker: ValidityChecker,
    accountant: UsageAccountant,
    logger: AccessLogger,
    cache: RowCache,
}

impl KeyManager {
    /// Create a new key manager with the given configuration.
    ///
    /// Uses the system clock for time operations.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The database cannot be opened or its schema created
    pub fn new(config: KeywardenConfig) -> Result<Self, KeywardenError> {
        config.validate()?;
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a key manager with a custom clock (for testing).
    #[cfg(any(test, feature = "test-seams"))]
    pub fn new_with_clock(
        config: KeywardenConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KeywardenError> {
        config.validate()?;
        Self::with_clock(config, clock)
    }

    fn with_clock(config: KeywardenConfig, clock: Arc<dyn Clock>) -> Result<Self, KeywardenError> {
        let offset = config.utc_offset().ok_or_else(|| {
            KeywardenError::Config(format!(
                "utc_offset_seconds out of range: {}",
                config.utc_offset_seconds
            ))
        })?;
        let db = Arc::new(Database::open(&config)?);

        Ok(Self {
            offset,
            ledger: KeyLedger::new(db.clone(), clock.clone()),
            checker: ValidityChecker::new(db.clone(), clock.clone(), offset),
            accountant: UsageAccountant::new(db.clone(), clock.clone()),
            logger: AccessLogger::new(db, clock.clone()),
            cache: RowCache::with_capacity(config.cache_ttl, config.cache_capacity, clock.clone()),
            clock,
            config,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &KeywardenConfig {
        &self.config
    }

    /// The key ledger.
    pub fn ledger(&self) -> &KeyLedger {
        &self.ledger
    }

    /// The access logger.
    pub fn logger(&self) -> &AccessLogger {
        &self.logger
    }

    fn local_now(&self) -> NaiveDateTime {
        self.clock.now_local(self.offset)
    }

    // ==================== Gateway ====================

    /// Run the validity check for `(key, device_id, module)`.
    ///
    /// Binds the device on first valid use. Nothing is logged to the
    /// decision stream; use [`KeyManager::authorize`] for that.
    pub fn check_validity(
        &self,
        key: &str,
        device_id: &str,
        module: Module,
    ) -> Result<Decision, KeywardenError> {
        let decision = self.checker.check(key, device_id, module);
        self.cache.invalidate(key.trim(), module);
        decision
    }

    /// Check a gateway request and record the decision.
    ///
    /// Exactly one decision entry is written per call, with status 400
    /// for missing parameters, 403 for denials, 200 when allowed and 500
    /// when storage failed.
    pub fn authorize(&self, request: &GatewayRequest) -> Result<Decision, KeywardenError> {
        let key = request.key.as_deref().map(str::trim).unwrap_or_default();
        let device_id = request
            .device_id
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();

        let outcome = self.check_validity(key, device_id, request.module);

        let (status, message) = match &outcome {
            Ok(decision) => (decision.class().http_status(), decision.message()),
            Err(e) => {
                error!(
                    key = %key_fingerprint(key),
                    module = %request.module,
                    error = %e,
                    "validity check failed"
                );
                (500, e.to_string())
            }
        };

        self.logger.record_decision(&NewDecisionEntry {
            key: non_blank_or_unknown(key),
            module: request.module,
            device_id: Some(non_blank_or_unknown(device_id)),
            context: request.context.clone(),
            response_status: status,
            response_message: message,
        });
        outcome
    }

    /// Charge `count` units after successful work.
    pub fn charge(
        &self,
        key: &str,
        device_id: &str,
        module: Module,
        count: u64,
    ) -> Result<Remaining, ChargeError> {
        let result = self.accountant.charge(key, device_id, module, count);
        self.cache.invalidate(key.trim(), module);
        result
    }

    /// Charge a single unit.
    pub fn charge_one(
        &self,
        key: &str,
        device_id: &str,
        module: Module,
    ) -> Result<Remaining, ChargeError> {
        self.charge(key, device_id, module, 1)
    }

    /// Read-only status of a key, `None` if it does not exist.
    ///
    /// Served from the row cache when fresh.
    pub fn status(
        &self,
        key: &str,
        device_id: &str,
        module: Module,
    ) -> Result<Option<KeyStatusView>, KeywardenError> {
        let key = key.trim();
        let record = match self.cache.get(key, module) {
            Some(cached) => cached,
            None => {
                let pending = self.cache.begin_load(key, module);
                let record = self.ledger.get(key, module)?;
                self.cache.put(pending, record.clone());
                record
            }
        };
        let now = self.local_now();
        Ok(record.map(|r| KeyStatusView {
            remaining: r.remaining(),
            is_expired: r.is_expired_at(now),
            bound_to_caller: r.bound_device() == Some(device_id.trim()),
            key: r.key,
            module: r.module,
            device_id: r.device_id,
            status: r.status,
            expires: r.expires,
            max_usage: r.max_usage,
            usage_count: r.usage_count,
            note: r.note,
        }))
    }

    // ==================== Key administration ====================

    /// Create a key and record `CREATE_KEY`.
    ///
    /// # Errors
    /// - `InvalidKey` for a blank key, a zero quota or an unparseable expiry
    /// - `QuotaBelowUsage` when the initial usage exceeds the quota
    /// - `KeyExists` when `(key, module)` is taken
    pub fn add_key(&self, new_key: NewKey, actor: &AdminContext) -> Result<KeyRecord, KeywardenError> {
        let new_key = new_key.normalized()?;
        check_expiry_input(new_key.expires.as_deref())?;

        let record = self
            .ledger
            .insert(&new_key)?
            .ok_or(KeywardenError::KeyExists)?;
        self.cache.invalidate(&record.key, record.module);

        info!(key = %key_fingerprint(&record.key), module = %record.module, "key created");
        self.logger.record_activity(
            &NewActivityEntry::new(ActivityAction::CreateKey, actor.clone())
                .row(record.key.clone(), record.module)
                .new_values(serde_json::to_value(&record)?),
        );
        Ok(record)
    }

    /// Apply an edit and record `UPDATE_KEY` with both snapshots.
    ///
    /// Returns `Ok(None)` when the key does not exist.
    pub fn update_key(
        &self,
        key: &str,
        module: Module,
        patch: &KeyPatch,
        actor: &AdminContext,
    ) -> Result<Option<KeyRecord>, KeywardenError> {
        if patch.is_empty() {
            return Err(KeywardenError::InvalidKey("patch changes nothing".into()));
        }
        if let Some(expires) = &patch.expires {
            check_expiry_input(expires.as_deref())?;
        }

        let key = key.trim();
        let Some((before, after)) = self.ledger.update(key, module, patch)? else {
            return Ok(None);
        };
        self.cache.invalidate(key, module);

        info!(key = %key_fingerprint(key), module = %module, "key updated");
        self.logger.record_activity(
            &NewActivityEntry::new(ActivityAction::UpdateKey, actor.clone())
                .row(key, module)
                .old_values(serde_json::to_value(&before)?)
                .new_values(serde_json::to_value(&after)?),
        );
        Ok(Some(after))
    }

    /// Delete a key and record `DELETE_KEY` with the removed row.
    ///
    /// Returns `Ok(None)` when the key does not exist.
    pub fn delete_key(
        &self,
        key: &str,
        module: Module,
        actor: &AdminContext,
    ) -> Result<Option<KeyRecord>, KeywardenError> {
        let key = key.trim();
        let Some(removed) = self.ledger.delete(key, module)? else {
            return Ok(None);
        };
        self.cache.invalidate(key, module);

        info!(key = %key_fingerprint(key), module = %module, "key deleted");
        self.logger.record_activity(
            &NewActivityEntry::new(ActivityAction::DeleteKey, actor.clone())
                .row(key, module)
                .old_values(serde_json::to_value(&removed)?),
        );
        Ok(Some(removed))
    }

    // ==================== Key queries ====================

    /// All keys, newest first.
    pub fn list_keys(&self, module: Option<Module>) -> Result<Vec<KeyRecord>, KeywardenError> {
        self.ledger.list(module)
    }

    /// Keys with the given status.
    pub fn list_keys_by_status(
        &self,
        status: KeyStatus,
        module: Option<Module>,
    ) -> Result<Vec<KeyRecord>, KeywardenError> {
        Ok(self
            .ledger
            .list(module)?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Keys whose expiry has passed. Unparseable expiries are skipped.
    pub fn expired_keys(&self, module: Option<Module>) -> Result<Vec<KeyRecord>, KeywardenError> {
        let now = self.local_now();
        Ok(self
            .ledger
            .list(module)?
            .into_iter()
            .filter(|r| r.is_expired_at(now))
            .collect())
    }

    /// Keys bound to `device_id`.
    pub fn keys_by_device(
        &self,
        device_id: &str,
        module: Option<Module>,
    ) -> Result<Vec<KeyRecord>, KeywardenError> {
        self.ledger.keys_bound_to(device_id.trim(), module)
    }

    /// Aggregate counts over all keys, or one module's keys.
    pub fn usage_statistics(&self, module: Option<Module>) -> Result<UsageStatistics, KeywardenError> {
        let now = self.local_now();
        let records = self.ledger.list(module)?;

        let total_usage = records
            .iter()
            .fold(0u64, |sum, r| sum.saturating_add(r.usage_count));
        let total_max_usage = records
            .iter()
            .filter_map(|r| r.max_usage)
            .fold(0u64, u64::saturating_add);
        let usage_percentage = if total_max_usage > 0 {
            total_usage as f64 / total_max_usage as f64 * 100.0
        } else {
            0.0
        };

        Ok(UsageStatistics {
            total_keys: records.len() as u64,
            active_keys: records.iter().filter(|r| r.status == KeyStatus::Active).count() as u64,
            expired_keys: records.iter().filter(|r| r.is_expired_at(now)).count() as u64,
            total_usage,
            total_max_usage,
            usage_percentage,
        })
    }

    /// Key counts for every module, in [`Module::ALL`] order.
    pub fn module_stats(&self) -> Result<Vec<ModuleKeyStats>, KeywardenError> {
        let now = self.local_now();
        let records = self.ledger.list(None)?;

        Ok(Module::ALL
            .into_iter()
            .map(|module| {
                let keys: Vec<&KeyRecord> = records.iter().filter(|r| r.module == module).collect();
                ModuleKeyStats {
                    module,
                    total: keys.len() as u64,
                    active: keys.iter().filter(|r| r.status == KeyStatus::Active).count() as u64,
                    expired: keys.iter().filter(|r| r.is_expired_at(now)).count() as u64,
                    used_up: keys.iter().filter(|r| r.is_used_up()).count() as u64,
                }
            })
            .collect())
    }

    // ==================== Audit trail ====================

    fn clamp(&self, page: Page) -> Page {
        Page {
            limit: self.config.page_limit(Some(page.limit)),
            ..page
        }
    }

    /// Decision entries, newest first. The page size is clamped to the
    /// configured maximum.
    pub fn list_decision_log(
        &self,
        filters: &DecisionLogFilters,
        page: Page,
    ) -> Result<Vec<DecisionLogEntry>, KeywardenError> {
        self.logger.list_decisions(filters, self.clamp(page))
    }

    /// Activity entries, newest first.
    pub fn list_activity_log(
        &self,
        filters: &ActivityLogFilters,
        page: Page,
    ) -> Result<Vec<ActivityLogEntry>, KeywardenError> {
        self.logger.list_activity(filters, self.clamp(page))
    }

    /// Decision dashboard counts.
    pub fn decision_stats(&self) -> Result<DecisionStats, KeywardenError> {
        self.logger.decision_stats()
    }

    /// Activity dashboard counts.
    pub fn activity_stats(&self) -> Result<ActivityStats, KeywardenError> {
        self.logger.activity_stats()
    }

    /// Purge activity entries and record `CLEANUP_ACTIVITY_LOG`.
    pub fn cleanup_activity_log(
        &self,
        criteria: &CleanupCriteria,
        actor: &AdminContext,
    ) -> Result<CleanupReport, KeywardenError> {
        let report = self.logger.cleanup_activity(criteria)?;
        info!(deleted = report.deleted_count, "activity log cleaned");
        self.logger.record_activity(
            &NewActivityEntry::new(ActivityAction::CleanupActivityLog, actor.clone()).old_values(
                json!({
                    "days_to_keep": criteria.days_to_keep,
                    "action_filter": criteria.action,
                    "module_filter": criteria.module,
                    "deleted_count": report.deleted_count,
                }),
            ),
        );
        Ok(report)
    }

    /// Latest entries of both streams merged, newest first.
    pub fn combined_feed(&self, limit: Option<u32>) -> Result<Vec<FeedItem>, KeywardenError> {
        self.logger.combined_feed(self.config.page_limit(limit))
    }
}

fn non_blank_or_unknown(value: &str) -> String {
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

/// Reject an expiry no check could ever parse.
fn check_expiry_input(expires: Option<&str>) -> Result<(), KeywardenError> {
    match parse_expiry(expires) {
        Ok(_) | Err(ExpiryError::Missing) => Ok(()),
        Err(ExpiryError::InvalidFormat(raw)) => Err(KeywardenError::InvalidKey(format!(
            "invalid expiry date: {}",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::policy::validity::DenyReason;
    use std::time::Duration;

    // 2025-06-15 12:00 at UTC+7
    const NOW: &str = "2025-06-15T05:00:00Z";

    fn manager() -> (KeyManager, Arc<MockClock>) {
        let clock = Arc::new(MockClock::from_rfc3339(NOW));
        let manager = KeyManager::new_with_clock(KeywardenConfig::default(), clock.clone()).unwrap();
        (manager, clock)
    }

    fn admin() -> AdminContext {
        AdminContext {
            ip: Some("127.0.0.1".into()),
            user_agent: Some("admin-ui".into()),
        }
    }

    #[test]
    fn test_scenario_check_then_charge() {
        let (m, _) = manager();
        m.add_key(
            NewKey::new("ABC", Module::Voice).expires("2025-06-16").max_usage(3),
            &admin(),
        )
        .unwrap();

        let d = m.check_validity("ABC", "dev1", Module::Voice).unwrap();
        assert!(d.is_allowed());
        assert_eq!(d.remaining(), Some(Remaining::Units(3)));

        let d = m.check_validity("ABC", "dev2", Module::Voice).unwrap();
        assert_eq!(d.reason(), Some(&DenyReason::DeviceMismatch));

        assert_eq!(m.charge_one("ABC", "dev1", Module::Voice).unwrap(), Remaining::Units(2));
        assert_eq!(m.charge_one("ABC", "dev1", Module::Voice).unwrap(), Remaining::Units(1));
        assert_eq!(m.charge_one("ABC", "dev1", Module::Voice).unwrap(), Remaining::Units(0));
        assert!(matches!(
            m.charge_one("ABC", "dev1", Module::Voice),
            Err(ChargeError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_expiry_boundary() {
        let (m, clock) = manager();
        m.add_key(NewKey::new("Y", Module::Image).expires("2025-06-14"), &admin()).unwrap();
        m.add_key(NewKey::new("T", Module::Image).expires("06/16/2025"), &admin()).unwrap();

        let d = m.check_validity("Y", "d1", Module::Image).unwrap();
        assert_eq!(d.reason(), Some(&DenyReason::KeyExpired));
        assert!(m.check_validity("T", "d2", Module::Image).unwrap().is_allowed());

        // One day later T expires at local midnight.
        clock.advance(chrono::Duration::days(1));
        let d = m.check_validity("T", "d2", Module::Image).unwrap();
        assert_eq!(d.reason(), Some(&DenyReason::KeyExpired));
    }

    #[test]
    fn test_authorize_logs_every_outcome() {
        let (m, _) = manager();
        m.add_key(NewKey::new("K", Module::Music).expires("2025-12-31"), &admin()).unwrap();

        let missing = GatewayRequest::new(Module::Music).key("K").endpoint("generate");
        let d = m.authorize(&missing).unwrap();
        assert_eq!(d.class().http_status(), 400);

        let ok = GatewayRequest::new(Module::Music)
            .key(" K ")
            .device_id("dev")
            .endpoint("generate")
            .ip("10.0.0.1");
        assert!(m.authorize(&ok).unwrap().is_allowed());

        let denied = GatewayRequest::new(Module::Music).key("K").device_id("other");
        assert_eq!(m.authorize(&denied).unwrap().class().http_status(), 403);

        let log = m
            .list_decision_log(&DecisionLogFilters::default(), Page::default())
            .unwrap();
        assert_eq!(log.len(), 3);
        let statuses: Vec<_> = log.iter().filter_map(|e| e.response_status).collect();
        assert!(statuses.contains(&400) && statuses.contains(&200) && statuses.contains(&403));

        let bad_input = log.iter().find(|e| e.response_status == Some(400)).unwrap();
        assert_eq!(bad_input.device_id.as_deref(), Some("unknown"));
        assert_eq!(bad_input.response_message.as_deref(), Some("Missing required field: device_id"));
    }

    #[test]
    fn test_admin_crud_records_activity() {
        let (m, _) = manager();
        let created = m
            .add_key(NewKey::new("K", Module::Voice).max_usage(10), &admin())
            .unwrap();
        assert_eq!(created.usage_count, 0);
        assert!(matches!(
            m.add_key(NewKey::new("K", Module::Voice), &admin()),
            Err(KeywardenError::KeyExists)
        ));

        let patch = KeyPatch {
            status: Some(KeyStatus::Locked),
            ..KeyPatch::default()
        };
        let updated = m.update_key("K", Module::Voice, &patch, &admin()).unwrap().unwrap();
        assert_eq!(updated.status, KeyStatus::Locked);
        assert!(m.update_key("nope", Module::Voice, &patch, &admin()).unwrap().is_none());

        assert!(m.delete_key("K", Module::Voice, &admin()).unwrap().is_some());
        assert!(m.delete_key("K", Module::Voice, &admin()).unwrap().is_none());

        let activity = m
            .list_activity_log(&ActivityLogFilters::default(), Page::default())
            .unwrap();
        let actions: Vec<_> = activity.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![ActivityAction::DeleteKey, ActivityAction::UpdateKey, ActivityAction::CreateKey]
        );

        let update = &activity[1];
        assert_eq!(update.old_values.as_ref().unwrap()["status"], "active");
        assert_eq!(update.new_values.as_ref().unwrap()["status"], "locked");
        assert_eq!(update.user_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_admin_validation() {
        let (m, _) = manager();
        assert!(matches!(
            m.add_key(NewKey::new("K", Module::Voice).expires("next week"), &admin()),
            Err(KeywardenError::InvalidKey(_))
        ));

        m.add_key(NewKey::new("K", Module::Voice).max_usage(5).usage_count(3), &admin())
            .unwrap();
        let shrink = KeyPatch {
            max_usage: Some(Some(2)),
            ..KeyPatch::default()
        };
        assert!(matches!(
            m.update_key("K", Module::Voice, &shrink, &admin()),
            Err(KeywardenError::QuotaBelowUsage { .. })
        ));
        assert!(m.update_key("K", Module::Voice, &KeyPatch::default(), &admin()).is_err());
    }

    #[test]
    fn test_status_is_idempotent_and_invalidated_by_charge() {
        let (m, _) = manager();
        m.add_key(NewKey::new("K", Module::Voice).expires("2025-12-31").max_usage(4), &admin())
            .unwrap();

        let first = m.status("K", "dev", Module::Voice).unwrap().unwrap();
        let second = m.status("K", "dev", Module::Voice).unwrap().unwrap();
        assert_eq!(first.remaining, second.remaining);
        assert!(!first.bound_to_caller);

        m.charge_one("K", "dev", Module::Voice).unwrap();
        let after = m.status("K", "dev", Module::Voice).unwrap().unwrap();
        assert_eq!(after.remaining, Remaining::Units(3));
        assert!(after.bound_to_caller);
        assert!(m.status("ghost", "dev", Module::Voice).unwrap().is_none());
    }

    #[test]
    fn test_status_cache_expires() {
        let clock = Arc::new(MockClock::from_rfc3339(NOW));
        let config = KeywardenConfig {
            cache_ttl: Duration::from_secs(10),
            ..KeywardenConfig::default()
        };
        let m = KeyManager::new_with_clock(config, clock.clone()).unwrap();
        m.add_key(NewKey::new("K", Module::Voice), &admin()).unwrap();
        assert!(m.status("K", "d", Module::Voice).unwrap().is_some());

        // A write behind the manager's back is seen once the entry expires.
        m.ledger().delete("K", Module::Voice).unwrap();
        assert!(m.status("K", "d", Module::Voice).unwrap().is_some());
        clock.advance(chrono::Duration::seconds(11));
        assert!(m.status("K", "d", Module::Voice).unwrap().is_none());
    }

    #[test]
    fn test_key_queries_and_statistics() {
        let (m, _) = manager();
        m.add_key(NewKey::new("A", Module::Voice).expires("2025-01-01").max_usage(10).usage_count(5), &admin())
            .unwrap();
        m.add_key(NewKey::new("B", Module::Voice).expires("2025-12-31").max_usage(2).usage_count(2), &admin())
            .unwrap();
        m.add_key(
            NewKey::new("C", Module::Image).status(KeyStatus::Locked).expires("not-a-date"),
            &admin(),
        )
        .unwrap_err();
        m.add_key(NewKey::new("C", Module::Image).status(KeyStatus::Locked), &admin())
            .unwrap();

        assert_eq!(m.list_keys(None).unwrap().len(), 3);
        assert_eq!(m.list_keys_by_status(KeyStatus::Locked, None).unwrap().len(), 1);
        let expired: Vec<_> = m.expired_keys(None).unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(expired, vec!["A"]);

        m.check_validity("B", "dev", Module::Voice).unwrap();
        assert_eq!(m.keys_by_device("dev", None).unwrap().len(), 1);

        let stats = m.usage_statistics(Some(Module::Voice)).unwrap();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.expired_keys, 1);
        assert_eq!(stats.total_usage, 7);
        assert_eq!(stats.total_max_usage, 12);
        assert!((stats.usage_percentage - 58.333).abs() < 0.01);

        let per_module = m.module_stats().unwrap();
        assert_eq!(per_module.len(), Module::ALL.len());
        let voice = per_module.iter().find(|s| s.module == Module::Voice).unwrap();
        assert_eq!((voice.total, voice.active, voice.expired, voice.used_up), (2, 2, 1, 1));
    }

    #[test]
    fn test_statistics_saturate_on_huge_counters() {
        let (m, _) = manager();
        let big = crate::db::MAX_COUNTER;
        m.add_key(NewKey::new("A", Module::Voice).max_usage(big).usage_count(big), &admin())
            .unwrap();
        m.add_key(NewKey::new("B", Module::Voice).max_usage(big).usage_count(big), &admin())
            .unwrap();
        m.add_key(NewKey::new("C", Module::Voice).max_usage(big).usage_count(big), &admin())
            .unwrap();

        let stats = m.usage_statistics(None).unwrap();
        assert_eq!(stats.total_usage, u64::MAX);
        assert_eq!(stats.total_max_usage, u64::MAX);
    }

    #[test]
    fn test_cleanup_with_unbounded_retention() {
        let (m, _) = manager();
        m.add_key(NewKey::new("A", Module::Voice), &admin()).unwrap();

        let report = m
            .cleanup_activity_log(
                &CleanupCriteria {
                    days_to_keep: Some(u32::MAX),
                    ..CleanupCriteria::default()
                },
                &admin(),
            )
            .unwrap();
        assert_eq!(report.deleted_count, 0);
        assert_eq!(report.remaining_count, 1);
    }

    #[test]
    fn test_cleanup_is_logged() {
        let (m, clock) = manager();
        m.add_key(NewKey::new("A", Module::Voice), &admin()).unwrap();
        clock.advance(chrono::Duration::days(40));

        let report = m
            .cleanup_activity_log(
                &CleanupCriteria {
                    days_to_keep: Some(30),
                    ..CleanupCriteria::default()
                },
                &admin(),
            )
            .unwrap();
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.remaining_count, 0);

        let log = m
            .list_activity_log(&ActivityLogFilters::default(), Page::default())
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, ActivityAction::CleanupActivityLog);
        assert_eq!(log[0].old_values.as_ref().unwrap()["deleted_count"], 1);

        let feed = m.combined_feed(None).unwrap();
        assert_eq!(feed.len(), 1);
    }
}
