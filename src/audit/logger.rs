//! Append-only writer for the decision and activity streams.
//!
//! Writes are best effort. A failed append is reported through `tracing`
//! and otherwise ignored so the request that produced it still completes.

use crate::audit::entries::{NewActivityEntry, NewDecisionEntry};
use crate::clock::Clock;
use crate::db::{encode_ts, Database};
use crate::fingerprint::key_fingerprint;
use crate::KeywardenError;
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Writes and reads the audit trail.
pub struct AccessLogger {
    pub(crate) db: Arc<Database>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl AccessLogger {
    /// Create a logger over the ledger database.
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Append a decision entry, swallowing failures.
    pub fn record_decision(&self, entry: &NewDecisionEntry) {
        if let Err(e) = self.try_record_decision(entry) {
            warn!(
                key = %key_fingerprint(&entry.key),
                module = %entry.module,
                error = %e,
                "failed to write decision log entry"
            );
        }
    }

    /// Append an activity entry, swallowing failures.
    pub fn record_activity(&self, entry: &NewActivityEntry) {
        if let Err(e) = self.try_record_activity(entry) {
            warn!(
                action = %entry.action,
                error = %e,
                "failed to write activity log entry"
            );
        }
    }

    /// Append a decision entry, returning the new row id.
    pub fn try_record_decision(&self, entry: &NewDecisionEntry) -> Result<i64, KeywardenError> {
        let request_data = json_column(entry.context.request_data.as_ref())?;
        let created_at = encode_ts(&self.clock.now_utc());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO api_usage_log (key_value, module, device_id, endpoint, user_ip, user_agent,
                                            request_data, response_status, response_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.key,
                    entry.module.as_str(),
                    entry.device_id,
                    entry.context.endpoint,
                    entry.context.ip,
                    entry.context.user_agent,
                    request_data,
                    entry.response_status,
                    entry.response_message,
                    created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Append an activity entry, returning the new row id.
    pub fn try_record_activity(&self, entry: &NewActivityEntry) -> Result<i64, KeywardenError> {
        let old_values = json_column(entry.old_values.as_ref())?;
        let new_values = json_column(entry.new_values.as_ref())?;
        let created_at = encode_ts(&self.clock.now_utc());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activity_log (action, key_value, module, old_values, new_values, user_ip, user_agent, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.action.as_str(),
                    entry.key,
                    entry.module.map(|m| m.as_str()),
                    old_values,
                    new_values,
                    entry.actor.ip,
                    entry.actor.user_agent,
                    created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }
}

fn json_column(value: Option<&Value>) -> Result<Option<String>, KeywardenError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(serde_json::to_string(v)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entries::{ActivityAction, AdminContext, RequestContext};
    use crate::clock::MockClock;
    use crate::ledger::models::Module;
    use serde_json::json;

    fn logger() -> AccessLogger {
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        AccessLogger::new(Arc::new(Database::open_in_memory().unwrap()), clock)
    }

    fn decision(status: u16) -> NewDecisionEntry {
        NewDecisionEntry {
            key: "K".into(),
            module: Module::Voice,
            device_id: Some("dev".into()),
            context: RequestContext {
                endpoint: Some("generate".into()),
                ip: Some("10.0.0.1".into()),
                user_agent: None,
                request_data: Some(json!({"text_len": 42})),
            },
            response_status: status,
            response_message: "OK".into(),
        }
    }

    #[test]
    fn appends_return_increasing_ids() {
        let logger = logger();
        let first = logger.try_record_decision(&decision(200)).unwrap();
        let second = logger.try_record_decision(&decision(403)).unwrap();
        assert!(second > first);

        let id = logger
            .try_record_activity(
                &NewActivityEntry::new(ActivityAction::CreateKey, AdminContext::default())
                    .row("K", Module::Voice)
                    .new_values(json!({"max_usage": 3})),
            )
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn failed_append_is_swallowed() {
        let logger = logger();
        logger
            .db
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE api_usage_log; DROP TABLE activity_log;")
                    .map_err(KeywardenError::from)
            })
            .unwrap();

        assert!(logger.try_record_decision(&decision(200)).is_err());
        logger.record_decision(&decision(200));
        logger.record_activity(&NewActivityEntry::new(
            ActivityAction::DeleteKey,
            AdminContext::default(),
        ));
    }

    #[test]
    fn null_snapshots_are_stored_as_null() {
        assert_eq!(json_column(Some(&Value::Null)).unwrap(), None);
        assert_eq!(json_column(Some(&json!({"a": 1}))).unwrap().as_deref(), Some(r#"{"a":1}"#));
    }
}
