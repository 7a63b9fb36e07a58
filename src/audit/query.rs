//! Administrative reads over the audit trail: filtered listings,
//! dashboard counts, cleanup and the merged feed.

use crate::audit::entries::{ActivityAction, ActivityLogEntry, DecisionLogEntry, FeedItem};
use crate::audit::logger::AccessLogger;
use crate::db::{decode_ts, encode_ts, i64_to_u64};
use crate::ledger::models::Module;
use crate::KeywardenError;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params_from_iter, Connection, Row};
use serde::Serialize;
use serde_json::Value;

/// Limit and offset of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum rows returned.
    pub limit: u32,
    /// Rows skipped.
    pub offset: u32,
}

impl Page {
    /// The `number`th page (1-based) of `limit` rows.
    pub fn numbered(number: u32, limit: u32) -> Self {
        Self {
            limit,
            offset: number.saturating_sub(1).saturating_mul(limit),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}

/// Filters for the decision stream. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionLogFilters {
    /// Exact key.
    pub key: Option<String>,
    /// Module.
    pub module: Option<Module>,
    /// Exact endpoint.
    pub endpoint: Option<String>,
    /// Exact caller IP.
    pub ip: Option<String>,
    /// Exact response status.
    pub response_status: Option<u16>,
    /// Entries at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Entries at or before this instant.
    pub until: Option<DateTime<Utc>>,
}

/// Filters for the activity stream. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityLogFilters {
    /// Action tag.
    pub action: Option<ActivityAction>,
    /// Module.
    pub module: Option<Module>,
    /// Exact key.
    pub key: Option<String>,
    /// Entries at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Entries at or before this instant.
    pub until: Option<DateTime<Utc>>,
}

/// Which activity entries a cleanup removes. All set criteria must match;
/// with none set every entry is removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupCriteria {
    /// Keep entries newer than this many days.
    pub days_to_keep: Option<u32>,
    /// Only remove entries with this action.
    pub action: Option<ActivityAction>,
    /// Only remove entries for this module.
    pub module: Option<Module>,
}

/// Outcome of a cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Entries removed.
    pub deleted_count: u64,
    /// Entries left.
    pub remaining_count: u64,
}

/// Activity dashboard counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityStats {
    /// All entries.
    pub total_activities: u64,
    /// Count per action, most frequent first.
    pub actions: Vec<(String, u64)>,
    /// Count per module, most frequent first.
    pub modules: Vec<(String, u64)>,
    /// Entries in the last 24 hours.
    pub recent_24h: u64,
}

/// Decision dashboard counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionStats {
    /// All entries.
    pub total_calls: u64,
    /// Count per module, most frequent first.
    pub modules: Vec<(String, u64)>,
    /// Count per endpoint, most frequent first.
    pub endpoints: Vec<(String, u64)>,
    /// The ten busiest caller IPs.
    pub top_ips: Vec<(String, u64)>,
    /// Entries in the last 24 hours.
    pub recent_24h: u64,
    /// Count per response status, most frequent first.
    pub status_stats: Vec<(u16, u64)>,
}

/// WHERE clause under construction.
#[derive(Default)]
struct Conditions {
    clauses: Vec<&'static str>,
    values: Vec<SqlValue>,
}

impl Conditions {
    fn push(&mut self, clause: &'static str, value: SqlValue) {
        self.clauses.push(clause);
        self.values.push(value);
    }

    fn text(&mut self, clause: &'static str, value: Option<&str>) {
        if let Some(v) = value {
            self.push(clause, SqlValue::Text(v.to_string()));
        }
    }

    fn time(&mut self, clause: &'static str, value: Option<DateTime<Utc>>) {
        if let Some(ts) = value {
            self.push(clause, SqlValue::Text(encode_ts(&ts)));
        }
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

impl DecisionLogFilters {
    fn conditions(&self) -> Conditions {
        let mut c = Conditions::default();
        c.text("key_value = ?", self.key.as_deref());
        c.text("module = ?", self.module.map(Module::as_str));
        c.text("endpoint = ?", self.endpoint.as_deref());
        c.text("user_ip = ?", self.ip.as_deref());
        if let Some(status) = self.response_status {
            c.push("response_status = ?", SqlValue::Integer(i64::from(status)));
        }
        c.time("created_at >= ?", self.since);
        c.time("created_at <= ?", self.until);
        c
    }
}

impl ActivityLogFilters {
    fn conditions(&self) -> Conditions {
        let mut c = Conditions::default();
        c.text("action = ?", self.action.map(ActivityAction::as_str));
        c.text("module = ?", self.module.map(Module::as_str));
        c.text("key_value = ?", self.key.as_deref());
        c.time("created_at >= ?", self.since);
        c.time("created_at <= ?", self.until);
        c
    }
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn json_field(idx: usize, raw: Option<String>) -> Result<Option<Value>, rusqlite::Error> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

const DECISION_COLUMNS: &str = "SELECT id, key_value, module, device_id, endpoint, user_ip, user_agent, request_data, response_status, response_message, created_at FROM api_usage_log";

fn read_decision(row: &Row<'_>) -> Result<DecisionLogEntry, rusqlite::Error> {
    let module: String = row.get(2)?;
    let created_at: String = row.get(10)?;
    let status: Option<i64> = row.get(8)?;
    Ok(DecisionLogEntry {
        id: row.get(0)?,
        key: row.get(1)?,
        module: module.parse::<Module>().map_err(|e| conversion_error(2, e))?,
        device_id: row.get(3)?,
        endpoint: row.get(4)?,
        user_ip: row.get(5)?,
        user_agent: row.get(6)?,
        request_data: json_field(7, row.get(7)?)?,
        response_status: status.and_then(|s| u16::try_from(s).ok()),
        response_message: row.get(9)?,
        created_at: decode_ts(10, &created_at)?,
    })
}

const ACTIVITY_COLUMNS: &str = "SELECT id, action, key_value, module, old_values, new_values, user_ip, user_agent, created_at FROM activity_log";

fn read_activity(row: &Row<'_>) -> Result<ActivityLogEntry, rusqlite::Error> {
    let action: String = row.get(1)?;
    let module: Option<String> = row.get(3)?;
    let created_at: String = row.get(8)?;
    Ok(ActivityLogEntry {
        id: row.get(0)?,
        action: action.parse::<ActivityAction>().map_err(|e| conversion_error(1, e))?,
        key: row.get(2)?,
        module: module
            .map(|m| m.parse::<Module>())
            .transpose()
            .map_err(|e| conversion_error(3, e))?,
        old_values: json_field(4, row.get(4)?)?,
        new_values: json_field(5, row.get(5)?)?,
        user_ip: row.get(6)?,
        user_agent: row.get(7)?,
        created_at: decode_ts(8, &created_at)?,
    })
}

fn select_page<T>(
    conn: &Connection,
    columns: &str,
    conditions: Conditions,
    page: Page,
    read: fn(&Row<'_>) -> Result<T, rusqlite::Error>,
) -> Result<Vec<T>, KeywardenError> {
    let sql = format!(
        "{}{} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        columns,
        conditions.where_sql()
    );
    let mut values = conditions.values;
    values.push(SqlValue::Integer(i64::from(page.limit)));
    values.push(SqlValue::Integer(i64::from(page.offset)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), read)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn count_where(conn: &Connection, table: &str, conditions: &Conditions) -> Result<u64, KeywardenError> {
    let sql = format!("SELECT COUNT(*) FROM {}{}", table, conditions.where_sql());
    let count: i64 = conn.query_row(&sql, params_from_iter(conditions.values.iter()), |row| row.get(0))?;
    Ok(i64_to_u64(count))
}

fn tally(conn: &Connection, sql: &str) -> Result<Vec<(String, u64)>, KeywardenError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, i64_to_u64(row.get::<_, i64>(1)?)))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn count_since(conn: &Connection, table: &str, since: DateTime<Utc>) -> Result<u64, KeywardenError> {
    let mut c = Conditions::default();
    c.time("created_at >= ?", Some(since));
    count_where(conn, table, &c)
}

impl AccessLogger {
    /// Decision entries matching `filters`, newest first.
    pub fn list_decisions(
        &self,
        filters: &DecisionLogFilters,
        page: Page,
    ) -> Result<Vec<DecisionLogEntry>, KeywardenError> {
        self.db.with_conn(|conn| {
            select_page(conn, DECISION_COLUMNS, filters.conditions(), page, read_decision)
        })
    }

    /// Number of decision entries matching `filters`.
    pub fn count_decisions(&self, filters: &DecisionLogFilters) -> Result<u64, KeywardenError> {
        self.db
            .with_conn(|conn| count_where(conn, "api_usage_log", &filters.conditions()))
    }

    /// Activity entries matching `filters`, newest first.
    pub fn list_activity(
        &self,
        filters: &ActivityLogFilters,
        page: Page,
    ) -> Result<Vec<ActivityLogEntry>, KeywardenError> {
        self.db.with_conn(|conn| {
            select_page(conn, ACTIVITY_COLUMNS, filters.conditions(), page, read_activity)
        })
    }

    /// Number of activity entries matching `filters`.
    pub fn count_activity(&self, filters: &ActivityLogFilters) -> Result<u64, KeywardenError> {
        self.db
            .with_conn(|conn| count_where(conn, "activity_log", &filters.conditions()))
    }

    /// Activity dashboard counts.
    pub fn activity_stats(&self) -> Result<ActivityStats, KeywardenError> {
        let day_ago = self.clock.now_utc() - Duration::hours(24);
        self.db.with_conn(|conn| {
            Ok(ActivityStats {
                total_activities: count_where(conn, "activity_log", &Conditions::default())?,
                actions: tally(
                    conn,
                    "SELECT action, COUNT(*) FROM activity_log
                     GROUP BY action ORDER BY COUNT(*) DESC, action",
                )?,
                modules: tally(
                    conn,
                    "SELECT module, COUNT(*) FROM activity_log WHERE module IS NOT NULL
                     GROUP BY module ORDER BY COUNT(*) DESC, module",
                )?,
                recent_24h: count_since(conn, "activity_log", day_ago)?,
            })
        })
    }

    /// Decision dashboard counts.
    pub fn decision_stats(&self) -> Result<DecisionStats, KeywardenError> {
        let day_ago = self.clock.now_utc() - Duration::hours(24);
        self.db.with_conn(|conn| {
            let status_stats = tally(
                conn,
                "SELECT CAST(response_status AS TEXT), COUNT(*) FROM api_usage_log
                 WHERE response_status IS NOT NULL
                 GROUP BY response_status ORDER BY COUNT(*) DESC, response_status",
            )?
            .into_iter()
            .filter_map(|(status, count)| status.parse::<u16>().ok().map(|s| (s, count)))
            .collect();

            Ok(DecisionStats {
                total_calls: count_where(conn, "api_usage_log", &Conditions::default())?,
                modules: tally(
                    conn,
                    "SELECT module, COUNT(*) FROM api_usage_log
                     GROUP BY module ORDER BY COUNT(*) DESC, module",
                )?,
                endpoints: tally(
                    conn,
                    "SELECT endpoint, COUNT(*) FROM api_usage_log WHERE endpoint IS NOT NULL
                     GROUP BY endpoint ORDER BY COUNT(*) DESC, endpoint",
                )?,
                top_ips: tally(
                    conn,
                    "SELECT user_ip, COUNT(*) FROM api_usage_log WHERE user_ip IS NOT NULL
                     GROUP BY user_ip ORDER BY COUNT(*) DESC, user_ip LIMIT 10",
                )?,
                recent_24h: count_since(conn, "api_usage_log", day_ago)?,
                status_stats,
            })
        })
    }

    /// Delete activity entries matching `criteria`.
    ///
    /// Does not log itself; callers record the cleanup as an activity.
    pub fn cleanup_activity(&self, criteria: &CleanupCriteria) -> Result<CleanupReport, KeywardenError> {
        let mut c = Conditions::default();
        if let Some(days) = criteria.days_to_keep {
            let cutoff = Duration::try_days(i64::from(days))
                .and_then(|keep| self.clock.now_utc().checked_sub_signed(keep));
            let Some(cutoff) = cutoff else {
                // Cutoff predates every representable time: nothing is old enough.
                let remaining = self
                    .db
                    .with_conn(|conn| count_where(conn, "activity_log", &Conditions::default()))?;
                return Ok(CleanupReport {
                    deleted_count: 0,
                    remaining_count: remaining,
                });
            };
            c.time("created_at < ?", Some(cutoff));
        }
        c.text("action = ?", criteria.action.map(ActivityAction::as_str));
        c.text("module = ?", criteria.module.map(Module::as_str));

        self.db.write(|tx| {
            let sql = format!("DELETE FROM activity_log{}", c.where_sql());
            let deleted = tx.execute(&sql, params_from_iter(c.values.iter()))?;
            let remaining = count_where(tx, "activity_log", &Conditions::default())?;
            Ok(CleanupReport {
                deleted_count: u64::try_from(deleted).unwrap_or(u64::MAX),
                remaining_count: remaining,
            })
        })
    }

    /// Latest entries of both streams merged, newest first.
    pub fn combined_feed(&self, limit: u32) -> Result<Vec<FeedItem>, KeywardenError> {
        let page = Page { limit, offset: 0 };
        let mut feed: Vec<FeedItem> = self
            .list_activity(&ActivityLogFilters::default(), page)?
            .into_iter()
            .map(FeedItem::Activity)
            .chain(
                self.list_decisions(&DecisionLogFilters::default(), page)?
                    .into_iter()
                    .map(FeedItem::Decision),
            )
            .collect();
        feed.sort_by_key(|item| std::cmp::Reverse(item.created_at()));
        feed.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(feed)
    }
}
