//! SQLite connection handling.
//!
//! A [`Database`] owns a single connection behind a mutex, so every
//! ledger and log operation is serialized. Multi-statement operations
//! run in an IMMEDIATE transaction and roll back if the closure fails.

pub mod schema;

use crate::config::KeywardenConfig;
use crate::KeywardenError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Shared handle to the ledger database.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database described by `config`, creating the schema.
    pub fn open(config: &KeywardenConfig) -> Result<Self, KeywardenError> {
        match &config.database_path {
            Some(path) => Self::open_path(path, config.busy_timeout),
            None => Self::open_in_memory(),
        }
    }

    /// Open (or create) a database file.
    pub fn open_path(path: &Path, busy_timeout: Duration) -> Result<Self, KeywardenError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL is unavailable on some filesystems; the default journal still works.
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;") {
            warn!(path = %path.display(), error = %e, "WAL journal unavailable, using default journal");
        }
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, KeywardenError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, KeywardenError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read or a single-statement write.
    pub fn with_conn<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<KeywardenError>,
    {
        let conn = self.conn.lock().map_err(KeywardenError::from)?;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// Commits when `f` returns `Ok`; any `Err` rolls back every write
    /// made inside the closure.
    pub fn write<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<KeywardenError>,
    {
        let mut conn = self.conn.lock().map_err(KeywardenError::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(KeywardenError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(KeywardenError::from)?;
        Ok(value)
    }
}

/// Encode a timestamp as fixed-width RFC 3339 so text order is time order.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp written by [`encode_ts`].
pub fn decode_ts(idx: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Largest counter an INTEGER column can hold.
pub const MAX_COUNTER: u64 = i64::MAX as u64;

/// Store an unsigned counter in an INTEGER column.
///
/// Values above [`MAX_COUNTER`] are refused rather than clamped; SQLite
/// would otherwise overflow the column into REAL on the next increment.
pub fn u64_to_i64(value: u64) -> Result<i64, KeywardenError> {
    i64::try_from(value).map_err(|_| KeywardenError::CounterOverflow(value))
}

/// Read an INTEGER column back as an unsigned counter.
pub fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_round_trip_and_sort() {
        let early = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(500);

        let (a, b) = (encode_ts(&early), encode_ts(&late));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(decode_ts(0, &a).unwrap(), early);
    }

    #[test]
    fn failed_write_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), KeywardenError> = db.write(|tx| {
            tx.execute(
                "INSERT INTO keys (key, module, created_at, updated_at) VALUES ('K', 'voice', 'x', 'x')",
                [],
            )?;
            Err(KeywardenError::KeyExists)
        });
        assert!(matches!(result, Err(KeywardenError::KeyExists)));

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM keys", [], |row| row.get(0))
                    .map_err(KeywardenError::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn counters_out_of_range_are_refused() {
        assert_eq!(u64_to_i64(MAX_COUNTER).unwrap(), i64::MAX);
        assert!(matches!(
            u64_to_i64(MAX_COUNTER + 1),
            Err(KeywardenError::CounterOverflow(v)) if v == MAX_COUNTER + 1
        ));
        assert_eq!(i64_to_u64(-3), 0);
        assert_eq!(i64_to_u64(42), 42);
    }
}
