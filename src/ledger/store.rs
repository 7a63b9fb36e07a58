//! Key ledger store.
//!
//! Row-level operations are free functions over a [`Connection`] so the
//! validity checker and the accountant can compose them inside one
//! transaction. [`KeyLedger`] wraps them for standalone use; each of its
//! methods is atomic on its own.

use crate::clock::Clock;
use crate::db::{decode_ts, encode_ts, i64_to_u64, u64_to_i64, Database};
use crate::ledger::models::{KeyPatch, KeyRecord, KeyStatus, Module, NewKey};
use crate::KeywardenError;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;

const SELECT_COLUMNS: &str = "SELECT key, module, device_id, status, expires, max_usage, usage_count, note, created_at, updated_at FROM keys";

fn read_record(row: &Row<'_>) -> Result<KeyRecord, rusqlite::Error> {
    let module: String = row.get(1)?;
    let module = module
        .parse::<Module>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let status: String = row.get(3)?;
    let max_usage: Option<i64> = row.get(5)?;
    let usage_count: i64 = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(KeyRecord {
        key: row.get(0)?,
        module,
        device_id: row.get(2)?,
        status: KeyStatus::from_stored(&status),
        expires: row.get(4)?,
        max_usage: max_usage.map(i64_to_u64),
        usage_count: i64_to_u64(usage_count),
        note: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        created_at: decode_ts(8, &created_at)?,
        updated_at: decode_ts(9, &updated_at)?,
    })
}

/// Point lookup.
pub fn find(conn: &Connection, key: &str, module: Module) -> Result<Option<KeyRecord>, KeywardenError> {
    let sql = format!("{} WHERE key = ?1 AND module = ?2", SELECT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![key, module.as_str()], read_record)
        .optional()?)
}

/// Find another key in `module` already bound to `device_id`.
pub fn find_other_binding(
    conn: &Connection,
    module: Module,
    device_id: &str,
    key: &str,
) -> Result<Option<String>, KeywardenError> {
    Ok(conn
        .query_row(
            "SELECT key FROM keys
             WHERE module = ?1 AND device_id = ?2 AND key != ?3
             ORDER BY id LIMIT 1",
            params![module.as_str(), device_id, key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Insert if `(key, module)` is absent. Returns `false` when it exists.
pub fn insert(conn: &Connection, new_key: &NewKey, now: DateTime<Utc>) -> Result<bool, KeywardenError> {
    let ts = encode_ts(&now);
    let max_usage = new_key.max_usage.map(u64_to_i64).transpose()?;
    let usage_count = u64_to_i64(new_key.usage_count)?;
    let changed = conn.execute(
        "INSERT INTO keys (key, module, device_id, status, expires, max_usage, usage_count, note, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(key, module) DO NOTHING",
        params![
            new_key.key,
            new_key.module.as_str(),
            new_key.device_id,
            new_key.status.as_str(),
            new_key.expires,
            max_usage,
            usage_count,
            new_key.note,
            ts,
        ],
    )?;
    Ok(changed == 1)
}

/// Bind an unbound key to `device_id`. Returns `false` if the key is
/// missing or already bound.
pub fn bind_device(
    conn: &Connection,
    key: &str,
    module: Module,
    device_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, KeywardenError> {
    let changed = conn.execute(
        "UPDATE keys SET device_id = ?1, updated_at = ?2
         WHERE key = ?3 AND module = ?4 AND (device_id IS NULL OR device_id = '')",
        params![device_id, encode_ts(&now), key, module.as_str()],
    )?;
    Ok(changed == 1)
}

/// Add `count` to the usage counter. Quota is the caller's concern.
pub fn add_usage(
    conn: &Connection,
    key: &str,
    module: Module,
    count: u64,
    now: DateTime<Utc>,
) -> Result<bool, KeywardenError> {
    let changed = conn.execute(
        "UPDATE keys SET usage_count = usage_count + ?1, updated_at = ?2
         WHERE key = ?3 AND module = ?4",
        params![u64_to_i64(count)?, encode_ts(&now), key, module.as_str()],
    )?;
    Ok(changed == 1)
}

/// Overwrite every mutable column of an existing row.
pub fn write_record(conn: &Connection, record: &KeyRecord) -> Result<bool, KeywardenError> {
    let max_usage = record.max_usage.map(u64_to_i64).transpose()?;
    let usage_count = u64_to_i64(record.usage_count)?;
    let changed = conn.execute(
        "UPDATE keys SET device_id = ?1, status = ?2, expires = ?3, max_usage = ?4,
                usage_count = ?5, note = ?6, updated_at = ?7
         WHERE key = ?8 AND module = ?9",
        params![
            record.device_id,
            record.status.as_str(),
            record.expires,
            max_usage,
            usage_count,
            record.note,
            encode_ts(&record.updated_at),
            record.key,
            record.module.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

/// Delete a row. Returns `false` when it was absent.
pub fn delete(conn: &Connection, key: &str, module: Module) -> Result<bool, KeywardenError> {
    let changed = conn.execute(
        "DELETE FROM keys WHERE key = ?1 AND module = ?2",
        params![key, module.as_str()],
    )?;
    Ok(changed == 1)
}

/// Scan keys, newest first, optionally restricted to one module.
pub fn list(conn: &Connection, module: Option<Module>) -> Result<Vec<KeyRecord>, KeywardenError> {
    let mut records = Vec::new();
    match module {
        Some(module) => {
            let sql = format!("{} WHERE module = ?1 ORDER BY created_at DESC, id DESC", SELECT_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            for row in stmt.query_map(params![module.as_str()], read_record)? {
                records.push(row?);
            }
        }
        None => {
            let sql = format!("{} ORDER BY created_at DESC, id DESC", SELECT_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            for row in stmt.query_map([], read_record)? {
                records.push(row?);
            }
        }
    }
    Ok(records)
}

/// Durable key storage keyed by `(key, module)`.
pub struct KeyLedger {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl KeyLedger {
    /// Create a ledger over an open database.
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// The underlying database.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The clock used for `created_at`/`updated_at`.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Point lookup.
    pub fn get(&self, key: &str, module: Module) -> Result<Option<KeyRecord>, KeywardenError> {
        self.db.with_conn(|conn| find(conn, key, module))
    }

    /// Insert a key if `(key, module)` is absent, returning the stored row.
    ///
    /// Returns `Ok(None)` when the pair already exists.
    pub fn insert(&self, new_key: &NewKey) -> Result<Option<KeyRecord>, KeywardenError> {
        let now = self.clock.now_utc();
        self.db.write(|tx| {
            if !insert(tx, new_key, now)? {
                return Ok(None);
            }
            find(tx, &new_key.key, new_key.module)
        })
    }

    /// Apply a patch atomically. Returns the rows before and after, or
    /// `None` when the key does not exist.
    pub fn update(
        &self,
        key: &str,
        module: Module,
        patch: &KeyPatch,
    ) -> Result<Option<(KeyRecord, KeyRecord)>, KeywardenError> {
        let now = self.clock.now_utc();
        self.db.write(|tx| {
            let Some(before) = find(tx, key, module)? else {
                return Ok(None);
            };
            let mut after = patch.apply_to(&before)?;
            after.updated_at = now;
            write_record(tx, &after)?;
            Ok(Some((before, after)))
        })
    }

    /// Delete a key, returning the removed row.
    pub fn delete(&self, key: &str, module: Module) -> Result<Option<KeyRecord>, KeywardenError> {
        self.db.write(|tx| {
            let Some(before) = find(tx, key, module)? else {
                return Ok(None);
            };
            delete(tx, key, module)?;
            Ok(Some(before))
        })
    }

    /// All keys, newest first, optionally for one module.
    pub fn list(&self, module: Option<Module>) -> Result<Vec<KeyRecord>, KeywardenError> {
        self.db.with_conn(|conn| list(conn, module))
    }

    /// Keys bound to `device_id`, optionally within one module.
    pub fn keys_bound_to(
        &self,
        device_id: &str,
        module: Option<Module>,
    ) -> Result<Vec<KeyRecord>, KeywardenError> {
        Ok(self
            .list(module)?
            .into_iter()
            .filter(|record| record.bound_device() == Some(device_id))
            .collect())
    }
}
