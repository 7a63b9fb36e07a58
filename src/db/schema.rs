//! Table layout.

use rusqlite::Connection;

/// Create all tables and indices if they do not exist.
pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            module TEXT NOT NULL,
            device_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            expires TEXT,
            max_usage INTEGER,
            usage_count INTEGER NOT NULL DEFAULT 0,
            note TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (key, module)
        );
        CREATE INDEX IF NOT EXISTS idx_keys_device_module ON keys(module, device_id);
        CREATE INDEX IF NOT EXISTS idx_keys_status ON keys(status);

        CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            key_value TEXT,
            module TEXT,
            old_values TEXT,
            new_values TEXT,
            user_ip TEXT,
            user_agent TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_action ON activity_log(action);
        CREATE INDEX IF NOT EXISTS idx_activity_created_at ON activity_log(created_at);
        CREATE INDEX IF NOT EXISTS idx_activity_key ON activity_log(key_value);

        CREATE TABLE IF NOT EXISTS api_usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key_value TEXT NOT NULL,
            module TEXT NOT NULL,
            device_id TEXT,
            endpoint TEXT,
            user_ip TEXT,
            user_agent TEXT,
            request_data TEXT,
            response_status INTEGER,
            response_message TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_usage_key ON api_usage_log(key_value);
        CREATE INDEX IF NOT EXISTS idx_api_usage_module ON api_usage_log(module);
        CREATE INDEX IF NOT EXISTS idx_api_usage_created_at ON api_usage_log(created_at);
        CREATE INDEX IF NOT EXISTS idx_api_usage_ip ON api_usage_log(user_ip);

        CREATE TABLE IF NOT EXISTS admin_users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            email TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_login TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );",
    )
}
