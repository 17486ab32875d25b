//! Database schema and migrations.

use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK(kind IN ('run-all', 'run-class', 'run-method', 'run-category', 'refresh-full', 'refresh-paths')),
            filter TEXT,
            target_mode TEXT NOT NULL CHECK(target_mode IN ('editor-mode', 'play-mode', 'both')),
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_kind TEXT,
            error_message TEXT,
            total_count INTEGER NOT NULL DEFAULT 0,
            passed_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            duration_secs REAL NOT NULL DEFAULT 0.0
        );

        CREATE TABLE IF NOT EXISTS result_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK(outcome IN ('passed', 'failed', 'skipped', 'inconclusive')),
            duration_secs REAL NOT NULL DEFAULT 0.0,
            message TEXT,
            stack_trace TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (request_id) REFERENCES requests(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS execution_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id INTEGER,
            level TEXT NOT NULL CHECK(level IN ('DEBUG', 'INFO', 'WARNING', 'ERROR')),
            source TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS component_heartbeats (
            component TEXT PRIMARY KEY CHECK(component IN ('controller', 'host', 'store')),
            status TEXT NOT NULL,
            message TEXT,
            last_seen TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_requests_claim ON requests(status, priority DESC, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_result_items_request ON result_items(request_id);
        CREATE INDEX IF NOT EXISTS idx_execution_log_request ON execution_log(request_id);
        CREATE INDEX IF NOT EXISTS idx_execution_log_created ON execution_log(created_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
