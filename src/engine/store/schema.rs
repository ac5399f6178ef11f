// Database schema and migrations for the kmem store.
// Called once by MemoryStore::open() after the connection pragmas are set.
// Adding a table or column: append an idempotent CREATE TABLE IF NOT EXISTS or
// ALTER TABLE … ADD COLUMN (duplicate-column errors are swallowed) at the end
// of run_migrations(). Never edit existing DDL.

use log::info;
use rusqlite::Connection;

use crate::atoms::error::EngineResult;

pub(crate) const SCHEMA_VERSION: i64 = 1;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // ── Core tables ──────────────────────────────────────────────────
    // Content and embedding are stored only as AES-GCM ciphertext + IV.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_items (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            memory_type TEXT NOT NULL DEFAULT 'fact',
            content_ct BLOB NOT NULL,
            content_iv BLOB NOT NULL,
            embedding_ct BLOB NOT NULL,
            embedding_iv BLOB NOT NULL,
            salience REAL NOT NULL DEFAULT 0.5,
            sensitive INTEGER NOT NULL DEFAULT 0,
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT,
            cooldown_until TEXT,
            topic_tags TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL DEFAULT 'user',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_memory_items_owner
            ON memory_items(owner_id, created_at);

        CREATE TABLE IF NOT EXISTS key_records (
            name TEXT PRIMARY KEY,
            record TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS engine_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if current < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        info!(
            "[kmem-store] Schema migrated from v{} to v{}",
            current, SCHEMA_VERSION
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('memory_items', 'key_records', 'engine_meta')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
