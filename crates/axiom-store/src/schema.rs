use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fails harmlessly on in-memory and brand-new databases.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    // A token with no row for a layer has that layer absent.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tokens (
            id             INTEGER PRIMARY KEY,
            entity_type    INTEGER NOT NULL,
            domain         INTEGER NOT NULL,
            local_id       INTEGER NOT NULL UNIQUE,
            weight         REAL NOT NULL,
            field_radius   REAL NOT NULL,
            field_strength REAL NOT NULL,
            timestamp      INTEGER NOT NULL,
            flags          INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS token_coordinates (
            token_id INTEGER NOT NULL REFERENCES tokens(id) ON DELETE CASCADE,
            layer    INTEGER NOT NULL CHECK (layer BETWEEN 0 AND 7),
            x        REAL NOT NULL,
            y        REAL NOT NULL,
            z        REAL NOT NULL,
            PRIMARY KEY (token_id, layer)
        );

        CREATE INDEX IF NOT EXISTS idx_tokens_domain ON tokens(entity_type, domain);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
