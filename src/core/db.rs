use crate::core::error::MarshalError;
use crate::core::schemas;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT_SECS: u64 = 5;

pub fn db_connect(db_path: &str) -> Result<Connection, MarshalError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn marshal_db_path(root: &Path) -> PathBuf {
    root.join(schemas::MARSHAL_DB_NAME)
}

/// Create or upgrade the schema. Idempotent.
pub fn ensure_schema(conn: &Connection) -> Result<(), MarshalError> {
    conn.execute(schemas::SCHEMA_META, [])?;

    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let current_version: u32 = current
        .as_deref()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    if current_version >= schemas::SCHEMA_VERSION {
        return Ok(());
    }

    for stmt in schemas::ALL_TABLES {
        conn.execute(stmt, [])?;
    }

    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [schemas::SCHEMA_VERSION.to_string()],
    )?;
    tracing::debug!(version = schemas::SCHEMA_VERSION, "schema ready");

    Ok(())
}

pub fn bool_to_sql(flag: bool) -> i64 {
    if flag { 1 } else { 0 }
}
