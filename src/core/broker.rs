use crate::core::db;
use crate::core::error::MarshalError;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// The DB Broker is the "Thin Waist" for state access.
///
/// Every mutation runs inside one `BEGIN IMMEDIATE` transaction on a fresh
/// connection: concurrent writers serialize on SQLite's write lock (bounded
/// by `busy_timeout`) instead of an in-process mutex, so separate processes
/// polling the same store get the same guarantees as threads.
#[derive(Debug, Clone)]
pub struct DbBroker {
    db_path: PathBuf,
}

impl DbBroker {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` as one unit of work. Commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<F, R>(&self, actor: &str, op_name: &str, f: F) -> Result<R, MarshalError>
    where
        F: FnOnce(&Connection) -> Result<R, MarshalError>,
    {
        let started = Instant::now();
        let conn = db::db_connect(&self.db_path.to_string_lossy())?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;

        let result = f(&tx);
        let result = match result {
            Ok(value) => tx.commit().map(|_| value).map_err(MarshalError::from),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(op = op_name, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        };

        let status = match &result {
            Ok(_) => "success",
            Err(err) => err.code(),
        };
        tracing::debug!(
            op = op_name,
            actor,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "broker op"
        );
        result
    }

    /// Read-only access. WAL lets readers proceed beside the writer.
    pub fn with_read<F, R>(&self, f: F) -> Result<R, MarshalError>
    where
        F: FnOnce(&Connection) -> Result<R, MarshalError>,
    {
        let conn = db::db_connect(&self.db_path.to_string_lossy())?;
        f(&conn)
    }
}
