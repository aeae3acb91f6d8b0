//! Store abstraction for marshal's state.
//!
//! A store is a directory holding `marshal.db`, the optional `marshal.toml`,
//! and the token signing key.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::MarshalError;
use std::fs;
use std::path::{Path, PathBuf};

pub const STORE_ENV_VAR: &str = "MARSHAL_STORE";
pub const DEFAULT_STORE_DIR: &str = ".marshal";

/// Store handle representing one marshal state directory.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    /// Open (and initialize if needed) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, MarshalError> {
        fs::create_dir_all(root).map_err(MarshalError::IoError)?;
        let store = Self {
            root: root.to_path_buf(),
        };
        store.broker().with_tx("marshal", "store.init", |conn| {
            db::ensure_schema(conn)
        })?;
        Ok(store)
    }

    /// Resolve the store root from `MARSHAL_STORE`, falling back to `./.marshal`.
    pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(STORE_ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => PathBuf::from(DEFAULT_STORE_DIR),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        db::marshal_db_path(&self.root)
    }

    pub fn broker(&self) -> DbBroker {
        DbBroker::new(&self.db_path())
    }
}
