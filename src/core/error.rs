use rusqlite;
use std::io;
use thiserror::Error;

/// Why a directive-scoped call was refused. Territories react differently:
/// an expired token is renewed, the others mean the work is no longer theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    TokenExpired,
    TokenInvalid,
    BindingMismatch,
    LeaseLost,
}

impl AuthFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthFailure::TokenExpired => "token_expired",
            AuthFailure::TokenInvalid => "token_invalid",
            AuthFailure::BindingMismatch => "binding_mismatch",
            AuthFailure::LeaseLost => "lease_lost",
        }
    }
}

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Config parse error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Unauthorized: {message}")]
    Unauthorized { reason: AuthFailure, message: String },
    #[error("Facility {facility_id} is locked by directive {holder}")]
    LockConflict { facility_id: String, holder: String },
}

impl MarshalError {
    /// Stable wire code for the error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            MarshalError::InvalidState(_) => "invalid_state",
            MarshalError::InvalidParam(_) => "invalid_param",
            MarshalError::NotFound(_) => "not_found",
            MarshalError::Forbidden(_) => "forbidden",
            MarshalError::Unauthorized { .. } => "unauthorized",
            MarshalError::LockConflict { .. } => "lock_conflict",
            MarshalError::Config(_) | MarshalError::TomlError(_) => "config",
            MarshalError::RusqliteError(_)
            | MarshalError::IoError(_)
            | MarshalError::SerdeError(_) => "internal",
        }
    }

    pub fn unauthorized(reason: AuthFailure, message: impl Into<String>) -> Self {
        MarshalError::Unauthorized {
            reason,
            message: message.into(),
        }
    }

    /// Sub-reason carried next to the wire code, if any.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            MarshalError::Unauthorized { reason, .. } => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            MarshalError::RusqliteError(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    }
}
