//! Registry of accounts and territories, plus the wake-up boundary.
//!
//! Territories are never hard-deleted. Apart from registration and the
//! operator's enable/disable switch, a territory row changes only through
//! its own health reports.

use crate::core::error::MarshalError;
use crate::core::time;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DISABLED: &str = "disabled";
pub const HEALTH_UNHEALTHY: &str = "unhealthy";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

pub fn create_account(conn: &Connection, name: &str, now: i64) -> Result<AccountRecord, MarshalError> {
    if name.trim().is_empty() {
        return Err(MarshalError::InvalidParam(
            "account name cannot be empty".to_string(),
        ));
    }
    let id = time::new_id();
    conn.execute(
        "INSERT INTO accounts(id, name, created_at) VALUES (?1, ?2, ?3)",
        params![id, name, now],
    )?;
    Ok(AccountRecord {
        id,
        name: name.to_string(),
        created_at: now,
    })
}

pub fn require_account(conn: &Connection, id: &str) -> Result<AccountRecord, MarshalError> {
    conn.query_row(
        "SELECT id, name, created_at FROM accounts WHERE id = ?1",
        [id],
        |row| {
            Ok(AccountRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| MarshalError::NotFound(format!("account {} not found", id)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerritoryKind {
    Server,
    Desktop,
    Mobile,
    Bridge,
}

impl TerritoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TerritoryKind::Server => "server",
            TerritoryKind::Desktop => "desktop",
            TerritoryKind::Mobile => "mobile",
            TerritoryKind::Bridge => "bridge",
        }
    }
}

impl fmt::Display for TerritoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerritoryKind {
    type Err = MarshalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(TerritoryKind::Server),
            "desktop" => Ok(TerritoryKind::Desktop),
            "mobile" => Ok(TerritoryKind::Mobile),
            "bridge" => Ok(TerritoryKind::Bridge),
            other => Err(MarshalError::InvalidParam(format!(
                "unknown territory kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerritoryRecord {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub kind: TerritoryKind,
    pub status: String,
    pub capabilities: Vec<String>,
    pub max_concurrency: i64,
    /// sandbox driver -> last reported health (`healthy`, `unhealthy`, ...)
    pub sandbox_health: BTreeMap<String, String>,
    pub last_heartbeat_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TerritoryRecord {
    pub fn is_disabled(&self) -> bool {
        self.status == STATUS_DISABLED
    }

    /// Absent health data counts as healthy.
    pub fn driver_healthy(&self, driver: &str) -> bool {
        self.sandbox_health
            .get(driver)
            .is_none_or(|h| h != HEALTH_UNHEALTHY)
    }
}

fn row_to_territory(row: &Row<'_>) -> rusqlite::Result<TerritoryRecord> {
    let kind: String = row.get(3)?;
    let capabilities: String = row.get(5)?;
    let health: String = row.get(7)?;
    Ok(TerritoryRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        kind: kind
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        status: row.get(4)?,
        capabilities: serde_json::from_str(&capabilities)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        max_concurrency: row.get(6)?,
        sandbox_health: serde_json::from_str(&health)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?,
        last_heartbeat_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn get_territory(conn: &Connection, id: &str) -> Result<Option<TerritoryRecord>, MarshalError> {
    let record = conn
        .query_row(
            "SELECT id, account_id, name, kind, status, capabilities, max_concurrency,
                    sandbox_health, last_heartbeat_at, created_at, updated_at
             FROM territories WHERE id = ?1",
            [id],
            row_to_territory,
        )
        .optional()?;
    Ok(record)
}

pub fn require_territory(conn: &Connection, id: &str) -> Result<TerritoryRecord, MarshalError> {
    get_territory(conn, id)?
        .ok_or_else(|| MarshalError::NotFound(format!("territory {} not found", id)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTerritory {
    pub account_id: String,
    pub name: String,
    pub kind: TerritoryKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: i64,
}

fn default_concurrency() -> i64 {
    1
}

pub fn register_territory(
    conn: &Connection,
    req: &RegisterTerritory,
    now: i64,
) -> Result<TerritoryRecord, MarshalError> {
    require_account(conn, &req.account_id)?;
    if req.max_concurrency < 1 {
        return Err(MarshalError::InvalidParam(
            "max_concurrency must be at least 1".to_string(),
        ));
    }
    let id = time::new_id();
    conn.execute(
        "INSERT INTO territories(id, account_id, name, kind, status, capabilities, max_concurrency,
            sandbox_health, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8, ?8)",
        params![
            id,
            req.account_id,
            req.name,
            req.kind.as_str(),
            STATUS_ACTIVE,
            serde_json::to_string(&req.capabilities)?,
            req.max_concurrency,
            now
        ],
    )?;
    require_territory(conn, &id)
}

/// A territory's own periodic report: health per sandbox driver and,
/// optionally, a new concurrency capacity.
pub fn report_health(
    conn: &Connection,
    territory_id: &str,
    sandbox_health: &BTreeMap<String, String>,
    max_concurrency: Option<i64>,
    now: i64,
) -> Result<TerritoryRecord, MarshalError> {
    if max_concurrency.is_some_and(|c| c < 1) {
        return Err(MarshalError::InvalidParam(
            "max_concurrency must be at least 1".to_string(),
        ));
    }
    let changed = conn.execute(
        "UPDATE territories SET sandbox_health = ?1,
            max_concurrency = COALESCE(?2, max_concurrency),
            last_heartbeat_at = ?3, updated_at = ?3
         WHERE id = ?4",
        params![serde_json::to_string(sandbox_health)?, max_concurrency, now, territory_id],
    )?;
    if changed == 0 {
        return Err(MarshalError::NotFound(format!(
            "territory {} not found",
            territory_id
        )));
    }
    require_territory(conn, territory_id)
}

pub fn set_status(conn: &Connection, territory_id: &str, status: &str, now: i64) -> Result<(), MarshalError> {
    if status != STATUS_ACTIVE && status != STATUS_DISABLED {
        return Err(MarshalError::InvalidParam(format!(
            "unknown territory status '{}'",
            status
        )));
    }
    let changed = conn.execute(
        "UPDATE territories SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now, territory_id],
    )?;
    if changed == 0 {
        return Err(MarshalError::NotFound(format!(
            "territory {} not found",
            territory_id
        )));
    }
    Ok(())
}

/// Who should be nudged when work becomes claimable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeTarget {
    Territory(String),
    Account(String),
}

/// Push-notification boundary. Implementations must not block for long;
/// errors are logged by the caller and otherwise ignored.
pub trait WakeNotifier: Send + Sync {
    fn notify(&self, target: &WakeTarget) -> Result<(), MarshalError>;
}

/// Default notifier: records the wake-up as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl WakeNotifier for LogNotifier {
    fn notify(&self, target: &WakeTarget) -> Result<(), MarshalError> {
        match target {
            WakeTarget::Territory(id) => tracing::info!(territory = %id, "wake-up"),
            WakeTarget::Account(id) => tracing::info!(account = %id, "wake-up"),
        }
        Ok(())
    }
}

/// Fire a wake-up, swallowing failures.
pub fn wake(notifier: &dyn WakeNotifier, target: WakeTarget) {
    if let Err(err) = notifier.notify(&target) {
        tracing::warn!(wake_target = ?target, error = %err, "wake-up notification failed");
    }
}
