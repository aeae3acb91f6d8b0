//! Facility (workspace) registry and its single-owner lock.
//!
//! The lock is one nullable column, `facilities.locked_by_directive_id`,
//! taken with a single conditional `UPDATE`. It never waits: a held lock
//! fails fast with `lock_conflict`. A lock whose holder is terminal (or no
//! longer points at this facility) is stale and may be taken over.

use crate::core::error::MarshalError;
use crate::core::time;
use crate::plugins::directive::DirectiveState;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FacilityRecord {
    pub id: String,
    pub account_id: String,
    pub owner_id: String,
    pub territory_id: Option<String>,
    pub name: String,
    pub mount_path: String,
    pub locked_by_directive_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn create_facility(
    conn: &Connection,
    account_id: &str,
    owner_id: &str,
    territory_id: Option<&str>,
    name: &str,
    mount_path: &str,
    now: i64,
) -> Result<FacilityRecord, MarshalError> {
    if name.trim().is_empty() || mount_path.trim().is_empty() {
        return Err(MarshalError::InvalidParam(
            "facility name and mount_path are required".to_string(),
        ));
    }
    let id = time::new_id();
    conn.execute(
        "INSERT INTO facilities(id, account_id, owner_id, territory_id, name, mount_path, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![id, account_id, owner_id, territory_id, name, mount_path, now],
    )?;
    require_facility(conn, &id)
}

pub fn get_facility(conn: &Connection, id: &str) -> Result<Option<FacilityRecord>, MarshalError> {
    let record = conn
        .query_row(
            "SELECT id, account_id, owner_id, territory_id, name, mount_path,
                    locked_by_directive_id, created_at, updated_at
             FROM facilities WHERE id = ?1",
            [id],
            |row| {
                Ok(FacilityRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    owner_id: row.get(2)?,
                    territory_id: row.get(3)?,
                    name: row.get(4)?,
                    mount_path: row.get(5)?,
                    locked_by_directive_id: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

pub fn require_facility(conn: &Connection, id: &str) -> Result<FacilityRecord, MarshalError> {
    get_facility(conn, id)?
        .ok_or_else(|| MarshalError::NotFound(format!("facility {} not found", id)))
}

/// The directive currently holding the facility, ignoring stale locks.
pub fn active_holder(conn: &Connection, facility_id: &str) -> Result<Option<String>, MarshalError> {
    let sql = format!(
        "SELECT f.locked_by_directive_id FROM facilities f
         JOIN directives d ON d.id = f.locked_by_directive_id AND d.facility_id = f.id
         WHERE f.id = ?1 AND d.state NOT IN {}",
        DirectiveState::TERMINAL_SQL
    );
    let holder = conn
        .query_row(&sql, [facility_id], |row| row.get::<_, String>(0))
        .optional()?;
    Ok(holder)
}

/// Take the facility lock for `directive_id`. Re-locking by the same
/// directive is a no-op.
pub fn lock(
    conn: &Connection,
    facility_id: &str,
    directive_id: &str,
    now: i64,
) -> Result<(), MarshalError> {
    let owner_facility: Option<String> = conn
        .query_row(
            "SELECT facility_id FROM directives WHERE id = ?1",
            [directive_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner_facility {
        None => {
            return Err(MarshalError::NotFound(format!(
                "directive {} not found",
                directive_id
            )));
        }
        Some(f) if f != facility_id => {
            return Err(MarshalError::InvalidParam(format!(
                "directive {} does not operate on facility {}",
                directive_id, facility_id
            )));
        }
        Some(_) => {}
    }

    let sql = format!(
        "UPDATE facilities SET locked_by_directive_id = ?1, updated_at = ?2
         WHERE id = ?3 AND (
            locked_by_directive_id IS NULL
            OR locked_by_directive_id = ?1
            OR NOT EXISTS (
                SELECT 1 FROM directives d
                WHERE d.id = facilities.locked_by_directive_id
                  AND d.facility_id = facilities.id
                  AND d.state NOT IN {}
            )
         )",
        DirectiveState::TERMINAL_SQL
    );
    let changed = conn.execute(&sql, params![directive_id, now, facility_id])?;
    if changed == 1 {
        return Ok(());
    }

    let facility = require_facility(conn, facility_id)?;
    Err(MarshalError::LockConflict {
        facility_id: facility_id.to_string(),
        holder: facility.locked_by_directive_id.unwrap_or_default(),
    })
}

/// Release the lock iff `directive_id` holds it. Returns whether it did.
pub fn unlock(
    conn: &Connection,
    facility_id: &str,
    directive_id: &str,
    now: i64,
) -> Result<bool, MarshalError> {
    let changed = conn.execute(
        "UPDATE facilities SET locked_by_directive_id = NULL, updated_at = ?1
         WHERE id = ?2 AND locked_by_directive_id = ?3",
        params![now, facility_id, directive_id],
    )?;
    Ok(changed == 1)
}
