//! AuditService: append-only record of lifecycle and security events.
//!
//! Writes are best-effort. A failed insert is logged and swallowed so the
//! request that triggered it still commits.

use crate::core::error::MarshalError;
use crate::core::time;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Requester,
    Territory,
    System,
}

impl ActorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorKind::Requester => "requester",
            ActorKind::Territory => "territory",
            ActorKind::System => "system",
        }
    }

    fn parse(raw: &str) -> ActorKind {
        match raw {
            "requester" => ActorKind::Requester,
            "territory" => ActorKind::Territory,
            _ => ActorKind::System,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub ts: i64,
    pub account_id: Option<String>,
    pub actor_kind: ActorKind,
    pub actor_id: Option<String>,
    pub action: String,
    pub subject_kind: String,
    pub subject_id: String,
    pub payload: JsonValue,
}

/// Builder-style input for [`AuditService::record`].
#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub account_id: Option<&'a str>,
    pub actor_kind: ActorKind,
    pub actor_id: Option<&'a str>,
    pub action: &'a str,
    pub subject_kind: &'a str,
    pub subject_id: &'a str,
    pub payload: JsonValue,
}

impl<'a> AuditEntry<'a> {
    pub fn directive(action: &'a str, directive_id: &'a str) -> Self {
        Self {
            account_id: None,
            actor_kind: ActorKind::System,
            actor_id: None,
            action,
            subject_kind: "directive",
            subject_id: directive_id,
            payload: JsonValue::Object(Default::default()),
        }
    }

    pub fn account(mut self, account_id: &'a str) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn actor(mut self, kind: ActorKind, id: Option<&'a str>) -> Self {
        self.actor_kind = kind;
        self.actor_id = id;
        self
    }

    pub fn payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }
}

pub struct AuditService;

impl AuditService {
    /// Append an event. Never fails the caller.
    pub fn record(conn: &Connection, entry: AuditEntry<'_>, now: i64) {
        if let Err(err) = Self::try_record(conn, &entry, now) {
            tracing::warn!(
                action = entry.action,
                subject = entry.subject_id,
                error = %err,
                "audit write failed"
            );
        }
    }

    fn try_record(conn: &Connection, entry: &AuditEntry<'_>, now: i64) -> Result<(), MarshalError> {
        conn.execute(
            "INSERT INTO audit_events(id, ts, account_id, actor_kind, actor_id, action, subject_kind, subject_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                time::new_id(),
                now,
                entry.account_id,
                entry.actor_kind.as_str(),
                entry.actor_id,
                entry.action,
                entry.subject_kind,
                entry.subject_id,
                serde_json::to_string(&entry.payload)?,
            ],
        )?;
        Ok(())
    }

    /// Events in insertion order, optionally for one subject.
    pub fn list(conn: &Connection, subject_id: Option<&str>) -> Result<Vec<AuditEvent>, MarshalError> {
        let mut stmt = conn.prepare(
            "SELECT id, ts, account_id, actor_kind, actor_id, action, subject_kind, subject_id, payload
             FROM audit_events
             WHERE ?1 IS NULL OR subject_id = ?1
             ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![subject_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, ts, account_id, actor_kind, actor_id, action, subject_kind, subject_id, payload) =
                row?;
            out.push(AuditEvent {
                id,
                ts,
                account_id,
                actor_kind: ActorKind::parse(&actor_kind),
                actor_id,
                action,
                subject_kind,
                subject_id,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(out)
    }
}
