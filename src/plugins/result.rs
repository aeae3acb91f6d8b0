//! ResultReporting: idempotent terminal transition with content hashing.
//!
//! A `finished` report is hashed over a key-sorted JSON form. Diff bytes are
//! left out of the hash; their sha256 and size are included. Replaying the
//! same report is a duplicate; a different report on a terminal directive is
//! a conflict.

use crate::core::error::MarshalError;
use crate::plugins::audit::{ActorKind, AuditEntry, AuditService};
use crate::plugins::directive::{self, DirectiveState, FinishStatus};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FinishedReport {
    pub status: FinishStatus,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(default)]
    pub before_snapshot: Option<JsonValue>,
    #[serde(default)]
    pub after_snapshot: Option<JsonValue>,
    #[serde(default)]
    pub manifest: Option<JsonValue>,
}

impl FinishedReport {
    pub fn new(status: FinishStatus) -> Self {
        Self {
            status,
            exit_code: None,
            stdout_truncated: false,
            stderr_truncated: false,
            before_snapshot: None,
            after_snapshot: None,
            manifest: None,
        }
    }

    /// The stored form of the report, with object keys sorted at every level.
    pub fn canonical_value(&self, diff: Option<&DiffRef>) -> JsonValue {
        normalize_json_value(&json!({
            "status": self.status.as_str(),
            "exit_code": self.exit_code,
            "stdout_truncated": self.stdout_truncated,
            "stderr_truncated": self.stderr_truncated,
            "before_snapshot": self.before_snapshot,
            "after_snapshot": self.after_snapshot,
            "manifest": self.manifest,
            "diff": diff,
        }))
    }

    pub fn canonical_hash_hex(&self, diff: Option<&DiffRef>) -> Result<String, MarshalError> {
        let bytes = serde_json::to_vec(&self.canonical_value(diff))?;
        Ok(sha256_hex(&bytes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffRef {
    pub sha256: String,
    pub size: i64,
}

impl DiffRef {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            sha256: sha256_hex(bytes),
            size: bytes.len() as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinishedOutcome {
    pub final_state: DirectiveState,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffOutcome {
    pub sha256: String,
    pub size: i64,
    pub duplicate: bool,
}

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

fn normalize_json_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut normalized = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                normalized.insert(key.clone(), normalize_json_value(&map[key]));
            }
            JsonValue::Object(normalized)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(normalize_json_value).collect()),
        _ => value.clone(),
    }
}

pub struct ResultReporter {
    max_diff_bytes: usize,
}

impl ResultReporter {
    pub fn new(max_diff_bytes: usize) -> Self {
        Self { max_diff_bytes }
    }

    fn check_diff_size(&self, diff: &[u8]) -> Result<(), MarshalError> {
        if diff.len() > self.max_diff_bytes {
            return Err(MarshalError::InvalidParam(format!(
                "diff of {} bytes exceeds the {} byte limit",
                diff.len(),
                self.max_diff_bytes
            )));
        }
        Ok(())
    }

    pub fn finish(
        &self,
        conn: &Connection,
        directive_id: &str,
        territory_id: &str,
        report: &FinishedReport,
        diff: Option<&[u8]>,
        now: i64,
    ) -> Result<FinishedOutcome, MarshalError> {
        if let Some(bytes) = diff {
            self.check_diff_size(bytes)?;
        }
        let diff_ref = diff.map(DiffRef::of);
        let hash = report.canonical_hash_hex(diff_ref.as_ref())?;

        let rec = directive::require_directive(conn, directive_id)?;
        if rec.state.is_terminal() {
            if rec.result_hash.as_deref() == Some(hash.as_str()) {
                return Ok(FinishedOutcome {
                    final_state: rec.state,
                    duplicate: true,
                });
            }
            return Err(MarshalError::InvalidState(format!(
                "directive {} already finished as {} with a different report",
                directive_id, rec.state
            )));
        }

        let final_state = directive::finish(conn, directive_id, report.status, true, now)?;
        directive::record_result(
            conn,
            directive_id,
            &hash,
            &report.canonical_value(diff_ref.as_ref()),
            report.status,
            report.exit_code,
            report.stdout_truncated,
            report.stderr_truncated,
        )?;
        if let Some(bytes) = diff {
            self.store_diff(conn, directive_id, bytes)?;
        }

        AuditService::record(
            conn,
            AuditEntry::directive("directive.finished", directive_id)
                .account(&rec.account_id)
                .actor(ActorKind::Territory, Some(territory_id))
                .payload(json!({
                    "status": report.status.as_str(),
                    "exit_code": report.exit_code,
                    "result_hash": hash,
                })),
            now,
        );
        tracing::info!(directive = directive_id, state = %final_state, "directive finished");

        Ok(FinishedOutcome {
            final_state,
            duplicate: false,
        })
    }

    /// Attach diff bytes. Identical bytes are a silent match; different
    /// bytes after one is stored are a conflict.
    pub fn attach_diff(
        &self,
        conn: &Connection,
        directive_id: &str,
        bytes: &[u8],
    ) -> Result<DiffOutcome, MarshalError> {
        self.check_diff_size(bytes)?;
        directive::require_directive(conn, directive_id)?;
        self.store_diff(conn, directive_id, bytes)
    }

    fn store_diff(
        &self,
        conn: &Connection,
        directive_id: &str,
        bytes: &[u8],
    ) -> Result<DiffOutcome, MarshalError> {
        let incoming = DiffRef::of(bytes);
        let changed = conn.execute(
            "UPDATE directives SET diff_sha256 = ?1, diff_size = ?2, diff_blob = ?3
             WHERE id = ?4 AND diff_sha256 IS NULL",
            params![incoming.sha256, incoming.size, bytes, directive_id],
        )?;
        if changed == 1 {
            return Ok(DiffOutcome {
                sha256: incoming.sha256,
                size: incoming.size,
                duplicate: false,
            });
        }

        let rec = directive::require_directive(conn, directive_id)?;
        match rec.diff_sha256 {
            Some(stored) if stored == incoming.sha256 => Ok(DiffOutcome {
                sha256: stored,
                size: incoming.size,
                duplicate: true,
            }),
            Some(stored) => Err(MarshalError::InvalidState(format!(
                "directive {} already has a different diff ({})",
                directive_id, stored
            ))),
            None => Err(MarshalError::InvalidState(format!(
                "diff for directive {} could not be stored",
                directive_id
            ))),
        }
    }
}
