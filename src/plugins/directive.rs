//! Directive entity and its explicit state machine.
//!
//! Every state change goes through [`transition`] (the from-state × action
//! table) and is persisted with a compare-and-swap `UPDATE … WHERE state = ?`
//! so two writers can never both move the same row out of the same state.

use crate::core::db::bool_to_sql;
use crate::core::error::MarshalError;
use crate::plugins::facility;
use crate::plugins::policy::{Capabilities, PolicySnapshot, RequestedCapabilities};
use rusqlite::types::{ToSql, Type};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

pub const MAX_TIMEOUT_SECONDS: i64 = 86_400;
pub const KNOWN_SHELLS: &[&str] = &["sh", "bash", "zsh", "pwsh"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveState {
    Queued,
    AwaitingApproval,
    Leased,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl DirectiveState {
    pub const ALL: [DirectiveState; 8] = [
        DirectiveState::Queued,
        DirectiveState::AwaitingApproval,
        DirectiveState::Leased,
        DirectiveState::Running,
        DirectiveState::Succeeded,
        DirectiveState::Failed,
        DirectiveState::Canceled,
        DirectiveState::TimedOut,
    ];

    pub const TERMINAL_SQL: &'static str = "('succeeded','failed','canceled','timed_out')";

    pub fn as_str(self) -> &'static str {
        match self {
            DirectiveState::Queued => "queued",
            DirectiveState::AwaitingApproval => "awaiting_approval",
            DirectiveState::Leased => "leased",
            DirectiveState::Running => "running",
            DirectiveState::Succeeded => "succeeded",
            DirectiveState::Failed => "failed",
            DirectiveState::Canceled => "canceled",
            DirectiveState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DirectiveState::Succeeded
                | DirectiveState::Failed
                | DirectiveState::Canceled
                | DirectiveState::TimedOut
        )
    }
}

impl fmt::Display for DirectiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirectiveState {
    type Err = MarshalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DirectiveState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| MarshalError::InvalidParam(format!("unknown directive state '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveAction {
    Lease,
    Start,
    Heartbeat,
    Succeed,
    Fail,
    Cancel,
    TimeOut,
    ExpireLease,
    Approve,
    Reject,
}

impl DirectiveAction {
    pub const ALL: [DirectiveAction; 10] = [
        DirectiveAction::Lease,
        DirectiveAction::Start,
        DirectiveAction::Heartbeat,
        DirectiveAction::Succeed,
        DirectiveAction::Fail,
        DirectiveAction::Cancel,
        DirectiveAction::TimeOut,
        DirectiveAction::ExpireLease,
        DirectiveAction::Approve,
        DirectiveAction::Reject,
    ];
}

/// Outcome of looking up a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(DirectiveState),
    /// Allowed, but the state does not change (heartbeat, idempotent start).
    Stay,
}

/// The transition table. Anything not listed is `invalid_state`.
pub fn transition(
    from: DirectiveState,
    action: DirectiveAction,
) -> Result<Transition, MarshalError> {
    use DirectiveAction as A;
    use DirectiveState as S;

    let next = match (from, action) {
        (S::Queued, A::Lease) => Transition::To(S::Leased),
        (S::Leased, A::Start) => Transition::To(S::Running),
        (S::Running, A::Start) => Transition::Stay,
        (s, A::Start) if s.is_terminal() => Transition::Stay,
        (S::Running, A::Heartbeat) => Transition::Stay,
        (S::Running, A::Succeed) => Transition::To(S::Succeeded),
        (S::Running, A::Fail) => Transition::To(S::Failed),
        (S::Running, A::TimeOut) => Transition::To(S::TimedOut),
        (S::Queued | S::Leased | S::Running, A::Cancel) => Transition::To(S::Canceled),
        (S::Leased, A::ExpireLease) => Transition::To(S::Queued),
        (S::AwaitingApproval, A::Approve) => Transition::To(S::Queued),
        (S::AwaitingApproval, A::Reject) => Transition::To(S::Canceled),
        (from, action) => {
            return Err(MarshalError::InvalidState(format!(
                "cannot {:?} a directive in state {}",
                action, from
            )));
        }
    };
    Ok(next)
}

/// Terminal status reported by a territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl FinishStatus {
    pub fn action(self) -> DirectiveAction {
        match self {
            FinishStatus::Succeeded => DirectiveAction::Succeed,
            FinishStatus::Failed => DirectiveAction::Fail,
            FinishStatus::Canceled => DirectiveAction::Cancel,
            FinishStatus::TimedOut => DirectiveAction::TimeOut,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.state().as_str()
    }

    pub fn state(self) -> DirectiveState {
        match self {
            FinishStatus::Succeeded => DirectiveState::Succeeded,
            FinishStatus::Failed => DirectiveState::Failed,
            FinishStatus::Canceled => DirectiveState::Canceled,
            FinishStatus::TimedOut => DirectiveState::TimedOut,
        }
    }
}

impl FromStr for FinishStatus {
    type Err = MarshalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(FinishStatus::Succeeded),
            "failed" => Ok(FinishStatus::Failed),
            "canceled" => Ok(FinishStatus::Canceled),
            "timed_out" => Ok(FinishStatus::TimedOut),
            other => Err(MarshalError::InvalidParam(format!(
                "unknown finish status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectiveRecord {
    pub id: String,
    pub account_id: String,
    pub facility_id: String,
    pub requester_id: String,
    pub command: String,
    pub shell: String,
    pub cwd: String,
    pub sandbox_profile: String,
    pub timeout_seconds: i64,
    pub requested_capabilities: RequestedCapabilities,
    pub effective_capabilities: Capabilities,
    pub policy_snapshot: PolicySnapshot,
    pub state: DirectiveState,
    pub territory_id: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub cancel_requested_at: Option<i64>,
    pub sandbox_version: Option<String>,
    pub nexus_version: Option<String>,
    pub result_hash: Option<String>,
    pub result_payload: Option<JsonValue>,
    pub finished_status: Option<String>,
    pub exit_code: Option<i64>,
    pub stdout_bytes: i64,
    pub stderr_bytes: i64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub diff_sha256: Option<String>,
    pub diff_size: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DirectiveRecord {
    pub fn total_log_bytes(&self) -> i64 {
        self.stdout_bytes + self.stderr_bytes
    }
}

/// Requester input for a new directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDirective {
    pub account_id: String,
    pub facility_id: String,
    pub requester_id: String,
    pub command: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    pub sandbox_profile: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub requested_capabilities: RequestedCapabilities,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_cwd() -> String {
    ".".to_string()
}

fn default_timeout() -> i64 {
    3_600
}

impl CreateDirective {
    pub fn validate(&self) -> Result<(), MarshalError> {
        if self.command.trim().is_empty() {
            return Err(MarshalError::InvalidParam(
                "command cannot be empty".to_string(),
            ));
        }
        if !KNOWN_SHELLS.contains(&self.shell.as_str()) {
            return Err(MarshalError::InvalidParam(format!(
                "unsupported shell '{}'",
                self.shell
            )));
        }
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds) {
            return Err(MarshalError::InvalidParam(format!(
                "timeout_seconds must be within 1..={}",
                MAX_TIMEOUT_SECONDS
            )));
        }
        if self.sandbox_profile.trim().is_empty() {
            return Err(MarshalError::InvalidParam(
                "sandbox_profile cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

const DIRECTIVE_COLUMNS: &str = "id, account_id, facility_id, requester_id, command, shell, cwd,
    sandbox_profile, timeout_seconds, requested_capabilities, effective_capabilities,
    policy_snapshot, state, territory_id, lease_expires_at, last_heartbeat_at, started_at,
    finished_at, cancel_requested_at, sandbox_version, nexus_version, result_hash,
    result_payload, finished_status, exit_code, stdout_bytes, stderr_bytes, stdout_truncated,
    stderr_truncated, diff_sha256, diff_size, created_at, updated_at";

fn conversion_failure<E>(row: &Row<'_>, name: &str, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let idx = row.as_ref().column_index(name).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, name: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| conversion_failure(row, name, e))
}

fn row_to_directive(row: &Row<'_>) -> rusqlite::Result<DirectiveRecord> {
    let state_raw: String = row.get("state")?;
    let state = state_raw
        .parse::<DirectiveState>()
        .map_err(|e| conversion_failure(row, "state", e))?;
    let result_payload: Option<String> = row.get("result_payload")?;
    let result_payload = result_payload
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| conversion_failure(row, "result_payload", e))?;

    Ok(DirectiveRecord {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        facility_id: row.get("facility_id")?,
        requester_id: row.get("requester_id")?,
        command: row.get("command")?,
        shell: row.get("shell")?,
        cwd: row.get("cwd")?,
        sandbox_profile: row.get("sandbox_profile")?,
        timeout_seconds: row.get("timeout_seconds")?,
        requested_capabilities: json_col(row, "requested_capabilities")?,
        effective_capabilities: json_col(row, "effective_capabilities")?,
        policy_snapshot: json_col(row, "policy_snapshot")?,
        state,
        territory_id: row.get("territory_id")?,
        lease_expires_at: row.get("lease_expires_at")?,
        last_heartbeat_at: row.get("last_heartbeat_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        cancel_requested_at: row.get("cancel_requested_at")?,
        sandbox_version: row.get("sandbox_version")?,
        nexus_version: row.get("nexus_version")?,
        result_hash: row.get("result_hash")?,
        result_payload,
        finished_status: row.get("finished_status")?,
        exit_code: row.get("exit_code")?,
        stdout_bytes: row.get("stdout_bytes")?,
        stderr_bytes: row.get("stderr_bytes")?,
        stdout_truncated: row.get::<_, i64>("stdout_truncated")? != 0,
        stderr_truncated: row.get::<_, i64>("stderr_truncated")? != 0,
        diff_sha256: row.get("diff_sha256")?,
        diff_size: row.get("diff_size")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn get_directive(conn: &Connection, id: &str) -> Result<Option<DirectiveRecord>, MarshalError> {
    let sql = format!("SELECT {} FROM directives WHERE id = ?1", DIRECTIVE_COLUMNS);
    let record = conn.query_row(&sql, [id], row_to_directive).optional()?;
    Ok(record)
}

pub fn require_directive(conn: &Connection, id: &str) -> Result<DirectiveRecord, MarshalError> {
    get_directive(conn, id)?
        .ok_or_else(|| MarshalError::NotFound(format!("directive {} not found", id)))
}

pub fn list_directives(
    conn: &Connection,
    account_id: &str,
    state: Option<DirectiveState>,
) -> Result<Vec<DirectiveRecord>, MarshalError> {
    let mut sql = format!(
        "SELECT {} FROM directives WHERE account_id = ?1",
        DIRECTIVE_COLUMNS
    );
    let state_str = state.map(|s| s.as_str());
    let mut params: Vec<&dyn ToSql> = vec![&account_id];
    if let Some(s) = state_str.as_ref() {
        sql.push_str(" AND state = ?2");
        params.push(s);
    }
    sql.push_str(" ORDER BY created_at ASC, rowid ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), row_to_directive)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Queued candidates for a claim, oldest first.
pub fn queued_candidates(
    conn: &Connection,
    account_id: &str,
    profiles: &[String],
    limit: u32,
) -> Result<Vec<DirectiveRecord>, MarshalError> {
    if profiles.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (0..profiles.len()).map(|i| format!("?{}", i + 3)).collect();
    let sql = format!(
        "SELECT {} FROM directives
         WHERE state = 'queued' AND account_id = ?1 AND sandbox_profile IN ({})
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2",
        DIRECTIVE_COLUMNS,
        placeholders.join(", ")
    );
    let limit = i64::from(limit);
    let mut params: Vec<&dyn ToSql> = vec![&account_id, &limit];
    for profile in profiles {
        params.push(profile);
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), row_to_directive)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn insert_directive(conn: &Connection, rec: &DirectiveRecord) -> Result<(), MarshalError> {
    conn.execute(
        "INSERT INTO directives(id, account_id, facility_id, requester_id, command, shell, cwd,
            sandbox_profile, timeout_seconds, requested_capabilities, effective_capabilities,
            policy_snapshot, state, cancel_requested_at, finished_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            rec.id,
            rec.account_id,
            rec.facility_id,
            rec.requester_id,
            rec.command,
            rec.shell,
            rec.cwd,
            rec.sandbox_profile,
            rec.timeout_seconds,
            serde_json::to_string(&rec.requested_capabilities)?,
            serde_json::to_string(&rec.effective_capabilities)?,
            serde_json::to_string(&rec.policy_snapshot)?,
            rec.state.as_str(),
            rec.cancel_requested_at,
            rec.finished_at,
            rec.created_at,
            rec.updated_at,
        ],
    )?;
    Ok(())
}

/// Persist `from -> to` only if the row is still in `from`.
///
/// `extra_sql` is a list of `, col = ?N` assignments whose placeholders start
/// at `?5`.
fn compare_and_set(
    conn: &Connection,
    id: &str,
    from: DirectiveState,
    to: DirectiveState,
    now: i64,
    extra_sql: &str,
    extra: &[&dyn ToSql],
) -> Result<(), MarshalError> {
    let sql = format!(
        "UPDATE directives SET state = ?1, updated_at = ?2{} WHERE id = ?3 AND state = ?4",
        extra_sql
    );
    let to_str = to.as_str();
    let from_str = from.as_str();
    let mut params: Vec<&dyn ToSql> = vec![&to_str, &now, &id, &from_str];
    params.extend_from_slice(extra);
    let changed = conn.execute(&sql, params.as_slice())?;
    if changed == 0 {
        return Err(MarshalError::InvalidState(format!(
            "directive {} is no longer {}",
            id, from
        )));
    }
    Ok(())
}

fn expect_to(from: DirectiveState, action: DirectiveAction) -> Result<DirectiveState, MarshalError> {
    match transition(from, action)? {
        Transition::To(next) => Ok(next),
        Transition::Stay => Ok(from),
    }
}

/// queued -> leased. The caller has already chosen the territory and expiry.
pub fn lease(
    conn: &Connection,
    id: &str,
    territory_id: &str,
    lease_expires_at: i64,
    now: i64,
) -> Result<(), MarshalError> {
    let rec = require_directive(conn, id)?;
    let to = expect_to(rec.state, DirectiveAction::Lease)?;
    compare_and_set(
        conn,
        id,
        rec.state,
        to,
        now,
        ", territory_id = ?5, lease_expires_at = ?6, last_heartbeat_at = NULL",
        params![territory_id, lease_expires_at],
    )
}

/// leased -> queued with lease bookkeeping cleared; the facility lock is
/// released if this directive holds it.
fn return_to_queue(conn: &Connection, rec: &DirectiveRecord, now: i64) -> Result<(), MarshalError> {
    let to = expect_to(rec.state, DirectiveAction::ExpireLease)?;
    compare_and_set(
        conn,
        &rec.id,
        rec.state,
        to,
        now,
        ", territory_id = NULL, lease_expires_at = NULL, last_heartbeat_at = NULL",
        params![],
    )?;
    facility::unlock(conn, &rec.facility_id, &rec.id, now)?;
    Ok(())
}

/// Undo a lease whose facility lock could not be taken.
pub fn revert_lease(conn: &Connection, id: &str, now: i64) -> Result<(), MarshalError> {
    let rec = require_directive(conn, id)?;
    return_to_queue(conn, &rec, now)
}

/// Reaper-only: return an expired lease to the queue.
///
/// Returns `false` (no-op) unless the directive is still `leased` and its
/// lease has passed at `now`.
pub fn expire_lease(conn: &Connection, id: &str, now: i64) -> Result<bool, MarshalError> {
    let rec = require_directive(conn, id)?;
    if rec.state != DirectiveState::Leased {
        return Ok(false);
    }
    match rec.lease_expires_at {
        Some(expires) if expires <= now => {}
        _ => return Ok(false),
    }
    return_to_queue(conn, &rec, now)?;
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub state: DirectiveState,
    pub duplicate: bool,
}

fn version_conflict(stored: &Option<String>, incoming: Option<&str>) -> bool {
    matches!((stored.as_deref(), incoming), (Some(a), Some(b)) if a != b)
}

/// leased -> running. Idempotent once running or terminal, unless the
/// reported sandbox/agent versions disagree with what was recorded.
pub fn start(
    conn: &Connection,
    id: &str,
    sandbox_version: Option<&str>,
    nexus_version: Option<&str>,
    lease_expires_at: i64,
    now: i64,
) -> Result<StartOutcome, MarshalError> {
    let rec = require_directive(conn, id)?;
    match transition(rec.state, DirectiveAction::Start)? {
        Transition::Stay => {
            if version_conflict(&rec.sandbox_version, sandbox_version)
                || version_conflict(&rec.nexus_version, nexus_version)
            {
                return Err(MarshalError::InvalidState(format!(
                    "directive {} already started with different versions",
                    id
                )));
            }
            Ok(StartOutcome {
                state: rec.state,
                duplicate: true,
            })
        }
        Transition::To(next) => {
            compare_and_set(
                conn,
                id,
                rec.state,
                next,
                now,
                ", started_at = ?5, last_heartbeat_at = ?5, lease_expires_at = ?6,
                   sandbox_version = ?7, nexus_version = ?8",
                params![now, lease_expires_at, sandbox_version, nexus_version],
            )?;
            Ok(StartOutcome {
                state: next,
                duplicate: false,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatOutcome {
    pub cancel_requested: bool,
    pub lease_expires_at: i64,
}

/// Valid only while running: renew the lease and surface the cancel flag.
pub fn heartbeat(
    conn: &Connection,
    id: &str,
    lease_expires_at: i64,
    now: i64,
) -> Result<HeartbeatOutcome, MarshalError> {
    let rec = require_directive(conn, id)?;
    transition(rec.state, DirectiveAction::Heartbeat)?;
    let changed = conn.execute(
        "UPDATE directives SET lease_expires_at = ?1, last_heartbeat_at = ?2, updated_at = ?2
         WHERE id = ?3 AND state = 'running'",
        params![lease_expires_at, now, id],
    )?;
    if changed == 0 {
        return Err(MarshalError::InvalidState(format!(
            "directive {} is no longer running",
            id
        )));
    }
    Ok(HeartbeatOutcome {
        cancel_requested: rec.cancel_requested_at.is_some(),
        lease_expires_at,
    })
}

/// Move a directive to a terminal state and release its facility.
///
/// A directive still `leased` is started first when the outcome is reported
/// by its territory (`implicit_start`), so a lost `started` never strands it.
pub fn finish(
    conn: &Connection,
    id: &str,
    status: FinishStatus,
    implicit_start: bool,
    now: i64,
) -> Result<DirectiveState, MarshalError> {
    let mut rec = require_directive(conn, id)?;
    if implicit_start && rec.state == DirectiveState::Leased {
        let lease = rec.lease_expires_at.unwrap_or(now);
        start(conn, id, None, None, lease, now)?;
        rec = require_directive(conn, id)?;
    }
    let to = expect_to(rec.state, status.action())?;
    compare_and_set(
        conn,
        id,
        rec.state,
        to,
        now,
        ", finished_at = ?5, lease_expires_at = NULL",
        params![now],
    )?;
    facility::unlock(conn, &rec.facility_id, id, now)?;
    Ok(to)
}

pub fn approve(conn: &Connection, id: &str, now: i64) -> Result<DirectiveState, MarshalError> {
    let rec = require_directive(conn, id)?;
    let to = expect_to(rec.state, DirectiveAction::Approve)?;
    compare_and_set(conn, id, rec.state, to, now, "", params![])?;
    Ok(to)
}

pub fn reject(conn: &Connection, id: &str, now: i64) -> Result<DirectiveState, MarshalError> {
    let rec = require_directive(conn, id)?;
    let to = expect_to(rec.state, DirectiveAction::Reject)?;
    compare_and_set(conn, id, rec.state, to, now, ", finished_at = ?5", params![now])?;
    Ok(to)
}

/// Set the cancel flag once; later calls keep the first timestamp.
pub fn set_cancel_requested(conn: &Connection, id: &str, now: i64) -> Result<(), MarshalError> {
    conn.execute(
        "UPDATE directives SET cancel_requested_at = COALESCE(cancel_requested_at, ?1), updated_at = ?1
         WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

pub fn update_effective_capabilities(
    conn: &Connection,
    id: &str,
    capabilities: &Capabilities,
    snapshot: &PolicySnapshot,
    now: i64,
) -> Result<(), MarshalError> {
    conn.execute(
        "UPDATE directives SET effective_capabilities = ?1, policy_snapshot = ?2, updated_at = ?3
         WHERE id = ?4",
        params![
            serde_json::to_string(capabilities)?,
            serde_json::to_string(snapshot)?,
            now,
            id
        ],
    )?;
    Ok(())
}

/// Set a stream's truncation flag. Flags are never cleared.
pub fn mark_truncated(conn: &Connection, id: &str, stream: &str) -> Result<(), MarshalError> {
    let column = truncated_column(stream)?;
    conn.execute(
        &format!("UPDATE directives SET {} = 1 WHERE id = ?1", column),
        [id],
    )?;
    Ok(())
}

/// Atomic per-stream byte counter increment.
pub fn add_stream_bytes(
    conn: &Connection,
    id: &str,
    stream: &str,
    delta: i64,
) -> Result<(), MarshalError> {
    let column = bytes_column(stream)?;
    conn.execute(
        &format!(
            "UPDATE directives SET {col} = {col} + ?1 WHERE id = ?2",
            col = column
        ),
        params![delta, id],
    )?;
    Ok(())
}

fn bytes_column(stream: &str) -> Result<&'static str, MarshalError> {
    match stream {
        "stdout" => Ok("stdout_bytes"),
        "stderr" => Ok("stderr_bytes"),
        other => Err(MarshalError::InvalidParam(format!("unknown stream '{}'", other))),
    }
}

fn truncated_column(stream: &str) -> Result<&'static str, MarshalError> {
    match stream {
        "stdout" => Ok("stdout_truncated"),
        "stderr" => Ok("stderr_truncated"),
        other => Err(MarshalError::InvalidParam(format!("unknown stream '{}'", other))),
    }
}

/// Record the terminal report fields. Truncation flags only ever turn on.
#[allow(clippy::too_many_arguments)]
pub fn record_result(
    conn: &Connection,
    id: &str,
    result_hash: &str,
    payload: &JsonValue,
    status: FinishStatus,
    exit_code: Option<i64>,
    stdout_truncated: bool,
    stderr_truncated: bool,
) -> Result<(), MarshalError> {
    conn.execute(
        "UPDATE directives SET result_hash = ?1, result_payload = ?2, finished_status = ?3,
            exit_code = ?4,
            stdout_truncated = MAX(stdout_truncated, ?5),
            stderr_truncated = MAX(stderr_truncated, ?6)
         WHERE id = ?7",
        params![
            result_hash,
            serde_json::to_string(payload)?,
            status.as_str(),
            exit_code,
            bool_to_sql(stdout_truncated),
            bool_to_sql(stderr_truncated),
            id
        ],
    )?;
    Ok(())
}

/// Leased directives whose lease passed at `now`, oldest expiry first.
pub fn expired_leases(conn: &Connection, now: i64, limit: u32) -> Result<Vec<String>, MarshalError> {
    ids_where(
        conn,
        "state = 'leased' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
        now,
        limit,
    )
}

/// Running directives whose lease passed before `cutoff`.
pub fn stale_running(conn: &Connection, cutoff: i64, limit: u32) -> Result<Vec<String>, MarshalError> {
    ids_where(
        conn,
        "state = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
        cutoff,
        limit,
    )
}

fn ids_where(conn: &Connection, predicate: &str, at: i64, limit: u32) -> Result<Vec<String>, MarshalError> {
    let sql = format!(
        "SELECT id FROM directives WHERE {} ORDER BY lease_expires_at ASC, id ASC LIMIT ?2",
        predicate
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![at, i64::from(limit)], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Count of directives currently held (leased or running) by a territory.
pub fn in_flight_count(conn: &Connection, territory_id: &str) -> Result<i64, MarshalError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM directives WHERE territory_id = ?1 AND state IN ('leased', 'running')",
        [territory_id],
        |row| row.get(0),
    )?;
    Ok(count)
}
