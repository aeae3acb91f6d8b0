//! Capability policies: hierarchical ceiling merge and the approval gate.
//!
//! All active policies that apply to a directive (global, its account, its
//! facility) are merged per capability kind:
//!
//! - `fs`: path-set intersection across policies, then with the request.
//! - `net`: most restrictive mode wins (`none < allowlist < unrestricted`),
//!   ties union their allow-lists; the request is clamped to the result.
//! - `secrets`, `sandbox_profile_rules`: highest priority replaces.
//! - `approval`: per key, most restrictive verdict wins.
//!
//! The merge sorts its input itself, so callers may pass policies in any
//! order.

use crate::core::config::SandboxConfig;
use crate::core::error::MarshalError;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

// --- capability types ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsCapability {
    #[serde(default)]
    pub read: BTreeSet<String>,
    #[serde(default)]
    pub write: BTreeSet<String>,
}

impl FsCapability {
    pub fn new<R, W, S1, S2>(read: R, write: W) -> Self
    where
        R: IntoIterator<Item = S1>,
        W: IntoIterator<Item = S2>,
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        Self {
            read: minimize(read.into_iter().map(|p| normalize_path(p.as_ref())).collect()),
            write: minimize(write.into_iter().map(|p| normalize_path(p.as_ref())).collect()),
        }
    }

    /// Narrow `self` by `other`. Commutative and associative.
    pub fn intersect(&self, other: &FsCapability) -> FsCapability {
        let lhs = FsCapability::new(&self.read, &self.write);
        let rhs = FsCapability::new(&other.read, &other.write);
        FsCapability {
            read: intersect_paths(&lhs.read, &rhs.read),
            write: intersect_paths(&lhs.write, &rhs.write),
        }
    }
}

fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed == "/" {
        return trimmed.to_string();
    }
    trimmed.trim_end_matches('/').to_string()
}

/// `parent` grants `child` when it is the same path or one of its ancestors.
fn covers(parent: &str, child: &str) -> bool {
    parent == child
        || parent == "/"
        || (child.starts_with(parent) && child.as_bytes().get(parent.len()) == Some(&b'/'))
}

/// Drop entries already granted by another entry.
fn minimize(paths: BTreeSet<String>) -> BTreeSet<String> {
    paths
        .iter()
        .filter(|p| !paths.iter().any(|q| q != *p && covers(q, p)))
        .cloned()
        .collect()
}

fn intersect_paths(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for x in a {
        for y in b {
            if covers(y, x) {
                out.insert(x.clone());
            } else if covers(x, y) {
                out.insert(y.clone());
            }
        }
    }
    minimize(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetMode {
    None,
    Allowlist,
    Unrestricted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetCapability {
    pub mode: NetMode,
    #[serde(default, deserialize_with = "normalized_hosts")]
    pub allow: BTreeSet<String>,
}

/// Allowlist entries compare case-insensitively and ignore surrounding space.
fn normalize_host(entry: &str) -> Option<String> {
    let host = entry.trim().to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

fn normalized_hosts<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(raw.iter().filter_map(|e| normalize_host(e)).collect())
}

impl NetCapability {
    pub fn none() -> Self {
        Self {
            mode: NetMode::None,
            allow: BTreeSet::new(),
        }
    }

    pub fn unrestricted() -> Self {
        Self {
            mode: NetMode::Unrestricted,
            allow: BTreeSet::new(),
        }
    }

    pub fn allowlist<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            mode: NetMode::Allowlist,
            allow: entries
                .into_iter()
                .filter_map(|e| normalize_host(e.as_ref()))
                .collect(),
        }
    }

    /// Honor `requested` only if it is as restrictive as `self` or more.
    pub fn clamp(&self, requested: &NetCapability) -> NetCapability {
        if requested.mode > self.mode {
            return self.clone();
        }
        match requested.mode {
            NetMode::None => NetCapability::none(),
            NetMode::Allowlist if self.mode == NetMode::Allowlist => NetCapability {
                mode: NetMode::Allowlist,
                allow: requested.allow.intersection(&self.allow).cloned().collect(),
            },
            _ => requested.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Skip,
    NeedsApproval,
    Forbidden,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Skip => "skip",
            Verdict::NeedsApproval => "needs_approval",
            Verdict::Forbidden => "forbidden",
        }
    }
}

/// What a directive asks for. Absent `fs` means "whatever the ceiling
/// allows"; absent `net` means no network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<NetCapability>,
    #[serde(default)]
    pub secrets: BTreeSet<String>,
}

/// Resolved capabilities handed to the territory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub fs: FsCapability,
    pub net: NetCapability,
    #[serde(default)]
    pub secrets: BTreeSet<String>,
}

// --- policy definitions ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxProfileRules {
    /// If set, only these profiles may run at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<BTreeSet<String>>,
    #[serde(default)]
    pub require_approval: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<NetCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_profile_rules: Option<SandboxProfileRules>,
    #[serde(default)]
    pub approval: BTreeMap<String, Verdict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PolicyScope {
    Global,
    Account(String),
    Facility(String),
}

impl PolicyScope {
    fn kind_str(&self) -> &'static str {
        match self {
            PolicyScope::Global => "global",
            PolicyScope::Account(_) => "account",
            PolicyScope::Facility(_) => "facility",
        }
    }

    fn scope_id(&self) -> Option<&str> {
        match self {
            PolicyScope::Global => None,
            PolicyScope::Account(id) | PolicyScope::Facility(id) => Some(id),
        }
    }

    fn from_sql(kind: &str, id: Option<String>) -> Result<Self, MarshalError> {
        match (kind, id) {
            ("global", _) => Ok(PolicyScope::Global),
            ("account", Some(id)) => Ok(PolicyScope::Account(id)),
            ("facility", Some(id)) => Ok(PolicyScope::Facility(id)),
            (kind, _) => Err(MarshalError::InvalidParam(format!(
                "malformed policy scope '{}'",
                kind
            ))),
        }
    }

    /// Narrower scopes win priority ties.
    fn specificity(&self) -> u8 {
        match self {
            PolicyScope::Global => 0,
            PolicyScope::Account(_) => 1,
            PolicyScope::Facility(_) => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub scope: PolicyScope,
    pub active: bool,
    pub rules: PolicyRules,
}

fn priority_order(a: &Policy, b: &Policy) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.scope.specificity().cmp(&a.scope.specificity()))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedPolicy {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub scope: PolicyScope,
}

/// Record of which policies produced a directive's capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub policies: Vec<AppliedPolicy>,
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub reasons: Vec<String>,
}

// --- merge ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedPolicy {
    pub fs: Option<FsCapability>,
    pub net: Option<NetCapability>,
    pub secrets: Option<BTreeSet<String>>,
    pub sandbox_profile_rules: Option<SandboxProfileRules>,
    pub approval: BTreeMap<String, Verdict>,
    pub applied: Vec<AppliedPolicy>,
}

impl MergedPolicy {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

pub fn merge(policies: &[Policy]) -> MergedPolicy {
    let mut ordered: Vec<&Policy> = policies.iter().filter(|p| p.active).collect();
    ordered.sort_by(|a, b| priority_order(a, b));

    let fs = ordered
        .iter()
        .filter_map(|p| p.rules.fs.as_ref())
        .fold(None::<FsCapability>, |acc, fs| match acc {
            None => Some(FsCapability::new(&fs.read, &fs.write)),
            Some(acc) => Some(acc.intersect(fs)),
        });

    let net = merge_net(ordered.iter().filter_map(|p| p.rules.net.as_ref()));

    let secrets = ordered.iter().find_map(|p| p.rules.secrets.clone());
    let sandbox_profile_rules = ordered
        .iter()
        .find_map(|p| p.rules.sandbox_profile_rules.clone());

    let mut approval: FxHashMap<String, Verdict> = FxHashMap::default();
    for policy in &ordered {
        for (key, verdict) in &policy.rules.approval {
            let slot = approval.entry(key.clone()).or_insert(*verdict);
            if *verdict > *slot {
                *slot = *verdict;
            }
        }
    }

    MergedPolicy {
        fs,
        net,
        secrets,
        sandbox_profile_rules,
        approval: approval.into_iter().collect(),
        applied: ordered
            .iter()
            .map(|p| AppliedPolicy {
                id: p.id.clone(),
                name: p.name.clone(),
                priority: p.priority,
                scope: p.scope.clone(),
            })
            .collect(),
    }
}

/// Most restrictive mode across inputs; allow-lists of the winning mode are unioned.
pub fn merge_net<'a, I>(caps: I) -> Option<NetCapability>
where
    I: IntoIterator<Item = &'a NetCapability>,
{
    let caps: Vec<&NetCapability> = caps.into_iter().collect();
    let mode = caps.iter().map(|c| c.mode).min()?;
    let allow = if mode == NetMode::Allowlist {
        caps.iter()
            .filter(|c| c.mode == mode)
            .flat_map(|c| c.allow.iter().cloned())
            .collect()
    } else {
        BTreeSet::new()
    };
    Some(NetCapability { mode, allow })
}

// --- resolver & evaluator ---

/// Turns merged policy ceilings plus a request into effective capabilities.
pub struct PolicyResolver<'a> {
    sandbox: &'a SandboxConfig,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(sandbox: &'a SandboxConfig) -> Self {
        Self { sandbox }
    }

    pub fn resolve(
        &self,
        merged: &MergedPolicy,
        sandbox_profile: &str,
        requested: &RequestedCapabilities,
    ) -> Capabilities {
        let fs_ceiling = merged
            .fs
            .clone()
            .unwrap_or_else(|| self.sandbox.default_fs_for(sandbox_profile));
        let fs = match &requested.fs {
            Some(req) => fs_ceiling.intersect(req),
            None => fs_ceiling,
        };

        let net_ceiling = merged.net.clone().unwrap_or_else(NetCapability::unrestricted);
        let net = net_ceiling.clamp(requested.net.as_ref().unwrap_or(&NetCapability::none()));

        let secrets = match &merged.secrets {
            Some(allowed) => requested.secrets.intersection(allowed).cloned().collect(),
            None => BTreeSet::new(),
        };

        Capabilities { fs, net, secrets }
    }
}

pub struct ApprovalEvaluator;

impl ApprovalEvaluator {
    /// Approval keys a directive triggers.
    pub fn triggered_keys(sandbox_profile: &str, requested: &RequestedCapabilities) -> Vec<String> {
        let mut keys = vec!["default".to_string(), format!("{}_profile", sandbox_profile)];
        match requested.net.as_ref().map(|n| n.mode) {
            Some(NetMode::Unrestricted) => keys.push("net_unrestricted".to_string()),
            Some(NetMode::Allowlist) => keys.push("net_allowlist".to_string()),
            _ => {}
        }
        if requested.fs.as_ref().is_some_and(|fs| !fs.write.is_empty()) {
            keys.push("fs_write".to_string());
        }
        if !requested.secrets.is_empty() {
            keys.push("secrets".to_string());
        }
        keys
    }

    pub fn evaluate(
        merged: &MergedPolicy,
        sandbox_profile: &str,
        requested: &RequestedCapabilities,
    ) -> (Verdict, Vec<String>) {
        if merged.is_empty() {
            return (Verdict::Skip, Vec::new());
        }

        let mut verdict = Verdict::Skip;
        let mut reasons = Vec::new();
        for key in Self::triggered_keys(sandbox_profile, requested) {
            if let Some(v) = merged.approval.get(&key) {
                if *v > Verdict::Skip {
                    reasons.push(format!("approval.{}={}", key, v.as_str()));
                }
                verdict = verdict.max(*v);
            }
        }

        if let Some(rules) = &merged.sandbox_profile_rules {
            if let Some(allowed) = &rules.allowed {
                if !allowed.contains(sandbox_profile) {
                    reasons.push(format!("sandbox_profile '{}' not allowed", sandbox_profile));
                    verdict = Verdict::Forbidden;
                }
            }
            if rules.require_approval.contains(sandbox_profile) {
                reasons.push(format!("sandbox_profile '{}' requires approval", sandbox_profile));
                verdict = verdict.max(Verdict::NeedsApproval);
            }
        }

        (verdict, reasons)
    }
}

/// Full evaluation result for one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub capabilities: Capabilities,
    pub verdict: Verdict,
    pub snapshot: PolicySnapshot,
}

/// Fresh, account-scoped evaluation; no caching.
pub fn evaluate_directive(
    conn: &Connection,
    sandbox: &SandboxConfig,
    account_id: &str,
    facility_id: &str,
    sandbox_profile: &str,
    requested: &RequestedCapabilities,
) -> Result<Evaluation, MarshalError> {
    let policies = load_applicable(conn, account_id, facility_id)?;
    let merged = merge(&policies);
    let capabilities = PolicyResolver::new(sandbox).resolve(&merged, sandbox_profile, requested);
    let (verdict, reasons) = ApprovalEvaluator::evaluate(&merged, sandbox_profile, requested);
    Ok(Evaluation {
        capabilities,
        verdict,
        snapshot: PolicySnapshot {
            policies: merged.applied,
            verdict: Some(verdict),
            reasons,
        },
    })
}

// --- storage ---

fn row_to_policy(
    id: String,
    name: String,
    priority: i64,
    scope_kind: &str,
    scope_id: Option<String>,
    active: i64,
    rules: String,
) -> Result<Policy, MarshalError> {
    Ok(Policy {
        id,
        name,
        priority,
        scope: PolicyScope::from_sql(scope_kind, scope_id)?,
        active: active != 0,
        rules: serde_json::from_str(&rules)?,
    })
}

type PolicyRow = (String, String, i64, String, Option<String>, i64, String);

fn query_policies(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<Policy>, MarshalError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, name, priority, kind, scope_id, active, rules): PolicyRow = row?;
        out.push(row_to_policy(id, name, priority, &kind, scope_id, active, rules)?);
    }
    Ok(out)
}

/// Active policies for global scope, this account, and this facility.
pub fn load_applicable(
    conn: &Connection,
    account_id: &str,
    facility_id: &str,
) -> Result<Vec<Policy>, MarshalError> {
    let mut policies = query_policies(
        conn,
        "SELECT id, name, priority, scope_kind, scope_id, active, rules FROM policies
         WHERE active = 1 AND (
            scope_kind = 'global'
            OR (scope_kind = 'account' AND scope_id = ?1)
            OR (scope_kind = 'facility' AND scope_id = ?2)
         )",
        params![account_id, facility_id],
    )?;
    policies.sort_by(priority_order);
    Ok(policies)
}

pub fn get_policy(conn: &Connection, id: &str) -> Result<Option<Policy>, MarshalError> {
    let mut found = query_policies(
        conn,
        "SELECT id, name, priority, scope_kind, scope_id, active, rules FROM policies WHERE id = ?1",
        params![id],
    )?;
    Ok(found.pop())
}

/// Policy input for create/update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDef {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    pub scope: PolicyScope,
    #[serde(default)]
    pub rules: PolicyRules,
}

pub fn upsert_policy(conn: &Connection, def: &PolicyDef, now: i64) -> Result<Policy, MarshalError> {
    if def.name.trim().is_empty() {
        return Err(MarshalError::InvalidParam(
            "policy name cannot be empty".to_string(),
        ));
    }
    let id = def.id.clone().unwrap_or_else(time::new_id);
    let rules = serde_json::to_string(&def.rules)?;
    let existing: Option<String> = conn
        .query_row("SELECT id FROM policies WHERE id = ?1", [&id], |row| row.get(0))
        .optional()?;

    if existing.is_some() {
        conn.execute(
            "UPDATE policies SET name = ?1, priority = ?2, scope_kind = ?3, scope_id = ?4,
                rules = ?5, active = 1, updated_at = ?6
             WHERE id = ?7",
            params![
                def.name,
                def.priority,
                def.scope.kind_str(),
                def.scope.scope_id(),
                rules,
                now,
                id
            ],
        )?;
    } else {
        conn.execute(
            "INSERT INTO policies(id, name, priority, scope_kind, scope_id, active, rules, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?7)",
            params![
                id,
                def.name,
                def.priority,
                def.scope.kind_str(),
                def.scope.scope_id(),
                rules,
                now
            ],
        )?;
    }

    get_policy(conn, &id)?.ok_or_else(|| MarshalError::NotFound(format!("policy {} not found", id)))
}

pub fn deactivate_policy(conn: &Connection, id: &str, now: i64) -> Result<(), MarshalError> {
    let changed = conn.execute(
        "UPDATE policies SET active = 0, updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    if changed == 0 {
        return Err(MarshalError::NotFound(format!("policy {} not found", id)));
    }
    Ok(())
}
