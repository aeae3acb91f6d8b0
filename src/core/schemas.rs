//! Centralized database schema definitions for the marshal store.
//!
//! One SQLite database (`marshal.db`) holds the registry (accounts,
//! territories, facilities, policies), the directive lifecycle rows, log
//! chunks, and the audit trail.

pub const MARSHAL_DB_NAME: &str = "marshal.db";
pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const SCHEMA_ACCOUNTS: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
";

pub const SCHEMA_TERRITORIES: &str = "
    CREATE TABLE IF NOT EXISTS territories (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES accounts(id),
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        capabilities TEXT NOT NULL DEFAULT '[]', -- JSON array
        max_concurrency INTEGER NOT NULL DEFAULT 1,
        sandbox_health TEXT NOT NULL DEFAULT '{}', -- JSON object driver -> health
        last_heartbeat_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const SCHEMA_FACILITIES: &str = "
    CREATE TABLE IF NOT EXISTS facilities (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES accounts(id),
        owner_id TEXT NOT NULL,
        territory_id TEXT REFERENCES territories(id),
        name TEXT NOT NULL,
        mount_path TEXT NOT NULL,
        locked_by_directive_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const SCHEMA_POLICIES: &str = "
    CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        scope_kind TEXT NOT NULL, -- global | account | facility
        scope_id TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        rules TEXT NOT NULL, -- JSON PolicyRules
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const SCHEMA_DIRECTIVES: &str = "
    CREATE TABLE IF NOT EXISTS directives (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES accounts(id),
        facility_id TEXT NOT NULL REFERENCES facilities(id),
        requester_id TEXT NOT NULL,
        command TEXT NOT NULL,
        shell TEXT NOT NULL,
        cwd TEXT NOT NULL,
        sandbox_profile TEXT NOT NULL,
        timeout_seconds INTEGER NOT NULL,
        requested_capabilities TEXT NOT NULL,
        effective_capabilities TEXT NOT NULL,
        policy_snapshot TEXT NOT NULL,
        state TEXT NOT NULL,
        territory_id TEXT,
        lease_expires_at INTEGER,
        last_heartbeat_at INTEGER,
        started_at INTEGER,
        finished_at INTEGER,
        cancel_requested_at INTEGER,
        sandbox_version TEXT,
        nexus_version TEXT,
        result_hash TEXT,
        result_payload TEXT,
        finished_status TEXT,
        exit_code INTEGER,
        stdout_bytes INTEGER NOT NULL DEFAULT 0,
        stderr_bytes INTEGER NOT NULL DEFAULT 0,
        stdout_truncated INTEGER NOT NULL DEFAULT 0,
        stderr_truncated INTEGER NOT NULL DEFAULT 0,
        diff_sha256 TEXT,
        diff_size INTEGER,
        diff_blob BLOB,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const SCHEMA_LOG_CHUNKS: &str = "
    CREATE TABLE IF NOT EXISTS log_chunks (
        id TEXT PRIMARY KEY,
        directive_id TEXT NOT NULL REFERENCES directives(id),
        stream TEXT NOT NULL,
        seq INTEGER NOT NULL,
        bytes BLOB NOT NULL,
        byte_len INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(directive_id, stream, seq)
    )
";

pub const SCHEMA_AUDIT_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS audit_events (
        id TEXT PRIMARY KEY,
        ts INTEGER NOT NULL,
        account_id TEXT,
        actor_kind TEXT NOT NULL,
        actor_id TEXT,
        action TEXT NOT NULL,
        subject_kind TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        payload TEXT NOT NULL
    )
";

pub const SCHEMA_INDEX_DIRECTIVES_CLAIM: &str = "CREATE INDEX IF NOT EXISTS idx_directives_claim ON directives(account_id, state, created_at)";
pub const SCHEMA_INDEX_DIRECTIVES_LEASE: &str =
    "CREATE INDEX IF NOT EXISTS idx_directives_lease ON directives(state, lease_expires_at)";
pub const SCHEMA_INDEX_DIRECTIVES_TERRITORY: &str =
    "CREATE INDEX IF NOT EXISTS idx_directives_territory ON directives(territory_id, state)";
pub const SCHEMA_INDEX_POLICIES_SCOPE: &str =
    "CREATE INDEX IF NOT EXISTS idx_policies_scope ON policies(scope_kind, scope_id, active)";
pub const SCHEMA_INDEX_AUDIT_SUBJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_events(subject_id, ts)";

pub const ALL_TABLES: &[&str] = &[
    SCHEMA_ACCOUNTS,
    SCHEMA_TERRITORIES,
    SCHEMA_FACILITIES,
    SCHEMA_POLICIES,
    SCHEMA_DIRECTIVES,
    SCHEMA_LOG_CHUNKS,
    SCHEMA_AUDIT_EVENTS,
    SCHEMA_INDEX_DIRECTIVES_CLAIM,
    SCHEMA_INDEX_DIRECTIVES_LEASE,
    SCHEMA_INDEX_DIRECTIVES_TERRITORY,
    SCHEMA_INDEX_POLICIES_SCOPE,
    SCHEMA_INDEX_AUDIT_SUBJECT,
];
