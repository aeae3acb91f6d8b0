//! `ControlPlane`: the service facade over one store.
//!
//! Every public operation is one broker unit of work. Territory-facing calls
//! take the transport-authenticated territory id plus the directive token
//! and re-check the binding on each call.

use crate::core::broker::DbBroker;
use crate::core::config::PlaneConfig;
use crate::core::error::MarshalError;
use crate::core::store::Store;
use crate::core::time::{self, Clock, SystemClock};
use crate::plugins::audit::{ActorKind, AuditEntry, AuditEvent, AuditService};
use crate::plugins::directive::{
    self, CreateDirective, DirectiveRecord, DirectiveState, FinishStatus, StartOutcome,
};
use crate::plugins::facility::{self, FacilityRecord};
use crate::plugins::logs::{self, LogChunk, LogChunkIngestor, LogChunkOutcome, LogStream};
use crate::plugins::poll::{PollRequest, PollResponse, PollService};
use crate::plugins::policy::{self, Policy, PolicyDef, Verdict};
use crate::plugins::reaper::{LeaseReaperService, ReapReport};
use crate::plugins::result::{DiffOutcome, FinishedOutcome, FinishedReport, ResultReporter};
use crate::plugins::territory::{
    self, AccountRecord, LogNotifier, RegisterTerritory, TerritoryRecord, WakeNotifier, WakeTarget,
};
use crate::plugins::token::{self, IssuedToken, TokenSigner};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub cancel_requested: bool,
    pub lease_renewed: bool,
    pub lease_expires_at: i64,
    pub refreshed_token: IssuedToken,
}

pub struct ControlPlane {
    store: Store,
    broker: DbBroker,
    config: PlaneConfig,
    signer: TokenSigner,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn WakeNotifier>,
}

impl ControlPlane {
    /// Open a store with its on-disk config, the system clock, and the
    /// logging wake-up notifier.
    pub fn open(root: &Path) -> Result<Self, MarshalError> {
        let config = PlaneConfig::load(root)?;
        Self::with_parts(root, config, Arc::new(SystemClock), Arc::new(LogNotifier))
    }

    pub fn with_parts(
        root: &Path,
        config: PlaneConfig,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn WakeNotifier>,
    ) -> Result<Self, MarshalError> {
        config.validate()?;
        let store = Store::open(root)?;
        let signer = TokenSigner::load_or_create(&store.root, config.token_ttl_seconds)?;
        let broker = store.broker();
        Ok(Self {
            store,
            broker,
            config,
            signer,
            clock,
            notifier,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    fn wake_account(&self, account_id: &str) {
        territory::wake(self.notifier.as_ref(), WakeTarget::Account(account_id.to_string()));
    }

    // --- registry ---

    pub fn create_account(&self, name: &str) -> Result<AccountRecord, MarshalError> {
        let now = self.now();
        self.broker
            .with_tx("operator", "account.create", |conn| territory::create_account(conn, name, now))
    }

    pub fn register_territory(&self, req: &RegisterTerritory) -> Result<TerritoryRecord, MarshalError> {
        let now = self.now();
        self.broker.with_tx("operator", "territory.register", |conn| {
            let record = territory::register_territory(conn, req, now)?;
            AuditService::record(
                conn,
                AuditEntry {
                    account_id: Some(&record.account_id),
                    actor_kind: ActorKind::System,
                    actor_id: None,
                    action: "territory.registered",
                    subject_kind: "territory",
                    subject_id: &record.id,
                    payload: json!({ "kind": record.kind, "max_concurrency": record.max_concurrency }),
                },
                now,
            );
            Ok(record)
        })
    }

    pub fn report_territory_health(
        &self,
        territory_id: &str,
        sandbox_health: &BTreeMap<String, String>,
        max_concurrency: Option<i64>,
    ) -> Result<TerritoryRecord, MarshalError> {
        let now = self.now();
        self.broker.with_tx(territory_id, "territory.health", |conn| {
            territory::report_health(conn, territory_id, sandbox_health, max_concurrency, now)
        })
    }

    pub fn set_territory_status(&self, territory_id: &str, status: &str) -> Result<TerritoryRecord, MarshalError> {
        let now = self.now();
        self.broker.with_tx("operator", "territory.status", |conn| {
            territory::set_status(conn, territory_id, status, now)?;
            territory::require_territory(conn, territory_id)
        })
    }

    pub fn get_territory(&self, territory_id: &str) -> Result<TerritoryRecord, MarshalError> {
        self.broker
            .with_read(|conn| territory::require_territory(conn, territory_id))
    }

    pub fn create_facility(
        &self,
        account_id: &str,
        owner_id: &str,
        territory_id: Option<&str>,
        name: &str,
        mount_path: &str,
    ) -> Result<FacilityRecord, MarshalError> {
        let now = self.now();
        self.broker.with_tx(owner_id, "facility.create", |conn| {
            territory::require_account(conn, account_id)?;
            if let Some(tid) = territory_id {
                let t = territory::require_territory(conn, tid)?;
                if t.account_id != account_id {
                    return Err(MarshalError::InvalidParam(format!(
                        "territory {} belongs to another account",
                        tid
                    )));
                }
            }
            facility::create_facility(conn, account_id, owner_id, territory_id, name, mount_path, now)
        })
    }

    pub fn get_facility(&self, facility_id: &str) -> Result<FacilityRecord, MarshalError> {
        self.broker
            .with_read(|conn| facility::require_facility(conn, facility_id))
    }

    pub fn upsert_policy(&self, def: &PolicyDef) -> Result<Policy, MarshalError> {
        let now = self.now();
        self.broker.with_tx("operator", "policy.upsert", |conn| {
            let saved = policy::upsert_policy(conn, def, now)?;
            AuditService::record(
                conn,
                AuditEntry {
                    account_id: None,
                    actor_kind: ActorKind::System,
                    actor_id: None,
                    action: "policy.upserted",
                    subject_kind: "policy",
                    subject_id: &saved.id,
                    payload: json!({ "priority": saved.priority, "scope": saved.scope }),
                },
                now,
            );
            Ok(saved)
        })
    }

    pub fn deactivate_policy(&self, policy_id: &str) -> Result<(), MarshalError> {
        let now = self.now();
        self.broker.with_tx("operator", "policy.deactivate", |conn| {
            policy::deactivate_policy(conn, policy_id, now)
        })
    }

    // --- requester surface ---

    pub fn create_directive(&self, req: &CreateDirective) -> Result<DirectiveRecord, MarshalError> {
        req.validate()?;
        let now = self.now();
        let record = self.broker.with_tx(&req.requester_id, "directive.create", |conn| {
            territory::require_account(conn, &req.account_id)?;
            let facility = facility::require_facility(conn, &req.facility_id)?;
            if facility.account_id != req.account_id {
                return Err(MarshalError::InvalidParam(format!(
                    "facility {} belongs to another account",
                    facility.id
                )));
            }

            let evaluation = policy::evaluate_directive(
                conn,
                &self.config.sandbox,
                &req.account_id,
                &req.facility_id,
                &req.sandbox_profile,
                &req.requested_capabilities,
            )?;
            let state = match evaluation.verdict {
                Verdict::Skip => DirectiveState::Queued,
                Verdict::NeedsApproval => DirectiveState::AwaitingApproval,
                Verdict::Forbidden => DirectiveState::Canceled,
            };

            let record = DirectiveRecord {
                id: time::new_id(),
                account_id: req.account_id.clone(),
                facility_id: req.facility_id.clone(),
                requester_id: req.requester_id.clone(),
                command: req.command.clone(),
                shell: req.shell.clone(),
                cwd: req.cwd.clone(),
                sandbox_profile: req.sandbox_profile.clone(),
                timeout_seconds: req.timeout_seconds,
                requested_capabilities: req.requested_capabilities.clone(),
                effective_capabilities: evaluation.capabilities,
                policy_snapshot: evaluation.snapshot,
                state,
                territory_id: None,
                lease_expires_at: None,
                last_heartbeat_at: None,
                started_at: None,
                finished_at: state.is_terminal().then_some(now),
                cancel_requested_at: None,
                sandbox_version: None,
                nexus_version: None,
                result_hash: None,
                result_payload: None,
                finished_status: None,
                exit_code: None,
                stdout_bytes: 0,
                stderr_bytes: 0,
                stdout_truncated: false,
                stderr_truncated: false,
                diff_sha256: None,
                diff_size: None,
                created_at: now,
                updated_at: now,
            };
            directive::insert_directive(conn, &record)?;
            AuditService::record(
                conn,
                AuditEntry::directive("directive.created", &record.id)
                    .account(&record.account_id)
                    .actor(ActorKind::Requester, Some(&record.requester_id))
                    .payload(json!({
                        "state": record.state,
                        "verdict": evaluation.verdict.as_str(),
                        "reasons": record.policy_snapshot.reasons,
                    })),
                now,
            );
            directive::require_directive(conn, &record.id)
        })?;

        if record.state == DirectiveState::Queued {
            self.wake_account(&record.account_id);
        }
        Ok(record)
    }

    pub fn approve(&self, directive_id: &str, actor: &str) -> Result<DirectiveRecord, MarshalError> {
        let now = self.now();
        let record = self.broker.with_tx(actor, "directive.approve", |conn| {
            directive::approve(conn, directive_id, now)?;
            let record = directive::require_directive(conn, directive_id)?;
            AuditService::record(
                conn,
                AuditEntry::directive("directive.approved", directive_id)
                    .account(&record.account_id)
                    .actor(ActorKind::Requester, Some(actor)),
                now,
            );
            Ok(record)
        })?;
        self.wake_account(&record.account_id);
        Ok(record)
    }

    pub fn reject(&self, directive_id: &str, actor: &str) -> Result<DirectiveRecord, MarshalError> {
        let now = self.now();
        self.broker.with_tx(actor, "directive.reject", |conn| {
            directive::reject(conn, directive_id, now)?;
            let record = directive::require_directive(conn, directive_id)?;
            AuditService::record(
                conn,
                AuditEntry::directive("directive.rejected", directive_id)
                    .account(&record.account_id)
                    .actor(ActorKind::Requester, Some(actor)),
                now,
            );
            Ok(record)
        })
    }

    /// Idempotent. Queued work is canceled at once and awaiting work is
    /// rejected; leased or running work only gets the flag, which its
    /// territory sees on the next heartbeat.
    pub fn request_cancel(&self, directive_id: &str, actor: &str) -> Result<DirectiveRecord, MarshalError> {
        let now = self.now();
        self.broker.with_tx(actor, "directive.cancel", |conn| {
            let record = directive::require_directive(conn, directive_id)?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            directive::set_cancel_requested(conn, directive_id, now)?;
            match record.state {
                DirectiveState::Queued => {
                    directive::finish(conn, directive_id, FinishStatus::Canceled, false, now)?;
                }
                DirectiveState::AwaitingApproval => {
                    directive::reject(conn, directive_id, now)?;
                }
                _ => {}
            }
            AuditService::record(
                conn,
                AuditEntry::directive("directive.cancel_requested", directive_id)
                    .account(&record.account_id)
                    .actor(ActorKind::Requester, Some(actor))
                    .payload(json!({ "state_before": record.state })),
                now,
            );
            directive::require_directive(conn, directive_id)
        })
    }

    pub fn get_directive(&self, directive_id: &str) -> Result<DirectiveRecord, MarshalError> {
        self.broker
            .with_read(|conn| directive::require_directive(conn, directive_id))
    }

    pub fn list_directives(
        &self,
        account_id: &str,
        state: Option<DirectiveState>,
    ) -> Result<Vec<DirectiveRecord>, MarshalError> {
        self.broker
            .with_read(|conn| directive::list_directives(conn, account_id, state))
    }

    pub fn read_logs(&self, directive_id: &str, stream: LogStream) -> Result<Vec<u8>, MarshalError> {
        self.broker.with_read(|conn| {
            directive::require_directive(conn, directive_id)?;
            logs::read_stream(conn, directive_id, stream)
        })
    }

    pub fn audit_events(&self, subject_id: Option<&str>) -> Result<Vec<AuditEvent>, MarshalError> {
        self.broker.with_read(|conn| AuditService::list(conn, subject_id))
    }

    // --- territory surface ---

    pub fn poll(&self, req: &PollRequest) -> Result<PollResponse, MarshalError> {
        let now = self.now();
        self.broker.with_tx(&req.territory_id, "directive.poll", |conn| {
            PollService::new(&self.config, &self.signer).poll(conn, req, now)
        })
    }

    pub fn started(
        &self,
        territory_id: &str,
        token: &str,
        sandbox_version: Option<&str>,
        nexus_version: Option<&str>,
    ) -> Result<StartOutcome, MarshalError> {
        let now = self.now();
        self.broker.with_tx(territory_id, "directive.started", |conn| {
            let (claims, record) = token::authorize(conn, &self.signer, token, territory_id, now)?;
            let outcome = directive::start(
                conn,
                &claims.directive_id,
                sandbox_version,
                nexus_version,
                now + self.config.lease_ttl_seconds,
                now,
            )?;
            if !outcome.duplicate {
                AuditService::record(
                    conn,
                    AuditEntry::directive("directive.started", &record.id)
                        .account(&record.account_id)
                        .actor(ActorKind::Territory, Some(territory_id))
                        .payload(json!({
                            "sandbox_version": sandbox_version,
                            "nexus_version": nexus_version,
                        })),
                    now,
                );
            }
            Ok(outcome)
        })
    }

    pub fn heartbeat(&self, territory_id: &str, token: &str) -> Result<HeartbeatResponse, MarshalError> {
        let now = self.now();
        self.broker.with_tx(territory_id, "directive.heartbeat", |conn| {
            let (claims, _) = token::authorize(conn, &self.signer, token, territory_id, now)?;
            let outcome = directive::heartbeat(
                conn,
                &claims.directive_id,
                now + self.config.lease_ttl_seconds,
                now,
            )?;
            let refreshed_token = self.signer.mint(&claims.directive_id, territory_id, now)?;
            Ok(HeartbeatResponse {
                cancel_requested: outcome.cancel_requested,
                lease_renewed: true,
                lease_expires_at: outcome.lease_expires_at,
                refreshed_token,
            })
        })
    }

    pub fn log_chunk(
        &self,
        territory_id: &str,
        token: &str,
        chunk: &LogChunk<'_>,
    ) -> Result<LogChunkOutcome, MarshalError> {
        let now = self.now();
        let ingestor =
            LogChunkIngestor::new(self.config.log_budget_bytes, self.config.max_log_chunk_bytes);
        self.broker.with_tx(territory_id, "directive.log_chunk", |conn| {
            let (claims, _) = token::authorize(conn, &self.signer, token, territory_id, now)?;
            ingestor.ingest(conn, &claims.directive_id, chunk, now)
        })
    }

    pub fn finished(
        &self,
        territory_id: &str,
        token: &str,
        report: &FinishedReport,
        diff: Option<&[u8]>,
    ) -> Result<FinishedOutcome, MarshalError> {
        let now = self.now();
        let reporter = ResultReporter::new(self.config.max_diff_bytes);
        self.broker.with_tx(territory_id, "directive.finished", |conn| {
            let (claims, _) = token::authorize(conn, &self.signer, token, territory_id, now)?;
            reporter.finish(conn, &claims.directive_id, territory_id, report, diff, now)
        })
    }

    pub fn attach_diff(
        &self,
        territory_id: &str,
        token: &str,
        bytes: &[u8],
    ) -> Result<DiffOutcome, MarshalError> {
        let now = self.now();
        let reporter = ResultReporter::new(self.config.max_diff_bytes);
        self.broker.with_tx(territory_id, "directive.attach_diff", |conn| {
            let (claims, _) = token::authorize(conn, &self.signer, token, territory_id, now)?;
            reporter.attach_diff(conn, &claims.directive_id, bytes)
        })
    }

    // --- reclamation ---

    pub fn reaper(&self) -> LeaseReaperService<'_> {
        LeaseReaperService::new(
            &self.broker,
            self.clock.as_ref(),
            self.notifier.as_ref(),
            self.config.stale_running_grace_seconds,
        )
    }

    pub fn reap(&self) -> Result<ReapReport, MarshalError> {
        self.reaper().sweep()
    }
}
