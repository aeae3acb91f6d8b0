//! PollService: atomic work assignment to a polling territory.
//!
//! One poll runs inside one `BEGIN IMMEDIATE` transaction. Each candidate is
//! claimed with a compare-and-swap on `state = 'queued'`, so a candidate that
//! another poller already took is skipped rather than waited on.

use crate::core::config::PlaneConfig;
use crate::core::error::MarshalError;
use crate::plugins::audit::{ActorKind, AuditEntry, AuditService};
use crate::plugins::directive::{self, DirectiveRecord, FinishStatus};
use crate::plugins::facility;
use crate::plugins::policy::{self, Capabilities, Verdict};
use crate::plugins::territory::{self, TerritoryRecord};
use crate::plugins::token::TokenSigner;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub territory_id: String,
    pub supported_profiles: Vec<String>,
    #[serde(default = "default_max_claims")]
    pub max_claims: u32,
    /// Directives the territory says it is currently running. When absent
    /// the plane counts its own leased/running rows.
    #[serde(default)]
    pub in_flight: Option<i64>,
}

fn default_max_claims() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceRef {
    pub facility_id: String,
    pub mount_path: String,
}

/// Everything a territory needs to run the command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionSpec {
    pub command: String,
    pub shell: String,
    pub cwd: String,
    pub timeout_seconds: i64,
    pub sandbox_profile: String,
    pub sandbox_driver: String,
    pub capabilities: Capabilities,
    pub workspace: WorkspaceRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantedLease {
    pub directive_id: String,
    pub token: String,
    pub token_expires_at: i64,
    pub lease_expires_at: i64,
    pub spec: ExecutionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollResponse {
    pub leases: Vec<GrantedLease>,
    pub lease_ttl_seconds: i64,
    pub retry_after_seconds: i64,
}

pub struct PollService<'a> {
    config: &'a PlaneConfig,
    signer: &'a TokenSigner,
}

enum Claim {
    Granted(Box<GrantedLease>),
    Skipped(&'static str),
}

impl<'a> PollService<'a> {
    pub fn new(config: &'a PlaneConfig, signer: &'a TokenSigner) -> Self {
        Self { config, signer }
    }

    fn empty(&self) -> PollResponse {
        PollResponse {
            leases: Vec::new(),
            lease_ttl_seconds: self.config.lease_ttl_seconds,
            retry_after_seconds: self.config.poll_retry_after_seconds,
        }
    }

    pub fn poll(
        &self,
        conn: &Connection,
        req: &PollRequest,
        now: i64,
    ) -> Result<PollResponse, MarshalError> {
        let territory = territory::require_territory(conn, &req.territory_id)?;
        if territory.is_disabled() {
            return Err(MarshalError::Forbidden(format!(
                "territory {} is disabled",
                territory.id
            )));
        }

        if req.in_flight.is_some_and(|n| n >= territory.max_concurrency) {
            return Ok(self.empty());
        }
        let in_flight = match req.in_flight {
            Some(n) => n,
            None => directive::in_flight_count(conn, &territory.id)?,
        };
        let remaining = territory.max_concurrency - in_flight;
        if remaining <= 0 || req.max_claims == 0 {
            return Ok(self.empty());
        }
        let limit = req
            .max_claims
            .min(self.config.claim_cap())
            .min(u32::try_from(remaining).unwrap_or(u32::MAX)) as usize;

        let profiles: Vec<String> = req
            .supported_profiles
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let candidates = directive::queued_candidates(
            conn,
            &territory.account_id,
            &profiles,
            self.config.poll_scan_limit,
        )?;

        let mut leases = Vec::new();
        for candidate in candidates {
            if leases.len() >= limit {
                break;
            }
            match self.try_claim(conn, &territory, &candidate, now)? {
                Claim::Granted(lease) => leases.push(*lease),
                Claim::Skipped(reason) => {
                    tracing::debug!(directive = %candidate.id, reason, "poll skipped candidate");
                }
            }
        }

        tracing::info!(
            territory = %territory.id,
            granted = leases.len(),
            "poll completed"
        );
        let retry_after_seconds = if leases.is_empty() {
            self.config.poll_retry_after_seconds
        } else {
            0
        };
        Ok(PollResponse {
            leases,
            lease_ttl_seconds: self.config.lease_ttl_seconds,
            retry_after_seconds,
        })
    }

    fn try_claim(
        &self,
        conn: &Connection,
        territory: &TerritoryRecord,
        candidate: &DirectiveRecord,
        now: i64,
    ) -> Result<Claim, MarshalError> {
        if candidate.cancel_requested_at.is_some() {
            directive::finish(conn, &candidate.id, FinishStatus::Canceled, false, now)?;
            AuditService::record(
                conn,
                AuditEntry::directive("directive.canceled", &candidate.id)
                    .account(&candidate.account_id)
                    .actor(ActorKind::System, None)
                    .payload(json!({
                        "stage": "claim",
                        "cancel_requested_at": candidate.cancel_requested_at,
                    })),
                now,
            );
            return Ok(Claim::Skipped("cancel requested"));
        }

        if let Some(holder) = facility::active_holder(conn, &candidate.facility_id)? {
            if holder != candidate.id {
                return Ok(Claim::Skipped("facility locked"));
            }
        }

        let facility = facility::require_facility(conn, &candidate.facility_id)?;
        if facility
            .territory_id
            .as_deref()
            .is_some_and(|pinned| pinned != territory.id)
        {
            return Ok(Claim::Skipped("facility pinned to another territory"));
        }

        let driver = self.config.sandbox.driver_for(&candidate.sandbox_profile);
        if !territory.driver_healthy(&driver) {
            return Ok(Claim::Skipped("sandbox driver unhealthy"));
        }

        let evaluation = policy::evaluate_directive(
            conn,
            &self.config.sandbox,
            &candidate.account_id,
            &candidate.facility_id,
            &candidate.sandbox_profile,
            &candidate.requested_capabilities,
        )?;

        if evaluation.verdict == Verdict::Forbidden {
            directive::update_effective_capabilities(
                conn,
                &candidate.id,
                &candidate.effective_capabilities,
                &evaluation.snapshot,
                now,
            )?;
            directive::finish(conn, &candidate.id, FinishStatus::Canceled, false, now)?;
            AuditService::record(
                conn,
                AuditEntry::directive("directive.policy_forbidden", &candidate.id)
                    .account(&candidate.account_id)
                    .actor(ActorKind::System, None)
                    .payload(json!({
                        "stage": "claim",
                        "territory_id": territory.id,
                        "reasons": evaluation.snapshot.reasons,
                    })),
                now,
            );
            return Ok(Claim::Skipped("forbidden by policy"));
        }

        if evaluation.capabilities != candidate.effective_capabilities {
            directive::update_effective_capabilities(
                conn,
                &candidate.id,
                &evaluation.capabilities,
                &evaluation.snapshot,
                now,
            )?;
            AuditService::record(
                conn,
                AuditEntry::directive("directive.capabilities_updated", &candidate.id)
                    .account(&candidate.account_id)
                    .payload(json!({
                        "before": candidate.effective_capabilities,
                        "after": evaluation.capabilities,
                    })),
                now,
            );
        }

        let lease_expires_at = now + self.config.lease_ttl_seconds;
        if let Some(reason) = lease_and_lock(conn, candidate, &territory.id, lease_expires_at, now)? {
            return Ok(Claim::Skipped(reason));
        }

        let issued = self.signer.mint(&candidate.id, &territory.id, now)?;

        AuditService::record(
            conn,
            AuditEntry::directive("directive.leased", &candidate.id)
                .account(&candidate.account_id)
                .actor(ActorKind::Territory, Some(&territory.id))
                .payload(json!({ "lease_expires_at": lease_expires_at })),
            now,
        );

        Ok(Claim::Granted(Box::new(GrantedLease {
            directive_id: candidate.id.clone(),
            token: issued.token,
            token_expires_at: issued.expires_at,
            lease_expires_at,
            spec: ExecutionSpec {
                command: candidate.command.clone(),
                shell: candidate.shell.clone(),
                cwd: candidate.cwd.clone(),
                timeout_seconds: candidate.timeout_seconds,
                sandbox_profile: candidate.sandbox_profile.clone(),
                sandbox_driver: driver,
                capabilities: evaluation.capabilities,
                workspace: WorkspaceRef {
                    facility_id: facility.id,
                    mount_path: facility.mount_path,
                },
            },
        })))
    }
}

/// Lease the candidate, then take its facility lock. A lost lock puts the
/// directive back in the queue. Returns the skip reason when either fails.
fn lease_and_lock(
    conn: &Connection,
    candidate: &DirectiveRecord,
    territory_id: &str,
    lease_expires_at: i64,
    now: i64,
) -> Result<Option<&'static str>, MarshalError> {
    match directive::lease(conn, &candidate.id, territory_id, lease_expires_at, now) {
        Ok(()) => {}
        Err(MarshalError::InvalidState(_)) => return Ok(Some("claimed elsewhere")),
        Err(err) => return Err(err),
    }

    match facility::lock(conn, &candidate.facility_id, &candidate.id, now) {
        Ok(()) => Ok(None),
        Err(MarshalError::LockConflict { .. }) => {
            directive::revert_lease(conn, &candidate.id, now)?;
            Ok(Some("facility lock lost"))
        }
        Err(err) => Err(err),
    }
}
