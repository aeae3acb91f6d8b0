//! LeaseReaperService: returns abandoned leases to the queue.
//!
//! Every reclaimed directive gets its own transaction, and a failure on one
//! row is logged and skipped. An expired lease on a directive whose cancel
//! was requested is closed as canceled instead of going back to the queue. Running directives are not touched by the
//! lease sweep; the separate stale-running sweep times out those whose
//! territory stopped heartbeating well past the lease.

use crate::core::broker::DbBroker;
use crate::core::error::MarshalError;
use crate::core::time::Clock;
use crate::plugins::audit::{ActorKind, AuditEntry, AuditService};
use crate::plugins::directive::{self, DirectiveState, FinishStatus};
use crate::plugins::territory::{self, WakeNotifier, WakeTarget};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SWEEP_BATCH: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaimed {
    /// Back in the queue; the account's territories are worth waking.
    Requeued { account_id: String },
    /// Cancel was requested while leased, so the directive is closed.
    Canceled,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReapReport {
    pub reclaimed: Vec<String>,
    pub canceled: Vec<String>,
    pub timed_out: Vec<String>,
    pub failed: Vec<String>,
}

pub struct LeaseReaperService<'a> {
    broker: &'a DbBroker,
    clock: &'a dyn Clock,
    notifier: &'a dyn WakeNotifier,
    stale_running_grace_seconds: i64,
}

impl<'a> LeaseReaperService<'a> {
    pub fn new(
        broker: &'a DbBroker,
        clock: &'a dyn Clock,
        notifier: &'a dyn WakeNotifier,
        stale_running_grace_seconds: i64,
    ) -> Self {
        Self {
            broker,
            clock,
            notifier,
            stale_running_grace_seconds,
        }
    }

    /// One full pass: expired leases first, then stale running directives.
    pub fn sweep(&self) -> Result<ReapReport, MarshalError> {
        let mut report = ReapReport::default();
        self.sweep_expired_leases(&mut report)?;
        self.sweep_stale_running(&mut report)?;
        if !report.reclaimed.is_empty() || !report.canceled.is_empty() || !report.timed_out.is_empty()
        {
            tracing::info!(
                reclaimed = report.reclaimed.len(),
                canceled = report.canceled.len(),
                timed_out = report.timed_out.len(),
                failed = report.failed.len(),
                "reaper sweep"
            );
        }
        Ok(report)
    }

    fn sweep_expired_leases(&self, report: &mut ReapReport) -> Result<(), MarshalError> {
        let now = self.clock.now();
        let ids = self
            .broker
            .with_read(|conn| directive::expired_leases(conn, now, SWEEP_BATCH))?;

        for id in ids {
            match self.reclaim_one(&id) {
                Ok(Some(Reclaimed::Requeued { account_id })) => {
                    territory::wake(self.notifier, WakeTarget::Account(account_id));
                    report.reclaimed.push(id);
                }
                Ok(Some(Reclaimed::Canceled)) => report.canceled.push(id),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(directive = %id, error = %err, "lease reclamation failed");
                    report.failed.push(id);
                }
            }
        }
        Ok(())
    }

    /// `None` when the lease is gone or still live.
    pub fn reclaim_one(&self, id: &str) -> Result<Option<Reclaimed>, MarshalError> {
        self.broker.with_tx("reaper", "directive.expire_lease", |conn| {
            let now = self.clock.now();
            let Some(rec) = directive::get_directive(conn, id)? else {
                return Ok(None);
            };
            let abandoning = rec.territory_id.clone();

            let expired = rec.state == DirectiveState::Leased
                && rec.lease_expires_at.is_some_and(|exp| exp <= now);
            if expired && rec.cancel_requested_at.is_some() {
                directive::finish(conn, id, FinishStatus::Canceled, false, now)?;
                AuditService::record(
                    conn,
                    AuditEntry::directive("directive.canceled", id)
                        .account(&rec.account_id)
                        .actor(ActorKind::System, None)
                        .payload(json!({
                            "stage": "lease_expired",
                            "territory_id": abandoning,
                            "cancel_requested_at": rec.cancel_requested_at,
                        })),
                    now,
                );
                return Ok(Some(Reclaimed::Canceled));
            }

            // expire_lease re-checks state and expiry under the write lock,
            // so a heartbeat that just renewed the lease wins.
            if !directive::expire_lease(conn, id, now)? {
                return Ok(None);
            }
            AuditService::record(
                conn,
                AuditEntry::directive("directive.lease_expired", id)
                    .account(&rec.account_id)
                    .actor(ActorKind::System, None)
                    .payload(json!({
                        "territory_id": abandoning,
                        "lease_expires_at": rec.lease_expires_at,
                    })),
                now,
            );
            Ok(Some(Reclaimed::Requeued {
                account_id: rec.account_id,
            }))
        })
    }

    fn sweep_stale_running(&self, report: &mut ReapReport) -> Result<(), MarshalError> {
        let cutoff = self.clock.now() - self.stale_running_grace_seconds;
        let ids = self
            .broker
            .with_read(|conn| directive::stale_running(conn, cutoff, SWEEP_BATCH))?;

        for id in ids {
            let outcome = self.broker.with_tx("reaper", "directive.stale_timeout", |conn| {
                let now = self.clock.now();
                let rec = directive::require_directive(conn, &id)?;
                let still_stale = rec.state == DirectiveState::Running
                    && rec
                        .lease_expires_at
                        .is_some_and(|exp| exp <= now - self.stale_running_grace_seconds);
                if !still_stale {
                    return Ok(false);
                }
                directive::finish(conn, &id, FinishStatus::TimedOut, false, now)?;
                AuditService::record(
                    conn,
                    AuditEntry::directive("directive.stale_timeout", &id)
                        .account(&rec.account_id)
                        .payload(json!({
                            "territory_id": rec.territory_id,
                            "last_heartbeat_at": rec.last_heartbeat_at,
                        })),
                    now,
                );
                Ok(true)
            });
            match outcome {
                Ok(true) => report.timed_out.push(id),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(directive = %id, error = %err, "stale timeout failed");
                    report.failed.push(id);
                }
            }
        }
        Ok(())
    }
}

/// Sweep every `interval` until `stop` is set. A failed sweep is logged and
/// retried on the next tick.
pub fn run_reaper_loop(
    reaper: &LeaseReaperService<'_>,
    interval: Duration,
    stop: &AtomicBool,
) -> Result<(), MarshalError> {
    let tick = Duration::from_millis(200).min(interval);
    while !stop.load(Ordering::SeqCst) {
        if let Err(err) = reaper.sweep() {
            tracing::warn!(error = %err, "reaper sweep failed");
        }
        let mut waited = Duration::ZERO;
        while waited < interval && !stop.load(Ordering::SeqCst) {
            std::thread::sleep(tick);
            waited += tick;
        }
    }
    Ok(())
}
