//! Shared store fixture for integration tests, included with
//! `#[path = "../common/fixture.rs"] mod fixture;`.
#![allow(dead_code)]

use marshal::core::config::PlaneConfig;
use marshal::core::error::MarshalError;
use marshal::core::plane::ControlPlane;
use marshal::core::time::ManualClock;
use marshal::plugins::directive::{CreateDirective, DirectiveRecord};
use marshal::plugins::facility::FacilityRecord;
use marshal::plugins::poll::{GrantedLease, PollRequest, PollResponse};
use marshal::plugins::policy::{PolicyDef, PolicyRules, PolicyScope, RequestedCapabilities};
use marshal::plugins::territory::{
    AccountRecord, RegisterTerritory, TerritoryKind, TerritoryRecord, WakeNotifier, WakeTarget,
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const T0: i64 = 1_700_000_000;

#[derive(Default)]
pub struct RecordingNotifier {
    pub targets: Mutex<Vec<WakeTarget>>,
}

impl WakeNotifier for RecordingNotifier {
    fn notify(&self, target: &WakeTarget) -> Result<(), MarshalError> {
        self.targets.lock().unwrap().push(target.clone());
        Ok(())
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub plane: ControlPlane,
    pub clock: ManualClock,
    pub notifier: Arc<RecordingNotifier>,
    pub account: AccountRecord,
    pub territory: TerritoryRecord,
    pub facility: FacilityRecord,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(PlaneConfig::default())
    }

    pub fn with_config(config: PlaneConfig) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(T0);
        let notifier = Arc::new(RecordingNotifier::default());
        let plane = ControlPlane::with_parts(
            tmp.path(),
            config,
            Arc::new(clock.clone()),
            notifier.clone(),
        )
        .expect("open plane");

        let account = plane.create_account("acme").expect("account");
        let territory = plane
            .register_territory(&RegisterTerritory {
                account_id: account.id.clone(),
                name: "build-01".to_string(),
                kind: TerritoryKind::Server,
                capabilities: vec!["bubblewrap".to_string(), "docker".to_string()],
                max_concurrency: 4,
            })
            .expect("territory");
        let facility = plane
            .create_facility(&account.id, "alice", None, "repo", "/workspace")
            .expect("facility");

        Self {
            tmp,
            plane,
            clock,
            notifier,
            account,
            territory,
            facility,
        }
    }

    pub fn request(&self, command: &str) -> CreateDirective {
        CreateDirective {
            account_id: self.account.id.clone(),
            facility_id: self.facility.id.clone(),
            requester_id: "alice".to_string(),
            command: command.to_string(),
            shell: "bash".to_string(),
            cwd: ".".to_string(),
            sandbox_profile: "standard".to_string(),
            timeout_seconds: 600,
            requested_capabilities: RequestedCapabilities::default(),
        }
    }

    pub fn directive(&self, command: &str) -> DirectiveRecord {
        self.plane
            .create_directive(&self.request(command))
            .expect("create directive")
    }

    pub fn directive_on(&self, facility: &FacilityRecord, command: &str) -> DirectiveRecord {
        let mut req = self.request(command);
        req.facility_id = facility.id.clone();
        self.plane.create_directive(&req).expect("create directive")
    }

    pub fn new_facility(&self, name: &str) -> FacilityRecord {
        self.plane
            .create_facility(&self.account.id, "alice", None, name, &format!("/srv/{}", name))
            .expect("facility")
    }

    pub fn second_territory(&self, name: &str) -> TerritoryRecord {
        self.plane
            .register_territory(&RegisterTerritory {
                account_id: self.account.id.clone(),
                name: name.to_string(),
                kind: TerritoryKind::Server,
                capabilities: Vec::new(),
                max_concurrency: 4,
            })
            .expect("territory")
    }

    pub fn poll_as(&self, territory_id: &str, profiles: &[&str], max_claims: u32) -> PollResponse {
        self.plane
            .poll(&PollRequest {
                territory_id: territory_id.to_string(),
                supported_profiles: profiles.iter().map(|p| p.to_string()).collect(),
                max_claims,
                in_flight: None,
            })
            .expect("poll")
    }

    pub fn poll(&self, max_claims: u32) -> PollResponse {
        self.poll_as(&self.territory.id, &["standard"], max_claims)
    }

    /// Poll once and expect exactly one lease.
    pub fn claim_one(&self) -> GrantedLease {
        let mut resp = self.poll(1);
        assert_eq!(resp.leases.len(), 1, "expected one lease: {:?}", resp);
        resp.leases.remove(0)
    }

    pub fn put_policy(&self, name: &str, priority: i64, scope: PolicyScope, rules: PolicyRules) -> String {
        self.plane
            .upsert_policy(&PolicyDef {
                id: None,
                name: name.to_string(),
                priority,
                scope,
                rules,
            })
            .expect("policy")
            .id
    }
}
