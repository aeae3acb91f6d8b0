#[path = "../common/fixture.rs"]
mod fixture;

use fixture::{Fixture, T0};
use marshal::core::config::PlaneConfig;
use marshal::plugins::directive::{self, DirectiveState};
use marshal::plugins::poll::PollRequest;
use marshal::plugins::territory::{RegisterTerritory, TerritoryKind};
use std::collections::{BTreeMap, HashSet};
use std::sync::Barrier;
use std::thread;

#[test]
fn lease_carries_the_execution_spec() {
    let fx = Fixture::new();
    let d = fx.directive("cargo test --all");
    let resp = fx.poll(1);

    assert_eq!(resp.retry_after_seconds, 0);
    assert_eq!(resp.lease_ttl_seconds, 300);
    let lease = &resp.leases[0];
    assert_eq!(lease.directive_id, d.id);
    assert_eq!(lease.lease_expires_at, T0 + 300);
    assert_eq!(lease.token_expires_at, T0 + 600);
    assert_eq!(lease.spec.command, "cargo test --all");
    assert_eq!(lease.spec.sandbox_driver, "bubblewrap");
    assert_eq!(lease.spec.workspace.mount_path, "/workspace");

    let rec = fx.plane.get_directive(&d.id).unwrap();
    assert_eq!(rec.state, DirectiveState::Leased);
    assert_eq!(rec.territory_id.as_deref(), Some(fx.territory.id.as_str()));
}

#[test]
fn empty_queue_suggests_a_retry_delay() {
    let fx = Fixture::new();
    let resp = fx.poll(3);
    assert!(resp.leases.is_empty());
    assert_eq!(resp.retry_after_seconds, 5);
}

#[test]
fn only_supported_profiles_are_claimed() {
    let fx = Fixture::new();
    let mut req = fx.request("docker build .");
    req.sandbox_profile = "container".to_string();
    let d = fx.plane.create_directive(&req).unwrap();

    assert!(fx.poll(1).leases.is_empty());

    let resp = fx.poll_as(&fx.territory.id, &["container", "container", " "], 1);
    assert_eq!(resp.leases.len(), 1);
    assert_eq!(resp.leases[0].directive_id, d.id);
    assert_eq!(resp.leases[0].spec.sandbox_driver, "docker");
}

#[test]
fn claims_are_capped_by_request_config_and_capacity() {
    let config = PlaneConfig {
        max_claims_per_poll: 2,
        ..PlaneConfig::default()
    };
    let fx = Fixture::with_config(config);
    for i in 0..5 {
        let f = fx.new_facility(&format!("ws{i}"));
        fx.directive_on(&f, "make");
    }

    assert_eq!(fx.poll(1).leases.len(), 1);
    assert_eq!(fx.poll(10).leases.len(), 2);
    // Territory capacity is 4 and three are now in flight.
    assert_eq!(fx.poll(10).leases.len(), 1);
    assert!(fx.poll(10).leases.is_empty());
}

#[test]
fn self_reported_in_flight_at_capacity_gets_nothing() {
    let fx = Fixture::new();
    fx.directive("make");

    let resp = fx
        .plane
        .poll(&PollRequest {
            territory_id: fx.territory.id.clone(),
            supported_profiles: vec!["standard".to_string()],
            max_claims: 1,
            in_flight: Some(4),
        })
        .unwrap();
    assert!(resp.leases.is_empty());
    assert_eq!(fx.claim_one().spec.command, "make");
}

#[test]
fn unhealthy_driver_is_skipped() {
    let fx = Fixture::new();
    fx.directive("make");

    let mut health = BTreeMap::new();
    health.insert("bubblewrap".to_string(), "unhealthy".to_string());
    fx.plane
        .report_territory_health(&fx.territory.id, &health, None)
        .unwrap();
    assert!(fx.poll(1).leases.is_empty());

    health.insert("bubblewrap".to_string(), "healthy".to_string());
    fx.plane
        .report_territory_health(&fx.territory.id, &health, None)
        .unwrap();
    assert_eq!(fx.poll(1).leases.len(), 1);
}

#[test]
fn disabled_territory_is_forbidden() {
    let fx = Fixture::new();
    fx.directive("make");
    fx.plane.set_territory_status(&fx.territory.id, "disabled").unwrap();

    let err = fx
        .plane
        .poll(&PollRequest {
            territory_id: fx.territory.id.clone(),
            supported_profiles: vec!["standard".to_string()],
            max_claims: 1,
            in_flight: None,
        })
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
}

#[test]
fn territories_only_see_their_own_account() {
    let fx = Fixture::new();
    fx.directive("make");

    let other = fx.plane.create_account("globex").unwrap();
    let foreign = fx
        .plane
        .register_territory(&RegisterTerritory {
            account_id: other.id,
            name: "theirs".to_string(),
            kind: TerritoryKind::Desktop,
            capabilities: Vec::new(),
            max_concurrency: 4,
        })
        .unwrap();
    assert!(fx.poll_as(&foreign.id, &["standard"], 5).leases.is_empty());
    assert_eq!(fx.poll(1).leases.len(), 1);
}

#[test]
fn concurrent_pollers_never_share_a_directive() {
    let fx = Fixture::new();
    let total = 12;
    for i in 0..total {
        let f = fx.new_facility(&format!("ws{i}"));
        fx.directive_on(&f, &format!("job {i}"));
    }
    let territories: Vec<String> = (0..4)
        .map(|i| fx.second_territory(&format!("worker-{i}")).id)
        .collect();

    let barrier = Barrier::new(territories.len());
    let claimed: Vec<Vec<String>> = thread::scope(|s| {
        let handles: Vec<_> = territories
            .iter()
            .map(|tid| {
                let fx = &fx;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    for _ in 0..3 {
                        let resp = fx.poll_as(tid, &["standard"], 2);
                        mine.extend(resp.leases.into_iter().map(|l| l.directive_id));
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let all: Vec<String> = claimed.into_iter().flatten().collect();
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), unique.len(), "a directive was leased twice");
    assert_eq!(all.len(), total);

    let leased = fx
        .plane
        .list_directives(&fx.account.id, Some(DirectiveState::Leased))
        .unwrap();
    assert_eq!(leased.len(), total);
}

#[test]
fn queued_directive_with_a_cancel_flag_is_canceled_instead_of_leased() {
    let fx = Fixture::new();
    let flagged = fx.directive("make");
    let next = fx.directive("make check");
    fx.plane
        .store()
        .broker()
        .with_tx("test", "flag", |conn| {
            directive::set_cancel_requested(conn, &flagged.id, T0)
        })
        .unwrap();

    let resp = fx.poll(2);
    let granted: Vec<_> = resp.leases.iter().map(|l| l.directive_id.clone()).collect();
    assert_eq!(granted, vec![next.id.clone()]);
    assert_eq!(
        fx.plane.get_directive(&flagged.id).unwrap().state,
        DirectiveState::Canceled
    );
}
