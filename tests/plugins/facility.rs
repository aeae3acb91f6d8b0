#[path = "../common/fixture.rs"]
mod fixture;

use fixture::Fixture;
use marshal::core::error::MarshalError;
use marshal::plugins::directive::{DirectiveState, FinishStatus};
use marshal::plugins::facility;
use marshal::plugins::result::FinishedReport;

#[test]
fn one_directive_per_facility_at_a_time() {
    let fx = Fixture::new();
    let first = fx.directive("build");
    let second = fx.directive("test");

    let resp = fx.poll(2);
    assert_eq!(resp.leases.len(), 1);
    assert_eq!(resp.leases[0].directive_id, first.id);
    assert_eq!(
        fx.plane.get_facility(&fx.facility.id).unwrap().locked_by_directive_id,
        Some(first.id.clone())
    );
    assert_eq!(
        fx.plane.get_directive(&second.id).unwrap().state,
        DirectiveState::Queued
    );

    let token = &resp.leases[0].token;
    fx.plane
        .finished(
            &fx.territory.id,
            token,
            &FinishedReport::new(FinishStatus::Succeeded),
            None,
        )
        .unwrap();
    assert_eq!(
        fx.plane.get_facility(&fx.facility.id).unwrap().locked_by_directive_id,
        None
    );

    let next = fx.claim_one();
    assert_eq!(next.directive_id, second.id);
}

#[test]
fn distinct_facilities_run_in_parallel() {
    let fx = Fixture::new();
    let other = fx.new_facility("docs");
    fx.directive("build");
    fx.directive_on(&other, "mkdocs build");

    let resp = fx.poll(2);
    assert_eq!(resp.leases.len(), 2);
    let facilities: Vec<&str> = resp
        .leases
        .iter()
        .map(|l| l.spec.workspace.facility_id.as_str())
        .collect();
    assert!(facilities.contains(&fx.facility.id.as_str()));
    assert!(facilities.contains(&other.id.as_str()));
}

#[test]
fn held_lock_fails_fast_with_conflict() {
    let fx = Fixture::new();
    let holder = fx.directive("build");
    let waiter = fx.directive("test");
    fx.claim_one();

    let broker = fx.plane.store().broker();
    let err = broker
        .with_tx("test", "lock", |conn| {
            facility::lock(conn, &fx.facility.id, &waiter.id, fx.plane.now())
        })
        .unwrap_err();
    match err {
        MarshalError::LockConflict { facility_id, holder: h } => {
            assert_eq!(facility_id, fx.facility.id);
            assert_eq!(h, holder.id);
        }
        other => panic!("expected lock conflict, got {other:?}"),
    }

    // Relocking by the holder is a no-op.
    broker
        .with_tx("test", "relock", |conn| {
            facility::lock(conn, &fx.facility.id, &holder.id, fx.plane.now())
        })
        .unwrap();
}

#[test]
fn lock_held_by_a_terminal_directive_is_stale() {
    let fx = Fixture::new();
    let holder = fx.directive("build");
    let waiter = fx.directive("test");
    fx.claim_one();

    let broker = fx.plane.store().broker();
    broker
        .with_tx("test", "force_terminal", |conn| {
            conn.execute(
                "UPDATE directives SET state = 'failed' WHERE id = ?1",
                [&holder.id],
            )?;
            Ok(())
        })
        .unwrap();

    let active = broker
        .with_read(|conn| facility::active_holder(conn, &fx.facility.id))
        .unwrap();
    assert_eq!(active, None);

    broker
        .with_tx("test", "takeover", |conn| {
            facility::lock(conn, &fx.facility.id, &waiter.id, fx.plane.now())
        })
        .unwrap();
    assert_eq!(
        fx.plane.get_facility(&fx.facility.id).unwrap().locked_by_directive_id,
        Some(waiter.id)
    );
}

#[test]
fn unlock_only_releases_for_the_holder() {
    let fx = Fixture::new();
    let holder = fx.directive("build");
    let other = fx.directive("test");
    fx.claim_one();

    let broker = fx.plane.store().broker();
    let released = broker
        .with_tx("test", "unlock", |conn| {
            facility::unlock(conn, &fx.facility.id, &other.id, fx.plane.now())
        })
        .unwrap();
    assert!(!released);

    let released = broker
        .with_tx("test", "unlock", |conn| {
            facility::unlock(conn, &fx.facility.id, &holder.id, fx.plane.now())
        })
        .unwrap();
    assert!(released);
}

#[test]
fn lock_rejects_a_directive_for_another_facility() {
    let fx = Fixture::new();
    let other = fx.new_facility("docs");
    let d = fx.directive_on(&other, "mkdocs build");

    let err = fx
        .plane
        .store()
        .broker()
        .with_tx("test", "lock", |conn| {
            facility::lock(conn, &fx.facility.id, &d.id, fx.plane.now())
        })
        .unwrap_err();
    assert_eq!(err.code(), "invalid_param");
}

#[test]
fn facility_pinned_to_a_foreign_territory_is_rejected() {
    let fx = Fixture::new();
    let other = fx.plane.create_account("globex").unwrap();
    let err = fx
        .plane
        .create_facility(&other.id, "bob", Some(&fx.territory.id), "repo", "/workspace")
        .unwrap_err();
    assert_eq!(err.code(), "invalid_param");

    let pinned = fx
        .plane
        .create_facility(&fx.account.id, "alice", Some(&fx.territory.id), "pinned", "/srv/p")
        .unwrap();
    assert_eq!(pinned.territory_id.as_deref(), Some(fx.territory.id.as_str()));
}

#[test]
fn pinned_facility_is_only_claimed_by_its_territory() {
    let fx = Fixture::new();
    let peer = fx.second_territory("build-02");
    let pinned = fx
        .plane
        .create_facility(&fx.account.id, "alice", Some(&fx.territory.id), "pinned", "/srv/p")
        .unwrap();
    let d = fx.directive_on(&pinned, "make");

    assert!(fx.poll_as(&peer.id, &["standard"], 1).leases.is_empty());
    let lease = fx.claim_one();
    assert_eq!(lease.directive_id, d.id);
    assert_eq!(lease.spec.workspace.mount_path, "/srv/p");
}
