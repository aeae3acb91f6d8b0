#[path = "../common/fixture.rs"]
mod fixture;

use fixture::{Fixture, T0};
use marshal::core::config::PlaneConfig;
use marshal::plugins::directive::{DirectiveState, FinishStatus};
use marshal::plugins::result::{DiffRef, FinishedReport};
use serde_json::json;

fn report(status: FinishStatus, exit_code: i64) -> FinishedReport {
    let mut r = FinishedReport::new(status);
    r.exit_code = Some(exit_code);
    r.manifest = Some(json!({"artifacts": ["target/app"], "count": 1}));
    r
}

#[test]
fn leased_directive_finishes_in_one_call() {
    let fx = Fixture::new();
    let d = fx.directive("make");
    let lease = fx.claim_one();

    fx.clock.advance(30);
    let outcome = fx
        .plane
        .finished(&fx.territory.id, &lease.token, &report(FinishStatus::Succeeded, 0), None)
        .unwrap();
    assert_eq!(outcome.final_state, DirectiveState::Succeeded);
    assert!(!outcome.duplicate);

    let rec = fx.plane.get_directive(&d.id).unwrap();
    assert_eq!(rec.state, DirectiveState::Succeeded);
    assert_eq!(rec.started_at, Some(T0 + 30));
    assert_eq!(rec.finished_at, Some(T0 + 30));
    assert_eq!(rec.exit_code, Some(0));
    assert_eq!(rec.finished_status.as_deref(), Some("succeeded"));
    assert!(rec.lease_expires_at.is_none());
    assert_eq!(rec.result_payload.unwrap()["manifest"]["count"], 1);
    assert_eq!(
        fx.plane.get_facility(&fx.facility.id).unwrap().locked_by_directive_id,
        None
    );
}

#[test]
fn identical_report_is_a_duplicate_and_a_different_one_conflicts() {
    let fx = Fixture::new();
    fx.directive("make");
    let lease = fx.claim_one();
    let t = &fx.territory.id;
    fx.plane.started(t, &lease.token, None, None).unwrap();

    let first = report(FinishStatus::Failed, 2);
    fx.plane.finished(t, &lease.token, &first, None).unwrap();

    // Key order in free-form fields does not matter.
    let mut replay = first.clone();
    replay.manifest = Some(json!({"count": 1, "artifacts": ["target/app"]}));
    let again = fx.plane.finished(t, &lease.token, &replay, None).unwrap();
    assert!(again.duplicate);
    assert_eq!(again.final_state, DirectiveState::Failed);

    let err = fx
        .plane
        .finished(t, &lease.token, &report(FinishStatus::Failed, 3), None)
        .unwrap_err();
    assert_eq!(err.code(), "invalid_state");

    let err = fx
        .plane
        .finished(t, &lease.token, &report(FinishStatus::Succeeded, 2), None)
        .unwrap_err();
    assert_eq!(err.code(), "invalid_state");
}

#[test]
fn truncation_flags_only_turn_on() {
    let fx = Fixture::new();
    let d = fx.directive("make");
    let lease = fx.claim_one();

    let mut r = report(FinishStatus::Succeeded, 0);
    r.stderr_truncated = true;
    fx.plane.finished(&fx.territory.id, &lease.token, &r, None).unwrap();

    let rec = fx.plane.get_directive(&d.id).unwrap();
    assert!(!rec.stdout_truncated);
    assert!(rec.stderr_truncated);
}

#[test]
fn diff_is_stored_once() {
    let fx = Fixture::new();
    let d = fx.directive("make fmt");
    let lease = fx.claim_one();
    let t = &fx.territory.id;
    let diff: &[u8] = b"--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-fn a(){}\n+fn a() {}\n";

    let r = report(FinishStatus::Succeeded, 0);
    fx.plane.finished(t, &lease.token, &r, Some(diff)).unwrap();

    let rec = fx.plane.get_directive(&d.id).unwrap();
    let expected = DiffRef::of(diff);
    assert_eq!(rec.diff_sha256.as_deref(), Some(expected.sha256.as_str()));
    assert_eq!(rec.diff_size, Some(diff.len() as i64));

    let replay = fx.plane.finished(t, &lease.token, &r, Some(diff)).unwrap();
    assert!(replay.duplicate);

    let same = fx.plane.attach_diff(t, &lease.token, diff).unwrap();
    assert!(same.duplicate);

    let err = fx.plane.attach_diff(t, &lease.token, b"other").unwrap_err();
    assert_eq!(err.code(), "invalid_state");

    // The diff digest is part of the report identity.
    let err = fx.plane.finished(t, &lease.token, &r, None).unwrap_err();
    assert_eq!(err.code(), "invalid_state");
}

#[test]
fn diff_attached_before_finishing_must_match() {
    let fx = Fixture::new();
    let d = fx.directive("make fmt");
    let lease = fx.claim_one();
    let t = &fx.territory.id;
    fx.plane.started(t, &lease.token, None, None).unwrap();

    let attached = fx.plane.attach_diff(t, &lease.token, b"+x\n").unwrap();
    assert!(!attached.duplicate);
    assert_eq!(attached.size, 3);

    fx.plane
        .finished(t, &lease.token, &report(FinishStatus::Succeeded, 0), Some(b"+x\n".as_slice()))
        .unwrap();
    assert_eq!(fx.plane.get_directive(&d.id).unwrap().state, DirectiveState::Succeeded);
}

#[test]
fn conflicting_diff_rolls_back_the_finish() {
    let fx = Fixture::new();
    let d = fx.directive("make fmt");
    let lease = fx.claim_one();
    let t = &fx.territory.id;
    fx.plane.attach_diff(t, &lease.token, b"+x\n").unwrap();

    let err = fx
        .plane
        .finished(t, &lease.token, &report(FinishStatus::Succeeded, 0), Some(b"+y\n".as_slice()))
        .unwrap_err();
    assert_eq!(err.code(), "invalid_state");
    assert_eq!(fx.plane.get_directive(&d.id).unwrap().state, DirectiveState::Leased);
}

#[test]
fn oversized_diff_is_rejected() {
    let fx = Fixture::with_config(PlaneConfig {
        max_diff_bytes: 4,
        ..PlaneConfig::default()
    });
    fx.directive("make");
    let lease = fx.claim_one();

    let err = fx
        .plane
        .attach_diff(&fx.territory.id, &lease.token, b"12345")
        .unwrap_err();
    assert_eq!(err.code(), "invalid_param");
}
