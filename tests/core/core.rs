#[path = "../common/fixture.rs"]
mod fixture;

use fixture::{Fixture, T0};
use marshal::core::broker::DbBroker;
use marshal::core::config::{CONFIG_FILE_NAME, PlaneConfig};
use marshal::core::db;
use marshal::core::error::{AuthFailure, MarshalError};
use marshal::core::plane::ControlPlane;
use marshal::core::store::Store;
use marshal::core::time::ManualClock;
use marshal::plugins::territory::LogNotifier;
use marshal::plugins::token;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

#[test]
fn store_open_creates_schema_and_signing_key() {
    let tmp = tempdir().expect("tempdir");
    let plane = ControlPlane::open(tmp.path()).expect("open");

    assert!(plane.store().db_path().exists());
    let key_path = token::key_path(tmp.path());
    let hex_key = fs::read_to_string(&key_path).expect("key file");
    assert_eq!(hex_key.trim().len(), 64);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let conn = db::db_connect(&plane.store().db_path().to_string_lossy()).expect("connect");
    let journal: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal.to_lowercase(), "wal");
}

#[test]
fn reopened_store_keeps_the_signing_key() {
    let tmp = tempdir().expect("tempdir");
    let first = ControlPlane::open(tmp.path()).expect("open");
    let issued = first.signer().mint("dir", "ter", 1_000).unwrap();
    drop(first);

    let second = ControlPlane::open(tmp.path()).expect("reopen");
    let claims = second.signer().decode(&issued.token, 1_001).expect("decode");
    assert_eq!(claims.directive_id, "dir");
}

#[test]
fn store_root_prefers_explicit_path() {
    let explicit = tempdir().expect("tempdir");
    assert_eq!(Store::resolve_root(Some(explicit.path())), explicit.path());
}

#[test]
fn config_file_is_applied_on_open() {
    let tmp = tempdir().expect("tempdir");
    fs::write(
        tmp.path().join(CONFIG_FILE_NAME),
        "lease_ttl_seconds = 45\n[sandbox.drivers]\nstandard = \"firecracker\"\n",
    )
    .unwrap();
    let plane = ControlPlane::open(tmp.path()).expect("open");
    assert_eq!(plane.config().lease_ttl_seconds, 45);
    assert_eq!(plane.config().sandbox.driver_for("standard"), "firecracker");
    assert_eq!(plane.config().max_claims_per_poll, 5);
}

#[test]
fn invalid_config_is_rejected_before_the_store_opens() {
    let tmp = tempdir().expect("tempdir");
    let config = PlaneConfig {
        lease_ttl_seconds: 0,
        ..PlaneConfig::default()
    };
    let err = ControlPlane::with_parts(
        tmp.path(),
        config,
        Arc::new(ManualClock::new(T0)),
        Arc::new(LogNotifier),
    )
    .err()
    .expect("zero lease ttl is rejected");
    assert_eq!(err.code(), "config");
    assert!(!db::marshal_db_path(tmp.path()).exists());
}

#[test]
fn broker_serializes_concurrent_writers() {
    let tmp = tempdir().expect("tempdir");
    let broker = DbBroker::new(&tmp.path().join("counter.db"));
    broker
        .with_tx("test", "setup", |conn| {
            conn.execute("CREATE TABLE counter(n INTEGER NOT NULL)", [])?;
            conn.execute("INSERT INTO counter(n) VALUES (0)", [])?;
            Ok(())
        })
        .unwrap();

    let workers = 8;
    let barrier = Barrier::new(workers);
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..10 {
                    broker
                        .with_tx("test", "increment", |conn| {
                            let n: i64 = conn.query_row("SELECT n FROM counter", [], |r| r.get(0))?;
                            conn.execute("UPDATE counter SET n = ?1", [n + 1])?;
                            Ok(())
                        })
                        .expect("increment");
                }
            });
        }
    });

    let n: i64 = broker
        .with_read(|conn| Ok(conn.query_row("SELECT n FROM counter", [], |r| r.get(0))?))
        .unwrap();
    assert_eq!(n, 80);
}

#[test]
fn error_envelope_keeps_wire_codes() {
    let err = anyhow::Error::from(MarshalError::LockConflict {
        facility_id: "fac".into(),
        holder: "dir".into(),
    })
    .context("claiming work");
    let envelope = marshal::error_envelope(&err);
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["code"], "lock_conflict");
    assert!(envelope["message"].as_str().unwrap().contains("claiming work"));

    let plain = anyhow::anyhow!("bad flag");
    assert_eq!(marshal::error_envelope(&plain)["code"], "invalid_param");
    assert!(marshal::error_envelope(&plain).get("reason").is_none());
}

#[test]
fn error_envelope_carries_the_unauthorized_reason() {
    let err = anyhow::Error::from(MarshalError::unauthorized(
        AuthFailure::TokenExpired,
        "token expired at 1700000600",
    ));
    let envelope = marshal::error_envelope(&err);
    assert_eq!(envelope["code"], "unauthorized");
    assert_eq!(envelope["reason"], "token_expired");
}

#[test]
fn unknown_entities_are_not_found() {
    let fx = Fixture::new();
    assert_eq!(fx.plane.get_directive("nope").unwrap_err().code(), "not_found");
    assert_eq!(fx.plane.get_facility("nope").unwrap_err().code(), "not_found");
    assert_eq!(fx.plane.get_territory("nope").unwrap_err().code(), "not_found");
    assert_eq!(
        fx.plane
            .create_facility("no-account", "alice", None, "x", "/x")
            .unwrap_err()
            .code(),
        "not_found"
    );
}

#[test]
fn audit_trail_follows_the_directive_lifecycle() {
    let fx = Fixture::new();
    let d = fx.directive("make test");
    let lease = fx.claim_one();
    fx.plane
        .started(&fx.territory.id, &lease.token, Some("bwrap-0.8"), None)
        .unwrap();

    let actions: Vec<String> = fx
        .plane
        .audit_events(Some(&d.id))
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec!["directive.created", "directive.leased", "directive.started"]
    );

    let all = fx.plane.audit_events(None).unwrap();
    assert!(all.iter().any(|e| e.action == "territory.registered"));
}
