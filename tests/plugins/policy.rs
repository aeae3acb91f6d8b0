#[path = "../common/fixture.rs"]
mod fixture;

use fixture::Fixture;
use marshal::plugins::directive::DirectiveState;
use marshal::plugins::policy::{
    self, FsCapability, NetCapability, NetMode, Policy, PolicyDef, PolicyRules, PolicyScope,
    RequestedCapabilities, SandboxProfileRules, Verdict,
};
use std::collections::{BTreeMap, BTreeSet};

fn stored(id: &str, priority: i64, rules: PolicyRules) -> Policy {
    Policy {
        id: id.to_string(),
        name: id.to_string(),
        priority,
        scope: PolicyScope::Global,
        active: true,
        rules,
    }
}

fn fs_rules(read: &[&str], write: &[&str]) -> PolicyRules {
    PolicyRules {
        fs: Some(FsCapability::new(read.iter().copied(), write.iter().copied())),
        ..PolicyRules::default()
    }
}

fn net_rules(net: NetCapability) -> PolicyRules {
    PolicyRules {
        net: Some(net),
        ..PolicyRules::default()
    }
}

#[test]
fn fs_ceiling_is_independent_of_policy_order() {
    let a = stored("a", 10, fs_rules(&["/workspace", "/opt"], &["/workspace"]));
    let b = stored("b", 1, fs_rules(&["/workspace/src", "/opt/tools"], &["/workspace/src/out"]));
    let c = stored("c", 5, fs_rules(&["/"], &["/workspace/src"]));

    let forward = policy::merge(&[a.clone(), b.clone(), c.clone()]).fs.unwrap();
    let backward = policy::merge(&[c, b, a]).fs.unwrap();
    assert_eq!(forward, backward);
    assert_eq!(forward, FsCapability::new(["/opt/tools", "/workspace/src"], ["/workspace/src/out"]));

    let requested = FsCapability::new(["/workspace"], ["/workspace"]);
    assert_eq!(forward.intersect(&requested), requested.intersect(&forward));
}

#[test]
fn fs_intersection_never_widens() {
    let ceiling = FsCapability::new(["/workspace/src"], ["/workspace/src"]);
    let wider = FsCapability::new(["/"], ["/workspace"]);
    let got = ceiling.intersect(&wider);
    assert_eq!(got, ceiling);

    let sibling = FsCapability::new(["/workspace/srcs"], Vec::<&str>::new());
    assert!(ceiling.intersect(&sibling).read.is_empty());
}

#[test]
fn net_takes_the_most_restrictive_mode() {
    let open = NetCapability::unrestricted();
    let listed = NetCapability::allowlist(["github.com:443"]);
    let closed = NetCapability::none();

    assert_eq!(policy::merge_net([&open, &listed]), Some(listed.clone()));
    assert_eq!(policy::merge_net([&listed, &closed, &open]), Some(closed.clone()));
    assert_eq!(policy::merge_net(Vec::<&NetCapability>::new()), None);

    let other = NetCapability::allowlist(["crates.io:443"]);
    let merged = policy::merge_net([&listed, &other]).unwrap();
    assert_eq!(merged.mode, NetMode::Allowlist);
    assert_eq!(merged.allow.len(), 2);
}

#[test]
fn requested_unrestricted_net_is_clamped_to_the_allowlist() {
    let fx = Fixture::new();
    fx.put_policy(
        "egress",
        0,
        PolicyScope::Global,
        net_rules(NetCapability::allowlist(["github.com:443"])),
    );

    let mut req = fx.request("git fetch");
    req.requested_capabilities = RequestedCapabilities {
        net: Some(NetCapability::unrestricted()),
        ..RequestedCapabilities::default()
    };
    let d = fx.plane.create_directive(&req).unwrap();
    assert_eq!(d.state, DirectiveState::Queued);
    assert_eq!(
        d.effective_capabilities.net,
        NetCapability::allowlist(["github.com:443"])
    );

    let lease = fx.claim_one();
    assert_eq!(lease.spec.capabilities.net.mode, NetMode::Allowlist);
    assert!(lease.spec.capabilities.net.allow.contains("github.com:443"));
}

#[test]
fn absent_net_request_means_no_network() {
    let fx = Fixture::new();
    let d = fx.directive("make");
    assert_eq!(d.effective_capabilities.net, NetCapability::none());
}

#[test]
fn secrets_are_granted_only_when_a_policy_lists_them() {
    let fx = Fixture::new();
    let mut req = fx.request("npm publish");
    req.requested_capabilities.secrets =
        BTreeSet::from(["NPM_TOKEN".to_string(), "AWS_KEY".to_string()]);

    let ungoverned = fx.plane.create_directive(&req).unwrap();
    assert!(ungoverned.effective_capabilities.secrets.is_empty());
    fx.plane.request_cancel(&ungoverned.id, "alice").unwrap();

    fx.put_policy(
        "registry",
        10,
        PolicyScope::Account(fx.account.id.clone()),
        PolicyRules {
            secrets: Some(BTreeSet::from(["NPM_TOKEN".to_string()])),
            ..PolicyRules::default()
        },
    );
    fx.put_policy(
        "broad",
        1,
        PolicyScope::Global,
        PolicyRules {
            secrets: Some(BTreeSet::from(["NPM_TOKEN".to_string(), "AWS_KEY".to_string()])),
            ..PolicyRules::default()
        },
    );

    let d = fx.plane.create_directive(&req).unwrap();
    assert_eq!(
        d.effective_capabilities.secrets,
        BTreeSet::from(["NPM_TOKEN".to_string()])
    );
    assert_eq!(d.policy_snapshot.policies[0].name, "registry");
}

#[test]
fn approval_verdicts_merge_to_the_strictest() {
    let mut lax = BTreeMap::new();
    lax.insert("fs_write".to_string(), Verdict::Skip);
    let mut strict = BTreeMap::new();
    strict.insert("fs_write".to_string(), Verdict::NeedsApproval);

    let fx = Fixture::new();
    fx.put_policy(
        "lax",
        100,
        PolicyScope::Global,
        PolicyRules {
            approval: lax,
            ..PolicyRules::default()
        },
    );
    fx.put_policy(
        "strict",
        1,
        PolicyScope::Facility(fx.facility.id.clone()),
        PolicyRules {
            approval: strict,
            ..PolicyRules::default()
        },
    );

    let mut req = fx.request("make install");
    req.requested_capabilities.fs = Some(FsCapability::new(["/workspace"], ["/workspace"]));
    let d = fx.plane.create_directive(&req).unwrap();
    assert_eq!(d.state, DirectiveState::AwaitingApproval);
    assert!(
        d.policy_snapshot
            .reasons
            .contains(&"approval.fs_write=needs_approval".to_string())
    );

    // Read-only work does not trigger the key.
    let ro = fx.directive("make check");
    assert_eq!(ro.state, DirectiveState::Queued);
}

#[test]
fn forbidden_at_creation_is_canceled() {
    let fx = Fixture::new();
    let mut approval = BTreeMap::new();
    approval.insert("host_profile".to_string(), Verdict::Forbidden);
    fx.put_policy(
        "no-host",
        0,
        PolicyScope::Account(fx.account.id.clone()),
        PolicyRules {
            approval,
            ..PolicyRules::default()
        },
    );

    let mut req = fx.request("rm -rf /tmp/cache");
    req.sandbox_profile = "host".to_string();
    let d = fx.plane.create_directive(&req).unwrap();
    assert_eq!(d.state, DirectiveState::Canceled);
    assert!(d.finished_at.is_some());
    assert_eq!(d.policy_snapshot.verdict, Some(Verdict::Forbidden));
    assert!(fx.notifier.targets.lock().unwrap().is_empty());
}

#[test]
fn policy_added_after_creation_forbids_at_claim() {
    let fx = Fixture::new();
    let mut req = fx.request("systemctl restart app");
    req.sandbox_profile = "host".to_string();
    let d = fx.plane.create_directive(&req).unwrap();
    assert_eq!(d.state, DirectiveState::Queued);

    fx.put_policy(
        "profiles",
        0,
        PolicyScope::Global,
        PolicyRules {
            sandbox_profile_rules: Some(SandboxProfileRules {
                allowed: Some(BTreeSet::from(["standard".to_string()])),
                require_approval: BTreeSet::new(),
            }),
            ..PolicyRules::default()
        },
    );

    let resp = fx.poll_as(&fx.territory.id, &["host"], 1);
    assert!(resp.leases.is_empty());

    let rec = fx.plane.get_directive(&d.id).unwrap();
    assert_eq!(rec.state, DirectiveState::Canceled);
    assert_eq!(rec.policy_snapshot.verdict, Some(Verdict::Forbidden));
    let actions: Vec<String> = fx
        .plane
        .audit_events(Some(&d.id))
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&"directive.policy_forbidden".to_string()));
}

#[test]
fn claim_uses_the_current_policy() {
    let fx = Fixture::new();
    let d = fx.directive("make");
    assert!(d.effective_capabilities.fs.write.contains("/workspace"));

    fx.put_policy(
        "read-only",
        0,
        PolicyScope::Facility(fx.facility.id.clone()),
        fs_rules(&["/workspace"], &[]),
    );

    let lease = fx.claim_one();
    assert!(lease.spec.capabilities.fs.write.is_empty());
    let rec = fx.plane.get_directive(&d.id).unwrap();
    assert!(rec.effective_capabilities.fs.write.is_empty());

    let events = fx.plane.audit_events(Some(&d.id)).unwrap();
    let updated = events
        .iter()
        .find(|e| e.action == "directive.capabilities_updated")
        .expect("capability change is audited");
    assert!(updated.payload["before"]["fs"]["write"].as_array().unwrap().len() == 1);
}

#[test]
fn deactivated_and_foreign_policies_do_not_apply() {
    let fx = Fixture::new();
    let other = fx.plane.create_account("globex").unwrap();
    fx.put_policy(
        "theirs",
        0,
        PolicyScope::Account(other.id),
        net_rules(NetCapability::none()),
    );
    let id = fx.put_policy(
        "ours",
        0,
        PolicyScope::Global,
        net_rules(NetCapability::allowlist(["example.com:443"])),
    );
    fx.plane.deactivate_policy(&id).unwrap();

    let mut req = fx.request("curl https://example.com");
    req.requested_capabilities.net = Some(NetCapability::unrestricted());
    let d = fx.plane.create_directive(&req).unwrap();
    assert_eq!(d.effective_capabilities.net, NetCapability::unrestricted());
    assert!(d.policy_snapshot.policies.is_empty());

    assert_eq!(fx.plane.deactivate_policy("missing").unwrap_err().code(), "not_found");
}

#[test]
fn policy_definitions_parse_from_json() {
    let def: PolicyDef = serde_json::from_str(
        r#"{
            "name": "ci",
            "priority": 5,
            "scope": {"kind": "global"},
            "rules": {
                "fs": {"read": ["/workspace"], "write": []},
                "net": {"mode": "allowlist", "allow": ["github.com:443"]},
                "approval": {"net_unrestricted": "forbidden"}
            }
        }"#,
    )
    .unwrap();
    assert_eq!(def.scope, PolicyScope::Global);
    assert_eq!(def.rules.approval["net_unrestricted"], Verdict::Forbidden);

    let typo = serde_json::from_str::<PolicyDef>(
        r#"{"name": "x", "scope": {"kind": "global"}, "rules": {"netz": {}}}"#,
    );
    assert!(typo.is_err());
}
