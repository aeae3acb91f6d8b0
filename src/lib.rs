//! Marshal: a control plane that leases directives to polling territories.
//!
//! A **directive** is one requested command run against a **facility**
//! (workspace) under a sandbox profile. **Territories** (remote agents) poll
//! for work, receive a time-boxed lease plus a scoped token, report
//! `started` / `heartbeat` / log chunks / `finished`, and the plane reclaims
//! leases whose holder went silent.
//!
//! # Guarantees
//!
//! - **At most one claimer per directive**: claims are compare-and-swap
//!   transitions inside one `BEGIN IMMEDIATE` unit of work.
//! - **Workspace exclusivity**: a facility is locked by at most one
//!   non-terminal directive; the lock never waits, it fails fast.
//! - **Idempotent reporting**: log chunks dedupe on (directive, stream, seq),
//!   and `finished` reports dedupe on a canonical content hash.
//! - **Capability ceilings**: policies only ever narrow what a directive gets.
//!
//! # Crate Structure
//!
//! - [`core`]: errors, config, storage, clock, and the
//!   [`core::plane::ControlPlane`] facade
//! - [`plugins`]: directive state machine, facility lock, policy, token,
//!   territory registry, poll, reaper, logs, results, audit
//!
//! # Examples
//!
//! ```bash
//! marshal init
//! marshal account add --name acme
//! marshal territory register --account <acct> --name build-01 --max-concurrency 2
//! marshal facility add --account <acct> --owner alice --name repo --mount-path /workspace
//! marshal directive create --account <acct> --facility <fac> --requester alice --command "make test"
//! marshal agent --territory <ter> poll --profile standard
//! ```

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{
    AccountCommand, AgentCommand, Cli, Command, DirectiveCommand, FacilityCommand, PolicyCommand,
    TerritoryCommand,
};
use crate::core::error::MarshalError;
use crate::core::plane::ControlPlane;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::directive::{CreateDirective, DirectiveState, FinishStatus};
use crate::plugins::logs::{LogChunk, LogStream};
use crate::plugins::poll::PollRequest;
use crate::plugins::policy::{PolicyDef, RequestedCapabilities};
use crate::plugins::reaper;
use crate::plugins::result::FinishedReport;
use crate::plugins::territory::{RegisterTerritory, TerritoryKind};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

fn emit<T: Serialize>(cmd: &str, key: &str, value: &T) -> Result<()> {
    let mut extra = serde_json::Map::new();
    extra.insert(key.to_string(), serde_json::to_value(value)?);
    let envelope = time::command_envelope(cmd, "ok", JsonValue::Object(extra));
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

/// Error envelope printed by the binary. Marshal errors keep their wire code;
/// anything else surfaced at the CLI layer is an input problem.
pub fn error_envelope(err: &anyhow::Error) -> JsonValue {
    let marshal_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<MarshalError>());
    let code = marshal_err.map(MarshalError::code).unwrap_or("invalid_param");
    let mut envelope = json!({
        "status": "error",
        "code": code,
        "message": format!("{:#}", err),
    });
    if let Some(reason) = marshal_err.and_then(MarshalError::reason) {
        envelope["reason"] = json!(reason);
    }
    envelope
}

fn read_json_arg(inline: Option<String>, file: Option<&Path>) -> Result<String> {
    match (inline, file) {
        (Some(raw), _) => Ok(raw),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        (None, None) => anyhow::bail!(MarshalError::InvalidParam(
            "either --json or --file is required".to_string()
        )),
    }
}

fn parse_health(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut health = BTreeMap::new();
    for pair in pairs {
        let Some((driver, state)) = pair.split_once('=') else {
            anyhow::bail!(MarshalError::InvalidParam(format!(
                "expected driver=state, got '{}'",
                pair
            )));
        };
        health.insert(driver.trim().to_string(), state.trim().to_string());
    }
    Ok(health)
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = Store::resolve_root(cli.store.as_deref());
    let plane = ControlPlane::open(&root)
        .with_context(|| format!("opening store {}", root.display()))?;

    match cli.command {
        Command::Init => emit("init", "store", &json!({ "root": plane.store().root }))?,
        Command::Account(a) => match a.command {
            AccountCommand::Add { name } => emit("account.add", "account", &plane.create_account(&name)?)?,
        },
        Command::Territory(t) => match t.command {
            TerritoryCommand::Register {
                account,
                name,
                kind,
                max_concurrency,
                capabilities,
            } => {
                let req = RegisterTerritory {
                    account_id: account,
                    name,
                    kind: kind.parse::<TerritoryKind>()?,
                    capabilities,
                    max_concurrency,
                };
                emit("territory.register", "territory", &plane.register_territory(&req)?)?
            }
            TerritoryCommand::Health {
                territory,
                drivers,
                max_concurrency,
            } => {
                let health = parse_health(&drivers)?;
                let record = plane.report_territory_health(&territory, &health, max_concurrency)?;
                emit("territory.health", "territory", &record)?
            }
            TerritoryCommand::Status { territory, status } => emit(
                "territory.status",
                "territory",
                &plane.set_territory_status(&territory, &status)?,
            )?,
            TerritoryCommand::Get { territory } => {
                emit("territory.get", "territory", &plane.get_territory(&territory)?)?
            }
        },
        Command::Facility(f) => match f.command {
            FacilityCommand::Add {
                account,
                owner,
                territory,
                name,
                mount_path,
            } => {
                let record =
                    plane.create_facility(&account, &owner, territory.as_deref(), &name, &mount_path)?;
                emit("facility.add", "facility", &record)?
            }
            FacilityCommand::Get { facility } => {
                emit("facility.get", "facility", &plane.get_facility(&facility)?)?
            }
        },
        Command::Policy(p) => match p.command {
            PolicyCommand::Put { json, file } => {
                let raw = read_json_arg(json, file.as_deref())?;
                let def: PolicyDef = serde_json::from_str(&raw).context("parsing policy definition")?;
                emit("policy.put", "policy", &plane.upsert_policy(&def)?)?
            }
            PolicyCommand::Deactivate { id } => {
                plane.deactivate_policy(&id)?;
                emit("policy.deactivate", "policy_id", &id)?
            }
        },
        Command::Directive(d) => run_directive(&plane, d.command)?,
        Command::Agent(a) => run_agent(&plane, &a.territory, a.command)?,
        Command::Reap { watch } => {
            if watch {
                let stop = AtomicBool::new(false);
                let interval = Duration::from_secs(plane.config().reaper_interval_seconds);
                reaper::run_reaper_loop(&plane.reaper(), interval, &stop)?;
            } else {
                emit("reap", "report", &plane.reap()?)?
            }
        }
    }
    Ok(())
}

fn run_directive(plane: &ControlPlane, command: DirectiveCommand) -> Result<()> {
    match command {
        DirectiveCommand::Create {
            account,
            facility,
            requester,
            command,
            shell,
            cwd,
            profile,
            timeout,
            capabilities,
        } => {
            let requested_capabilities: RequestedCapabilities = match capabilities {
                Some(raw) => serde_json::from_str(&raw).context("parsing --capabilities")?,
                None => RequestedCapabilities::default(),
            };
            let req = CreateDirective {
                account_id: account,
                facility_id: facility,
                requester_id: requester,
                command,
                shell,
                cwd,
                sandbox_profile: profile,
                timeout_seconds: timeout,
                requested_capabilities,
            };
            emit("directive.create", "directive", &plane.create_directive(&req)?)
        }
        DirectiveCommand::Approve { id, actor } => {
            emit("directive.approve", "directive", &plane.approve(&id, &actor)?)
        }
        DirectiveCommand::Reject { id, actor } => {
            emit("directive.reject", "directive", &plane.reject(&id, &actor)?)
        }
        DirectiveCommand::Cancel { id, actor } => {
            emit("directive.cancel", "directive", &plane.request_cancel(&id, &actor)?)
        }
        DirectiveCommand::Get { id } => emit("directive.get", "directive", &plane.get_directive(&id)?),
        DirectiveCommand::List { account, state } => {
            let state = state.map(|s| s.parse::<DirectiveState>()).transpose()?;
            emit("directive.list", "directives", &plane.list_directives(&account, state)?)
        }
        DirectiveCommand::Logs { id, stream } => {
            let bytes = plane.read_logs(&id, stream.parse::<LogStream>()?)?;
            emit("directive.logs", "output", &String::from_utf8_lossy(&bytes))
        }
        DirectiveCommand::Audit { id } => {
            emit("directive.audit", "events", &plane.audit_events(Some(&id))?)
        }
    }
}

fn run_agent(plane: &ControlPlane, territory: &str, command: AgentCommand) -> Result<()> {
    match command {
        AgentCommand::Poll {
            profiles,
            max_claims,
            in_flight,
        } => {
            let req = PollRequest {
                territory_id: territory.to_string(),
                supported_profiles: profiles,
                max_claims,
                in_flight,
            };
            emit("agent.poll", "poll", &plane.poll(&req)?)
        }
        AgentCommand::Started {
            token,
            sandbox_version,
            nexus_version,
        } => {
            let outcome = plane.started(
                territory,
                &token,
                sandbox_version.as_deref(),
                nexus_version.as_deref(),
            )?;
            emit("agent.started", "started", &outcome)
        }
        AgentCommand::Heartbeat { token } => {
            emit("agent.heartbeat", "heartbeat", &plane.heartbeat(territory, &token)?)
        }
        AgentCommand::Log {
            token,
            stream,
            seq,
            data,
            file,
            truncated,
        } => {
            let bytes = match (data, file) {
                (Some(data), _) => data.into_bytes(),
                (None, Some(path)) => {
                    fs::read(&path).with_context(|| format!("reading {}", path.display()))?
                }
                (None, None) => Vec::new(),
            };
            let chunk = LogChunk {
                stream: stream.parse::<LogStream>()?,
                seq,
                bytes: &bytes,
                truncated,
            };
            emit("agent.log", "log_chunk", &plane.log_chunk(territory, &token, &chunk)?)
        }
        AgentCommand::Finished {
            token,
            status,
            exit_code,
            stdout_truncated,
            stderr_truncated,
            manifest,
            diff,
        } => {
            let mut report = FinishedReport::new(status.parse::<FinishStatus>()?);
            report.exit_code = exit_code;
            report.stdout_truncated = stdout_truncated;
            report.stderr_truncated = stderr_truncated;
            report.manifest = manifest
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("parsing --manifest")?;
            let diff_bytes = diff
                .map(|path| fs::read(&path).with_context(|| format!("reading {}", path.display())))
                .transpose()?;
            let outcome = plane.finished(territory, &token, &report, diff_bytes.as_deref())?;
            emit("agent.finished", "finished", &outcome)
        }
        AgentCommand::Diff { token, file } => {
            let bytes = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            emit("agent.diff", "diff", &plane.attach_diff(territory, &token, &bytes)?)
        }
    }
}
