//! CLI struct definitions for the marshal command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "marshal",
    version = env!("CARGO_PKG_VERSION"),
    about = "Marshal leases directives to polling territories under capability policy."
)]
pub(crate) struct Cli {
    /// Store directory (defaults to $MARSHAL_STORE, then ./.marshal).
    #[clap(long, global = true)]
    pub store: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the store, schema, and signing key
    #[clap(name = "init")]
    Init,

    /// Tenant accounts
    #[clap(name = "account")]
    Account(AccountCli),

    /// Registered worker agents
    #[clap(name = "territory", visible_alias = "t")]
    Territory(TerritoryCli),

    /// Workspaces directives run against
    #[clap(name = "facility", visible_alias = "f")]
    Facility(FacilityCli),

    /// Capability policies
    #[clap(name = "policy", visible_alias = "p")]
    Policy(PolicyCli),

    /// Requester surface: create and manage directives
    #[clap(name = "directive", visible_alias = "d")]
    Directive(DirectiveCli),

    /// Territory surface: poll, report, stream logs
    #[clap(name = "agent", visible_alias = "a")]
    Agent(AgentCli),

    /// Reclaim abandoned leases
    #[clap(name = "reap")]
    Reap {
        /// Keep sweeping every `reaper_interval_seconds` until interrupted.
        #[clap(long)]
        watch: bool,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct AccountCli {
    #[clap(subcommand)]
    pub command: AccountCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum AccountCommand {
    /// Create an account
    Add {
        #[clap(long)]
        name: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct TerritoryCli {
    #[clap(subcommand)]
    pub command: TerritoryCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TerritoryCommand {
    /// Register a territory under an account
    Register {
        #[clap(long)]
        account: String,
        #[clap(long)]
        name: String,
        /// server | desktop | mobile | bridge
        #[clap(long, default_value = "server")]
        kind: String,
        #[clap(long, default_value_t = 1)]
        max_concurrency: i64,
        /// Declared capability (repeatable)
        #[clap(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Report sandbox driver health as `driver=state` pairs
    Health {
        #[clap(long)]
        territory: String,
        /// driver=state (repeatable), e.g. docker=unhealthy
        #[clap(long = "driver")]
        drivers: Vec<String>,
        #[clap(long)]
        max_concurrency: Option<i64>,
    },
    /// Enable or disable a territory
    Status {
        #[clap(long)]
        territory: String,
        /// active | disabled
        #[clap(long)]
        status: String,
    },
    /// Show one territory
    Get {
        #[clap(long)]
        territory: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct FacilityCli {
    #[clap(subcommand)]
    pub command: FacilityCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum FacilityCommand {
    /// Register a workspace
    Add {
        #[clap(long)]
        account: String,
        #[clap(long)]
        owner: String,
        #[clap(long)]
        territory: Option<String>,
        #[clap(long)]
        name: String,
        #[clap(long)]
        mount_path: String,
    },
    /// Show one facility and its lock holder
    Get {
        #[clap(long)]
        facility: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct PolicyCli {
    #[clap(subcommand)]
    pub command: PolicyCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum PolicyCommand {
    /// Create or replace a policy from a JSON definition
    Put {
        /// Inline JSON policy definition
        #[clap(long, conflicts_with = "file")]
        json: Option<String>,
        /// Path to a JSON policy definition
        #[clap(long)]
        file: Option<PathBuf>,
    },
    /// Stop a policy from applying
    Deactivate {
        #[clap(long)]
        id: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct DirectiveCli {
    #[clap(subcommand)]
    pub command: DirectiveCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum DirectiveCommand {
    /// Request a command run against a facility
    Create {
        #[clap(long)]
        account: String,
        #[clap(long)]
        facility: String,
        #[clap(long)]
        requester: String,
        #[clap(long)]
        command: String,
        #[clap(long, default_value = "bash")]
        shell: String,
        #[clap(long, default_value = ".")]
        cwd: String,
        #[clap(long, default_value = "standard")]
        profile: String,
        #[clap(long, default_value_t = 3600)]
        timeout: i64,
        /// Requested capabilities as JSON ({"fs":..,"net":..,"secrets":[..]})
        #[clap(long)]
        capabilities: Option<String>,
    },
    Approve {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "operator")]
        actor: String,
    },
    Reject {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "operator")]
        actor: String,
    },
    /// Request cancellation (idempotent)
    Cancel {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "operator")]
        actor: String,
    },
    Get {
        #[clap(long)]
        id: String,
    },
    List {
        #[clap(long)]
        account: String,
        #[clap(long)]
        state: Option<String>,
    },
    /// Print a stream's stored output
    Logs {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "stdout")]
        stream: String,
    },
    /// Audit trail for one directive
    Audit {
        #[clap(long)]
        id: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct AgentCli {
    /// Authenticated territory id
    #[clap(long)]
    pub territory: String,
    #[clap(subcommand)]
    pub command: AgentCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum AgentCommand {
    /// Claim queued work
    Poll {
        /// Supported sandbox profile (repeatable)
        #[clap(long = "profile", required = true)]
        profiles: Vec<String>,
        #[clap(long, default_value_t = 1)]
        max_claims: u32,
        /// Directives currently running on this territory
        #[clap(long)]
        in_flight: Option<i64>,
    },
    Started {
        #[clap(long)]
        token: String,
        #[clap(long)]
        sandbox_version: Option<String>,
        #[clap(long)]
        nexus_version: Option<String>,
    },
    Heartbeat {
        #[clap(long)]
        token: String,
    },
    /// Append a log chunk read from a file (or --data)
    Log {
        #[clap(long)]
        token: String,
        #[clap(long)]
        stream: String,
        #[clap(long)]
        seq: i64,
        #[clap(long, conflicts_with = "file")]
        data: Option<String>,
        #[clap(long)]
        file: Option<PathBuf>,
        #[clap(long)]
        truncated: bool,
    },
    Finished {
        #[clap(long)]
        token: String,
        /// succeeded | failed | canceled | timed_out
        #[clap(long)]
        status: String,
        #[clap(long)]
        exit_code: Option<i64>,
        #[clap(long)]
        stdout_truncated: bool,
        #[clap(long)]
        stderr_truncated: bool,
        /// Artifact manifest as JSON
        #[clap(long)]
        manifest: Option<String>,
        /// Diff file to attach
        #[clap(long)]
        diff: Option<PathBuf>,
    },
    /// Attach a diff without finishing
    Diff {
        #[clap(long)]
        token: String,
        #[clap(long)]
        file: PathBuf,
    },
}
