//! CLI struct definitions for the Carapace command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use crate::plugins::governance_store::{DecisionCategory, FindingStatus, TaskReviewKind};
use crate::plugins::holistic::GateAction;
use crate::plugins::reviewer::Verdict;
use crate::plugins::tier::{CallerRole, GraphOperation, ProtectionTier};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "carapace",
    version = env!("CARGO_PKG_VERSION"),
    about = "Governance gate and institutional memory for multi-agent work"
)]
pub(crate) struct Cli {
    /// Project directory (defaults to the nearest ancestor holding `.carapace/`, else the cwd).
    #[clap(long, global = true)]
    pub project: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "json")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Tier-protected knowledge graph
    #[clap(name = "graph", visible_alias = "g")]
    Graph(GraphCli),

    /// Decision, plan and completion reviews
    #[clap(name = "decision", visible_alias = "d")]
    Decision(DecisionCli),

    /// Governed tasks and their review blockers
    #[clap(name = "task", visible_alias = "t")]
    Task(TaskCli),

    /// Holistic session reviews and the action gate
    #[clap(name = "session", visible_alias = "s")]
    Session(SessionCli),

    /// Deterministic-tool findings and dismissals
    #[clap(name = "trust")]
    Trust(TrustCli),

    /// Aggregate governance counts
    #[clap(name = "status")]
    Status,

    /// Show the brokered mutation audit log
    #[clap(name = "audit")]
    Audit {
        /// Only the last N events.
        #[clap(long)]
        limit: Option<usize>,
    },

    /// Print subsystem command schemas
    #[clap(name = "schema")]
    Schema {
        #[clap(long)]
        subsystem: Option<String>,
    },
}

// ===== graph =====

#[derive(clap::Args, Debug)]
pub(crate) struct GraphCli {
    /// Who is calling: human callers bypass tier protection.
    #[clap(long, global = true, value_enum, default_value = "agent")]
    pub role: CallerRole,
    /// Approval flag for writes to approval-gated entities.
    #[clap(long, global = true)]
    pub approved: bool,
    #[clap(subcommand)]
    pub command: GraphCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum GraphCommand {
    /// Create an entity.
    Create {
        #[clap(long)]
        name: String,
        #[clap(long)]
        kind: String,
        /// Observation (repeatable).
        #[clap(long = "obs")]
        observations: Vec<String>,
    },
    /// Append observations to an entity.
    Observe {
        name: String,
        #[clap(long = "obs", required = true)]
        observations: Vec<String>,
    },
    /// Remove observations from an entity.
    Forget {
        name: String,
        #[clap(long = "obs", required = true)]
        observations: Vec<String>,
    },
    /// Delete an entity and every relation touching it.
    Delete { name: String },
    /// Create a relation.
    Relate {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
        #[clap(long)]
        kind: String,
    },
    /// Delete an exactly matching relation.
    Unrelate {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
        #[clap(long)]
        kind: String,
    },
    /// Case-insensitive search over names and observations.
    Search { query: String },
    /// Show one entity with its tier and relations.
    Get { name: String },
    /// List entities of one tier.
    Tier {
        #[clap(value_enum)]
        tier: ProtectionTier,
    },
    /// Dump the whole graph.
    Read,
    /// Check whether the caller may perform an operation.
    Access {
        name: String,
        #[clap(long, value_enum, default_value = "add-observations")]
        op: GraphOperation,
    },
    /// Rewrite the log from current state.
    Compact,
}

// ===== decision =====

#[derive(clap::Args, Debug)]
pub(crate) struct DecisionCli {
    #[clap(subcommand)]
    pub command: DecisionCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum DecisionCommand {
    /// Submit a decision for review.
    Submit {
        #[clap(long)]
        task: String,
        #[clap(long)]
        agent: String,
        #[clap(long, value_enum)]
        category: DecisionCategory,
        #[clap(long)]
        summary: String,
        #[clap(long, default_value = "")]
        detail: String,
        #[clap(long, default_value_t = 0.5)]
        confidence: f64,
        /// Earlier decision on the same task that this one replaces.
        #[clap(long)]
        supersedes: Option<String>,
    },
    /// Submit a plan for review.
    Plan {
        #[clap(long)]
        task: String,
        #[clap(long)]
        agent: String,
        #[clap(long)]
        plan: String,
    },
    /// Request the completion review of a task.
    Complete {
        #[clap(long)]
        task: String,
        #[clap(long)]
        agent: String,
        #[clap(long, default_value = "")]
        summary: String,
    },
    /// Record a human verdict on a decision.
    Verdict {
        decision: String,
        #[clap(long)]
        by: String,
        #[clap(long, value_enum)]
        verdict: Verdict,
        #[clap(long, default_value = "")]
        guidance: String,
    },
    /// Decision history, newest first.
    History {
        #[clap(long)]
        task: Option<String>,
        #[clap(long)]
        agent: Option<String>,
        #[clap(long, value_enum)]
        verdict: Option<Verdict>,
        #[clap(long)]
        limit: Option<usize>,
    },
}

// ===== task =====

#[derive(clap::Args, Debug)]
pub(crate) struct TaskCli {
    #[clap(subcommand)]
    pub command: TaskCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TaskCommand {
    /// Create an implementation task blocked by a review from birth.
    Create {
        #[clap(long)]
        subject: String,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(long, default_value = "")]
        context: String,
        #[clap(long, value_enum, default_value = "governance")]
        kind: TaskReviewKind,
    },
    /// Stack another review blocker onto a governed task.
    AddBlocker {
        task: String,
        #[clap(long, value_enum)]
        kind: TaskReviewKind,
        #[clap(long, default_value = "")]
        context: String,
    },
    /// Complete a review with a verdict.
    CompleteReview {
        review: String,
        #[clap(long, value_enum)]
        verdict: Verdict,
        #[clap(long, default_value = "")]
        guidance: String,
        /// Findings as a JSON array.
        #[clap(long)]
        findings: Option<String>,
        /// Cited standard (repeatable).
        #[clap(long = "standard")]
        standards: Vec<String>,
    },
    /// Have the reviewer run a pending review.
    RunReview { review: String },
    /// Review status of a governed task.
    Status { task: String },
    /// Reviews waiting to be completed.
    Pending,
}

// ===== session =====

#[derive(clap::Args, Debug)]
pub(crate) struct SessionCli {
    #[clap(subcommand)]
    pub command: SessionCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SessionCommand {
    /// Record a task creation in a session.
    Created {
        #[clap(long)]
        session: String,
        #[clap(long)]
        task: String,
        #[clap(long)]
        subject: String,
        #[clap(long, default_value = "")]
        description: String,
        /// Spawn a background process that settles the session at its deadline.
        #[clap(long)]
        detach: bool,
    },
    /// Run the settle check for one ticket.
    Settle {
        #[clap(long)]
        session: String,
        #[clap(long)]
        generation: i64,
        #[clap(long)]
        deadline_ms: i64,
        /// Sleep until the deadline first.
        #[clap(long)]
        wait: bool,
    },
    /// Gate a mutating action. Exits 2 when blocked.
    Gate {
        #[clap(long)]
        session: String,
        #[clap(long, value_enum, default_value = "write")]
        action: GateAction,
    },
    /// Clear a session's review flag (human resolution).
    Clear {
        #[clap(long)]
        session: String,
        #[clap(long)]
        by: String,
    },
    /// Show a session's flag and tasks.
    Status {
        #[clap(long)]
        session: String,
    },
}

// ===== trust =====

#[derive(clap::Args, Debug)]
pub(crate) struct TrustCli {
    #[clap(subcommand)]
    pub command: TrustCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TrustCommand {
    /// Record a tool finding and classify it.
    Record {
        #[clap(long)]
        tool: String,
        #[clap(long)]
        rule: String,
        #[clap(long, default_value = "")]
        path: String,
        #[clap(long)]
        message: String,
        #[clap(long, default_value = "medium")]
        severity: String,
    },
    /// Dismiss a finding with a justification.
    Dismiss {
        id: String,
        #[clap(long)]
        justification: String,
        #[clap(long)]
        by: String,
    },
    /// BLOCK or TRACK.
    Classify { id: String },
    /// Reopen a dismissed finding.
    Reopen { id: String },
    /// Dismissal history of a finding.
    History { id: String },
    /// List findings.
    List {
        #[clap(long, value_enum)]
        status: Option<FindingStatus>,
    },
}
