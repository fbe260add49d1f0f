//! Carapace: governance gate and institutional memory for multi-agent work.
//!
//! Agents working concurrently on one codebase route their work through Carapace before
//! and after it runs. Carapace keeps three things honest:
//!
//! - **Institutional memory**: a knowledge graph whose principles and standards are
//!   protected by tier (human-only, approval-gated, open) and fed to every review.
//! - **Decision governance**: decisions, plans and completions are reviewed by an external
//!   judge; governed tasks are created already blocked and are released only when every
//!   stacked review approves.
//! - **Holistic review**: bursts of task creation in one session are debounced into a
//!   single collective review, and a fast gate stops mutating actions while the session's
//!   review is pending or has found problems.
//!
//! # Architecture
//!
//! All relational state goes through `DbBroker` (mutations serialized and audited in
//! `broker.events.jsonl`, lookups unaudited). The knowledge graph is an append-only JSONL
//! log with compaction-by-rename, shared between processes under a file lease. The judge
//! is an unreliable subprocess: every failure degrades to `needs_human_review`, never to
//! approval.
//!
//! # Examples
//!
//! ```bash
//! carapace graph --role human create --name no-unsafe --kind principle --obs "No unsafe code"
//! carapace decision submit --task T1 --agent a1 --category dependency --summary "Add serde"
//! carapace task create --subject "Add validation" --kind governance
//! carapace session gate --session S1 --action write   # exit 2 when blocked
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: errors, config, broker, schemas, time/ids, logging, leases, task records
//! - [`plugins`]: tier, graph, reviewer, governance store/engine, holistic, trust

mod cli;
pub mod core;
pub mod plugins;
pub mod subsystems;

use crate::cli::{
    Cli, Command, DecisionCommand, GraphCommand, OutputFormat, SessionCommand, TaskCommand,
    TrustCommand,
};
use crate::core::error::CarapaceError;
use crate::core::store::STATE_DIR;
use crate::core::{broker, logging, time};
use crate::plugins::governance::{DecisionInput, GovernedTaskInput};
use crate::plugins::governance_store::{HistoryFilter, SettleTicket};
use crate::plugins::graph::{Entity, Relation, WriteOutcome};
use crate::plugins::holistic::TaskCreated;
use crate::plugins::reviewer::Finding;
use crate::plugins::trust::FindingReport;
use crate::plugins::{governance, graph, holistic, trust};
use crate::subsystems::Subsystems;
use clap::Parser;
use colored::Colorize;
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info};

/// Exit code of `session gate` when the action is blocked.
pub const GATE_BLOCKED_EXIT: i32 = 2;

fn find_project_root(start_dir: &Path) -> PathBuf {
    let mut current = PathBuf::from(start_dir);
    loop {
        if current.join(STATE_DIR).is_dir() {
            return current;
        }
        if !current.pop() {
            return start_dir.to_path_buf();
        }
    }
}

fn emit(format: OutputFormat, cmd: &str, status: &str, result: JsonValue) -> Result<(), CarapaceError> {
    match format {
        OutputFormat::Json => {
            let envelope = time::command_envelope(cmd, status, result);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => {
            let label = match status {
                "ok" | "approved" | "allowed" => status.green().bold(),
                "blocked" | "denied" => status.red().bold(),
                _ => status.yellow().bold(),
            };
            println!("{} {}", label, cmd.bold());
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, CarapaceError> {
    Ok(serde_json::to_value(value)?)
}

/// Parse the CLI, run one command and return the process exit code.
pub fn run() -> Result<i32, CarapaceError> {
    logging::init_tracing();
    let cli = Cli::parse();
    let project_root = match cli.project {
        Some(p) => p,
        None => find_project_root(&std::env::current_dir()?),
    };
    let format = cli.format;

    if let Command::Schema { subsystem } = &cli.command {
        let mut schemas = std::collections::BTreeMap::new();
        schemas.insert("graph", graph::schema());
        schemas.insert("governance", governance::schema());
        schemas.insert("session", holistic::schema());
        schemas.insert("trust", trust::schema());
        let output = match subsystem {
            Some(name) => schemas
                .get(name.as_str())
                .cloned()
                .ok_or_else(|| CarapaceError::NotFound(format!("Unknown subsystem '{}'", name)))?,
            None => json!({ "schema_version": "1.0.0", "subsystems": schemas }),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(0);
    }

    let sys = Subsystems::open_project(&project_root)?;
    debug!(project = %project_root.display(), "project opened");

    match cli.command {
        Command::Schema { .. } => Ok(0),
        Command::Status => {
            let status = sys.engine.get_status()?;
            emit(format, "status", "ok", to_json(&status)?)?;
            Ok(0)
        }
        Command::Audit { limit } => {
            let mut events = broker::read_audit_log(&sys.store.root)?;
            if let Some(n) = limit {
                let skip = events.len().saturating_sub(n);
                events.drain(..skip);
            }
            emit(format, "audit", "ok", to_json(&events)?)?;
            Ok(0)
        }
        Command::Graph(graph_cli) => run_graph(&sys, format, graph_cli),
        Command::Decision(decision_cli) => run_decision(&sys, format, decision_cli.command),
        Command::Task(task_cli) => run_task(&sys, format, task_cli.command),
        Command::Session(session_cli) => {
            run_session(&sys, format, &project_root, session_cli.command)
        }
        Command::Trust(trust_cli) => run_trust(&sys, format, trust_cli.command),
    }
}

fn run_graph(sys: &Subsystems, format: OutputFormat, cli: cli::GraphCli) -> Result<i32, CarapaceError> {
    let g = &sys.graph;
    let (role, approved) = (cli.role, cli.approved);
    let (cmd, status, result) = match cli.command {
        GraphCommand::Create {
            name,
            kind,
            observations,
        } => {
            let entity = Entity {
                name,
                entity_type: kind,
                observations,
            };
            let outcome = g.create_entities(vec![entity], role, approved)?;
            let status = if outcome.denied.is_empty() { "ok" } else { "denied" };
            ("graph.create", status, to_json(&outcome)?)
        }
        GraphCommand::Observe { name, observations } => {
            let outcome = g.add_observations(&name, &observations, role, approved)?;
            return emit_write_outcome(format, "graph.observe", outcome);
        }
        GraphCommand::Forget { name, observations } => {
            let outcome = g.delete_observations(&name, &observations, role, approved)?;
            return emit_write_outcome(format, "graph.forget", outcome);
        }
        GraphCommand::Delete { name } => {
            let outcome = g.delete_entity(&name, role, approved)?;
            return emit_write_outcome(format, "graph.delete", outcome);
        }
        GraphCommand::Relate { from, to, kind } => {
            let outcome = g.create_relations(vec![Relation::new(&from, &to, &kind)])?;
            let status = if outcome.rejected.is_empty() { "ok" } else { "denied" };
            ("graph.relate", status, to_json(&outcome)?)
        }
        GraphCommand::Unrelate { from, to, kind } => {
            let removed = g.delete_relations(&[Relation::new(&from, &to, &kind)])?;
            ("graph.unrelate", "ok", json!({ "removed": removed }))
        }
        GraphCommand::Search { query } => ("graph.search", "ok", to_json(&g.search(&query))?),
        GraphCommand::Get { name } => {
            let view = g
                .get_entity(&name)
                .ok_or_else(|| CarapaceError::UnknownEntity(name.clone()))?;
            ("graph.get", "ok", to_json(&view)?)
        }
        GraphCommand::Tier { tier } => ("graph.tier", "ok", to_json(&g.get_by_tier(tier))?),
        GraphCommand::Read => ("graph.read", "ok", to_json(&g.read_graph())?),
        GraphCommand::Access { name, op } => {
            let decision = g.validate_access(&name, op, role)?;
            let status = if decision.allowed { "allowed" } else { "denied" };
            ("graph.access", status, to_json(&decision)?)
        }
        GraphCommand::Compact => ("graph.compact", "ok", to_json(&g.compact()?)?),
    };
    emit(format, cmd, status, result)?;
    Ok(0)
}

/// Emit a single-entity write. A denial is still reported in the envelope, then fails the
/// command with the `TierViolation` it maps to.
fn emit_write_outcome(
    format: OutputFormat,
    cmd: &str,
    outcome: WriteOutcome,
) -> Result<i32, CarapaceError> {
    let status = if outcome.is_denied() { "denied" } else { "ok" };
    emit(format, cmd, status, to_json(&outcome)?)?;
    outcome.into_result().map(|_| 0)
}

fn run_decision(
    sys: &Subsystems,
    format: OutputFormat,
    command: DecisionCommand,
) -> Result<i32, CarapaceError> {
    let engine = &sys.engine;
    let (cmd, status, result) = match command {
        DecisionCommand::Submit {
            task,
            agent,
            category,
            summary,
            detail,
            confidence,
            supersedes,
        } => {
            let outcome = engine.submit_decision(&DecisionInput {
                task_id: task,
                agent_id: agent,
                category,
                summary,
                detail,
                confidence,
                supersedes,
            })?;
            ("decision.submit", outcome.review.verdict.as_str(), to_json(&outcome)?)
        }
        DecisionCommand::Plan { task, agent, plan } => {
            let review = engine.submit_plan_for_review(&task, &agent, &plan)?;
            ("decision.plan", review.verdict.as_str(), to_json(&review)?)
        }
        DecisionCommand::Complete {
            task,
            agent,
            summary,
        } => {
            let review = engine.submit_completion_review(&task, &agent, &summary)?;
            ("decision.complete", review.verdict.as_str(), to_json(&review)?)
        }
        DecisionCommand::Verdict {
            decision,
            by,
            verdict,
            guidance,
        } => {
            let review = engine.record_human_verdict(&decision, &by, verdict, &guidance)?;
            ("decision.verdict", review.verdict.as_str(), to_json(&review)?)
        }
        DecisionCommand::History {
            task,
            agent,
            verdict,
            limit,
        } => {
            let entries = engine.get_decision_history(&HistoryFilter {
                task_id: task,
                agent_id: agent,
                verdict,
                limit,
            })?;
            ("decision.history", "ok", to_json(&entries)?)
        }
    };
    emit(format, cmd, status, result)?;
    Ok(0)
}

fn run_task(sys: &Subsystems, format: OutputFormat, command: TaskCommand) -> Result<i32, CarapaceError> {
    let engine = &sys.engine;
    let (cmd, status, result) = match command {
        TaskCommand::Create {
            subject,
            description,
            context,
            kind,
        } => {
            let created = engine.create_governed_task(&GovernedTaskInput {
                subject,
                description,
                context,
                review_kind: kind,
            })?;
            ("task.create", "ok", to_json(&created)?)
        }
        TaskCommand::AddBlocker {
            task,
            kind,
            context,
        } => {
            let added = engine.add_review_blocker(&task, kind, &context)?;
            ("task.add_blocker", "ok", to_json(&added)?)
        }
        TaskCommand::CompleteReview {
            review,
            verdict,
            guidance,
            findings,
            standards,
        } => {
            let findings: Vec<Finding> = match findings {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Vec::new(),
            };
            let done = engine.complete_task_review(&review, verdict, &guidance, &findings, &standards)?;
            ("task.complete_review", done.verdict.as_str(), to_json(&done)?)
        }
        TaskCommand::RunReview { review } => {
            let done = engine.run_task_review(&review)?;
            ("task.run_review", done.verdict.as_str(), to_json(&done)?)
        }
        TaskCommand::Status { task } => {
            let view = engine.get_task_review_status(&task)?;
            let status = if view.can_execute { "approved" } else { "blocked" };
            ("task.status", status, to_json(&view)?)
        }
        TaskCommand::Pending => ("task.pending", "ok", to_json(&engine.get_pending_reviews()?)?),
    };
    emit(format, cmd, status, result)?;
    Ok(0)
}

/// Start `carapace session settle --wait` in the background for `ticket`.
fn spawn_detached_settle(project_root: &Path, ticket: &SettleTicket) -> Result<u32, CarapaceError> {
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("--project")
        .arg(project_root)
        .args(["session", "settle", "--wait"])
        .args(["--session", &ticket.session_id])
        .args(["--generation", &ticket.generation.to_string()])
        .args(["--deadline-ms", &ticket.deadline_ms.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    info!(session = %ticket.session_id, pid = child.id(), "detached settle spawned");
    Ok(child.id())
}

fn run_session(
    sys: &Subsystems,
    format: OutputFormat,
    project_root: &Path,
    command: SessionCommand,
) -> Result<i32, CarapaceError> {
    let coordinator = &sys.holistic;
    match command {
        SessionCommand::Created {
            session,
            task,
            subject,
            description,
            detach,
        } => {
            let ticket = coordinator.record_task_created(&TaskCreated {
                session_id: session,
                task_id: task,
                subject,
                description,
            })?;
            let settle_pid = if detach {
                Some(spawn_detached_settle(project_root, &ticket)?)
            } else {
                None
            };
            emit(
                format,
                "session.created",
                "ok",
                json!({ "ticket": ticket, "settle_pid": settle_pid }),
            )?;
            Ok(0)
        }
        SessionCommand::Settle {
            session,
            generation,
            deadline_ms,
            wait,
        } => {
            let ticket = SettleTicket {
                session_id: session,
                generation,
                scheduled_at_ms: deadline_ms - coordinator.config().debounce_ms as i64,
                deadline_ms,
            };
            let outcome = if wait {
                coordinator.wait_and_settle(&ticket)?
            } else {
                coordinator.settle(&ticket)?
            };
            emit(format, "session.settle", "ok", to_json(&outcome)?)?;
            Ok(0)
        }
        SessionCommand::Gate { session, action } => {
            let decision = coordinator.gate_check(&session, action)?;
            let (status, code) = if decision.allowed {
                ("allowed", 0)
            } else {
                ("blocked", GATE_BLOCKED_EXIT)
            };
            emit(format, "session.gate", status, to_json(&decision)?)?;
            Ok(code)
        }
        SessionCommand::Clear { session, by } => {
            let cleared = coordinator.clear_session_flag(&session, &by)?;
            if let Some(ticket) = &cleared.ticket {
                spawn_detached_settle(project_root, ticket)?;
            }
            emit(format, "session.clear", "ok", to_json(&cleared)?)?;
            Ok(0)
        }
        SessionCommand::Status { session } => {
            let view = coordinator.session_status(&session)?;
            emit(format, "session.status", "ok", to_json(&view)?)?;
            Ok(0)
        }
    }
}

fn run_trust(sys: &Subsystems, format: OutputFormat, command: TrustCommand) -> Result<i32, CarapaceError> {
    let t = &sys.trust;
    let (cmd, status, result) = match command {
        TrustCommand::Record {
            tool,
            rule,
            path,
            message,
            severity,
        } => {
            let classified = t.record_finding(&FindingReport {
                tool,
                rule,
                path,
                message,
                severity,
            })?;
            ("trust.record", classified.classification.as_str(), to_json(&classified)?)
        }
        TrustCommand::Dismiss {
            id,
            justification,
            by,
        } => ("trust.dismiss", "ok", to_json(&t.record_dismissal(&id, &justification, &by)?)?),
        TrustCommand::Classify { id } => {
            let classified = t.classify(&id)?;
            ("trust.classify", classified.classification.as_str(), to_json(&classified)?)
        }
        TrustCommand::Reopen { id } => ("trust.reopen", "ok", to_json(&t.reopen_finding(&id)?)?),
        TrustCommand::History { id } => ("trust.history", "ok", to_json(&t.dismissal_history(&id)?)?),
        TrustCommand::List { status } => ("trust.list", "ok", to_json(&t.list_findings(status)?)?),
    };
    emit(format, cmd, status, result)?;
    Ok(0)
}
