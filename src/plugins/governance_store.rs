//! Relational persistence for governance state.
//!
//! One SQLite database (`governance.db`) holds decisions, review verdicts, governed tasks,
//! task-review records, deterministic-tool findings, the append-only dismissal history and
//! holistic-session bookkeeping. Every access goes through [`DbBroker`]: mutations are
//! serialized in-process and audited, lookups use its unaudited read path. Multi-row
//! changes run in a single transaction.
//!
//! Decisions and verdicts are immutable (enforced by triggers); a resubmission creates a
//! new row. Dismissals are append-only (also enforced by triggers).

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::CarapaceError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::reviewer::{Finding, ReviewKind, Verdict};
use clap::ValueEnum;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// --- Enumerations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCategory {
    Architecture,
    Implementation,
    Dependency,
    ApiDesign,
    DataModel,
    Testing,
    Security,
    Performance,
    Deviation,
    ScopeChange,
}

impl DecisionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCategory::Architecture => "architecture",
            DecisionCategory::Implementation => "implementation",
            DecisionCategory::Dependency => "dependency",
            DecisionCategory::ApiDesign => "api_design",
            DecisionCategory::DataModel => "data_model",
            DecisionCategory::Testing => "testing",
            DecisionCategory::Security => "security",
            DecisionCategory::Performance => "performance",
            DecisionCategory::Deviation => "deviation",
            DecisionCategory::ScopeChange => "scope_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "architecture" => Some(DecisionCategory::Architecture),
            "implementation" => Some(DecisionCategory::Implementation),
            "dependency" => Some(DecisionCategory::Dependency),
            "api_design" => Some(DecisionCategory::ApiDesign),
            "data_model" => Some(DecisionCategory::DataModel),
            "testing" => Some(DecisionCategory::Testing),
            "security" => Some(DecisionCategory::Security),
            "performance" => Some(DecisionCategory::Performance),
            "deviation" => Some(DecisionCategory::Deviation),
            "scope_change" => Some(DecisionCategory::ScopeChange),
            _ => None,
        }
    }

    /// Categories that always go to a human and never to the judge.
    pub fn bypasses_review(&self) -> bool {
        matches!(self, DecisionCategory::Deviation | DecisionCategory::ScopeChange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernedTaskStatus {
    PendingReview,
    Approved,
    Blocked,
}

impl GovernedTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernedTaskStatus::PendingReview => "pending_review",
            GovernedTaskStatus::Approved => "approved",
            GovernedTaskStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_review" => Some(GovernedTaskStatus::PendingReview),
            "approved" => Some(GovernedTaskStatus::Approved),
            "blocked" => Some(GovernedTaskStatus::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskReviewKind {
    Governance,
    Security,
    Architecture,
    Custom,
}

impl TaskReviewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskReviewKind::Governance => "governance",
            TaskReviewKind::Security => "security",
            TaskReviewKind::Architecture => "architecture",
            TaskReviewKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "governance" => Some(TaskReviewKind::Governance),
            "security" => Some(TaskReviewKind::Security),
            "architecture" => Some(TaskReviewKind::Architecture),
            "custom" => Some(TaskReviewKind::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskReviewStatus {
    Pending,
    InProgress,
    Approved,
    Blocked,
    NeedsHumanReview,
}

impl TaskReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskReviewStatus::Pending => "pending",
            TaskReviewStatus::InProgress => "in_progress",
            TaskReviewStatus::Approved => "approved",
            TaskReviewStatus::Blocked => "blocked",
            TaskReviewStatus::NeedsHumanReview => "needs_human_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskReviewStatus::Pending),
            "in_progress" => Some(TaskReviewStatus::InProgress),
            "approved" => Some(TaskReviewStatus::Approved),
            "blocked" => Some(TaskReviewStatus::Blocked),
            "needs_human_review" => Some(TaskReviewStatus::NeedsHumanReview),
            _ => None,
        }
    }

    pub fn from_verdict(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Approved => TaskReviewStatus::Approved,
            Verdict::Blocked => TaskReviewStatus::Blocked,
            Verdict::NeedsHumanReview => TaskReviewStatus::NeedsHumanReview,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Open,
    Dismissed,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Open => "open",
            FindingStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(FindingStatus::Open),
            "dismissed" => Some(FindingStatus::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFlagStatus {
    Pending,
    Reviewing,
    Blocked,
    NeedsHumanReview,
    Cleared,
}

impl SessionFlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionFlagStatus::Pending => "pending",
            SessionFlagStatus::Reviewing => "reviewing",
            SessionFlagStatus::Blocked => "blocked",
            SessionFlagStatus::NeedsHumanReview => "needs_human_review",
            SessionFlagStatus::Cleared => "cleared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionFlagStatus::Pending),
            "reviewing" => Some(SessionFlagStatus::Reviewing),
            "blocked" => Some(SessionFlagStatus::Blocked),
            "needs_human_review" => Some(SessionFlagStatus::NeedsHumanReview),
            "cleared" => Some(SessionFlagStatus::Cleared),
            _ => None,
        }
    }
}

/// Where a task stands in its session's collective review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolisticStatus {
    Pending,
    Approved,
    Revision,
    Escalated,
    Individual,
}

impl HolisticStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolisticStatus::Pending => "pending",
            HolisticStatus::Approved => "approved",
            HolisticStatus::Revision => "revision",
            HolisticStatus::Escalated => "escalated",
            HolisticStatus::Individual => "individual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(HolisticStatus::Pending),
            "approved" => Some(HolisticStatus::Approved),
            "revision" => Some(HolisticStatus::Revision),
            "escalated" => Some(HolisticStatus::Escalated),
            "individual" => Some(HolisticStatus::Individual),
            _ => None,
        }
    }
}

// --- Records ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub category: DecisionCategory,
    pub summary: String,
    pub detail: String,
    pub confidence: f64,
    pub sequence: i64,
    pub supersedes: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewDecision<'a> {
    pub task_id: &'a str,
    pub agent_id: &'a str,
    pub category: DecisionCategory,
    pub summary: &'a str,
    pub detail: &'a str,
    pub confidence: f64,
    pub supersedes: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub id: String,
    pub decision_id: Option<String>,
    pub context_kind: ReviewKind,
    pub context_ref: String,
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
    pub guidance: String,
    pub standards_cited: Vec<String>,
    pub reviewer: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernedTask {
    pub id: String,
    pub impl_task_id: String,
    pub subject: String,
    pub description: String,
    pub context: String,
    pub blockers: Vec<String>,
    pub status: GovernedTaskStatus,
    pub created_at: String,
    pub released_at: Option<String>,
}

impl GovernedTask {
    pub fn is_claimable(&self) -> bool {
        self.status == GovernedTaskStatus::Approved && self.blockers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReviewRecord {
    pub id: String,
    pub review_task_id: String,
    pub impl_task_id: String,
    pub review_kind: TaskReviewKind,
    pub status: TaskReviewStatus,
    pub verdict: Option<Verdict>,
    pub guidance: String,
    pub findings: Vec<Finding>,
    pub standards_cited: Vec<String>,
    pub context: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// What a review completion did to its review record and owning task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionApplied {
    pub review: TaskReviewRecord,
    pub task: Option<GovernedTask>,
    pub released: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFinding {
    pub id: String,
    pub fingerprint: String,
    pub tool: String,
    pub rule: String,
    pub path: String,
    pub message: String,
    pub severity: String,
    pub status: FindingStatus,
    pub occurrences: i64,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone)]
pub struct NewFinding<'a> {
    pub fingerprint: &'a str,
    pub tool: &'a str,
    pub rule: &'a str,
    pub path: &'a str,
    pub message: &'a str,
    pub severity: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DismissalRecord {
    pub id: String,
    pub finding_id: String,
    pub fingerprint: String,
    pub justification: String,
    pub dismissed_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFlag {
    pub session_id: String,
    pub status: SessionFlagStatus,
    pub task_ids: Vec<String>,
    pub guidance: String,
    pub generation: i64,
    pub deadline_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTask {
    pub task_id: String,
    pub session_id: String,
    pub subject: String,
    pub description: String,
    pub generation: i64,
    pub created_at_ms: i64,
    pub holistic_status: HolisticStatus,
}

/// Identifies one scheduled settle check. Only the ticket carrying the session's latest
/// generation may act.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleTicket {
    pub session_id: String,
    pub generation: i64,
    pub scheduled_at_ms: i64,
    pub deadline_ms: i64,
}

/// Result of a human clearing a session flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagCleared {
    /// Present when tasks still wait for a collective review.
    pub ticket: Option<SettleTicket>,
    /// Tasks held back by the cleared verdict, now routed to individual review.
    pub released: Vec<SessionTask>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub verdict: Option<Verdict>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionHistoryEntry {
    pub decision: Decision,
    pub latest_review: Option<ReviewVerdict>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceStatus {
    pub decisions: i64,
    pub reviews: i64,
    pub approved: i64,
    pub blocked: i64,
    pub needs_human_review: i64,
    pub governed_tasks_pending: i64,
    pub governed_tasks_blocked: i64,
    pub governed_tasks_released: i64,
    pub pending_task_reviews: i64,
    pub open_findings: i64,
    pub dismissed_findings: i64,
    pub flagged_sessions: i64,
}

// --- Row mapping ---

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value '{}'", raw)))
}

fn opt_enum_col<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(s) => parse(&s)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("unknown value '{}'", s))),
    }
}

const DECISION_COLUMNS: &str =
    "id, task_id, agent_id, category, summary, detail, confidence, sequence, supersedes, created_at";

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    Ok(Decision {
        id: row.get(0)?,
        task_id: row.get(1)?,
        agent_id: row.get(2)?,
        category: enum_col(row, 3, DecisionCategory::parse)?,
        summary: row.get(4)?,
        detail: row.get(5)?,
        confidence: row.get(6)?,
        sequence: row.get(7)?,
        supersedes: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const REVIEW_COLUMNS: &str = "id, decision_id, context_kind, context_ref, verdict, findings, guidance, standards, reviewer, created_at";

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewVerdict> {
    Ok(ReviewVerdict {
        id: row.get(0)?,
        decision_id: row.get(1)?,
        context_kind: enum_col(row, 2, ReviewKind::parse)?,
        context_ref: row.get(3)?,
        verdict: enum_col(row, 4, Verdict::parse)?,
        findings: json_col(row, 5)?,
        guidance: row.get(6)?,
        standards_cited: json_col(row, 7)?,
        reviewer: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const GOVERNED_COLUMNS: &str =
    "id, impl_task_id, subject, description, context, blockers, status, created_at, released_at";

fn governed_from_row(row: &Row<'_>) -> rusqlite::Result<GovernedTask> {
    Ok(GovernedTask {
        id: row.get(0)?,
        impl_task_id: row.get(1)?,
        subject: row.get(2)?,
        description: row.get(3)?,
        context: row.get(4)?,
        blockers: json_col(row, 5)?,
        status: enum_col(row, 6, GovernedTaskStatus::parse)?,
        created_at: row.get(7)?,
        released_at: row.get(8)?,
    })
}

const TASK_REVIEW_COLUMNS: &str = "id, review_task_id, impl_task_id, review_kind, status, verdict, guidance, findings, standards, context, created_at, completed_at";

fn task_review_from_row(row: &Row<'_>) -> rusqlite::Result<TaskReviewRecord> {
    Ok(TaskReviewRecord {
        id: row.get(0)?,
        review_task_id: row.get(1)?,
        impl_task_id: row.get(2)?,
        review_kind: enum_col(row, 3, TaskReviewKind::parse)?,
        status: enum_col(row, 4, TaskReviewStatus::parse)?,
        verdict: opt_enum_col(row, 5, Verdict::parse)?,
        guidance: row.get(6)?,
        findings: json_col(row, 7)?,
        standards_cited: json_col(row, 8)?,
        context: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

const FINDING_COLUMNS: &str =
    "id, fingerprint, tool, rule, path, message, severity, status, occurrences, first_seen, last_seen";

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<ToolFinding> {
    Ok(ToolFinding {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        tool: row.get(2)?,
        rule: row.get(3)?,
        path: row.get(4)?,
        message: row.get(5)?,
        severity: row.get(6)?,
        status: enum_col(row, 7, FindingStatus::parse)?,
        occurrences: row.get(8)?,
        first_seen: row.get(9)?,
        last_seen: row.get(10)?,
    })
}

fn dismissal_from_row(row: &Row<'_>) -> rusqlite::Result<DismissalRecord> {
    Ok(DismissalRecord {
        id: row.get(0)?,
        finding_id: row.get(1)?,
        fingerprint: row.get(2)?,
        justification: row.get(3)?,
        dismissed_by: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const FLAG_COLUMNS: &str =
    "session_id, status, task_ids, guidance, generation, deadline_ms, created_at_ms, updated_at_ms";

fn flag_from_row(row: &Row<'_>) -> rusqlite::Result<SessionFlag> {
    Ok(SessionFlag {
        session_id: row.get(0)?,
        status: enum_col(row, 1, SessionFlagStatus::parse)?,
        task_ids: json_col(row, 2)?,
        guidance: row.get(3)?,
        generation: row.get(4)?,
        deadline_ms: row.get(5)?,
        created_at_ms: row.get(6)?,
        updated_at_ms: row.get(7)?,
    })
}

const SESSION_TASK_COLUMNS: &str =
    "task_id, session_id, subject, description, generation, created_at_ms, holistic_status";

fn session_task_from_row(row: &Row<'_>) -> rusqlite::Result<SessionTask> {
    Ok(SessionTask {
        task_id: row.get(0)?,
        session_id: row.get(1)?,
        subject: row.get(2)?,
        description: row.get(3)?,
        generation: row.get(4)?,
        created_at_ms: row.get(5)?,
        holistic_status: enum_col(row, 6, HolisticStatus::parse)?,
    })
}

// --- Connection-level helpers (usable inside a transaction) ---

fn load_governed(conn: &Connection, impl_task_id: &str) -> Result<Option<GovernedTask>, CarapaceError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM governed_tasks WHERE impl_task_id = ?1", GOVERNED_COLUMNS),
            params![impl_task_id],
            governed_from_row,
        )
        .optional()?)
}

fn load_task_review(
    conn: &Connection,
    review_task_id: &str,
) -> Result<Option<TaskReviewRecord>, CarapaceError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM task_reviews WHERE review_task_id = ?1", TASK_REVIEW_COLUMNS),
            params![review_task_id],
            task_review_from_row,
        )
        .optional()?)
}

fn load_task_reviews_for(
    conn: &Connection,
    impl_task_id: &str,
) -> Result<Vec<TaskReviewRecord>, CarapaceError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_reviews WHERE impl_task_id = ?1 ORDER BY rowid",
        TASK_REVIEW_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![impl_task_id], task_review_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn insert_task_review(conn: &Connection, r: &TaskReviewRecord) -> Result<(), CarapaceError> {
    conn.execute(
        "INSERT INTO task_reviews(id, review_task_id, impl_task_id, review_kind, status, verdict, guidance, findings, standards, context, created_at, completed_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            r.id,
            r.review_task_id,
            r.impl_task_id,
            r.review_kind.as_str(),
            r.status.as_str(),
            r.verdict.map(|v| v.as_str()),
            r.guidance,
            serde_json::to_string(&r.findings)?,
            serde_json::to_string(&r.standards_cited)?,
            r.context,
            r.created_at,
            r.completed_at,
        ],
    )?;
    Ok(())
}

fn save_governed(conn: &Connection, t: &GovernedTask) -> Result<(), CarapaceError> {
    conn.execute(
        "UPDATE governed_tasks SET description = ?1, blockers = ?2, status = ?3, released_at = ?4 WHERE id = ?5",
        params![
            t.description,
            serde_json::to_string(&t.blockers)?,
            t.status.as_str(),
            t.released_at,
            t.id,
        ],
    )?;
    Ok(())
}

/// Blocked if any outstanding blocker's review is blocked; approved once nothing is outstanding.
fn recompute_status(task: &GovernedTask, reviews: &[TaskReviewRecord]) -> GovernedTaskStatus {
    if task.blockers.is_empty() {
        return GovernedTaskStatus::Approved;
    }
    let any_blocked = reviews.iter().any(|r| {
        r.status == TaskReviewStatus::Blocked && task.blockers.contains(&r.review_task_id)
    });
    if any_blocked {
        GovernedTaskStatus::Blocked
    } else {
        GovernedTaskStatus::PendingReview
    }
}

fn count(conn: &Connection, sql: &str) -> Result<i64, CarapaceError> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

// --- Store ---

pub struct GovernanceStore {
    root: PathBuf,
    db_path: PathBuf,
    broker: DbBroker,
}

impl GovernanceStore {
    pub fn open(store: &Store) -> Result<Self, CarapaceError> {
        db::initialize_governance_db(&store.root)?;
        Ok(Self {
            root: store.root.clone(),
            db_path: store.governance_db_path(),
            broker: DbBroker::new(&store.root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read<R, F>(&self, op: &str, f: F) -> Result<R, CarapaceError>
    where
        F: FnOnce(&Connection) -> Result<R, CarapaceError>,
    {
        self.broker.with_read(&self.db_path, op, f)
    }

    fn tx<R, F>(&self, actor: &str, op: &str, f: F) -> Result<R, CarapaceError>
    where
        F: FnOnce(&Connection) -> Result<R, CarapaceError>,
    {
        self.broker.with_tx(&self.db_path, actor, op, |tx| f(tx))
    }

    // --- Decisions & verdicts ---

    /// Persist a decision with the next per-task sequence number.
    pub fn insert_decision(&self, input: &NewDecision<'_>) -> Result<Decision, CarapaceError> {
        self.tx(input.agent_id, "decision.insert", |conn| {
            if let Some(prev) = input.supersedes {
                let prev_task: Option<String> = conn
                    .query_row(
                        "SELECT task_id FROM decisions WHERE id = ?1",
                        params![prev],
                        |r| r.get(0),
                    )
                    .optional()?;
                match prev_task {
                    None => {
                        return Err(CarapaceError::NotFound(format!(
                            "Superseded decision '{}' not found",
                            prev
                        )));
                    }
                    Some(t) if t != input.task_id => {
                        return Err(CarapaceError::ValidationError(format!(
                            "Decision '{}' belongs to task '{}', not '{}'",
                            prev, t, input.task_id
                        )));
                    }
                    Some(_) => {}
                }
            }

            let sequence: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM decisions WHERE task_id = ?1",
                params![input.task_id],
                |r| r.get(0),
            )?;
            let decision = Decision {
                id: time::prefixed_id("DEC"),
                task_id: input.task_id.to_string(),
                agent_id: input.agent_id.to_string(),
                category: input.category,
                summary: input.summary.to_string(),
                detail: input.detail.to_string(),
                confidence: input.confidence,
                sequence,
                supersedes: input.supersedes.map(|s| s.to_string()),
                created_at: time::now_epoch_z(),
            };
            conn.execute(
                &format!(
                    "INSERT INTO decisions({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    DECISION_COLUMNS
                ),
                params![
                    decision.id,
                    decision.task_id,
                    decision.agent_id,
                    decision.category.as_str(),
                    decision.summary,
                    decision.detail,
                    decision.confidence,
                    decision.sequence,
                    decision.supersedes,
                    decision.created_at,
                ],
            )?;
            Ok(decision)
        })
    }

    pub fn get_decision(&self, id: &str) -> Result<Option<Decision>, CarapaceError> {
        self.read("decision.get", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM decisions WHERE id = ?1", DECISION_COLUMNS),
                    params![id],
                    decision_from_row,
                )
                .optional()?)
        })
    }

    pub fn decisions_for_task(&self, task_id: &str) -> Result<Vec<Decision>, CarapaceError> {
        self.read("decision.list_task", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM decisions WHERE task_id = ?1 ORDER BY sequence",
                DECISION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![task_id], decision_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn insert_review(&self, review: &ReviewVerdict) -> Result<(), CarapaceError> {
        self.tx(&review.reviewer, "review.insert", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO reviews({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    REVIEW_COLUMNS
                ),
                params![
                    review.id,
                    review.decision_id,
                    review.context_kind.as_str(),
                    review.context_ref,
                    review.verdict.as_str(),
                    serde_json::to_string(&review.findings)?,
                    review.guidance,
                    serde_json::to_string(&review.standards_cited)?,
                    review.reviewer,
                    review.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Verdicts for a decision, oldest first.
    pub fn reviews_for_decision(&self, decision_id: &str) -> Result<Vec<ReviewVerdict>, CarapaceError> {
        self.read("review.list_decision", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM reviews WHERE decision_id = ?1 ORDER BY rowid",
                REVIEW_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![decision_id], review_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Every verdict attached to a task: its decisions' verdicts plus plan/completion reviews.
    pub fn reviews_for_task(&self, task_id: &str) -> Result<Vec<ReviewVerdict>, CarapaceError> {
        self.read("review.list_task", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM reviews
                 WHERE decision_id IN (SELECT id FROM decisions WHERE task_id = ?1)
                    OR (context_kind IN ('plan', 'completion') AND context_ref = ?1)
                 ORDER BY rowid",
                REVIEW_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![task_id], review_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn decision_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<DecisionHistoryEntry>, CarapaceError> {
        self.read("decision.history", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM decisions
                 WHERE (?1 IS NULL OR task_id = ?1) AND (?2 IS NULL OR agent_id = ?2)
                 ORDER BY created_at DESC, rowid DESC",
                DECISION_COLUMNS
            ))?;
            let decisions = stmt
                .query_map(params![filter.task_id, filter.agent_id], decision_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut latest = conn.prepare(&format!(
                "SELECT {} FROM reviews WHERE decision_id = ?1 ORDER BY rowid DESC LIMIT 1",
                REVIEW_COLUMNS
            ))?;
            let mut entries = Vec::new();
            for decision in decisions {
                let latest_review = latest
                    .query_row(params![decision.id], review_from_row)
                    .optional()?;
                if let Some(want) = filter.verdict {
                    if latest_review.as_ref().map(|r| r.verdict) != Some(want) {
                        continue;
                    }
                }
                entries.push(DecisionHistoryEntry {
                    decision,
                    latest_review,
                });
                if filter.limit.is_some_and(|l| entries.len() >= l) {
                    break;
                }
            }
            Ok(entries)
        })
    }

    pub fn status(&self) -> Result<GovernanceStatus, CarapaceError> {
        self.read("governance.status", |conn| {
            Ok(GovernanceStatus {
                decisions: count(conn, "SELECT COUNT(*) FROM decisions")?,
                reviews: count(conn, "SELECT COUNT(*) FROM reviews")?,
                approved: count(conn, "SELECT COUNT(*) FROM reviews WHERE verdict = 'approved'")?,
                blocked: count(conn, "SELECT COUNT(*) FROM reviews WHERE verdict = 'blocked'")?,
                needs_human_review: count(
                    conn,
                    "SELECT COUNT(*) FROM reviews WHERE verdict = 'needs_human_review'",
                )?,
                governed_tasks_pending: count(
                    conn,
                    "SELECT COUNT(*) FROM governed_tasks WHERE status = 'pending_review'",
                )?,
                governed_tasks_blocked: count(
                    conn,
                    "SELECT COUNT(*) FROM governed_tasks WHERE status = 'blocked'",
                )?,
                governed_tasks_released: count(
                    conn,
                    "SELECT COUNT(*) FROM governed_tasks WHERE status = 'approved'",
                )?,
                pending_task_reviews: count(
                    conn,
                    "SELECT COUNT(*) FROM task_reviews WHERE status IN ('pending', 'in_progress')",
                )?,
                open_findings: count(conn, "SELECT COUNT(*) FROM findings WHERE status = 'open'")?,
                dismissed_findings: count(
                    conn,
                    "SELECT COUNT(*) FROM findings WHERE status = 'dismissed'",
                )?,
                flagged_sessions: count(
                    conn,
                    "SELECT COUNT(*) FROM session_flags WHERE status != 'cleared'",
                )?,
            })
        })
    }

    // --- Governed tasks & task reviews ---

    /// Insert a governed task and its first review record in one transaction.
    pub fn insert_governed_task(
        &self,
        task: &GovernedTask,
        review: &TaskReviewRecord,
    ) -> Result<(), CarapaceError> {
        if task.blockers.is_empty() {
            return Err(CarapaceError::ValidationError(
                "A governed task must be created with at least one blocker".to_string(),
            ));
        }
        self.tx("carapace", "governed_task.create", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO governed_tasks({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    GOVERNED_COLUMNS
                ),
                params![
                    task.id,
                    task.impl_task_id,
                    task.subject,
                    task.description,
                    task.context,
                    serde_json::to_string(&task.blockers)?,
                    task.status.as_str(),
                    task.created_at,
                    task.released_at,
                ],
            )?;
            insert_task_review(conn, review)
        })
    }

    /// Record a review that gates no governed task (queued individual review).
    pub fn insert_standalone_review(&self, review: &TaskReviewRecord) -> Result<(), CarapaceError> {
        self.tx("carapace", "task_review.enqueue", |conn| insert_task_review(conn, review))
    }

    /// Stack an additional blocker onto an existing governed task.
    pub fn attach_review_blocker(
        &self,
        impl_task_id: &str,
        review: &TaskReviewRecord,
    ) -> Result<GovernedTask, CarapaceError> {
        self.tx("carapace", "governed_task.add_blocker", |conn| {
            let mut task = load_governed(conn, impl_task_id)?
                .ok_or_else(|| CarapaceError::UnknownTask(impl_task_id.to_string()))?;
            insert_task_review(conn, review)?;
            if !task.blockers.contains(&review.review_task_id) {
                task.blockers.push(review.review_task_id.clone());
            }
            task.released_at = None;
            let reviews = load_task_reviews_for(conn, impl_task_id)?;
            task.status = recompute_status(&task, &reviews);
            save_governed(conn, &task)?;
            Ok(task)
        })
    }

    /// Apply a verdict to a review record and release/keep its owning task's blocker.
    pub fn apply_review_completion(
        &self,
        review_task_id: &str,
        verdict: Verdict,
        guidance: &str,
        findings: &[Finding],
        standards: &[String],
    ) -> Result<CompletionApplied, CarapaceError> {
        self.tx("carapace", "task_review.complete", |conn| {
            let mut review = load_task_review(conn, review_task_id)?
                .ok_or_else(|| CarapaceError::BlockerNotFound(review_task_id.to_string()))?;
            if review.status == TaskReviewStatus::Approved {
                return Err(CarapaceError::ValidationError(format!(
                    "Review '{}' is already approved",
                    review_task_id
                )));
            }

            let now = time::now_epoch_z();
            review.status = TaskReviewStatus::from_verdict(verdict);
            review.verdict = Some(verdict);
            review.guidance = guidance.to_string();
            review.findings = findings.to_vec();
            review.standards_cited = standards.to_vec();
            review.completed_at = Some(now.clone());
            conn.execute(
                "UPDATE task_reviews SET status = ?1, verdict = ?2, guidance = ?3, findings = ?4, standards = ?5, completed_at = ?6
                 WHERE review_task_id = ?7",
                params![
                    review.status.as_str(),
                    verdict.as_str(),
                    review.guidance,
                    serde_json::to_string(&review.findings)?,
                    serde_json::to_string(&review.standards_cited)?,
                    review.completed_at,
                    review_task_id,
                ],
            )?;

            let Some(mut task) = load_governed(conn, &review.impl_task_id)? else {
                return Ok(CompletionApplied {
                    review,
                    task: None,
                    released: false,
                });
            };
            if !task.blockers.contains(&review.review_task_id) {
                return Err(CarapaceError::BlockerNotFound(format!(
                    "review '{}' is not an outstanding blocker of task '{}'",
                    review_task_id, task.impl_task_id
                )));
            }

            match verdict {
                Verdict::Approved => task.blockers.retain(|b| b != review_task_id),
                Verdict::Blocked => {
                    task.description = format!(
                        "{}\n\n[{} review {} blocked] {}",
                        task.description.trim_end(),
                        review.review_kind.as_str(),
                        review_task_id,
                        guidance
                    );
                }
                Verdict::NeedsHumanReview => {}
            }

            let was_released = task.status == GovernedTaskStatus::Approved;
            let reviews = load_task_reviews_for(conn, &task.impl_task_id)?;
            task.status = recompute_status(&task, &reviews);
            let released = task.status == GovernedTaskStatus::Approved && !was_released;
            if released {
                task.released_at = Some(now);
            }
            save_governed(conn, &task)?;

            Ok(CompletionApplied {
                review,
                task: Some(task),
                released,
            })
        })
    }

    pub fn mark_review_in_progress(&self, review_task_id: &str) -> Result<TaskReviewRecord, CarapaceError> {
        self.tx("carapace", "task_review.start", |conn| {
            let mut review = load_task_review(conn, review_task_id)?
                .ok_or_else(|| CarapaceError::BlockerNotFound(review_task_id.to_string()))?;
            if review.status != TaskReviewStatus::Pending {
                return Err(CarapaceError::ValidationError(format!(
                    "Review '{}' is '{}', not 'pending'",
                    review_task_id,
                    review.status.as_str()
                )));
            }
            conn.execute(
                "UPDATE task_reviews SET status = 'in_progress' WHERE review_task_id = ?1",
                params![review_task_id],
            )?;
            review.status = TaskReviewStatus::InProgress;
            Ok(review)
        })
    }

    pub fn get_governed_task(&self, impl_task_id: &str) -> Result<Option<GovernedTask>, CarapaceError> {
        self.read("governed_task.get", |conn| load_governed(conn, impl_task_id))
    }

    pub fn get_task_review(&self, review_task_id: &str) -> Result<Option<TaskReviewRecord>, CarapaceError> {
        self.read("task_review.get", |conn| load_task_review(conn, review_task_id))
    }

    pub fn task_reviews_for(&self, impl_task_id: &str) -> Result<Vec<TaskReviewRecord>, CarapaceError> {
        self.read("task_review.list_task", |conn| load_task_reviews_for(conn, impl_task_id))
    }

    pub fn pending_task_reviews(&self) -> Result<Vec<TaskReviewRecord>, CarapaceError> {
        self.read("task_review.pending", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM task_reviews WHERE status IN ('pending', 'in_progress') ORDER BY rowid",
                TASK_REVIEW_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], task_review_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // --- Findings & dismissals ---

    /// Insert a finding or, when its fingerprint is known, count another occurrence.
    pub fn upsert_finding(&self, input: &NewFinding<'_>) -> Result<ToolFinding, CarapaceError> {
        self.tx(input.tool, "finding.record", |conn| {
            let now = time::now_epoch_z();
            let updated = conn.execute(
                "UPDATE findings SET occurrences = occurrences + 1, last_seen = ?1 WHERE fingerprint = ?2",
                params![now, input.fingerprint],
            )?;
            if updated == 0 {
                conn.execute(
                    &format!(
                        "INSERT INTO findings({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', 1, ?8, ?8)",
                        FINDING_COLUMNS
                    ),
                    params![
                        time::prefixed_id("FND"),
                        input.fingerprint,
                        input.tool,
                        input.rule,
                        input.path,
                        input.message,
                        input.severity,
                        now,
                    ],
                )?;
            }
            Ok(conn.query_row(
                &format!("SELECT {} FROM findings WHERE fingerprint = ?1", FINDING_COLUMNS),
                params![input.fingerprint],
                finding_from_row,
            )?)
        })
    }

    pub fn get_finding(&self, finding_id: &str) -> Result<Option<ToolFinding>, CarapaceError> {
        self.read("finding.get", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM findings WHERE id = ?1", FINDING_COLUMNS),
                    params![finding_id],
                    finding_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_findings(&self, status: Option<FindingStatus>) -> Result<Vec<ToolFinding>, CarapaceError> {
        self.read("finding.list", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM findings WHERE (?1 IS NULL OR status = ?1) ORDER BY last_seen DESC, rowid DESC",
                FINDING_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], finding_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_finding_status(&self, finding_id: &str, status: FindingStatus) -> Result<(), CarapaceError> {
        self.tx("carapace", "finding.status", |conn| {
            let updated = conn.execute(
                "UPDATE findings SET status = ?1 WHERE id = ?2",
                params![status.as_str(), finding_id],
            )?;
            if updated == 0 {
                return Err(CarapaceError::NotFound(format!("Finding '{}' not found", finding_id)));
            }
            Ok(())
        })
    }

    /// Append a dismissal and mark the finding dismissed, atomically.
    pub fn insert_dismissal(
        &self,
        finding_id: &str,
        justification: &str,
        dismissed_by: &str,
    ) -> Result<DismissalRecord, CarapaceError> {
        self.tx(dismissed_by, "finding.dismiss", |conn| {
            let fingerprint: String = conn
                .query_row(
                    "SELECT fingerprint FROM findings WHERE id = ?1",
                    params![finding_id],
                    |r| r.get(0),
                )
                .optional()?
                .ok_or_else(|| CarapaceError::NotFound(format!("Finding '{}' not found", finding_id)))?;
            let record = DismissalRecord {
                id: time::prefixed_id("DSM"),
                finding_id: finding_id.to_string(),
                fingerprint,
                justification: justification.to_string(),
                dismissed_by: dismissed_by.to_string(),
                created_at: time::now_epoch_z(),
            };
            conn.execute(
                "INSERT INTO dismissals(id, finding_id, fingerprint, justification, dismissed_by, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.finding_id,
                    record.fingerprint,
                    record.justification,
                    record.dismissed_by,
                    record.created_at,
                ],
            )?;
            conn.execute(
                "UPDATE findings SET status = 'dismissed' WHERE id = ?1",
                params![finding_id],
            )?;
            Ok(record)
        })
    }

    pub fn dismissal_count(&self, fingerprint: &str) -> Result<i64, CarapaceError> {
        self.read("finding.dismissal_count", |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM dismissals WHERE fingerprint = ?1",
                params![fingerprint],
                |r| r.get(0),
            )?)
        })
    }

    pub fn dismissals_for(&self, finding_id: &str) -> Result<Vec<DismissalRecord>, CarapaceError> {
        self.read("finding.dismissals", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, finding_id, fingerprint, justification, dismissed_by, created_at
                 FROM dismissals WHERE finding_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![finding_id], dismissal_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // --- Holistic sessions ---

    /// Record a task creation and refresh the session's settle deadline.
    pub fn record_session_task(
        &self,
        session_id: &str,
        task_id: &str,
        subject: &str,
        description: &str,
        now_ms: i64,
        debounce_ms: i64,
    ) -> Result<SettleTicket, CarapaceError> {
        self.tx("carapace", "session.task_created", |conn| {
            let deadline_ms = now_ms + debounce_ms;
            let existing = conn
                .query_row(
                    &format!("SELECT {} FROM session_flags WHERE session_id = ?1", FLAG_COLUMNS),
                    params![session_id],
                    flag_from_row,
                )
                .optional()?;

            let generation = match existing {
                None => {
                    conn.execute(
                        "INSERT INTO session_flags(session_id, status, task_ids, guidance, generation, deadline_ms, created_at_ms, updated_at_ms)
                         VALUES(?1, 'pending', '[]', '', 1, ?2, ?3, ?3)",
                        params![session_id, deadline_ms, now_ms],
                    )?;
                    1
                }
                Some(flag) => {
                    let generation = flag.generation + 1;
                    // A verdict already standing on the session is kept; new tasks join the
                    // next batch once a human clears it.
                    let (status, created_at_ms) = match flag.status {
                        SessionFlagStatus::Blocked | SessionFlagStatus::NeedsHumanReview => {
                            (flag.status, flag.created_at_ms)
                        }
                        SessionFlagStatus::Cleared => (SessionFlagStatus::Pending, now_ms),
                        SessionFlagStatus::Pending | SessionFlagStatus::Reviewing => {
                            (SessionFlagStatus::Pending, flag.created_at_ms)
                        }
                    };
                    conn.execute(
                        "UPDATE session_flags SET status = ?1, generation = ?2, deadline_ms = ?3, created_at_ms = ?4, updated_at_ms = ?5
                         WHERE session_id = ?6",
                        params![status.as_str(), generation, deadline_ms, created_at_ms, now_ms, session_id],
                    )?;
                    generation
                }
            };

            conn.execute(
                "INSERT INTO session_tasks(task_id, session_id, subject, description, generation, created_at_ms, holistic_status)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, 'pending')
                 ON CONFLICT(task_id) DO UPDATE SET generation = excluded.generation",
                params![task_id, session_id, subject, description, generation, now_ms],
            )?;

            Ok(SettleTicket {
                session_id: session_id.to_string(),
                generation,
                scheduled_at_ms: now_ms,
                deadline_ms,
            })
        })
    }

    /// Atomically claim the settle for `ticket`. Returns the batch only if the ticket still
    /// carries the latest generation and the session is waiting to settle.
    pub fn claim_settle(
        &self,
        ticket: &SettleTicket,
        now_ms: i64,
    ) -> Result<Option<Vec<SessionTask>>, CarapaceError> {
        self.tx("carapace", "session.claim_settle", |conn| {
            let claimed = conn.execute(
                "UPDATE session_flags SET status = 'reviewing', updated_at_ms = ?1
                 WHERE session_id = ?2 AND generation = ?3 AND status = 'pending'",
                params![now_ms, ticket.session_id, ticket.generation],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM session_tasks WHERE session_id = ?1 AND holistic_status = 'pending'
                 ORDER BY created_at_ms, rowid",
                SESSION_TASK_COLUMNS
            ))?;
            let tasks = stmt
                .query_map(params![ticket.session_id], session_task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
            conn.execute(
                "UPDATE session_flags SET task_ids = ?1 WHERE session_id = ?2",
                params![serde_json::to_string(&ids)?, ticket.session_id],
            )?;
            Ok(Some(tasks))
        })
    }

    /// Write the outcome of a settle. `flag_status` of `Cleared` only clears the flag when no
    /// newer task arrived meanwhile; blocking outcomes always stand.
    pub fn resolve_session(
        &self,
        ticket: &SettleTicket,
        task_ids: &[String],
        task_status: HolisticStatus,
        flag_status: SessionFlagStatus,
        guidance: &str,
        now_ms: i64,
    ) -> Result<SessionFlag, CarapaceError> {
        self.tx("carapace", "session.resolve", |conn| {
            for id in task_ids {
                conn.execute(
                    "UPDATE session_tasks SET holistic_status = ?1 WHERE task_id = ?2",
                    params![task_status.as_str(), id],
                )?;
            }
            match flag_status {
                SessionFlagStatus::Cleared => {
                    conn.execute(
                        "UPDATE session_flags SET status = 'cleared', guidance = ?1, updated_at_ms = ?2
                         WHERE session_id = ?3 AND generation = ?4 AND status = 'reviewing'",
                        params![guidance, now_ms, ticket.session_id, ticket.generation],
                    )?;
                }
                other => {
                    conn.execute(
                        "UPDATE session_flags SET status = ?1, guidance = ?2, task_ids = ?3, updated_at_ms = ?4
                         WHERE session_id = ?5",
                        params![
                            other.as_str(),
                            guidance,
                            serde_json::to_string(task_ids)?,
                            now_ms,
                            ticket.session_id
                        ],
                    )?;
                }
            }
            Ok(conn.query_row(
                &format!("SELECT {} FROM session_flags WHERE session_id = ?1", FLAG_COLUMNS),
                params![ticket.session_id],
                flag_from_row,
            )?)
        })
    }

    pub fn get_session_flag(&self, session_id: &str) -> Result<Option<SessionFlag>, CarapaceError> {
        self.read("session.flag", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM session_flags WHERE session_id = ?1", FLAG_COLUMNS),
                    params![session_id],
                    flag_from_row,
                )
                .optional()?)
        })
    }

    /// Clear a flag if it is still exactly as observed (`updated_at_ms` unchanged), returning
    /// the tasks that were waiting on it. Used for stale-flag recovery.
    pub fn clear_stale_flag(
        &self,
        session_id: &str,
        observed_updated_at_ms: i64,
        now_ms: i64,
    ) -> Result<Option<Vec<SessionTask>>, CarapaceError> {
        self.tx("carapace", "session.clear_stale", |conn| {
            let cleared = conn.execute(
                "UPDATE session_flags SET status = 'cleared', guidance = 'auto-cleared: stale review flag', updated_at_ms = ?1
                 WHERE session_id = ?2 AND updated_at_ms = ?3 AND status IN ('pending', 'reviewing')",
                params![now_ms, session_id, observed_updated_at_ms],
            )?;
            if cleared == 0 {
                return Ok(None);
            }
            let tasks = take_pending_tasks(conn, session_id, HolisticStatus::Individual)?;
            Ok(Some(tasks))
        })
    }

    /// Human resolution of a standing flag. Tasks the verdict held back are handed over for
    /// individual review. If tasks are still waiting for a collective review, the flag goes
    /// back to pending with a fresh generation and a ticket is returned.
    pub fn clear_session_flag(
        &self,
        session_id: &str,
        actor: &str,
        now_ms: i64,
        debounce_ms: i64,
    ) -> Result<FlagCleared, CarapaceError> {
        self.tx(actor, "session.clear", |conn| {
            let flag = conn
                .query_row(
                    &format!("SELECT {} FROM session_flags WHERE session_id = ?1", FLAG_COLUMNS),
                    params![session_id],
                    flag_from_row,
                )
                .optional()?
                .ok_or_else(|| {
                    CarapaceError::NotFound(format!("No review flag for session '{}'", session_id))
                })?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM session_tasks WHERE session_id = ?1 AND holistic_status IN ('revision', 'escalated')
                 ORDER BY created_at_ms, rowid",
                SESSION_TASK_COLUMNS
            ))?;
            let released = stmt
                .query_map(params![session_id], session_task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            for t in &released {
                conn.execute(
                    "UPDATE session_tasks SET holistic_status = 'individual' WHERE task_id = ?1",
                    params![t.task_id],
                )?;
            }

            let waiting: i64 = conn.query_row(
                "SELECT COUNT(*) FROM session_tasks WHERE session_id = ?1 AND holistic_status = 'pending'",
                params![session_id],
                |r| r.get(0),
            )?;
            let generation = flag.generation + 1;
            if waiting == 0 {
                conn.execute(
                    "UPDATE session_flags SET status = 'cleared', generation = ?1, guidance = ?2, updated_at_ms = ?3
                     WHERE session_id = ?4",
                    params![generation, format!("cleared by {}", actor), now_ms, session_id],
                )?;
                return Ok(FlagCleared {
                    ticket: None,
                    released,
                });
            }
            let deadline_ms = now_ms + debounce_ms;
            conn.execute(
                "UPDATE session_flags SET status = 'pending', generation = ?1, guidance = '', deadline_ms = ?2, created_at_ms = ?3, updated_at_ms = ?3
                 WHERE session_id = ?4",
                params![generation, deadline_ms, now_ms, session_id],
            )?;
            Ok(FlagCleared {
                ticket: Some(SettleTicket {
                    session_id: session_id.to_string(),
                    generation,
                    scheduled_at_ms: now_ms,
                    deadline_ms,
                }),
                released,
            })
        })
    }

    pub fn session_tasks(&self, session_id: &str) -> Result<Vec<SessionTask>, CarapaceError> {
        self.read("session.tasks", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM session_tasks WHERE session_id = ?1 ORDER BY created_at_ms, rowid",
                SESSION_TASK_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![session_id], session_task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn take_pending_tasks(
    conn: &Connection,
    session_id: &str,
    new_status: HolisticStatus,
) -> Result<Vec<SessionTask>, CarapaceError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM session_tasks WHERE session_id = ?1 AND holistic_status = 'pending'
         ORDER BY created_at_ms, rowid",
        SESSION_TASK_COLUMNS
    ))?;
    let tasks = stmt
        .query_map(params![session_id], session_task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for t in &tasks {
        conn.execute(
            "UPDATE session_tasks SET holistic_status = ?1 WHERE task_id = ?2",
            params![new_status.as_str(), t.task_id],
        )?;
    }
    Ok(tasks)
}
