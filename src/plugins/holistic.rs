//! Holistic (per-session) review coordinator.
//!
//! Task creation in a session is debounced: every creation bumps the session's generation
//! and pushes its settle deadline out by the debounce window. When a settle check fires it
//! may act only if it carries the latest generation, and the claim itself is a single
//! conditional UPDATE, so a burst of concurrent creations yields exactly one collective
//! review and every task lands in that batch.
//!
//! ```text
//! Idle -> Pending(deadline) -> Reviewing -> Cleared | Blocked | NeedsHumanReview
//!            ^   new task         |
//!            +--------------------+
//! ```
//!
//! The gate is consulted before every mutating action in a session. With no standing flag
//! it answers after a single keyed lookup.
//!
//! Every task recorded here is also held in the host store behind a `holistic:<session>`
//! blocker. The blocker is swapped for the task's individual review when the batch is
//! approved, skipped, auto-cleared or cleared by a human, and stays while the batch is
//! blocked or escalated.

use crate::core::config::HolisticConfig;
use crate::core::error::CarapaceError;
use crate::core::task_repo;
use crate::core::time;
use crate::plugins::governance::GovernanceEngine;
use crate::plugins::governance_store::{
    FlagCleared, HolisticStatus, ReviewVerdict, SessionFlag, SessionFlagStatus, SessionTask,
    SettleTicket,
};
use crate::plugins::reviewer::{self, RESPONSE_CONTRACT, ReviewKind, ReviewRequest, Verdict};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        time::now_epoch_millis() as i64
    }
}

/// Hand-driven clock for deterministic debounce tests.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Host-store blocker holding a session's tasks until its collective review resolves.
pub fn holistic_blocker(session_id: &str) -> String {
    format!("holistic:{}", session_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreated {
    pub session_id: String,
    pub task_id: String,
    pub subject: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Write,
    Execute,
    Delegate,
}

impl GateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateAction::Write => "write",
            GateAction::Execute => "execute",
            GateAction::Delegate => "delegate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub session_id: String,
    pub action: GateAction,
    pub status: Option<SessionFlagStatus>,
    pub reason: String,
    /// Set when a stale flag was cleared to let this action through.
    #[serde(default)]
    pub auto_cleared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleOutcome {
    /// The deadline has not passed yet.
    NotDue { session_id: String, remaining_ms: i64 },
    /// A newer creation (or another settle) owns the session now.
    Superseded { session_id: String, generation: i64 },
    /// Too few tasks for a collective review; each goes to individual review.
    Skipped {
        session_id: String,
        tasks: Vec<String>,
        queued_reviews: Vec<String>,
    },
    Reviewed {
        session_id: String,
        verdict: Verdict,
        tasks: Vec<String>,
        guidance: String,
        queued_reviews: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusView {
    pub session_id: String,
    pub flag: Option<SessionFlag>,
    pub tasks: Vec<SessionTask>,
}

pub struct HolisticReviewCoordinator {
    engine: Arc<GovernanceEngine>,
    clock: Arc<dyn Clock>,
    config: HolisticConfig,
    review_budget: Duration,
}

impl HolisticReviewCoordinator {
    pub fn new(engine: Arc<GovernanceEngine>, clock: Arc<dyn Clock>) -> Self {
        let config = engine.config().holistic.clone();
        let review_budget = engine.config().review.holistic();
        Self {
            engine,
            clock,
            config,
            review_budget,
        }
    }

    pub fn config(&self) -> &HolisticConfig {
        &self.config
    }

    fn debounce_ms(&self) -> i64 {
        self.config.debounce_ms as i64
    }

    fn stale_ms(&self) -> i64 {
        (self.config.stale_flag_secs as i64).saturating_mul(1000)
    }

    /// Record a creation and return the ticket for the settle check it schedules.
    pub fn record_task_created(&self, event: &TaskCreated) -> Result<SettleTicket, CarapaceError> {
        if event.session_id.trim().is_empty() || event.task_id.trim().is_empty() {
            return Err(CarapaceError::ValidationError(
                "Task creation events need a session id and a task id".to_string(),
            ));
        }
        task_repo::tolerate_untracked(
            &event.task_id,
            self.engine
                .tasks()
                .add_blocker(&event.task_id, &holistic_blocker(&event.session_id)),
        )?;
        let ticket = self.engine.store().record_session_task(
            &event.session_id,
            &event.task_id,
            &event.subject,
            &event.description,
            self.clock.now_ms(),
            self.debounce_ms(),
        )?;
        debug!(
            session = %ticket.session_id,
            task = %event.task_id,
            generation = ticket.generation,
            deadline_ms = ticket.deadline_ms,
            "task creation recorded"
        );
        Ok(ticket)
    }

    /// Record a creation and schedule its settle on a background timer thread.
    pub fn on_task_created(
        self: &Arc<Self>,
        event: &TaskCreated,
    ) -> Result<(SettleTicket, JoinHandle<()>), CarapaceError> {
        let ticket = self.record_task_created(event)?;
        let handle = self.schedule(ticket.clone());
        Ok((ticket, handle))
    }

    pub fn schedule(self: &Arc<Self>, ticket: SettleTicket) -> JoinHandle<()> {
        let this = Arc::clone(self);
        thread::spawn(move || match this.wait_and_settle(&ticket) {
            Ok(outcome) => debug!(session = %ticket.session_id, ?outcome, "settle finished"),
            Err(err) => error!(session = %ticket.session_id, error = %err, "settle failed"),
        })
    }

    /// Sleep until the ticket's deadline, then settle.
    pub fn wait_and_settle(&self, ticket: &SettleTicket) -> Result<SettleOutcome, CarapaceError> {
        let remaining = ticket.deadline_ms - self.clock.now_ms();
        if remaining > 0 {
            thread::sleep(Duration::from_millis(remaining as u64));
        }
        self.settle(ticket)
    }

    /// Run the settle check for `ticket`. Only the latest ticket of a pending session acts.
    pub fn settle(&self, ticket: &SettleTicket) -> Result<SettleOutcome, CarapaceError> {
        let now = self.clock.now_ms();
        if now < ticket.deadline_ms {
            return Ok(SettleOutcome::NotDue {
                session_id: ticket.session_id.clone(),
                remaining_ms: ticket.deadline_ms - now,
            });
        }

        let store = self.engine.store();
        let Some(batch) = store.claim_settle(ticket, now)? else {
            debug!(session = %ticket.session_id, generation = ticket.generation, "settle superseded");
            return Ok(SettleOutcome::Superseded {
                session_id: ticket.session_id.clone(),
                generation: ticket.generation,
            });
        };
        let task_ids: Vec<String> = batch.iter().map(|t| t.task_id.clone()).collect();

        if batch.len() < self.config.min_batch {
            let queued_reviews = self.enqueue_individual(&batch)?;
            store.resolve_session(
                ticket,
                &task_ids,
                HolisticStatus::Individual,
                SessionFlagStatus::Cleared,
                "batch below holistic threshold; tasks reviewed individually",
                self.clock.now_ms(),
            )?;
            info!(session = %ticket.session_id, tasks = task_ids.len(), "holistic review skipped");
            return Ok(SettleOutcome::Skipped {
                session_id: ticket.session_id.clone(),
                tasks: task_ids,
                queued_reviews,
            });
        }

        let request = self.collective_request(&ticket.session_id, &batch);
        let bundle = reviewer::review_or_degrade(
            self.engine.reviewer().as_ref(),
            &request,
            self.review_budget,
        );
        let verdict = bundle.verdict;
        let guidance = bundle.guidance.clone();

        store.insert_review(&ReviewVerdict {
            id: time::prefixed_id("REV"),
            decision_id: None,
            context_kind: ReviewKind::Holistic,
            context_ref: ticket.session_id.clone(),
            verdict,
            findings: bundle.findings,
            guidance: bundle.guidance,
            standards_cited: bundle.standards_cited,
            reviewer: bundle.reviewer,
            created_at: time::now_epoch_z(),
        })?;

        let (queued_reviews, task_status, flag_status) = match verdict {
            Verdict::Approved => (
                self.enqueue_individual(&batch)?,
                HolisticStatus::Approved,
                SessionFlagStatus::Cleared,
            ),
            Verdict::Blocked => (Vec::new(), HolisticStatus::Revision, SessionFlagStatus::Blocked),
            Verdict::NeedsHumanReview => (
                Vec::new(),
                HolisticStatus::Escalated,
                SessionFlagStatus::NeedsHumanReview,
            ),
        };
        store.resolve_session(
            ticket,
            &task_ids,
            task_status,
            flag_status,
            &guidance,
            self.clock.now_ms(),
        )?;
        info!(
            session = %ticket.session_id,
            tasks = task_ids.len(),
            verdict = verdict.as_str(),
            "holistic review resolved"
        );

        Ok(SettleOutcome::Reviewed {
            session_id: ticket.session_id.clone(),
            verdict,
            tasks: task_ids,
            guidance,
            queued_reviews,
        })
    }

    fn collective_request(&self, session_id: &str, batch: &[SessionTask]) -> ReviewRequest {
        let standards = self.engine.standards();
        let mut prompt = String::from("# Holistic review\n");
        let _ = writeln!(
            prompt,
            "Session '{}' created these {} tasks in one burst. Judge whether, taken together, they form a coherent plan that respects the standards below.\n",
            session_id,
            batch.len()
        );
        for (i, task) in batch.iter().enumerate() {
            let _ = writeln!(prompt, "{}. [{}] {}", i + 1, task.task_id, task.subject);
            if !task.description.is_empty() {
                let _ = writeln!(prompt, "   {}", task.description);
            }
        }
        prompt.push_str("\n## Standards\n");
        if standards.is_empty() {
            prompt.push_str("(none recorded)\n");
        }
        for s in standards.iter() {
            let _ = writeln!(prompt, "- {}: {}", s.name, s.observations.join("; "));
        }
        prompt.push('\n');
        prompt.push_str(RESPONSE_CONTRACT);
        ReviewRequest {
            kind: ReviewKind::Holistic,
            subject: session_id.to_string(),
            prompt,
            standards: standards.iter().map(|s| s.name.clone()).collect(),
        }
    }

    /// Queue each task's individual review, then lift its holistic blocker. The review
    /// blocker lands first, so the host task is never briefly claimable.
    fn enqueue_individual(&self, tasks: &[SessionTask]) -> Result<Vec<String>, CarapaceError> {
        let host = self.engine.tasks();
        tasks
            .iter()
            .map(|t| {
                let review = self
                    .engine
                    .enqueue_individual_review(&t.task_id, &t.subject, &t.description)?;
                task_repo::tolerate_untracked(
                    &t.task_id,
                    host.remove_blocker(&t.task_id, &holistic_blocker(&t.session_id)),
                )?;
                Ok(review.review_task_id)
            })
            .collect()
    }

    /// Decide whether a mutating action may proceed in `session_id`.
    pub fn gate_check(&self, session_id: &str, action: GateAction) -> Result<GateDecision, CarapaceError> {
        let store = self.engine.store();
        let allow = |reason: &str, status, auto_cleared| GateDecision {
            allowed: true,
            session_id: session_id.to_string(),
            action,
            status,
            reason: reason.to_string(),
            auto_cleared,
        };
        let deny = |reason: String, status| GateDecision {
            allowed: false,
            session_id: session_id.to_string(),
            action,
            status: Some(status),
            reason,
            auto_cleared: false,
        };

        // A flag observed twice at most: the second read follows a lost auto-clear race.
        for _ in 0..2 {
            let Some(flag) = store.get_session_flag(session_id)? else {
                return Ok(allow("no review flag for session", None, false));
            };
            match flag.status {
                SessionFlagStatus::Cleared => {
                    return Ok(allow("review flag cleared", Some(flag.status), false));
                }
                SessionFlagStatus::Pending | SessionFlagStatus::Reviewing => {
                    let now = self.clock.now_ms();
                    if now - flag.updated_at_ms <= self.stale_ms() {
                        return Ok(deny(
                            format!(
                                "Holistic review in progress for session '{}'; {} blocked until it settles.",
                                session_id,
                                action.as_str()
                            ),
                            flag.status,
                        ));
                    }
                    match store.clear_stale_flag(session_id, flag.updated_at_ms, now)? {
                        Some(tasks) => {
                            warn!(
                                session = session_id,
                                age_ms = now - flag.updated_at_ms,
                                tasks = tasks.len(),
                                "stale review flag auto-cleared"
                            );
                            self.enqueue_individual(&tasks)?;
                            return Ok(allow(
                                "stale review flag auto-cleared; tasks routed to individual review",
                                Some(SessionFlagStatus::Cleared),
                                true,
                            ));
                        }
                        None => continue,
                    }
                }
                SessionFlagStatus::Blocked => {
                    return Ok(deny(
                        format!("Holistic review blocked this session: {}", flag.guidance),
                        flag.status,
                    ));
                }
                SessionFlagStatus::NeedsHumanReview => {
                    return Ok(deny(
                        format!(
                            "Holistic review needs a human decision before work continues: {}",
                            flag.guidance
                        ),
                        flag.status,
                    ));
                }
            }
        }
        Err(CarapaceError::LockContention(format!("session flag '{}'", session_id)))
    }

    /// Human resolution of a standing flag. Held-back tasks go to individual review.
    pub fn clear_session_flag(&self, session_id: &str, actor: &str) -> Result<FlagCleared, CarapaceError> {
        if actor.trim().is_empty() {
            return Err(CarapaceError::ValidationError(
                "Clearing a review flag requires an actor".to_string(),
            ));
        }
        let cleared = self.engine.store().clear_session_flag(
            session_id,
            actor,
            self.clock.now_ms(),
            self.debounce_ms(),
        )?;
        self.enqueue_individual(&cleared.released)?;
        info!(
            session = session_id,
            actor,
            released = cleared.released.len(),
            rescheduled = cleared.ticket.is_some(),
            "review flag cleared"
        );
        Ok(cleared)
    }

    pub fn session_status(&self, session_id: &str) -> Result<SessionStatusView, CarapaceError> {
        let store = self.engine.store();
        Ok(SessionStatusView {
            session_id: session_id.to_string(),
            flag: store.get_session_flag(session_id)?,
            tasks: store.session_tasks(session_id)?,
        })
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "session",
        "version": "0.3.0",
        "description": "Debounced collective review of task bursts and the pre-action gate",
        "commands": [
            { "name": "created", "parameters": ["session", "task", "subject", "description", "detach"] },
            { "name": "settle", "parameters": ["session", "generation", "deadline-ms", "wait"] },
            { "name": "gate", "parameters": ["session", "action"], "exit_codes": { "0": "allowed", "2": "blocked" } },
            { "name": "clear", "parameters": ["session", "by"] },
            { "name": "status", "parameters": ["session"] }
        ],
        "storage": ["governance.db"]
    })
}
