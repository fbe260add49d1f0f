//! Decision, plan and completion review orchestration, and the governed-task lifecycle.
//!
//! Agents call the engine synchronously. It reads standards from the knowledge graph,
//! consults the reviewer, persists the verdict, mirrors the outcome back into the graph as
//! a `governance_record` entity and returns the verdict.
//!
//! Governed tasks are blocked from birth: the review task is created first and the
//! implementation task is created with that review already in its `blocked_by` list. A task
//! is released only after every stacked review approves it.
//!
//! The reviewer is never called while the DB broker is held.

use crate::core::config::GovernanceConfig;
use crate::core::error::CarapaceError;
use crate::core::task_repo::{self, TaskDraft, TaskRecordRepository, TaskStatus};
use crate::core::time;
use crate::plugins::governance_store::{
    CompletionApplied, Decision, DecisionCategory, DecisionHistoryEntry, GovernanceStatus,
    GovernanceStore, GovernedTask, GovernedTaskStatus, HistoryFilter, NewDecision,
    ReviewVerdict, TaskReviewKind, TaskReviewRecord, TaskReviewStatus,
};
use crate::plugins::graph::{Entity, Relation, TieredGraphStore};
use crate::plugins::reviewer::{
    self, DecisionReviewer, Finding, RESPONSE_CONTRACT, ReviewKind, ReviewRequest, Verdict,
    VerdictBundle,
};
use crate::plugins::tier::{CallerRole, ProtectionTier};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ESCALATION_REVIEWER: &str = "policy:human-escalation";
pub const COMPLETION_GATE_REVIEWER: &str = "policy:completion-gate";
const MIRROR_KIND: &str = "governance_record";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionInput {
    pub task_id: String,
    pub agent_id: String,
    pub category: DecisionCategory,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
    pub confidence: f64,
    #[serde(default)]
    pub supersedes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub review: ReviewVerdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernedTaskInput {
    pub subject: String,
    pub description: String,
    #[serde(default)]
    pub context: String,
    pub review_kind: TaskReviewKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernedTaskCreated {
    pub implementation_task_id: String,
    pub review_task_id: String,
    pub task: GovernedTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerAdded {
    pub implementation_task_id: String,
    pub review_task_id: String,
    pub blockers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReviewCompletion {
    pub review_task_id: String,
    pub implementation_task_id: String,
    pub verdict: Verdict,
    /// False for reviews that gate no governed task.
    pub governed: bool,
    pub task_released: bool,
    pub remaining_blockers: usize,
    pub task_status: Option<GovernedTaskStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReviewStatusView {
    pub task: GovernedTask,
    pub reviews: Vec<TaskReviewRecord>,
    pub host_blockers: Vec<String>,
    pub can_execute: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub governance: GovernanceStatus,
    pub graph_entities: usize,
    pub graph_relations: usize,
    pub standards: usize,
    pub reviewer: String,
}

// --- Standards cache ---

struct CachedStandards {
    generation: u64,
    fetched_at: Instant,
    entities: Arc<Vec<Entity>>,
}

/// Human-only and approval-gated entities, served from a short TTL cache. Only writes that
/// touch a protected entity invalidate it; decision mirrors and other open-tier writes do not.
struct StandardsCache {
    ttl: Duration,
    slot: Mutex<Option<CachedStandards>>,
}

impl StandardsCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    fn get(&self, graph: &TieredGraphStore) -> Arc<Vec<Entity>> {
        let generation = graph.protected_generation();
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = slot.as_ref() {
            if cached.generation == generation && cached.fetched_at.elapsed() < self.ttl {
                return Arc::clone(&cached.entities);
            }
        }
        let mut entities = graph.get_by_tier(ProtectionTier::HumanOnly);
        entities.extend(graph.get_by_tier(ProtectionTier::ApprovalGated));
        let entities = Arc::new(entities);
        debug!(count = entities.len(), generation, "standards cache refreshed");
        *slot = Some(CachedStandards {
            generation,
            fetched_at: Instant::now(),
            entities: Arc::clone(&entities),
        });
        entities
    }
}

// --- Prompt assembly ---

fn format_standards(out: &mut String, standards: &[Entity]) {
    if standards.is_empty() {
        out.push_str("\n## Standards\n(none recorded)\n");
        return;
    }
    out.push_str("\n## Standards\n");
    for s in standards {
        let _ = writeln!(out, "### {} ({})", s.name, s.entity_type);
        for o in &s.observations {
            let _ = writeln!(out, "- {}", o);
        }
    }
}

fn format_decision(out: &mut String, d: &Decision) {
    let _ = writeln!(
        out,
        "- [{}] #{} {} ({}, confidence {:.2}): {}",
        d.id,
        d.sequence,
        d.category.as_str(),
        d.agent_id,
        d.confidence,
        d.summary
    );
    if !d.detail.is_empty() {
        let _ = writeln!(out, "  {}", d.detail);
    }
}

fn format_review(out: &mut String, r: &ReviewVerdict) {
    let target = r.decision_id.as_deref().unwrap_or(&r.context_ref);
    let _ = writeln!(
        out,
        "- {} review of {}: {} by {}. {}",
        r.context_kind.as_str(),
        target,
        r.verdict.as_str(),
        r.reviewer,
        r.guidance
    );
}

fn finish_prompt(mut out: String) -> String {
    out.push('\n');
    out.push_str(RESPONSE_CONTRACT);
    out.push('\n');
    out
}

fn names(entities: &[Entity]) -> Vec<String> {
    entities.iter().map(|e| e.name.clone()).collect()
}

fn verdict_record(
    bundle: VerdictBundle,
    kind: ReviewKind,
    context_ref: &str,
    decision_id: Option<&str>,
) -> ReviewVerdict {
    ReviewVerdict {
        id: time::prefixed_id("REV"),
        decision_id: decision_id.map(|s| s.to_string()),
        context_kind: kind,
        context_ref: context_ref.to_string(),
        verdict: bundle.verdict,
        findings: bundle.findings,
        guidance: bundle.guidance,
        standards_cited: bundle.standards_cited,
        reviewer: bundle.reviewer,
        created_at: time::now_epoch_z(),
    }
}

pub fn mirror_entity_name(decision_id: &str) -> String {
    format!("decision:{}", decision_id)
}

/// How a task's decisions stand before its completion review.
#[derive(Debug, Default)]
struct DecisionLedger {
    unreviewed: Vec<String>,
    blocked: Vec<String>,
    escalated: Vec<String>,
}

/// A decision counts as resolved once its own latest verdict is approved, or once a
/// decision superseding it has an approved latest verdict.
fn audit_decisions(decisions: &[Decision], reviews: &[ReviewVerdict]) -> DecisionLedger {
    let latest = |id: &str| -> Option<Verdict> {
        reviews
            .iter()
            .filter(|r| r.decision_id.as_deref() == Some(id))
            .last()
            .map(|r| r.verdict)
    };
    let superseded_by_approved = |id: &str| -> bool {
        decisions
            .iter()
            .filter(|d| d.supersedes.as_deref() == Some(id))
            .any(|d| latest(&d.id) == Some(Verdict::Approved))
    };

    let mut ledger = DecisionLedger::default();
    for d in decisions {
        if superseded_by_approved(&d.id) {
            continue;
        }
        match latest(&d.id) {
            None => ledger.unreviewed.push(d.id.clone()),
            Some(Verdict::Blocked) => ledger.blocked.push(d.id.clone()),
            Some(Verdict::NeedsHumanReview) => ledger.escalated.push(d.id.clone()),
            Some(Verdict::Approved) => {}
        }
    }
    ledger
}

// --- Engine ---

pub struct GovernanceEngine {
    store: Arc<GovernanceStore>,
    graph: Arc<TieredGraphStore>,
    tasks: Arc<dyn TaskRecordRepository>,
    reviewer: Arc<dyn DecisionReviewer>,
    config: GovernanceConfig,
    standards: StandardsCache,
}

impl GovernanceEngine {
    pub fn new(
        store: Arc<GovernanceStore>,
        graph: Arc<TieredGraphStore>,
        tasks: Arc<dyn TaskRecordRepository>,
        reviewer: Arc<dyn DecisionReviewer>,
        config: GovernanceConfig,
    ) -> Self {
        let ttl = Duration::from_secs(config.standards.cache_ttl_secs);
        Self {
            store,
            graph,
            tasks,
            reviewer,
            config,
            standards: StandardsCache::new(ttl),
        }
    }

    pub fn store(&self) -> &Arc<GovernanceStore> {
        &self.store
    }

    pub fn graph(&self) -> &Arc<TieredGraphStore> {
        &self.graph
    }

    pub fn tasks(&self) -> &Arc<dyn TaskRecordRepository> {
        &self.tasks
    }

    pub fn reviewer(&self) -> &Arc<dyn DecisionReviewer> {
        &self.reviewer
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Current human-only and approval-gated entities.
    pub fn standards(&self) -> Arc<Vec<Entity>> {
        self.standards.get(&self.graph)
    }

    // --- Decisions ---

    pub fn submit_decision(&self, input: &DecisionInput) -> Result<DecisionOutcome, CarapaceError> {
        validate_decision(input)?;
        let decision = self.store.insert_decision(&NewDecision {
            task_id: &input.task_id,
            agent_id: &input.agent_id,
            category: input.category,
            summary: &input.summary,
            detail: &input.detail,
            confidence: input.confidence,
            supersedes: input.supersedes.as_deref(),
        })?;
        info!(
            decision = %decision.id,
            task = %decision.task_id,
            category = decision.category.as_str(),
            sequence = decision.sequence,
            "decision recorded"
        );

        let bundle = if decision.category.bypasses_review() {
            reviewer::needs_human_review(
                ESCALATION_REVIEWER,
                &format!(
                    "Decisions of category '{}' always require human review.",
                    decision.category.as_str()
                ),
            )
        } else {
            let standards = self.standards();
            let mut prompt = String::from("# Decision review\n");
            let _ = writeln!(
                prompt,
                "Review this decision made by agent '{}' on task '{}'.\n",
                decision.agent_id, decision.task_id
            );
            format_decision(&mut prompt, &decision);
            if let Some(prev) = &decision.supersedes {
                let _ = writeln!(prompt, "This decision supersedes {}.", prev);
            }
            format_standards(&mut prompt, &standards);
            let request = ReviewRequest {
                kind: ReviewKind::Decision,
                subject: decision.id.clone(),
                prompt: finish_prompt(prompt),
                standards: names(&standards),
            };
            reviewer::review_or_degrade(
                self.reviewer.as_ref(),
                &request,
                self.config.review.decision(),
            )
        };

        let review = verdict_record(bundle, ReviewKind::Decision, &decision.id, Some(decision.id.as_str()));
        self.store.insert_review(&review)?;
        self.mirror_decision(&decision, &review);
        Ok(DecisionOutcome { decision, review })
    }

    /// Append a human verdict to a decision. Earlier verdicts stay as they were.
    pub fn record_human_verdict(
        &self,
        decision_id: &str,
        human: &str,
        verdict: Verdict,
        guidance: &str,
    ) -> Result<ReviewVerdict, CarapaceError> {
        if human.trim().is_empty() {
            return Err(CarapaceError::ValidationError(
                "A human verdict must name its reviewer".to_string(),
            ));
        }
        let decision = self
            .store
            .get_decision(decision_id)?
            .ok_or_else(|| CarapaceError::NotFound(format!("Decision '{}' not found", decision_id)))?;
        let bundle = VerdictBundle {
            verdict,
            findings: Vec::new(),
            guidance: guidance.to_string(),
            standards_cited: Vec::new(),
            reviewer: format!("human:{}", human.trim()),
        };
        let review = verdict_record(bundle, ReviewKind::Decision, &decision.id, Some(decision.id.as_str()));
        self.store.insert_review(&review)?;
        info!(decision = %decision.id, verdict = verdict.as_str(), human, "human verdict recorded");

        let observation = format!("{} verdict {}: {}", review.reviewer, verdict.as_str(), guidance);
        match self.graph.add_observations(
            &mirror_entity_name(&decision.id),
            &[observation],
            CallerRole::Agent,
            false,
        ) {
            Ok(outcome) if outcome.is_denied() => {
                warn!(decision = %decision.id, "governance record mirror denied")
            }
            Ok(_) => {}
            Err(err) => warn!(decision = %decision.id, error = %err, "failed to mirror human verdict"),
        }
        Ok(review)
    }

    pub fn submit_plan_for_review(
        &self,
        task_id: &str,
        agent_id: &str,
        plan: &str,
    ) -> Result<ReviewVerdict, CarapaceError> {
        if plan.trim().is_empty() {
            return Err(CarapaceError::ValidationError("Plan must not be empty".to_string()));
        }
        let standards = self.standards();
        let mut prompt = String::from("# Plan review\n");
        let _ = writeln!(prompt, "Agent '{}' proposes this plan for task '{}':\n", agent_id, task_id);
        prompt.push_str(plan.trim());
        prompt.push('\n');
        self.append_task_history(&mut prompt, task_id)?;
        format_standards(&mut prompt, &standards);

        let request = ReviewRequest {
            kind: ReviewKind::Plan,
            subject: task_id.to_string(),
            prompt: finish_prompt(prompt),
            standards: names(&standards),
        };
        let bundle =
            reviewer::review_or_degrade(self.reviewer.as_ref(), &request, self.config.review.plan());
        let review = verdict_record(bundle, ReviewKind::Plan, task_id, None);
        self.store.insert_review(&review)?;
        Ok(review)
    }

    /// Review a finished task. Outstanding decisions short-circuit without calling the judge.
    pub fn submit_completion_review(
        &self,
        task_id: &str,
        agent_id: &str,
        summary: &str,
    ) -> Result<ReviewVerdict, CarapaceError> {
        let decisions = self.store.decisions_for_task(task_id)?;
        let reviews = self.store.reviews_for_task(task_id)?;
        let ledger = audit_decisions(&decisions, &reviews);

        let gate = if !ledger.blocked.is_empty() {
            Some(VerdictBundle {
                verdict: Verdict::Blocked,
                findings: Vec::new(),
                guidance: format!(
                    "Blocked decisions remain unresolved: {}. Supersede them with an approved decision or obtain a human verdict.",
                    ledger.blocked.join(", ")
                ),
                standards_cited: Vec::new(),
                reviewer: COMPLETION_GATE_REVIEWER.to_string(),
            })
        } else if !ledger.unreviewed.is_empty() {
            Some(reviewer::needs_human_review(
                COMPLETION_GATE_REVIEWER,
                &format!("Decisions were never reviewed: {}.", ledger.unreviewed.join(", ")),
            ))
        } else if !ledger.escalated.is_empty() {
            Some(reviewer::needs_human_review(
                COMPLETION_GATE_REVIEWER,
                &format!(
                    "Decisions still await a human verdict: {}.",
                    ledger.escalated.join(", ")
                ),
            ))
        } else {
            None
        };

        let bundle = match gate {
            Some(bundle) => {
                info!(task = task_id, verdict = bundle.verdict.as_str(), "completion short-circuited");
                bundle
            }
            None => {
                let standards = self.standards();
                let mut prompt = String::from("# Completion review\n");
                let _ = writeln!(
                    prompt,
                    "Agent '{}' reports task '{}' complete:\n",
                    agent_id, task_id
                );
                prompt.push_str(summary.trim());
                prompt.push('\n');
                self.append_task_history(&mut prompt, task_id)?;
                format_standards(&mut prompt, &standards);
                let request = ReviewRequest {
                    kind: ReviewKind::Completion,
                    subject: task_id.to_string(),
                    prompt: finish_prompt(prompt),
                    standards: names(&standards),
                };
                reviewer::review_or_degrade(
                    self.reviewer.as_ref(),
                    &request,
                    self.config.review.completion(),
                )
            }
        };

        let review = verdict_record(bundle, ReviewKind::Completion, task_id, None);
        self.store.insert_review(&review)?;
        Ok(review)
    }

    fn append_task_history(&self, prompt: &mut String, task_id: &str) -> Result<(), CarapaceError> {
        let decisions = self.store.decisions_for_task(task_id)?;
        let reviews = self.store.reviews_for_task(task_id)?;
        prompt.push_str("\n## Decisions on this task\n");
        if decisions.is_empty() {
            prompt.push_str("(none)\n");
        }
        for d in &decisions {
            format_decision(prompt, d);
        }
        prompt.push_str("\n## Prior reviews\n");
        if reviews.is_empty() {
            prompt.push_str("(none)\n");
        }
        for r in &reviews {
            format_review(prompt, r);
        }
        Ok(())
    }

    fn mirror_decision(&self, decision: &Decision, review: &ReviewVerdict) {
        let name = mirror_entity_name(&decision.id);
        let mut observations = vec![
            format!("task: {}", decision.task_id),
            format!("agent: {}", decision.agent_id),
            format!("category: {}", decision.category.as_str()),
            format!("summary: {}", decision.summary),
            format!("verdict: {} ({})", review.verdict.as_str(), review.reviewer),
        ];
        if !review.guidance.is_empty() {
            observations.push(format!("guidance: {}", review.guidance));
        }
        let entity = Entity {
            name: name.clone(),
            entity_type: MIRROR_KIND.to_string(),
            observations,
        };
        match self.graph.create_entities(vec![entity], CallerRole::Agent, false) {
            Ok(outcome) if !outcome.denied.is_empty() => {
                warn!(entity = %name, "governance record mirror denied");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(entity = %name, error = %err, "failed to mirror decision");
                return;
            }
        }
        if let Some(prev) = &decision.supersedes {
            let relation = Relation::new(&name, &mirror_entity_name(prev), "supersedes");
            if let Err(err) = self.graph.create_relations(vec![relation]) {
                warn!(entity = %name, error = %err, "failed to mirror supersedes relation");
            }
        }
    }

    pub fn get_decision_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<DecisionHistoryEntry>, CarapaceError> {
        self.store.decision_history(filter)
    }

    pub fn get_status(&self) -> Result<EngineStatus, CarapaceError> {
        Ok(EngineStatus {
            governance: self.store.status()?,
            graph_entities: self.graph.entity_count(),
            graph_relations: self.graph.relation_count(),
            standards: self.standards().len(),
            reviewer: self.reviewer.name().to_string(),
        })
    }

    // --- Governed tasks ---

    fn create_review_host_task(
        &self,
        subject: &str,
        kind: TaskReviewKind,
        context: &str,
        blocks: Vec<String>,
    ) -> Result<String, CarapaceError> {
        let review = self.tasks.create(TaskDraft {
            subject: format!("[{} review] {}", kind.as_str(), subject),
            description: context.to_string(),
            blocked_by: Vec::new(),
            blocks,
            metadata: json!({"carapace": {"role": "review", "review_kind": kind.as_str()}}),
        })?;
        Ok(review.id)
    }

    /// Create the review task, then the implementation task already blocked by it, then
    /// both governance records in one transaction.
    pub fn create_governed_task(
        &self,
        input: &GovernedTaskInput,
    ) -> Result<GovernedTaskCreated, CarapaceError> {
        if input.subject.trim().is_empty() {
            return Err(CarapaceError::ValidationError(
                "Governed task subject must not be empty".to_string(),
            ));
        }
        let review_task_id =
            self.create_review_host_task(&input.subject, input.review_kind, &input.context, Vec::new())?;
        let implementation = self.tasks.create(TaskDraft {
            subject: input.subject.clone(),
            description: input.description.clone(),
            blocked_by: vec![review_task_id.clone()],
            blocks: Vec::new(),
            metadata: json!({"carapace": {"role": "implementation", "governed": true}}),
        })?;
        let impl_id = implementation.id.clone();
        self.tasks.mutate(&review_task_id, &mut |t| {
            if !t.blocks.contains(&impl_id) {
                t.blocks.push(impl_id.clone());
            }
        })?;

        let now = time::now_epoch_z();
        let task = GovernedTask {
            id: time::prefixed_id("GT"),
            impl_task_id: implementation.id.clone(),
            subject: input.subject.clone(),
            description: input.description.clone(),
            context: input.context.clone(),
            blockers: vec![review_task_id.clone()],
            status: GovernedTaskStatus::PendingReview,
            created_at: now.clone(),
            released_at: None,
        };
        let review = new_review_record(&review_task_id, &implementation.id, input.review_kind, &input.context, now);
        self.store.insert_governed_task(&task, &review)?;
        info!(
            task = %task.impl_task_id,
            review = %review_task_id,
            kind = input.review_kind.as_str(),
            "governed task created"
        );

        Ok(GovernedTaskCreated {
            implementation_task_id: implementation.id,
            review_task_id,
            task,
        })
    }

    /// Stack another independent review onto a governed task.
    pub fn add_review_blocker(
        &self,
        impl_task_id: &str,
        kind: TaskReviewKind,
        context: &str,
    ) -> Result<BlockerAdded, CarapaceError> {
        let existing = self
            .store
            .get_governed_task(impl_task_id)?
            .ok_or_else(|| CarapaceError::UnknownTask(impl_task_id.to_string()))?;
        let review_task_id = self.create_review_host_task(
            &existing.subject,
            kind,
            context,
            vec![impl_task_id.to_string()],
        )?;
        // The host record is blocked before the governance record knows about it, so the
        // task is never less blocked than the store says.
        self.tasks.add_blocker(impl_task_id, &review_task_id)?;
        let review = new_review_record(&review_task_id, impl_task_id, kind, context, time::now_epoch_z());
        let task = self.store.attach_review_blocker(impl_task_id, &review)?;
        info!(task = impl_task_id, review = %review_task_id, blockers = task.blockers.len(), "review blocker stacked");
        Ok(BlockerAdded {
            implementation_task_id: impl_task_id.to_string(),
            review_task_id,
            blockers: task.blockers,
        })
    }

    pub fn complete_task_review(
        &self,
        review_task_id: &str,
        verdict: Verdict,
        guidance: &str,
        findings: &[Finding],
        standards: &[String],
    ) -> Result<TaskReviewCompletion, CarapaceError> {
        let CompletionApplied {
            review,
            task,
            released,
        } = self
            .store
            .apply_review_completion(review_task_id, verdict, guidance, findings, standards)?;

        let Some(task) = task else {
            if verdict == Verdict::Approved {
                task_repo::tolerate_untracked(
                    &review.impl_task_id,
                    self.tasks.remove_blocker(&review.impl_task_id, review_task_id),
                )?;
            }
            debug!(review = review_task_id, verdict = verdict.as_str(), "standalone review completed");
            return Ok(TaskReviewCompletion {
                review_task_id: review.review_task_id,
                implementation_task_id: review.impl_task_id,
                verdict,
                governed: false,
                task_released: false,
                remaining_blockers: 0,
                task_status: None,
            });
        };

        match verdict {
            Verdict::Approved => {
                self.tasks.mutate(review_task_id, &mut |t| t.status = TaskStatus::Completed)?;
                self.tasks.remove_blocker(&task.impl_task_id, review_task_id)?;
            }
            Verdict::Blocked => {
                let note = format!(
                    "\n\n[{} review {} blocked] {}",
                    review.review_kind.as_str(),
                    review_task_id,
                    guidance
                );
                self.tasks.mutate(&task.impl_task_id, &mut |t| {
                    t.description = format!("{}{}", t.description.trim_end(), note);
                })?;
            }
            Verdict::NeedsHumanReview => {}
        }

        info!(
            task = %task.impl_task_id,
            review = review_task_id,
            verdict = verdict.as_str(),
            remaining = task.blockers.len(),
            released,
            "task review completed"
        );
        Ok(TaskReviewCompletion {
            review_task_id: review.review_task_id,
            implementation_task_id: task.impl_task_id.clone(),
            verdict,
            governed: true,
            task_released: released,
            remaining_blockers: task.blockers.len(),
            task_status: Some(task.status),
        })
    }

    pub fn get_task_review_status(&self, impl_task_id: &str) -> Result<TaskReviewStatusView, CarapaceError> {
        let task = self
            .store
            .get_governed_task(impl_task_id)?
            .ok_or_else(|| CarapaceError::UnknownTask(impl_task_id.to_string()))?;
        let reviews = self.store.task_reviews_for(impl_task_id)?;
        let host_blockers = match self.tasks.read(impl_task_id)? {
            Some(record) => record.blocked_by,
            None => {
                warn!(task = impl_task_id, "governed task has no host record");
                task.blockers.clone()
            }
        };
        let can_execute = task.is_claimable() && host_blockers.is_empty();
        Ok(TaskReviewStatusView {
            task,
            reviews,
            host_blockers,
            can_execute,
        })
    }

    pub fn get_pending_reviews(&self) -> Result<Vec<TaskReviewRecord>, CarapaceError> {
        self.store.pending_task_reviews()
    }

    /// Queue a per-task review for a task that is not governed (e.g. after a holistic pass).
    /// The host record, when there is one, stays blocked on the review until it approves.
    pub fn enqueue_individual_review(
        &self,
        impl_task_id: &str,
        subject: &str,
        description: &str,
    ) -> Result<TaskReviewRecord, CarapaceError> {
        let context = format!("{}\n\n{}", subject, description);
        let record = new_review_record(
            &time::prefixed_id("RQ"),
            impl_task_id,
            TaskReviewKind::Governance,
            context.trim(),
            time::now_epoch_z(),
        );
        task_repo::tolerate_untracked(
            impl_task_id,
            self.tasks.add_blocker(impl_task_id, &record.review_task_id),
        )?;
        self.store.insert_standalone_review(&record)?;
        debug!(task = impl_task_id, review = %record.review_task_id, "individual review queued");
        Ok(record)
    }

    /// Have the judge review one pending task-review record and complete it.
    pub fn run_task_review(&self, review_task_id: &str) -> Result<TaskReviewCompletion, CarapaceError> {
        let record = self.store.mark_review_in_progress(review_task_id)?;
        let standards = self.standards();
        let mut prompt = format!("# {} review of task {}\n", record.review_kind.as_str(), record.impl_task_id);
        match self.store.get_governed_task(&record.impl_task_id)? {
            Some(task) => {
                let _ = writeln!(prompt, "Subject: {}\n\n{}", task.subject, task.description);
                if !task.context.is_empty() {
                    let _ = writeln!(prompt, "\n## Context\n{}", task.context);
                }
            }
            None => {
                let _ = writeln!(prompt, "{}", record.context);
            }
        }
        if !record.context.is_empty() && record.review_kind != TaskReviewKind::Governance {
            let _ = writeln!(prompt, "\n## Review focus\n{}", record.context);
        }
        format_standards(&mut prompt, &standards);

        let request = ReviewRequest {
            kind: ReviewKind::Task,
            subject: record.impl_task_id.clone(),
            prompt: finish_prompt(prompt),
            standards: names(&standards),
        };
        let bundle =
            reviewer::review_or_degrade(self.reviewer.as_ref(), &request, self.config.review.task());
        self.complete_task_review(
            review_task_id,
            bundle.verdict,
            &bundle.guidance,
            &bundle.findings,
            &bundle.standards_cited,
        )
    }
}

fn new_review_record(
    review_task_id: &str,
    impl_task_id: &str,
    kind: TaskReviewKind,
    context: &str,
    created_at: String,
) -> TaskReviewRecord {
    TaskReviewRecord {
        id: time::prefixed_id("TR"),
        review_task_id: review_task_id.to_string(),
        impl_task_id: impl_task_id.to_string(),
        review_kind: kind,
        status: TaskReviewStatus::Pending,
        verdict: None,
        guidance: String::new(),
        findings: Vec::new(),
        standards_cited: Vec::new(),
        context: context.to_string(),
        created_at,
        completed_at: None,
    }
}

fn validate_decision(input: &DecisionInput) -> Result<(), CarapaceError> {
    if input.task_id.trim().is_empty() || input.agent_id.trim().is_empty() {
        return Err(CarapaceError::ValidationError(
            "Decisions need a task id and an agent id".to_string(),
        ));
    }
    if input.summary.trim().is_empty() {
        return Err(CarapaceError::ValidationError(
            "Decision summary must not be empty".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&input.confidence) {
        return Err(CarapaceError::ValidationError(format!(
            "Confidence must be within 0.0..=1.0, got {}",
            input.confidence
        )));
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "governance",
        "version": "0.3.0",
        "description": "Decision reviews and governed tasks blocked until every review approves",
        "commands": [
            { "name": "decision submit", "parameters": ["task", "agent", "category", "summary", "detail", "confidence", "supersedes"] },
            { "name": "decision plan", "parameters": ["task", "agent", "plan"] },
            { "name": "decision complete", "parameters": ["task", "agent", "summary"] },
            { "name": "decision verdict", "parameters": ["decision", "by", "verdict", "guidance"] },
            { "name": "decision history", "parameters": ["task", "agent", "verdict", "limit"] },
            { "name": "task create", "parameters": ["subject", "description", "context", "kind"] },
            { "name": "task add-blocker", "parameters": ["task", "kind", "context"] },
            { "name": "task complete-review", "parameters": ["review", "verdict", "guidance", "findings", "standard"] },
            { "name": "task run-review", "parameters": ["review"] },
            { "name": "task status", "parameters": ["task"] },
            { "name": "task pending", "parameters": [] }
        ],
        "storage": ["governance.db", "tasks/"]
    })
}
