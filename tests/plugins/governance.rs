use carapace::core::config::GovernanceConfig;
use carapace::core::error::CarapaceError;
use carapace::core::store::Store;
use carapace::core::task_repo::{MemoryTaskRepository, TaskRecordRepository, TaskStatus};
use carapace::plugins::governance::{
    COMPLETION_GATE_REVIEWER, DecisionInput, ESCALATION_REVIEWER, GovernedTaskInput,
    mirror_entity_name,
};
use carapace::plugins::governance_store::{
    DecisionCategory, GovernedTaskStatus, HistoryFilter, TaskReviewKind, TaskReviewStatus,
};
use carapace::plugins::graph::Entity;
use carapace::plugins::holistic::ManualClock;
use carapace::plugins::reviewer::{
    DecisionReviewer, Finding, ReviewKind, ReviewRequest, Verdict, VerdictBundle,
};
use carapace::plugins::tier::CallerRole;
use carapace::subsystems::Subsystems;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

/// Answers with queued verdicts, then with `fallback`.
struct ScriptedReviewer {
    queue: Mutex<VecDeque<Verdict>>,
    fallback: Verdict,
    seen: Mutex<Vec<ReviewRequest>>,
}

impl ScriptedReviewer {
    fn new(script: &[Verdict], fallback: Verdict) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(script.iter().copied().collect()),
            fallback,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<ReviewRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl DecisionReviewer for ScriptedReviewer {
    fn name(&self) -> &str {
        "scripted"
    }

    fn review(&self, request: &ReviewRequest, _budget: Duration) -> Result<VerdictBundle, CarapaceError> {
        self.seen.lock().unwrap().push(request.clone());
        let verdict = self.queue.lock().unwrap().pop_front().unwrap_or(self.fallback);
        Ok(VerdictBundle {
            verdict,
            findings: Vec::new(),
            guidance: format!("scripted {}", verdict.as_str()),
            standards_cited: request.standards.clone(),
            reviewer: "scripted".to_string(),
        })
    }
}

struct Harness {
    _tmp: TempDir,
    sys: Subsystems,
    tasks: Arc<MemoryTaskRepository>,
    judge: Arc<ScriptedReviewer>,
}

fn harness(script: &[Verdict]) -> Harness {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    let tasks = Arc::new(MemoryTaskRepository::new());
    let judge = ScriptedReviewer::new(script, Verdict::Approved);
    let sys = Subsystems::assemble(
        store,
        GovernanceConfig::default(),
        tasks.clone(),
        judge.clone(),
        Arc::new(ManualClock::new(0)),
    )
    .expect("assemble");
    Harness {
        _tmp: tmp,
        sys,
        tasks,
        judge,
    }
}

fn decision(task: &str, agent: &str, category: DecisionCategory, summary: &str) -> DecisionInput {
    DecisionInput {
        task_id: task.to_string(),
        agent_id: agent.to_string(),
        category,
        summary: summary.to_string(),
        detail: String::new(),
        confidence: 0.8,
        supersedes: None,
    }
}

fn governed(subject: &str) -> GovernedTaskInput {
    GovernedTaskInput {
        subject: subject.to_string(),
        description: "Validate request payloads at the API edge".to_string(),
        context: "api-layer".to_string(),
        review_kind: TaskReviewKind::Governance,
    }
}

#[test]
fn deviation_bypasses_the_judge_and_is_mirrored() {
    let h = harness(&[]);
    let out = h
        .sys
        .engine
        .submit_decision(&decision("T1", "agent-a", DecisionCategory::Deviation, "Skip the migration guide"))
        .expect("submit");
    assert_eq!(out.review.verdict, Verdict::NeedsHumanReview);
    assert_eq!(out.review.reviewer, ESCALATION_REVIEWER);
    assert!(h.judge.seen().is_empty());

    let mirror = h
        .sys
        .graph
        .get_entity(&mirror_entity_name(&out.decision.id))
        .expect("mirrored record");
    assert_eq!(mirror.entity.entity_type, "governance_record");
    assert!(mirror.entity.observations.iter().any(|o| o.starts_with("verdict: needs_human_review")));
}

#[test]
fn judged_decision_sees_protected_standards() {
    let h = harness(&[Verdict::Approved]);
    h.sys
        .graph
        .create_entities(
            vec![
                Entity::new("error-handling", "standard", &["Propagate errors with context"]),
                Entity::new("billing-service", "component", &["Owns invoices"]),
            ],
            CallerRole::Human,
            false,
        )
        .expect("seed");

    let out = h
        .sys
        .engine
        .submit_decision(&decision("T1", "agent-a", DecisionCategory::Implementation, "Use thiserror"))
        .expect("submit");
    assert_eq!(out.review.verdict, Verdict::Approved);
    assert_eq!(out.decision.sequence, 1);

    let seen = h.judge.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, ReviewKind::Decision);
    assert_eq!(seen[0].standards, vec!["error-handling".to_string()]);
    assert!(seen[0].prompt.contains("Propagate errors with context"));
    assert!(!seen[0].prompt.contains("Owns invoices"));
}

#[test]
fn standards_cache_survives_a_decision_burst_and_refreshes_on_standard_writes() {
    let h = harness(&[]);
    h.sys
        .graph
        .create_entities(
            vec![Entity::new("error-handling", "standard", &["Propagate errors with context"])],
            CallerRole::Human,
            false,
        )
        .expect("seed");
    let engine = &h.sys.engine;

    let before = engine.standards();
    for i in 0..3 {
        let out = engine
            .submit_decision(&decision("T1", "agent-a", DecisionCategory::Implementation, &format!("step {}", i)))
            .expect("submit");
        assert!(h.sys.graph.get_entity(&mirror_entity_name(&out.decision.id)).is_some());
    }
    assert_eq!(h.judge.seen().len(), 3);
    let after_burst = engine.standards();
    assert!(Arc::ptr_eq(&before, &after_burst), "open-tier mirrors keep the cache warm");

    h.sys
        .graph
        .add_observations("error-handling", &["Never swallow io errors".to_string()], CallerRole::Human, false)
        .expect("edit standard");
    let refreshed = engine.standards();
    assert!(!Arc::ptr_eq(&before, &refreshed));
    assert_eq!(refreshed[0].observations.len(), 2);
}

#[test]
fn decisions_are_sequenced_per_task_and_validated() {
    let h = harness(&[]);
    let engine = &h.sys.engine;
    let first = engine
        .submit_decision(&decision("T1", "a", DecisionCategory::Architecture, "one"))
        .expect("first");
    let second = engine
        .submit_decision(&decision("T1", "a", DecisionCategory::Testing, "two"))
        .expect("second");
    let other = engine
        .submit_decision(&decision("T2", "a", DecisionCategory::Testing, "other"))
        .expect("other task");
    assert_eq!(first.decision.sequence, 1);
    assert_eq!(second.decision.sequence, 2);
    assert_eq!(other.decision.sequence, 1);

    let mut bad = decision("T1", "a", DecisionCategory::Testing, "x");
    bad.confidence = 1.5;
    assert!(matches!(engine.submit_decision(&bad), Err(CarapaceError::ValidationError(_))));

    let mut cross = decision("T2", "a", DecisionCategory::Testing, "x");
    cross.supersedes = Some(first.decision.id.clone());
    assert!(matches!(engine.submit_decision(&cross), Err(CarapaceError::ValidationError(_))));

    let mut ghost = decision("T1", "a", DecisionCategory::Testing, "x");
    ghost.supersedes = Some("DEC_missing".to_string());
    assert!(matches!(engine.submit_decision(&ghost), Err(CarapaceError::NotFound(_))));
}

#[test]
fn governed_task_is_blocked_from_birth_and_released_on_approval() {
    let h = harness(&[]);
    let engine = &h.sys.engine;
    let created = engine.create_governed_task(&governed("Add validation")).expect("create");

    let host = h
        .tasks
        .read(&created.implementation_task_id)
        .expect("read")
        .expect("host record");
    assert_eq!(host.blocked_by, vec![created.review_task_id.clone()]);
    assert!(!host.is_claimable());
    let review_host = h.tasks.read(&created.review_task_id).expect("read").expect("review record");
    assert_eq!(review_host.blocks, vec![created.implementation_task_id.clone()]);

    let status = engine
        .get_task_review_status(&created.implementation_task_id)
        .expect("status");
    assert!(!status.can_execute);
    assert_eq!(status.task.status, GovernedTaskStatus::PendingReview);
    assert_eq!(engine.get_pending_reviews().expect("pending").len(), 1);

    let done = engine
        .complete_task_review(&created.review_task_id, Verdict::Approved, "looks right", &[], &[])
        .expect("complete");
    assert!(done.governed);
    assert!(done.task_released);
    assert_eq!(done.remaining_blockers, 0);
    assert_eq!(done.task_status, Some(GovernedTaskStatus::Approved));

    let status = engine
        .get_task_review_status(&created.implementation_task_id)
        .expect("status");
    assert!(status.can_execute);
    assert!(status.host_blockers.is_empty());
    assert!(status.task.released_at.is_some());
    let review_host = h.tasks.read(&created.review_task_id).expect("read").expect("review record");
    assert_eq!(review_host.status, TaskStatus::Completed);
    assert!(engine.get_pending_reviews().expect("pending").is_empty());
}

#[test]
fn stacked_reviews_all_must_approve_and_one_block_holds_the_task() {
    let h = harness(&[]);
    let engine = &h.sys.engine;
    let created = engine.create_governed_task(&governed("Add validation")).expect("create");
    let impl_id = created.implementation_task_id.clone();

    let security = engine
        .add_review_blocker(&impl_id, TaskReviewKind::Security, "check injection")
        .expect("security");
    let architecture = engine
        .add_review_blocker(&impl_id, TaskReviewKind::Architecture, "layering")
        .expect("architecture");
    assert_eq!(architecture.blockers.len(), 3);
    assert_eq!(h.tasks.read(&impl_id).expect("read").expect("host").blocked_by.len(), 3);

    let first = engine
        .complete_task_review(&created.review_task_id, Verdict::Approved, "", &[], &[])
        .expect("governance approve");
    assert!(!first.task_released);
    assert_eq!(first.remaining_blockers, 2);

    let finding = Finding {
        tier: "security".to_string(),
        severity: "high".to_string(),
        description: "raw SQL built from input".to_string(),
        suggestion: "use bound parameters".to_string(),
    };
    let blocked = engine
        .complete_task_review(&security.review_task_id, Verdict::Blocked, "use bound parameters", &[finding], &[])
        .expect("security block");
    assert_eq!(blocked.task_status, Some(GovernedTaskStatus::Blocked));
    assert_eq!(blocked.remaining_blockers, 2);
    let host = h.tasks.read(&impl_id).expect("read").expect("host");
    assert!(host.description.contains("use bound parameters"));
    assert!(host.description.contains("[security review"));

    let arch = engine
        .complete_task_review(&architecture.review_task_id, Verdict::Approved, "", &[], &[])
        .expect("architecture approve");
    assert!(!arch.task_released);
    assert_eq!(arch.task_status, Some(GovernedTaskStatus::Blocked));

    let reviews = engine.get_task_review_status(&impl_id).expect("status").reviews;
    let security_record = reviews
        .iter()
        .find(|r| r.review_task_id == security.review_task_id)
        .expect("security record");
    assert_eq!(security_record.status, TaskReviewStatus::Blocked);
    assert_eq!(security_record.findings.len(), 1);

    let fixed = engine
        .complete_task_review(&security.review_task_id, Verdict::Approved, "fixed", &[], &[])
        .expect("security approve after fix");
    assert!(fixed.task_released);
    assert!(h.tasks.read(&impl_id).expect("read").expect("host").is_claimable());
}

#[test]
fn review_completion_errors() {
    let h = harness(&[]);
    let engine = &h.sys.engine;
    let created = engine.create_governed_task(&governed("Add validation")).expect("create");
    engine
        .complete_task_review(&created.review_task_id, Verdict::Approved, "", &[], &[])
        .expect("approve");

    assert!(matches!(
        engine.complete_task_review(&created.review_task_id, Verdict::Approved, "", &[], &[]),
        Err(CarapaceError::ValidationError(_))
    ));
    assert!(matches!(
        engine.complete_task_review("R_missing", Verdict::Approved, "", &[], &[]),
        Err(CarapaceError::BlockerNotFound(_))
    ));
    assert!(matches!(
        engine.add_review_blocker("T_not_governed", TaskReviewKind::Security, ""),
        Err(CarapaceError::UnknownTask(_))
    ));
    assert!(matches!(
        engine.create_governed_task(&governed("  ")),
        Err(CarapaceError::ValidationError(_))
    ));
}

#[test]
fn needs_human_review_keeps_task_blocked() {
    let h = harness(&[Verdict::NeedsHumanReview]);
    let engine = &h.sys.engine;
    let created = engine.create_governed_task(&governed("Rotate keys")).expect("create");

    let done = engine.run_task_review(&created.review_task_id).expect("run review");
    assert_eq!(done.verdict, Verdict::NeedsHumanReview);
    assert!(!done.task_released);
    assert_eq!(done.task_status, Some(GovernedTaskStatus::PendingReview));
    assert!(!h.tasks.read(&created.implementation_task_id).expect("read").expect("host").is_claimable());

    let seen = h.judge.seen();
    assert_eq!(seen[0].kind, ReviewKind::Task);
    assert!(seen[0].prompt.contains("Rotate keys"));
}

#[test]
fn run_task_review_releases_on_judge_approval() {
    let h = harness(&[Verdict::Approved]);
    let engine = &h.sys.engine;
    let created = engine.create_governed_task(&governed("Add validation")).expect("create");
    let done = engine.run_task_review(&created.review_task_id).expect("run review");
    assert!(done.task_released);

    assert!(matches!(
        engine.run_task_review(&created.review_task_id),
        Err(CarapaceError::ValidationError(_))
    ));
}

#[test]
fn standalone_review_completes_without_a_governed_task() {
    let h = harness(&[Verdict::Blocked]);
    let engine = &h.sys.engine;
    let queued = engine
        .enqueue_individual_review("T_plain", "Refactor logging", "switch to tracing")
        .expect("enqueue");
    assert_eq!(queued.status, TaskReviewStatus::Pending);

    let done = engine.run_task_review(&queued.review_task_id).expect("run");
    assert!(!done.governed);
    assert_eq!(done.verdict, Verdict::Blocked);
    assert_eq!(done.task_status, None);
    assert!(h.judge.seen()[0].prompt.contains("switch to tracing"));
}

#[test]
fn completion_short_circuits_on_blocked_decision_until_superseded() {
    let h = harness(&[Verdict::Blocked, Verdict::Approved, Verdict::Approved]);
    let engine = &h.sys.engine;
    let blocked = engine
        .submit_decision(&decision("T1", "agent-a", DecisionCategory::Dependency, "Vendor openssl"))
        .expect("decision");
    assert_eq!(blocked.review.verdict, Verdict::Blocked);

    let gate = engine
        .submit_completion_review("T1", "agent-a", "done")
        .expect("completion");
    assert_eq!(gate.verdict, Verdict::Blocked);
    assert_eq!(gate.reviewer, COMPLETION_GATE_REVIEWER);
    assert!(gate.guidance.contains(&blocked.decision.id));
    assert_eq!(h.judge.seen().len(), 1, "short circuit never calls the judge");

    let mut replacement = decision("T1", "agent-a", DecisionCategory::Dependency, "Use rustls");
    replacement.supersedes = Some(blocked.decision.id.clone());
    let approved = engine.submit_decision(&replacement).expect("supersede");
    assert_eq!(approved.review.verdict, Verdict::Approved);
    let relation_targets: Vec<String> = h
        .sys
        .graph
        .get_entity(&mirror_entity_name(&approved.decision.id))
        .expect("mirror")
        .relations
        .iter()
        .map(|r| r.to.clone())
        .collect();
    assert_eq!(relation_targets, vec![mirror_entity_name(&blocked.decision.id)]);

    let done = engine
        .submit_completion_review("T1", "agent-a", "done")
        .expect("completion");
    assert_eq!(done.verdict, Verdict::Approved);
    let seen = h.judge.seen();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].kind, ReviewKind::Completion);
    assert!(seen[2].prompt.contains("Vendor openssl"));
}

#[test]
fn escalated_decision_needs_a_human_verdict_before_completion() {
    let h = harness(&[]);
    let engine = &h.sys.engine;
    let escalated = engine
        .submit_decision(&decision("T1", "agent-a", DecisionCategory::ScopeChange, "Drop CSV export"))
        .expect("decision");

    let gate = engine.submit_completion_review("T1", "agent-a", "").expect("completion");
    assert_eq!(gate.verdict, Verdict::NeedsHumanReview);
    assert!(h.judge.seen().is_empty());

    assert!(matches!(
        engine.record_human_verdict(&escalated.decision.id, " ", Verdict::Approved, ""),
        Err(CarapaceError::ValidationError(_))
    ));
    let human = engine
        .record_human_verdict(&escalated.decision.id, "alice", Verdict::Approved, "agreed with PM")
        .expect("human verdict");
    assert_eq!(human.reviewer, "human:alice");

    let reviews = h.sys.governance.reviews_for_decision(&escalated.decision.id).expect("reviews");
    assert_eq!(reviews.len(), 2, "earlier verdict is kept");

    let mirror = h
        .sys
        .graph
        .get_entity(&mirror_entity_name(&escalated.decision.id))
        .expect("mirror");
    assert!(mirror.entity.observations.iter().any(|o| o.contains("human:alice")));

    let done = engine.submit_completion_review("T1", "agent-a", "").expect("completion");
    assert_eq!(done.verdict, Verdict::Approved);
    assert_eq!(h.judge.seen().len(), 1);
}

#[test]
fn plan_review_carries_task_history() {
    let h = harness(&[Verdict::Approved, Verdict::Blocked]);
    let engine = &h.sys.engine;
    engine
        .submit_decision(&decision("T1", "agent-a", DecisionCategory::DataModel, "Add tenant_id column"))
        .expect("decision");
    let plan = engine
        .submit_plan_for_review("T1", "agent-a", "1. migrate\n2. backfill")
        .expect("plan");
    assert_eq!(plan.verdict, Verdict::Blocked);
    assert_eq!(plan.context_kind, ReviewKind::Plan);
    assert_eq!(plan.context_ref, "T1");

    let seen = h.judge.seen();
    assert!(seen[1].prompt.contains("Add tenant_id column"));
    assert!(seen[1].prompt.contains("backfill"));
    assert!(matches!(
        engine.submit_plan_for_review("T1", "agent-a", "   "),
        Err(CarapaceError::ValidationError(_))
    ));
    assert_eq!(h.sys.governance.reviews_for_task("T1").expect("reviews").len(), 2);
}

#[test]
fn history_filters_by_task_agent_verdict_and_limit() {
    let h = harness(&[Verdict::Approved, Verdict::Blocked, Verdict::Approved]);
    let engine = &h.sys.engine;
    engine
        .submit_decision(&decision("T1", "agent-a", DecisionCategory::Testing, "a1"))
        .expect("a1");
    engine
        .submit_decision(&decision("T1", "agent-b", DecisionCategory::Testing, "b1"))
        .expect("b1");
    engine
        .submit_decision(&decision("T2", "agent-a", DecisionCategory::Testing, "a2"))
        .expect("a2");

    let all = engine.get_decision_history(&HistoryFilter::default()).expect("all");
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].decision.summary, "a2", "newest first");

    let by_agent = engine
        .get_decision_history(&HistoryFilter {
            agent_id: Some("agent-a".to_string()),
            ..HistoryFilter::default()
        })
        .expect("by agent");
    assert_eq!(by_agent.len(), 2);

    let blocked = engine
        .get_decision_history(&HistoryFilter {
            verdict: Some(Verdict::Blocked),
            ..HistoryFilter::default()
        })
        .expect("blocked");
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].decision.summary, "b1");

    let limited = engine
        .get_decision_history(&HistoryFilter {
            task_id: Some("T1".to_string()),
            limit: Some(1),
            ..HistoryFilter::default()
        })
        .expect("limited");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].decision.summary, "b1");
}

#[test]
fn status_aggregates_counts() {
    let h = harness(&[Verdict::Blocked]);
    let engine = &h.sys.engine;
    engine
        .submit_decision(&decision("T1", "a", DecisionCategory::Security, "Disable TLS in dev"))
        .expect("decision");
    engine.create_governed_task(&governed("Add validation")).expect("governed");

    let status = engine.get_status().expect("status");
    assert_eq!(status.governance.decisions, 1);
    assert_eq!(status.governance.blocked, 1);
    assert_eq!(status.governance.governed_tasks_pending, 1);
    assert_eq!(status.governance.pending_task_reviews, 1);
    assert_eq!(status.graph_entities, 1);
    assert_eq!(status.reviewer, "scripted");
}
