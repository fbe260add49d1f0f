use carapace::core::error::CarapaceError;
use carapace::plugins::graph::{Entity, Relation, TieredGraphStore, WriteOutcome};
use carapace::plugins::tier::{CallerRole, GraphOperation, ProtectionTier};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

fn test_graph(threshold: usize) -> (TempDir, TieredGraphStore) {
    let tmp = tempdir().expect("tempdir");
    let graph = TieredGraphStore::open(&tmp.path().join("graph.jsonl"), threshold).expect("open graph");
    (tmp, graph)
}

fn reopen(path: &Path) -> TieredGraphStore {
    TieredGraphStore::open(path, 1_000).expect("reopen graph")
}

fn obs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn seed(graph: &TieredGraphStore) {
    let out = graph
        .create_entities(
            vec![
                Entity::new("no-secrets-in-logs", "principle", &["Never log credentials"]),
                Entity::new("error-handling", "standard", &["Propagate errors with context"]),
                Entity::new("billing-service", "component", &["Owns invoices"]),
            ],
            CallerRole::Human,
            false,
        )
        .expect("seed");
    assert_eq!(out.created.len(), 3);
}

#[test]
fn agent_writes_follow_the_tier_table() {
    let (_tmp, graph) = test_graph(1_000);
    seed(&graph);

    let denied = graph
        .add_observations("no-secrets-in-logs", &obs(&["agents may log tokens"]), CallerRole::Agent, true)
        .expect("write call");
    match &denied {
        WriteOutcome::Denied { decision, .. } => {
            assert_eq!(decision.tier, ProtectionTier::HumanOnly);
            assert!(decision.reason.contains("human-only"));
        }
        other => panic!("expected denial, got {:?}", other),
    }

    let gated = graph
        .add_observations("error-handling", &obs(&["Wrap io errors"]), CallerRole::Agent, false)
        .expect("write call");
    assert!(gated.is_denied());

    let approved = graph
        .add_observations("error-handling", &obs(&["Wrap io errors"]), CallerRole::Agent, true)
        .expect("write call");
    assert!(!approved.is_denied());

    let open = graph
        .add_observations("billing-service", &obs(&["Talks to the ledger"]), CallerRole::Agent, false)
        .expect("write call");
    assert!(!open.is_denied());

    let human = graph
        .add_observations("no-secrets-in-logs", &obs(&["Applies to traces too"]), CallerRole::Human, false)
        .expect("write call");
    assert!(!human.is_denied());

    let view = graph.get_entity("no-secrets-in-logs").expect("entity");
    assert!(view.entity.observations.contains(&"Applies to traces too".to_string()));
    assert!(!view.entity.observations.contains(&"agents may log tokens".to_string()));
}

#[test]
fn agent_cannot_retier_an_open_entity_upward() {
    let (_tmp, graph) = test_graph(1_000);
    seed(&graph);

    let out = graph
        .add_observations("billing-service", &obs(&["tier:human-only"]), CallerRole::Agent, true)
        .expect("write call");
    assert!(out.is_denied());
    assert_eq!(
        graph.get_entity("billing-service").expect("entity").tier,
        ProtectionTier::Open
    );
}

#[test]
fn marker_overrides_kind_on_creation() {
    let (_tmp, graph) = test_graph(1_000);
    let out = graph
        .create_entities(
            vec![Entity::new("scratch-principle", "principle", &["tier:open", "draft"])],
            CallerRole::Agent,
            false,
        )
        .expect("create");
    assert_eq!(out.created.len(), 1);
    assert!(out.denied.is_empty());
    assert_eq!(graph.get_by_tier(ProtectionTier::Open).len(), 1);
}

#[test]
fn agent_creation_of_protected_entity_is_reported_not_raised() {
    let (_tmp, graph) = test_graph(1_000);
    let out = graph
        .create_entities(
            vec![
                Entity::new("p", "principle", &[]),
                Entity::new("c", "component", &[]),
            ],
            CallerRole::Agent,
            false,
        )
        .expect("create");
    assert_eq!(out.created.len(), 1);
    assert_eq!(out.denied.len(), 1);
    assert_eq!(out.denied[0].name, "p");
    assert!(graph.get_entity("p").is_none());
}

#[test]
fn invalid_entity_type_is_a_validation_error() {
    let (_tmp, graph) = test_graph(1_000);
    let err = graph
        .create_entities(vec![Entity::new("x", "spaceship", &[])], CallerRole::Human, false)
        .expect_err("invalid type");
    assert!(matches!(err, CarapaceError::ValidationError(_)));
}

#[test]
fn unknown_entity_writes_fail() {
    let (_tmp, graph) = test_graph(1_000);
    let err = graph
        .add_observations("ghost", &obs(&["boo"]), CallerRole::Human, false)
        .expect_err("unknown");
    assert!(matches!(err, CarapaceError::UnknownEntity(_)));
    assert!(matches!(
        graph.validate_access("ghost", GraphOperation::Read, CallerRole::Agent),
        Err(CarapaceError::UnknownEntity(_))
    ));
}

#[test]
fn delete_entity_cascades_relations_and_survives_restart() {
    let (tmp, graph) = test_graph(1_000);
    seed(&graph);
    let rels = graph
        .create_relations(vec![
            Relation::new("billing-service", "error-handling", "follows"),
            Relation::new("billing-service", "no-secrets-in-logs", "follows"),
            Relation::new("error-handling", "no-secrets-in-logs", "refines"),
        ])
        .expect("relations");
    assert_eq!(rels.created.len(), 3);

    let out = graph
        .delete_entity("billing-service", CallerRole::Agent, false)
        .expect("delete");
    assert_eq!(
        out,
        WriteOutcome::Deleted {
            entity: "billing-service".to_string(),
            relations_removed: 2
        }
    );
    assert_eq!(graph.relation_count(), 1);

    let reloaded = reopen(&tmp.path().join("graph.jsonl"));
    assert!(reloaded.get_entity("billing-service").is_none());
    assert_eq!(reloaded.relation_count(), 1);
    assert_eq!(reloaded.entity_count(), 2);
}

#[test]
fn relations_require_both_endpoints_and_dedupe() {
    let (_tmp, graph) = test_graph(1_000);
    seed(&graph);
    let out = graph
        .create_relations(vec![
            Relation::new("billing-service", "error-handling", "follows"),
            Relation::new("billing-service", "error-handling", "follows"),
            Relation::new("billing-service", "nowhere", "follows"),
            Relation::new("billing-service", "error-handling", " "),
        ])
        .expect("relations");
    assert_eq!(out.created.len(), 1);
    assert_eq!(out.duplicates.len(), 1);
    assert_eq!(out.rejected.len(), 2);
    assert!(out.rejected[0].reason.contains("nowhere"));

    let removed = graph
        .delete_relations(&[Relation::new("billing-service", "error-handling", "follows")])
        .expect("delete relations");
    assert_eq!(removed, 1);
    assert_eq!(graph.relation_count(), 0);
}

#[test]
fn compaction_preserves_state_and_shrinks_log() {
    let (tmp, graph) = test_graph(1_000_000);
    let path = tmp.path().join("graph.jsonl");
    graph
        .create_entities(vec![Entity::new("lessons", "lesson", &[])], CallerRole::Agent, false)
        .expect("create");
    for i in 0..20 {
        graph
            .add_observations("lessons", &obs(&[&format!("lesson {}", i)]), CallerRole::Agent, false)
            .expect("observe");
    }
    let lines_before = fs::read_to_string(&path).expect("read log").lines().count();
    assert_eq!(lines_before, 21);

    let report = graph.compact().expect("compact");
    assert_eq!(report.entities, 1);
    assert_eq!(report.records_before, 21);

    let lines_after = fs::read_to_string(&path).expect("read log").lines().count();
    assert_eq!(lines_after, 1);

    let reloaded = reopen(&path);
    let view = reloaded.get_entity("lessons").expect("entity");
    assert_eq!(view.entity.observations.len(), 20);
    assert_eq!(view.entity.observations[19], "lesson 19");
}

#[test]
fn threshold_triggers_automatic_compaction() {
    let (tmp, graph) = test_graph(5);
    let path = tmp.path().join("graph.jsonl");
    graph
        .create_entities(vec![Entity::new("c", "component", &[])], CallerRole::Agent, false)
        .expect("create");
    for i in 0..4 {
        graph
            .add_observations("c", &obs(&[&format!("o{}", i)]), CallerRole::Agent, false)
            .expect("observe");
    }
    let lines = fs::read_to_string(&path).expect("read log").lines().count();
    assert_eq!(lines, 1, "fifth append compacts the log down to current state");
}

#[test]
fn corrupt_middle_line_is_fatal() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("graph.jsonl");
    fs::write(
        &path,
        concat!(
            r#"{"type":"entity","name":"a","entityType":"component","observations":[]}"#,
            "\n",
            "{not json\n",
            r#"{"type":"entity","name":"b","entityType":"component","observations":[]}"#,
            "\n"
        ),
    )
    .expect("write log");

    match TieredGraphStore::open(&path, 1_000) {
        Err(CarapaceError::CorruptLog { line, .. }) => assert_eq!(line, 2),
        Err(other) => panic!("expected CorruptLog, got {}", other),
        Ok(_) => panic!("expected CorruptLog, got a graph"),
    }
}

#[test]
fn torn_final_line_is_dropped() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("graph.jsonl");
    fs::write(
        &path,
        concat!(
            r#"{"type":"entity","name":"a","entityType":"component","observations":["x"]}"#,
            "\n",
            r#"{"type":"entity","name":"b","entityTy"#
        ),
    )
    .expect("write log");

    let graph = TieredGraphStore::open(&path, 1_000).expect("open despite torn tail");
    assert_eq!(graph.entity_count(), 1);
    assert!(graph.get_entity("a").is_some());
}

#[test]
fn replay_is_last_write_wins() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("graph.jsonl");
    fs::write(
        &path,
        concat!(
            r#"{"type":"entity","name":"a","entityType":"component","observations":["old"]}"#,
            "\n",
            r#"{"type":"entity","name":"a","entityType":"component","observations":["new"]}"#,
            "\n"
        ),
    )
    .expect("write log");
    let graph = reopen(&path);
    assert_eq!(graph.get_entity("a").expect("a").entity.observations, obs(&["new"]));
}

#[test]
fn search_is_case_insensitive_over_names_and_observations() {
    let (_tmp, graph) = test_graph(1_000);
    seed(&graph);
    graph
        .create_relations(vec![Relation::new("billing-service", "error-handling", "follows")])
        .expect("relation");

    let by_obs = graph.search("CREDENTIALS");
    assert_eq!(by_obs.entities.len(), 1);
    assert_eq!(by_obs.entities[0].name, "no-secrets-in-logs");

    let by_name = graph.search("ERROR");
    assert_eq!(by_name.entities.len(), 1);
    assert!(by_name.relations.is_empty(), "relation leaves the result set");

    let both = graph.search("e");
    assert_eq!(both.relations.len(), 1);
}

#[test]
fn validate_access_reports_without_approval() {
    let (_tmp, graph) = test_graph(1_000);
    seed(&graph);
    let read = graph
        .validate_access("no-secrets-in-logs", GraphOperation::Read, CallerRole::Agent)
        .expect("access");
    assert!(read.allowed);
    let write = graph
        .validate_access("error-handling", GraphOperation::AddObservations, CallerRole::Agent)
        .expect("access");
    assert!(!write.allowed);
    assert_eq!(write.tier, ProtectionTier::ApprovalGated);
}

#[test]
fn readers_see_published_writes_while_writers_race() {
    let (_tmp, graph) = test_graph(50);
    let graph = Arc::new(graph);
    graph
        .create_entities(vec![Entity::new("shared", "pattern", &[])], CallerRole::Agent, false)
        .expect("create");

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let graph = Arc::clone(&graph);
            std::thread::spawn(move || {
                for i in 0..25 {
                    graph
                        .add_observations(
                            "shared",
                            &[format!("w{}-{}", w, i)],
                            CallerRole::Agent,
                            false,
                        )
                        .expect("observe");
                    assert!(graph.get_entity("shared").is_some());
                }
            })
        })
        .collect();
    for h in writers {
        h.join().expect("writer");
    }

    assert_eq!(graph.get_entity("shared").expect("shared").entity.observations.len(), 100);
    let reloaded = reopen(graph.path());
    assert_eq!(reloaded.get_entity("shared").expect("shared").entity.observations.len(), 100);
}

#[test]
fn handles_sharing_a_log_keep_each_others_writes() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("graph.jsonl");
    let a = TieredGraphStore::open(&path, 1_000).expect("open a");
    let b = TieredGraphStore::open(&path, 1_000).expect("open b");

    a.create_entities(vec![Entity::new("from-a", "component", &[])], CallerRole::Agent, false)
        .expect("a creates");
    b.create_entities(vec![Entity::new("from-b", "component", &[])], CallerRole::Agent, false)
        .expect("b creates");
    let deleted = b.delete_entity("from-b", CallerRole::Agent, false).expect("b deletes");
    assert!(!deleted.is_denied());
    assert!(b.get_entity("from-a").is_some(), "b reloads a's append before rewriting");

    a.add_observations("from-a", &obs(&["after b compacted"]), CallerRole::Agent, false)
        .expect("a appends after b's rewrite");

    let reloaded = reopen(&path);
    let from_a = reloaded.get_entity("from-a").expect("from-a survives b's delete");
    assert_eq!(from_a.entity.observations, obs(&["after b compacted"]));
    assert!(reloaded.get_entity("from-b").is_none());
}

#[test]
fn compaction_includes_appends_from_another_handle() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("graph.jsonl");
    let a = TieredGraphStore::open(&path, 1_000).expect("open a");
    let b = TieredGraphStore::open(&path, 1_000).expect("open b");

    a.create_entities(vec![Entity::new("x", "pattern", &[])], CallerRole::Agent, false)
        .expect("a creates");
    let report = b.compact().expect("b compacts");
    assert_eq!(report.entities, 1);
    assert!(reopen(&path).get_entity("x").is_some());
}

#[test]
fn torn_tail_is_rewritten_by_the_next_write() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("graph.jsonl");
    fs::write(
        &path,
        concat!(
            r#"{"type":"entity","name":"a","entityType":"component","observations":[]}"#,
            "\n",
            r#"{"type":"entity","name":"b","entityTy"#
        ),
    )
    .expect("write log");

    let graph = TieredGraphStore::open(&path, 1_000).expect("open despite torn tail");
    graph
        .create_entities(vec![Entity::new("c", "component", &[])], CallerRole::Agent, false)
        .expect("create after torn tail");

    let reloaded = reopen(&path);
    assert!(reloaded.get_entity("a").is_some());
    assert!(reloaded.get_entity("c").is_some());
    assert_eq!(fs::read_to_string(&path).expect("read log").lines().count(), 2);
}

#[test]
fn protected_generation_ignores_open_tier_writes() {
    let (_tmp, graph) = test_graph(1_000);
    seed(&graph);
    let protected = graph.protected_generation();

    graph
        .create_entities(vec![Entity::new("decision:1", "governance_record", &[])], CallerRole::Agent, false)
        .expect("open create");
    graph
        .add_observations("billing-service", &obs(&["Sends receipts"]), CallerRole::Agent, false)
        .expect("open observe");
    graph
        .delete_entity("decision:1", CallerRole::Agent, false)
        .expect("open delete");
    assert_eq!(graph.protected_generation(), protected);

    graph
        .add_observations("error-handling", &obs(&["Wrap io errors"]), CallerRole::Human, false)
        .expect("standard observe");
    assert_eq!(graph.protected_generation(), protected + 1);

    graph
        .delete_entity("error-handling", CallerRole::Human, false)
        .expect("standard delete");
    assert_eq!(graph.protected_generation(), protected + 2);
}

#[test]
fn denied_write_maps_to_tier_violation() {
    let (_tmp, graph) = test_graph(1_000);
    seed(&graph);
    let denied = graph
        .add_observations("no-secrets-in-logs", &obs(&["Logs are fine"]), CallerRole::Agent, true)
        .expect("denial is a value");
    match denied.into_result() {
        Err(CarapaceError::TierViolation { entity, reason }) => {
            assert_eq!(entity, "no-secrets-in-logs");
            assert!(reason.contains("human-only"));
        }
        other => panic!("expected TierViolation, got {:?}", other),
    }

    let applied = graph
        .add_observations("billing-service", &obs(&["Emits events"]), CallerRole::Agent, false)
        .expect("open write");
    assert!(applied.into_result().is_ok());
}
