use carapace::core::db;
use carapace::core::error::CarapaceError;
use carapace::core::store::Store;
use carapace::plugins::governance_store::{FindingStatus, GovernanceStore};
use carapace::plugins::trust::{Classification, FindingReport, TrustEngine, fingerprint};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

fn test_engine() -> (TempDir, Store, TrustEngine) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    let governance = Arc::new(GovernanceStore::open(&store).expect("governance"));
    (tmp, store, TrustEngine::new(governance))
}

fn unused_import() -> FindingReport {
    FindingReport {
        tool: "clippy".to_string(),
        rule: "unused_imports".to_string(),
        path: "src/lib.rs".to_string(),
        message: "unused import: `std::fs`".to_string(),
        severity: "low".to_string(),
    }
}

#[test]
fn new_finding_blocks_and_recurrence_counts() {
    let (_tmp, _store, trust) = test_engine();
    let first = trust.record_finding(&unused_import()).expect("record");
    assert_eq!(first.classification, Classification::Block);
    assert_eq!(first.finding.occurrences, 1);
    assert_eq!(first.finding.status, FindingStatus::Open);
    assert_eq!(
        first.finding.fingerprint,
        fingerprint("clippy", "unused_imports", "src/lib.rs", "unused import: `std::fs`")
    );

    let again = trust.record_finding(&unused_import()).expect("record again");
    assert_eq!(again.finding.id, first.finding.id);
    assert_eq!(again.finding.occurrences, 2);
    assert_eq!(again.classification, Classification::Block);

    let mut elsewhere = unused_import();
    elsewhere.path = "src/main.rs".to_string();
    let other = trust.record_finding(&elsewhere).expect("other path");
    assert_ne!(other.finding.id, first.finding.id);
}

#[test]
fn dismissal_requires_justification_and_identity() {
    let (_tmp, _store, trust) = test_engine();
    let finding = trust.record_finding(&unused_import()).expect("record").finding;

    assert!(matches!(
        trust.record_dismissal(&finding.id, "   ", "alice"),
        Err(CarapaceError::MalformedDismissal(_))
    ));
    assert!(matches!(
        trust.record_dismissal(&finding.id, "kept for the feature flag", ""),
        Err(CarapaceError::MalformedDismissal(_))
    ));
    assert!(matches!(
        trust.record_dismissal("FND_missing", "reason", "alice"),
        Err(CarapaceError::NotFound(_))
    ));
    assert_eq!(trust.classify(&finding.id).expect("classify").classification, Classification::Block);
}

#[test]
fn dismissed_finding_is_tracked_on_recurrence() {
    let (_tmp, _store, trust) = test_engine();
    let finding = trust.record_finding(&unused_import()).expect("record").finding;

    let dismissal = trust
        .record_dismissal(&finding.id, "import is used behind cfg(test)", "alice")
        .expect("dismiss");
    assert_eq!(dismissal.fingerprint, finding.fingerprint);

    let recurrence = trust.record_finding(&unused_import()).expect("recur");
    assert_eq!(recurrence.classification, Classification::Track);
    assert_eq!(recurrence.dismissals, 1);
    assert_eq!(recurrence.finding.status, FindingStatus::Dismissed);

    assert_eq!(trust.list_findings(Some(FindingStatus::Dismissed)).expect("list").len(), 1);
    assert!(trust.list_findings(Some(FindingStatus::Open)).expect("list").is_empty());
}

#[test]
fn reopen_changes_status_but_not_history() {
    let (_tmp, _store, trust) = test_engine();
    let finding = trust.record_finding(&unused_import()).expect("record").finding;
    trust
        .record_dismissal(&finding.id, "false positive", "alice")
        .expect("dismiss");

    let reopened = trust.reopen_finding(&finding.id).expect("reopen");
    assert_eq!(reopened.status, FindingStatus::Open);

    trust
        .record_dismissal(&finding.id, "still a false positive", "bob")
        .expect("dismiss again");
    let history = trust.dismissal_history(&finding.id).expect("history");
    let who: Vec<&str> = history.iter().map(|d| d.dismissed_by.as_str()).collect();
    assert_eq!(who, vec!["alice", "bob"]);
    assert_eq!(trust.classify(&finding.id).expect("classify").dismissals, 2);

    assert!(matches!(trust.reopen_finding("FND_missing"), Err(CarapaceError::NotFound(_))));
}

#[test]
fn dismissal_history_rejects_rewrites() {
    let (_tmp, store, trust) = test_engine();
    let finding = trust.record_finding(&unused_import()).expect("record").finding;
    trust
        .record_dismissal(&finding.id, "false positive", "alice")
        .expect("dismiss");

    let conn = db::db_connect(&store.governance_db_path().to_string_lossy()).expect("connect");
    let update = conn.execute("UPDATE dismissals SET justification = 'edited'", []);
    assert!(update.is_err());
    let delete = conn.execute("DELETE FROM dismissals", []);
    assert!(delete.is_err());

    assert_eq!(trust.dismissal_history(&finding.id).expect("history")[0].justification, "false positive");
}

#[test]
fn findings_need_tool_and_rule() {
    let (_tmp, _store, trust) = test_engine();
    let mut report = unused_import();
    report.tool = " ".to_string();
    assert!(matches!(trust.record_finding(&report), Err(CarapaceError::ValidationError(_))));
}

#[test]
fn report_severity_defaults_to_medium() {
    let report: FindingReport = serde_json::from_str(
        r#"{"tool":"eslint","rule":"no-eval","path":"a.js","message":"eval is evil"}"#,
    )
    .expect("parse report");
    assert_eq!(report.severity, "medium");
}
