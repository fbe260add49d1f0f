use carapace::core::broker::{self, DbBroker};
use carapace::core::config::{self, LockConfig, ReviewerMode};
use carapace::core::db;
use carapace::core::error::CarapaceError;
use carapace::core::lease;
use carapace::core::store::Store;
use carapace::core::task_repo::{
    FileTaskRepository, MemoryTaskRepository, TaskDraft, TaskRecordRepository, TaskStatus,
};
use rusqlite::params;
use std::fs;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::tempdir;

fn fast_locks() -> LockConfig {
    LockConfig {
        max_attempts: 3,
        base_delay_ms: 5,
        max_delay_ms: 20,
        stale_after_secs: 30,
    }
}

#[test]
fn governance_db_initializes_with_foreign_keys_and_audit() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");

    db::initialize_governance_db(&store.root).expect("governance init");
    let db_path = store.governance_db_path();
    assert!(db_path.exists());

    let conn = db::db_connect(&db_path.to_string_lossy()).expect("db connect");
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);

    let broker = DbBroker::new(&store.root);
    broker
        .with_tx(&db_path, "tester", "scratch.insert", |tx| {
            tx.execute("CREATE TABLE IF NOT EXISTS scratch (id TEXT PRIMARY KEY)", [])?;
            tx.execute("INSERT INTO scratch (id) VALUES (?1)", params!["s1"])?;
            Ok(())
        })
        .expect("broker success path");

    let result: Result<(), CarapaceError> =
        broker.with_tx(&db_path, "tester", "scratch.fail", |tx| {
            tx.execute("INSERT INTO scratch (id) VALUES (?1)", params!["s2"])?;
            Err(CarapaceError::ValidationError("intentional".to_string()))
        });
    assert!(result.is_err());

    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))
        .expect("count scratch");
    assert_eq!(rows, 1, "failed transaction must roll back");

    let events = broker::read_audit_log(&store.root).expect("read audit");
    assert!(events.iter().any(|ev| ev.op == "scratch.insert" && ev.status == "success"));
    assert!(events.iter().any(|ev| ev.op == "scratch.fail" && ev.status == "error"));
    assert!(events.iter().all(|ev| !ev.event_id.is_empty() && ev.db_id == "governance.db"));
}

#[test]
fn audit_failure_does_not_fail_a_committed_change() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    fs::create_dir_all(store.root.join("broker.events.jsonl")).expect("unwritable audit log");

    db::initialize_governance_db(&store.root).expect("init despite audit failure");
    let db_path = store.governance_db_path();
    let broker = DbBroker::new(&store.root);
    broker
        .with_tx(&db_path, "tester", "scratch.insert", |tx| {
            tx.execute("CREATE TABLE IF NOT EXISTS scratch (id TEXT PRIMARY KEY)", [])?;
            tx.execute("INSERT INTO scratch (id) VALUES (?1)", params!["s1"])?;
            Ok(())
        })
        .expect("committed change reports success");

    let rows: i64 = broker
        .with_read(&db_path, "scratch.count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))?)
        })
        .expect("count scratch");
    assert_eq!(rows, 1);
}

#[test]
fn reads_are_not_audited_and_cannot_write() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    db::initialize_governance_db(&store.root).expect("init");
    let db_path = store.governance_db_path();
    let broker = DbBroker::new(&store.root);
    let before = broker::read_audit_log(&store.root).expect("audit").len();

    for _ in 0..10 {
        let version: String = broker
            .with_read(&db_path, "meta.read", |conn| {
                Ok(conn.query_row(
                    "SELECT value FROM meta WHERE key = 'schema_version'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .expect("read meta");
        assert!(!version.is_empty());
    }
    assert_eq!(broker::read_audit_log(&store.root).expect("audit").len(), before);

    let write = broker.with_read(&db_path, "meta.write", |conn| {
        conn.execute("DELETE FROM meta", [])?;
        Ok(())
    });
    assert!(write.is_err());
}

#[test]
fn config_missing_file_means_defaults() {
    let tmp = tempdir().expect("tempdir");
    let cfg = config::load_config(tmp.path()).expect("load defaults");
    assert_eq!(cfg.holistic.min_batch, 2);
    assert_eq!(cfg.review.decision(), Duration::from_secs(60));
    assert_eq!(cfg.graph.compaction_threshold, 1_000);
}

#[test]
fn config_file_overrides_sections() {
    let tmp = tempdir().expect("tempdir");
    let path = config::config_path(tmp.path());
    fs::create_dir_all(path.parent().expect("config dir")).expect("mkdir");
    fs::write(
        &path,
        "[holistic]\ndebounce_ms = 50\nmin_batch = 3\n\n[reviewer]\nmode = \"bypass\"\nbypass_verdict = \"blocked\"\n",
    )
    .expect("write config");

    let cfg = config::load_config(tmp.path()).expect("load config");
    assert_eq!(cfg.holistic.min_batch, 3);
    assert_eq!(cfg.reviewer.mode, ReviewerMode::Bypass);
    assert_eq!(cfg.reviewer.bypass_verdict, "blocked");
    assert_eq!(cfg.review.plan_secs, 120);
}

#[test]
fn malformed_config_is_rejected() {
    let err = config::parse_config("[holistic\nmin_batch = ").expect_err("must fail");
    assert!(matches!(err, CarapaceError::ConfigError(_)));
}

#[test]
fn lease_is_exclusive_until_dropped() {
    let tmp = tempdir().expect("tempdir");
    let locks = tmp.path().join("locks");

    let held = lease::acquire_lease(&locks, "T-1", &fast_locks()).expect("first lease");
    assert!(held.path().exists());
    let record = fs::read_to_string(held.path()).expect("holder record");
    assert!(record.contains(held.nonce()));

    let err = lease::acquire_lease(&locks, "T-1", &fast_locks()).expect_err("contended");
    assert!(matches!(err, CarapaceError::LockContention(_)));

    let other = lease::acquire_lease(&locks, "T-2", &fast_locks());
    assert!(other.is_ok(), "leases are per key");

    let path = held.path().to_path_buf();
    drop(held);
    assert!(path.exists(), "lock files stay in place");
    lease::acquire_lease(&locks, "T-1", &fast_locks()).expect("reacquire after drop");
}

#[test]
fn leftover_lock_file_from_a_dead_holder_yields_exactly_one_new_holder() {
    let tmp = tempdir().expect("tempdir");
    let locks = tmp.path().join("locks");
    fs::create_dir_all(&locks).expect("mkdir");
    fs::write(lease::lease_path(&locks, "T-9"), "pid=0").expect("orphan lock");

    let first = lease::acquire_lease(&locks, "T-9", &fast_locks()).expect("orphan does not block");
    let record = fs::read_to_string(first.path()).expect("holder record");
    assert!(record.starts_with(&format!("pid={} ", std::process::id())));
    assert!(record.contains(first.nonce()));

    let second = lease::acquire_lease(&locks, "T-9", &fast_locks());
    assert!(matches!(second, Err(CarapaceError::LockContention(_))));
}

#[test]
fn dropping_a_lease_leaves_a_newer_holder_alone() {
    let tmp = tempdir().expect("tempdir");
    let locks = tmp.path().join("locks");
    let old = lease::acquire_lease(&locks, "T-3", &fast_locks()).expect("old lease");

    fs::remove_file(old.path()).expect("lock file replaced behind the holder");
    let newer = lease::acquire_lease(&locks, "T-3", &fast_locks()).expect("newer lease");
    drop(old);

    let record = fs::read_to_string(newer.path()).expect("newer record survives");
    assert!(record.contains(newer.nonce()));
    let third = lease::acquire_lease(&locks, "T-3", &fast_locks());
    assert!(matches!(third, Err(CarapaceError::LockContention(_))));
}

#[test]
fn lease_held_past_the_stale_window_is_reported() {
    let tmp = tempdir().expect("tempdir");
    let locks = tmp.path().join("locks");
    let _held = lease::acquire_lease(&locks, "T-4", &fast_locks()).expect("held");

    let cfg = LockConfig {
        stale_after_secs: 0,
        ..fast_locks()
    };
    let err = lease::acquire_lease(&locks, "T-4", &cfg).expect_err("still held");
    match err {
        CarapaceError::StaleLock(detail) => assert!(detail.contains("pid=")),
        other => panic!("expected StaleLock, got {}", other),
    }
}

#[test]
fn file_repository_persists_and_mutates_blockers() {
    let tmp = tempdir().expect("tempdir");
    let repo = FileTaskRepository::open(tmp.path(), fast_locks()).expect("repo");

    let task = repo
        .create(TaskDraft {
            subject: "Add validation".to_string(),
            blocked_by: vec!["R-1".to_string()],
            ..TaskDraft::default()
        })
        .expect("create");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(!task.is_claimable());

    repo.add_blocker(&task.id, "R-2").expect("add blocker");
    repo.add_blocker(&task.id, "R-2").expect("add blocker twice");
    let read = repo.read(&task.id).expect("read").expect("exists");
    assert_eq!(read.blocked_by, vec!["R-1".to_string(), "R-2".to_string()]);

    repo.remove_blocker(&task.id, "R-1").expect("remove");
    repo.remove_blocker(&task.id, "R-2").expect("remove");
    let reopened = FileTaskRepository::open(tmp.path(), fast_locks()).expect("reopen");
    assert!(reopened.read(&task.id).expect("read").expect("exists").is_claimable());

    let err = repo.add_blocker("T-missing", "R-1").expect_err("unknown task");
    assert!(matches!(err, CarapaceError::UnknownTask(_)));
    assert!(repo.read("../escape").is_err());
}

#[test]
fn file_repository_concurrent_blocker_removal_loses_nothing() {
    let tmp = tempdir().expect("tempdir");
    let cfg = LockConfig {
        max_attempts: 40,
        ..fast_locks()
    };
    let repo = Arc::new(FileTaskRepository::open(tmp.path(), cfg).expect("repo"));
    let blockers: Vec<String> = (0..8).map(|i| format!("R-{}", i)).collect();
    let task = repo
        .create(TaskDraft {
            subject: "stacked".to_string(),
            blocked_by: blockers.clone(),
            ..TaskDraft::default()
        })
        .expect("create");

    let barrier = Arc::new(Barrier::new(blockers.len()));
    let handles: Vec<_> = blockers
        .into_iter()
        .map(|b| {
            let repo = Arc::clone(&repo);
            let gate = Arc::clone(&barrier);
            let id = task.id.clone();
            std::thread::spawn(move || {
                gate.wait();
                repo.remove_blocker(&id, &b).map(|_| ())
            })
        })
        .collect();
    for h in handles {
        h.join().expect("join").expect("remove blocker");
    }

    let final_task = repo.read(&task.id).expect("read").expect("exists");
    assert!(final_task.blocked_by.is_empty());
}

#[test]
fn memory_repository_matches_file_semantics() {
    let repo = MemoryTaskRepository::new();
    assert!(repo.is_empty());
    let task = repo
        .create(TaskDraft {
            subject: "in memory".to_string(),
            ..TaskDraft::default()
        })
        .expect("create");
    assert!(task.is_claimable());
    assert_eq!(repo.len(), 1);

    let mut changed = task.clone();
    changed.status = TaskStatus::InProgress;
    repo.update(&changed).expect("update");
    assert!(!repo.read(&task.id).expect("read").expect("exists").is_claimable());

    let mut ghost = task;
    ghost.id = "T-ghost".to_string();
    assert!(matches!(repo.update(&ghost), Err(CarapaceError::UnknownTask(_))));
}

#[test]
fn error_codes_are_stable() {
    assert_eq!(CarapaceError::LockContention("x".into()).code(), "LOCK_CONTENTION");
    assert_eq!(
        CarapaceError::CorruptLog {
            line: 3,
            reason: "bad".into()
        }
        .code(),
        "CORRUPT_LOG"
    );
    assert_eq!(CarapaceError::MalformedDismissal("x".into()).code(), "MALFORMED_DISMISSAL");
}
