//! Centralized schema definitions for Carapace's persisted state.
//!
//! Carapace keeps two durable artifacts per store:
//! 1. governance.db: decisions, verdicts, governed tasks, task reviews, findings,
//!    dismissals and holistic session bookkeeping (SQLite).
//! 2. graph.jsonl: the append-only, tier-protected knowledge log.

pub const GOVERNANCE_DB_NAME: &str = "governance.db";
pub const GRAPH_LOG_NAME: &str = "graph.jsonl";
pub const AUDIT_LOG_NAME: &str = "broker.events.jsonl";

pub const GOVERNANCE_SCHEMA_VERSION: &str = "3";

pub const GOVERNANCE_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS decisions (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        category TEXT NOT NULL,
        summary TEXT NOT NULL,
        detail TEXT NOT NULL DEFAULT '',
        confidence REAL NOT NULL,
        sequence INTEGER NOT NULL,
        supersedes TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(task_id, sequence)
    );
    CREATE INDEX IF NOT EXISTS idx_decisions_task ON decisions(task_id);
    CREATE INDEX IF NOT EXISTS idx_decisions_agent ON decisions(agent_id);
    CREATE TRIGGER IF NOT EXISTS decisions_immutable
        BEFORE UPDATE ON decisions
        BEGIN SELECT RAISE(ABORT, 'decisions are immutable'); END;

    CREATE TABLE IF NOT EXISTS reviews (
        id TEXT PRIMARY KEY,
        decision_id TEXT REFERENCES decisions(id),
        context_kind TEXT NOT NULL,
        context_ref TEXT NOT NULL,
        verdict TEXT NOT NULL,
        findings TEXT NOT NULL DEFAULT '[]',
        guidance TEXT NOT NULL DEFAULT '',
        standards TEXT NOT NULL DEFAULT '[]',
        reviewer TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_reviews_decision ON reviews(decision_id);
    CREATE INDEX IF NOT EXISTS idx_reviews_context ON reviews(context_kind, context_ref);
    CREATE TRIGGER IF NOT EXISTS reviews_immutable
        BEFORE UPDATE ON reviews
        BEGIN SELECT RAISE(ABORT, 'review verdicts are immutable'); END;

    CREATE TABLE IF NOT EXISTS governed_tasks (
        id TEXT PRIMARY KEY,
        impl_task_id TEXT NOT NULL UNIQUE,
        subject TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        context TEXT NOT NULL DEFAULT '',
        blockers TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        released_at TEXT,
        CHECK (status = 'approved' OR json_array_length(blockers) > 0)
    );
    CREATE INDEX IF NOT EXISTS idx_governed_tasks_status ON governed_tasks(status);

    CREATE TABLE IF NOT EXISTS task_reviews (
        id TEXT PRIMARY KEY,
        review_task_id TEXT NOT NULL UNIQUE,
        impl_task_id TEXT NOT NULL,
        review_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        verdict TEXT,
        guidance TEXT NOT NULL DEFAULT '',
        findings TEXT NOT NULL DEFAULT '[]',
        standards TEXT NOT NULL DEFAULT '[]',
        context TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_task_reviews_impl ON task_reviews(impl_task_id);
    CREATE INDEX IF NOT EXISTS idx_task_reviews_status ON task_reviews(status);

    CREATE TABLE IF NOT EXISTS findings (
        id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL UNIQUE,
        tool TEXT NOT NULL,
        rule TEXT NOT NULL,
        path TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL,
        severity TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        occurrences INTEGER NOT NULL DEFAULT 1,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_findings_status ON findings(status);

    CREATE TABLE IF NOT EXISTS dismissals (
        id TEXT PRIMARY KEY,
        finding_id TEXT NOT NULL REFERENCES findings(id),
        fingerprint TEXT NOT NULL,
        justification TEXT NOT NULL CHECK (length(trim(justification)) > 0),
        dismissed_by TEXT NOT NULL CHECK (length(trim(dismissed_by)) > 0),
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_dismissals_fingerprint ON dismissals(fingerprint);
    CREATE TRIGGER IF NOT EXISTS dismissals_no_update
        BEFORE UPDATE ON dismissals
        BEGIN SELECT RAISE(ABORT, 'dismissal history is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS dismissals_no_delete
        BEFORE DELETE ON dismissals
        BEGIN SELECT RAISE(ABORT, 'dismissal history is append-only'); END;

    CREATE TABLE IF NOT EXISTS session_flags (
        session_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        task_ids TEXT NOT NULL DEFAULT '[]',
        guidance TEXT NOT NULL DEFAULT '',
        generation INTEGER NOT NULL,
        deadline_ms INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS session_tasks (
        task_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        subject TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        generation INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        holistic_status TEXT NOT NULL DEFAULT 'pending'
    );
    CREATE INDEX IF NOT EXISTS idx_session_tasks_session ON session_tasks(session_id, holistic_status);
";
