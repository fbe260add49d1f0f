use crate::core::db;
use crate::core::error::CarapaceError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// The DB Broker is the single entry point for governance state access.
///
/// Mutations are serialized in-process and recorded in `broker.events.jsonl`. Reads go
/// through [`DbBroker::with_read`] on a reused query-only connection and leave no audit
/// trail.
pub struct DbBroker {
    audit_log_path: PathBuf,
    readers: Mutex<FxHashMap<PathBuf, Connection>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub intent_ref: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

static DB_LOCK: Mutex<()> = Mutex::new(());

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(schemas::AUDIT_LOG_NAME),
            readers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Run a read-only closure without auditing it or waiting on the mutation lock.
    pub fn with_read<F, R>(&self, db_path: &Path, op_name: &str, f: F) -> Result<R, CarapaceError>
    where
        F: FnOnce(&Connection) -> Result<R, CarapaceError>,
    {
        let mut readers = self.readers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = match readers.entry(db_path.to_path_buf()) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(db::db_connect_reader(&db_path.to_string_lossy())?)
            }
        };
        let result = f(&*conn);
        trace!(op = op_name, ok = result.is_ok(), "broker read");
        result
    }

    /// Execute a closure with a serialized connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, CarapaceError>
    where
        F: FnOnce(&Connection) -> Result<R, CarapaceError>,
    {
        // A poisoned lock only means another caller panicked; the DB itself is consistent.
        let _lock = DB_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = f(&conn);

        let status = if result.is_ok() { "success" } else { "error" };
        debug!(op = op_name, actor, status, "broker op");
        // The closure may already have committed; its result is what the caller gets.
        if let Err(err) = self.log_event(actor, intent_ref, op_name, &db_id, status) {
            warn!(op = op_name, error = %err, "broker audit append failed");
        }

        result
    }

    /// Like [`DbBroker::with_conn`] but wraps the closure in an IMMEDIATE transaction
    /// that commits only when the closure succeeds.
    pub fn with_tx<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, CarapaceError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, CarapaceError>,
    {
        self.with_conn(db_path, actor, None, op_name, |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    fn log_event(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), CarapaceError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            intent_ref: intent_ref.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)?;

        writeln!(f, "{}", serde_json::to_string(&ev)?)?;
        Ok(())
    }
}

/// Read back the audit log, newest last.
pub fn read_audit_log(root: &Path) -> Result<Vec<BrokerEvent>, CarapaceError> {
    let path = root.join(schemas::AUDIT_LOG_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(line)?);
    }
    Ok(events)
}
