use crate::core::broker::DbBroker;
use crate::core::error::CarapaceError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

pub fn db_connect(db_path: &str) -> Result<Connection, CarapaceError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

/// Connection for read-only lookups. It never changes the journal mode and refuses writes.
pub fn db_connect_reader(db_path: &str) -> Result<Connection, CarapaceError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA query_only = ON;")?;
    Ok(conn)
}

/// Create every governance table, index and trigger. Idempotent.
pub fn initialize_governance_db(root: &Path) -> Result<(), CarapaceError> {
    fs::create_dir_all(root)?;
    let db_path = root.join(schemas::GOVERNANCE_DB_NAME);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "carapace", None, "governance.init", |conn| {
        conn.execute_batch(schemas::GOVERNANCE_DB_SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES('schema_version', ?1)",
            [schemas::GOVERNANCE_SCHEMA_VERSION],
        )?;
        Ok(())
    })
}
