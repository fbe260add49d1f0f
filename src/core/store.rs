//! Store abstraction for Carapace's on-disk state.
//!
//! A store is a single directory holding every persisted artifact: the governance
//! database, the append-only knowledge log, the host task records and the broker
//! audit log. Subsystems never compute paths on their own; they ask the store.

use crate::core::error::CarapaceError;
use crate::core::schemas;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory (relative to a project root) that holds Carapace state.
pub const STATE_DIR: &str = ".carapace";

/// Store handle representing a Carapace state workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory (`<project>/.carapace/data`).
    pub root: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, CarapaceError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Open the conventional store for a project checkout.
    pub fn for_project(project_root: &Path) -> Result<Self, CarapaceError> {
        Self::open(&project_root.join(STATE_DIR).join("data"))
    }

    pub fn governance_db_path(&self) -> PathBuf {
        self.root.join(schemas::GOVERNANCE_DB_NAME)
    }

    pub fn graph_log_path(&self) -> PathBuf {
        self.root.join(schemas::GRAPH_LOG_NAME)
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }
}
