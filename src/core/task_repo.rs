//! Narrow repository over the host platform's task records.
//!
//! Carapace does not execute tasks; it only gates them. The host owns the record schema,
//! so everything Carapace needs from it is expressed as create/read/update plus blocker
//! mutation. Blocker mutation always happens under a task-scoped exclusive lock so that
//! concurrent reviewers releasing different blockers never lose each other's updates.

use crate::core::config::LockConfig;
use crate::core::error::CarapaceError;
use crate::core::lease;
use crate::core::time;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TaskRecord {
    /// A task can be picked up only while pending and with no outstanding blockers.
    pub fn is_claimable(&self) -> bool {
        self.status == TaskStatus::Pending && self.blocked_by.is_empty()
    }
}

/// Fields supplied when creating a record; the repository assigns the id.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub subject: String,
    pub description: String,
    pub blocked_by: Vec<String>,
    pub blocks: Vec<String>,
    pub metadata: serde_json::Value,
}

pub trait TaskRecordRepository: Send + Sync {
    fn create(&self, draft: TaskDraft) -> Result<TaskRecord, CarapaceError>;

    fn read(&self, task_id: &str) -> Result<Option<TaskRecord>, CarapaceError>;

    fn update(&self, task: &TaskRecord) -> Result<(), CarapaceError>;

    /// Read-modify-write of a single record under its exclusive lock.
    fn mutate(
        &self,
        task_id: &str,
        f: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskRecord, CarapaceError>;

    fn add_blocker(&self, task_id: &str, blocker_id: &str) -> Result<TaskRecord, CarapaceError> {
        self.mutate(task_id, &mut |task| {
            if !task.blocked_by.iter().any(|b| b == blocker_id) {
                task.blocked_by.push(blocker_id.to_string());
            }
        })
    }

    fn remove_blocker(
        &self,
        task_id: &str,
        blocker_id: &str,
    ) -> Result<TaskRecord, CarapaceError> {
        self.mutate(task_id, &mut |task| {
            task.blocked_by.retain(|b| b != blocker_id);
        })
    }
}

/// Accept the outcome of a blocker change on a task the host store may not track.
///
/// Holistic sessions report host task ids Carapace did not create. An unknown or
/// unrepresentable id is logged and yields `None`; every other failure propagates.
pub fn tolerate_untracked(
    task_id: &str,
    result: Result<TaskRecord, CarapaceError>,
) -> Result<Option<TaskRecord>, CarapaceError> {
    match result {
        Ok(task) => Ok(Some(task)),
        Err(CarapaceError::UnknownTask(_)) | Err(CarapaceError::ValidationError(_)) => {
            warn!(task = task_id, "task has no host record; host blockers not applied");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn record_from_draft(id: String, draft: TaskDraft) -> TaskRecord {
    TaskRecord {
        id,
        subject: draft.subject,
        description: draft.description,
        status: TaskStatus::Pending,
        blocked_by: draft.blocked_by,
        blocks: draft.blocks,
        owner: None,
        metadata: if draft.metadata.is_null() {
            serde_json::json!({})
        } else {
            draft.metadata
        },
    }
}

/// One JSON file per task under a directory, written via temp file + rename.
pub struct FileTaskRepository {
    dir: PathBuf,
    locks_dir: PathBuf,
    lock_config: LockConfig,
}

impl FileTaskRepository {
    pub fn open(dir: &Path, lock_config: LockConfig) -> Result<Self, CarapaceError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks_dir: dir.join(".locks"),
            lock_config,
        })
    }

    fn task_path(&self, task_id: &str) -> Result<PathBuf, CarapaceError> {
        if task_id.is_empty()
            || !task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CarapaceError::ValidationError(format!(
                "Invalid task id '{}'",
                task_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", task_id)))
    }

    fn write_record(&self, task: &TaskRecord) -> Result<(), CarapaceError> {
        let path = self.task_path(&task.id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(task)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_record(&self, task_id: &str) -> Result<Option<TaskRecord>, CarapaceError> {
        let path = self.task_path(task_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

impl TaskRecordRepository for FileTaskRepository {
    fn create(&self, draft: TaskDraft) -> Result<TaskRecord, CarapaceError> {
        let task = record_from_draft(time::prefixed_id("T"), draft);
        self.write_record(&task)?;
        debug!(task_id = %task.id, blockers = task.blocked_by.len(), "task record created");
        Ok(task)
    }

    fn read(&self, task_id: &str) -> Result<Option<TaskRecord>, CarapaceError> {
        self.read_record(task_id)
    }

    fn update(&self, task: &TaskRecord) -> Result<(), CarapaceError> {
        let _lease = lease::acquire_lease(&self.locks_dir, &task.id, &self.lock_config)?;
        if self.read_record(&task.id)?.is_none() {
            return Err(CarapaceError::UnknownTask(task.id.clone()));
        }
        self.write_record(task)
    }

    fn mutate(
        &self,
        task_id: &str,
        f: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskRecord, CarapaceError> {
        let _lease = lease::acquire_lease(&self.locks_dir, task_id, &self.lock_config)?;
        let mut task = self
            .read_record(task_id)?
            .ok_or_else(|| CarapaceError::UnknownTask(task_id.to_string()))?;
        f(&mut task);
        self.write_record(&task)?;
        Ok(task)
    }
}

/// In-process repository, used by tests and embedders without a host task store.
#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: Mutex<FxHashMap<String, TaskRecord>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskRecordRepository for MemoryTaskRepository {
    fn create(&self, draft: TaskDraft) -> Result<TaskRecord, CarapaceError> {
        let task = record_from_draft(time::prefixed_id("T"), draft);
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn read(&self, task_id: &str) -> Result<Option<TaskRecord>, CarapaceError> {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tasks.get(task_id).cloned())
    }

    fn update(&self, task: &TaskRecord) -> Result<(), CarapaceError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(CarapaceError::UnknownTask(task.id.clone())),
        }
    }

    fn mutate(
        &self,
        task_id: &str,
        f: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskRecord, CarapaceError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CarapaceError::UnknownTask(task_id.to_string()))?;
        f(task);
        Ok(task.clone())
    }
}
