//! Subsystem wiring: opens every store under one state root and connects the engines.
//!
//! The CLI opens a project with [`Subsystems::open_project`]. Tests use
//! [`Subsystems::assemble`] to inject their own reviewer, task repository and clock.

use crate::core::config::{self, GovernanceConfig};
use crate::core::error::CarapaceError;
use crate::core::store::Store;
use crate::core::task_repo::{FileTaskRepository, TaskRecordRepository};
use crate::plugins::governance::GovernanceEngine;
use crate::plugins::governance_store::GovernanceStore;
use crate::plugins::graph::TieredGraphStore;
use crate::plugins::holistic::{Clock, HolisticReviewCoordinator, SystemClock};
use crate::plugins::reviewer::{self, DecisionReviewer};
use crate::plugins::trust::TrustEngine;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct Subsystems {
    pub store: Store,
    pub config: GovernanceConfig,
    pub graph: Arc<TieredGraphStore>,
    pub governance: Arc<GovernanceStore>,
    pub engine: Arc<GovernanceEngine>,
    pub holistic: Arc<HolisticReviewCoordinator>,
    pub trust: TrustEngine,
}

impl Subsystems {
    /// Load `<project>/.carapace/config.toml` and open the project's store with the
    /// configured reviewer and the file-backed task repository.
    pub fn open_project(project_root: &Path) -> Result<Self, CarapaceError> {
        let config = config::load_config(project_root)?;
        let store = Store::for_project(project_root)?;
        let tasks: Arc<dyn TaskRecordRepository> =
            Arc::new(FileTaskRepository::open(&store.tasks_dir(), config.locks.clone())?);
        let reviewer = reviewer::build_reviewer(&config.reviewer)?;
        Self::assemble(store, config, tasks, reviewer, Arc::new(SystemClock))
    }

    /// Open every store under `store.root`. A corrupt graph log fails here, before any other
    /// state is touched.
    pub fn assemble(
        store: Store,
        config: GovernanceConfig,
        tasks: Arc<dyn TaskRecordRepository>,
        reviewer: Arc<dyn DecisionReviewer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CarapaceError> {
        let graph = Arc::new(TieredGraphStore::open_with_locks(
            &store.graph_log_path(),
            config.graph.compaction_threshold,
            config.locks.clone(),
        )?);
        let governance = Arc::new(GovernanceStore::open(&store)?);
        let engine = Arc::new(GovernanceEngine::new(
            Arc::clone(&governance),
            Arc::clone(&graph),
            tasks,
            reviewer,
            config.clone(),
        ));
        let holistic = Arc::new(HolisticReviewCoordinator::new(Arc::clone(&engine), clock));
        let trust = TrustEngine::new(Arc::clone(&governance));
        debug!(root = %store.root.display(), "subsystems assembled");
        Ok(Self {
            store,
            config,
            graph,
            governance,
            engine,
            holistic,
            trust,
        })
    }
}
