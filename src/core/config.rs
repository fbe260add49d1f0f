//! Governance configuration loaded from `.carapace/config.toml`.
//!
//! A missing file means defaults. A malformed file is a `ConfigError`.

use crate::core::error::CarapaceError;
use crate::core::store::STATE_DIR;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub review: ReviewTimeouts,
    pub holistic: HolisticConfig,
    pub graph: GraphConfig,
    pub standards: StandardsConfig,
    pub reviewer: ReviewerConfig,
    pub locks: LockConfig,
}

/// Reviewer budgets, in seconds, per call kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReviewTimeouts {
    pub decision_secs: u64,
    pub plan_secs: u64,
    pub completion_secs: u64,
    pub holistic_secs: u64,
    pub task_secs: u64,
}

impl Default for ReviewTimeouts {
    fn default() -> Self {
        Self {
            decision_secs: 60,
            plan_secs: 120,
            completion_secs: 90,
            holistic_secs: 120,
            task_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HolisticConfig {
    pub debounce_ms: u64,
    pub min_batch: usize,
    pub stale_flag_secs: u64,
}

impl Default for HolisticConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            min_batch: 2,
            stale_flag_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Appends between automatic compactions.
    pub compaction_threshold: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StandardsConfig {
    pub cache_ttl_secs: u64,
}

impl Default for StandardsConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 180 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerMode {
    Command,
    Bypass,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReviewerConfig {
    pub mode: ReviewerMode,
    pub command: String,
    pub args: Vec<String>,
    /// Verdict returned by the bypass reviewer.
    pub bypass_verdict: String,
    /// Characters of raw judge output kept when parsing fails.
    pub excerpt_chars: usize,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            mode: ReviewerMode::Command,
            command: "claude".to_string(),
            args: vec!["-p".to_string(), "--output-format".to_string(), "text".to_string()],
            bypass_verdict: "approved".to_string(),
            excerpt_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 25,
            max_delay_ms: 1_000,
            stale_after_secs: 30,
        }
    }
}

impl ReviewTimeouts {
    pub fn decision(&self) -> Duration {
        Duration::from_secs(self.decision_secs)
    }
    pub fn plan(&self) -> Duration {
        Duration::from_secs(self.plan_secs)
    }
    pub fn completion(&self) -> Duration {
        Duration::from_secs(self.completion_secs)
    }
    pub fn holistic(&self) -> Duration {
        Duration::from_secs(self.holistic_secs)
    }
    pub fn task(&self) -> Duration {
        Duration::from_secs(self.task_secs)
    }
}

pub fn config_path(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR).join(CONFIG_FILE)
}

/// Load config for a project, then apply `CARAPACE_*` environment overrides.
pub fn load_config(project_root: &Path) -> Result<GovernanceConfig, CarapaceError> {
    let path = config_path(project_root);
    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)?;
        parse_config(&content)?
    } else {
        GovernanceConfig::default()
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<GovernanceConfig, CarapaceError> {
    toml::from_str(content).map_err(|e| CarapaceError::ConfigError(e.to_string()))
}

fn apply_env_overrides(config: &mut GovernanceConfig) -> Result<(), CarapaceError> {
    if let Ok(mode) = std::env::var("CARAPACE_REVIEWER") {
        config.reviewer.mode = match mode.as_str() {
            "bypass" => ReviewerMode::Bypass,
            "command" => ReviewerMode::Command,
            other => {
                return Err(CarapaceError::ConfigError(format!(
                    "CARAPACE_REVIEWER must be 'bypass' or 'command', got '{}'",
                    other
                )));
            }
        };
    }
    if let Ok(verdict) = std::env::var("CARAPACE_BYPASS_VERDICT") {
        config.reviewer.bypass_verdict = verdict;
    }
    if let Ok(ms) = std::env::var("CARAPACE_DEBOUNCE_MS") {
        config.holistic.debounce_ms = ms.parse().map_err(|_| {
            CarapaceError::ConfigError(format!("CARAPACE_DEBOUNCE_MS is not a number: '{}'", ms))
        })?;
    }
    Ok(())
}
