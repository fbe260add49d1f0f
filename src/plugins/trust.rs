//! Findings audit for deterministic tools (linters, formatters, test runners).
//!
//! A finding is identified by its fingerprint, so the same complaint about the same place
//! is recognized when it recurs. Findings block by default. Once a finding has been
//! dismissed with a justification, its recurrences are only tracked. Dismissals are kept
//! in an append-only history that the finding's mutable status never rewrites.

use crate::core::error::CarapaceError;
use crate::plugins::governance_store::{
    DismissalRecord, FindingStatus, GovernanceStore, NewFinding, ToolFinding,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Block,
    Track,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Block => "BLOCK",
            Classification::Track => "TRACK",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingReport {
    pub tool: String,
    pub rule: String,
    pub path: String,
    pub message: String,
    #[serde(default = "default_severity")]
    pub severity: String,
}

fn default_severity() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedFinding {
    pub finding: ToolFinding,
    pub classification: Classification,
    pub dismissals: i64,
}

/// SHA-256 over `tool|rule|path|message`, hex encoded.
pub fn fingerprint(tool: &str, rule: &str, path: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(b"|");
    hasher.update(rule.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(message.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct TrustEngine {
    store: Arc<GovernanceStore>,
}

impl TrustEngine {
    pub fn new(store: Arc<GovernanceStore>) -> Self {
        Self { store }
    }

    /// Record a tool finding (or another occurrence of a known one) and classify it.
    pub fn record_finding(&self, report: &FindingReport) -> Result<ClassifiedFinding, CarapaceError> {
        if report.tool.trim().is_empty() || report.rule.trim().is_empty() {
            return Err(CarapaceError::ValidationError(
                "Findings need a tool and a rule".to_string(),
            ));
        }
        let fp = fingerprint(&report.tool, &report.rule, &report.path, &report.message);
        let finding = self.store.upsert_finding(&NewFinding {
            fingerprint: &fp,
            tool: &report.tool,
            rule: &report.rule,
            path: &report.path,
            message: &report.message,
            severity: &report.severity,
        })?;
        self.classified(finding)
    }

    fn classified(&self, finding: ToolFinding) -> Result<ClassifiedFinding, CarapaceError> {
        let dismissals = self.store.dismissal_count(&finding.fingerprint)?;
        let classification = if dismissals > 0 {
            Classification::Track
        } else {
            Classification::Block
        };
        Ok(ClassifiedFinding {
            finding,
            classification,
            dismissals,
        })
    }

    pub fn classify(&self, finding_id: &str) -> Result<ClassifiedFinding, CarapaceError> {
        let finding = self.get(finding_id)?;
        self.classified(finding)
    }

    fn get(&self, finding_id: &str) -> Result<ToolFinding, CarapaceError> {
        self.store
            .get_finding(finding_id)?
            .ok_or_else(|| CarapaceError::NotFound(format!("Finding '{}' not found", finding_id)))
    }

    pub fn record_dismissal(
        &self,
        finding_id: &str,
        justification: &str,
        dismissed_by: &str,
    ) -> Result<DismissalRecord, CarapaceError> {
        if justification.trim().is_empty() {
            return Err(CarapaceError::MalformedDismissal(
                "justification must not be empty".to_string(),
            ));
        }
        if dismissed_by.trim().is_empty() {
            return Err(CarapaceError::MalformedDismissal(
                "dismisser identity must not be empty".to_string(),
            ));
        }
        let record = self
            .store
            .insert_dismissal(finding_id, justification.trim(), dismissed_by.trim())?;
        info!(finding = finding_id, by = dismissed_by, "finding dismissed");
        Ok(record)
    }

    /// Put a dismissed finding back to open. The dismissal history is untouched.
    pub fn reopen_finding(&self, finding_id: &str) -> Result<ToolFinding, CarapaceError> {
        self.get(finding_id)?;
        self.store.set_finding_status(finding_id, FindingStatus::Open)?;
        self.get(finding_id)
    }

    pub fn dismissal_history(&self, finding_id: &str) -> Result<Vec<DismissalRecord>, CarapaceError> {
        self.get(finding_id)?;
        self.store.dismissals_for(finding_id)
    }

    pub fn list_findings(&self, status: Option<FindingStatus>) -> Result<Vec<ToolFinding>, CarapaceError> {
        self.store.list_findings(status)
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "trust",
        "version": "0.3.0",
        "description": "Deterministic-tool findings with justified, append-only dismissals",
        "commands": [
            { "name": "record", "parameters": ["tool", "rule", "path", "message", "severity"] },
            { "name": "dismiss", "parameters": ["id", "justification", "by"] },
            { "name": "classify", "parameters": ["id"] },
            { "name": "reopen", "parameters": ["id"] },
            { "name": "history", "parameters": ["id"] },
            { "name": "list", "parameters": ["status"] }
        ],
        "storage": ["governance.db"]
    })
}
