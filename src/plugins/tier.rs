//! Protection tiers for knowledge entities.
//!
//! An entity's tier is derived, never stored: the first `tier:` marker among its
//! observations wins, otherwise its kind decides, otherwise it is open.
//!
//! | tier            | human caller | agent caller            |
//! |-----------------|--------------|-------------------------|
//! | human-only      | allowed      | denied                  |
//! | approval-gated  | allowed      | allowed iff `approved`  |
//! | open            | allowed      | allowed                 |

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const TIER_MARKER_PREFIX: &str = "tier:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionTier {
    HumanOnly,
    ApprovalGated,
    Open,
}

impl ProtectionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionTier::HumanOnly => "human-only",
            ProtectionTier::ApprovalGated => "approval-gated",
            ProtectionTier::Open => "open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "human-only" => Some(ProtectionTier::HumanOnly),
            "approval-gated" => Some(ProtectionTier::ApprovalGated),
            "open" => Some(ProtectionTier::Open),
            _ => None,
        }
    }

    /// The observation string that pins an entity to this tier.
    pub fn marker(&self) -> String {
        format!("{}{}", TIER_MARKER_PREFIX, self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Human,
    Agent,
}

impl CallerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerRole::Human => "human",
            CallerRole::Agent => "agent",
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, CallerRole::Human)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GraphOperation {
    Read,
    Create,
    AddObservations,
    DeleteObservations,
    DeleteEntity,
}

impl GraphOperation {
    pub fn is_write(&self) -> bool {
        !matches!(self, GraphOperation::Read)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GraphOperation::Read => "read",
            GraphOperation::Create => "create",
            GraphOperation::AddObservations => "add_observations",
            GraphOperation::DeleteObservations => "delete_observations",
            GraphOperation::DeleteEntity => "delete_entity",
        }
    }
}

/// Structured allow/deny answer. Denials are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub tier: ProtectionTier,
    pub reason: String,
}

/// Static kind → tier map used when no observation marker is present.
pub fn tier_for_kind(kind: &str) -> Option<ProtectionTier> {
    match kind {
        "principle" | "constitution" => Some(ProtectionTier::HumanOnly),
        "standard" | "guideline" | "architecture" => Some(ProtectionTier::ApprovalGated),
        _ => None,
    }
}

/// Parse a single observation as a tier marker (`tier:human-only`, `[tier: approval_gated]`).
pub fn parse_marker(observation: &str) -> Option<ProtectionTier> {
    let trimmed = observation
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    let head = trimmed.get(..TIER_MARKER_PREFIX.len())?;
    if !head.eq_ignore_ascii_case(TIER_MARKER_PREFIX) {
        return None;
    }
    ProtectionTier::parse(&trimmed[TIER_MARKER_PREFIX.len()..])
}

pub fn tier_from_observations<S: AsRef<str>>(observations: &[S]) -> Option<ProtectionTier> {
    observations.iter().find_map(|o| parse_marker(o.as_ref()))
}

pub fn derive_tier<S: AsRef<str>>(kind: &str, observations: &[S]) -> ProtectionTier {
    tier_from_observations(observations)
        .or_else(|| tier_for_kind(kind))
        .unwrap_or(ProtectionTier::Open)
}

/// Apply the access table for a write against an entity of `tier`.
pub fn check_write(
    entity: &str,
    tier: ProtectionTier,
    role: CallerRole,
    approved: bool,
) -> AccessDecision {
    let (allowed, reason) = match (tier, role) {
        (_, CallerRole::Human) => (true, format!("human caller may write '{}'", entity)),
        (ProtectionTier::Open, CallerRole::Agent) => {
            (true, format!("'{}' is open to all callers", entity))
        }
        (ProtectionTier::ApprovalGated, CallerRole::Agent) if approved => (
            true,
            format!("'{}' is approval-gated and the write carries approval", entity),
        ),
        (ProtectionTier::ApprovalGated, CallerRole::Agent) => (
            false,
            format!(
                "'{}' is approval-gated: agent writes require an explicit approval flag",
                entity
            ),
        ),
        (ProtectionTier::HumanOnly, CallerRole::Agent) => (
            false,
            format!(
                "'{}' is human-only: agent writes are rejected regardless of approval",
                entity
            ),
        ),
    };
    AccessDecision {
        allowed,
        tier,
        reason,
    }
}
