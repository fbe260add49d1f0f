//! Governance subsystems.
//!
//! - `tier`: protection tiers and the write-access table
//! - `graph`: tier-protected knowledge graph over an append-only log
//! - `reviewer`: boundary around the external judge
//! - `governance_store`: relational persistence for all governance state
//! - `governance`: decision/plan/completion reviews and governed tasks
//! - `holistic`: per-session debounced collective review and the action gate
//! - `trust`: deterministic-tool findings and dismissals

pub mod governance;
pub mod governance_store;
pub mod graph;
pub mod holistic;
pub mod reviewer;
pub mod tier;
pub mod trust;
