//! Core primitives shared by every Carapace subsystem.
//!
//! Errors, configuration, the serialized DB broker, schemas, ids and time, file leases
//! and the host task-record boundary live here. Subsystems live in [`crate::plugins`].

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod lease;
pub mod logging;
pub mod schemas;
pub mod store;
pub mod task_repo;
pub mod time;
