//! Tier-protected knowledge graph with an append-only log.
//!
//! The graph is institutional memory: components, standards, patterns, problems, and
//! the decisions and reviews mirrored in by the governance engine. It is persisted as
//! one JSONL log of discriminated `entity` / `relation` records. Startup replays the
//! log in order (duplicate entity names are last-write-wins). Deletes, and every
//! `compaction_threshold` appends, rewrite the full current state to a temp file that
//! is atomically renamed over the log, so readers never see a partial file.
//!
//! Concurrency: the in-memory index is published as an `Arc` snapshot. Readers clone
//! the `Arc` and never wait on a writer. Writers serialize on a single mutex, build the
//! next state off to the side, persist it, and only then publish it, so a failed write
//! leaves the visible state untouched and a successful one is visible to the very next
//! reader.
//!
//! Several processes may share one log. Every append and compaction also holds a file
//! lease on the log, and a writer that finds the log changed since it last looked
//! replays it before mutating. A compaction therefore always rewrites the state every
//! process has committed, never a stale snapshot.

use crate::core::config::LockConfig;
use crate::core::error::CarapaceError;
use crate::core::lease::{self, Lease};
use crate::plugins::tier::{
    self, AccessDecision, CallerRole, GraphOperation, ProtectionTier,
};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const VALID_ENTITY_TYPES: &[&str] = &[
    "principle",
    "constitution",
    "standard",
    "guideline",
    "architecture",
    "component",
    "pattern",
    "problem",
    "lesson",
    "decision",
    "review",
    "governance_record",
];

// --- Data Types ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    #[serde(default)]
    pub observations: Vec<String>,
}

impl Entity {
    pub fn new(name: &str, entity_type: &str, observations: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            observations: observations.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn tier(&self) -> ProtectionTier {
        tier::derive_tier(&self.entity_type, &self.observations)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    #[serde(rename = "relationType")]
    pub relation_type: String,
}

impl Relation {
    pub fn new(from: &str, to: &str, relation_type: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            relation_type: relation_type.to_string(),
        }
    }

    fn touches(&self, name: &str) -> bool {
        self.from == name || self.to == name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogRecord {
    Entity(Entity),
    Relation(Relation),
}

/// Result of a tier-checked single-entity write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    Applied {
        entity: String,
        changed: Vec<String>,
    },
    Deleted {
        entity: String,
        relations_removed: usize,
    },
    Denied {
        entity: String,
        decision: AccessDecision,
    },
}

impl WriteOutcome {
    pub fn is_denied(&self) -> bool {
        matches!(self, WriteOutcome::Denied { .. })
    }

    /// Turn a denial into a `TierViolation` error for callers that treat it as failure.
    pub fn into_result(self) -> Result<WriteOutcome, CarapaceError> {
        match self {
            WriteOutcome::Denied { entity, decision } => Err(CarapaceError::TierViolation {
                entity,
                reason: decision.reason,
            }),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Denial {
    pub name: String,
    pub decision: AccessDecision,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateEntitiesOutcome {
    pub created: Vec<Entity>,
    pub skipped: Vec<String>,
    pub denied: Vec<Denial>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRelation {
    pub relation: Relation,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRelationsOutcome {
    pub created: Vec<Relation>,
    pub duplicates: Vec<Relation>,
    pub rejected: Vec<RejectedRelation>,
}

/// A subgraph: entities plus the relations among them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphView {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityView {
    pub entity: Entity,
    pub tier: ProtectionTier,
    pub relations: Vec<Relation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionReport {
    pub entities: usize,
    pub relations: usize,
    pub records_before: usize,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    entities: FxHashMap<String, Entity>,
    relations: Vec<Relation>,
    relation_index: FxHashSet<Relation>,
    /// Bumped whenever an entity that is, or was, outside the open tier changes.
    protected_version: u64,
}

impl GraphState {
    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Entity(entity) => self.put_entity(entity),
            LogRecord::Relation(relation) => {
                self.insert_relation(relation);
            }
        }
    }

    fn put_entity(&mut self, entity: Entity) {
        let protected = entity.tier() != ProtectionTier::Open
            || self
                .entities
                .get(&entity.name)
                .is_some_and(|old| old.tier() != ProtectionTier::Open);
        if protected {
            self.protected_version += 1;
        }
        self.entities.insert(entity.name.clone(), entity);
    }

    fn remove_entity(&mut self, name: &str) -> Option<Entity> {
        let removed = self.entities.remove(name);
        if removed
            .as_ref()
            .is_some_and(|e| e.tier() != ProtectionTier::Open)
        {
            self.protected_version += 1;
        }
        removed
    }

    fn insert_relation(&mut self, relation: Relation) -> bool {
        if self.relation_index.insert(relation.clone()) {
            self.relations.push(relation);
            true
        } else {
            false
        }
    }

    fn remove_relations_where<F: Fn(&Relation) -> bool>(&mut self, pred: F) -> usize {
        let before = self.relations.len();
        let (removed, kept): (Vec<Relation>, Vec<Relation>) =
            self.relations.drain(..).partition(|r| pred(r));
        for r in &removed {
            self.relation_index.remove(r);
        }
        self.relations = kept;
        before - self.relations.len()
    }

    fn sorted_entities(&self) -> Vec<&Entity> {
        let mut entities: Vec<&Entity> = self.entities.values().collect();
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        entities
    }

    fn record_count(&self) -> usize {
        self.entities.len() + self.relations.len()
    }
}

struct WriterState {
    appends_since_compaction: usize,
    /// Records currently in the log file, redundant ones included.
    log_records: usize,
    /// The log as this handle last wrote or replayed it.
    seen: Option<LogFingerprint>,
    /// The log ends in an unterminated record; the next write rewrites it.
    torn_tail: bool,
}

/// Enough file metadata to notice that another process appended to or replaced the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogFingerprint {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

struct LogScan {
    state: GraphState,
    records: usize,
    torn_tail: bool,
}

/// What a write did to the log, decided by the mutation closure.
enum Persist {
    Nothing,
    Append(Vec<LogRecord>),
    Compact,
}

pub struct TieredGraphStore {
    path: PathBuf,
    snapshot: RwLock<Arc<GraphState>>,
    writer: Mutex<WriterState>,
    compaction_threshold: usize,
    locks_dir: PathBuf,
    locks: LockConfig,
    generation: AtomicU64,
    protected_generation: AtomicU64,
}

impl TieredGraphStore {
    /// Replay the log at `path` into memory. A log that cannot be parsed is fatal.
    pub fn open(path: &Path, compaction_threshold: usize) -> Result<Self, CarapaceError> {
        Self::open_with_locks(path, compaction_threshold, LockConfig::default())
    }

    /// Like [`TieredGraphStore::open`], with explicit retry settings for the log lease.
    pub fn open_with_locks(
        path: &Path,
        compaction_threshold: usize,
        locks: LockConfig,
    ) -> Result<Self, CarapaceError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let seen = log_fingerprint(path)?;
        let scan = replay_log(path)?;
        let redundant = scan.records.saturating_sub(scan.state.record_count());
        info!(
            path = %path.display(),
            entities = scan.state.entities.len(),
            relations = scan.state.relations.len(),
            records = scan.records,
            "knowledge graph loaded"
        );

        let store = Self {
            path: path.to_path_buf(),
            snapshot: RwLock::new(Arc::new(scan.state)),
            writer: Mutex::new(WriterState {
                appends_since_compaction: redundant,
                log_records: scan.records,
                seen,
                torn_tail: scan.torn_tail,
            }),
            compaction_threshold: compaction_threshold.max(1),
            locks_dir: parent.join(".locks"),
            locks,
            generation: AtomicU64::new(0),
            protected_generation: AtomicU64::new(0),
        };
        if redundant >= store.compaction_threshold {
            store.compact()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Monotonic counter bumped on every published write.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bumped only when a human-only or approval-gated entity is created, changed, re-tiered
    /// or deleted, or when another process's writes are reloaded. Standards caches key on it.
    pub fn protected_generation(&self) -> u64 {
        self.protected_generation.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Arc<GraphState> {
        let guard = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn publish(&self, state: GraphState, protected_changed: bool) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(state);
        self.generation.fetch_add(1, Ordering::AcqRel);
        if protected_changed {
            self.protected_generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn log_lease(&self) -> Result<Lease, CarapaceError> {
        let key = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "graph".to_string());
        lease::acquire_lease(&self.locks_dir, &key, &self.locks)
    }

    /// Replay the log if another process changed it since this handle last looked.
    /// Caller holds the writer mutex and the log lease.
    fn sync_with_log(&self, writer: &mut WriterState) -> Result<(), CarapaceError> {
        let current = log_fingerprint(&self.path)?;
        if current == writer.seen {
            return Ok(());
        }
        let scan = replay_log(&self.path)?;
        debug!(
            path = %self.path.display(),
            records = scan.records,
            "graph log changed on disk; reloaded"
        );
        writer.appends_since_compaction = scan.records.saturating_sub(scan.state.record_count());
        writer.log_records = scan.records;
        writer.torn_tail = scan.torn_tail;
        writer.seen = current;
        self.publish(scan.state, true);
        Ok(())
    }

    /// Caller holds the writer mutex and the log lease.
    fn rewrite_log(&self, writer: &mut WriterState, state: &GraphState) -> Result<(), CarapaceError> {
        write_compacted(&self.path, state)?;
        writer.appends_since_compaction = 0;
        writer.log_records = state.record_count();
        writer.torn_tail = false;
        Ok(())
    }

    /// Run one serialized write: mutate a private copy, persist, then publish.
    fn write<R, F>(&self, op: &str, f: F) -> Result<R, CarapaceError>
    where
        F: FnOnce(&mut GraphState) -> Result<(R, Persist), CarapaceError>,
    {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _lease = self.log_lease()?;
        self.sync_with_log(&mut writer)?;

        let mut next = (*self.snapshot()).clone();
        let protected_before = next.protected_version;
        let (out, persist) = f(&mut next)?;

        let changed = match persist {
            Persist::Nothing => false,
            Persist::Append(_) if writer.torn_tail => {
                debug!(op, "log ends in a torn record; rewriting instead of appending");
                self.rewrite_log(&mut writer, &next)?;
                true
            }
            Persist::Append(records) => {
                append_records(&self.path, &records)?;
                writer.appends_since_compaction += records.len();
                writer.log_records += records.len();
                if writer.appends_since_compaction >= self.compaction_threshold {
                    debug!(op, appends = writer.appends_since_compaction, "append threshold reached");
                    self.rewrite_log(&mut writer, &next)?;
                }
                true
            }
            Persist::Compact => {
                self.rewrite_log(&mut writer, &next)?;
                true
            }
        };

        if changed {
            writer.seen = log_fingerprint(&self.path)?;
            let protected_changed = next.protected_version != protected_before;
            self.publish(next, protected_changed);
            debug!(op, protected_changed, "graph write published");
        }
        Ok(out)
    }

    // --- Writes ---

    pub fn create_entities(
        &self,
        entities: Vec<Entity>,
        role: CallerRole,
        approved: bool,
    ) -> Result<CreateEntitiesOutcome, CarapaceError> {
        for entity in &entities {
            validate_entity(entity)?;
        }

        self.write("create_entities", |state| {
            let mut outcome = CreateEntitiesOutcome::default();
            let mut records = Vec::new();
            for mut entity in entities {
                if state.entities.contains_key(&entity.name) {
                    outcome.skipped.push(entity.name);
                    continue;
                }
                let decision = tier::check_write(&entity.name, entity.tier(), role, approved);
                if !decision.allowed {
                    warn!(entity = %entity.name, reason = %decision.reason, "entity creation denied");
                    outcome.denied.push(Denial {
                        name: entity.name,
                        decision,
                    });
                    continue;
                }
                dedupe_in_place(&mut entity.observations);
                state.put_entity(entity.clone());
                records.push(LogRecord::Entity(entity.clone()));
                outcome.created.push(entity);
            }
            let persist = if records.is_empty() {
                Persist::Nothing
            } else {
                Persist::Append(records)
            };
            Ok((outcome, persist))
        })
    }

    pub fn create_relations(
        &self,
        relations: Vec<Relation>,
    ) -> Result<CreateRelationsOutcome, CarapaceError> {
        self.write("create_relations", |state| {
            let mut outcome = CreateRelationsOutcome::default();
            let mut records = Vec::new();
            for relation in relations {
                let reason = if relation.relation_type.trim().is_empty() {
                    Some("relation type must not be empty".to_string())
                } else if !state.entities.contains_key(&relation.from) {
                    Some(format!("unknown source entity '{}'", relation.from))
                } else if !state.entities.contains_key(&relation.to) {
                    Some(format!("unknown target entity '{}'", relation.to))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    outcome.rejected.push(RejectedRelation { relation, reason });
                    continue;
                }
                if state.insert_relation(relation.clone()) {
                    records.push(LogRecord::Relation(relation.clone()));
                    outcome.created.push(relation);
                } else {
                    outcome.duplicates.push(relation);
                }
            }
            let persist = if records.is_empty() {
                Persist::Nothing
            } else {
                Persist::Append(records)
            };
            Ok((outcome, persist))
        })
    }

    pub fn add_observations(
        &self,
        name: &str,
        observations: &[String],
        role: CallerRole,
        approved: bool,
    ) -> Result<WriteOutcome, CarapaceError> {
        self.write("add_observations", |state| {
            let current = state
                .entities
                .get(name)
                .ok_or_else(|| CarapaceError::UnknownEntity(name.to_string()))?;

            let mut updated = current.clone();
            let mut added = Vec::new();
            for obs in observations {
                if !updated.observations.contains(obs) && !added.contains(obs) {
                    added.push(obs.clone());
                }
            }
            updated.observations.extend(added.iter().cloned());

            if let Some(decision) = deny_transition(current, &updated, role, approved) {
                warn!(entity = name, reason = %decision.reason, "add_observations denied");
                return Ok((
                    WriteOutcome::Denied {
                        entity: name.to_string(),
                        decision,
                    },
                    Persist::Nothing,
                ));
            }
            if added.is_empty() {
                return Ok((
                    WriteOutcome::Applied {
                        entity: name.to_string(),
                        changed: added,
                    },
                    Persist::Nothing,
                ));
            }

            state.put_entity(updated.clone());
            Ok((
                WriteOutcome::Applied {
                    entity: name.to_string(),
                    changed: added,
                },
                Persist::Append(vec![LogRecord::Entity(updated)]),
            ))
        })
    }

    pub fn delete_observations(
        &self,
        name: &str,
        observations: &[String],
        role: CallerRole,
        approved: bool,
    ) -> Result<WriteOutcome, CarapaceError> {
        self.write("delete_observations", |state| {
            let current = state
                .entities
                .get(name)
                .ok_or_else(|| CarapaceError::UnknownEntity(name.to_string()))?;

            let mut updated = current.clone();
            let mut removed = Vec::new();
            updated.observations.retain(|o| {
                if observations.contains(o) {
                    removed.push(o.clone());
                    false
                } else {
                    true
                }
            });

            if let Some(decision) = deny_transition(current, &updated, role, approved) {
                warn!(entity = name, reason = %decision.reason, "delete_observations denied");
                return Ok((
                    WriteOutcome::Denied {
                        entity: name.to_string(),
                        decision,
                    },
                    Persist::Nothing,
                ));
            }
            let persist = if removed.is_empty() {
                Persist::Nothing
            } else {
                state.put_entity(updated);
                Persist::Compact
            };
            Ok((
                WriteOutcome::Applied {
                    entity: name.to_string(),
                    changed: removed,
                },
                persist,
            ))
        })
    }

    /// Delete an entity and every relation touching it.
    pub fn delete_entity(
        &self,
        name: &str,
        role: CallerRole,
        approved: bool,
    ) -> Result<WriteOutcome, CarapaceError> {
        self.write("delete_entity", |state| {
            let current = state
                .entities
                .get(name)
                .ok_or_else(|| CarapaceError::UnknownEntity(name.to_string()))?;

            let decision = tier::check_write(name, current.tier(), role, approved);
            if !decision.allowed {
                warn!(entity = name, reason = %decision.reason, "delete_entity denied");
                return Ok((
                    WriteOutcome::Denied {
                        entity: name.to_string(),
                        decision,
                    },
                    Persist::Nothing,
                ));
            }

            state.remove_entity(name);
            let relations_removed = state.remove_relations_where(|r| r.touches(name));
            Ok((
                WriteOutcome::Deleted {
                    entity: name.to_string(),
                    relations_removed,
                },
                Persist::Compact,
            ))
        })
    }

    /// Delete exactly-matching relations; returns how many were removed.
    pub fn delete_relations(&self, relations: &[Relation]) -> Result<usize, CarapaceError> {
        let targets: FxHashSet<&Relation> = relations.iter().collect();
        self.write("delete_relations", |state| {
            let removed = state.remove_relations_where(|r| targets.contains(r));
            let persist = if removed == 0 {
                Persist::Nothing
            } else {
                Persist::Compact
            };
            Ok((removed, persist))
        })
    }

    /// Rewrite the log to exactly the committed state, including other processes' writes.
    pub fn compact(&self) -> Result<CompactionReport, CarapaceError> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _lease = self.log_lease()?;
        self.sync_with_log(&mut writer)?;
        let state = self.snapshot();
        let records_before = writer.log_records;
        self.rewrite_log(&mut writer, &state)?;
        writer.seen = log_fingerprint(&self.path)?;
        info!(
            entities = state.entities.len(),
            relations = state.relations.len(),
            "knowledge graph compacted"
        );
        Ok(CompactionReport {
            entities: state.entities.len(),
            relations: state.relations.len(),
            records_before,
        })
    }

    // --- Reads ---

    pub fn get_entity(&self, name: &str) -> Option<EntityView> {
        let state = self.snapshot();
        let entity = state.entities.get(name)?.clone();
        let relations = state
            .relations
            .iter()
            .filter(|r| r.touches(name))
            .cloned()
            .collect();
        Some(EntityView {
            tier: entity.tier(),
            entity,
            relations,
        })
    }

    /// Case-insensitive substring match over entity names and observations.
    pub fn search(&self, query: &str) -> GraphView {
        let needle = query.to_lowercase();
        let state = self.snapshot();
        let entities: Vec<Entity> = state
            .sorted_entities()
            .into_iter()
            .filter(|e| {
                e.name.to_lowercase().contains(&needle)
                    || e
                        .observations
                        .iter()
                        .any(|o| o.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        view_with_internal_relations(&state, entities)
    }

    pub fn get_by_tier(&self, tier: ProtectionTier) -> Vec<Entity> {
        self.snapshot()
            .sorted_entities()
            .into_iter()
            .filter(|e| e.tier() == tier)
            .cloned()
            .collect()
    }

    pub fn read_graph(&self) -> GraphView {
        let state = self.snapshot();
        GraphView {
            entities: state.sorted_entities().into_iter().cloned().collect(),
            relations: state.relations.clone(),
        }
    }

    /// Whether `role` may perform `op` on `name` without an approval flag.
    pub fn validate_access(
        &self,
        name: &str,
        op: GraphOperation,
        role: CallerRole,
    ) -> Result<AccessDecision, CarapaceError> {
        let state = self.snapshot();
        let entity = state
            .entities
            .get(name)
            .ok_or_else(|| CarapaceError::UnknownEntity(name.to_string()))?;
        let tier = entity.tier();
        if !op.is_write() {
            return Ok(AccessDecision {
                allowed: true,
                tier,
                reason: format!("reads of '{}' are unrestricted", name),
            });
        }
        Ok(tier::check_write(name, tier, role, false))
    }

    pub fn entity_count(&self) -> usize {
        self.snapshot().entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.snapshot().relations.len()
    }
}

// --- Helpers ---

fn validate_entity(entity: &Entity) -> Result<(), CarapaceError> {
    if entity.name.trim().is_empty() {
        return Err(CarapaceError::ValidationError(
            "Entity name must not be empty".to_string(),
        ));
    }
    if !VALID_ENTITY_TYPES.contains(&entity.entity_type.as_str()) {
        return Err(CarapaceError::ValidationError(format!(
            "Invalid entityType '{}'. Must be one of: {}",
            entity.entity_type,
            VALID_ENTITY_TYPES.join(", ")
        )));
    }
    Ok(())
}

/// A write must be permitted both on the entity as it is and as it would become,
/// so an agent can neither edit a protected entity nor re-tier an open one upward.
fn deny_transition(
    current: &Entity,
    updated: &Entity,
    role: CallerRole,
    approved: bool,
) -> Option<AccessDecision> {
    let before = tier::check_write(&current.name, current.tier(), role, approved);
    if !before.allowed {
        return Some(before);
    }
    let after_tier = updated.tier();
    if after_tier != current.tier() {
        let after = tier::check_write(&current.name, after_tier, role, approved);
        if !after.allowed {
            return Some(AccessDecision {
                reason: format!("write would re-tier entity: {}", after.reason),
                ..after
            });
        }
    }
    None
}

fn dedupe_in_place(observations: &mut Vec<String>) {
    let mut seen = FxHashSet::default();
    observations.retain(|o| seen.insert(o.clone()));
}

fn view_with_internal_relations(state: &GraphState, entities: Vec<Entity>) -> GraphView {
    let names: FxHashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
    let relations = state
        .relations
        .iter()
        .filter(|r| names.contains(r.from.as_str()) && names.contains(r.to.as_str()))
        .cloned()
        .collect();
    GraphView {
        entities,
        relations,
    }
}

fn log_fingerprint(path: &Path) -> Result<Option<LogFingerprint>, CarapaceError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(LogFingerprint {
            len: meta.len(),
            modified: meta.modified().ok(),
            inode: inode(&meta),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

fn replay_log(path: &Path) -> Result<LogScan, CarapaceError> {
    let mut state = GraphState::default();
    if !path.exists() {
        return Ok(LogScan {
            state,
            records: 0,
            torn_tail: false,
        });
    }
    let content = fs::read_to_string(path)?;
    let ends_with_newline = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut records = 0;
    let mut torn_tail = false;

    for (idx, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => {
                state.apply(record);
                records += 1;
            }
            // Unterminated final line: an append torn by a crash.
            Err(e) if idx + 1 == lines.len() && !ends_with_newline => {
                warn!(line = idx + 1, error = %e, "dropping torn final graph record");
                torn_tail = true;
            }
            Err(e) => {
                return Err(CarapaceError::CorruptLog {
                    line: idx + 1,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(LogScan {
        state,
        records,
        torn_tail,
    })
}

fn append_records(path: &Path, records: &[LogRecord]) -> Result<(), CarapaceError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut w = BufWriter::new(file);
    for record in records {
        writeln!(w, "{}", serde_json::to_string(record)?)?;
    }
    w.flush()?;
    w.get_ref().sync_data()?;
    Ok(())
}

fn write_compacted(path: &Path, state: &GraphState) -> Result<(), CarapaceError> {
    let tmp = path.with_extension("jsonl.compact.tmp");
    {
        let file = File::create(&tmp)?;
        let mut w = BufWriter::new(file);
        for entity in state.sorted_entities() {
            writeln!(
                w,
                "{}",
                serde_json::to_string(&LogRecord::Entity(entity.clone()))?
            )?;
        }
        for relation in &state.relations {
            writeln!(
                w,
                "{}",
                serde_json::to_string(&LogRecord::Relation(relation.clone()))?
            )?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "graph",
        "version": "0.3.0",
        "description": "Tier-protected knowledge graph over an append-only JSONL log",
        "commands": [
            { "name": "create", "parameters": ["name", "kind", "obs", "role", "approved"] },
            { "name": "observe", "parameters": ["name", "obs", "role", "approved"] },
            { "name": "forget", "parameters": ["name", "obs", "role", "approved"] },
            { "name": "delete", "parameters": ["name", "role", "approved"] },
            { "name": "relate", "parameters": ["from", "to", "kind"] },
            { "name": "unrelate", "parameters": ["from", "to", "kind"] },
            { "name": "search", "parameters": ["query"] },
            { "name": "get", "parameters": ["name"] },
            { "name": "tier", "parameters": ["tier"] },
            { "name": "read", "parameters": [] },
            { "name": "access", "parameters": ["name", "op", "role"] },
            { "name": "compact", "parameters": [] }
        ],
        "entity_types": VALID_ENTITY_TYPES,
        "storage": ["graph.jsonl"]
    })
}
