use std::collections::BTreeSet;
use std::fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::git::Git;
use crate::item::{id_ordinal, id_section, parse_item_state, Item, ItemState};
use crate::lock;
use crate::store::{self, Index, IndexEntry, Store};
use crate::{log_info, log_warn};

// --- Diagnostics ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedItem,
    UnknownState,
    StateArtifactMismatch,
    IndexDrift,
    OrphanBranch,
    MissingBranch,
    StaleLock,
    OrdinalGap,
    DirtyTree,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Item id, or "index" for repository-wide problems.
    pub location: String,
    pub kind: DiagnosticKind,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct FixResult {
    pub diagnostic: Diagnostic,
    pub action: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixOptions {
    /// Orphan branches are destructive to delete; off by default.
    pub delete_orphan_branches: bool,
}

/// One line of healing-log.jsonl. This log feeds the prompt-evolution
/// collaborator, so the shape is part of the external contract.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealingRecord {
    #[serde(with = "crate::item::timestamp")]
    pub timestamp: DateTime<Utc>,
    pub diagnostic: String,
    pub action: String,
    pub outcome: String,
}

// --- Diagnosis ---

/// Scan the repository for invariant violations. Read-only: diagnosis
/// never mutates state.
pub fn diagnose(store: &Store, git: &Git, config: &Config) -> Result<Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();

    let disk_ids = store.scan_item_ids()?;
    let index = store.load_index()?;

    for id in &disk_ids {
        diagnose_item(store, git, id, &mut diagnostics);
    }

    diagnose_index(&disk_ids, &index, store, &mut diagnostics);
    diagnose_branches(&disk_ids, store, git, config, &mut diagnostics);
    diagnose_ordinals(&disk_ids, &mut diagnostics);

    Ok(diagnostics)
}

fn diagnose_item(store: &Store, git: &Git, id: &str, out: &mut Vec<Diagnostic>) {
    // Stale per-item lock, regardless of record health
    let lock_path = store.item_lock_path(id);
    if lock_path.exists() && lock::is_stale(&lock_path) {
        out.push(Diagnostic {
            severity: Severity::Warning,
            location: id.to_string(),
            kind: DiagnosticKind::StaleLock,
            description: format!(
                "Lock held by dead pid {:?}",
                lock::read_pid_stamp(&lock_path)
            ),
        });
    }

    let record_path = store.item_dir(id).join(store::ITEM_JSON);
    let raw = match fs::read_to_string(&record_path) {
        Ok(raw) => raw,
        Err(_) => {
            out.push(Diagnostic {
                severity: Severity::Error,
                location: id.to_string(),
                kind: DiagnosticKind::MalformedItem,
                description: "item.json is missing".to_string(),
            });
            return;
        }
    };

    let item: Item = match serde_json::from_str(&raw) {
        Ok(item) => item,
        Err(e) => {
            // Distinguish an unknown state value from general corruption
            let state_problem = serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.get("state").and_then(|s| s.as_str()).map(String::from))
                .filter(|s| parse_item_state(s).is_err());
            match state_problem {
                Some(state) => out.push(Diagnostic {
                    severity: Severity::Error,
                    location: id.to_string(),
                    kind: DiagnosticKind::UnknownState,
                    description: format!("item.json has unknown state '{}'", state),
                }),
                None => out.push(Diagnostic {
                    severity: Severity::Error,
                    location: id.to_string(),
                    kind: DiagnosticKind::MalformedItem,
                    description: format!("item.json is malformed: {}", e),
                }),
            }
            return;
        }
    };

    // State-artifact correspondence
    let evidence = evidence_state(store, &item);
    if state_exceeds_evidence(item.state, evidence) {
        out.push(Diagnostic {
            severity: Severity::Error,
            location: id.to_string(),
            kind: DiagnosticKind::StateArtifactMismatch,
            description: format!(
                "state is {} but artifacts only support {}",
                item.state, evidence
            ),
        });
    }

    // Dirty tree under the item directory is only legitimate mid-implement
    if item.state != ItemState::Implementing {
        let rel = format!("{}/items/{}", store::STORE_DIR, id);
        if let Ok(entries) = git.status_under(&rel) {
            if !entries.is_empty() {
                out.push(Diagnostic {
                    severity: Severity::Warning,
                    location: id.to_string(),
                    kind: DiagnosticKind::DirtyTree,
                    description: format!(
                        "{} uncommitted change(s) under item directory in state {}",
                        entries.len(),
                        item.state
                    ),
                });
            }
        }
    }
}

fn diagnose_index(disk_ids: &[String], index: &Index, store: &Store, out: &mut Vec<Diagnostic>) {
    let disk: BTreeSet<&str> = disk_ids.iter().map(|s| s.as_str()).collect();

    for id in disk_ids {
        match index.items.get(id) {
            None => out.push(Diagnostic {
                severity: Severity::Warning,
                location: "index".to_string(),
                kind: DiagnosticKind::IndexDrift,
                description: format!("item {} is missing from the index", id),
            }),
            Some(entry) => {
                if let Ok(item) = store.load_item(id) {
                    if entry.state != item.state {
                        out.push(Diagnostic {
                            severity: Severity::Warning,
                            location: "index".to_string(),
                            kind: DiagnosticKind::IndexDrift,
                            description: format!(
                                "index says {} is {} but the record says {}",
                                id, entry.state, item.state
                            ),
                        });
                    }
                }
            }
        }
    }

    for id in index.items.keys() {
        if !disk.contains(id.as_str()) {
            out.push(Diagnostic {
                severity: Severity::Warning,
                location: "index".to_string(),
                kind: DiagnosticKind::IndexDrift,
                description: format!("index entry {} has no item directory", id),
            });
        }
    }
}

fn diagnose_branches(
    disk_ids: &[String],
    store: &Store,
    git: &Git,
    config: &Config,
    out: &mut Vec<Diagnostic>,
) {
    if !git.is_repo() {
        return;
    }

    for id in disk_ids {
        let item = match store.load_item(id) {
            Ok(item) => item,
            Err(_) => continue, // already reported as malformed
        };
        let branch = config.branch_for(id);
        let exists = git.branch_exists(&branch);

        if exists && !item.state.has_branch() {
            out.push(Diagnostic {
                severity: Severity::Warning,
                location: id.to_string(),
                kind: DiagnosticKind::OrphanBranch,
                description: format!("branch {} exists but item is {}", branch, item.state),
            });
        }

        let needs_branch = matches!(
            item.state,
            ItemState::Implementing | ItemState::Critique | ItemState::InPr
        );
        if needs_branch && !exists {
            out.push(Diagnostic {
                severity: Severity::Error,
                location: id.to_string(),
                kind: DiagnosticKind::MissingBranch,
                description: format!("item is {} but branch {} is missing", item.state, branch),
            });
        }
    }
}

/// Ordinal gaps are informational only: deletion legitimately leaves holes
/// and the allocator never backfills them.
fn diagnose_ordinals(disk_ids: &[String], out: &mut Vec<Diagnostic>) {
    let mut sections: BTreeSet<&str> = BTreeSet::new();
    for id in disk_ids {
        if let Some(section) = id_section(id) {
            sections.insert(section);
        }
    }

    for section in sections {
        let mut ordinals: Vec<u32> = disk_ids
            .iter()
            .filter(|id| id_section(id) == Some(section))
            .filter_map(|id| id_ordinal(id))
            .collect();
        ordinals.sort_unstable();
        for pair in ordinals.windows(2) {
            if pair[1] > pair[0] + 1 {
                out.push(Diagnostic {
                    severity: Severity::Info,
                    location: "index".to_string(),
                    kind: DiagnosticKind::OrdinalGap,
                    description: format!(
                        "section '{}' skips ordinals {}..{}",
                        section,
                        pair[0] + 1,
                        pair[1] - 1
                    ),
                });
            }
        }
    }
}

// --- Evidence ---

/// The highest state the on-disk artifacts can justify. The doctor never
/// advances an item beyond what it can prove.
pub fn evidence_state(store: &Store, item: &Item) -> ItemState {
    let id = &item.id;
    let has_research = store.artifact_exists(id, store::RESEARCH_MD);
    let has_plan =
        store.artifact_exists(id, store::PLAN_MD) && store.artifact_exists(id, store::PRD_JSON);

    if item.pr_number.is_some() && item.branch_name.is_some() && has_plan {
        // PR state can only be confirmed by record fields; keep whichever
        // of the PR-adjacent states the record claims
        return match item.state {
            ItemState::Merged | ItemState::Done => item.state,
            _ => ItemState::InPr,
        };
    }
    if has_plan {
        return ItemState::Planned;
    }
    if has_research {
        return ItemState::Researched;
    }
    ItemState::Idea
}

fn state_exceeds_evidence(state: ItemState, evidence: ItemState) -> bool {
    rank(state) > rank(evidence)
}

/// Coarse progression rank for evidence comparison. In-flight states rank
/// with the completed state below them (researching holds no more evidence
/// than idea).
fn rank(state: ItemState) -> u8 {
    match state {
        ItemState::Idea | ItemState::Researching | ItemState::Abandoned => 0,
        ItemState::Researched | ItemState::Planning => 1,
        ItemState::Planned | ItemState::Implementing | ItemState::Critique => 2,
        ItemState::InPr => 3,
        ItemState::Merged => 4,
        ItemState::Done => 5,
    }
}

// --- Fixes ---

/// Apply idempotent per-diagnostic repairs. Every fix appends a structured
/// record to healing-log.jsonl, including skipped destructive ones.
pub fn apply_fixes(
    store: &Store,
    git: &Git,
    config: &Config,
    diagnostics: &[Diagnostic],
    options: FixOptions,
) -> Result<Vec<FixResult>> {
    let mut results = Vec::new();
    let mut index_rebuilt = false;

    for diagnostic in diagnostics {
        let (action, outcome) = match diagnostic.kind {
            DiagnosticKind::IndexDrift => {
                if index_rebuilt {
                    ("rebuild_index".to_string(), "already rebuilt".to_string())
                } else {
                    index_rebuilt = true;
                    match rebuild_index(store) {
                        Ok(count) => (
                            "rebuild_index".to_string(),
                            format!("rebuilt with {} entries", count),
                        ),
                        Err(e) => ("rebuild_index".to_string(), format!("failed: {}", e)),
                    }
                }
            }
            DiagnosticKind::StateArtifactMismatch => {
                match reset_state_to_evidence(store, &diagnostic.location) {
                    Ok(state) => (
                        "reset_state".to_string(),
                        format!("reset to {}", state),
                    ),
                    Err(e) => ("reset_state".to_string(), format!("failed: {}", e)),
                }
            }
            DiagnosticKind::UnknownState => {
                match repair_unknown_state(store, &diagnostic.location) {
                    Ok(state) => (
                        "reset_state".to_string(),
                        format!("rewrote unknown state to {}", state),
                    ),
                    Err(e) => ("reset_state".to_string(), format!("failed: {}", e)),
                }
            }
            DiagnosticKind::StaleLock => {
                let lock_path = store.item_lock_path(&diagnostic.location);
                let pid_path = lock::pid_path_for(&lock_path);
                let removed = fs::remove_file(&lock_path).is_ok();
                let _ = fs::remove_file(&pid_path);
                (
                    "remove_stale_lock".to_string(),
                    if removed {
                        "removed".to_string()
                    } else {
                        "already gone".to_string()
                    },
                )
            }
            DiagnosticKind::OrphanBranch => {
                let branch = config.branch_for(&diagnostic.location);
                if options.delete_orphan_branches {
                    match git.delete_branch(&branch) {
                        Ok(()) => ("delete_branch".to_string(), format!("deleted {}", branch)),
                        Err(e) => ("delete_branch".to_string(), format!("failed: {}", e)),
                    }
                } else {
                    (
                        "delete_branch".to_string(),
                        "skipped (pass --delete-orphan-branches to enable)".to_string(),
                    )
                }
            }
            DiagnosticKind::DirtyTree => {
                let label = format!("wreckit-doctor: {}", diagnostic.location);
                match git.stash_push(&label) {
                    Ok(()) => ("stash_dirty_tree".to_string(), format!("stashed as '{}'", label)),
                    Err(e) => ("stash_dirty_tree".to_string(), format!("failed: {}", e)),
                }
            }
            DiagnosticKind::MalformedItem => (
                "none".to_string(),
                "cannot repair automatically; restore item.json from git history".to_string(),
            ),
            DiagnosticKind::MissingBranch => (
                "none".to_string(),
                "cannot repair automatically; re-run the implement phase".to_string(),
            ),
            DiagnosticKind::OrdinalGap => ("none".to_string(), "informational".to_string()),
        };

        let record = HealingRecord {
            timestamp: Utc::now(),
            diagnostic: format!(
                "{:?}@{}: {}",
                diagnostic.kind, diagnostic.location, diagnostic.description
            ),
            action: action.clone(),
            outcome: outcome.clone(),
        };
        if let Err(e) = store.append_healing_record(&record) {
            log_warn!("Warning: Failed to append healing record: {}", e);
        }

        log_info!(
            "[doctor] {:?}@{}: {} -> {}",
            diagnostic.kind,
            diagnostic.location,
            action,
            outcome
        );

        results.push(FixResult {
            diagnostic: diagnostic.clone(),
            action,
            outcome,
        });
    }

    Ok(results)
}

/// Rebuild index.json from scratch by scanning every item directory.
fn rebuild_index(store: &Store) -> Result<usize> {
    let _lock = store.acquire_index_lock()?;
    let mut index = Index::default();
    for id in store.scan_item_ids()? {
        match store.load_item(&id) {
            Ok(item) => {
                index.items.insert(
                    id,
                    IndexEntry {
                        state: item.state,
                        section: item.section,
                        title: item.title,
                    },
                );
            }
            Err(e) => {
                log_warn!("[doctor] Skipping {} during index rebuild: {}", id, e);
            }
        }
    }
    let count = index.items.len();
    store.save_index(&index)?;
    Ok(count)
}

/// Rewrite an unparseable `state` field in place, then reset to evidence.
///
/// The record cannot be deserialized as an `Item` until the state string is
/// legal again, so this edits the raw JSON first.
fn repair_unknown_state(store: &Store, id: &str) -> Result<ItemState> {
    let _lock = store.acquire_item_lock(id)?;
    let path = store.item_dir(id).join(store::ITEM_JSON);
    let raw = fs::read_to_string(&path).map_err(|e| crate::error::WreckitError::io(&path, e))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| crate::error::WreckitError::InvalidJson {
            path: path.clone(),
            detail: e.to_string(),
        })?;
    value["state"] = serde_json::Value::String(ItemState::Idea.as_str().to_string());
    crate::store::atomic_write_json(&path, &value)?;

    drop(_lock);
    reset_state_to_evidence(store, id)
}

/// Reset an item's state to the highest value its artifacts support.
fn reset_state_to_evidence(store: &Store, id: &str) -> Result<ItemState> {
    let _lock = store.acquire_item_lock(id)?;
    let mut item = store.load_item(id)?;
    let evidence = evidence_state(store, &item);
    if item.state != evidence {
        // Direct assignment: the repair path deliberately bypasses the
        // transition table, which has no edges for corrupt states
        item.state = evidence;
        item.updated_at = Utc::now();
        store.save_item(&item)?;
    }
    Ok(evidence)
}
