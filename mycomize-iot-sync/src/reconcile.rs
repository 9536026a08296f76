//! Set reconciliation between live gateway entities and local records.
//!
//! `compute` is pure: the same inputs always yield the same [`SyncResult`].
//! Matching is by exact, case-sensitive `entity_id` equality.

use crate::types::{LocalEntityRecord, RemoteEntity, SyncResult};
use std::collections::{HashMap, HashSet};

/// Partitions remote entities and local records into new, orphaned,
/// linkable and linked sets.
pub fn compute(
    remote: &[RemoteEntity],
    local: &[LocalEntityRecord],
    is_unsaved_gateway: bool,
) -> SyncResult {
    if is_unsaved_gateway || local.is_empty() {
        compute_provisional(remote, local)
    } else {
        compute_durable(remote, local)
    }
}

/// Unsaved gateway (or nothing persisted yet): there can be no orphans, and
/// existing local records are optimistic pseudo-records kept as they are.
fn compute_provisional(remote: &[RemoteEntity], local: &[LocalEntityRecord]) -> SyncResult {
    let known: HashSet<&str> = local.iter().map(|r| r.entity_id.as_str()).collect();

    let new_entities: Vec<RemoteEntity> = remote
        .iter()
        .filter(|entity| !known.contains(entity.entity_id.as_str()))
        .cloned()
        .collect();

    let (linked_entities, unassigned): (Vec<_>, Vec<_>) =
        local.iter().cloned().partition(LocalEntityRecord::is_linked);

    let linkable_entities = new_entities
        .iter()
        .map(LocalEntityRecord::pseudo)
        .chain(unassigned)
        .collect();

    SyncResult {
        new_entities,
        orphaned_entities: Vec::new(),
        linkable_entities,
        linked_entities,
    }
}

fn compute_durable(remote: &[RemoteEntity], local: &[LocalEntityRecord]) -> SyncResult {
    let remote_by_id: HashMap<&str, &RemoteEntity> =
        remote.iter().map(|e| (e.entity_id.as_str(), e)).collect();
    let local_by_id: HashMap<&str, &LocalEntityRecord> =
        local.iter().map(|r| (r.entity_id.as_str(), r)).collect();

    let new_entities: Vec<RemoteEntity> = remote
        .iter()
        .filter(|entity| !local_by_id.contains_key(entity.entity_id.as_str()))
        .cloned()
        .collect();

    let (existing, orphaned_entities): (Vec<_>, Vec<_>) = local
        .iter()
        .cloned()
        .partition(|record| remote_by_id.contains_key(record.entity_id.as_str()));

    let (linked_entities, unassigned): (Vec<_>, Vec<_>) =
        existing.into_iter().partition(LocalEntityRecord::is_linked);

    let linkable_entities = new_entities
        .iter()
        .map(LocalEntityRecord::pseudo)
        .chain(unassigned)
        .collect();

    SyncResult {
        new_entities,
        orphaned_entities,
        linkable_entities,
        linked_entities,
    }
}
