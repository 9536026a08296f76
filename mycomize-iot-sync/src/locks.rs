//! Per-entity mutation serialization.
//!
//! A second mutation on the same `(gateway_id, entity_id)` waits until the
//! first has settled (confirmed or rolled back) before applying its own
//! optimistic change.

use crate::types::RecordId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

type EntityKey = (RecordId, String);

#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<EntityKey, Arc<TokioMutex<()>>>>,
}

/// Guards held for the duration of one mutation.
#[derive(Debug)]
pub struct MutationGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, gateway_id: RecordId, entity_id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Idle locks are pruned opportunistically.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry((gateway_id, entity_id.to_string()))
            .or_default()
            .clone()
    }

    /// Acquires the locks of every entity, in sorted order so overlapping
    /// bulk mutations cannot deadlock.
    pub async fn acquire(&self, gateway_id: RecordId, entity_ids: &[String]) -> MutationGuard {
        let mut sorted: Vec<&String> = entity_ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for entity_id in sorted {
            let lock = self.lock_for(gateway_id, entity_id);
            guards.push(lock.lock_owned().await);
        }
        MutationGuard { _guards: guards }
    }
}
