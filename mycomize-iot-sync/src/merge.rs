//! Merges pushed gateway events into the engine's remote entity lists.
//!
//! Added entities are appended once (duplicates are no-ops). A removed
//! entity also takes its local record with it, since that record is orphaned
//! by definition. Both recompute the gateway's partitions.

use crate::connection::GatewayEventEnvelope;
use crate::engine::{GatewaySync, SyncState};
use crate::types::{GatewayEvent, RecordId};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

/// Drains the subscription channel into the engine state.
pub struct EventMerger {
    state: Arc<RwLock<SyncState>>,
    events: mpsc::Receiver<GatewayEventEnvelope>,
}

impl EventMerger {
    pub(crate) fn new(
        state: Arc<RwLock<SyncState>>,
        events: mpsc::Receiver<GatewayEventEnvelope>,
    ) -> Self {
        Self { state, events }
    }

    /// Runs until the engine and every subscription are gone.
    pub async fn run(mut self) {
        info!("event merge started");
        while let Some(envelope) = self.events.recv().await {
            self.state
                .write()
                .await
                .apply_event(envelope.gateway_id, envelope.event);
        }
        info!("event merge stopped");
    }
}

impl GatewaySync {
    /// Applies one pushed event. Returns true when partitions changed.
    pub async fn apply_event(&self, gateway_id: RecordId, event: GatewayEvent) -> bool {
        self.state.write().await.apply_event(gateway_id, event)
    }
}

impl SyncState {
    fn apply_event(&mut self, gateway_id: RecordId, event: GatewayEvent) -> bool {
        let Some(session) = self.sessions.get_mut(&gateway_id) else {
            debug!("dropping event for unknown gateway {gateway_id}");
            return false;
        };

        match event {
            GatewayEvent::Added(entity) => {
                if session.remote.iter().any(|e| e.entity_id == entity.entity_id) {
                    return false;
                }
                debug!("entity {} added on gateway {gateway_id}", entity.entity_id);
                session.remote.push(entity);
            }
            GatewayEvent::Removed { entity_id } => {
                let before = session.remote.len();
                session.remote.retain(|e| e.entity_id != entity_id);
                let removed_remote = session.remote.len() != before;
                let removed_record = self.records.remove(gateway_id, &entity_id).is_some();
                if !removed_remote && !removed_record {
                    return false;
                }
                debug!("entity {entity_id} removed from gateway {gateway_id}");
            }
        }

        self.recompute(gateway_id);
        true
    }
}
