//! Gateway sync engine: single owner of all reconciliation state.
//!
//! The engine ties together:
//! - Remote entity fetching (guarded by the credential cache)
//! - Local record loading (guarded by the fetch markers)
//! - Reconciliation, republished to watchers after every change
//! - Gateway provisioning, orphan cleanup and broad teardown
//!
//! Optimistic mutations live in `operations`, event merging in `merge`.
//! State is mutated only under the write lock and never across an await.

use crate::backend::{EntityBackend, GatewayApi};
use crate::config::SyncConfig;
use crate::connection::{ConnectionRegistry, GatewayEventEnvelope};
use crate::credential_cache::{CredentialCache, FetchMarkers};
use crate::error::{IotError, IotResult};
use crate::locks::EntityLocks;
use crate::merge::EventMerger;
use crate::pending::PendingLinks;
use crate::reconcile;
use crate::store::RecordStore;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

/// Live view of one gateway: its remote entities and published partitions.
pub(crate) struct GatewaySession {
    pub(crate) remote: Vec<RemoteEntity>,
    result: watch::Sender<SyncResult>,
}

impl GatewaySession {
    fn new() -> Self {
        let (result, _) = watch::channel(SyncResult::default());
        Self {
            remote: Vec::new(),
            result,
        }
    }
}

/// Everything the engine mutates.
#[derive(Default)]
pub(crate) struct SyncState {
    pub(crate) sessions: HashMap<RecordId, GatewaySession>,
    pub(crate) records: RecordStore,
    pub(crate) credentials: CredentialCache,
    pub(crate) fetched: FetchMarkers,
    /// Link intents for the unsaved gateway.
    pub(crate) pending: PendingLinks,
}

impl SyncState {
    /// Recomputes the partitions for a gateway and publishes them.
    pub(crate) fn recompute(&mut self, gateway_id: RecordId) -> SyncResult {
        let session = self
            .sessions
            .entry(gateway_id)
            .or_insert_with(GatewaySession::new);
        let result = reconcile::compute(
            &session.remote,
            self.records.records(gateway_id),
            gateway_id.is_unsaved(),
        );
        session.result.send_replace(result.clone());
        result
    }

    pub(crate) fn is_known(&self, gateway_id: RecordId) -> bool {
        self.sessions.contains_key(&gateway_id)
    }

    fn snapshot(&self, gateway_id: RecordId) -> Option<SyncResult> {
        self.sessions
            .get(&gateway_id)
            .map(|session| session.result.borrow().clone())
    }

    fn clear(&mut self) {
        self.sessions.clear();
        self.records.clear();
        self.credentials.clear();
        self.fetched.clear();
        self.pending.clear();
    }
}

/// Reconciliation and sync core for gateway entities. Cheap to clone.
#[derive(Clone)]
pub struct GatewaySync {
    pub(crate) backend: Arc<dyn EntityBackend>,
    pub(crate) gateway_api: Arc<dyn GatewayApi>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) state: Arc<RwLock<SyncState>>,
    pub(crate) locks: Arc<EntityLocks>,
    events_tx: mpsc::Sender<GatewayEventEnvelope>,
}

/// Creates the sync engine and the event merger feeding it.
///
/// The merger must be driven (`tokio::spawn(merger.run())`) for pushed
/// gateway events to reach the engine. Pushed events are buffered up to
/// `config.event_channel_capacity`.
pub fn create_gateway_sync(
    config: &SyncConfig,
    backend: Arc<dyn EntityBackend>,
    gateway_api: Arc<dyn GatewayApi>,
    connections: Arc<ConnectionRegistry>,
) -> (GatewaySync, EventMerger) {
    let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity.max(1));
    let sync = GatewaySync {
        backend,
        gateway_api,
        connections,
        state: Arc::new(RwLock::new(SyncState::default())),
        locks: Arc::new(EntityLocks::new()),
        events_tx,
    };
    let merger = EventMerger::new(sync.state.clone(), events_rx);
    (sync, merger)
}

impl GatewaySync {
    /// Watches the partitions of a gateway. Every recompute is published.
    pub async fn subscribe(&self, gateway_id: RecordId) -> watch::Receiver<SyncResult> {
        let mut state = self.state.write().await;
        if !state.is_known(gateway_id) {
            state.recompute(gateway_id);
        }
        match state.sessions.get(&gateway_id) {
            Some(session) => session.result.subscribe(),
            None => watch::channel(SyncResult::default()).1,
        }
    }

    /// Current partitions of a gateway (empty when unknown).
    pub async fn current(&self, gateway_id: RecordId) -> SyncResult {
        self.state
            .read()
            .await
            .snapshot(gateway_id)
            .unwrap_or_default()
    }

    pub async fn remote_entities(&self, gateway_id: RecordId) -> Vec<RemoteEntity> {
        self.state
            .read()
            .await
            .sessions
            .get(&gateway_id)
            .map(|session| session.remote.clone())
            .unwrap_or_default()
    }

    pub async fn local_records(&self, gateway_id: RecordId) -> Vec<LocalEntityRecord> {
        self.state.read().await.records.records(gateway_id).to_vec()
    }

    /// Returns true when credentials differ from the last fetch.
    pub async fn credentials_changed(&self, gateway: &Gateway) -> bool {
        self.state.read().await.credentials.has_changed(gateway)
    }

    /// Pulls the live entity list from the gateway.
    ///
    /// Skipped (returns `Ok(false)`) when not forced, the gateway is durable
    /// and its credentials are unchanged. On failure the held list is left
    /// untouched.
    pub async fn fetch(&self, gateway: &Gateway, force_refresh: bool) -> IotResult<bool> {
        let skip = !force_refresh
            && !gateway.is_unsaved()
            && !self.state.read().await.credentials.has_changed(gateway);
        if skip {
            debug!("credentials unchanged for gateway {}, skipping fetch", gateway.id);
            return Ok(false);
        }

        let credentials = gateway.credentials();
        let entities = self
            .gateway_api
            .fetch_entities(&credentials)
            .await
            .inspect_err(|e| warn!("entity fetch failed for gateway {}: {e}", gateway.id))?;

        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state
                .sessions
                .entry(gateway.id)
                .or_insert_with(GatewaySession::new)
                .remote = entities;
            state.credentials.update(gateway);
            state.recompute(gateway.id);
        }

        if !gateway.is_unsaved() {
            self.connections
                .ensure(gateway.id, credentials, self.events_tx.clone())
                .await;
        }
        Ok(true)
    }

    /// Loads the backend's entity records for a durable gateway, at most once
    /// per session unless forced.
    pub async fn load_records(&self, gateway: &Gateway, force_refresh: bool) -> IotResult<bool> {
        if gateway.is_unsaved() {
            return Ok(false);
        }
        if !self
            .state
            .read()
            .await
            .fetched
            .needs_fetch(gateway.id, force_refresh)
        {
            debug!("records already loaded for gateway {}", gateway.id);
            return Ok(false);
        }

        let records = match self.backend.fetch_entities(gateway.id).await {
            Ok(records) => records,
            Err(e) => return Err(self.escalate(e).await),
        };

        let mut state = self.state.write().await;
        debug!("loaded {} records for gateway {}", records.len(), gateway.id);
        state.records.replace(gateway.id, records);
        state.fetched.mark(gateway.id);
        state.recompute(gateway.id);
        Ok(true)
    }

    /// Fetches remote entities and local records, then reports counts.
    pub async fn sync(&self, gateway: &Gateway, force_refresh: bool) -> IotResult<SyncResult> {
        self.fetch(gateway, force_refresh).await?;
        self.load_records(gateway, force_refresh).await?;
        if !gateway.is_unsaved() {
            self.publish_counts(gateway.id).await?;
        }
        Ok(self.current(gateway.id).await)
    }

    /// Moves the unsaved draft onto a newly created gateway record.
    ///
    /// Creates durable records for every entity fetched for the draft,
    /// commits the pending-link buffer against them and subscribes to the
    /// gateway's events. A failed commit keeps the buffer for a retry via
    /// `commit_pending`.
    pub async fn provision_gateway(&self, gateway: &Gateway) -> IotResult<CommitReport> {
        if gateway.is_unsaved() {
            return Err(IotError::GatewayNotFound(gateway.id));
        }

        let remote = self.remote_entities(RecordId::UNSAVED).await;
        let specs: Vec<EntityCreateSpec> = remote.iter().map(EntityCreateSpec::from).collect();
        let outcome = if specs.is_empty() {
            BulkCreateOutcome::default()
        } else {
            match self.backend.bulk_create(gateway.id, &specs).await {
                Ok(outcome) => outcome,
                Err(e) => return Err(self.escalate(e).await),
            }
        };
        info!(
            "provisioned {} entity records for gateway {}",
            outcome.records.len(),
            gateway.id
        );

        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.sessions.remove(&RecordId::UNSAVED);
            state.records.drop_gateway(RecordId::UNSAVED);
            state.credentials.remove(RecordId::UNSAVED);

            state.records.replace(gateway.id, outcome.records);
            state.fetched.mark(gateway.id);
            state.credentials.update(gateway);
            state
                .sessions
                .entry(gateway.id)
                .or_insert_with(GatewaySession::new)
                .remote = remote;
            state.recompute(gateway.id);
        }

        self.connections
            .ensure(gateway.id, gateway.credentials(), self.events_tx.clone())
            .await;

        let report = self.commit_pending(gateway.id).await?;
        self.publish_counts(gateway.id).await?;
        Ok(report)
    }

    /// Creates durable records for the gateway's current new entities.
    pub async fn persist_new_entities(&self, gateway_id: RecordId) -> IotResult<usize> {
        if gateway_id.is_unsaved() {
            return Err(IotError::GatewayNotFound(gateway_id));
        }
        let new_entities = self.current(gateway_id).await.new_entities;
        if new_entities.is_empty() {
            return Ok(0);
        }

        let specs: Vec<EntityCreateSpec> = new_entities.iter().map(EntityCreateSpec::from).collect();
        let outcome = match self.backend.bulk_create(gateway_id, &specs).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.escalate(e).await),
        };

        let created = outcome.records.len();
        {
            let mut state = self.state.write().await;
            if !state.is_known(gateway_id) {
                debug!("gateway {gateway_id} forgotten while persisting entities");
                return Ok(created);
            }
            for record in outcome.records {
                state.records.upsert(gateway_id, record);
            }
            state.recompute(gateway_id);
        }
        self.publish_counts(gateway_id).await?;
        Ok(created)
    }

    /// Deletes the backend records of the gateway's orphaned entities.
    pub async fn delete_orphans(&self, gateway_id: RecordId) -> IotResult<usize> {
        let orphans = self.current(gateway_id).await.orphaned_entities;
        let ids: Vec<i64> = orphans.iter().filter_map(|r| r.id.durable()).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.backend.bulk_delete(gateway_id, &ids).await {
            return Err(self.escalate(e).await);
        }

        let mut state = self.state.write().await;
        if state.is_known(gateway_id) {
            for orphan in &orphans {
                state.records.remove(gateway_id, &orphan.entity_id);
            }
            state.recompute(gateway_id);
        }
        info!("deleted {} orphaned records for gateway {gateway_id}", ids.len());
        Ok(ids.len())
    }

    /// Sends the linked/linkable counts to the gateway record.
    ///
    /// Ordinary failures are logged and swallowed. `Unauthorized` ends the
    /// session and is returned.
    pub async fn publish_counts(&self, gateway_id: RecordId) -> IotResult<()> {
        if gateway_id.is_unsaved() {
            return Ok(());
        }
        let counts = self.current(gateway_id).await.counts();
        match self.backend.update_counts(gateway_id, counts).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_unauthorized() => Err(self.escalate(e).await),
            Err(e) => {
                warn!("failed to update entity counts for gateway {gateway_id}: {e}");
                Ok(())
            }
        }
    }

    /// Drops every trace of a gateway: records, cached credentials, fetch
    /// marker, pending links and its event subscription. In-flight mutations
    /// that settle afterwards find the gateway unknown and skip rollback.
    pub async fn forget_gateway(&self, gateway_id: RecordId) {
        {
            let mut state = self.state.write().await;
            state.sessions.remove(&gateway_id);
            state.records.drop_gateway(gateway_id);
            state.credentials.remove(gateway_id);
            state.fetched.unmark(gateway_id);
            if gateway_id.is_unsaved() {
                state.pending.clear();
            }
        }
        self.connections.disconnect(gateway_id).await;
        info!("forgot gateway {gateway_id}");
    }

    /// Ends the session after the backend rejected it.
    pub async fn end_session(&self) {
        warn!("ending gateway sync session");
        self.state.write().await.clear();
        self.connections.disconnect_all().await;
    }

    /// Ends the session when `error` is the terminal auth condition.
    pub(crate) async fn escalate(&self, error: IotError) -> IotError {
        if error.is_unauthorized() {
            self.end_session().await;
        }
        error
    }
}
