//! Shared test doubles for the backend, the gateway and its event stream.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use mycomize_iot_sync::backend::{EntityBackend, EventStream, EventStreamConnector, GatewayApi};
use mycomize_iot_sync::{
    Assignment, BulkCreateOutcome, ConnectionRegistry, EntityCreateSpec, Gateway, GatewayCounts,
    GatewayCredentials, GatewayEvent, GatewaySync, IotError, IotResult, LocalEntityRecord,
    ReconnectPolicy, RecordId, RemoteEntity, Stage, SyncConfig, create_gateway_sync,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};

// ── Fixtures ────────────────────────────────────────────────────

pub const GW: RecordId = RecordId::new(7);

pub fn remote(entity_id: &str) -> RemoteEntity {
    let mut attributes = Map::new();
    attributes.insert(
        "friendly_name".into(),
        Value::String(format!("{entity_id} name")),
    );
    RemoteEntity {
        entity_id: entity_id.to_string(),
        state: "on".to_string(),
        attributes,
        last_changed: Utc::now(),
        last_updated: Utc::now(),
    }
}

pub fn record(
    id: i64,
    gateway_id: RecordId,
    entity_id: &str,
    assignment: Option<Assignment>,
) -> LocalEntityRecord {
    let mut record = LocalEntityRecord::pseudo(&remote(entity_id));
    record.id = RecordId::new(id);
    record.gateway_id = gateway_id;
    record.assignment = assignment;
    record
}

pub fn gateway(id: RecordId) -> Gateway {
    Gateway {
        id,
        name: "fruiting tent".to_string(),
        gateway_type: "home_assistant".to_string(),
        api_url: "http://ha.local:8123".to_string(),
        api_key: "key-1".to_string(),
    }
}

pub fn draft_gateway() -> Gateway {
    Gateway::unsaved("fruiting tent", "http://ha.local:8123", "key-1")
}

pub fn fruiting(grow_id: i64) -> Assignment {
    Assignment::new(grow_id, Stage::Fruiting)
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay_ms: 5,
        max_delay_ms: 20,
        max_attempts: 3,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mycomize_iot_sync=debug")
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ── Mock Backend ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum BackendCall {
    FetchEntities(RecordId),
    BulkCreate(RecordId, Vec<String>),
    BulkDelete(RecordId, Vec<i64>),
    Link(RecordId, i64, i64, Stage),
    Unlink(RecordId, i64),
    BulkLink(RecordId, Vec<i64>, i64, Stage),
    BulkUnlink(RecordId, Vec<i64>),
    UpdateCounts(RecordId, GatewayCounts),
}

impl BackendCall {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            BackendCall::Link(..)
                | BackendCall::Unlink(..)
                | BackendCall::BulkLink(..)
                | BackendCall::BulkUnlink(..)
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Failure {
    Api,
    Unauthorized,
}

impl Failure {
    fn into_error(self) -> IotError {
        match self {
            Failure::Api => IotError::Api("injected failure".to_string()),
            Failure::Unauthorized => IotError::Unauthorized,
        }
    }
}

pub struct MockBackend {
    records: Mutex<HashMap<RecordId, Vec<LocalEntityRecord>>>,
    calls: Mutex<Vec<BackendCall>>,
    /// Failures keyed by call name ("link", "bulk_create", ...).
    failures: Mutex<HashMap<&'static str, Failure>>,
    /// Entity ids bulk-create silently skips.
    skip_create: Mutex<HashSet<String>>,
    next_id: AtomicI64,
    held: AtomicBool,
    release: Notify,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            skip_create: Mutex::new(HashSet::new()),
            next_id: AtomicI64::new(1001),
            held: AtomicBool::new(false),
            release: Notify::new(),
        }
    }

    pub async fn seed(&self, gateway_id: RecordId, records: Vec<LocalEntityRecord>) {
        self.records.lock().await.insert(gateway_id, records);
    }

    pub async fn fail(&self, call: &'static str, failure: Failure) {
        self.failures.lock().await.insert(call, failure);
    }

    pub async fn recover(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn skip_create(&self, entity_id: &str) {
        self.skip_create.lock().await.insert(entity_id.to_string());
    }

    /// Link/unlink calls block until `release` is called.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().await.clone()
    }

    pub async fn mutation_calls(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub async fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.lock().await.iter().filter(|c| pred(*c)).count()
    }

    async fn record_call(&self, call: BackendCall) {
        self.calls.lock().await.push(call);
    }

    async fn check(&self, name: &'static str) -> IotResult<()> {
        match self.failures.lock().await.get(name) {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    async fn mutation(&self, name: &'static str, call: BackendCall) -> IotResult<()> {
        self.record_call(call).await;
        if self.held.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.check(name).await
    }
}

#[async_trait]
impl EntityBackend for MockBackend {
    async fn fetch_entities(&self, gateway_id: RecordId) -> IotResult<Vec<LocalEntityRecord>> {
        self.record_call(BackendCall::FetchEntities(gateway_id)).await;
        self.check("fetch_entities").await?;
        Ok(self
            .records
            .lock()
            .await
            .get(&gateway_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn bulk_create(
        &self,
        gateway_id: RecordId,
        entities: &[EntityCreateSpec],
    ) -> IotResult<BulkCreateOutcome> {
        let names = entities.iter().map(|e| e.entity_id.clone()).collect();
        self.record_call(BackendCall::BulkCreate(gateway_id, names)).await;
        self.check("bulk_create").await?;

        let skip = self.skip_create.lock().await.clone();
        let created: Vec<LocalEntityRecord> = entities
            .iter()
            .filter(|spec| !skip.contains(&spec.entity_id))
            .map(|spec| LocalEntityRecord {
                id: RecordId::new(self.next_id.fetch_add(1, Ordering::SeqCst)),
                gateway_id,
                entity_id: spec.entity_id.clone(),
                entity_type: spec.entity_type.clone(),
                friendly_name: spec.friendly_name.clone(),
                domain: spec.domain.clone(),
                device_class: spec.device_class.clone(),
                assignment: None,
            })
            .collect();
        self.records
            .lock()
            .await
            .entry(gateway_id)
            .or_default()
            .extend(created.iter().cloned());
        Ok(BulkCreateOutcome::from_records(created))
    }

    async fn bulk_delete(&self, gateway_id: RecordId, ids: &[i64]) -> IotResult<()> {
        self.record_call(BackendCall::BulkDelete(gateway_id, ids.to_vec()))
            .await;
        self.check("bulk_delete").await
    }

    async fn link(&self, gateway_id: RecordId, id: i64, grow_id: i64, stage: Stage) -> IotResult<()> {
        self.mutation("link", BackendCall::Link(gateway_id, id, grow_id, stage))
            .await
    }

    async fn unlink(&self, gateway_id: RecordId, id: i64) -> IotResult<()> {
        self.mutation("unlink", BackendCall::Unlink(gateway_id, id))
            .await
    }

    async fn bulk_link(
        &self,
        gateway_id: RecordId,
        ids: &[i64],
        grow_id: i64,
        stage: Stage,
    ) -> IotResult<()> {
        self.mutation(
            "bulk_link",
            BackendCall::BulkLink(gateway_id, ids.to_vec(), grow_id, stage),
        )
        .await
    }

    async fn bulk_unlink(&self, gateway_id: RecordId, ids: &[i64]) -> IotResult<()> {
        self.mutation("bulk_unlink", BackendCall::BulkUnlink(gateway_id, ids.to_vec()))
            .await
    }

    async fn update_counts(&self, gateway_id: RecordId, counts: GatewayCounts) -> IotResult<()> {
        self.record_call(BackendCall::UpdateCounts(gateway_id, counts))
            .await;
        self.check("update_counts").await
    }
}

// ── Mock Gateway ────────────────────────────────────────────────

pub struct MockGateway {
    entities: Mutex<Vec<RemoteEntity>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl MockGateway {
    pub fn new(entities: Vec<RemoteEntity>) -> Self {
        Self {
            entities: Mutex::new(entities),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub async fn set_entities(&self, entities: Vec<RemoteEntity>) {
        *self.entities.lock().await = entities;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayApi for MockGateway {
    async fn fetch_entities(&self, _credentials: &GatewayCredentials) -> IotResult<Vec<RemoteEntity>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(IotError::Gateway("connection refused".to_string()));
        }
        Ok(self.entities.lock().await.clone())
    }
}

// ── Mock Event Stream ───────────────────────────────────────────

type EventSender = mpsc::UnboundedSender<IotResult<GatewayEvent>>;

pub struct MockConnector {
    connects: AtomicUsize,
    senders: Mutex<Vec<EventSender>>,
    credentials: Mutex<Vec<GatewayCredentials>>,
    reject: AtomicBool,
    refuse: AtomicBool,
    flap: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            flap: AtomicBool::new(false),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every connect fails with a rejected access key.
    pub fn reject_key(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    /// Every connect fails with a transient error.
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Every connect succeeds with a stream that ends at once.
    pub fn flap(&self) {
        self.flap.store(true, Ordering::SeqCst);
    }

    pub async fn connected_with(&self) -> Vec<GatewayCredentials> {
        self.credentials.lock().await.clone()
    }

    /// Pushes an event on the most recent stream.
    pub async fn push(&self, event: GatewayEvent) -> bool {
        match self.senders.lock().await.last() {
            Some(sender) => sender.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    /// Ends every open stream, as if the gateway dropped the connection.
    pub async fn drop_streams(&self) {
        self.senders.lock().await.clear();
    }
}

#[async_trait]
impl EventStreamConnector for MockConnector {
    async fn connect(&self, credentials: &GatewayCredentials) -> IotResult<EventStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().await.push(credentials.clone());
        if self.reject.load(Ordering::SeqCst) {
            return Err(IotError::GatewayUnauthorized);
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(IotError::Gateway("connection refused".to_string()));
        }
        if self.flap.load(Ordering::SeqCst) {
            return Ok(futures::stream::empty().boxed());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().await.push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

// ── Harness ─────────────────────────────────────────────────────

pub struct Harness {
    pub sync: GatewaySync,
    pub backend: Arc<MockBackend>,
    pub gateway: Arc<MockGateway>,
    pub connector: Arc<MockConnector>,
    pub connections: Arc<ConnectionRegistry>,
}

impl Harness {
    /// Engine over mocks, with the event merger running.
    pub fn new(remote_entities: Vec<RemoteEntity>) -> Self {
        let config = SyncConfig {
            event_channel_capacity: 16,
            ..SyncConfig::default()
        };
        Self::with_config(&config, remote_entities)
    }

    pub fn with_config(config: &SyncConfig, remote_entities: Vec<RemoteEntity>) -> Self {
        init_tracing();
        let backend = Arc::new(MockBackend::new());
        let gateway = Arc::new(MockGateway::new(remote_entities));
        let connector = Arc::new(MockConnector::new());
        let connections = Arc::new(ConnectionRegistry::new(connector.clone(), fast_policy()));
        let (sync, merger) =
            create_gateway_sync(config, backend.clone(), gateway.clone(), connections.clone());
        tokio::spawn(merger.run());
        Self {
            sync,
            backend,
            gateway,
            connector,
            connections,
        }
    }

    /// Durable gateway `GW` with the given remote entities and backend
    /// records, already synced.
    pub async fn synced(remote_ids: &[&str], records: Vec<LocalEntityRecord>) -> Self {
        let harness = Self::new(remote_ids.iter().map(|id| remote(id)).collect());
        harness.backend.seed(GW, records).await;
        harness
            .sync
            .sync(&gateway(GW), false)
            .await
            .expect("initial sync should succeed");
        harness
    }

    pub async fn record(&self, gateway_id: RecordId, entity_id: &str) -> Option<LocalEntityRecord> {
        self.sync
            .local_records(gateway_id)
            .await
            .into_iter()
            .find(|r| r.entity_id == entity_id)
    }

    pub async fn assignment(&self, gateway_id: RecordId, entity_id: &str) -> Option<Assignment> {
        self.record(gateway_id, entity_id)
            .await
            .and_then(|r| r.assignment)
    }
}

pub fn entity_ids(records: &[LocalEntityRecord]) -> Vec<String> {
    let mut ids: Vec<String> = records.iter().map(|r| r.entity_id.clone()).collect();
    ids.sort();
    ids
}
