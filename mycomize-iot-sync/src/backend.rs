//! Contracts for the external collaborators this core talks to.
//!
//! The backend owns persistence of entity records; the gateway owns the live
//! entity list and the event stream. Both are reached only through these
//! traits so the engine can be driven by test doubles.

use crate::error::IotResult;
use crate::types::{
    BulkCreateOutcome, EntityCreateSpec, GatewayCounts, GatewayCredentials, GatewayEvent,
    LocalEntityRecord, RecordId, RemoteEntity, Stage,
};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of typed push events from one gateway subscription.
pub type EventStream = BoxStream<'static, IotResult<GatewayEvent>>;

/// Backend CRUD for entity records, addressed by durable identity.
#[async_trait]
pub trait EntityBackend: Send + Sync {
    async fn fetch_entities(&self, gateway_id: RecordId) -> IotResult<Vec<LocalEntityRecord>>;

    async fn bulk_create(
        &self,
        gateway_id: RecordId,
        entities: &[EntityCreateSpec],
    ) -> IotResult<BulkCreateOutcome>;

    async fn bulk_delete(&self, gateway_id: RecordId, ids: &[i64]) -> IotResult<()>;

    async fn link(&self, gateway_id: RecordId, id: i64, grow_id: i64, stage: Stage) -> IotResult<()>;

    async fn unlink(&self, gateway_id: RecordId, id: i64) -> IotResult<()>;

    async fn bulk_link(
        &self,
        gateway_id: RecordId,
        ids: &[i64],
        grow_id: i64,
        stage: Stage,
    ) -> IotResult<()>;

    async fn bulk_unlink(&self, gateway_id: RecordId, ids: &[i64]) -> IotResult<()>;

    async fn update_counts(&self, gateway_id: RecordId, counts: GatewayCounts) -> IotResult<()>;
}

/// Request/response access to a remote gateway.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn fetch_entities(&self, credentials: &GatewayCredentials) -> IotResult<Vec<RemoteEntity>>;
}

/// Opens push-event subscriptions against a remote gateway.
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    async fn connect(&self, credentials: &GatewayCredentials) -> IotResult<EventStream>;
}
