//! HTTP client for the Mycomize backend's gateway entity routes.
//!
//! Every call carries the session's bearer token. A 401 is terminal: the
//! token is dropped and `IotError::Unauthorized` is returned so the caller
//! can end the session. Uses reqwest with JSON serialization.

use crate::backend::EntityBackend;
use crate::config::SyncConfig;
use crate::error::{IotError, IotResult};
use crate::types::{
    BulkCreateOutcome, EntityCreateSpec, GatewayCounts, LocalEntityRecord, RecordId, Stage,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// HTTP client for the backend control plane.
pub struct BackendApiClient {
    client: Client,
    config: SyncConfig,
    access_token: Arc<RwLock<Option<String>>>,
}

impl BackendApiClient {
    pub fn new(config: SyncConfig) -> IotResult<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            config,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Sets the bearer token (restored by the external credential store).
    pub async fn set_token(&self, token: String) {
        *self.access_token.write().await = Some(token);
    }

    pub async fn clear_token(&self) {
        *self.access_token.write().await = None;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.access_token.read().await.is_some()
    }

    async fn get_token(&self) -> IotResult<String> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or(IotError::Unauthorized)
    }

    /// Sends an authenticated request and maps the status to an error.
    async fn auth_send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> IotResult<reqwest::Response> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let token = self.get_token().await?;

        let mut request = self.client.request(method.clone(), &url).bearer_auth(&token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("401 on {method} {path}, session is no longer valid");
            self.clear_token().await;
            return Err(IotError::Unauthorized);
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(IotError::Api(format!("{method} {path} returned {status}: {detail}")));
        }

        debug!("{method} {path} -> {status}");
        Ok(resp)
    }

    fn entities_path(gateway_id: RecordId) -> String {
        format!("/iot-gateways/{}/entities", gateway_id.get())
    }
}

#[async_trait]
impl EntityBackend for BackendApiClient {
    async fn fetch_entities(&self, gateway_id: RecordId) -> IotResult<Vec<LocalEntityRecord>> {
        let resp = self
            .auth_send(Method::GET, &Self::entities_path(gateway_id), None)
            .await?;
        Ok(resp.json().await?)
    }

    async fn bulk_create(
        &self,
        gateway_id: RecordId,
        entities: &[EntityCreateSpec],
    ) -> IotResult<BulkCreateOutcome> {
        let path = format!("{}/bulk-create", Self::entities_path(gateway_id));
        let resp = self
            .auth_send(Method::POST, &path, Some(json!({ "entities": entities })))
            .await?;
        let records: Vec<LocalEntityRecord> = resp.json().await?;
        Ok(BulkCreateOutcome::from_records(records))
    }

    async fn bulk_delete(&self, gateway_id: RecordId, ids: &[i64]) -> IotResult<()> {
        let path = format!("{}/bulk-delete", Self::entities_path(gateway_id));
        self.auth_send(Method::DELETE, &path, Some(json!({ "entity_ids": ids })))
            .await?;
        Ok(())
    }

    async fn link(&self, gateway_id: RecordId, id: i64, grow_id: i64, stage: Stage) -> IotResult<()> {
        let path = format!("{}/{id}/link", Self::entities_path(gateway_id));
        self.auth_send(
            Method::PUT,
            &path,
            Some(json!({ "grow_id": grow_id, "stage": stage })),
        )
        .await?;
        Ok(())
    }

    async fn unlink(&self, gateway_id: RecordId, id: i64) -> IotResult<()> {
        let path = format!("{}/{id}/unlink", Self::entities_path(gateway_id));
        self.auth_send(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn bulk_link(
        &self,
        gateway_id: RecordId,
        ids: &[i64],
        grow_id: i64,
        stage: Stage,
    ) -> IotResult<()> {
        let path = format!("{}/bulk-link", Self::entities_path(gateway_id));
        self.auth_send(
            Method::PUT,
            &path,
            Some(json!({ "entity_ids": ids, "grow_id": grow_id, "stage": stage })),
        )
        .await?;
        Ok(())
    }

    async fn bulk_unlink(&self, gateway_id: RecordId, ids: &[i64]) -> IotResult<()> {
        let path = format!("{}/bulk-unlink", Self::entities_path(gateway_id));
        self.auth_send(Method::DELETE, &path, Some(json!({ "entity_ids": ids })))
            .await?;
        Ok(())
    }

    async fn update_counts(&self, gateway_id: RecordId, counts: GatewayCounts) -> IotResult<()> {
        // The gateway schema stores both counts as strings.
        self.auth_send(
            Method::PUT,
            &format!("/iot-gateways/{}", gateway_id.get()),
            Some(json!({
                "linked_entities_count": counts.linked.to_string(),
                "linkable_entities_count": counts.linkable.to_string(),
            })),
        )
        .await?;
        Ok(())
    }
}
