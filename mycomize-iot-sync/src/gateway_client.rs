//! Home Assistant client: entity snapshot over REST and entity add/remove
//! notifications over the server-sent event stream.

use crate::backend::{EventStream, EventStreamConnector, GatewayApi};
use crate::config::SyncConfig;
use crate::error::{IotError, IotResult};
use crate::types::{GatewayCredentials, GatewayEvent, RemoteEntity};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

pub struct HomeAssistantClient {
    client: Client,
    request_timeout: Duration,
}

impl HomeAssistantClient {
    pub fn new(config: &SyncConfig) -> IotResult<Self> {
        // No overall client timeout: the event stream stays open indefinitely.
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
        })
    }

    fn check_status(status: StatusCode, what: &str) -> IotResult<()> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(IotError::GatewayUnauthorized);
        }
        if !status.is_success() {
            return Err(IotError::Gateway(format!("{what} returned {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl GatewayApi for HomeAssistantClient {
    async fn fetch_entities(&self, credentials: &GatewayCredentials) -> IotResult<Vec<RemoteEntity>> {
        let url = format!("{}/api/states", credentials.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_key)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| IotError::Gateway(e.to_string()))?;

        Self::check_status(resp.status(), "GET /api/states")?;

        let entities: Vec<RemoteEntity> = resp
            .json()
            .await
            .map_err(|e| IotError::Gateway(format!("invalid state list: {e}")))?;
        debug!("fetched {} entities from {}", entities.len(), credentials.base_url);
        Ok(entities)
    }
}

#[async_trait]
impl EventStreamConnector for HomeAssistantClient {
    async fn connect(&self, credentials: &GatewayCredentials) -> IotResult<EventStream> {
        let url = format!("{}/api/stream?restrict=state_changed", credentials.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_key)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| IotError::Gateway(e.to_string()))?;

        Self::check_status(resp.status(), "GET /api/stream")?;
        debug!("event stream open for {}", credentials.base_url);

        // Chunks align with neither lines nor UTF-8 boundaries; keep the raw
        // partial tail between chunks and decode complete lines only.
        let events = resp
            .bytes_stream()
            .scan(Vec::<u8>::new(), |buffer, chunk| {
                let items = match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        drain_complete_lines(buffer)
                    }
                    Err(e) => vec![Err(IotError::Gateway(format!("event stream read failed: {e}")))],
                };
                futures::future::ready(Some(items))
            })
            .flat_map(stream::iter);

        Ok(events.boxed())
    }
}

fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<IotResult<GatewayEvent>> {
    let mut events = Vec::new();
    let mut consumed = 0;
    while let Some(offset) = buffer[consumed..].iter().position(|b| *b == b'\n') {
        let end = consumed + offset;
        match std::str::from_utf8(&buffer[consumed..end]) {
            Ok(line) => {
                if let Some(event) = parse_stream_line(line) {
                    events.push(Ok(event));
                }
            }
            Err(e) => debug!("skipping event stream line that is not UTF-8: {e}"),
        }
        consumed = end + 1;
    }
    buffer.drain(..consumed);
    events
}

#[derive(Deserialize)]
struct StreamMessage {
    event_type: String,
    data: StateChange,
}

#[derive(Deserialize)]
struct StateChange {
    entity_id: String,
    old_state: Option<RemoteEntity>,
    new_state: Option<RemoteEntity>,
}

/// Decodes one server-sent event line into an add/remove notification.
///
/// Keep-alives, non-`state_changed` events and in-place state updates yield
/// `None`.
pub fn parse_stream_line(line: &str) -> Option<GatewayEvent> {
    let payload = line.trim_end_matches('\r').strip_prefix("data:")?.trim();
    let message: StreamMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(_) => {
            trace!("ignoring non-event stream line: {payload}");
            return None;
        }
    };
    if message.event_type != "state_changed" {
        return None;
    }

    match (message.data.old_state, message.data.new_state) {
        (None, Some(entity)) => Some(GatewayEvent::Added(entity)),
        (Some(_), None) => Some(GatewayEvent::Removed {
            entity_id: message.data.entity_id,
        }),
        _ => None,
    }
}
