//! Event subscription registry: one live subscription per gateway.
//!
//! The registry is constructed by the application and handed to the engine.
//! Each subscription runs as its own task with an explicit state machine:
//!
//! ```text
//! Idle -> Connecting -> Connected -> (drop) -> Backoff -> Connecting ...
//!                  \-> Failed (key rejected or attempts exhausted)
//! any -> Closed (intentional disconnect)
//! ```

use crate::backend::{EventStream, EventStreamConnector};
use crate::error::IotError;
use crate::config::ReconnectPolicy;
use crate::types::{GatewayCredentials, GatewayEvent, RecordId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a single gateway subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    Backoff { attempt: u32, delay: Duration },
    Failed,
    Closed,
}

/// An event tagged with the gateway it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayEventEnvelope {
    pub gateway_id: RecordId,
    pub event: GatewayEvent,
}

struct Subscription {
    id: Uuid,
    credentials: GatewayCredentials,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

/// Owns every gateway event subscription.
pub struct ConnectionRegistry {
    connector: Arc<dyn EventStreamConnector>,
    policy: ReconnectPolicy,
    subscriptions: Mutex<HashMap<RecordId, Subscription>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn EventStreamConnector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a live subscription for the gateway with these credentials.
    ///
    /// Reuses a running subscription with matching credentials; tears down
    /// and replaces one whose credentials changed or which has stopped.
    /// Returns true when a new subscription was started.
    pub async fn ensure(
        &self,
        gateway_id: RecordId,
        credentials: GatewayCredentials,
        events: mpsc::Sender<GatewayEventEnvelope>,
    ) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;

        if let Some(existing) = subscriptions.get(&gateway_id) {
            let alive = !existing.task.is_finished()
                && !matches!(*existing.state.borrow(), ConnectionState::Failed | ConnectionState::Closed);
            if alive && existing.credentials == credentials {
                debug!("reusing event subscription for gateway {gateway_id}");
                return false;
            }
        }

        if let Some(stale) = subscriptions.remove(&gateway_id) {
            info!("replacing event subscription for gateway {gateway_id}");
            stale.close();
        }

        let id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let worker = SubscriptionWorker {
            gateway_id,
            connection_id: id,
            credentials: credentials.clone(),
            connector: self.connector.clone(),
            policy: self.policy.clone(),
            events,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        subscriptions.insert(
            gateway_id,
            Subscription {
                id,
                credentials,
                shutdown: shutdown_tx,
                state: state_rx,
                task,
            },
        );
        true
    }

    /// Intentionally closes a gateway's subscription. No reconnect follows.
    pub async fn disconnect(&self, gateway_id: RecordId) -> bool {
        match self.subscriptions.lock().await.remove(&gateway_id) {
            Some(subscription) => {
                info!("closing event subscription {} for gateway {gateway_id}", subscription.id);
                subscription.close();
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let mut subscriptions = self.subscriptions.lock().await;
        for (_, subscription) in subscriptions.drain() {
            subscription.close();
        }
    }

    pub async fn state(&self, gateway_id: RecordId) -> Option<ConnectionState> {
        self.subscriptions
            .lock()
            .await
            .get(&gateway_id)
            .map(|s| s.state.borrow().clone())
    }

    /// Watches a subscription's state transitions.
    pub async fn watch_state(&self, gateway_id: RecordId) -> Option<watch::Receiver<ConnectionState>> {
        self.subscriptions
            .lock()
            .await
            .get(&gateway_id)
            .map(|s| s.state.clone())
    }

    pub async fn is_subscribed(&self, gateway_id: RecordId) -> bool {
        self.subscriptions.lock().await.contains_key(&gateway_id)
    }
}

impl Subscription {
    fn close(self) {
        let _ = self.shutdown.send(true);
        // The worker observes the signal at its next await; abort covers a
        // connector stuck inside `connect`.
        self.task.abort();
    }
}

struct SubscriptionWorker {
    gateway_id: RecordId,
    connection_id: Uuid,
    credentials: GatewayCredentials,
    connector: Arc<dyn EventStreamConnector>,
    policy: ReconnectPolicy,
    events: mpsc::Sender<GatewayEventEnvelope>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

enum StreamEnd {
    Shutdown,
    /// The gateway ended the stream after delivering `delivered` events.
    Dropped { delivered: usize },
    ReceiverGone,
}

impl SubscriptionWorker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let _ = self.state.send(ConnectionState::Connecting { attempt });

            let connected = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = self.connector.connect(&self.credentials) => result,
            };

            match connected {
                Ok(mut stream) => {
                    let _ = self.state.send(ConnectionState::Connected);
                    info!(
                        "event subscription {} connected for gateway {}",
                        self.connection_id, self.gateway_id
                    );
                    let connected_at = Instant::now();

                    match self.pump(&mut stream).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::ReceiverGone => {
                            debug!("event receiver dropped for gateway {}", self.gateway_id);
                            break;
                        }
                        StreamEnd::Dropped { delivered } => {
                            warn!(
                                "event stream for gateway {} dropped after {delivered} events",
                                self.gateway_id
                            );
                            // A stream that connects and immediately ends
                            // still counts toward the attempt limit.
                            if delivered > 0 || connected_at.elapsed() >= self.policy.stable_after() {
                                attempt = 0;
                            }
                        }
                    }
                }
                Err(IotError::GatewayUnauthorized) => {
                    warn!("gateway {} rejected the event subscription key", self.gateway_id);
                    let _ = self.state.send(ConnectionState::Failed);
                    return;
                }
                Err(e) => {
                    warn!("event subscription for gateway {} failed: {e}", self.gateway_id);
                }
            }

            attempt += 1;
            if self.policy.exhausted(attempt) {
                warn!(
                    "giving up on event subscription for gateway {} after {} attempts",
                    self.gateway_id, self.policy.max_attempts
                );
                let _ = self.state.send(ConnectionState::Failed);
                return;
            }

            let delay = self.policy.delay_for(attempt);
            debug!("reconnecting gateway {} in {delay:?} (attempt {attempt})", self.gateway_id);
            let _ = self.state.send(ConnectionState::Backoff { attempt, delay });
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let _ = self.state.send(ConnectionState::Closed);
    }

    async fn pump(&mut self, stream: &mut EventStream) -> StreamEnd {
        let mut delivered = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return StreamEnd::Shutdown,
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let envelope = GatewayEventEnvelope { gateway_id: self.gateway_id, event };
                        if self.events.send(envelope).await.is_err() {
                            return StreamEnd::ReceiverGone;
                        }
                        delivered += 1;
                    }
                    Some(Err(e)) => {
                        warn!("event stream error for gateway {}: {e}", self.gateway_id);
                        return StreamEnd::Dropped { delivered };
                    }
                    None => return StreamEnd::Dropped { delivered },
                },
            }
        }
    }
}
