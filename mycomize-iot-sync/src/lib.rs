//! IoT gateway entity sync for Mycomize.
//!
//! Keeps three views of a gateway's entities consistent:
//! - The live entity list reported by the gateway (REST fetch + event stream)
//! - Entity records persisted by the backend, with their grow/stage links
//! - Link intents made before the gateway itself has been saved
//!
//! Reconciliation is a pure function; link/unlink changes are applied
//! optimistically and rolled back if the backend rejects them.

pub mod api_client;
pub mod backend;
pub mod config;
pub mod connection;
pub mod credential_cache;
pub mod engine;
pub mod error;
pub mod gateway_client;
pub mod locks;
pub mod merge;
pub mod operations;
pub mod pending;
pub mod reconcile;
pub mod store;
pub mod types;

pub use config::{ReconnectPolicy, SyncConfig};
pub use connection::{ConnectionRegistry, ConnectionState, GatewayEventEnvelope};
pub use engine::{GatewaySync, create_gateway_sync};
pub use error::{IotError, IotResult};
pub use merge::EventMerger;
pub use types::*;
