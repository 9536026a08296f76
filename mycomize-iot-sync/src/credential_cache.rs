//! Per-gateway credential cache and fetch-dedup bookkeeping.
//!
//! The cache remembers the credentials each gateway was last fetched with so
//! a fetch can be skipped when nothing changed. The fetch markers remember
//! which gateways already had their local records loaded this session.

use crate::types::{Gateway, GatewayCredentials, RecordId};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: HashMap<RecordId, GatewayCredentials>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is cached for the gateway or either the base URL or
    /// the access key differs from the cached value.
    pub fn has_changed(&self, gateway: &Gateway) -> bool {
        match self.entries.get(&gateway.id) {
            Some(cached) => *cached != gateway.credentials(),
            None => true,
        }
    }

    pub fn update(&mut self, gateway: &Gateway) {
        debug!("caching credentials for gateway {}", gateway.id);
        self.entries.insert(gateway.id, gateway.credentials());
    }

    pub fn get(&self, gateway_id: RecordId) -> Option<&GatewayCredentials> {
        self.entries.get(&gateway_id)
    }

    pub fn remove(&mut self, gateway_id: RecordId) -> Option<GatewayCredentials> {
        self.entries.remove(&gateway_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Gateways whose local records were already fetched this session.
#[derive(Debug, Default)]
pub struct FetchMarkers {
    fetched: HashSet<RecordId>,
}

impl FetchMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when a record fetch is needed.
    pub fn needs_fetch(&self, gateway_id: RecordId, force_refresh: bool) -> bool {
        force_refresh || !self.fetched.contains(&gateway_id)
    }

    pub fn mark(&mut self, gateway_id: RecordId) {
        self.fetched.insert(gateway_id);
    }

    pub fn unmark(&mut self, gateway_id: RecordId) {
        self.fetched.remove(&gateway_id);
    }

    pub fn clear(&mut self) {
        self.fetched.clear();
    }
}
