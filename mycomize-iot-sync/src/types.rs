//! Shared types for gateway entity sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Backend-assigned identity of an entity record or gateway.
///
/// `RecordId::UNSAVED` marks a record or gateway that has not been persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    pub const UNSAVED: RecordId = RecordId(-1);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn is_unsaved(self) -> bool {
        self == Self::UNSAVED
    }

    /// Returns the raw id when this identity is durable.
    pub fn durable(self) -> Option<i64> {
        (!self.is_unsaved()).then_some(self.0)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unsaved() {
            write!(f, "unsaved")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Grow stage an entity can be assigned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Inoculation,
    SpawnColonization,
    BulkColonization,
    Fruiting,
    Harvest,
}

/// An entity's link to a grow and stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub grow_id: i64,
    pub stage: Stage,
}

impl Assignment {
    pub fn new(grow_id: i64, stage: Stage) -> Self {
        Self { grow_id, stage }
    }

    /// Builds an assignment only when both halves are present.
    pub fn from_parts(grow_id: Option<i64>, stage: Option<Stage>) -> Option<Self> {
        Some(Self::new(grow_id?, stage?))
    }
}

/// An entity as reported live by the remote gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub entity_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub last_changed: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl RemoteEntity {
    /// Substring before the first `.`; empty when there is no domain segment.
    pub fn domain(&self) -> &str {
        domain_of(&self.entity_id)
    }

    /// The `device_class` attribute, or `""` when absent.
    pub fn device_class(&self) -> &str {
        self.attributes
            .get("device_class")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// The `friendly_name` attribute, falling back to the external id.
    pub fn display_name(&self) -> &str {
        self.attributes
            .get("friendly_name")
            .and_then(Value::as_str)
            .unwrap_or(self.entity_id.as_str())
    }
}

/// Domain segment of an external entity id.
pub fn domain_of(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map(|(domain, _)| domain)
        .unwrap_or("")
}

/// The durable (or pseudo) record tying an entity to a gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EntityRecordWire", into = "EntityRecordWire")]
pub struct LocalEntityRecord {
    pub id: RecordId,
    pub gateway_id: RecordId,
    pub entity_id: String,
    pub entity_type: String,
    pub friendly_name: String,
    pub domain: String,
    pub device_class: String,
    pub assignment: Option<Assignment>,
}

impl LocalEntityRecord {
    /// Builds an unsaved pseudo-record for a remote entity.
    pub fn pseudo(remote: &RemoteEntity) -> Self {
        Self {
            id: RecordId::UNSAVED,
            gateway_id: RecordId::UNSAVED,
            entity_id: remote.entity_id.clone(),
            entity_type: remote.domain().to_string(),
            friendly_name: remote.display_name().to_string(),
            domain: remote.domain().to_string(),
            device_class: remote.device_class().to_string(),
            assignment: None,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.assignment.is_some()
    }

    pub fn is_pseudo(&self) -> bool {
        self.id.is_unsaved()
    }
}

/// Backend representation: the assignment travels as two nullable columns.
#[derive(Serialize, Deserialize)]
struct EntityRecordWire {
    id: RecordId,
    gateway_id: RecordId,
    entity_name: String,
    #[serde(default)]
    entity_type: String,
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    device_class: Option<String>,
    #[serde(default)]
    linked_grow_id: Option<i64>,
    #[serde(default)]
    linked_stage: Option<Stage>,
}

impl From<EntityRecordWire> for LocalEntityRecord {
    fn from(wire: EntityRecordWire) -> Self {
        let domain = wire
            .domain
            .unwrap_or_else(|| domain_of(&wire.entity_name).to_string());
        Self {
            id: wire.id,
            gateway_id: wire.gateway_id,
            friendly_name: wire.friendly_name.unwrap_or_else(|| wire.entity_name.clone()),
            entity_id: wire.entity_name,
            entity_type: wire.entity_type,
            domain,
            device_class: wire.device_class.unwrap_or_default(),
            assignment: Assignment::from_parts(wire.linked_grow_id, wire.linked_stage),
        }
    }
}

impl From<LocalEntityRecord> for EntityRecordWire {
    fn from(record: LocalEntityRecord) -> Self {
        Self {
            id: record.id,
            gateway_id: record.gateway_id,
            entity_name: record.entity_id,
            entity_type: record.entity_type,
            friendly_name: Some(record.friendly_name),
            domain: Some(record.domain),
            device_class: Some(record.device_class),
            linked_grow_id: record.assignment.map(|a| a.grow_id),
            linked_stage: record.assignment.map(|a| a.stage),
        }
    }
}

/// Connection credentials for a remote gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayCredentials {
    pub base_url: String,
    pub access_key: String,
}

/// The subset of a gateway record this core consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: RecordId,
    pub name: String,
    #[serde(rename = "type", default)]
    pub gateway_type: String,
    pub api_url: String,
    pub api_key: String,
}

impl Gateway {
    /// A gateway still being configured, without a backend record.
    pub fn unsaved(name: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: RecordId::UNSAVED,
            name: name.into(),
            gateway_type: "home_assistant".to_string(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn is_unsaved(&self) -> bool {
        self.id.is_unsaved()
    }

    pub fn credentials(&self) -> GatewayCredentials {
        GatewayCredentials {
            base_url: self.api_url.trim_end_matches('/').to_string(),
            access_key: self.api_key.clone(),
        }
    }
}

/// Reconciliation output. Always derivable from its inputs; never persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncResult {
    pub new_entities: Vec<RemoteEntity>,
    pub orphaned_entities: Vec<LocalEntityRecord>,
    pub linkable_entities: Vec<LocalEntityRecord>,
    pub linked_entities: Vec<LocalEntityRecord>,
}

impl SyncResult {
    pub fn counts(&self) -> GatewayCounts {
        GatewayCounts {
            linked: self.linked_entities.len(),
            linkable: self.linkable_entities.len(),
        }
    }
}

/// Linked/linkable counts reported back on the gateway record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GatewayCounts {
    pub linked: usize,
    pub linkable: usize,
}

/// A typed push notification from a gateway's event subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayEvent {
    Added(RemoteEntity),
    Removed { entity_id: String },
}

impl GatewayEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            GatewayEvent::Added(entity) => &entity.entity_id,
            GatewayEvent::Removed { entity_id } => entity_id,
        }
    }
}

/// Fields sent when bulk-creating entity records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCreateSpec {
    #[serde(rename = "entity_name")]
    pub entity_id: String,
    pub entity_type: String,
    pub friendly_name: String,
    pub domain: String,
    pub device_class: String,
}

impl From<&RemoteEntity> for EntityCreateSpec {
    fn from(remote: &RemoteEntity) -> Self {
        Self {
            entity_id: remote.entity_id.clone(),
            entity_type: remote.domain().to_string(),
            friendly_name: remote.display_name().to_string(),
            domain: remote.domain().to_string(),
            device_class: remote.device_class().to_string(),
        }
    }
}

/// Created records plus the external id to durable id map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BulkCreateOutcome {
    pub records: Vec<LocalEntityRecord>,
    pub id_map: HashMap<String, RecordId>,
}

impl BulkCreateOutcome {
    pub fn from_records(records: Vec<LocalEntityRecord>) -> Self {
        let id_map = records
            .iter()
            .map(|record| (record.entity_id.clone(), record.id))
            .collect();
        Self { records, id_map }
    }
}

/// Outcome of committing the pending-link buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub linked: usize,
    pub unlinked: usize,
    /// External ids skipped because no durable record existed at commit time.
    pub dropped: Vec<String>,
}
