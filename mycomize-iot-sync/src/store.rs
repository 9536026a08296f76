//! In-memory mirror of backend-persisted entity records.
//!
//! Records are grouped per gateway and kept in backend order. At most one
//! record exists per `(gateway_id, entity_id)`.

use crate::types::{Assignment, LocalEntityRecord, RecordId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RecordStore {
    by_gateway: HashMap<RecordId, Vec<LocalEntityRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records held for a gateway, in insertion order.
    pub fn records(&self, gateway_id: RecordId) -> &[LocalEntityRecord] {
        self.by_gateway
            .get(&gateway_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, gateway_id: RecordId, entity_id: &str) -> Option<&LocalEntityRecord> {
        self.records(gateway_id)
            .iter()
            .find(|record| record.entity_id == entity_id)
    }

    pub fn contains_gateway(&self, gateway_id: RecordId) -> bool {
        self.by_gateway.contains_key(&gateway_id)
    }

    /// Replaces every record of a gateway. Later duplicates of an
    /// `entity_id` are discarded.
    pub fn replace(&mut self, gateway_id: RecordId, records: Vec<LocalEntityRecord>) {
        let mut deduped: Vec<LocalEntityRecord> = Vec::with_capacity(records.len());
        for record in records {
            if !deduped.iter().any(|r| r.entity_id == record.entity_id) {
                deduped.push(record);
            }
        }
        self.by_gateway.insert(gateway_id, deduped);
    }

    /// Inserts a record, replacing any existing record for the same entity.
    pub fn upsert(&mut self, gateway_id: RecordId, record: LocalEntityRecord) {
        let records = self.by_gateway.entry(gateway_id).or_default();
        match records.iter_mut().find(|r| r.entity_id == record.entity_id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Sets the assignment of a record. Returns the previous assignment, or
    /// `None` in the outer option when the record does not exist.
    pub fn set_assignment(
        &mut self,
        gateway_id: RecordId,
        entity_id: &str,
        assignment: Option<Assignment>,
    ) -> Option<Option<Assignment>> {
        let record = self
            .by_gateway
            .get_mut(&gateway_id)?
            .iter_mut()
            .find(|r| r.entity_id == entity_id)?;
        Some(std::mem::replace(&mut record.assignment, assignment))
    }

    pub fn remove(&mut self, gateway_id: RecordId, entity_id: &str) -> Option<LocalEntityRecord> {
        let records = self.by_gateway.get_mut(&gateway_id)?;
        let index = records.iter().position(|r| r.entity_id == entity_id)?;
        Some(records.remove(index))
    }

    /// Drops every record of a gateway.
    pub fn drop_gateway(&mut self, gateway_id: RecordId) -> Vec<LocalEntityRecord> {
        self.by_gateway.remove(&gateway_id).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.by_gateway.clear();
    }

    /// Resolves external ids to durable ids. Returns the resolved ids in
    /// input order, or the external ids that could not be resolved.
    pub fn resolve_durable(
        &self,
        gateway_id: RecordId,
        entity_ids: &[String],
    ) -> Result<Vec<i64>, Vec<String>> {
        let mut resolved = Vec::with_capacity(entity_ids.len());
        let mut missing = Vec::new();
        for entity_id in entity_ids {
            match self.get(gateway_id, entity_id).and_then(|r| r.id.durable()) {
                Some(id) => resolved.push(id),
                None => missing.push(entity_id.clone()),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(missing)
        }
    }
}
