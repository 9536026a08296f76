//! Optimistic link/unlink mutations and pending-link commit.
//!
//! A mutation is applied to the record store and republished before the
//! backend call is issued. If the call fails, each entity's captured
//! previous assignment is re-applied and the error is returned. An
//! `Unauthorized` failure skips rollback and ends the session instead.
//!
//! Backend calls always use durable record ids. Every requested entity is
//! resolved before any network call; one unresolved id fails the whole
//! operation.

use crate::engine::GatewaySync;
use crate::error::{IotError, IotResult};
use crate::types::{Assignment, CommitReport, LocalEntityRecord, RecordId, Stage};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Single,
    Bulk,
}

/// Pre-mutation assignment of one entity.
type Captured = (String, Option<Assignment>);

impl GatewaySync {
    /// Links an entity to a grow stage.
    pub async fn link(
        &self,
        gateway_id: RecordId,
        entity_id: &str,
        grow_id: i64,
        stage: Stage,
    ) -> IotResult<()> {
        self.mutate(
            gateway_id,
            &[entity_id.to_string()],
            Some(Assignment::new(grow_id, stage)),
            Shape::Single,
        )
        .await
    }

    /// Clears an entity's grow stage link.
    pub async fn unlink(&self, gateway_id: RecordId, entity_id: &str) -> IotResult<()> {
        self.mutate(gateway_id, &[entity_id.to_string()], None, Shape::Single)
            .await
    }

    /// Links every entity to one grow stage, as a unit.
    pub async fn bulk_link(
        &self,
        gateway_id: RecordId,
        entity_ids: &[String],
        grow_id: i64,
        stage: Stage,
    ) -> IotResult<()> {
        self.mutate(
            gateway_id,
            entity_ids,
            Some(Assignment::new(grow_id, stage)),
            Shape::Bulk,
        )
        .await
    }

    /// Unlinks every entity, as a unit.
    pub async fn bulk_unlink(&self, gateway_id: RecordId, entity_ids: &[String]) -> IotResult<()> {
        self.mutate(gateway_id, entity_ids, None, Shape::Bulk).await
    }

    async fn mutate(
        &self,
        gateway_id: RecordId,
        entity_ids: &[String],
        target: Option<Assignment>,
        shape: Shape,
    ) -> IotResult<()> {
        let entity_ids = dedup(entity_ids);
        if entity_ids.is_empty() {
            return Ok(());
        }

        let _guard = self.locks.acquire(gateway_id, &entity_ids).await;

        if gateway_id.is_unsaved() {
            return self.mutate_draft(&entity_ids, target, shape).await;
        }

        let (durable_ids, previous) = {
            let mut state = self.state.write().await;
            let durable_ids = state
                .records
                .resolve_durable(gateway_id, &entity_ids)
                .map_err(|missing| resolution_error(missing, shape))?;

            let previous: Vec<Captured> = entity_ids
                .iter()
                .map(|entity_id| {
                    let before = state
                        .records
                        .set_assignment(gateway_id, entity_id, target)
                        .flatten();
                    (entity_id.clone(), before)
                })
                .collect();
            state.recompute(gateway_id);
            (durable_ids, previous)
        };

        let confirmed = match (shape, target) {
            (Shape::Single, Some(a)) => {
                self.backend
                    .link(gateway_id, durable_ids[0], a.grow_id, a.stage)
                    .await
            }
            (Shape::Single, None) => self.backend.unlink(gateway_id, durable_ids[0]).await,
            (Shape::Bulk, Some(a)) => {
                self.backend
                    .bulk_link(gateway_id, &durable_ids, a.grow_id, a.stage)
                    .await
            }
            (Shape::Bulk, None) => self.backend.bulk_unlink(gateway_id, &durable_ids).await,
        };

        match confirmed {
            Ok(()) => {
                debug!(
                    "confirmed {:?} mutation of {} entities on gateway {gateway_id}",
                    shape,
                    entity_ids.len()
                );
                self.publish_counts(gateway_id).await
            }
            Err(IotError::Unauthorized) => {
                self.end_session().await;
                Err(IotError::Unauthorized)
            }
            Err(e) => {
                warn!("mutation on gateway {gateway_id} failed, rolling back: {e}");
                self.rollback(gateway_id, &previous).await;
                Err(e)
            }
        }
    }

    /// Re-applies captured assignments, unless the gateway was forgotten.
    async fn rollback(&self, gateway_id: RecordId, previous: &[Captured]) {
        let mut state = self.state.write().await;
        if !state.is_known(gateway_id) {
            debug!("gateway {gateway_id} no longer known, skipping rollback");
            return;
        }
        for (entity_id, assignment) in previous {
            if state
                .records
                .set_assignment(gateway_id, entity_id, *assignment)
                .is_none()
            {
                debug!("record {entity_id} removed before rollback");
            }
        }
        state.recompute(gateway_id);
    }

    /// Unsaved gateway: record the intent in the pending buffer and apply it
    /// to the draft's pseudo-records. No backend call.
    async fn mutate_draft(
        &self,
        entity_ids: &[String],
        target: Option<Assignment>,
        shape: Shape,
    ) -> IotResult<()> {
        let draft = RecordId::UNSAVED;
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let remote = state
            .sessions
            .get(&draft)
            .map(|session| session.remote.as_slice())
            .unwrap_or(&[]);

        let missing: Vec<String> = entity_ids
            .iter()
            .filter(|id| {
                state.records.get(draft, id).is_none() && !remote.iter().any(|e| &e.entity_id == *id)
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(resolution_error(missing, shape));
        }

        for entity_id in entity_ids {
            if state.records.get(draft, entity_id).is_none() {
                if let Some(entity) = remote.iter().find(|e| &e.entity_id == entity_id) {
                    state.records.upsert(draft, LocalEntityRecord::pseudo(entity));
                }
            }
            state.records.set_assignment(draft, entity_id, target);
            state.pending.set(
                entity_id,
                target.map(|a| a.grow_id),
                target.map(|a| a.stage),
            );
        }
        state.recompute(draft);
        debug!("buffered {} pending link intents", state.pending.len());
        Ok(())
    }

    /// Queues an explicit unlink for a draft entity, committed as part of the
    /// single bulk-unlink once the gateway is durable.
    pub async fn queue_unlink(&self, entity_id: &str) -> IotResult<()> {
        let draft = RecordId::UNSAVED;
        let entity_ids = [entity_id.to_string()];
        let _guard = self.locks.acquire(draft, &entity_ids).await;

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let known = state.records.get(draft, entity_id).is_some()
            || state
                .sessions
                .get(&draft)
                .is_some_and(|session| session.remote.iter().any(|e| e.entity_id == entity_id));
        if !known {
            return Err(IotError::EntityNotFound(entity_id.to_string()));
        }

        state.records.set_assignment(draft, entity_id, None);
        state.pending.set_unlink(entity_id);
        state.recompute(draft);
        debug!("queued pending unlink for {entity_id}");
        Ok(())
    }

    /// Discards every pending intent and the draft's optimistic assignments.
    pub async fn cancel_pending(&self) {
        let mut state = self.state.write().await;
        state.pending.clear();
        state.records.drop_gateway(RecordId::UNSAVED);
        if state.is_known(RecordId::UNSAVED) {
            state.recompute(RecordId::UNSAVED);
        }
    }

    /// Number of buffered pending intents.
    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// Pending intent for an entity: `Some(None)` is an unlink intent.
    pub async fn pending_intent(&self, entity_id: &str) -> Option<Option<Assignment>> {
        self.state.read().await.pending.get(entity_id)
    }

    /// Commits buffered intents against a now-durable gateway's records.
    ///
    /// Issues one bulk-link per `(grow_id, stage)` group and at most one
    /// bulk-unlink. Entries without a durable record are dropped and reported.
    /// Only committed and dropped entries leave the buffer; intents recorded
    /// while the calls were in flight, and everything not yet committed when
    /// a call fails, stay for a retry.
    pub async fn commit_pending(&self, gateway_id: RecordId) -> IotResult<CommitReport> {
        if gateway_id.is_unsaved() {
            return Err(IotError::GatewayNotFound(gateway_id));
        }

        let entity_ids = self.state.read().await.pending.entity_ids();
        let _guard = self.locks.acquire(gateway_id, &entity_ids).await;

        let mut report = CommitReport::default();
        let mut dropped_intents: Vec<(String, Option<Assignment>)> = Vec::new();
        let mut link_calls: Vec<(Assignment, Vec<String>, Vec<i64>)> = Vec::new();
        let mut unlink_call: (Vec<String>, Vec<i64>) = (Vec::new(), Vec::new());
        {
            let state = self.state.read().await;
            let plan = state.pending.plan();
            let resolve = |entity_id: &String| {
                state
                    .records
                    .get(gateway_id, entity_id)
                    .and_then(|record| record.id.durable())
            };

            for (assignment, members) in plan.links {
                let mut names = Vec::new();
                let mut ids = Vec::new();
                for entity_id in members {
                    match resolve(&entity_id) {
                        Some(id) => {
                            names.push(entity_id);
                            ids.push(id);
                        }
                        None => dropped_intents.push((entity_id, Some(assignment))),
                    }
                }
                if !ids.is_empty() {
                    link_calls.push((assignment, names, ids));
                }
            }
            for entity_id in plan.unlinks {
                match resolve(&entity_id) {
                    Some(id) => {
                        unlink_call.0.push(entity_id);
                        unlink_call.1.push(id);
                    }
                    None => dropped_intents.push((entity_id, None)),
                }
            }
        }

        for (entity_id, _) in &dropped_intents {
            warn!("dropping pending link for {entity_id}: no durable record on gateway {gateway_id}");
        }

        for (assignment, names, ids) in &link_calls {
            if let Err(e) = self
                .backend
                .bulk_link(gateway_id, ids, assignment.grow_id, assignment.stage)
                .await
            {
                warn!("pending link commit failed for gateway {gateway_id}: {e}");
                return Err(self.escalate(e).await);
            }
            self.apply_committed(gateway_id, names, Some(*assignment)).await;
            report.linked += ids.len();
        }

        if !unlink_call.1.is_empty() {
            if let Err(e) = self.backend.bulk_unlink(gateway_id, &unlink_call.1).await {
                warn!("pending unlink commit failed for gateway {gateway_id}: {e}");
                return Err(self.escalate(e).await);
            }
            self.apply_committed(gateway_id, &unlink_call.0, None).await;
            report.unlinked += unlink_call.1.len();
        }

        {
            let mut state = self.state.write().await;
            for (entity_id, intent) in dropped_intents {
                if state.pending.settle(&entity_id, intent) {
                    report.dropped.push(entity_id);
                }
            }
        }
        info!(
            "committed pending links for gateway {gateway_id}: {} linked, {} unlinked, {} dropped",
            report.linked,
            report.unlinked,
            report.dropped.len()
        );
        Ok(report)
    }

    async fn apply_committed(
        &self,
        gateway_id: RecordId,
        entity_ids: &[String],
        assignment: Option<Assignment>,
    ) {
        let mut state = self.state.write().await;
        for entity_id in entity_ids {
            state.pending.settle(entity_id, assignment);
        }
        if !state.is_known(gateway_id) {
            return;
        }
        for entity_id in entity_ids {
            state.records.set_assignment(gateway_id, entity_id, assignment);
        }
        state.recompute(gateway_id);
    }
}

fn dedup(entity_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    entity_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn resolution_error(mut missing: Vec<String>, shape: Shape) -> IotError {
    if shape == Shape::Single && missing.len() == 1 {
        return IotError::EntityNotFound(missing.remove(0));
    }
    IotError::PartialResolution { missing }
}
