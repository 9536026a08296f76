//! Link intents recorded before the owning gateway has a backend record.
//!
//! The buffer holds, per external entity id, the assignment to apply once the
//! gateway is durable. An entry without an assignment is an unlink intent.
//! Entries are committed in groups:
//! - **Link**: one bulk-link call per distinct `(grow_id, stage)` pair
//! - **Unlink**: a single bulk-unlink call for every unlink intent

use crate::types::{Assignment, Stage};
use std::collections::BTreeMap;

/// Keyed overlay of link/unlink intents.
#[derive(Debug, Default)]
pub struct PendingLinks {
    entries: BTreeMap<String, Option<Assignment>>,
}

/// Pending entries grouped into backend calls.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CommitPlan {
    /// External ids to link, grouped by assignment.
    pub links: BTreeMap<Assignment, Vec<String>>,
    /// External ids to unlink.
    pub unlinks: Vec<String>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.unlinks.is_empty()
    }
}

impl PendingLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a link intent when both halves are present; otherwise removes
    /// any intent held for the entity.
    pub fn set(&mut self, entity_id: &str, grow_id: Option<i64>, stage: Option<Stage>) {
        match Assignment::from_parts(grow_id, stage) {
            Some(assignment) => {
                self.entries.insert(entity_id.to_string(), Some(assignment));
            }
            None => {
                self.entries.remove(entity_id);
            }
        }
    }

    /// Records an explicit unlink intent for an entity.
    ///
    /// A draft `unlink` goes through `set` and only withdraws the link
    /// intent; `GatewaySync::queue_unlink` uses this to force an unlink call
    /// at commit, for records the backend may already hold linked.
    pub fn set_unlink(&mut self, entity_id: &str) {
        self.entries.insert(entity_id.to_string(), None);
    }

    /// Returns the intent held for an entity: `Some(None)` is an unlink.
    pub fn get(&self, entity_id: &str) -> Option<Option<Assignment>> {
        self.entries.get(entity_id).copied()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Groups entries into the calls a commit issues.
    pub fn plan(&self) -> CommitPlan {
        let mut plan = CommitPlan::default();
        for (entity_id, intent) in &self.entries {
            match intent {
                Some(assignment) => plan
                    .links
                    .entry(*assignment)
                    .or_default()
                    .push(entity_id.clone()),
                None => plan.unlinks.push(entity_id.clone()),
            }
        }
        plan
    }

    /// Removes an entry once its intent has been committed. An entry that
    /// was replaced in the meantime is kept.
    pub fn settle(&mut self, entity_id: &str, committed: Option<Assignment>) -> bool {
        if self.entries.get(entity_id) == Some(&committed) {
            self.entries.remove(entity_id);
            return true;
        }
        false
    }

    /// Returns every entity id with an intent.
    pub fn entity_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_clear_leaves_no_entry() {
        let mut pending = PendingLinks::new();
        pending.set("switch.fan", Some(1), Some(Stage::Fruiting));
        assert!(pending.contains("switch.fan"));

        pending.set("switch.fan", None, None);
        assert!(!pending.contains("switch.fan"));
        assert!(pending.is_empty());
    }

    #[test]
    fn half_assignment_is_treated_as_no_intent() {
        let mut pending = PendingLinks::new();
        pending.set("switch.fan", Some(1), None);
        pending.set("sensor.temp", None, Some(Stage::Harvest));
        assert!(pending.is_empty());
    }

    #[test]
    fn plan_groups_by_grow_and_stage() {
        let mut pending = PendingLinks::new();
        pending.set("switch.fan", Some(1), Some(Stage::Fruiting));
        pending.set("sensor.temp", Some(1), Some(Stage::Fruiting));
        pending.set("sensor.humidity", Some(1), Some(Stage::Harvest));
        pending.set("light.grow", Some(2), Some(Stage::Fruiting));
        pending.set_unlink("switch.heater");

        let plan = pending.plan();
        assert_eq!(plan.links.len(), 3);
        assert_eq!(
            plan.links[&Assignment::new(1, Stage::Fruiting)],
            vec!["sensor.temp".to_string(), "switch.fan".to_string()]
        );
        assert_eq!(plan.unlinks, vec!["switch.heater".to_string()]);
    }

    #[test]
    fn empty_buffer_has_empty_plan() {
        assert!(PendingLinks::new().plan().is_empty());
    }

    #[test]
    fn settle_keeps_replaced_intent() {
        let mut pending = PendingLinks::new();
        pending.set("switch.fan", Some(1), Some(Stage::Fruiting));
        pending.set("sensor.temp", Some(1), Some(Stage::Fruiting));
        pending.set("sensor.temp", Some(2), Some(Stage::Harvest));

        let committed = Some(Assignment::new(1, Stage::Fruiting));
        assert!(pending.settle("switch.fan", committed));
        assert!(!pending.settle("sensor.temp", committed));
        assert_eq!(
            pending.get("sensor.temp"),
            Some(Some(Assignment::new(2, Stage::Harvest)))
        );
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn get_distinguishes_unlink_from_absent() {
        let mut pending = PendingLinks::new();
        pending.set_unlink("switch.fan");
        assert_eq!(pending.get("switch.fan"), Some(None));
        assert_eq!(pending.get("sensor.temp"), None);
    }
}
