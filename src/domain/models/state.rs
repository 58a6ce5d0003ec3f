//! Per-project state arena.
//!
//! All sprint/story/cycle objects for one project live in id-keyed maps on
//! [`ProjectState`]; references between them are ids, and traversal is
//! lookup. The whole arena serializes into the project snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::machines::workflow::WorkflowState;
use crate::domain::models::cycle::TddCycle;
use crate::domain::models::ids::{CycleId, SprintId, StoryId};
use crate::domain::models::project::Project;
use crate::domain::models::receipt::{AgentReceipt, ReceiptKey};
use crate::domain::models::story::{Sprint, Story};

mod receipt_seq {
    use super::{AgentReceipt, BTreeMap, ReceiptKey};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ReceiptKey, AgentReceipt>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ReceiptKey, AgentReceipt>, D::Error> {
        let receipts = Vec::<AgentReceipt>::deserialize(deserializer)?;
        Ok(receipts.into_iter().map(|r| (r.key, r)).collect())
    }
}

/// The complete mutable state of one project orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project: Project,
    pub workflow: WorkflowState,
    pub stories: BTreeMap<StoryId, Story>,
    pub sprints: BTreeMap<SprintId, Sprint>,
    pub cycles: BTreeMap<CycleId, TddCycle>,
    /// Agent side-effect receipts, keyed `(cycle, phase, attempt)`.
    /// Persisted as a sequence; structured keys are not valid JSON keys.
    #[serde(with = "receipt_seq")]
    pub receipts: BTreeMap<ReceiptKey, AgentReceipt>,
    /// Sequence of the last event this project persisted a snapshot at.
    pub last_snapshot_seq: u64,
}

impl ProjectState {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            workflow: WorkflowState::Idle,
            stories: BTreeMap::new(),
            sprints: BTreeMap::new(),
            cycles: BTreeMap::new(),
            receipts: BTreeMap::new(),
            last_snapshot_seq: 0,
        }
    }

    pub fn story(&self, id: StoryId) -> EngineResult<&Story> {
        self.stories.get(&id).ok_or(EngineError::NotFound { entity: "story", id: id.to_string() })
    }

    pub fn story_mut(&mut self, id: StoryId) -> EngineResult<&mut Story> {
        self.stories
            .get_mut(&id)
            .ok_or(EngineError::NotFound { entity: "story", id: id.to_string() })
    }

    pub fn sprint(&self, id: SprintId) -> EngineResult<&Sprint> {
        self.sprints.get(&id).ok_or(EngineError::NotFound { entity: "sprint", id: id.to_string() })
    }

    pub fn sprint_mut(&mut self, id: SprintId) -> EngineResult<&mut Sprint> {
        self.sprints
            .get_mut(&id)
            .ok_or(EngineError::NotFound { entity: "sprint", id: id.to_string() })
    }

    pub fn cycle(&self, id: CycleId) -> EngineResult<&TddCycle> {
        self.cycles.get(&id).ok_or(EngineError::NotFound { entity: "cycle", id: id.to_string() })
    }

    pub fn cycle_mut(&mut self, id: CycleId) -> EngineResult<&mut TddCycle> {
        self.cycles
            .get_mut(&id)
            .ok_or(EngineError::NotFound { entity: "cycle", id: id.to_string() })
    }

    /// The live (non-terminal) cycle for a story, if one exists.
    pub fn live_cycle_for_story(&self, story_id: StoryId) -> Option<&TddCycle> {
        self.cycles.values().find(|c| c.story_id == story_id && !c.is_terminal())
    }

    /// All live cycles, in id order.
    pub fn live_cycles(&self) -> Vec<&TddCycle> {
        self.cycles.values().filter(|c| !c.is_terminal()).collect()
    }

    /// Admit a new cycle for a story.
    ///
    /// Enforces the one-live-cycle-per-story invariant.
    pub fn admit_cycle(&mut self, story_id: StoryId) -> EngineResult<CycleId> {
        if let Some(existing) = self.live_cycle_for_story(story_id) {
            return Err(EngineError::PreconditionFailed {
                reason: format!("story {story_id} already has live cycle {}", existing.id),
            });
        }
        let cycle = TddCycle::new(story_id);
        let id = cycle.id;
        self.cycles.insert(id, cycle);
        Ok(id)
    }

    /// Record a receipt; re-recording the same key is rejected so a replay
    /// can detect an already-applied side effect.
    pub fn record_receipt(&mut self, receipt: AgentReceipt) -> EngineResult<()> {
        if self.receipts.contains_key(&receipt.key) {
            return Err(EngineError::PreconditionFailed {
                reason: format!("receipt {} already recorded", receipt.key),
            });
        }
        self.receipts.insert(receipt.key, receipt);
        Ok(())
    }

    pub fn has_receipt(&self, key: &ReceiptKey) -> bool {
        self.receipts.contains_key(key)
    }

    /// Verify the arena's internal invariants; used by tests and after
    /// snapshot restore.
    pub fn check_invariants(&self) -> EngineResult<()> {
        // At most one live cycle per story.
        let mut live_per_story: BTreeMap<StoryId, u32> = BTreeMap::new();
        for cycle in self.cycles.values() {
            if !cycle.is_terminal() {
                *live_per_story.entry(cycle.story_id).or_default() += 1;
            }
        }
        if let Some((story, count)) = live_per_story.iter().find(|(_, count)| **count > 1) {
            return Err(EngineError::InternalInvariantViolated {
                detail: format!("story {story} has {count} live cycles"),
            });
        }
        // Every sprint story exists in the arena.
        for sprint in self.sprints.values() {
            for story_id in &sprint.story_ids {
                if !self.stories.contains_key(story_id) {
                    return Err(EngineError::InternalInvariantViolated {
                        detail: format!("sprint {} references missing story {story_id}", sprint.id),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::project::ProjectPriority;

    fn state() -> ProjectState {
        ProjectState::new(Project::new("alpha", "/tmp/alpha", ProjectPriority::Normal))
    }

    #[test]
    fn test_admit_cycle_enforces_single_live_cycle() {
        let mut state = state();
        let story = Story::new(state.project.id, "S1");
        let story_id = story.id;
        state.stories.insert(story_id, story);

        let first = state.admit_cycle(story_id).unwrap();
        let err = state.admit_cycle(story_id).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        // Terminal cycle frees the story.
        state.cycles.get_mut(&first).unwrap().phase =
            crate::domain::models::cycle::TddPhase::Commit;
        state.admit_cycle(story_id).unwrap();
    }

    #[test]
    fn test_receipt_dedup() {
        let mut state = state();
        let key = ReceiptKey {
            cycle_id: CycleId::new(),
            phase: crate::domain::models::cycle::TddPhaseKind::Commit,
            attempt: 1,
        };
        state.record_receipt(AgentReceipt::success(key, "ok")).unwrap();
        assert!(state.has_receipt(&key));
        let err = state.record_receipt(AgentReceipt::success(key, "again")).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[test]
    fn test_invariant_check_catches_double_live_cycle() {
        let mut state = state();
        let story = Story::new(state.project.id, "S1");
        let story_id = story.id;
        state.stories.insert(story_id, story);
        // Bypass admit_cycle to corrupt the arena.
        state.cycles.insert(CycleId::new(), TddCycle::new(story_id));
        state.cycles.insert(CycleId::new(), TddCycle::new(story_id));
        let err = state.check_invariants().unwrap_err();
        assert!(matches!(err, EngineError::InternalInvariantViolated { .. }));
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = state();
        let story = Story::new(state.project.id, "S1");
        let story_id = story.id;
        state.stories.insert(story_id, story);
        state.admit_cycle(story_id).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let back: ProjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
