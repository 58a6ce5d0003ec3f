//! Multi-cycle coordinator - bounds and orders a project's live TDD cycles.
//!
//! Owned by the project orchestrator and driven from its single-consumer
//! command loop, so all bookkeeping here is synchronous. Stories wait FIFO
//! for a free cycle slot; a terminating cycle admits the next waiter.

use std::collections::VecDeque;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::cycle::PauseReason;
use crate::domain::models::ids::{CycleId, StoryId};
use crate::domain::models::state::ProjectState;
use crate::domain::models::story::StoryState;

/// Outcome of asking for a cycle slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the cycle was created.
    Admitted { cycle_id: CycleId },
    /// All slots busy; the story joined the wait list.
    Enqueued { position: usize },
}

/// Coordinates the live cycle set of one project.
pub struct CycleCoordinator {
    /// Current slot capacity; updated on quota changes. In-flight cycles
    /// above a lowered capacity run to completion.
    capacity: u32,
    waitlist: VecDeque<StoryId>,
}

impl CycleCoordinator {
    pub fn new(capacity: u32) -> Self {
        Self { capacity: capacity.max(1), waitlist: VecDeque::new() }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Apply a new capacity. Never evicts live cycles; a lowered capacity
    /// only throttles future admissions.
    pub fn set_capacity(&mut self, capacity: u32) {
        self.capacity = capacity.max(1);
    }

    pub fn waitlist(&self) -> impl Iterator<Item = &StoryId> {
        self.waitlist.iter()
    }

    fn has_free_slot(&self, state: &ProjectState) -> bool {
        (state.live_cycles().len() as u32) < self.capacity
    }

    /// Request a cycle slot for a story entering the sprint.
    pub fn request_slot(
        &mut self,
        state: &mut ProjectState,
        story_id: StoryId,
    ) -> EngineResult<Admission> {
        if state.live_cycle_for_story(story_id).is_some() {
            return Err(EngineError::PreconditionFailed {
                reason: format!("story {story_id} already has a live cycle"),
            });
        }
        if self.waitlist.contains(&story_id) {
            return Err(EngineError::PreconditionFailed {
                reason: format!("story {story_id} is already waiting for a slot"),
            });
        }
        if self.has_free_slot(state) {
            let cycle_id = state.admit_cycle(story_id)?;
            Ok(Admission::Admitted { cycle_id })
        } else {
            self.waitlist.push_back(story_id);
            Ok(Admission::Enqueued { position: self.waitlist.len() })
        }
    }

    /// A cycle reached a terminal phase: admit the next eligible waiter.
    ///
    /// Waiters whose story left `InSprint` in the meantime are dropped.
    pub fn on_cycle_terminal(&mut self, state: &mut ProjectState) -> EngineResult<Option<CycleId>> {
        while self.has_free_slot(state) {
            let Some(story_id) = self.waitlist.pop_front() else {
                return Ok(None);
            };
            let eligible = state
                .stories
                .get(&story_id)
                .is_some_and(|story| story.state == StoryState::InSprint);
            if !eligible {
                tracing::debug!(story = %story_id, "waiter no longer in sprint, dropped");
                continue;
            }
            let cycle_id = state.admit_cycle(story_id)?;
            return Ok(Some(cycle_id));
        }
        Ok(None)
    }

    /// Pick the deadlock victim among this project's live cycles: the one
    /// with the lowest cycle id (project priority was already applied by
    /// the cross-project coordinator when it chose this project).
    pub fn deadlock_victim(&self, state: &ProjectState, candidates: &[CycleId]) -> Option<CycleId> {
        state
            .live_cycles()
            .iter()
            .filter(|cycle| candidates.contains(&cycle.id))
            .map(|cycle| cycle.id)
            .min()
    }

    /// Pause a cycle as a deadlock victim.
    pub fn pause_victim(state: &mut ProjectState, cycle_id: CycleId, max_attempts: u32) -> EngineResult<()> {
        let cycle = state.cycle_mut(cycle_id)?;
        crate::domain::machines::tdd::apply_step(
            cycle,
            &crate::domain::machines::tdd::TddStep::Pause { reason: PauseReason::DeadlockVictim },
            &crate::domain::machines::tdd::PhaseEvidence::default(),
            max_attempts,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::cycle::TddPhase;
    use crate::domain::models::project::{Project, ProjectPriority};
    use crate::domain::models::story::Story;

    fn state_with_stories(count: usize) -> (ProjectState, Vec<StoryId>) {
        let mut state =
            ProjectState::new(Project::new("alpha", "/tmp/alpha", ProjectPriority::Normal));
        let mut ids = Vec::new();
        for i in 0..count {
            let mut story = Story::new(state.project.id, format!("S{i}"));
            story.state = StoryState::InSprint;
            ids.push(story.id);
            state.stories.insert(story.id, story);
        }
        (state, ids)
    }

    #[test]
    fn test_admission_up_to_capacity() {
        let (mut state, stories) = state_with_stories(3);
        let mut coordinator = CycleCoordinator::new(2);

        assert!(matches!(
            coordinator.request_slot(&mut state, stories[0]).unwrap(),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            coordinator.request_slot(&mut state, stories[1]).unwrap(),
            Admission::Admitted { .. }
        ));
        assert_eq!(
            coordinator.request_slot(&mut state, stories[2]).unwrap(),
            Admission::Enqueued { position: 1 }
        );
        assert_eq!(state.live_cycles().len(), 2);
    }

    #[test]
    fn test_waiter_admitted_on_termination() {
        let (mut state, stories) = state_with_stories(2);
        let mut coordinator = CycleCoordinator::new(1);

        let Admission::Admitted { cycle_id } =
            coordinator.request_slot(&mut state, stories[0]).unwrap()
        else {
            panic!("expected admission");
        };
        coordinator.request_slot(&mut state, stories[1]).unwrap();

        state.cycles.get_mut(&cycle_id).unwrap().phase = TddPhase::Commit;
        let admitted = coordinator.on_cycle_terminal(&mut state).unwrap();
        let cycle = state.cycle(admitted.unwrap()).unwrap();
        assert_eq!(cycle.story_id, stories[1]);
    }

    #[test]
    fn test_stale_waiters_skipped() {
        let (mut state, stories) = state_with_stories(3);
        let mut coordinator = CycleCoordinator::new(1);

        let Admission::Admitted { cycle_id } =
            coordinator.request_slot(&mut state, stories[0]).unwrap()
        else {
            panic!("expected admission");
        };
        coordinator.request_slot(&mut state, stories[1]).unwrap();
        coordinator.request_slot(&mut state, stories[2]).unwrap();

        // The first waiter's story got blocked while it waited.
        state.stories.get_mut(&stories[1]).unwrap().state = StoryState::Blocked;
        state.cycles.get_mut(&cycle_id).unwrap().phase = TddPhase::Commit;

        let admitted = coordinator.on_cycle_terminal(&mut state).unwrap().unwrap();
        assert_eq!(state.cycle(admitted).unwrap().story_id, stories[2]);
    }

    #[test]
    fn test_duplicate_requests_rejected() {
        let (mut state, stories) = state_with_stories(2);
        let mut coordinator = CycleCoordinator::new(1);
        coordinator.request_slot(&mut state, stories[0]).unwrap();
        let err = coordinator.request_slot(&mut state, stories[0]).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        coordinator.request_slot(&mut state, stories[1]).unwrap();
        let err = coordinator.request_slot(&mut state, stories[1]).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[test]
    fn test_capacity_lowering_keeps_live_cycles() {
        let (mut state, stories) = state_with_stories(3);
        let mut coordinator = CycleCoordinator::new(2);
        coordinator.request_slot(&mut state, stories[0]).unwrap();
        coordinator.request_slot(&mut state, stories[1]).unwrap();

        coordinator.set_capacity(1);
        assert_eq!(state.live_cycles().len(), 2, "live cycles keep running");

        // No admission happens even after one terminates, because one live
        // cycle already fills the lowered capacity.
        coordinator.request_slot(&mut state, stories[2]).unwrap();
        let live = state.live_cycles()[0].id;
        state.cycles.get_mut(&live).unwrap().phase = TddPhase::Commit;
        // One of two live cycles ended; the other still occupies the slot.
        assert_eq!(coordinator.on_cycle_terminal(&mut state).unwrap(), None);
    }

    #[test]
    fn test_deadlock_victim_is_lowest_cycle_id() {
        let (mut state, stories) = state_with_stories(2);
        let mut coordinator = CycleCoordinator::new(2);
        let Admission::Admitted { cycle_id: first } =
            coordinator.request_slot(&mut state, stories[0]).unwrap()
        else {
            panic!();
        };
        let Admission::Admitted { cycle_id: second } =
            coordinator.request_slot(&mut state, stories[1]).unwrap()
        else {
            panic!();
        };
        let victim = coordinator.deadlock_victim(&state, &[first, second]).unwrap();
        assert_eq!(victim, first.min(second));

        CycleCoordinator::pause_victim(&mut state, victim, 3).unwrap();
        let paused = state.cycle(victim).unwrap();
        assert!(matches!(paused.phase, TddPhase::Paused { .. }));
    }
}
