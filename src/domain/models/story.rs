//! Story and sprint domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProjectId, SprintId, StoryId};

/// Workflow substate of a backlog story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryState {
    /// In the backlog, not yet groomed.
    Backlog,
    /// Approved for sprint planning.
    SprintReady,
    /// Part of the running sprint; a TDD cycle may be live for it.
    InSprint,
    /// Cycle finished, awaiting sprint review.
    InReview,
    Done,
    Blocked,
}

impl Default for StoryState {
    fn default() -> Self {
        Self::Backlog
    }
}

impl StoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::SprintReady => "sprint_ready",
            Self::InSprint => "in_sprint",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    /// Whether the story can be pulled into a sprint plan.
    pub fn is_plannable(&self) -> bool {
        matches!(self, Self::SprintReady)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// A unit of sprint work, owned by one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub project_id: ProjectId,
    pub description: String,
    /// Opaque acceptance-criteria text, interpreted by agents and humans.
    #[serde(default)]
    pub acceptance_criteria: String,
    /// Estimate in points.
    #[serde(default)]
    pub estimate: u32,
    pub sprint_id: Option<SprintId>,
    pub state: StoryState,
    /// Backlog ordering rank; lower sorts first.
    #[serde(default)]
    pub rank: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    pub fn new(project_id: ProjectId, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: StoryId::new(),
            project_id,
            description: description.into(),
            acceptance_criteria: String::new(),
            estimate: 0,
            sprint_id: None,
            state: StoryState::Backlog,
            rank: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Lifecycle of a sprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintLifecycle {
    Planned,
    Active,
    Review,
    Retrospective,
    Complete,
}

impl SprintLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Review => "review",
            Self::Retrospective => "retrospective",
            Self::Complete => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// An ordered set of stories committed to one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    pub id: SprintId,
    pub project_id: ProjectId,
    /// Planning order; admission into TDD cycles follows this order.
    pub story_ids: Vec<StoryId>,
    pub lifecycle: SprintLifecycle,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Sprint {
    pub fn plan(project_id: ProjectId, story_ids: Vec<StoryId>) -> Self {
        Self {
            id: SprintId::new(),
            project_id,
            story_ids,
            lifecycle: SprintLifecycle::Planned,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn contains(&self, story: StoryId) -> bool {
        self.story_ids.contains(&story)
    }

    /// Whether another plan's story set overlaps this sprint's.
    pub fn overlaps(&self, other_story_ids: &[StoryId]) -> bool {
        other_story_ids.iter().any(|id| self.contains(*id))
    }
}
