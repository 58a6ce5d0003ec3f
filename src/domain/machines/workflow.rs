//! Workflow (sprint/backlog) state machine.
//!
//! ```text
//! Idle → BacklogReady → SprintPlanned → SprintActive → SprintReview
//!      → SprintRetrospective → Idle
//! ```
//!
//! Any non-terminal state may drop to `Blocked` on fatal command failure and
//! return to the prior state on `Resume`. The transition table is data; the
//! transition function is pure and never suspends.

use serde::{Deserialize, Serialize};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::ids::{SprintId, StoryId};

/// State of a project's workflow machine.
///
/// Externally tagged so it encodes into the binary snapshot as well as the
/// JSON documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// No backlog activity yet.
    Idle,
    /// Stories exist; sprint planning is possible.
    BacklogReady,
    /// A sprint is planned but not started.
    SprintPlanned { sprint_id: SprintId },
    /// The sprint is running. `paused` halts cycle admission without a
    /// state change.
    SprintActive { sprint_id: SprintId, paused: bool },
    /// All cycles settled; awaiting review approval.
    SprintReview { sprint_id: SprintId },
    /// Review approved; retrospective in progress.
    SprintRetrospective { sprint_id: SprintId },
    /// Dropped here on fatal command failure; `Resume` restores `prior`.
    Blocked {
        prior: Box<WorkflowState>,
        reason: String,
    },
}

impl WorkflowState {
    pub fn kind(&self) -> WorkflowStateKind {
        match self {
            Self::Idle => WorkflowStateKind::Idle,
            Self::BacklogReady => WorkflowStateKind::BacklogReady,
            Self::SprintPlanned { .. } => WorkflowStateKind::SprintPlanned,
            Self::SprintActive { .. } => WorkflowStateKind::SprintActive,
            Self::SprintReview { .. } => WorkflowStateKind::SprintReview,
            Self::SprintRetrospective { .. } => WorkflowStateKind::SprintRetrospective,
            Self::Blocked { .. } => WorkflowStateKind::Blocked,
        }
    }

    /// The sprint this state refers to, if any.
    pub fn sprint_id(&self) -> Option<SprintId> {
        match self {
            Self::SprintPlanned { sprint_id }
            | Self::SprintActive { sprint_id, .. }
            | Self::SprintReview { sprint_id }
            | Self::SprintRetrospective { sprint_id } => Some(*sprint_id),
            Self::Blocked { prior, .. } => prior.sprint_id(),
            Self::Idle | Self::BacklogReady => None,
        }
    }
}

/// Fieldless discriminant of [`WorkflowState`], used as a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStateKind {
    Idle,
    BacklogReady,
    SprintPlanned,
    SprintActive,
    SprintReview,
    SprintRetrospective,
    Blocked,
}

impl WorkflowStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::BacklogReady => "BacklogReady",
            Self::SprintPlanned => "SprintPlanned",
            Self::SprintActive => "SprintActive",
            Self::SprintReview => "SprintReview",
            Self::SprintRetrospective => "SprintRetrospective",
            Self::Blocked => "Blocked",
        }
    }
}

/// A workflow command verb, with the operands its guards need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum WorkflowVerb {
    DefineEpic,
    AddStory,
    PrioritiseStory,
    ApproveStory,
    PlanSprint { story_ids: Vec<StoryId> },
    StartSprint,
    PauseSprint,
    ResumeSprint,
    CompleteSprint,
    ApproveReview,
    CompleteRetrospective,
    /// Return from `Blocked` to the prior state.
    Resume,
    /// Reset to `Idle`. Admin principal only.
    Abort,
}

/// Fieldless discriminant of [`WorkflowVerb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowVerbKind {
    DefineEpic,
    AddStory,
    PrioritiseStory,
    ApproveStory,
    PlanSprint,
    StartSprint,
    PauseSprint,
    ResumeSprint,
    CompleteSprint,
    ApproveReview,
    CompleteRetrospective,
    Resume,
    Abort,
}

impl WorkflowVerbKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefineEpic => "DefineEpic",
            Self::AddStory => "AddStory",
            Self::PrioritiseStory => "PrioritiseStory",
            Self::ApproveStory => "ApproveStory",
            Self::PlanSprint => "PlanSprint",
            Self::StartSprint => "StartSprint",
            Self::PauseSprint => "PauseSprint",
            Self::ResumeSprint => "ResumeSprint",
            Self::CompleteSprint => "CompleteSprint",
            Self::ApproveReview => "ApproveReview",
            Self::CompleteRetrospective => "CompleteRetrospective",
            Self::Resume => "Resume",
            Self::Abort => "Abort",
        }
    }
}

impl WorkflowVerb {
    pub fn kind(&self) -> WorkflowVerbKind {
        match self {
            Self::DefineEpic => WorkflowVerbKind::DefineEpic,
            Self::AddStory => WorkflowVerbKind::AddStory,
            Self::PrioritiseStory => WorkflowVerbKind::PrioritiseStory,
            Self::ApproveStory => WorkflowVerbKind::ApproveStory,
            Self::PlanSprint { .. } => WorkflowVerbKind::PlanSprint,
            Self::StartSprint => WorkflowVerbKind::StartSprint,
            Self::PauseSprint => WorkflowVerbKind::PauseSprint,
            Self::ResumeSprint => WorkflowVerbKind::ResumeSprint,
            Self::CompleteSprint => WorkflowVerbKind::CompleteSprint,
            Self::ApproveReview => WorkflowVerbKind::ApproveReview,
            Self::CompleteRetrospective => WorkflowVerbKind::CompleteRetrospective,
            Self::Resume => WorkflowVerbKind::Resume,
            Self::Abort => WorkflowVerbKind::Abort,
        }
    }
}

/// Guard predicate attached to a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    /// No guard; the verb always applies in this state.
    None,
    /// Every planned story is approved and unblocked.
    StoriesPlannable,
    /// The planned sprint holds at least one story.
    SprintNonEmpty,
    /// Every story's cycle is committed or explicitly skipped.
    CyclesSettled,
    /// The submitting principal carries the admin role.
    AdminPrincipal,
}

/// One row of the transition table.
struct Rule {
    state: WorkflowStateKind,
    verb: WorkflowVerbKind,
    guard: Guard,
}

const fn rule(state: WorkflowStateKind, verb: WorkflowVerbKind, guard: Guard) -> Rule {
    Rule { state, verb, guard }
}

/// The full (state, verb) transition table. Everything not listed is an
/// invalid transition. `Abort` and `Resume` rows are handled alongside the
/// table because they apply to whole state classes.
const TABLE: &[Rule] = &[
    rule(WorkflowStateKind::Idle, WorkflowVerbKind::DefineEpic, Guard::None),
    rule(WorkflowStateKind::Idle, WorkflowVerbKind::AddStory, Guard::None),
    rule(WorkflowStateKind::Idle, WorkflowVerbKind::PrioritiseStory, Guard::None),
    rule(WorkflowStateKind::Idle, WorkflowVerbKind::ApproveStory, Guard::None),
    rule(WorkflowStateKind::BacklogReady, WorkflowVerbKind::DefineEpic, Guard::None),
    rule(WorkflowStateKind::BacklogReady, WorkflowVerbKind::AddStory, Guard::None),
    rule(WorkflowStateKind::BacklogReady, WorkflowVerbKind::PrioritiseStory, Guard::None),
    rule(WorkflowStateKind::BacklogReady, WorkflowVerbKind::ApproveStory, Guard::None),
    rule(WorkflowStateKind::BacklogReady, WorkflowVerbKind::PlanSprint, Guard::StoriesPlannable),
    rule(WorkflowStateKind::SprintPlanned, WorkflowVerbKind::StartSprint, Guard::SprintNonEmpty),
    rule(WorkflowStateKind::SprintActive, WorkflowVerbKind::PauseSprint, Guard::None),
    rule(WorkflowStateKind::SprintActive, WorkflowVerbKind::ResumeSprint, Guard::None),
    rule(WorkflowStateKind::SprintActive, WorkflowVerbKind::CompleteSprint, Guard::CyclesSettled),
    rule(WorkflowStateKind::SprintReview, WorkflowVerbKind::ApproveReview, Guard::None),
    rule(
        WorkflowStateKind::SprintRetrospective,
        WorkflowVerbKind::CompleteRetrospective,
        Guard::None,
    ),
    rule(WorkflowStateKind::Blocked, WorkflowVerbKind::Resume, Guard::None),
];

/// Guard inputs, gathered by the caller before invoking [`transition`].
///
/// The machine sees data, not repositories: gathering the inputs is the
/// orchestrator's job, so the transition itself stays pure and suspension
/// free.
#[derive(Debug, Clone, Default)]
pub struct GuardInputs {
    /// For PlanSprint: ids in the plan that are not approved-and-unblocked.
    pub unplannable_stories: Vec<StoryId>,
    /// For StartSprint: number of stories in the planned sprint.
    pub sprint_story_count: usize,
    /// For CompleteSprint: stories whose cycle is neither committed nor
    /// explicitly skipped.
    pub unsettled_stories: Vec<StoryId>,
    /// Whether the submitting principal is an admin.
    pub principal_is_admin: bool,
    /// For PlanSprint: the sprint id to move into (allocated by the caller).
    pub planned_sprint_id: Option<SprintId>,
}

/// Verbs allowed in the given state, for error reporting.
pub fn allowed_verbs(state: WorkflowStateKind) -> Vec<&'static str> {
    let mut verbs: Vec<&'static str> = TABLE
        .iter()
        .filter(|rule| rule.state == state)
        .map(|rule| rule.verb.as_str())
        .collect();
    // Abort applies in every state; Resume only via its Blocked table row.
    verbs.push(WorkflowVerbKind::Abort.as_str());
    verbs
}

fn invalid(state: &WorkflowState, verb: &WorkflowVerb) -> EngineError {
    EngineError::InvalidTransition {
        current: state.kind().as_str().to_string(),
        attempted: verb.kind().as_str().to_string(),
        allowed: allowed_verbs(state.kind()).iter().map(|s| (*s).to_string()).collect(),
    }
}

fn check_guard(guard: Guard, verb: &WorkflowVerb, inputs: &GuardInputs) -> EngineResult<()> {
    match guard {
        Guard::None => Ok(()),
        Guard::StoriesPlannable => {
            if let WorkflowVerb::PlanSprint { story_ids } = verb {
                if story_ids.is_empty() {
                    return Err(EngineError::PreconditionFailed {
                        reason: "sprint plan contains no stories".to_string(),
                    });
                }
            }
            if inputs.unplannable_stories.is_empty() {
                Ok(())
            } else {
                let ids: Vec<String> =
                    inputs.unplannable_stories.iter().map(ToString::to_string).collect();
                Err(EngineError::PreconditionFailed {
                    reason: format!("stories not approved and unblocked: {}", ids.join(", ")),
                })
            }
        }
        Guard::SprintNonEmpty => {
            if inputs.sprint_story_count > 0 {
                Ok(())
            } else {
                Err(EngineError::PreconditionFailed {
                    reason: "sprint holds no stories".to_string(),
                })
            }
        }
        Guard::CyclesSettled => {
            if inputs.unsettled_stories.is_empty() {
                Ok(())
            } else {
                let ids: Vec<String> =
                    inputs.unsettled_stories.iter().map(ToString::to_string).collect();
                Err(EngineError::PreconditionFailed {
                    reason: format!("stories with unsettled cycles: {}", ids.join(", ")),
                })
            }
        }
        Guard::AdminPrincipal => {
            if inputs.principal_is_admin {
                Ok(())
            } else {
                Err(EngineError::PreconditionFailed {
                    reason: "admin principal required".to_string(),
                })
            }
        }
    }
}

/// Apply one verb to a workflow state.
///
/// Pure: `(state, verb, guard inputs) → state' | error`. The caller applies
/// side effects (story/sprint mutation, events) after a successful return.
pub fn transition(
    state: &WorkflowState,
    verb: &WorkflowVerb,
    inputs: &GuardInputs,
) -> EngineResult<WorkflowState> {
    // Abort is allowed from every state, guarded on the admin role.
    if matches!(verb, WorkflowVerb::Abort) {
        check_guard(Guard::AdminPrincipal, verb, inputs)?;
        return Ok(WorkflowState::Idle);
    }

    let rule = TABLE
        .iter()
        .find(|rule| rule.state == state.kind() && rule.verb == verb.kind())
        .ok_or_else(|| invalid(state, verb))?;

    check_guard(rule.guard, verb, inputs)?;

    let next = match (state, verb) {
        (WorkflowState::Idle, WorkflowVerb::AddStory | WorkflowVerb::DefineEpic) => {
            WorkflowState::BacklogReady
        }
        // Grooming verbs keep the current state.
        (
            WorkflowState::Idle,
            WorkflowVerb::PrioritiseStory | WorkflowVerb::ApproveStory,
        ) => WorkflowState::Idle,
        (
            WorkflowState::BacklogReady,
            WorkflowVerb::DefineEpic
            | WorkflowVerb::AddStory
            | WorkflowVerb::PrioritiseStory
            | WorkflowVerb::ApproveStory,
        ) => WorkflowState::BacklogReady,
        (WorkflowState::BacklogReady, WorkflowVerb::PlanSprint { .. }) => {
            let sprint_id = inputs.planned_sprint_id.ok_or(EngineError::InternalInvariantViolated {
                detail: "PlanSprint guard passed without an allocated sprint id".to_string(),
            })?;
            WorkflowState::SprintPlanned { sprint_id }
        }
        (WorkflowState::SprintPlanned { sprint_id }, WorkflowVerb::StartSprint) => {
            WorkflowState::SprintActive { sprint_id: *sprint_id, paused: false }
        }
        (WorkflowState::SprintActive { sprint_id, .. }, WorkflowVerb::PauseSprint) => {
            WorkflowState::SprintActive { sprint_id: *sprint_id, paused: true }
        }
        (WorkflowState::SprintActive { sprint_id, .. }, WorkflowVerb::ResumeSprint) => {
            WorkflowState::SprintActive { sprint_id: *sprint_id, paused: false }
        }
        (WorkflowState::SprintActive { sprint_id, .. }, WorkflowVerb::CompleteSprint) => {
            WorkflowState::SprintReview { sprint_id: *sprint_id }
        }
        (WorkflowState::SprintReview { sprint_id }, WorkflowVerb::ApproveReview) => {
            WorkflowState::SprintRetrospective { sprint_id: *sprint_id }
        }
        (WorkflowState::SprintRetrospective { .. }, WorkflowVerb::CompleteRetrospective) => {
            WorkflowState::Idle
        }
        (WorkflowState::Blocked { prior, .. }, WorkflowVerb::Resume) => (**prior).clone(),
        _ => return Err(invalid(state, verb)),
    };

    Ok(next)
}

/// Drop a non-terminal state into `Blocked`, keeping the prior state for
/// `Resume`. Blocking a blocked state keeps the original prior.
pub fn block(state: WorkflowState, reason: impl Into<String>) -> WorkflowState {
    match state {
        WorkflowState::Blocked { prior, .. } => WorkflowState::Blocked {
            prior,
            reason: reason.into(),
        },
        other => WorkflowState::Blocked {
            prior: Box::new(other),
            reason: reason.into(),
        },
    }
}
