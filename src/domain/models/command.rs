//! Command surface of the engine.
//!
//! Every front-end delivers commands into the global orchestrator, which
//! dispatches them to the target project. Submission returns a synchronous
//! ack; the effect of an accepted command is observable only via events
//! carrying the same correlation id.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cycle::AbortReason;
use super::ids::{CorrelationId, CycleId, ProjectId, StoryId};
use super::project::{ProjectPriority, ProjectStatus, ResourceLimits};
use super::quota::AllocationStrategyKind;
use crate::domain::errors::EngineError;

/// Role carried by a principal. Identity itself is opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Agent,
}

/// The actor submitting a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub role: Role,
}

impl Principal {
    pub fn admin(name: impl Into<String>) -> Self {
        Self { name: name.into(), role: Role::Admin }
    }

    pub fn operator(name: impl Into<String>) -> Self {
        Self { name: name.into(), role: Role::Operator }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// `project.*` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProjectCommand {
    Register {
        name: String,
        path: PathBuf,
        #[serde(default)]
        priority: ProjectPriority,
        #[serde(default)]
        limits: Option<ResourceLimits>,
        #[serde(default)]
        dependencies: Vec<ProjectId>,
    },
    SetStatus {
        project_id: ProjectId,
        status: ProjectStatus,
    },
}

/// `backlog.*` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BacklogCommand {
    AddStory {
        project_id: ProjectId,
        description: String,
        #[serde(default)]
        acceptance_criteria: String,
        #[serde(default)]
        estimate: u32,
    },
    Prioritise {
        project_id: ProjectId,
        story_id: StoryId,
        rank: u32,
    },
    Approve {
        project_id: ProjectId,
        story_id: StoryId,
    },
}

/// `sprint.*` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SprintCommand {
    Plan {
        project_id: ProjectId,
        story_ids: Vec<StoryId>,
    },
    Start { project_id: ProjectId },
    Pause { project_id: ProjectId },
    Resume { project_id: ProjectId },
    Complete { project_id: ProjectId },
    ApproveReview { project_id: ProjectId },
    CompleteRetrospective { project_id: ProjectId },
    Abort { project_id: ProjectId },
}

/// `tdd.*` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TddCommand {
    Pause { cycle_id: CycleId },
    Resume { cycle_id: CycleId },
    Abort { cycle_id: CycleId, reason: AbortReason },
    ReviewCycle { cycle_id: CycleId },
    Overview { project_id: Option<ProjectId> },
}

/// `scheduler.*` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchedulerCommand {
    SetStrategy { strategy: AllocationStrategyKind },
    RebalanceNow,
}

/// Any command the engine accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Command {
    Project(ProjectCommand),
    Backlog(BacklogCommand),
    Sprint(SprintCommand),
    Tdd(TddCommand),
    Scheduler(SchedulerCommand),
}

impl Command {
    /// The project a command targets, if it targets one.
    pub fn project_id(&self) -> Option<ProjectId> {
        match self {
            Self::Project(ProjectCommand::SetStatus { project_id, .. })
            | Self::Backlog(
                BacklogCommand::AddStory { project_id, .. }
                | BacklogCommand::Prioritise { project_id, .. }
                | BacklogCommand::Approve { project_id, .. },
            )
            | Self::Sprint(
                SprintCommand::Plan { project_id, .. }
                | SprintCommand::Start { project_id }
                | SprintCommand::Pause { project_id }
                | SprintCommand::Resume { project_id }
                | SprintCommand::Complete { project_id }
                | SprintCommand::ApproveReview { project_id }
                | SprintCommand::CompleteRetrospective { project_id }
                | SprintCommand::Abort { project_id },
            ) => Some(*project_id),
            Self::Tdd(TddCommand::Overview { project_id }) => *project_id,
            _ => None,
        }
    }

    /// Stable verb name for logs and error messages.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Project(ProjectCommand::Register { .. }) => "project.register",
            Self::Project(ProjectCommand::SetStatus { .. }) => "project.setStatus",
            Self::Backlog(BacklogCommand::AddStory { .. }) => "backlog.addStory",
            Self::Backlog(BacklogCommand::Prioritise { .. }) => "backlog.prioritise",
            Self::Backlog(BacklogCommand::Approve { .. }) => "backlog.approve",
            Self::Sprint(SprintCommand::Plan { .. }) => "sprint.plan",
            Self::Sprint(SprintCommand::Start { .. }) => "sprint.start",
            Self::Sprint(SprintCommand::Pause { .. }) => "sprint.pause",
            Self::Sprint(SprintCommand::Resume { .. }) => "sprint.resume",
            Self::Sprint(SprintCommand::Complete { .. }) => "sprint.complete",
            Self::Sprint(SprintCommand::ApproveReview { .. }) => "sprint.review",
            Self::Sprint(SprintCommand::CompleteRetrospective { .. }) => "sprint.retro",
            Self::Sprint(SprintCommand::Abort { .. }) => "sprint.abort",
            Self::Tdd(TddCommand::Pause { .. }) => "tdd.pause",
            Self::Tdd(TddCommand::Resume { .. }) => "tdd.resume",
            Self::Tdd(TddCommand::Abort { .. }) => "tdd.abort",
            Self::Tdd(TddCommand::ReviewCycle { .. }) => "tdd.reviewCycle",
            Self::Tdd(TddCommand::Overview { .. }) => "tdd.overview",
            Self::Scheduler(SchedulerCommand::SetStrategy { .. }) => "scheduler.setStrategy",
            Self::Scheduler(SchedulerCommand::RebalanceNow) => "scheduler.rebalanceNow",
        }
    }
}

/// A command plus submission metadata, as queued at a project orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: CorrelationId,
    pub principal: Principal,
    pub command: Command,
    pub submitted_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(principal: Principal, command: Command) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            principal,
            command,
            submitted_at: Utc::now(),
        }
    }

    /// Resubmission with an explicit correlation id (idempotent retry).
    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }
}

/// Synchronous acknowledgement returned by `Submit`. Serialize-only, like
/// the error payload it carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum CommandAck {
    /// Command admitted to the queue; effects arrive as events.
    Accepted { correlation_id: CorrelationId },
    /// Command rejected; no state changed and no event was emitted.
    Rejected {
        correlation_id: CorrelationId,
        error: EngineError,
    },
}

impl CommandAck {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Self::Accepted { correlation_id } | Self::Rejected { correlation_id, .. } => {
                *correlation_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_verb_names() {
        let cmd = Command::Sprint(SprintCommand::Start { project_id: ProjectId::new() });
        assert_eq!(cmd.verb(), "sprint.start");
        let cmd = Command::Scheduler(SchedulerCommand::RebalanceNow);
        assert_eq!(cmd.verb(), "scheduler.rebalanceNow");
    }

    #[test]
    fn test_command_target_project() {
        let id = ProjectId::new();
        let cmd = Command::Backlog(BacklogCommand::Approve { project_id: id, story_id: StoryId::new() });
        assert_eq!(cmd.project_id(), Some(id));
        let cmd = Command::Scheduler(SchedulerCommand::RebalanceNow);
        assert_eq!(cmd.project_id(), None);
    }

    #[test]
    fn test_envelope_correlation_override() {
        let corr = CorrelationId::new();
        let env = CommandEnvelope::new(
            Principal::operator("ops"),
            Command::Scheduler(SchedulerCommand::RebalanceNow),
        )
        .with_correlation(corr);
        assert_eq!(env.correlation_id, corr);
    }

    #[test]
    fn test_ack_accessors() {
        let corr = CorrelationId::new();
        let ack = CommandAck::Rejected {
            correlation_id: corr,
            error: EngineError::Interrupted,
        };
        assert!(!ack.is_accepted());
        assert_eq!(ack.correlation_id(), corr);
    }

    #[test]
    fn test_command_serde_roundtrip() {
        let cmd = Command::Sprint(SprintCommand::Plan {
            project_id: ProjectId::new(),
            story_ids: vec![StoryId::new(), StoryId::new()],
        });
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }
}
