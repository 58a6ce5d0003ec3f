//! Domain models.
//!
//! Pure domain entities with their validation rules.

pub mod command;
pub mod config;
pub mod cycle;
pub mod event;
pub mod ids;
pub mod project;
pub mod quota;
pub mod receipt;
pub mod resource;
pub mod state;
pub mod story;

pub use command::{
    BacklogCommand, Command, CommandAck, CommandEnvelope, Principal, ProjectCommand, Role,
    SchedulerCommand, SprintCommand, TddCommand,
};
pub use config::{
    EngineConfig, EventConfig, LoggingConfig, RunnersConfig, SchedulerConfig, SupervisionConfig,
};
pub use cycle::{
    AbortReason, CycleArtifacts, PauseReason, PhaseAttempts, TddCycle, TddPhase, TddPhaseKind,
    TestSelector,
};
pub use event::{Component, EngineEvent, EventClass, EventPayload, HealthState};
pub use ids::{CorrelationId, CycleId, ProjectId, ResourceId, SprintId, StoryId};
pub use project::{
    HourRange, Project, ProjectPriority, ProjectStatus, ResourceLimits, WorkWindow,
};
pub use quota::{AllocationStrategyKind, GlobalResources, ResourceQuota, UsageSample};
pub use receipt::{AgentReceipt, ReceiptKey};
pub use resource::{ResourceKind, SharedResource, Waiter};
pub use state::ProjectState;
pub use story::{Sprint, SprintLifecycle, Story, StoryState};
