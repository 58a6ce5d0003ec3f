//! Engine event model.
//!
//! Events are the only way the effect of an accepted command becomes
//! observable. The bus assigns each event a strictly increasing sequence
//! number and a monotone timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CorrelationId, CycleId, ProjectId, ResourceId, SprintId, StoryId};
use super::quota::ResourceQuota;

/// Component that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    EventBus,
    Registry,
    WorkflowMachine,
    TddMachine,
    CycleCoordinator,
    ProjectOrchestrator,
    Scheduler,
    CrossProjectCoordinator,
    GlobalOrchestrator,
    Broadcaster,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EventBus => "event_bus",
            Self::Registry => "registry",
            Self::WorkflowMachine => "workflow_machine",
            Self::TddMachine => "tdd_machine",
            Self::CycleCoordinator => "cycle_coordinator",
            Self::ProjectOrchestrator => "project_orchestrator",
            Self::Scheduler => "scheduler",
            Self::CrossProjectCoordinator => "cross_project_coordinator",
            Self::GlobalOrchestrator => "global_orchestrator",
            Self::Broadcaster => "broadcaster",
        };
        write!(f, "{name}")
    }
}

/// Delivery class of an event.
///
/// Control events are delivered synchronously inside the emitter's critical
/// section; data events go through the deferred dispatcher so metrics never
/// block a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Control,
    Data,
}

/// Health of a project orchestrator as seen by the global orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Ready,
    Unhealthy,
    Failed,
    Stopped,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Typed payload of an engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStateChanged {
        project_id: ProjectId,
        from: String,
        to: String,
    },
    TddPhaseChanged {
        project_id: ProjectId,
        cycle_id: CycleId,
        from: String,
        to: String,
    },
    CycleAdmitted {
        project_id: ProjectId,
        cycle_id: CycleId,
        story_id: StoryId,
        phase: String,
    },
    CycleAborted {
        project_id: ProjectId,
        cycle_id: CycleId,
        reason: String,
    },
    SprintStarted {
        project_id: ProjectId,
        sprint_id: SprintId,
        story_count: usize,
    },
    QuotaChanged {
        project_id: ProjectId,
        quota: ResourceQuota,
    },
    ResourcePressure {
        project_id: ProjectId,
        resource: String,
        pressure: f64,
    },
    ConflictDetected {
        kind: String,
        detail: String,
        project_id: Option<ProjectId>,
        resource: Option<ResourceId>,
    },
    ProjectHealthChanged {
        project_id: ProjectId,
        from: HealthState,
        to: HealthState,
    },
    SnapshotTaken {
        project_id: ProjectId,
        sequence: u64,
    },
    Error {
        kind: String,
        message: String,
        project_id: Option<ProjectId>,
        cycle_id: Option<CycleId>,
    },
}

impl EventPayload {
    /// Discriminant name used by subscriber filters and the external stream.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStateChanged { .. } => "WorkflowStateChanged",
            Self::TddPhaseChanged { .. } => "TDDPhaseChanged",
            Self::CycleAdmitted { .. } => "CycleAdmitted",
            Self::CycleAborted { .. } => "CycleAborted",
            Self::SprintStarted { .. } => "SprintStarted",
            Self::QuotaChanged { .. } => "QuotaChanged",
            Self::ResourcePressure { .. } => "ResourcePressure",
            Self::ConflictDetected { .. } => "ConflictDetected",
            Self::ProjectHealthChanged { .. } => "ProjectHealthChanged",
            Self::SnapshotTaken { .. } => "SnapshotTaken",
            Self::Error { .. } => "Error",
        }
    }

    /// Metrics samples are data-plane; everything else is control-plane.
    pub const fn class(&self) -> EventClass {
        match self {
            Self::ResourcePressure { .. } => EventClass::Data,
            _ => EventClass::Control,
        }
    }

    /// The project this payload concerns, when it concerns exactly one.
    pub fn project_id(&self) -> Option<ProjectId> {
        match self {
            Self::WorkflowStateChanged { project_id, .. }
            | Self::TddPhaseChanged { project_id, .. }
            | Self::CycleAdmitted { project_id, .. }
            | Self::CycleAborted { project_id, .. }
            | Self::SprintStarted { project_id, .. }
            | Self::QuotaChanged { project_id, .. }
            | Self::ResourcePressure { project_id, .. }
            | Self::ProjectHealthChanged { project_id, .. }
            | Self::SnapshotTaken { project_id, .. } => Some(*project_id),
            Self::ConflictDetected { project_id, .. } | Self::Error { project_id, .. } => {
                *project_id
            }
        }
    }
}

/// A fully stamped engine event, as delivered to subscribers and persisted
/// to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Strictly increasing, assigned by the bus.
    pub seq: u64,
    /// Monotone within the bus: `e1.seq < e2.seq` implies `e1.ts <= e2.ts`.
    pub ts: DateTime<Utc>,
    pub origin: Component,
    pub correlation_id: Option<CorrelationId>,
    pub payload: EventPayload,
}

impl EngineEvent {
    /// An unstamped event; the bus assigns seq and ts on publish.
    pub fn unstamped(origin: Component, payload: EventPayload) -> Self {
        Self {
            seq: 0,
            ts: Utc::now(),
            origin,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }
}
