//! Engine error taxonomy.
//!
//! One typed enum covers every fallible operation in the engine. Errors on
//! the command path are surfaced in the ack and emitted as events; errors in
//! background work are events only; invariant violations are fatal to the
//! offending project orchestrator and escalate to the global orchestrator.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use super::models::ids::{CycleId, ProjectId, ResourceId};

/// Result alias used by every fallible engine operation.
pub type EngineResult<T> = Result<T, EngineError>;

/// All error kinds the engine produces, independent of transport.
///
/// Serialize-only: errors travel outward in command acks; they are never
/// read back.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum EngineError {
    /// Attempted verb is not allowed in the current state.
    #[error("invalid transition: {attempted} not allowed in {current} (allowed: {})", allowed.join(", "))]
    InvalidTransition {
        current: String,
        attempted: String,
        allowed: Vec<String>,
    },

    /// Verb was valid but a guard predicate rejected it.
    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    /// A later sprint plan overlapped an earlier one in the same queue.
    #[error("conflicting sprint plan: {reason}")]
    ConflictingPlan { reason: String },

    /// Two project subtrees overlap without a declared dependency edge.
    #[error("path conflict: {second} overlaps {first} with no dependency edge")]
    PathConflict { first: PathBuf, second: PathBuf },

    /// Granting a pending acquire would create a wait-for cycle.
    #[error("deadlock avoided: acquire of {resource} by {project} refused")]
    DeadlockAvoided {
        resource: ResourceId,
        project: ProjectId,
    },

    /// An agent invocation exceeded its deadline.
    #[error("agent timed out after {deadline_secs}s (cycle {cycle}, phase {phase}, attempt {attempt})")]
    AgentTimeout {
        cycle: CycleId,
        phase: String,
        attempt: u32,
        deadline_secs: u64,
    },

    /// An agent invocation completed with a failure.
    #[error("agent failed (cycle {cycle}, phase {phase}): {detail}")]
    AgentFailure {
        cycle: CycleId,
        phase: String,
        detail: String,
    },

    /// A phase exhausted its retry budget; the cycle is parked for a human.
    #[error("cycle {cycle} needs human attention: {reason}")]
    NeedsHumanAttention { cycle: CycleId, reason: String },

    /// A shared-resource acquire expired before the resource was granted.
    #[error("acquire of {resource} timed out after {deadline_secs}s")]
    AcquireTimeout {
        resource: ResourceId,
        deadline_secs: u64,
    },

    /// The scheduler could not push a new quota to a project orchestrator.
    #[error("quota apply failed for project {project}: {detail}")]
    QuotaApplyFailed { project: ProjectId, detail: String },

    /// A persisted snapshot failed integrity checks on load.
    #[error("snapshot corrupt at {path}: {detail}")]
    SnapshotCorrupt { path: PathBuf, detail: String },

    /// A persisted snapshot carries a schema tag this build does not know.
    #[error("snapshot schema {found} incompatible (supported: {supported})")]
    SchemaIncompatible { found: u32, supported: u32 },

    /// Forced shutdown discarded in-flight work.
    #[error("interrupted by forced shutdown")]
    Interrupted,

    /// A postcondition of the engine was broken. Fatal to the project
    /// orchestrator; the global orchestrator restarts it from snapshot.
    #[error("internal invariant violated: {detail}")]
    InternalInvariantViolated { detail: String },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Storage I/O failure.
    #[error("storage error at {path}: {detail}")]
    Storage { path: PathBuf, detail: String },

    /// A persisted document failed to encode or decode.
    #[error("serialization error: {detail}")]
    Serialization { detail: String },
}

impl EngineError {
    /// True for multi-actor conflicts recovered by rejecting one actor.
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConflictingPlan { .. } | Self::PathConflict { .. } | Self::DeadlockAvoided { .. }
        )
    }

    /// True if retrying the same operation later could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AgentTimeout { .. }
                | Self::AgentFailure { .. }
                | Self::AcquireTimeout { .. }
                | Self::QuotaApplyFailed { .. }
        )
    }

    /// True for errors that are fatal to the owning project orchestrator.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InternalInvariantViolated { .. }
                | Self::SnapshotCorrupt { .. }
                | Self::SchemaIncompatible { .. }
        )
    }

    /// Short stable kind name, used in event payloads and command acks.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::PreconditionFailed { .. } => "PreconditionFailed",
            Self::ConflictingPlan { .. } => "ConflictingPlan",
            Self::PathConflict { .. } => "PathConflict",
            Self::DeadlockAvoided { .. } => "DeadlockAvoided",
            Self::AgentTimeout { .. } => "AgentTimeout",
            Self::AgentFailure { .. } => "AgentFailure",
            Self::NeedsHumanAttention { .. } => "NeedsHumanAttention",
            Self::AcquireTimeout { .. } => "AcquireTimeout",
            Self::QuotaApplyFailed { .. } => "QuotaApplyFailed",
            Self::SnapshotCorrupt { .. } => "SnapshotCorrupt",
            Self::SchemaIncompatible { .. } => "SchemaIncompatible",
            Self::Interrupted => "Interrupted",
            Self::InternalInvariantViolated { .. } => "InternalInvariantViolated",
            Self::NotFound { .. } => "NotFound",
            Self::Storage { .. } => "Storage",
            Self::Serialization { .. } => "Serialization",
        }
    }

    /// Wrap an I/O error with the path it touched.
    pub fn storage(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            detail: err.to_string(),
        }
    }
}
