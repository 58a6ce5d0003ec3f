//! Shared-resource model for the cross-project coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProjectId, ResourceId};
use super::project::ProjectPriority;

/// Kind of a shared resource. Kind decides preemption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A filesystem subtree. Never preempted.
    Path,
    /// A bounded external service, e.g. a shared CI runner. Preemptible.
    Service,
    /// A credential or token. Never preempted.
    Credential,
    /// A network port. Preemptible.
    Port,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Service => "service",
            Self::Credential => "credential",
            Self::Port => "port",
        }
    }

    /// Whether a higher-priority project may preempt a waiter of this kind.
    pub const fn is_preemptible(&self) -> bool {
        matches!(self, Self::Service | Self::Port)
    }
}

/// A pending acquire in a resource's waiter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waiter {
    pub project_id: ProjectId,
    pub priority: ProjectPriority,
    /// Arrival order within the coordinator; FIFO within a priority class.
    pub arrival_seq: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// A registered shared resource with its holder and waiter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub holder: Option<ProjectId>,
    #[serde(default)]
    pub waiters: Vec<Waiter>,
}

impl SharedResource {
    pub fn new(id: ResourceId, kind: ResourceKind) -> Self {
        Self {
            id,
            kind,
            holder: None,
            waiters: Vec::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }
}
