//! State store port - durable engine state.
//!
//! One store instance serves the whole engine: per-project documents and
//! snapshots live under `<project>/.orch-state/`, global documents under
//! `<root>/.orch-global/`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::EngineResult;
use crate::domain::models::event::EngineEvent;
use crate::domain::models::ids::ProjectId;
use crate::domain::models::project::Project;
use crate::domain::models::quota::{AllocationStrategyKind, ResourceQuota};
use crate::domain::models::state::ProjectState;

/// Persisted scheduler document (`scheduler.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerDoc {
    pub strategy: AllocationStrategyKind,
    /// Last computed allocation, keyed by project.
    #[serde(default)]
    pub last_allocation: Vec<ResourceQuota>,
}

/// Durable storage for engine state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the full project arena: JSON documents plus the binary
    /// snapshot, under the project's `.orch-state/` directory.
    async fn save_project(&self, state: &ProjectState) -> EngineResult<u64>;

    /// Restore a project arena from its snapshot. `Ok(None)` means a cold
    /// start; schema or integrity problems are errors.
    async fn load_project(&self, project_root: &Path) -> EngineResult<Option<ProjectState>>;

    /// Append one event to the project's bounded `events.log`.
    async fn append_project_event(
        &self,
        project_root: &Path,
        event: &EngineEvent,
    ) -> EngineResult<()>;

    /// Persist the project registry (`registry.json`).
    async fn save_registry(&self, projects: &[Project]) -> EngineResult<()>;

    /// Load the project registry; empty on first start.
    async fn load_registry(&self) -> EngineResult<Vec<Project>>;

    /// Persist the scheduler strategy and last allocation.
    async fn save_scheduler(&self, doc: &SchedulerDoc) -> EngineResult<()>;

    /// Load the scheduler document, if one was persisted.
    async fn load_scheduler(&self) -> EngineResult<Option<SchedulerDoc>>;

    /// Persist child heartbeat times (`heartbeats.bin`).
    async fn save_heartbeats(
        &self,
        beats: &HashMap<ProjectId, DateTime<Utc>>,
    ) -> EngineResult<()>;

    /// Load persisted heartbeats; empty on first start.
    async fn load_heartbeats(&self) -> EngineResult<HashMap<ProjectId, DateTime<Utc>>>;

    /// Append one event to the global bus ring (`events.log`).
    async fn append_global_event(&self, event: &EngineEvent) -> EngineResult<()>;

    /// Read persisted global events with `seq > after`, in order. Returns
    /// only what the bounded ring still holds.
    async fn read_global_events_after(&self, after: u64) -> EngineResult<Vec<EngineEvent>>;
}
