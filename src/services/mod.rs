//! Engine services: the orchestration components C1..C10.

pub mod broadcaster;
pub mod cycle_coordinator;
pub mod event_bus;
pub mod global_orchestrator;
pub mod project_orchestrator;
pub mod registry;
pub mod scheduler;
pub mod shared_resources;

pub use broadcaster::{AttachOutcome, Broadcaster, BroadcasterConfig};
pub use cycle_coordinator::{Admission, CycleCoordinator};
pub use event_bus::{EventBus, EventBusConfig, EventFilter, EventStream};
pub use global_orchestrator::{GlobalOrchestrator, InspectReport, ProjectReport};
pub use project_orchestrator::{
    CycleSummary, OrchestratorDeps, ProjectInspect, ProjectOrchestratorHandle, RunControl,
};
pub use registry::{candidates_from, path_admissible, ProjectCandidate, ProjectRegistry};
pub use scheduler::{
    compute_allocations, AllocationInput, QuotaSink, RebalanceTrigger, ResourceScheduler,
};
pub use shared_resources::{paths_conflict, CrossProjectCoordinator};
