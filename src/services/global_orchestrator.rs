//! Global orchestrator - top-level supervisor of all project orchestrators.
//!
//! Owns the registry, scheduler, cross-project coordinator, event bus and
//! broadcaster; spawns one supervised task per active project; watches
//! heartbeats; restarts crashed children from their last snapshot; and
//! dispatches the external command surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::command::{
    Command, CommandAck, CommandEnvelope, ProjectCommand, SchedulerCommand, TddCommand,
};
use crate::domain::models::config::EngineConfig;
use crate::domain::models::event::{Component, EngineEvent, EventPayload, HealthState};
use crate::domain::models::ids::{CycleId, ProjectId};
use crate::domain::models::project::{Project, ProjectStatus};
use crate::domain::models::quota::ResourceQuota;
use crate::domain::models::state::ProjectState;
use crate::domain::ports::{AgentExecutor, StateStore, TestRunner};
use crate::services::broadcaster::{Broadcaster, BroadcasterConfig};
use crate::services::event_bus::{EventBus, EventBusConfig, EventFilter};
use crate::services::project_orchestrator::{
    spawn, OrchestratorDeps, ProjectInspect, ProjectOrchestratorHandle,
};
use crate::services::registry::ProjectRegistry;
use crate::services::scheduler::ResourceScheduler;
use crate::services::shared_resources::CrossProjectCoordinator;

/// Diagnostic snapshot returned by `Inspect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReport {
    pub quotas: Vec<ResourceQuota>,
    pub projects: Vec<ProjectReport>,
}

/// One project in the inspect report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectReport {
    pub project_id: ProjectId,
    pub name: String,
    pub status: ProjectStatus,
    pub health: HealthState,
    pub quota: Option<ResourceQuota>,
    pub detail: Option<ProjectInspect>,
}

struct ChildEntry {
    handle: Arc<ProjectOrchestratorHandle>,
    health: HealthState,
    restarts: u32,
}

/// The global orchestrator (C9).
pub struct GlobalOrchestrator {
    config: EngineConfig,
    bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    registry: Arc<ProjectRegistry>,
    scheduler: Arc<ResourceScheduler>,
    resources: Arc<CrossProjectCoordinator>,
    broadcaster: Arc<Broadcaster>,
    agents: Arc<dyn AgentExecutor>,
    tests: Arc<dyn TestRunner>,
    children: Arc<RwLock<HashMap<ProjectId, ChildEntry>>>,
    heartbeat_tx: mpsc::Sender<ProjectId>,
    heartbeat_rx: Mutex<Option<mpsc::Receiver<ProjectId>>>,
    heartbeats: Arc<RwLock<HashMap<ProjectId, DateTime<Utc>>>>,
    /// Which project owns a cycle, maintained from admission events.
    cycle_index: Arc<RwLock<HashMap<CycleId, ProjectId>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl GlobalOrchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        agents: Arc<dyn AgentExecutor>,
        tests: Arc<dyn TestRunner>,
    ) -> Arc<Self> {
        let bus = Arc::new(
            EventBus::new(EventBusConfig {
                channel_capacity: config.events.channel_capacity,
                ..Default::default()
            })
            .with_store(store.clone()),
        );
        let registry = Arc::new(ProjectRegistry::new(store.clone()));
        let scheduler = Arc::new(ResourceScheduler::new(
            bus.clone(),
            store.clone(),
            config.resources,
            config.scheduler.clone(),
        ));
        let resources = Arc::new(CrossProjectCoordinator::new(bus.clone()));
        let broadcaster = Arc::new(Broadcaster::new(
            bus.clone(),
            BroadcasterConfig {
                ring_capacity: config.events.ring_capacity,
                ..Default::default()
            },
        ));
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(256);

        Arc::new(Self {
            config,
            bus,
            store,
            registry,
            scheduler,
            resources,
            broadcaster,
            agents,
            tests,
            children: Arc::new(RwLock::new(HashMap::new())),
            heartbeat_tx,
            heartbeat_rx: Mutex::new(Some(heartbeat_rx)),
            heartbeats: Arc::new(RwLock::new(HashMap::new())),
            cycle_index: Arc::new(RwLock::new(HashMap::new())),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<ResourceScheduler> {
        &self.scheduler
    }

    pub fn resources(&self) -> &Arc<CrossProjectCoordinator> {
        &self.resources
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Load persisted state and bring every active project up.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        self.bus.initialize_sequence_from_store().await;
        let mut background = self.background.lock().await;
        background.push(self.bus.start_dispatcher());

        if let Err(e) = self.broadcaster.preload(&self.store).await {
            tracing::warn!(error = %e, "broadcaster ring preload failed");
        }
        background.push(self.broadcaster.start());

        let loaded = self.registry.load().await?;
        tracing::info!(projects = loaded, "registry loaded");

        self.scheduler.load().await?;
        {
            let registry = self.registry.clone();
            self.scheduler.set_project_source(move || registry.active_snapshot()).await;
        }
        background.push(self.scheduler.start());

        {
            let beats = self.store.load_heartbeats().await?;
            *self.heartbeats.write().await = beats;
        }
        background.push(self.spawn_heartbeat_monitor());
        background.push(self.spawn_event_mirror());
        drop(background);

        // Active projects start; Paused/Maintenance stay registered only.
        for project in self.registry.active().await {
            if let Err(e) = self.start_child(project.clone()).await {
                tracing::error!(project = %project.id, error = %e, "child failed to start");
                self.mark_health(project.id, HealthState::Failed).await;
            }
        }
        self.scheduler.rebalance_now().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Child lifecycle
    // ------------------------------------------------------------------

    async fn start_child(self: &Arc<Self>, project: Project) -> EngineResult<()> {
        {
            let children = self.children.read().await;
            if let Some(entry) = children.get(&project.id) {
                if entry.health == HealthState::Ready {
                    return Ok(());
                }
            }
        }

        // Restore from the last snapshot, or cold-start a fresh arena.
        let state = match self.store.load_project(&project.path).await? {
            Some(mut state) => {
                // Registry data wins over the snapshot for identity fields.
                state.project = project.clone();
                state
            }
            None => ProjectState::new(project.clone()),
        };

        let quota = self
            .scheduler
            .allocations()
            .await
            .get(&project.id)
            .cloned()
            .unwrap_or_else(|| ResourceQuota::zero(project.id));

        let deps = OrchestratorDeps {
            bus: self.bus.clone(),
            store: self.store.clone(),
            agents: self.agents.clone(),
            tests: self.tests.clone(),
            resources: self.resources.clone(),
        };
        let handle = Arc::new(
            spawn(state, quota, self.config.supervision.clone(), deps, self.heartbeat_tx.clone())
                .await,
        );

        self.heartbeats.write().await.insert(project.id, Utc::now());
        {
            let mut children = self.children.write().await;
            let restarts =
                children.get(&project.id).map_or(0, |existing| existing.restarts);
            children.insert(
                project.id,
                ChildEntry { handle: handle.clone(), health: HealthState::Ready, restarts },
            );
        }
        self.scheduler.attach_sink(project.id, handle).await;
        self.emit_health(project.id, HealthState::Starting, HealthState::Ready).await;
        Ok(())
    }

    async fn stop_child(&self, project_id: ProjectId, graceful: bool) {
        let entry = self.children.write().await.remove(&project_id);
        if let Some(entry) = entry {
            entry.handle.shutdown(graceful);
            let deadline = Duration::from_secs(self.config.supervision.shutdown_deadline_secs);
            let handle = entry.handle;
            let joined = tokio::time::timeout(deadline, async {
                while handle.health() != HealthState::Stopped {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await;
            if joined.is_err() {
                tracing::warn!(project = %project_id, "child missed shutdown deadline, killed");
                handle.kill();
            }
            self.emit_health(project_id, HealthState::Ready, HealthState::Stopped).await;
        }
        self.scheduler.detach_sink(project_id).await;
        self.heartbeats.write().await.remove(&project_id);
    }

    /// One in-place restart from the last snapshot.
    async fn restart_child(self: &Arc<Self>, project_id: ProjectId) -> EngineResult<()> {
        let project = self.registry.get(project_id).await?;
        {
            let mut children = self.children.write().await;
            if let Some(entry) = children.get_mut(&project_id) {
                entry.handle.kill();
                entry.restarts += 1;
                entry.health = HealthState::Starting;
            }
        }
        // A fresh child resumes from the persisted phase and counters; the
        // restart count survives so only one in-place restart is spent.
        self.start_child(project).await
    }

    /// Operator-issued recovery for a `Failed` project.
    pub async fn recover(self: &Arc<Self>, project_id: ProjectId) -> EngineResult<()> {
        let project = self.registry.get(project_id).await?;
        {
            let mut children = self.children.write().await;
            if let Some(entry) = children.get_mut(&project_id) {
                entry.restarts = 0;
            }
        }
        self.start_child(project).await
    }

    async fn mark_health(&self, project_id: ProjectId, health: HealthState) {
        let mut children = self.children.write().await;
        if let Some(entry) = children.get_mut(&project_id) {
            entry.health = health;
        }
    }

    async fn emit_health(&self, project_id: ProjectId, from: HealthState, to: HealthState) {
        self.bus
            .publish(EngineEvent::unstamped(
                Component::GlobalOrchestrator,
                EventPayload::ProjectHealthChanged { project_id, from, to },
            ))
            .await;
    }

    // ------------------------------------------------------------------
    // Supervision tasks
    // ------------------------------------------------------------------

    fn spawn_heartbeat_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let rx = this.heartbeat_rx.lock().await.take();
            let Some(mut rx) = rx else {
                return;
            };
            let interval_secs = this.config.supervision.heartbeat_interval_secs;
            let limit = this.config.supervision.missed_heartbeat_limit;
            let mut check = tokio::time::interval(Duration::from_secs(interval_secs));
            check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    beat = rx.recv() => {
                        match beat {
                            Some(project_id) => {
                                this.heartbeats.write().await.insert(project_id, Utc::now());
                            }
                            None => break,
                        }
                    }
                    _ = check.tick() => {
                        this.check_heartbeats(interval_secs, limit).await;
                    }
                }
            }
        })
    }

    async fn check_heartbeats(self: &Arc<Self>, interval_secs: u64, limit: u32) {
        let cutoff =
            Utc::now() - chrono::Duration::seconds((interval_secs * u64::from(limit)) as i64);
        let stale: Vec<ProjectId> = {
            let beats = self.heartbeats.read().await;
            let children = self.children.read().await;
            children
                .iter()
                .filter(|(id, entry)| {
                    entry.health == HealthState::Ready
                        && beats.get(id).is_none_or(|seen| *seen < cutoff)
                })
                .map(|(id, _)| *id)
                .collect()
        };

        for project_id in stale {
            tracing::warn!(project = %project_id, "heartbeats missed, child unhealthy");
            self.mark_health(project_id, HealthState::Unhealthy).await;
            self.emit_health(project_id, HealthState::Ready, HealthState::Unhealthy).await;

            let attempted = {
                let children = self.children.read().await;
                children.get(&project_id).map_or(0, |entry| entry.restarts)
            };
            if attempted == 0 {
                if let Err(e) = self.restart_child(project_id).await {
                    tracing::error!(project = %project_id, error = %e, "restart failed");
                    self.mark_health(project_id, HealthState::Failed).await;
                    self.emit_health(project_id, HealthState::Unhealthy, HealthState::Failed)
                        .await;
                }
            } else {
                // One restart was already spent; a human must recover.
                self.mark_health(project_id, HealthState::Failed).await;
                self.emit_health(project_id, HealthState::Unhealthy, HealthState::Failed).await;
            }
        }

        let beats = self.heartbeats.read().await.clone();
        if let Err(e) = self.store.save_heartbeats(&beats).await {
            tracing::warn!(error = %e, "heartbeat persistence failed");
        }

        self.sample_usage().await;
    }

    /// Record one usage sample per healthy child. CPU use is estimated
    /// from cycle occupancy against the allocated share; a real deployment
    /// can feed measured samples through the same scheduler API.
    async fn sample_usage(&self) {
        let allocations = self.scheduler.allocations().await;
        let handles: Vec<(ProjectId, Arc<ProjectOrchestratorHandle>)> = {
            let children = self.children.read().await;
            children
                .iter()
                .filter(|(_, entry)| entry.health == HealthState::Ready)
                .map(|(id, entry)| (*id, entry.handle.clone()))
                .collect()
        };
        for (project_id, handle) in handles {
            let Ok(detail) = handle.inspect().await else {
                continue;
            };
            let quota = allocations.get(&project_id);
            let capacity = quota.map_or(1, |q| q.allocated_agents.max(1));
            let occupancy = detail.live_cycles.len() as f64 / f64::from(capacity);
            let cpu_share =
                quota.map_or(0.0, |q| q.allocated_cpu_share) * occupancy.min(1.0);
            self.scheduler
                .record_usage(
                    project_id,
                    crate::domain::models::quota::UsageSample {
                        memory_bytes: 0,
                        cpu_share,
                        live_cycles: detail.live_cycles.len() as u32,
                        sampled_at: Utc::now(),
                    },
                )
                .await;
        }
    }

    /// Mirror bus events into per-project logs and keep the cycle index.
    fn spawn_event_mirror(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut stream = this.bus.subscribe(EventFilter::all());
            while let Some(event) = stream.recv().await {
                if let EventPayload::CycleAdmitted { project_id, cycle_id, .. } = &event.payload {
                    this.cycle_index.write().await.insert(*cycle_id, *project_id);
                }
                if let Some(project_id) = event.payload.project_id() {
                    if let Ok(project) = this.registry.get(project_id).await {
                        if let Err(e) =
                            this.store.append_project_event(&project.path, &event).await
                        {
                            tracing::debug!(error = %e, "project event mirror failed");
                        }
                    }
                }
                // A broken engine postcondition is fatal to the child; it
                // restarts from its last snapshot.
                if let EventPayload::Error { kind, project_id: Some(project_id), .. } =
                    &event.payload
                {
                    if kind == "InternalInvariantViolated" {
                        let this = Arc::clone(&this);
                        let project_id = *project_id;
                        tokio::spawn(async move {
                            if let Err(e) = this.restart_child(project_id).await {
                                tracing::error!(project = %project_id, error = %e, "invariant restart failed");
                            }
                        });
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Command surface
    // ------------------------------------------------------------------

    /// Dispatch one external command. Global commands apply here; project
    /// commands route to the owning orchestrator's queue.
    pub async fn submit(self: &Arc<Self>, envelope: CommandEnvelope) -> CommandAck {
        let correlation_id = envelope.correlation_id;
        match &envelope.command {
            Command::Project(cmd) => match self.apply_project_command(cmd).await {
                Ok(()) => CommandAck::Accepted { correlation_id },
                Err(error) => CommandAck::Rejected { correlation_id, error },
            },
            Command::Scheduler(cmd) => {
                let result = match cmd {
                    SchedulerCommand::SetStrategy { strategy } => {
                        self.scheduler.set_strategy(*strategy).await
                    }
                    SchedulerCommand::RebalanceNow => {
                        self.scheduler.rebalance_now().await;
                        Ok(())
                    }
                };
                match result {
                    Ok(()) => CommandAck::Accepted { correlation_id },
                    Err(error) => CommandAck::Rejected { correlation_id, error },
                }
            }
            Command::Tdd(cmd) => {
                let project_id = match self.route_tdd(cmd).await {
                    Ok(project_id) => project_id,
                    Err(error) => return CommandAck::Rejected { correlation_id, error },
                };
                self.forward(project_id, envelope).await
            }
            Command::Backlog(_) | Command::Sprint(_) => {
                let Some(project_id) = envelope.command.project_id() else {
                    return CommandAck::Rejected {
                        correlation_id,
                        error: EngineError::PreconditionFailed {
                            reason: "command names no project".to_string(),
                        },
                    };
                };
                self.forward(project_id, envelope).await
            }
        }
    }

    async fn forward(&self, project_id: ProjectId, envelope: CommandEnvelope) -> CommandAck {
        let correlation_id = envelope.correlation_id;
        let handle = {
            let children = self.children.read().await;
            match children.get(&project_id) {
                Some(entry) if entry.health == HealthState::Failed => {
                    return CommandAck::Rejected {
                        correlation_id,
                        error: EngineError::PreconditionFailed {
                            reason: format!(
                                "project {project_id} is failed; operator recovery required"
                            ),
                        },
                    };
                }
                Some(entry) => entry.handle.clone(),
                None => {
                    return CommandAck::Rejected {
                        correlation_id,
                        error: EngineError::NotFound {
                            entity: "running project",
                            id: project_id.to_string(),
                        },
                    };
                }
            }
        };
        handle.submit(envelope).await
    }

    async fn route_tdd(&self, cmd: &TddCommand) -> EngineResult<ProjectId> {
        let cycle_id = match cmd {
            TddCommand::Pause { cycle_id }
            | TddCommand::Resume { cycle_id }
            | TddCommand::Abort { cycle_id, .. }
            | TddCommand::ReviewCycle { cycle_id } => *cycle_id,
            TddCommand::Overview { project_id } => {
                return project_id.ok_or(EngineError::PreconditionFailed {
                    reason: "tdd.overview without a project id uses Inspect".to_string(),
                })
            }
        };
        self.cycle_index.read().await.get(&cycle_id).copied().ok_or(EngineError::NotFound {
            entity: "cycle",
            id: cycle_id.to_string(),
        })
    }

    async fn apply_project_command(self: &Arc<Self>, cmd: &ProjectCommand) -> EngineResult<()> {
        match cmd {
            ProjectCommand::Register { name, path, priority, limits, dependencies } => {
                self.registry
                    .register(name.clone(), path.clone(), *priority, *limits, dependencies.clone())
                    .await?;
                Ok(())
            }
            ProjectCommand::SetStatus { project_id, status } => {
                let project = self.registry.set_status(*project_id, *status).await?;
                match status {
                    ProjectStatus::Active => self.start_child(project).await?,
                    ProjectStatus::Paused
                    | ProjectStatus::Maintenance
                    | ProjectStatus::Archived => {
                        self.stop_child(*project_id, true).await;
                    }
                    ProjectStatus::Initializing => {}
                }
                self.scheduler.rebalance_now().await;
                Ok(())
            }
        }
    }

    /// Register and immediately activate a project. Convenience for the
    /// operator CLI and tests; equivalent to register + setStatus(Active).
    pub async fn register_project(
        self: &Arc<Self>,
        name: impl Into<String>,
        path: impl Into<std::path::PathBuf>,
        priority: crate::domain::models::project::ProjectPriority,
    ) -> EngineResult<Project> {
        let project = self.registry.register(name, path, priority, None, Vec::new()).await?;
        let project = self.registry.set_status(project.id, ProjectStatus::Active).await?;
        self.start_child(project.clone()).await?;
        self.scheduler.rebalance_now().await;
        Ok(project)
    }

    // ------------------------------------------------------------------
    // Diagnostics & shutdown
    // ------------------------------------------------------------------

    /// Synchronous diagnostic snapshot of the whole engine.
    pub async fn inspect(&self) -> InspectReport {
        let quotas_map = self.scheduler.allocations().await;
        let mut quotas: Vec<ResourceQuota> = quotas_map.values().cloned().collect();
        quotas.sort_by_key(|q| q.project_id);

        let mut projects = Vec::new();
        for project in self.registry.list().await {
            let (health, handle) = {
                let children = self.children.read().await;
                match children.get(&project.id) {
                    Some(entry) => (entry.health, Some(entry.handle.clone())),
                    None => (HealthState::Stopped, None),
                }
            };
            let detail = match handle {
                Some(handle) => handle.inspect().await.ok(),
                None => None,
            };
            projects.push(ProjectReport {
                project_id: project.id,
                name: project.name.clone(),
                status: project.status,
                health,
                quota: quotas_map.get(&project.id).cloned(),
                detail,
            });
        }
        InspectReport { quotas, projects }
    }

    /// Graceful engine shutdown with the configured drain deadline.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<ProjectId> = self.children.read().await.keys().copied().collect();
        for project_id in ids {
            self.stop_child(project_id, true).await;
        }

        let beats = self.heartbeats.read().await.clone();
        if let Err(e) = self.store.save_heartbeats(&beats).await {
            tracing::warn!(error = %e, "final heartbeat persistence failed");
        }
        let projects = self.registry.list().await;
        if let Err(e) = self.store.save_registry(&projects).await {
            tracing::warn!(error = %e, "final registry persistence failed");
        }

        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("global orchestrator stopped");
    }
}
