//! Project orchestrator - per-project supervisor (C6).
//!
//! Hosts the workflow machine, the cycle coordinator and a single-consumer
//! command queue. Command handling is serial, so workflow and cycle state
//! never race; agent invocations and selector runs happen in spawned cycle
//! tasks whose results re-enter the queue as internal messages.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::machines::tdd::{self, PhaseEvidence, StepOutcome, TddStep};
use crate::domain::machines::workflow::{
    self, GuardInputs, WorkflowState, WorkflowVerb,
};
use crate::domain::models::command::{
    BacklogCommand, Command, CommandAck, CommandEnvelope, Role, SprintCommand, TddCommand,
};
use crate::domain::models::config::SupervisionConfig;
use crate::domain::models::cycle::{
    AbortReason, PauseReason, TddCycle, TddPhase, TddPhaseKind, TestSelector,
};
use crate::domain::models::event::{
    Component, EngineEvent, EventPayload, HealthState,
};
use crate::domain::models::ids::{CorrelationId, CycleId, ProjectId, StoryId};
use crate::domain::models::quota::ResourceQuota;
use crate::domain::models::receipt::{AgentReceipt, ReceiptKey};
use crate::domain::models::state::ProjectState;
use crate::domain::models::story::{Sprint, SprintLifecycle, Story, StoryState};
use crate::domain::ports::agent_executor::{AgentExecutor, AgentInvocation};
use crate::domain::ports::{StateStore, TestRunner};
use crate::services::cycle_coordinator::{Admission, CycleCoordinator};
use crate::services::event_bus::EventBus;
use crate::services::scheduler::QuotaSink;
use crate::services::shared_resources::CrossProjectCoordinator;

/// Run control pushed from the global orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Running,
    Paused,
    Shutdown { graceful: bool },
}

/// Messages entering the single-consumer queue.
enum Inbound {
    Command(CommandEnvelope, oneshot::Sender<CommandAck>),
    /// Result of one spawned cycle work task.
    CycleResult {
        cycle_id: CycleId,
        evidence: PhaseEvidence,
        receipt: Option<AgentReceipt>,
        failure: Option<EngineError>,
    },
    /// Force a snapshot; answers when persisted.
    Snapshot(oneshot::Sender<EngineResult<u64>>),
    /// Atomic read of workflow and cycle state.
    Inspect(oneshot::Sender<ProjectInspect>),
}

/// One live cycle in an inspect report.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CycleSummary {
    pub cycle_id: CycleId,
    pub story_id: StoryId,
    pub phase: String,
    pub attempts: crate::domain::models::cycle::PhaseAttempts,
}

/// Atomic snapshot of one project orchestrator's state.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProjectInspect {
    pub project_id: ProjectId,
    pub workflow: String,
    pub sprint_paused: bool,
    pub live_cycles: Vec<CycleSummary>,
    pub waiting_stories: Vec<StoryId>,
}

/// External dependencies of one project orchestrator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn StateStore>,
    pub agents: Arc<dyn AgentExecutor>,
    pub tests: Arc<dyn TestRunner>,
    /// Cross-project coordinator gating shared-service use.
    pub resources: Arc<CrossProjectCoordinator>,
}

/// Handle owned by the global orchestrator.
pub struct ProjectOrchestratorHandle {
    project_id: ProjectId,
    tx: mpsc::Sender<Inbound>,
    control_tx: watch::Sender<RunControl>,
    quota_tx: watch::Sender<ResourceQuota>,
    health_rx: watch::Receiver<HealthState>,
    join: JoinHandle<()>,
}

impl ProjectOrchestratorHandle {
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Submit a command. The ack resolves once the command is applied or
    /// rejected; effects are reported via events.
    pub async fn submit(&self, envelope: CommandEnvelope) -> CommandAck {
        let correlation_id = envelope.correlation_id;
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Inbound::Command(envelope, ack_tx)).await.is_err() {
            return CommandAck::Rejected { correlation_id, error: EngineError::Interrupted };
        }
        ack_rx.await.unwrap_or(CommandAck::Rejected {
            correlation_id,
            error: EngineError::Interrupted,
        })
    }

    /// Halt command consumption without tearing down state.
    pub fn pause(&self) {
        let _ = self.control_tx.send(RunControl::Paused);
    }

    /// Resume command consumption.
    pub fn resume(&self) {
        let _ = self.control_tx.send(RunControl::Running);
    }

    /// Atomic snapshot of workflow and cycle state.
    pub async fn inspect(&self) -> EngineResult<ProjectInspect> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Inbound::Inspect(tx)).await.is_err() {
            return Err(EngineError::Interrupted);
        }
        rx.await.map_err(|_| EngineError::Interrupted)
    }

    /// Produce a durable snapshot now.
    pub async fn snapshot(&self) -> EngineResult<u64> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Inbound::Snapshot(tx)).await.is_err() {
            return Err(EngineError::Interrupted);
        }
        rx.await.map_err(|_| EngineError::Interrupted)?
    }

    /// Ask the orchestrator to stop. With `graceful` the queue drains
    /// first; otherwise in-flight work is aborted with `Interrupted`.
    pub fn shutdown(&self, graceful: bool) {
        let _ = self.control_tx.send(RunControl::Shutdown { graceful });
    }

    /// Wait for the orchestrator task to finish.
    pub async fn join(self) {
        let _ = self.join.await;
    }

    /// Abort the task outright. Used by tests to simulate a crash.
    pub fn kill(&self) {
        self.join.abort();
    }

    pub fn health(&self) -> HealthState {
        *self.health_rx.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthState> {
        self.health_rx.clone()
    }
}

#[async_trait]
impl QuotaSink for ProjectOrchestratorHandle {
    async fn apply_quota(&self, quota: ResourceQuota) -> EngineResult<()> {
        self.quota_tx.send(quota).map_err(|_| EngineError::QuotaApplyFailed {
            project: self.project_id,
            detail: "orchestrator gone".to_string(),
        })
    }
}

/// Spawn a project orchestrator from a cold or restored state.
///
/// `Start(project, quota)` in the component contract: the returned handle
/// is `Ready`; a restore failure surfaces as the error.
pub async fn spawn(
    state: ProjectState,
    initial_quota: ResourceQuota,
    config: SupervisionConfig,
    deps: OrchestratorDeps,
    heartbeat_tx: mpsc::Sender<ProjectId>,
) -> ProjectOrchestratorHandle {
    let project_id = state.project.id;
    let (tx, rx) = mpsc::channel(config.command_queue_depth);
    let (control_tx, control_rx) = watch::channel(RunControl::Running);
    let (quota_tx, quota_rx) = watch::channel(initial_quota.clone());
    let (health_tx, health_rx) = watch::channel(HealthState::Starting);

    let capacity = cycle_capacity(&state, &initial_quota);
    let orchestrator = ProjectOrchestrator {
        state,
        coordinator: CycleCoordinator::new(capacity),
        config,
        deps,
        control_rx,
        quota_rx,
        health_tx,
        heartbeat_tx,
        internal_tx: tx.clone(),
        recent_commands: VecDeque::new(),
        recent_set: HashSet::new(),
        inflight: HashMap::new(),
    };
    let join = tokio::spawn(orchestrator.run(rx));

    ProjectOrchestratorHandle { project_id, tx, control_tx, quota_tx, health_rx, join }
}

fn cycle_capacity(state: &ProjectState, quota: &ResourceQuota) -> u32 {
    state.project.limits.max_parallel_cycles.min(quota.allocated_agents.max(1))
}

struct ProjectOrchestrator {
    state: ProjectState,
    coordinator: CycleCoordinator,
    config: SupervisionConfig,
    deps: OrchestratorDeps,
    control_rx: watch::Receiver<RunControl>,
    quota_rx: watch::Receiver<ResourceQuota>,
    health_tx: watch::Sender<HealthState>,
    heartbeat_tx: mpsc::Sender<ProjectId>,
    internal_tx: mpsc::Sender<Inbound>,
    /// Recently applied correlation ids, for idempotent resubmission.
    recent_commands: VecDeque<CorrelationId>,
    recent_set: HashSet<CorrelationId>,
    /// Cycle work currently running outside the command loop.
    inflight: HashMap<CycleId, JoinHandle<()>>,
}

impl ProjectOrchestrator {
    async fn run(mut self, mut rx: mpsc::Receiver<Inbound>) {
        let project_id = self.state.project.id;
        let _ = self.health_tx.send(HealthState::Ready);
        tracing::info!(project = %project_id, "project orchestrator ready");

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        let mut snapshot_tick =
            tokio::time::interval(Duration::from_secs(self.config.snapshot_interval_secs));
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.drive_cycles().await;

        loop {
            let control = *self.control_rx.borrow();
            match control {
                RunControl::Shutdown { graceful } => {
                    self.shutdown(rx, graceful).await;
                    return;
                }
                RunControl::Paused => {
                    // Halt consumption; only control changes wake us.
                    if self.control_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                RunControl::Running => {}
            }

            tokio::select! {
                inbound = rx.recv() => {
                    match inbound {
                        Some(Inbound::Command(envelope, ack_tx)) => {
                            let ack = self.handle_command(envelope).await;
                            let _ = ack_tx.send(ack);
                        }
                        Some(Inbound::CycleResult { cycle_id, evidence, receipt, failure }) => {
                            self.handle_cycle_result(cycle_id, evidence, receipt, failure).await;
                        }
                        Some(Inbound::Snapshot(tx)) => {
                            let _ = tx.send(self.snapshot().await);
                        }
                        Some(Inbound::Inspect(tx)) => {
                            let _ = tx.send(self.inspect_now());
                        }
                        None => return,
                    }
                }
                _ = self.control_rx.changed() => {}
                result = self.quota_rx.changed() => {
                    if result.is_ok() {
                        self.apply_quota_update().await;
                    }
                }
                _ = heartbeat.tick() => {
                    let _ = self.heartbeat_tx.send(project_id).await;
                }
                _ = snapshot_tick.tick() => {
                    if let Err(e) = self.snapshot().await {
                        tracing::warn!(project = %project_id, error = %e, "periodic snapshot failed");
                    }
                }
            }
        }
    }

    async fn shutdown(mut self, mut rx: mpsc::Receiver<Inbound>, graceful: bool) {
        let project_id = self.state.project.id;
        rx.close();
        if graceful {
            // Drain everything already queued.
            while let Some(inbound) = rx.recv().await {
                match inbound {
                    Inbound::Command(envelope, ack_tx) => {
                        let ack = self.handle_command(envelope).await;
                        let _ = ack_tx.send(ack);
                    }
                    Inbound::CycleResult { cycle_id, evidence, receipt, failure } => {
                        self.handle_cycle_result(cycle_id, evidence, receipt, failure).await;
                    }
                    Inbound::Snapshot(tx) => {
                        let _ = tx.send(self.snapshot().await);
                    }
                    Inbound::Inspect(tx) => {
                        let _ = tx.send(self.inspect_now());
                    }
                }
            }
        } else {
            for (_, task) in self.inflight.drain() {
                task.abort();
            }
            while let Some(inbound) = rx.recv().await {
                if let Inbound::Command(envelope, ack_tx) = inbound {
                    let _ = ack_tx.send(CommandAck::Rejected {
                        correlation_id: envelope.correlation_id,
                        error: EngineError::Interrupted,
                    });
                }
            }
        }
        if let Err(e) = self.snapshot().await {
            tracing::warn!(project = %project_id, error = %e, "shutdown snapshot failed");
        }
        let _ = self.health_tx.send(HealthState::Stopped);
        tracing::info!(project = %project_id, graceful, "project orchestrator stopped");
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, envelope: CommandEnvelope) -> CommandAck {
        let correlation_id = envelope.correlation_id;
        if self.recent_set.contains(&correlation_id) {
            // Applied at most once; resubmission is acknowledged unchanged.
            return CommandAck::Accepted { correlation_id };
        }

        let result = self.apply_command(&envelope).await;
        match result {
            Ok(()) => {
                self.remember_command(correlation_id);
                self.drive_cycles().await;
                CommandAck::Accepted { correlation_id }
            }
            Err(error) => {
                self.emit_error(&error, Some(correlation_id), None).await;
                if error.is_fatal() {
                    self.state.workflow =
                        workflow::block(self.state.workflow.clone(), error.to_string());
                    let _ = self.health_tx.send(HealthState::Failed);
                }
                CommandAck::Rejected { correlation_id, error }
            }
        }
    }

    fn remember_command(&mut self, correlation_id: CorrelationId) {
        self.recent_commands.push_back(correlation_id);
        self.recent_set.insert(correlation_id);
        while self.recent_commands.len() > self.config.command_dedup_window {
            if let Some(old) = self.recent_commands.pop_front() {
                self.recent_set.remove(&old);
            }
        }
    }

    async fn apply_command(&mut self, envelope: &CommandEnvelope) -> EngineResult<()> {
        match &envelope.command {
            Command::Backlog(cmd) => self.apply_backlog(cmd, envelope).await,
            Command::Sprint(cmd) => self.apply_sprint(cmd, envelope).await,
            Command::Tdd(cmd) => self.apply_tdd(cmd, envelope).await,
            Command::Project(_) | Command::Scheduler(_) => Err(EngineError::PreconditionFailed {
                reason: format!(
                    "{} is handled by the global orchestrator",
                    envelope.command.verb()
                ),
            }),
        }
    }

    async fn apply_backlog(
        &mut self,
        cmd: &BacklogCommand,
        envelope: &CommandEnvelope,
    ) -> EngineResult<()> {
        let verb = match cmd {
            BacklogCommand::AddStory { .. } => WorkflowVerb::AddStory,
            BacklogCommand::Prioritise { .. } => WorkflowVerb::PrioritiseStory,
            BacklogCommand::Approve { .. } => WorkflowVerb::ApproveStory,
        };
        let inputs = self.guard_inputs(&verb, envelope);
        let next = workflow::transition(&self.state.workflow, &verb, &inputs)?;

        match cmd {
            BacklogCommand::AddStory { description, acceptance_criteria, estimate, .. } => {
                let mut story = Story::new(self.state.project.id, description.clone());
                story.acceptance_criteria = acceptance_criteria.clone();
                story.estimate = *estimate;
                story.rank = self.state.stories.len() as u32;
                self.state.stories.insert(story.id, story);
            }
            BacklogCommand::Prioritise { story_id, rank, .. } => {
                let story = self.state.story_mut(*story_id)?;
                story.rank = *rank;
                story.touch();
            }
            BacklogCommand::Approve { story_id, .. } => {
                let story = self.state.story_mut(*story_id)?;
                if story.state != StoryState::Backlog {
                    return Err(EngineError::PreconditionFailed {
                        reason: format!(
                            "story {story_id} is {}, only backlog stories can be approved",
                            story.state.as_str()
                        ),
                    });
                }
                story.state = StoryState::SprintReady;
                story.touch();
            }
        }

        self.commit_workflow(next, envelope.correlation_id).await;
        Ok(())
    }

    async fn apply_sprint(
        &mut self,
        cmd: &SprintCommand,
        envelope: &CommandEnvelope,
    ) -> EngineResult<()> {
        let verb = match cmd {
            SprintCommand::Plan { story_ids, .. } => {
                WorkflowVerb::PlanSprint { story_ids: story_ids.clone() }
            }
            SprintCommand::Start { .. } => WorkflowVerb::StartSprint,
            SprintCommand::Pause { .. } => WorkflowVerb::PauseSprint,
            SprintCommand::Resume { .. } => match self.state.workflow {
                WorkflowState::Blocked { .. } => WorkflowVerb::Resume,
                _ => WorkflowVerb::ResumeSprint,
            },
            SprintCommand::Complete { .. } => WorkflowVerb::CompleteSprint,
            SprintCommand::ApproveReview { .. } => WorkflowVerb::ApproveReview,
            SprintCommand::CompleteRetrospective { .. } => WorkflowVerb::CompleteRetrospective,
            SprintCommand::Abort { .. } => WorkflowVerb::Abort,
        };
        let mut inputs = self.guard_inputs(&verb, envelope);

        // A plan raced by an earlier overlapping plan in the same queue
        // epoch is a conflict, not a precondition failure.
        if let SprintCommand::Plan { story_ids, .. } = cmd {
            for sprint in self.state.sprints.values() {
                if !sprint.lifecycle.is_terminal() && sprint.overlaps(story_ids) {
                    return Err(EngineError::ConflictingPlan {
                        reason: format!(
                            "stories overlap sprint {} planned earlier",
                            sprint.id
                        ),
                    });
                }
            }
            let sprint = Sprint::plan(self.state.project.id, story_ids.clone());
            inputs.planned_sprint_id = Some(sprint.id);
            let next = workflow::transition(&self.state.workflow, &verb, &inputs)?;
            // Guards passed: record the sprint and assign the stories.
            for story_id in story_ids {
                let story = self.state.story_mut(*story_id)?;
                story.sprint_id = Some(sprint.id);
                story.touch();
            }
            self.state.sprints.insert(sprint.id, sprint);
            self.commit_workflow(next, envelope.correlation_id).await;
            return Ok(());
        }

        let next = workflow::transition(&self.state.workflow, &verb, &inputs)?;

        match cmd {
            SprintCommand::Start { .. } => {
                let sprint_id = next.sprint_id().ok_or(EngineError::InternalInvariantViolated {
                    detail: "sprint active without a sprint id".to_string(),
                })?;
                let story_ids = {
                    let sprint = self.state.sprint_mut(sprint_id)?;
                    sprint.lifecycle = SprintLifecycle::Active;
                    sprint.started_at = Some(Utc::now());
                    sprint.story_ids.clone()
                };
                self.commit_workflow(next, envelope.correlation_id).await;
                self.emit(
                    EventPayload::SprintStarted {
                        project_id: self.state.project.id,
                        sprint_id,
                        story_count: story_ids.len(),
                    },
                    Some(envelope.correlation_id),
                )
                .await;
                for story_id in story_ids {
                    self.state.story_mut(story_id)?.state = StoryState::InSprint;
                    self.admit_story(story_id, Some(envelope.correlation_id)).await?;
                }
                return Ok(());
            }
            SprintCommand::Complete { .. } => {
                if let Some(sprint_id) = next.sprint_id() {
                    let sprint = self.state.sprint_mut(sprint_id)?;
                    sprint.lifecycle = SprintLifecycle::Review;
                    let story_ids = sprint.story_ids.clone();
                    for story_id in story_ids {
                        let story = self.state.story_mut(story_id)?;
                        if story.state == StoryState::InSprint {
                            story.state = StoryState::InReview;
                        }
                    }
                }
            }
            SprintCommand::ApproveReview { .. } => {
                if let Some(sprint_id) = next.sprint_id() {
                    let sprint = self.state.sprint_mut(sprint_id)?;
                    sprint.lifecycle = SprintLifecycle::Retrospective;
                    let story_ids = sprint.story_ids.clone();
                    for story_id in story_ids {
                        let story = self.state.story_mut(story_id)?;
                        if story.state == StoryState::InReview {
                            story.state = StoryState::Done;
                        }
                    }
                }
            }
            SprintCommand::CompleteRetrospective { .. } => {
                if let Some(sprint_id) = self.state.workflow.sprint_id() {
                    let sprint = self.state.sprint_mut(sprint_id)?;
                    sprint.lifecycle = SprintLifecycle::Complete;
                    sprint.ended_at = Some(Utc::now());
                }
            }
            SprintCommand::Abort { .. } => {
                // Abort every live cycle before resetting the workflow.
                let live: Vec<CycleId> =
                    self.state.live_cycles().iter().map(|c| c.id).collect();
                for cycle_id in live {
                    self.abort_cycle(cycle_id, AbortReason::Requested, envelope.correlation_id)
                        .await?;
                }
            }
            _ => {}
        }

        self.commit_workflow(next, envelope.correlation_id).await;
        Ok(())
    }

    async fn apply_tdd(
        &mut self,
        cmd: &TddCommand,
        envelope: &CommandEnvelope,
    ) -> EngineResult<()> {
        if envelope.principal.role == Role::Agent {
            return Err(EngineError::PreconditionFailed {
                reason: "cycle control requires an owner principal".to_string(),
            });
        }
        match cmd {
            TddCommand::Pause { cycle_id } => {
                self.step_cycle(
                    *cycle_id,
                    &TddStep::Pause { reason: PauseReason::Requested },
                    &PhaseEvidence::default(),
                    Some(envelope.correlation_id),
                )
                .await?;
                Ok(())
            }
            TddCommand::Resume { cycle_id } => {
                self.step_cycle(
                    *cycle_id,
                    &TddStep::Resume,
                    &PhaseEvidence::default(),
                    Some(envelope.correlation_id),
                )
                .await?;
                Ok(())
            }
            TddCommand::Abort { cycle_id, reason } => {
                if *reason == AbortReason::Skipped && !envelope.principal.is_admin() {
                    return Err(EngineError::PreconditionFailed {
                        reason: "skipping a cycle requires an admin principal".to_string(),
                    });
                }
                self.abort_cycle(*cycle_id, reason.clone(), envelope.correlation_id).await
            }
            TddCommand::ReviewCycle { cycle_id } => {
                // Review is an explicit red re-entry to add tests.
                self.step_cycle(
                    *cycle_id,
                    &TddStep::ReenterRedTests,
                    &PhaseEvidence::default(),
                    Some(envelope.correlation_id),
                )
                .await?;
                Ok(())
            }
            TddCommand::Overview { .. } => Ok(()),
        }
    }

    /// Gather the data the workflow guards need.
    fn guard_inputs(&self, verb: &WorkflowVerb, envelope: &CommandEnvelope) -> GuardInputs {
        let mut inputs = GuardInputs {
            principal_is_admin: envelope.principal.is_admin(),
            ..GuardInputs::default()
        };
        match verb {
            WorkflowVerb::PlanSprint { story_ids } => {
                inputs.unplannable_stories = story_ids
                    .iter()
                    .filter(|id| {
                        self.state
                            .stories
                            .get(id)
                            .is_none_or(|story| !story.state.is_plannable())
                    })
                    .copied()
                    .collect();
            }
            WorkflowVerb::StartSprint => {
                if let Some(sprint_id) = self.state.workflow.sprint_id() {
                    inputs.sprint_story_count =
                        self.state.sprints.get(&sprint_id).map_or(0, |s| s.story_ids.len());
                }
            }
            WorkflowVerb::CompleteSprint => {
                if let Some(sprint_id) = self.state.workflow.sprint_id() {
                    if let Some(sprint) = self.state.sprints.get(&sprint_id) {
                        inputs.unsettled_stories = sprint
                            .story_ids
                            .iter()
                            .filter(|story_id| !self.story_settled(**story_id))
                            .copied()
                            .collect();
                    }
                }
            }
            _ => {}
        }
        inputs
    }

    /// A story is settled when its cycle committed, or was explicitly
    /// aborted with justification (skip).
    fn story_settled(&self, story_id: StoryId) -> bool {
        let cycles: Vec<&TddCycle> =
            self.state.cycles.values().filter(|c| c.story_id == story_id).collect();
        !cycles.is_empty()
            && cycles
                .iter()
                .all(|cycle| matches!(cycle.phase, TddPhase::Commit | TddPhase::Aborted { .. }))
    }

    async fn commit_workflow(&mut self, next: WorkflowState, correlation_id: CorrelationId) {
        if next == self.state.workflow {
            return;
        }
        let from = self.state.workflow.kind().as_str().to_string();
        let to = next.kind().as_str().to_string();
        self.state.workflow = next;
        // Pause/resume toggles keep the state kind; no event for those.
        if from != to {
            self.emit(
                EventPayload::WorkflowStateChanged {
                    project_id: self.state.project.id,
                    from,
                    to,
                },
                Some(correlation_id),
            )
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Cycle driving
    // ------------------------------------------------------------------

    async fn admit_story(
        &mut self,
        story_id: StoryId,
        correlation_id: Option<CorrelationId>,
    ) -> EngineResult<()> {
        match self.coordinator.request_slot(&mut self.state, story_id)? {
            Admission::Admitted { cycle_id } => {
                let phase = self.state.cycle(cycle_id)?.phase.kind().as_str().to_string();
                self.emit(
                    EventPayload::CycleAdmitted {
                        project_id: self.state.project.id,
                        cycle_id,
                        story_id,
                        phase,
                    },
                    correlation_id,
                )
                .await;
            }
            Admission::Enqueued { position } => {
                tracing::debug!(story = %story_id, position, "story waiting for a cycle slot");
            }
        }
        Ok(())
    }

    fn sprint_paused(&self) -> bool {
        matches!(self.state.workflow, WorkflowState::SprintActive { paused: true, .. })
    }

    /// Spawn work for every live cycle that is runnable and idle.
    async fn drive_cycles(&mut self) {
        if self.sprint_paused() {
            return;
        }
        if !self.state.project.work_window.is_open_at(Utc::now()) {
            return;
        }
        self.inflight.retain(|_, task| !task.is_finished());

        let runnable: Vec<TddCycle> = self
            .state
            .live_cycles()
            .into_iter()
            .filter(|cycle| {
                !matches!(cycle.phase, TddPhase::Paused { .. })
                    && !self.inflight.contains_key(&cycle.id)
            })
            .cloned()
            .collect();

        for cycle in runnable {
            let task = self.spawn_cycle_work(&cycle);
            self.inflight.insert(cycle.id, task);
        }
    }

    /// One unit of cycle work: consult the receipt ledger, invoke the agent
    /// if needed, run the selector set, and report evidence back into the
    /// command queue. No orchestrator lock is held across these awaits.
    fn spawn_cycle_work(&self, cycle: &TddCycle) -> JoinHandle<()> {
        let deps = self.deps.clone();
        let tx = self.internal_tx.clone();
        let project_id = self.state.project.id;
        let cycle_id = cycle.id;
        let story_id = cycle.story_id;
        let phase = cycle.phase.kind();
        let attempt = cycle.attempts.get(phase) + 1;
        let selector = cycle.selector.clone();
        let artifacts = cycle.artifacts.clone();
        let briefing = self
            .state
            .stories
            .get(&story_id)
            .map(|story| format!("{}\n\n{}", story.description, story.acceptance_criteria))
            .unwrap_or_default();
        let deadline = Duration::from_secs(self.config.agent_deadline_secs);
        let key = ReceiptKey { cycle_id, phase, attempt };
        let replayed = self.state.receipts.get(&key).cloned();
        let priority = self.state.project.priority;

        tokio::spawn(async move {
            let mut evidence = PhaseEvidence {
                design_artifact: artifacts.design_doc.clone(),
                test_files: artifacts.test_files.clone(),
                ..PhaseEvidence::default()
            };
            let mut receipt = None;
            let mut failure = None;

            match replayed {
                Some(existing) if existing.succeeded => {
                    // Side effect already applied before a crash; do not
                    // invoke the agent again.
                    if phase == TddPhaseKind::Refactor {
                        evidence.commit_applied = true;
                    }
                }
                _ => {
                    // Commit side effects go through the shared VCS
                    // service; acquisition is gated by the cross-project
                    // coordinator and carries the same deadline.
                    let vcs = crate::domain::models::ids::ResourceId::new("service:vcs");
                    let mut vcs_held = false;
                    if phase == TddPhaseKind::Refactor {
                        match deps
                            .resources
                            .acquire(
                                vcs.clone(),
                                crate::domain::models::resource::ResourceKind::Service,
                                project_id,
                                priority,
                                deadline,
                            )
                            .await
                        {
                            Ok(()) => vcs_held = true,
                            Err(e) => failure = Some(e),
                        }
                    }

                    if failure.is_none() {
                        let invocation = AgentInvocation {
                            project_id,
                            cycle_id,
                            story_id,
                            phase,
                            attempt,
                            briefing,
                            deadline,
                        };
                        match tokio::time::timeout(deadline, deps.agents.invoke(invocation)).await
                        {
                            Ok(Ok(outcome)) => {
                                if outcome.design_artifact.is_some() {
                                    evidence.design_artifact = outcome.design_artifact.clone();
                                }
                                if !outcome.test_files.is_empty() {
                                    evidence.test_files = outcome.test_files.clone();
                                }
                                evidence.commit_applied = outcome.commit_applied;
                                receipt =
                                    Some(AgentReceipt::success(key, outcome.summary.clone()));
                            }
                            Ok(Err(e)) => {
                                failure = Some(e);
                            }
                            Err(_) => {
                                failure = Some(EngineError::AgentTimeout {
                                    cycle: cycle_id,
                                    phase: phase.as_str().to_string(),
                                    attempt,
                                    deadline_secs: deadline.as_secs(),
                                });
                            }
                        }
                    }
                    if vcs_held {
                        deps.resources.release(&vcs, project_id).await;
                    }
                }
            }

            if failure.is_none() && phase != TddPhaseKind::Design {
                // Phases beyond Design gate on the selector set.
                let run_selector = TestSelector {
                    entries: if selector.is_empty() {
                        evidence.test_files.clone()
                    } else {
                        selector.entries.clone()
                    },
                };
                match deps.tests.run_selected(project_id, &run_selector).await {
                    Ok(report) => evidence.selector_report = Some(report),
                    Err(e) => failure = Some(e),
                }
                if failure.is_none() && phase == TddPhaseKind::Refactor {
                    match deps.tests.quality_gates(project_id).await {
                        Ok(report) => evidence.quality = Some(report),
                        Err(e) => failure = Some(e),
                    }
                }
            }

            let _ = tx.send(Inbound::CycleResult { cycle_id, evidence, receipt, failure }).await;
        })
    }

    async fn handle_cycle_result(
        &mut self,
        cycle_id: CycleId,
        evidence: PhaseEvidence,
        receipt: Option<AgentReceipt>,
        failure: Option<EngineError>,
    ) {
        self.inflight.remove(&cycle_id);
        if !self.state.cycles.contains_key(&cycle_id) {
            return;
        }

        if let Some(receipt) = receipt {
            if let Err(e) = self.state.record_receipt(receipt) {
                tracing::debug!(cycle = %cycle_id, error = %e, "duplicate receipt ignored");
            }
        }

        let step = match &failure {
            Some(EngineError::DeadlockAvoided { .. }) => {
                // Cross-project deadlock: park this cycle as the victim.
                TddStep::Pause { reason: PauseReason::DeadlockVictim }
            }
            Some(error) => TddStep::RecordFailure { detail: error.to_string() },
            None => TddStep::Advance,
        };
        if let Some(error) = &failure {
            self.emit_error(error, None, Some(cycle_id)).await;
        }

        match self.step_cycle(cycle_id, &step, &evidence, None).await {
            Ok(outcome) => {
                self.after_step(cycle_id, &evidence, outcome).await;
            }
            Err(e) => {
                tracing::warn!(cycle = %cycle_id, error = %e, "cycle step rejected");
            }
        }
        self.drive_cycles().await;
    }

    /// Apply one machine step and emit the corresponding events.
    async fn step_cycle(
        &mut self,
        cycle_id: CycleId,
        step: &TddStep,
        evidence: &PhaseEvidence,
        correlation_id: Option<CorrelationId>,
    ) -> EngineResult<StepOutcome> {
        let project_id = self.state.project.id;
        let max_attempts = self.config.max_phase_attempts;
        let cycle = self.state.cycle_mut(cycle_id)?;
        let outcome = tdd::apply_step(cycle, step, evidence, max_attempts)?;

        match &outcome {
            StepOutcome::Transitioned { from, to } if from != to => {
                self.emit(
                    EventPayload::TddPhaseChanged {
                        project_id,
                        cycle_id,
                        from: from.as_str().to_string(),
                        to: to.as_str().to_string(),
                    },
                    correlation_id,
                )
                .await;
            }
            StepOutcome::Parked { phase } => {
                self.emit(
                    EventPayload::TddPhaseChanged {
                        project_id,
                        cycle_id,
                        from: phase.as_str().to_string(),
                        to: TddPhaseKind::Paused.as_str().to_string(),
                    },
                    correlation_id,
                )
                .await;
                let error = EngineError::NeedsHumanAttention {
                    cycle: cycle_id,
                    reason: format!(
                        "{} exceeded {} attempts",
                        phase.as_str(),
                        self.config.max_phase_attempts
                    ),
                };
                self.emit_error(&error, correlation_id, Some(cycle_id)).await;
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Post-transition bookkeeping: selector capture, artifact recording,
    /// story state, slot hand-off.
    async fn after_step(
        &mut self,
        cycle_id: CycleId,
        evidence: &PhaseEvidence,
        outcome: StepOutcome,
    ) {
        let StepOutcome::Transitioned { from, to } = outcome else {
            return;
        };
        let Ok(cycle) = self.state.cycle_mut(cycle_id) else {
            return;
        };

        // Record artifacts produced on the way out of a phase.
        match from {
            TddPhaseKind::Design => {
                if let Some(doc) = &evidence.design_artifact {
                    cycle.artifacts.design_doc = Some(doc.clone());
                }
            }
            TddPhaseKind::RedTests => {
                if !evidence.test_files.is_empty() {
                    cycle.artifacts.test_files = evidence.test_files.clone();
                }
            }
            _ => {}
        }
        // Selector set is captured at entry to RedTests and scopes every
        // later phase guard.
        if to == TddPhaseKind::RedTests {
            cycle.selector = TestSelector::default();
        }
        if from == TddPhaseKind::RedTests && to == TddPhaseKind::GreenCode {
            cycle.selector = TestSelector { entries: evidence.test_files.clone() };
        }

        if to == TddPhaseKind::Commit {
            let story_id = cycle.story_id;
            if let Ok(story) = self.state.story_mut(story_id) {
                story.state = StoryState::InReview;
                story.touch();
            }
            self.hand_off_slot().await;
        }
        if to == TddPhaseKind::Aborted {
            self.hand_off_slot().await;
        }
    }

    async fn hand_off_slot(&mut self) {
        match self.coordinator.on_cycle_terminal(&mut self.state) {
            Ok(Some(cycle_id)) => {
                let (story_id, phase) = match self.state.cycle(cycle_id) {
                    Ok(cycle) => (cycle.story_id, cycle.phase.kind().as_str().to_string()),
                    Err(_) => return,
                };
                self.emit(
                    EventPayload::CycleAdmitted {
                        project_id: self.state.project.id,
                        cycle_id,
                        story_id,
                        phase,
                    },
                    None,
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "waiter admission failed");
            }
        }
    }

    async fn abort_cycle(
        &mut self,
        cycle_id: CycleId,
        reason: AbortReason,
        correlation_id: CorrelationId,
    ) -> EngineResult<()> {
        if let Some(task) = self.inflight.remove(&cycle_id) {
            task.abort();
        }
        self.step_cycle(
            cycle_id,
            &TddStep::Abort { reason: reason.clone() },
            &PhaseEvidence::default(),
            Some(correlation_id),
        )
        .await?;
        self.emit(
            EventPayload::CycleAborted {
                project_id: self.state.project.id,
                cycle_id,
                reason: reason.to_string(),
            },
            Some(correlation_id),
        )
        .await;
        self.hand_off_slot().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Quota, snapshot, events
    // ------------------------------------------------------------------

    async fn apply_quota_update(&mut self) {
        let quota = self.quota_rx.borrow().clone();
        let capacity = cycle_capacity(&self.state, &quota);
        self.coordinator.set_capacity(capacity);
        tracing::debug!(
            project = %self.state.project.id,
            agents = quota.allocated_agents,
            capacity,
            "quota applied"
        );
        self.drive_cycles().await;
    }

    fn inspect_now(&self) -> ProjectInspect {
        ProjectInspect {
            project_id: self.state.project.id,
            workflow: self.state.workflow.kind().as_str().to_string(),
            sprint_paused: self.sprint_paused(),
            live_cycles: self
                .state
                .live_cycles()
                .into_iter()
                .map(|cycle| CycleSummary {
                    cycle_id: cycle.id,
                    story_id: cycle.story_id,
                    phase: cycle.phase.kind().as_str().to_string(),
                    attempts: cycle.attempts,
                })
                .collect(),
            waiting_stories: self.coordinator.waitlist().copied().collect(),
        }
    }

    async fn snapshot(&mut self) -> EngineResult<u64> {
        self.state.last_snapshot_seq = self.deps.bus.current_sequence();
        let seq = self.deps.store.save_project(&self.state).await?;
        self.emit(
            EventPayload::SnapshotTaken { project_id: self.state.project.id, sequence: seq },
            None,
        )
        .await;
        Ok(seq)
    }

    async fn emit(&self, payload: EventPayload, correlation_id: Option<CorrelationId>) {
        let mut event = EngineEvent::unstamped(Component::ProjectOrchestrator, payload);
        event.correlation_id = correlation_id;
        self.deps.bus.publish(event).await;
    }

    async fn emit_error(
        &self,
        error: &EngineError,
        correlation_id: Option<CorrelationId>,
        cycle_id: Option<CycleId>,
    ) {
        let mut event = EngineEvent::unstamped(
            Component::ProjectOrchestrator,
            EventPayload::Error {
                kind: error.kind().to_string(),
                message: error.to_string(),
                project_id: Some(self.state.project.id),
                cycle_id,
            },
        );
        event.correlation_id = correlation_id;
        self.deps.bus.publish(event).await;
    }
}
