//! Resource scheduler - computes and rebalances per-project quotas.
//!
//! The allocation math is pure (compute first); results are then fanned out
//! to project orchestrators (apply second), so no global cap is ever
//! exceeded transiently. A failed apply retains the previous quota for that
//! project only.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::config::SchedulerConfig;
use crate::domain::models::event::{Component, EngineEvent, EventPayload};
use crate::domain::models::ids::ProjectId;
use crate::domain::models::project::Project;
use crate::domain::models::quota::{
    AllocationStrategyKind, GlobalResources, ResourceQuota, UsageSample,
};
use crate::domain::ports::state_store::SchedulerDoc;
use crate::domain::ports::StateStore;
use crate::services::event_bus::EventBus;

/// Where computed quotas are applied. Implemented by the project
/// orchestrator handle.
#[async_trait]
pub trait QuotaSink: Send + Sync {
    async fn apply_quota(&self, quota: ResourceQuota) -> EngineResult<()>;
}

/// Why a rebalance was triggered outside the periodic tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceTrigger {
    ProjectStarted,
    ProjectStopped,
    ProjectPaused,
    ProjectResumed,
    SustainedPressure,
    Manual,
}

/// Per-project input to one allocation computation.
#[derive(Debug, Clone)]
pub struct AllocationInput {
    pub project: Project,
    /// Mean usage over the sliding window, if any samples exist.
    pub usage: Option<UsageSample>,
}

/// One strategy-independent allocation pass over a single resource:
/// clamp fractional shares to per-project caps and redistribute the
/// residue to unclamped projects.
fn distribute(total: f64, fractions: &[f64], caps: &[f64]) -> Vec<f64> {
    let n = fractions.len();
    let mut amounts = vec![0.0; n];
    let mut capped = vec![false; n];
    let mut remaining = total;
    let mut weights: Vec<f64> = fractions.to_vec();

    // A few passes suffice: each pass either caps at least one project or
    // distributes everything.
    for _ in 0..n.max(1) {
        let weight_sum: f64 =
            weights.iter().zip(&capped).filter(|(_, c)| !**c).map(|(w, _)| *w).sum();
        if weight_sum <= f64::EPSILON || remaining <= f64::EPSILON {
            break;
        }
        let mut newly_capped = false;
        let mut distributed = 0.0;
        for i in 0..n {
            if capped[i] {
                continue;
            }
            let share = remaining * weights[i] / weight_sum;
            let headroom = caps[i] - amounts[i];
            if share >= headroom {
                amounts[i] = caps[i];
                capped[i] = true;
                newly_capped = true;
                distributed += headroom;
            } else {
                amounts[i] += share;
                distributed += share;
            }
        }
        remaining -= distributed;
        if !newly_capped {
            break;
        }
        // Projects that hit their ceiling keep their weight out of the
        // next pass; the residue flows to the rest.
        weights = fractions.to_vec();
    }
    amounts
}

/// Raise every fraction to at least `floor` and renormalise the rest so the
/// sum never grows past 1.
fn apply_floor(fractions: &mut [f64], floor: f64) {
    let n = fractions.len();
    if n == 0 || floor <= 0.0 || floor * n as f64 >= 1.0 {
        return;
    }
    let mut deficit = 0.0;
    let mut surplus = 0.0;
    for f in fractions.iter() {
        if *f < floor {
            deficit += floor - *f;
        } else {
            surplus += *f - floor;
        }
    }
    if deficit <= f64::EPSILON || surplus <= f64::EPSILON {
        for f in fractions.iter_mut() {
            if *f < floor {
                *f = floor;
            }
        }
        return;
    }
    let scale = deficit / surplus;
    for f in fractions.iter_mut() {
        if *f < floor {
            *f = floor;
        } else {
            *f -= (*f - floor) * scale;
        }
    }
}

fn strategy_fractions(
    strategy: AllocationStrategyKind,
    inputs: &[AllocationInput],
    previous_cpu: &HashMap<ProjectId, f64>,
    config: &SchedulerConfig,
) -> Vec<f64> {
    let n = inputs.len();
    match strategy {
        AllocationStrategyKind::Equal => vec![1.0 / n as f64; n],
        AllocationStrategyKind::WeightedByPriority => {
            let weights: Vec<f64> = inputs
                .iter()
                .map(|input| input.project.priority.weight() * input.project.limits.cpu_weight)
                .collect();
            let sum: f64 = weights.iter().sum();
            weights.iter().map(|w| w / sum).collect()
        }
        AllocationStrategyKind::UsageDriven => {
            // Start from the previous cpu allocation; fall back to equal
            // shares for projects the scheduler has not seen before.
            let mut fractions: Vec<f64> = inputs
                .iter()
                .map(|input| {
                    previous_cpu.get(&input.project.id).copied().unwrap_or(1.0 / n as f64)
                })
                .collect();
            let sum: f64 = fractions.iter().sum();
            if sum > f64::EPSILON {
                for f in &mut fractions {
                    *f /= sum;
                }
            }

            let pressures: Vec<Option<f64>> = inputs
                .iter()
                .zip(&fractions)
                .map(|(input, fraction)| {
                    input.usage.map(|usage| {
                        if *fraction <= f64::EPSILON {
                            1.0
                        } else {
                            usage.cpu_share / fraction
                        }
                    })
                })
                .collect();

            let donors: Vec<usize> = pressures
                .iter()
                .enumerate()
                .filter(|(_, p)| matches!(p, Some(p) if *p < config.low_pressure_threshold))
                .map(|(i, _)| i)
                .collect();
            let receivers: Vec<usize> = pressures
                .iter()
                .enumerate()
                .filter(|(_, p)| matches!(p, Some(p) if *p > config.high_pressure_threshold))
                .map(|(i, _)| i)
                .collect();
            if donors.is_empty() || receivers.is_empty() {
                return fractions;
            }

            // Shift a bounded slice from idle projects to pressured ones.
            let mut moved = 0.0;
            for &donor in &donors {
                let give = (fractions[donor] * config.max_shift_fraction)
                    .min(fractions[donor] - config.min_share)
                    .max(0.0);
                fractions[donor] -= give;
                moved += give;
            }
            let per_receiver = moved / receivers.len() as f64;
            for &receiver in &receivers {
                fractions[receiver] += per_receiver;
            }
            fractions
        }
    }
}

/// Compute fresh quotas for every input project. Pure.
pub fn compute_allocations(
    strategy: AllocationStrategyKind,
    global: &GlobalResources,
    inputs: &[AllocationInput],
    previous: &HashMap<ProjectId, ResourceQuota>,
    config: &SchedulerConfig,
) -> Vec<ResourceQuota> {
    if inputs.is_empty() {
        return Vec::new();
    }

    let previous_cpu: HashMap<ProjectId, f64> =
        previous.iter().map(|(id, q)| (*id, q.allocated_cpu_share)).collect();
    let mut fractions = strategy_fractions(strategy, inputs, &previous_cpu, config);
    apply_floor(&mut fractions, config.min_share);

    let agent_caps: Vec<f64> =
        inputs.iter().map(|i| f64::from(i.project.limits.max_parallel_agents)).collect();
    let memory_caps: Vec<f64> =
        inputs.iter().map(|i| i.project.limits.memory_cap_bytes as f64).collect();
    let disk_caps: Vec<f64> =
        inputs.iter().map(|i| i.project.limits.disk_cap_bytes as f64).collect();
    let cpu_caps: Vec<f64> = vec![global.cpu_total; inputs.len()];

    let agents = distribute(f64::from(global.max_agents), &fractions, &agent_caps);
    let memory = distribute(global.memory_bytes as f64, &fractions, &memory_caps);
    let disk = distribute(global.disk_bytes as f64, &fractions, &disk_caps);
    let cpu = distribute(global.cpu_total, &fractions, &cpu_caps);

    let expires_at =
        Utc::now() + ChronoDuration::seconds(2 * config.rebalance_interval_secs as i64);

    inputs
        .iter()
        .enumerate()
        .map(|(i, input)| ResourceQuota {
            project_id: input.project.id,
            // Floor allocation downward so integer rounding can never push
            // the sum over the global cap.
            allocated_agents: agents[i].floor() as u32,
            allocated_memory: memory[i].floor() as u64,
            allocated_cpu_share: cpu[i],
            allocated_disk: disk[i].floor() as u64,
            expires_at,
        })
        .collect()
}

/// The global resource scheduler (C7).
pub struct ResourceScheduler {
    bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    global: GlobalResources,
    config: SchedulerConfig,
    strategy: RwLock<AllocationStrategyKind>,
    last_allocation: RwLock<HashMap<ProjectId, ResourceQuota>>,
    usage: RwLock<HashMap<ProjectId, VecDeque<UsageSample>>>,
    high_pressure_ticks: RwLock<HashMap<ProjectId, u32>>,
    sinks: RwLock<HashMap<ProjectId, Arc<dyn QuotaSink>>>,
    inputs_fn: RwLock<Option<Box<dyn Fn() -> Vec<Project> + Send + Sync>>>,
    trigger_tx: mpsc::Sender<RebalanceTrigger>,
    trigger_rx: tokio::sync::Mutex<Option<mpsc::Receiver<RebalanceTrigger>>>,
}

impl ResourceScheduler {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn StateStore>,
        global: GlobalResources,
        config: SchedulerConfig,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        Self {
            bus,
            store,
            global,
            strategy: RwLock::new(config.strategy),
            config,
            last_allocation: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            high_pressure_ticks: RwLock::new(HashMap::new()),
            sinks: RwLock::new(HashMap::new()),
            inputs_fn: RwLock::new(None),
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(Some(trigger_rx)),
        }
    }

    /// Install the closure that lists the currently active projects.
    pub async fn set_project_source(
        &self,
        source: impl Fn() -> Vec<Project> + Send + Sync + 'static,
    ) {
        *self.inputs_fn.write().await = Some(Box::new(source));
    }

    /// Attach the quota sink for a project (its orchestrator handle).
    pub async fn attach_sink(&self, project_id: ProjectId, sink: Arc<dyn QuotaSink>) {
        self.sinks.write().await.insert(project_id, sink);
        let _ = self.trigger_tx.send(RebalanceTrigger::ProjectStarted).await;
    }

    /// Detach a stopped project.
    pub async fn detach_sink(&self, project_id: ProjectId) {
        self.sinks.write().await.remove(&project_id);
        self.last_allocation.write().await.remove(&project_id);
        self.usage.write().await.remove(&project_id);
        self.high_pressure_ticks.write().await.remove(&project_id);
        let _ = self.trigger_tx.send(RebalanceTrigger::ProjectStopped).await;
    }

    /// Load the persisted strategy and last allocation.
    pub async fn load(&self) -> EngineResult<()> {
        if let Some(doc) = self.store.load_scheduler().await? {
            *self.strategy.write().await = doc.strategy;
            let mut last = self.last_allocation.write().await;
            *last = doc.last_allocation.into_iter().map(|q| (q.project_id, q)).collect();
        }
        Ok(())
    }

    pub async fn strategy(&self) -> AllocationStrategyKind {
        *self.strategy.read().await
    }

    /// Switch the allocation strategy and rebalance.
    pub async fn set_strategy(&self, strategy: AllocationStrategyKind) -> EngineResult<()> {
        *self.strategy.write().await = strategy;
        self.persist().await?;
        let _ = self.trigger_tx.send(RebalanceTrigger::Manual).await;
        Ok(())
    }

    /// Request an immediate rebalance.
    pub async fn rebalance_now(&self) {
        let _ = self.trigger_tx.send(RebalanceTrigger::Manual).await;
    }

    /// Record one usage sample; emits a data-plane pressure event and flags
    /// sustained pressure for event-driven rebalancing.
    pub async fn record_usage(&self, project_id: ProjectId, sample: UsageSample) {
        let window = self.config.usage_window;
        {
            let mut usage = self.usage.write().await;
            let samples = usage.entry(project_id).or_default();
            samples.push_back(sample);
            while samples.len() > window {
                samples.pop_front();
            }
        }

        let allocation = self.last_allocation.read().await.get(&project_id).cloned();
        if let Some(quota) = allocation {
            if quota.allocated_cpu_share > f64::EPSILON {
                let pressure = sample.cpu_share / quota.allocated_cpu_share;
                self.bus
                    .publish(EngineEvent::unstamped(
                        Component::Scheduler,
                        EventPayload::ResourcePressure {
                            project_id,
                            resource: "cpu".to_string(),
                            pressure,
                        },
                    ))
                    .await;

                let mut ticks = self.high_pressure_ticks.write().await;
                let entry = ticks.entry(project_id).or_default();
                if pressure > self.config.high_pressure_threshold {
                    *entry += 1;
                    if *entry > self.config.high_pressure_ticks {
                        *entry = 0;
                        drop(ticks);
                        let _ = self.trigger_tx.send(RebalanceTrigger::SustainedPressure).await;
                    }
                } else {
                    *entry = 0;
                }
            }
        }
    }

    async fn mean_usage(&self, project_id: ProjectId) -> Option<UsageSample> {
        let usage = self.usage.read().await;
        let samples = usage.get(&project_id)?;
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        Some(UsageSample {
            memory_bytes: (samples.iter().map(|s| s.memory_bytes as f64).sum::<f64>() / n) as u64,
            cpu_share: samples.iter().map(|s| s.cpu_share).sum::<f64>() / n,
            live_cycles: (samples.iter().map(|s| f64::from(s.live_cycles)).sum::<f64>() / n) as u32,
            sampled_at: samples.back().map_or_else(Utc::now, |s| s.sampled_at),
        })
    }

    async fn persist(&self) -> EngineResult<()> {
        let strategy = *self.strategy.read().await;
        let last = self.last_allocation.read().await;
        let mut allocation: Vec<ResourceQuota> = last.values().cloned().collect();
        allocation.sort_by_key(|q| q.project_id);
        self.store.save_scheduler(&SchedulerDoc { strategy, last_allocation: allocation }).await
    }

    /// One atomic rebalance: compute for all active projects, then apply.
    pub async fn rebalance(&self) -> EngineResult<usize> {
        let projects = {
            let inputs_fn = self.inputs_fn.read().await;
            match &*inputs_fn {
                Some(source) => source(),
                None => Vec::new(),
            }
        };
        if projects.is_empty() {
            return Ok(0);
        }

        let mut inputs = Vec::with_capacity(projects.len());
        for project in projects {
            let usage = self.mean_usage(project.id).await;
            inputs.push(AllocationInput { project, usage });
        }

        let strategy = *self.strategy.read().await;
        let previous = self.last_allocation.read().await.clone();
        let quotas =
            compute_allocations(strategy, &self.global, &inputs, &previous, &self.config);

        let mut applied = 0;
        let sinks = self.sinks.read().await.clone();
        for quota in quotas {
            let project_id = quota.project_id;
            // Re-applying an identical allocation is a no-op.
            if previous.get(&project_id).is_some_and(|old| old.same_allocation(&quota)) {
                self.last_allocation.write().await.insert(project_id, quota);
                continue;
            }
            let Some(sink) = sinks.get(&project_id) else {
                continue;
            };
            match sink.apply_quota(quota.clone()).await {
                Ok(()) => {
                    self.last_allocation.write().await.insert(project_id, quota.clone());
                    self.bus
                        .publish(EngineEvent::unstamped(
                            Component::Scheduler,
                            EventPayload::QuotaChanged { project_id, quota },
                        ))
                        .await;
                    applied += 1;
                }
                Err(e) => {
                    // Keep the previous quota for this project; the others
                    // are unaffected.
                    let err = EngineError::QuotaApplyFailed {
                        project: project_id,
                        detail: e.to_string(),
                    };
                    tracing::warn!(project = %project_id, error = %err, "quota apply failed");
                    self.bus
                        .publish(EngineEvent::unstamped(
                            Component::Scheduler,
                            EventPayload::Error {
                                kind: err.kind().to_string(),
                                message: err.to_string(),
                                project_id: Some(project_id),
                                cycle_id: None,
                            },
                        ))
                        .await;
                }
            }
        }
        self.persist().await?;
        Ok(applied)
    }

    /// Current allocation snapshot.
    pub async fn allocations(&self) -> HashMap<ProjectId, ResourceQuota> {
        self.last_allocation.read().await.clone()
    }

    /// Run the periodic + event-driven rebalance loop. Call once.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let rx = scheduler.trigger_rx.lock().await.take();
            let Some(mut rx) = rx else {
                tracing::warn!("scheduler loop already started");
                return;
            };
            let period =
                std::time::Duration::from_secs(scheduler.config.rebalance_interval_secs);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    trigger = rx.recv() => {
                        match trigger {
                            Some(trigger) => {
                                tracing::debug!(?trigger, "event-driven rebalance");
                            }
                            None => break,
                        }
                    }
                }
                if let Err(e) = scheduler.rebalance().await {
                    tracing::warn!(error = %e, "rebalance failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::project::{ProjectPriority, ResourceLimits};

    fn project(priority: ProjectPriority) -> Project {
        Project::new("p", "/tmp/p", priority)
    }

    fn input(priority: ProjectPriority) -> AllocationInput {
        AllocationInput { project: project(priority), usage: None }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_weighted_high_low_is_80_20() {
        let global = GlobalResources::default();
        let inputs = vec![input(ProjectPriority::High), input(ProjectPriority::Low)];
        let quotas = compute_allocations(
            AllocationStrategyKind::WeightedByPriority,
            &global,
            &inputs,
            &HashMap::new(),
            &config(),
        );
        assert!((quotas[0].allocated_cpu_share - 0.8).abs() < 1e-9);
        assert!((quotas[1].allocated_cpu_share - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_equal_priorities_split_evenly() {
        let global = GlobalResources::default();
        let inputs = vec![input(ProjectPriority::High), input(ProjectPriority::High)];
        let quotas = compute_allocations(
            AllocationStrategyKind::WeightedByPriority,
            &global,
            &inputs,
            &HashMap::new(),
            &config(),
        );
        assert!((quotas[0].allocated_cpu_share - 0.5).abs() < 1e-9);
        assert!((quotas[1].allocated_cpu_share - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_equal_strategy_with_caps_redistributes() {
        let global = GlobalResources { max_agents: 10, ..GlobalResources::default() };
        let mut capped = project(ProjectPriority::Normal);
        capped.limits = ResourceLimits { max_parallel_agents: 2, ..ResourceLimits::default() };
        let inputs = vec![
            AllocationInput { project: capped, usage: None },
            input(ProjectPriority::Normal),
        ];
        let quotas = compute_allocations(
            AllocationStrategyKind::Equal,
            &global,
            &inputs,
            &HashMap::new(),
            &config(),
        );
        // The capped project stops at 2 agents; the rest flows onward.
        assert_eq!(quotas[0].allocated_agents, 2);
        assert_eq!(quotas[1].allocated_agents, 4);
    }

    #[test]
    fn test_caps_never_exceeded() {
        let global = GlobalResources::default();
        for strategy in [
            AllocationStrategyKind::Equal,
            AllocationStrategyKind::WeightedByPriority,
            AllocationStrategyKind::UsageDriven,
        ] {
            let inputs = vec![
                input(ProjectPriority::Critical),
                input(ProjectPriority::High),
                input(ProjectPriority::Normal),
                input(ProjectPriority::Low),
            ];
            let quotas =
                compute_allocations(strategy, &global, &inputs, &HashMap::new(), &config());
            let cpu: f64 = quotas.iter().map(|q| q.allocated_cpu_share).sum();
            let agents: u32 = quotas.iter().map(|q| q.allocated_agents).sum();
            let memory: u64 = quotas.iter().map(|q| q.allocated_memory).sum();
            assert!(cpu <= 1.0 + 1e-9, "{strategy:?}: cpu sum {cpu}");
            assert!(agents <= global.max_agents, "{strategy:?}");
            assert!(memory <= global.memory_bytes, "{strategy:?}");
            for (quota, input) in quotas.iter().zip(&inputs) {
                assert!(quota.allocated_agents <= input.project.limits.max_parallel_agents);
                assert!(quota.allocated_memory <= input.project.limits.memory_cap_bytes);
            }
        }
    }

    #[test]
    fn test_min_share_floor() {
        let global = GlobalResources::default();
        let inputs = vec![
            input(ProjectPriority::Critical),
            input(ProjectPriority::Critical),
            input(ProjectPriority::Critical),
            input(ProjectPriority::Low),
        ];
        let quotas = compute_allocations(
            AllocationStrategyKind::WeightedByPriority,
            &global,
            &inputs,
            &HashMap::new(),
            &config(),
        );
        // Low alone would get 1/25 = 0.04 < min_share 0.05.
        assert!(quotas[3].allocated_cpu_share >= 0.05 - 1e-9);
        let cpu: f64 = quotas.iter().map(|q| q.allocated_cpu_share).sum();
        assert!(cpu <= 1.0 + 1e-9);
    }

    #[test]
    fn test_usage_driven_shifts_toward_pressure() {
        let global = GlobalResources::default();
        let mut busy = input(ProjectPriority::Normal);
        let mut idle = input(ProjectPriority::Normal);
        let busy_id = busy.project.id;
        let idle_id = idle.project.id;
        busy.usage = Some(UsageSample {
            memory_bytes: 0,
            cpu_share: 0.49,
            live_cycles: 2,
            sampled_at: Utc::now(),
        });
        idle.usage = Some(UsageSample {
            memory_bytes: 0,
            cpu_share: 0.05,
            live_cycles: 0,
            sampled_at: Utc::now(),
        });
        let mut previous = HashMap::new();
        let mut busy_quota = ResourceQuota::zero(busy_id);
        busy_quota.allocated_cpu_share = 0.5;
        let mut idle_quota = ResourceQuota::zero(idle_id);
        idle_quota.allocated_cpu_share = 0.5;
        previous.insert(busy_id, busy_quota);
        previous.insert(idle_id, idle_quota);

        let quotas = compute_allocations(
            AllocationStrategyKind::UsageDriven,
            &global,
            &[busy, idle],
            &previous,
            &config(),
        );
        // busy pressure 0.98 > 0.85, idle pressure 0.1 < 0.4: shift.
        assert!(quotas[0].allocated_cpu_share > 0.5);
        assert!(quotas[1].allocated_cpu_share < 0.5);
        // Bounded by max_shift_fraction of the donor's share.
        assert!(quotas[1].allocated_cpu_share >= 0.5 - 0.5 * 0.15 - 1e-9);
    }

    #[test]
    fn test_usage_driven_stable_within_bands() {
        let global = GlobalResources::default();
        let mut a = input(ProjectPriority::Normal);
        let mut b = input(ProjectPriority::Normal);
        a.usage = Some(UsageSample {
            memory_bytes: 0,
            cpu_share: 0.3,
            live_cycles: 1,
            sampled_at: Utc::now(),
        });
        b.usage = Some(UsageSample {
            memory_bytes: 0,
            cpu_share: 0.3,
            live_cycles: 1,
            sampled_at: Utc::now(),
        });
        let mut previous = HashMap::new();
        for (id, _) in [(a.project.id, ()), (b.project.id, ())] {
            let mut quota = ResourceQuota::zero(id);
            quota.allocated_cpu_share = 0.5;
            previous.insert(id, quota);
        }
        let quotas = compute_allocations(
            AllocationStrategyKind::UsageDriven,
            &global,
            &[a, b],
            &previous,
            &config(),
        );
        // Pressure 0.6 sits inside [0.4, 0.85]: no movement.
        assert!((quotas[0].allocated_cpu_share - 0.5).abs() < 1e-9);
        assert!((quotas[1].allocated_cpu_share - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_convergence_within_five_ticks() {
        // Scenario: High+Low at 0.8/0.2, then Low is promoted to High.
        let global = GlobalResources::default();
        let first = input(ProjectPriority::High);
        let mut second = input(ProjectPriority::Low);
        let mut previous: HashMap<ProjectId, ResourceQuota> = HashMap::new();

        let quotas = compute_allocations(
            AllocationStrategyKind::WeightedByPriority,
            &global,
            &[first.clone(), second.clone()],
            &previous,
            &config(),
        );
        assert!((quotas[0].allocated_cpu_share - 0.8).abs() < 1e-9);
        assert!((quotas[1].allocated_cpu_share - 0.2).abs() < 1e-9);

        second.project.priority = ProjectPriority::High;
        let mut converged_at = None;
        for tick in 1..=5 {
            previous = compute_allocations(
                AllocationStrategyKind::WeightedByPriority,
                &global,
                &[first.clone(), second.clone()],
                &previous,
                &config(),
            )
            .into_iter()
            .map(|q| (q.project_id, q))
            .collect();
            let a = previous[&first.project.id].allocated_cpu_share;
            let b = previous[&second.project.id].allocated_cpu_share;
            if (a - 0.5).abs() < 1e-9 && (b - 0.5).abs() < 1e-9 {
                converged_at = Some(tick);
                break;
            }
        }
        assert!(converged_at.is_some(), "did not converge to 0.5/0.5 within 5 ticks");
    }

    #[test]
    fn test_empty_inputs_allocate_nothing() {
        let quotas = compute_allocations(
            AllocationStrategyKind::Equal,
            &GlobalResources::default(),
            &[],
            &HashMap::new(),
            &config(),
        );
        assert!(quotas.is_empty());
    }
}
