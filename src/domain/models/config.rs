//! Typed engine configuration.
//!
//! Every option is enumerated; unknown keys are rejected at load time by
//! `deny_unknown_fields`. Loading and validation live in
//! `infrastructure::config`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::quota::{AllocationStrategyKind, GlobalResources};

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Strategy selected at startup; changeable at runtime.
    pub strategy: AllocationStrategyKind,
    /// Periodic rebalance interval in seconds.
    pub rebalance_interval_secs: u64,
    /// Floor share of each resource every active project receives.
    pub min_share: f64,
    /// Usage-driven: shift away from projects below this pressure.
    pub low_pressure_threshold: f64,
    /// Usage-driven: shift toward projects above this pressure.
    pub high_pressure_threshold: f64,
    /// Usage-driven: per-tick shift bound, as a fraction of the resource.
    pub max_shift_fraction: f64,
    /// Sustained high pressure for this many ticks triggers a rebalance.
    pub high_pressure_ticks: u32,
    /// Sliding usage window length in samples.
    pub usage_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategyKind::default(),
            rebalance_interval_secs: 300,
            min_share: 0.05,
            low_pressure_threshold: 0.4,
            high_pressure_threshold: 0.85,
            max_shift_fraction: 0.15,
            high_pressure_ticks: 3,
            usage_window: 16,
        }
    }
}

/// Supervision and per-project orchestration tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisionConfig {
    /// Child liveness signal interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats before a child is marked unhealthy.
    pub missed_heartbeat_limit: u32,
    /// Graceful-shutdown drain deadline in seconds.
    pub shutdown_deadline_secs: u64,
    /// Per-phase retry budget before a cycle is parked for a human.
    pub max_phase_attempts: u32,
    /// Deadline for one agent invocation in seconds.
    pub agent_deadline_secs: u64,
    /// Periodic snapshot interval in seconds.
    pub snapshot_interval_secs: u64,
    /// Recently applied correlation ids remembered for idempotent resubmits.
    pub command_dedup_window: usize,
    /// Command queue depth per project orchestrator.
    pub command_queue_depth: usize,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            missed_heartbeat_limit: 3,
            shutdown_deadline_secs: 30,
            max_phase_attempts: 3,
            agent_deadline_secs: 600,
            snapshot_interval_secs: 120,
            command_dedup_window: 256,
            command_queue_depth: 256,
        }
    }
}

/// Event bus and broadcaster tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventConfig {
    /// Broadcast channel capacity for in-process subscribers.
    pub channel_capacity: usize,
    /// Replay ring capacity, in events, for external subscribers.
    pub ring_capacity: usize,
    /// Size bound of each on-disk `events.log` before compaction.
    pub events_log_max_bytes: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            ring_capacity: 10_000,
            events_log_max_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Logging output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of: trace, debug, info, warn, error.
    pub level: String,
    /// One of: json, pretty.
    pub format: String,
    /// Optional log file directory for the daemon; stderr when absent.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            directory: None,
        }
    }
}

/// External runner programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnersConfig {
    /// Agent runner program invoked per phase attempt.
    pub agent_program: PathBuf,
    /// Fixed arguments for the agent runner.
    pub agent_args: Vec<String>,
    /// Test harness program for selector runs and quality gates.
    pub test_program: PathBuf,
    /// Fixed arguments for the test harness.
    pub test_args: Vec<String>,
    /// Coverage threshold for the Refactor quality gate.
    pub coverage_threshold: f64,
    /// Complexity cap for the Refactor quality gate.
    pub complexity_cap: u32,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            agent_program: PathBuf::from("agent-runner"),
            agent_args: Vec::new(),
            test_program: PathBuf::from("test-runner"),
            test_args: Vec::new(),
            coverage_threshold: 0.8,
            complexity_cap: 15,
        }
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding `.orch-global/`. Defaults to the working directory.
    #[serde(default)]
    pub global_root: Option<PathBuf>,
    #[serde(default)]
    pub resources: GlobalResources,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runners: RunnersConfig,
}
