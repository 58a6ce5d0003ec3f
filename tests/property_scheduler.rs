//! Property tests for the allocation computation: global caps, per-project
//! caps, and the starvation floor hold for every strategy and input shape.

use std::collections::HashMap;

use proptest::prelude::*;

use foreman::domain::models::config::SchedulerConfig;
use foreman::domain::models::project::{Project, ProjectPriority, ResourceLimits};
use foreman::domain::models::quota::{AllocationStrategyKind, GlobalResources, UsageSample};
use foreman::services::{compute_allocations, AllocationInput};

fn priority_strategy() -> impl Strategy<Value = ProjectPriority> {
    prop_oneof![
        Just(ProjectPriority::Low),
        Just(ProjectPriority::Normal),
        Just(ProjectPriority::High),
        Just(ProjectPriority::Critical),
    ]
}

fn strategy_kind() -> impl Strategy<Value = AllocationStrategyKind> {
    prop_oneof![
        Just(AllocationStrategyKind::Equal),
        Just(AllocationStrategyKind::WeightedByPriority),
        Just(AllocationStrategyKind::UsageDriven),
    ]
}

fn input_strategy() -> impl Strategy<Value = AllocationInput> {
    (
        priority_strategy(),
        1u32..=8,
        0.1f64..=2.0,
        proptest::option::of((0.0f64..=1.0, 0u32..=4)),
    )
        .prop_map(|(priority, max_agents, cpu_weight, usage)| {
            let mut project = Project::new("p", "/tmp/p", priority);
            project.limits = ResourceLimits {
                max_parallel_agents: max_agents,
                cpu_weight,
                ..ResourceLimits::default()
            };
            AllocationInput {
                project,
                usage: usage.map(|(cpu_share, live_cycles)| UsageSample {
                    memory_bytes: 0,
                    cpu_share,
                    live_cycles,
                    sampled_at: chrono::Utc::now(),
                }),
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_caps_and_floor_hold(
        strategy in strategy_kind(),
        inputs in proptest::collection::vec(input_strategy(), 1..8),
    ) {
        let global = GlobalResources::default();
        let config = SchedulerConfig::default();
        let quotas =
            compute_allocations(strategy, &global, &inputs, &HashMap::new(), &config);

        prop_assert_eq!(quotas.len(), inputs.len());

        // Global caps hold.
        let cpu: f64 = quotas.iter().map(|q| q.allocated_cpu_share).sum();
        let agents: u32 = quotas.iter().map(|q| q.allocated_agents).sum();
        let memory: u64 = quotas.iter().map(|q| q.allocated_memory).sum();
        let disk: u64 = quotas.iter().map(|q| q.allocated_disk).sum();
        prop_assert!(cpu <= global.cpu_total + 1e-9);
        prop_assert!(agents <= global.max_agents);
        prop_assert!(memory <= global.memory_bytes);
        prop_assert!(disk <= global.disk_bytes);

        // Per-project declared caps hold.
        for (quota, input) in quotas.iter().zip(&inputs) {
            prop_assert!(quota.allocated_agents <= input.project.limits.max_parallel_agents);
            prop_assert!(quota.allocated_memory <= input.project.limits.memory_cap_bytes);
            prop_assert!(quota.allocated_disk <= input.project.limits.disk_cap_bytes);
        }

        // No active project is starved of cpu when the floor is feasible.
        if config.min_share * inputs.len() as f64 <= 1.0 {
            for quota in &quotas {
                prop_assert!(quota.allocated_cpu_share >= config.min_share - 1e-9);
            }
        }
    }

    #[test]
    fn prop_identical_inputs_are_deterministic(
        strategy in strategy_kind(),
        inputs in proptest::collection::vec(input_strategy(), 1..6),
    ) {
        let global = GlobalResources::default();
        let config = SchedulerConfig::default();
        let first =
            compute_allocations(strategy, &global, &inputs, &HashMap::new(), &config);
        let second =
            compute_allocations(strategy, &global, &inputs, &HashMap::new(), &config);
        for (a, b) in first.iter().zip(&second) {
            prop_assert!(a.same_allocation(b));
        }
    }

    #[test]
    fn prop_usage_driven_shift_is_bounded(
        busy_usage in 0.86f64..=1.0,
        idle_usage in 0.0f64..=0.39,
    ) {
        let global = GlobalResources::default();
        let config = SchedulerConfig::default();
        let mut busy = AllocationInput {
            project: Project::new("busy", "/tmp/busy", ProjectPriority::Normal),
            usage: None,
        };
        let mut idle = AllocationInput {
            project: Project::new("idle", "/tmp/idle", ProjectPriority::Normal),
            usage: None,
        };
        let mut previous = HashMap::new();
        for input in [&busy, &idle] {
            let mut quota =
                foreman::domain::models::quota::ResourceQuota::zero(input.project.id);
            quota.allocated_cpu_share = 0.5;
            previous.insert(input.project.id, quota);
        }
        busy.usage = Some(UsageSample {
            memory_bytes: 0,
            cpu_share: busy_usage * 0.5,
            live_cycles: 1,
            sampled_at: chrono::Utc::now(),
        });
        idle.usage = Some(UsageSample {
            memory_bytes: 0,
            cpu_share: idle_usage * 0.5,
            live_cycles: 0,
            sampled_at: chrono::Utc::now(),
        });

        let quotas = compute_allocations(
            AllocationStrategyKind::UsageDriven,
            &global,
            &[busy, idle],
            &previous,
            &config,
        );
        // Oscillation bound: the donor loses at most max_shift_fraction of
        // its previous share per tick.
        let donor = quotas[1].allocated_cpu_share;
        prop_assert!(donor >= 0.5 * (1.0 - config.max_shift_fraction) - 1e-9);
        prop_assert!(quotas[0].allocated_cpu_share >= 0.5 - 1e-9);
    }
}
