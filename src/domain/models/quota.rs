//! Resource quota model.
//!
//! The scheduler recomputes one [`ResourceQuota`] per active project; the
//! sum across projects never exceeds the global caps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ProjectId;

/// Global resource caps the scheduler divides across projects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalResources {
    pub max_agents: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    /// Total CPU share; allocations are fractions summing to at most this.
    pub cpu_total: f64,
}

impl Default for GlobalResources {
    fn default() -> Self {
        Self {
            max_agents: 16,
            memory_bytes: 32 * 1024 * 1024 * 1024,
            disk_bytes: 256 * 1024 * 1024 * 1024,
            cpu_total: 1.0,
        }
    }
}

/// Scheduler-issued allocation for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub project_id: ProjectId,
    pub allocated_agents: u32,
    pub allocated_memory: u64,
    /// Fraction of global CPU; sums to ≤ 1 across active projects.
    pub allocated_cpu_share: f64,
    pub allocated_disk: u64,
    /// After this instant the quota is stale and must be recomputed.
    pub expires_at: DateTime<Utc>,
}

impl ResourceQuota {
    /// A zero allocation, used before the first rebalance reaches a project.
    pub fn zero(project_id: ProjectId) -> Self {
        Self {
            project_id,
            allocated_agents: 0,
            allocated_memory: 0,
            allocated_cpu_share: 0.0,
            allocated_disk: 0,
            expires_at: Utc::now(),
        }
    }

    /// Whether applying `other` would change anything. Re-applying an
    /// identical quota is a no-op.
    pub fn same_allocation(&self, other: &Self) -> bool {
        self.allocated_agents == other.allocated_agents
            && self.allocated_memory == other.allocated_memory
            && self.allocated_disk == other.allocated_disk
            && (self.allocated_cpu_share - other.allocated_cpu_share).abs() < 1e-9
    }
}

/// One usage observation for a project, sampled into a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub memory_bytes: u64,
    pub cpu_share: f64,
    pub live_cycles: u32,
    pub sampled_at: DateTime<Utc>,
}

/// Allocation strategy selectable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategyKind {
    /// Divide each global resource evenly, clamp to caps, redistribute.
    Equal,
    /// Allocate proportionally to priority weight × cpu weight.
    WeightedByPriority,
    /// Shift allocation toward projects under pressure, bounded per tick.
    UsageDriven,
}

impl Default for AllocationStrategyKind {
    fn default() -> Self {
        Self::WeightedByPriority
    }
}

impl AllocationStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::WeightedByPriority => "weighted_by_priority",
            Self::UsageDriven => "usage_driven",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "equal" => Some(Self::Equal),
            "weighted" | "weighted_by_priority" => Some(Self::WeightedByPriority),
            "usage" | "usage_driven" => Some(Self::UsageDriven),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_quota() {
        let quota = ResourceQuota::zero(ProjectId::new());
        assert_eq!(quota.allocated_agents, 0);
        assert!(quota.allocated_cpu_share.abs() < f64::EPSILON);
    }

    #[test]
    fn test_same_allocation_ignores_expiry() {
        let id = ProjectId::new();
        let a = ResourceQuota {
            project_id: id,
            allocated_agents: 2,
            allocated_memory: 1024,
            allocated_cpu_share: 0.5,
            allocated_disk: 2048,
            expires_at: Utc::now(),
        };
        let mut b = a.clone();
        b.expires_at = b.expires_at + chrono::Duration::seconds(300);
        assert!(a.same_allocation(&b));
        b.allocated_agents = 3;
        assert!(!a.same_allocation(&b));
    }
}
