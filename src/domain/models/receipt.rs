//! Idempotent agent-invocation receipts.
//!
//! Every agent side effect is recorded under `(cycle, phase, attempt)`.
//! After a crash the orchestrator replays its plan against the receipt set,
//! so no side effect is applied twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cycle::TddPhaseKind;
use super::ids::CycleId;

/// Key of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiptKey {
    pub cycle_id: CycleId,
    pub phase: TddPhaseKind,
    pub attempt: u32,
}

impl std::fmt::Display for ReceiptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.cycle_id, self.phase.as_str(), self.attempt)
    }
}

/// Recorded outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReceipt {
    pub key: ReceiptKey,
    /// Whether the invocation's side effect was applied.
    pub succeeded: bool,
    /// Short outcome summary for diagnostics.
    pub summary: String,
    pub completed_at: DateTime<Utc>,
}

impl AgentReceipt {
    pub fn success(key: ReceiptKey, summary: impl Into<String>) -> Self {
        Self {
            key,
            succeeded: true,
            summary: summary.into(),
            completed_at: Utc::now(),
        }
    }

    pub fn failure(key: ReceiptKey, summary: impl Into<String>) -> Self {
        Self {
            key,
            succeeded: false,
            summary: summary.into(),
            completed_at: Utc::now(),
        }
    }
}
