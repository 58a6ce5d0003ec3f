//! Agent executor port - interface to out-of-process AI agents.
//!
//! The engine never talks to a model directly; it hands an invocation to an
//! executor and receives artifacts as evidence. Every invocation carries a
//! deadline and an idempotency key.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::EngineResult;
use crate::domain::models::cycle::TddPhaseKind;
use crate::domain::models::ids::{CycleId, ProjectId, StoryId};
use crate::domain::models::receipt::ReceiptKey;

/// One unit of agent work: produce the artifacts for a phase attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInvocation {
    pub project_id: ProjectId,
    pub cycle_id: CycleId,
    pub story_id: StoryId,
    pub phase: TddPhaseKind,
    pub attempt: u32,
    /// Story description plus acceptance criteria, as agent context.
    pub briefing: String,
    /// Hard deadline; on expiry the invocation is cancelled and the phase
    /// records an attempt failure.
    pub deadline: Duration,
}

impl AgentInvocation {
    /// Idempotency key of this invocation's side effect.
    pub fn receipt_key(&self) -> ReceiptKey {
        ReceiptKey {
            cycle_id: self.cycle_id,
            phase: self.phase,
            attempt: self.attempt,
        }
    }
}

/// Artifacts an agent produced for one phase attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    /// Design document reference (Design phase).
    pub design_artifact: Option<String>,
    /// Test files written (RedTests phase).
    pub test_files: Vec<String>,
    /// Source files touched (GreenCode/Refactor phases).
    pub source_files: Vec<String>,
    /// Whether the commit side effect was applied (Commit attempt).
    pub commit_applied: bool,
    /// One-line outcome summary for the receipt.
    pub summary: String,
}

/// Interface to an agent backend.
///
/// Implementations must confine side effects to the project's subtree and
/// must make the side effect of a given [`ReceiptKey`] idempotent: invoking
/// the same key twice applies it at most once.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Run one invocation to completion within its deadline.
    ///
    /// Errors map to the engine taxonomy: `AgentTimeout` on deadline,
    /// `AgentFailure` on a failed run.
    async fn invoke(&self, invocation: AgentInvocation) -> EngineResult<AgentOutcome>;
}
