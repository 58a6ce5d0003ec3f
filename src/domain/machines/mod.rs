//! The two coupled state machines of the engine.
//!
//! Transition tables are data; transition functions are pure and never
//! suspend. The orchestration layer gathers guard inputs, calls the
//! machines, then applies side effects and emits events.

pub mod tdd;
pub mod workflow;

pub use tdd::{apply_step, PhaseEvidence, QualityReport, StepOutcome, TddStep, TestReport};
pub use workflow::{
    allowed_verbs, block, transition, GuardInputs, WorkflowState, WorkflowStateKind, WorkflowVerb,
    WorkflowVerbKind,
};
