//! Foreman - multi-project orchestrator for AI-assisted development.
//!
//! For each registered project the engine drives two coupled state
//! machines: a workflow (Scrum) machine moving stories through a sprint,
//! and a per-story TDD machine moving tests and code through
//! Design → RedTests → GreenCode → Refactor → Commit. Execution is
//! multiplexed across projects under global and per-project resource
//! quotas:
//!
//! - one supervised task per project with a single-consumer command queue
//! - a global scheduler that rebalances agent/cpu/memory/disk quotas
//! - a cross-project coordinator serialising shared-resource use
//! - a typed event bus with a broadcaster for external subscribers
//! - crash recovery from versioned on-disk snapshots

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{EngineError, EngineResult};
