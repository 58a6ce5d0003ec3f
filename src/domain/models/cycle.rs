//! TDD cycle domain model.
//!
//! One cycle drives a single story through Design → RedTests → GreenCode →
//! Refactor → Commit. At most one non-terminal cycle exists per story.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CycleId, StoryId};

/// Why a cycle is parked in `Paused`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Paused by the owner principal.
    Requested,
    /// A phase exhausted its retry budget.
    MaxAttemptsExceeded,
    /// Paused by the coordinator to break a shared-resource deadlock.
    DeadlockVictim,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::MaxAttemptsExceeded => write!(f, "max attempts exceeded"),
            Self::DeadlockVictim => write!(f, "deadlock victim"),
        }
    }
}

/// Why a cycle ended in `Aborted` rather than `Commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Aborted by the owner principal.
    Requested,
    /// The story's remaining phases were skipped with admin justification.
    Skipped,
    /// Forced shutdown discarded the cycle.
    Interrupted,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Skipped => write!(f, "skipped"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Phase of a TDD cycle.
///
/// ```text
/// Design → RedTests → GreenCode → Refactor → Commit
///              ↑           ↖ (regression) ↙
///              └── explicit re-entry for new tests
/// Paused is re-entrable from any non-terminal phase; Aborted is terminal.
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TddPhase {
    Design,
    RedTests,
    GreenCode,
    Refactor,
    Commit,
    Paused {
        /// Phase to resume into.
        prev: Box<TddPhase>,
        reason: PauseReason,
    },
    Aborted {
        reason: AbortReason,
    },
}

/// Fieldless discriminant of [`TddPhase`], used as a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TddPhaseKind {
    Design,
    RedTests,
    GreenCode,
    Refactor,
    Commit,
    Paused,
    Aborted,
}

impl TddPhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Design => "Design",
            Self::RedTests => "RedTests",
            Self::GreenCode => "GreenCode",
            Self::Refactor => "Refactor",
            Self::Commit => "Commit",
            Self::Paused => "Paused",
            Self::Aborted => "Aborted",
        }
    }
}

impl TddPhase {
    pub fn kind(&self) -> TddPhaseKind {
        match self {
            Self::Design => TddPhaseKind::Design,
            Self::RedTests => TddPhaseKind::RedTests,
            Self::GreenCode => TddPhaseKind::GreenCode,
            Self::Refactor => TddPhaseKind::Refactor,
            Self::Commit => TddPhaseKind::Commit,
            Self::Paused { .. } => TddPhaseKind::Paused,
            Self::Aborted { .. } => TddPhaseKind::Aborted,
        }
    }

    /// Commit and Aborted never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Commit | Self::Aborted { .. })
    }

    /// The working phase an active (non-paused, non-terminal) cycle is in.
    pub fn working_phase(&self) -> Option<TddPhaseKind> {
        match self {
            Self::Design | Self::RedTests | Self::GreenCode | Self::Refactor => Some(self.kind()),
            Self::Paused { prev, .. } => prev.working_phase(),
            Self::Commit | Self::Aborted { .. } => None,
        }
    }
}

/// Per-phase attempt counters for the current cycle occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAttempts {
    pub design: u32,
    pub red_tests: u32,
    pub green_code: u32,
    pub refactor: u32,
    pub commit: u32,
}

impl PhaseAttempts {
    pub fn get(&self, phase: TddPhaseKind) -> u32 {
        match phase {
            TddPhaseKind::Design => self.design,
            TddPhaseKind::RedTests => self.red_tests,
            TddPhaseKind::GreenCode => self.green_code,
            TddPhaseKind::Refactor => self.refactor,
            TddPhaseKind::Commit => self.commit,
            TddPhaseKind::Paused | TddPhaseKind::Aborted => 0,
        }
    }

    pub fn bump(&mut self, phase: TddPhaseKind) -> u32 {
        let slot = match phase {
            TddPhaseKind::Design => &mut self.design,
            TddPhaseKind::RedTests => &mut self.red_tests,
            TddPhaseKind::GreenCode => &mut self.green_code,
            TddPhaseKind::Refactor => &mut self.refactor,
            TddPhaseKind::Commit => &mut self.commit,
            TddPhaseKind::Paused | TddPhaseKind::Aborted => return 0,
        };
        *slot += 1;
        *slot
    }

    pub fn reset(&mut self, phase: TddPhaseKind) {
        match phase {
            TddPhaseKind::Design => self.design = 0,
            TddPhaseKind::RedTests => self.red_tests = 0,
            TddPhaseKind::GreenCode => self.green_code = 0,
            TddPhaseKind::Refactor => self.refactor = 0,
            TddPhaseKind::Commit => self.commit = 0,
            TddPhaseKind::Paused | TddPhaseKind::Aborted => {}
        }
    }
}

/// File references produced by the phases of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleArtifacts {
    /// Design document reference, set during Design.
    pub design_doc: Option<String>,
    /// Test files written during RedTests.
    #[serde(default)]
    pub test_files: Vec<String>,
    /// Source files touched during GreenCode/Refactor.
    #[serde(default)]
    pub source_files: Vec<String>,
}

/// The test selector set captured at entry to RedTests.
///
/// Opaque strings handed to the test-runner port; later phase guards run
/// exactly this set. The naming convention is the runner's business.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSelector {
    pub entries: Vec<String>,
}

impl TestSelector {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A live or finished TDD cycle for one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TddCycle {
    pub id: CycleId,
    pub story_id: StoryId,
    pub phase: TddPhase,
    pub attempts: PhaseAttempts,
    pub artifacts: CycleArtifacts,
    /// Captured at entry to RedTests; used by every later phase guard.
    #[serde(default)]
    pub selector: TestSelector,
    /// Set once the selector set has been observed failing in RedTests.
    #[serde(default)]
    pub red_observed: bool,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Detail of the most recent phase failure, for diagnostics.
    pub last_failure: Option<String>,
}

impl TddCycle {
    pub fn new(story_id: StoryId) -> Self {
        Self {
            id: CycleId::new(),
            story_id,
            phase: TddPhase::Design,
            attempts: PhaseAttempts::default(),
            artifacts: CycleArtifacts::default(),
            selector: TestSelector::default(),
            red_observed: false,
            started_at: Utc::now(),
            paused_at: None,
            completed_at: None,
            last_failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
