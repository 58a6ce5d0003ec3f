//! TDD state machine.
//!
//! Drives one cycle through Design → RedTests → GreenCode → Refactor →
//! Commit. Steps are pure with respect to I/O: the orchestrator gathers
//! evidence (agent artifacts, test-runner reports, quality gates) and the
//! machine decides the transition.

use serde::{Deserialize, Serialize};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::cycle::{
    AbortReason, PauseReason, TddCycle, TddPhase, TddPhaseKind,
};

/// Selector-set run outcome, scoped to the cycle's captured tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub failures: u32,
    pub passes: u32,
}

impl TestReport {
    pub fn all_green(&self) -> bool {
        self.failures == 0
    }

    /// The red-bar condition: every selector test failing, none passing.
    pub fn all_red(&self) -> bool {
        self.failures >= 1 && self.passes == 0
    }
}

/// Declared quality gates evaluated at Refactor exit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub coverage: f64,
    pub coverage_threshold: f64,
    pub complexity: u32,
    pub complexity_cap: u32,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.coverage >= self.coverage_threshold && self.complexity <= self.complexity_cap
    }
}

/// Evidence gathered by the orchestrator before attempting a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseEvidence {
    /// Design document reference; must be present and non-empty to leave
    /// Design.
    pub design_artifact: Option<String>,
    /// Test files belonging to the cycle.
    pub test_files: Vec<String>,
    /// Latest selector-set run, if one was made.
    pub selector_report: Option<TestReport>,
    /// Quality gates, evaluated for Refactor exit.
    pub quality: Option<QualityReport>,
    /// Whether the atomic commit side effect has been applied.
    pub commit_applied: bool,
}

/// One operation on the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TddStep {
    /// Try to exit the current working phase using the evidence.
    Advance,
    /// Record a failed attempt (agent timeout/failure) without advancing.
    RecordFailure { detail: String },
    /// Park the cycle; records the pre-pause phase.
    Pause { reason: PauseReason },
    /// Return from Paused to the recorded phase. Owner principal only,
    /// enforced by the command dispatcher.
    Resume,
    /// Terminate without committing.
    Abort { reason: AbortReason },
    /// Re-enter GreenCode from Refactor after a test regression.
    Regress,
    /// Explicit re-entry to RedTests to add tests after green.
    ReenterRedTests,
}

/// Result of applying one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The phase changed.
    Transitioned { from: TddPhaseKind, to: TddPhaseKind },
    /// The guard rejected the exit; the attempt counter advanced.
    Held {
        phase: TddPhaseKind,
        attempt: u32,
        reason: String,
    },
    /// The retry budget is exhausted; the cycle is now
    /// `Paused(MaxAttemptsExceeded)` and a human must intervene.
    Parked { phase: TddPhaseKind },
}

fn invalid(cycle: &TddCycle, step: &TddStep) -> EngineError {
    let attempted = match step {
        TddStep::Advance => "Advance",
        TddStep::RecordFailure { .. } => "RecordFailure",
        TddStep::Pause { .. } => "Pause",
        TddStep::Resume => "Resume",
        TddStep::Abort { .. } => "Abort",
        TddStep::Regress => "Regress",
        TddStep::ReenterRedTests => "ReenterRedTests",
    };
    EngineError::InvalidTransition {
        current: cycle.phase.kind().as_str().to_string(),
        attempted: attempted.to_string(),
        allowed: allowed_steps(&cycle.phase).iter().map(|s| (*s).to_string()).collect(),
    }
}

/// Step names permitted in the given phase, for error reporting.
pub fn allowed_steps(phase: &TddPhase) -> Vec<&'static str> {
    match phase {
        TddPhase::Design => vec!["Advance", "RecordFailure", "Pause", "Abort"],
        TddPhase::RedTests => vec!["Advance", "RecordFailure", "Pause", "Abort"],
        TddPhase::GreenCode => {
            vec!["Advance", "RecordFailure", "Pause", "Abort", "ReenterRedTests"]
        }
        TddPhase::Refactor => {
            vec!["Advance", "RecordFailure", "Pause", "Abort", "Regress", "ReenterRedTests"]
        }
        TddPhase::Paused { .. } => vec!["Resume", "Abort", "Pause"],
        TddPhase::Commit | TddPhase::Aborted { .. } => vec![],
    }
}

/// Check the exit guard for the current working phase.
fn exit_guard(cycle: &TddCycle, evidence: &PhaseEvidence) -> Result<TddPhase, String> {
    match &cycle.phase {
        TddPhase::Design => match &evidence.design_artifact {
            Some(doc) if !doc.trim().is_empty() => Ok(TddPhase::RedTests),
            Some(_) => Err("design artifact is empty".to_string()),
            None => Err("no design artifact produced".to_string()),
        },
        TddPhase::RedTests => {
            if evidence.test_files.is_empty() {
                return Err("no test files written".to_string());
            }
            match evidence.selector_report {
                Some(report) if report.all_red() => Ok(TddPhase::GreenCode),
                Some(report) => Err(format!(
                    "selector set not red: {} failures, {} passes",
                    report.failures, report.passes
                )),
                None => Err("selector set was not run".to_string()),
            }
        }
        TddPhase::GreenCode => match evidence.selector_report {
            Some(report) if report.all_green() => Ok(TddPhase::Refactor),
            Some(report) => Err(format!("selector set still failing: {} failures", report.failures)),
            None => Err("selector set was not run".to_string()),
        },
        TddPhase::Refactor => {
            match evidence.selector_report {
                Some(report) if report.all_green() => {}
                Some(report) => {
                    return Err(format!(
                        "refactor broke the selector set: {} failures",
                        report.failures
                    ))
                }
                None => return Err("selector set was not run".to_string()),
            }
            match evidence.quality {
                Some(quality) if quality.passed() => {}
                Some(quality) => {
                    return Err(format!(
                        "quality gates failed: coverage {:.2} (threshold {:.2}), complexity {} (cap {})",
                        quality.coverage,
                        quality.coverage_threshold,
                        quality.complexity,
                        quality.complexity_cap
                    ))
                }
                None => return Err("quality gates were not evaluated".to_string()),
            }
            if evidence.commit_applied {
                Ok(TddPhase::Commit)
            } else {
                Err("commit side effect not applied".to_string())
            }
        }
        TddPhase::Commit | TddPhase::Aborted { .. } | TddPhase::Paused { .. } => {
            Err("phase has no exit guard".to_string())
        }
    }
}

/// Bump the phase's attempt counter and park the cycle once the budget is
/// spent.
fn hold_or_park(cycle: &mut TddCycle, reason: String, max_attempts: u32) -> StepOutcome {
    let phase = cycle.phase.kind();
    let attempt = cycle.attempts.bump(phase);
    cycle.last_failure = Some(reason.clone());
    if attempt >= max_attempts {
        cycle.phase = TddPhase::Paused {
            prev: Box::new(cycle.phase.clone()),
            reason: PauseReason::MaxAttemptsExceeded,
        };
        cycle.paused_at = Some(chrono::Utc::now());
        StepOutcome::Parked { phase }
    } else {
        StepOutcome::Held { phase, attempt, reason }
    }
}

/// Apply one step to a cycle.
///
/// Mutates the cycle in place on success; an `Err` leaves it untouched.
pub fn apply_step(
    cycle: &mut TddCycle,
    step: &TddStep,
    evidence: &PhaseEvidence,
    max_attempts: u32,
) -> EngineResult<StepOutcome> {
    if cycle.phase.is_terminal() {
        return Err(invalid(cycle, step));
    }

    match step {
        TddStep::Advance => {
            if matches!(cycle.phase, TddPhase::Paused { .. }) {
                return Err(invalid(cycle, step));
            }
            let from = cycle.phase.kind();
            // Leaving GreenCode without an observed red bar breaks the
            // cycle's core invariant.
            if from == TddPhaseKind::GreenCode && !cycle.red_observed {
                return Err(EngineError::InternalInvariantViolated {
                    detail: format!(
                        "cycle {} reached GreenCode without an observed red selector set",
                        cycle.id
                    ),
                });
            }
            match exit_guard(cycle, evidence) {
                Ok(next) => {
                    let to = next.kind();
                    if to == TddPhaseKind::GreenCode {
                        cycle.red_observed = true;
                    }
                    if to == TddPhaseKind::Commit {
                        cycle.completed_at = Some(chrono::Utc::now());
                    }
                    cycle.last_failure = None;
                    cycle.phase = next;
                    Ok(StepOutcome::Transitioned { from, to })
                }
                Err(reason) => Ok(hold_or_park(cycle, reason, max_attempts)),
            }
        }
        TddStep::RecordFailure { detail } => {
            if matches!(cycle.phase, TddPhase::Paused { .. }) {
                return Err(invalid(cycle, step));
            }
            Ok(hold_or_park(cycle, detail.clone(), max_attempts))
        }
        TddStep::Pause { reason } => {
            if matches!(cycle.phase, TddPhase::Paused { .. }) {
                // Pausing a paused cycle keeps the original pre-pause phase.
                return Ok(StepOutcome::Transitioned {
                    from: TddPhaseKind::Paused,
                    to: TddPhaseKind::Paused,
                });
            }
            let from = cycle.phase.kind();
            cycle.phase = TddPhase::Paused {
                prev: Box::new(cycle.phase.clone()),
                reason: reason.clone(),
            };
            cycle.paused_at = Some(chrono::Utc::now());
            Ok(StepOutcome::Transitioned { from, to: TddPhaseKind::Paused })
        }
        TddStep::Resume => match cycle.phase.clone() {
            TddPhase::Paused { prev, .. } => {
                let to = prev.kind();
                cycle.phase = *prev;
                cycle.paused_at = None;
                Ok(StepOutcome::Transitioned { from: TddPhaseKind::Paused, to })
            }
            _ => Err(invalid(cycle, step)),
        },
        TddStep::Abort { reason } => {
            let from = cycle.phase.kind();
            cycle.phase = TddPhase::Aborted { reason: reason.clone() };
            cycle.completed_at = Some(chrono::Utc::now());
            Ok(StepOutcome::Transitioned { from, to: TddPhaseKind::Aborted })
        }
        TddStep::Regress => {
            if cycle.phase != TddPhase::Refactor {
                return Err(invalid(cycle, step));
            }
            match evidence.selector_report {
                Some(report) if report.failures >= 1 => {
                    // Regression re-entry resets the Refactor budget but
                    // keeps the GreenCode counter.
                    cycle.attempts.reset(TddPhaseKind::Refactor);
                    cycle.phase = TddPhase::GreenCode;
                    Ok(StepOutcome::Transitioned {
                        from: TddPhaseKind::Refactor,
                        to: TddPhaseKind::GreenCode,
                    })
                }
                _ => Err(EngineError::PreconditionFailed {
                    reason: "regression re-entry requires a failing selector run".to_string(),
                }),
            }
        }
        TddStep::ReenterRedTests => match cycle.phase {
            TddPhase::GreenCode | TddPhase::Refactor => {
                let from = cycle.phase.kind();
                cycle.red_observed = false;
                cycle.phase = TddPhase::RedTests;
                Ok(StepOutcome::Transitioned { from, to: TddPhaseKind::RedTests })
            }
            _ => Err(invalid(cycle, step)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ids::StoryId;

    const MAX: u32 = 3;

    fn design_evidence() -> PhaseEvidence {
        PhaseEvidence {
            design_artifact: Some("docs/design/s1.md".to_string()),
            ..PhaseEvidence::default()
        }
    }

    fn red_evidence() -> PhaseEvidence {
        PhaseEvidence {
            test_files: vec!["tests/s1_test.rs".to_string()],
            selector_report: Some(TestReport { failures: 2, passes: 0 }),
            ..PhaseEvidence::default()
        }
    }

    fn green_evidence() -> PhaseEvidence {
        PhaseEvidence {
            selector_report: Some(TestReport { failures: 0, passes: 2 }),
            ..PhaseEvidence::default()
        }
    }

    fn commit_evidence() -> PhaseEvidence {
        PhaseEvidence {
            selector_report: Some(TestReport { failures: 0, passes: 2 }),
            quality: Some(QualityReport {
                coverage: 0.9,
                coverage_threshold: 0.8,
                complexity: 5,
                complexity_cap: 10,
            }),
            commit_applied: true,
            ..PhaseEvidence::default()
        }
    }

    fn cycle_in(phase: TddPhase, red_observed: bool) -> TddCycle {
        let mut cycle = TddCycle::new(StoryId::new());
        cycle.phase = phase;
        cycle.red_observed = red_observed;
        cycle
    }

    #[test]
    fn test_full_happy_path() {
        let mut cycle = TddCycle::new(StoryId::new());

        let out = apply_step(&mut cycle, &TddStep::Advance, &design_evidence(), MAX).unwrap();
        assert_eq!(
            out,
            StepOutcome::Transitioned { from: TddPhaseKind::Design, to: TddPhaseKind::RedTests }
        );

        apply_step(&mut cycle, &TddStep::Advance, &red_evidence(), MAX).unwrap();
        assert_eq!(cycle.phase, TddPhase::GreenCode);
        assert!(cycle.red_observed);

        apply_step(&mut cycle, &TddStep::Advance, &green_evidence(), MAX).unwrap();
        assert_eq!(cycle.phase, TddPhase::Refactor);

        apply_step(&mut cycle, &TddStep::Advance, &commit_evidence(), MAX).unwrap();
        assert_eq!(cycle.phase, TddPhase::Commit);
        assert!(cycle.is_terminal());
        assert!(cycle.completed_at.is_some());
    }

    #[test]
    fn test_design_exit_requires_nonempty_artifact() {
        let mut cycle = TddCycle::new(StoryId::new());
        let evidence = PhaseEvidence {
            design_artifact: Some("   ".to_string()),
            ..PhaseEvidence::default()
        };
        let out = apply_step(&mut cycle, &TddStep::Advance, &evidence, MAX).unwrap();
        assert!(matches!(out, StepOutcome::Held { phase: TddPhaseKind::Design, attempt: 1, .. }));
        assert_eq!(cycle.phase, TddPhase::Design);
    }

    #[test]
    fn test_red_exit_rejected_while_tests_pass() {
        let mut cycle = cycle_in(TddPhase::RedTests, false);
        let evidence = PhaseEvidence {
            test_files: vec!["tests/s1_test.rs".to_string()],
            selector_report: Some(TestReport { failures: 0, passes: 2 }),
            ..PhaseEvidence::default()
        };
        let out = apply_step(&mut cycle, &TddStep::Advance, &evidence, MAX).unwrap();
        assert!(matches!(out, StepOutcome::Held { .. }));
        assert_eq!(cycle.phase, TddPhase::RedTests);
        assert!(!cycle.red_observed);
    }

    #[test]
    fn test_green_exit_rejected_while_failures_remain() {
        let mut cycle = cycle_in(TddPhase::GreenCode, true);
        let evidence = PhaseEvidence {
            selector_report: Some(TestReport { failures: 1, passes: 1 }),
            ..PhaseEvidence::default()
        };
        let out = apply_step(&mut cycle, &TddStep::Advance, &evidence, MAX).unwrap();
        assert!(matches!(out, StepOutcome::Held { phase: TddPhaseKind::GreenCode, .. }));
        assert_eq!(cycle.phase, TddPhase::GreenCode);
    }

    #[test]
    fn test_green_exit_without_observed_red_is_invariant_violation() {
        let mut cycle = cycle_in(TddPhase::GreenCode, false);
        let err = apply_step(&mut cycle, &TddStep::Advance, &green_evidence(), MAX).unwrap_err();
        assert!(matches!(err, EngineError::InternalInvariantViolated { .. }));
    }

    #[test]
    fn test_retry_ceiling_parks_cycle() {
        let mut cycle = cycle_in(TddPhase::GreenCode, true);
        let failing = PhaseEvidence {
            selector_report: Some(TestReport { failures: 1, passes: 0 }),
            ..PhaseEvidence::default()
        };

        let out1 = apply_step(&mut cycle, &TddStep::Advance, &failing, MAX).unwrap();
        assert!(matches!(out1, StepOutcome::Held { attempt: 1, .. }));
        let out2 = apply_step(&mut cycle, &TddStep::Advance, &failing, MAX).unwrap();
        assert!(matches!(out2, StepOutcome::Held { attempt: 2, .. }));
        let out3 = apply_step(&mut cycle, &TddStep::Advance, &failing, MAX).unwrap();
        assert_eq!(out3, StepOutcome::Parked { phase: TddPhaseKind::GreenCode });

        match &cycle.phase {
            TddPhase::Paused { prev, reason } => {
                assert_eq!(**prev, TddPhase::GreenCode);
                assert_eq!(*reason, PauseReason::MaxAttemptsExceeded);
            }
            other => panic!("expected paused cycle, got {other:?}"),
        }
        assert_eq!(cycle.attempts.green_code, 3);
    }

    #[test]
    fn test_agent_failure_counts_toward_budget() {
        let mut cycle = cycle_in(TddPhase::Design, false);
        let step = TddStep::RecordFailure { detail: "agent timed out".to_string() };
        apply_step(&mut cycle, &step, &PhaseEvidence::default(), MAX).unwrap();
        apply_step(&mut cycle, &step, &PhaseEvidence::default(), MAX).unwrap();
        let out = apply_step(&mut cycle, &step, &PhaseEvidence::default(), MAX).unwrap();
        assert_eq!(out, StepOutcome::Parked { phase: TddPhaseKind::Design });
        assert_eq!(cycle.last_failure.as_deref(), Some("agent timed out"));
    }

    #[test]
    fn test_pause_resume_roundtrip() {
        let mut cycle = cycle_in(TddPhase::Refactor, true);
        apply_step(
            &mut cycle,
            &TddStep::Pause { reason: PauseReason::Requested },
            &PhaseEvidence::default(),
            MAX,
        )
        .unwrap();
        assert_eq!(cycle.phase.kind(), TddPhaseKind::Paused);
        assert!(cycle.paused_at.is_some());

        apply_step(&mut cycle, &TddStep::Resume, &PhaseEvidence::default(), MAX).unwrap();
        assert_eq!(cycle.phase, TddPhase::Refactor);
        assert!(cycle.paused_at.is_none());
    }

    #[test]
    fn test_resume_requires_paused() {
        let mut cycle = cycle_in(TddPhase::GreenCode, true);
        let err =
            apply_step(&mut cycle, &TddStep::Resume, &PhaseEvidence::default(), MAX).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_regression_resets_refactor_counter_only() {
        let mut cycle = cycle_in(TddPhase::Refactor, true);
        cycle.attempts.green_code = 2;
        cycle.attempts.refactor = 2;

        let evidence = PhaseEvidence {
            selector_report: Some(TestReport { failures: 1, passes: 1 }),
            ..PhaseEvidence::default()
        };
        let out = apply_step(&mut cycle, &TddStep::Regress, &evidence, MAX).unwrap();
        assert_eq!(
            out,
            StepOutcome::Transitioned { from: TddPhaseKind::Refactor, to: TddPhaseKind::GreenCode }
        );
        assert_eq!(cycle.attempts.refactor, 0);
        assert_eq!(cycle.attempts.green_code, 2);
    }

    #[test]
    fn test_regress_requires_failing_run() {
        let mut cycle = cycle_in(TddPhase::Refactor, true);
        let err = apply_step(&mut cycle, &TddStep::Regress, &green_evidence(), MAX).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[test]
    fn test_new_tests_require_explicit_red_reentry() {
        let mut cycle = cycle_in(TddPhase::GreenCode, true);
        apply_step(&mut cycle, &TddStep::ReenterRedTests, &PhaseEvidence::default(), MAX).unwrap();
        assert_eq!(cycle.phase, TddPhase::RedTests);
        assert!(!cycle.red_observed);

        // Not available from Design.
        let mut fresh = TddCycle::new(StoryId::new());
        let err =
            apply_step(&mut fresh, &TddStep::ReenterRedTests, &PhaseEvidence::default(), MAX)
                .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_commit_is_atomic() {
        let mut cycle = cycle_in(TddPhase::Refactor, true);
        let mut evidence = commit_evidence();
        evidence.commit_applied = false;
        let out = apply_step(&mut cycle, &TddStep::Advance, &evidence, MAX).unwrap();
        assert!(matches!(out, StepOutcome::Held { .. }));
        assert_eq!(cycle.phase, TddPhase::Refactor);

        evidence.commit_applied = true;
        apply_step(&mut cycle, &TddStep::Advance, &evidence, MAX).unwrap();
        assert_eq!(cycle.phase, TddPhase::Commit);
    }

    #[test]
    fn test_terminal_phases_reject_everything() {
        for phase in [TddPhase::Commit, TddPhase::Aborted { reason: AbortReason::Requested }] {
            let mut cycle = cycle_in(phase, true);
            for step in [
                TddStep::Advance,
                TddStep::Pause { reason: PauseReason::Requested },
                TddStep::Resume,
                TddStep::Abort { reason: AbortReason::Requested },
            ] {
                let err = apply_step(&mut cycle, &step, &PhaseEvidence::default(), MAX).unwrap_err();
                assert!(matches!(err, EngineError::InvalidTransition { .. }));
            }
        }
    }

    #[test]
    fn test_abort_from_paused() {
        let mut cycle = cycle_in(
            TddPhase::Paused {
                prev: Box::new(TddPhase::GreenCode),
                reason: PauseReason::MaxAttemptsExceeded,
            },
            true,
        );
        apply_step(
            &mut cycle,
            &TddStep::Abort { reason: AbortReason::Skipped },
            &PhaseEvidence::default(),
            MAX,
        )
        .unwrap();
        assert_eq!(cycle.phase, TddPhase::Aborted { reason: AbortReason::Skipped });
    }
}
