//! Out-of-process agent executor.
//!
//! Runs a configured command per invocation, passing the briefing on stdin
//! and reading produced artifact paths from stdout, one per line. Spawn
//! failures retry with exponential backoff inside the invocation deadline;
//! the deadline itself is enforced by the orchestrator.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::cycle::TddPhaseKind;
use crate::domain::ports::agent_executor::{AgentExecutor, AgentInvocation, AgentOutcome};

/// Configuration of the process-backed executor.
#[derive(Debug, Clone)]
pub struct ProcessAgentConfig {
    /// Program to run, e.g. an agent CLI wrapper script.
    pub program: PathBuf,
    /// Fixed arguments prepended before the per-invocation ones.
    pub args: Vec<String>,
    /// Maximum spawn retries on transient launch failures.
    pub max_spawn_retries: u32,
}

impl Default for ProcessAgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("agent-runner"),
            args: Vec::new(),
            max_spawn_retries: 3,
        }
    }
}

/// Executor that shells out to an agent runner process.
pub struct ProcessAgentExecutor {
    config: ProcessAgentConfig,
}

impl ProcessAgentExecutor {
    pub fn new(config: ProcessAgentConfig) -> Self {
        Self { config }
    }

    async fn spawn_once(&self, invocation: &AgentInvocation) -> EngineResult<AgentOutcome> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg("--project")
            .arg(invocation.project_id.to_string())
            .arg("--cycle")
            .arg(invocation.cycle_id.to_string())
            .arg("--phase")
            .arg(invocation.phase.as_str())
            .arg("--attempt")
            .arg(invocation.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| EngineError::AgentFailure {
            cycle: invocation.cycle_id,
            phase: invocation.phase.as_str().to_string(),
            detail: format!("spawn failed: {e}"),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(invocation.briefing.as_bytes())
                .await
                .map_err(|e| EngineError::AgentFailure {
                    cycle: invocation.cycle_id,
                    phase: invocation.phase.as_str().to_string(),
                    detail: format!("briefing write failed: {e}"),
                })?;
        }

        let output = child.wait_with_output().await.map_err(|e| EngineError::AgentFailure {
            cycle: invocation.cycle_id,
            phase: invocation.phase.as_str().to_string(),
            detail: format!("wait failed: {e}"),
        })?;

        if !output.status.success() {
            return Err(EngineError::AgentFailure {
                cycle: invocation.cycle_id,
                phase: invocation.phase.as_str().to_string(),
                detail: format!(
                    "agent exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(parse_outcome(invocation.phase, &String::from_utf8_lossy(&output.stdout)))
    }
}

/// Artifact lines: `design: <ref>`, `test: <path>`, `src: <path>`,
/// `committed`. Anything else becomes the summary.
fn parse_outcome(phase: TddPhaseKind, stdout: &str) -> AgentOutcome {
    let mut outcome = AgentOutcome::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("design:") {
            outcome.design_artifact = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("test:") {
            outcome.test_files.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("src:") {
            outcome.source_files.push(rest.trim().to_string());
        } else if line == "committed" {
            outcome.commit_applied = true;
        } else if !line.is_empty() && outcome.summary.is_empty() {
            outcome.summary = line.to_string();
        }
    }
    if outcome.summary.is_empty() {
        outcome.summary = format!("{} completed", phase.as_str());
    }
    outcome
}

#[async_trait]
impl AgentExecutor for ProcessAgentExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn invoke(&self, invocation: AgentInvocation) -> EngineResult<AgentOutcome> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(std::time::Duration::from_millis(200))
            .with_max_interval(std::time::Duration::from_secs(5))
            .with_max_elapsed_time(Some(invocation.deadline))
            .build();

        let retries = std::sync::atomic::AtomicU32::new(0);
        backoff::future::retry(backoff, || async {
            match self.spawn_once(&invocation).await {
                Ok(outcome) => Ok(outcome),
                Err(e)
                    if e.is_transient()
                        && retries.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                            < self.config.max_spawn_retries =>
                {
                    tracing::debug!(error = %e, "agent spawn retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outcome_lines() {
        let stdout = "design: docs/design/s1.md\ntest: tests/s1_test.rs\nsrc: src/s1.rs\ncommitted\nall done\n";
        let outcome = parse_outcome(TddPhaseKind::Refactor, stdout);
        assert_eq!(outcome.design_artifact.as_deref(), Some("docs/design/s1.md"));
        assert_eq!(outcome.test_files, vec!["tests/s1_test.rs"]);
        assert_eq!(outcome.source_files, vec!["src/s1.rs"]);
        assert!(outcome.commit_applied);
        assert_eq!(outcome.summary, "all done");
    }

    #[test]
    fn test_parse_outcome_default_summary() {
        let outcome = parse_outcome(TddPhaseKind::Design, "design: d.md\n");
        assert_eq!(outcome.summary, "Design completed");
    }
}
