//! Process-backed test runner.
//!
//! Invokes the project's configured test command with the selector entries
//! as arguments and parses a small line protocol from stdout:
//! `failures: N`, `passes: N`, `coverage: F`, `complexity: N`. The mapping
//! from selectors to actual tests is entirely the harness's business.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::machines::tdd::{QualityReport, TestReport};
use crate::domain::models::cycle::TestSelector;
use crate::domain::models::ids::ProjectId;
use crate::domain::ports::test_runner::TestRunner;

/// Configuration of the command-backed runner.
#[derive(Debug, Clone)]
pub struct CommandTestRunnerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Coverage threshold handed to the quality gate report.
    pub coverage_threshold: f64,
    /// Complexity cap handed to the quality gate report.
    pub complexity_cap: u32,
}

impl Default for CommandTestRunnerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("test-runner"),
            args: Vec::new(),
            coverage_threshold: 0.8,
            complexity_cap: 15,
        }
    }
}

/// Test runner that shells out to a harness command.
pub struct CommandTestRunner {
    config: CommandTestRunnerConfig,
}

impl CommandTestRunner {
    pub fn new(config: CommandTestRunnerConfig) -> Self {
        Self { config }
    }

    async fn run(&self, extra: &[String]) -> EngineResult<String> {
        let output = Command::new(&self.config.program)
            .args(&self.config.args)
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Storage {
                path: self.config.program.clone(),
                detail: format!("test runner spawn failed: {e}"),
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_count(stdout: &str, key: &str) -> Option<u32> {
    stdout.lines().find_map(|line| {
        line.trim().strip_prefix(key).and_then(|rest| rest.trim().parse().ok())
    })
}

fn parse_float(stdout: &str, key: &str) -> Option<f64> {
    stdout.lines().find_map(|line| {
        line.trim().strip_prefix(key).and_then(|rest| rest.trim().parse().ok())
    })
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn run_selected(
        &self,
        _project_id: ProjectId,
        selector: &TestSelector,
    ) -> EngineResult<TestReport> {
        let mut args = vec!["--select".to_string()];
        args.extend(selector.entries.iter().cloned());
        let stdout = self.run(&args).await?;
        Ok(TestReport {
            failures: parse_count(&stdout, "failures:").unwrap_or(0),
            passes: parse_count(&stdout, "passes:").unwrap_or(0),
        })
    }

    async fn quality_gates(&self, _project_id: ProjectId) -> EngineResult<QualityReport> {
        let stdout = self.run(&["--quality".to_string()]).await?;
        Ok(QualityReport {
            coverage: parse_float(&stdout, "coverage:").unwrap_or(0.0),
            coverage_threshold: self.config.coverage_threshold,
            complexity: parse_count(&stdout, "complexity:").unwrap_or(u32::MAX),
            complexity_cap: self.config.complexity_cap,
        })
    }
}
