//! Test runner port - interface to the external test harness.
//!
//! The engine scopes every run to a cycle's selector set. How selectors map
//! to test files is the runner's business; the engine treats them as opaque.

use async_trait::async_trait;

use crate::domain::errors::EngineResult;
use crate::domain::machines::tdd::{QualityReport, TestReport};
use crate::domain::models::cycle::TestSelector;
use crate::domain::models::ids::ProjectId;

/// Interface to a project's test harness.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Runner name for logs.
    fn name(&self) -> &'static str;

    /// Run exactly the selector set and report failures/passes within it.
    async fn run_selected(
        &self,
        project_id: ProjectId,
        selector: &TestSelector,
    ) -> EngineResult<TestReport>;

    /// Evaluate the declared quality gates over the project.
    async fn quality_gates(&self, project_id: ProjectId) -> EngineResult<QualityReport>;
}
