//! Scriptable agent executor for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::cycle::TddPhaseKind;
use crate::domain::ports::agent_executor::{AgentExecutor, AgentInvocation, AgentOutcome};

/// What the mock should do for a given phase.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Produce the phase's canonical artifacts.
    Succeed,
    /// Report an agent failure with this detail.
    Fail(String),
    /// Sleep past any deadline.
    Hang,
}

/// Agent executor with per-phase scripted behaviour.
///
/// Defaults to `Succeed` for every phase; tests override individual phases
/// to exercise the retry policy.
pub struct MockAgentExecutor {
    script: Mutex<HashMap<TddPhaseKind, ScriptedOutcome>>,
    invocations: Mutex<Vec<AgentInvocation>>,
}

impl MockAgentExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    /// Override the behaviour for one phase.
    pub async fn script_phase(&self, phase: TddPhaseKind, outcome: ScriptedOutcome) {
        self.script.lock().await.insert(phase, outcome);
    }

    /// Every invocation the executor has seen, in order.
    pub async fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().await.clone()
    }

    /// Invocations for one phase.
    pub async fn invocation_count(&self, phase: TddPhaseKind) -> usize {
        self.invocations.lock().await.iter().filter(|i| i.phase == phase).count()
    }
}

#[async_trait]
impl AgentExecutor for MockAgentExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn invoke(&self, invocation: AgentInvocation) -> EngineResult<AgentOutcome> {
        self.invocations.lock().await.push(invocation.clone());
        let outcome = self
            .script
            .lock()
            .await
            .get(&invocation.phase)
            .cloned()
            .unwrap_or(ScriptedOutcome::Succeed);

        match outcome {
            ScriptedOutcome::Succeed => Ok(canonical_outcome(&invocation)),
            ScriptedOutcome::Fail(detail) => Err(EngineError::AgentFailure {
                cycle: invocation.cycle_id,
                phase: invocation.phase.as_str().to_string(),
                detail,
            }),
            ScriptedOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(AgentOutcome::default())
            }
        }
    }
}

fn canonical_outcome(invocation: &AgentInvocation) -> AgentOutcome {
    let story = invocation.story_id;
    match invocation.phase {
        TddPhaseKind::Design => AgentOutcome {
            design_artifact: Some(format!("design/{story}.md")),
            summary: "design written".to_string(),
            ..AgentOutcome::default()
        },
        TddPhaseKind::RedTests => AgentOutcome {
            test_files: vec![format!("tests/story_{story}_test.rs")],
            summary: "failing tests written".to_string(),
            ..AgentOutcome::default()
        },
        TddPhaseKind::GreenCode => AgentOutcome {
            source_files: vec![format!("src/story_{story}.rs")],
            summary: "implementation written".to_string(),
            ..AgentOutcome::default()
        },
        TddPhaseKind::Refactor => AgentOutcome {
            source_files: vec![format!("src/story_{story}.rs")],
            commit_applied: true,
            summary: "refactored and committed".to_string(),
            ..AgentOutcome::default()
        },
        _ => AgentOutcome::default(),
    }
}
