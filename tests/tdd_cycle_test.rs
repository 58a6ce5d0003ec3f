//! TDD cycle behaviour through the full engine: happy cycle completion and
//! the retry ceiling.

mod common;

use common::{expect_event, Engine};
use foreman::adapters::ScriptedOutcome;
use foreman::domain::models::command::{BacklogCommand, Command, SprintCommand};
use foreman::domain::models::cycle::TddPhaseKind;
use foreman::domain::models::event::EventPayload;
use foreman::domain::models::ids::{ProjectId, StoryId};
use foreman::services::EventFilter;

/// Register a project, add + approve one story, plan and start a sprint.
async fn drive_to_sprint(engine: &Engine, name: &str) -> (ProjectId, StoryId) {
    let project = engine
        .orchestrator
        .register_project(
            name,
            engine.project_path(name),
            foreman::domain::models::project::ProjectPriority::Normal,
        )
        .await
        .unwrap();

    engine
        .submit(Command::Backlog(BacklogCommand::AddStory {
            project_id: project.id,
            description: "S1".to_string(),
            acceptance_criteria: "it works".to_string(),
            estimate: 2,
        }))
        .await;

    use foreman::domain::ports::StateStore;
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let state = engine.store.load_project(&project.path).await.unwrap().expect("snapshot");
    let story_id = *state.stories.keys().next().expect("story");

    engine
        .submit(Command::Backlog(BacklogCommand::Approve { project_id: project.id, story_id }))
        .await;
    engine
        .submit(Command::Sprint(SprintCommand::Plan {
            project_id: project.id,
            story_ids: vec![story_id],
        }))
        .await;
    engine.submit(Command::Sprint(SprintCommand::Start { project_id: project.id })).await;
    (project.id, story_id)
}

#[tokio::test]
async fn test_cycle_runs_to_commit() {
    let engine = Engine::start().await;
    let mut stream = engine
        .orchestrator
        .bus()
        .subscribe(EventFilter::kinds(["TDDPhaseChanged", "CycleAdmitted"]));

    drive_to_sprint(&engine, "alpha").await;

    // The default scripts walk the whole cycle: red tests first fail,
    // then pass, quality gates pass, commit applies.
    for (from, to) in [
        ("Design", "RedTests"),
        ("RedTests", "GreenCode"),
        ("GreenCode", "Refactor"),
        ("Refactor", "Commit"),
    ] {
        expect_event(&mut stream, 10, |e| {
            matches!(&e.payload, EventPayload::TddPhaseChanged { from: f, to: t, .. }
                if f == from && t == to)
        })
        .await;
    }

    // Each phase invoked the agent exactly once.
    assert_eq!(engine.agents.invocation_count(TddPhaseKind::Design).await, 1);
    assert_eq!(engine.agents.invocation_count(TddPhaseKind::RedTests).await, 1);
    assert_eq!(engine.agents.invocation_count(TddPhaseKind::GreenCode).await, 1);
    assert_eq!(engine.agents.invocation_count(TddPhaseKind::Refactor).await, 1);
}

#[tokio::test]
async fn test_retry_ceiling_parks_cycle_for_human() {
    let engine = Engine::start().await;
    engine
        .agents
        .script_phase(
            TddPhaseKind::GreenCode,
            ScriptedOutcome::Fail("implementation does not compile".to_string()),
        )
        .await;

    let mut stream = engine
        .orchestrator
        .bus()
        .subscribe(EventFilter::kinds(["TDDPhaseChanged", "Error"]));

    drive_to_sprint(&engine, "alpha").await;

    // Design and RedTests pass; GreenCode fails three times, then parks.
    expect_event(&mut stream, 10, |e| {
        matches!(&e.payload, EventPayload::TddPhaseChanged { from, to, .. }
            if from == "RedTests" && to == "GreenCode")
    })
    .await;

    let parked = expect_event(&mut stream, 10, |e| {
        matches!(&e.payload, EventPayload::TddPhaseChanged { from, to, .. }
            if from == "GreenCode" && to == "Paused")
    })
    .await;

    let needs_human = expect_event(&mut stream, 10, |e| {
        matches!(&e.payload, EventPayload::Error { kind, .. } if kind == "NeedsHumanAttention")
    })
    .await;
    assert!(parked.seq < needs_human.seq);

    // Exactly three attempts were made, and Refactor never ran.
    assert_eq!(engine.agents.invocation_count(TddPhaseKind::GreenCode).await, 3);
    assert_eq!(engine.agents.invocation_count(TddPhaseKind::Refactor).await, 0);
}

#[tokio::test]
async fn test_agent_timeout_counts_as_attempt() {
    let engine = Engine::start().await;
    engine.agents.script_phase(TddPhaseKind::Design, ScriptedOutcome::Hang).await;

    let mut stream =
        engine.orchestrator.bus().subscribe(EventFilter::kinds(["Error", "TDDPhaseChanged"]));

    drive_to_sprint(&engine, "alpha").await;

    // Deadline is 2s in the fast config; the timeout surfaces as an error
    // event and counts toward the Design retry budget.
    let timeout = expect_event(&mut stream, 15, |e| {
        matches!(&e.payload, EventPayload::Error { kind, .. } if kind == "AgentTimeout")
    })
    .await;
    assert!(timeout.payload.project_id().is_some());
}
