//! Operator command-line surface.
//!
//! A thin shell over the global orchestrator: `start` runs the daemon,
//! `inspect` renders the persisted engine state, `discover` scans roots
//! for project candidates, `check-config` validates a config file. The
//! chat and web front-ends live outside this crate.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::domain::models::config::EngineConfig;
use crate::infrastructure::persistence::FileStateStore;
use crate::services::registry::ProjectRegistry;

/// Multi-project orchestrator for AI-assisted development.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
pub struct Cli {
    /// Path to a config file (defaults to hierarchical .foreman/ loading).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator daemon until interrupted.
    Start,
    /// Render the persisted engine state as a table.
    Inspect,
    /// Scan roots for project-shaped directories.
    Discover {
        /// Directories to scan.
        roots: Vec<PathBuf>,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        /// File to validate.
        path: PathBuf,
    },
}

/// Render the persisted registry, quotas and snapshots without touching a
/// running daemon.
pub async fn handle_inspect(config: &EngineConfig) -> Result<()> {
    let root = config.global_root.clone().unwrap_or_else(|| PathBuf::from("."));
    let store = std::sync::Arc::new(FileStateStore::with_defaults(&root));
    let registry = ProjectRegistry::new(store.clone());
    let count = registry.load().await?;

    use crate::domain::ports::StateStore;
    let scheduler_doc = store.load_scheduler().await?.unwrap_or_default();
    let quotas: std::collections::HashMap<_, _> = scheduler_doc
        .last_allocation
        .iter()
        .map(|quota| (quota.project_id, quota))
        .collect();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "project",
        "name",
        "status",
        "priority",
        "workflow",
        "live cycles",
        "cpu share",
        "agents",
    ]);

    for project in registry.list().await {
        let snapshot = store.load_project(&project.path).await.ok().flatten();
        let (workflow, live) = snapshot
            .map(|state| {
                (state.workflow.kind().as_str().to_string(), state.live_cycles().len())
            })
            .unwrap_or_else(|| ("-".to_string(), 0));
        let (cpu, agents) = quotas
            .get(&project.id)
            .map(|quota| {
                (format!("{:.2}", quota.allocated_cpu_share), quota.allocated_agents.to_string())
            })
            .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
        table.add_row(vec![
            project.id.to_string(),
            project.name.clone(),
            project.status.as_str().to_string(),
            project.priority.as_str().to_string(),
            workflow,
            live.to_string(),
            cpu,
            agents,
        ]);
    }

    println!("{count} registered project(s), strategy {}", scheduler_doc.strategy.as_str());
    println!("{table}");
    Ok(())
}

/// Scan the given roots and print candidates.
pub async fn handle_discover(roots: &[PathBuf]) -> Result<()> {
    let candidates = ProjectRegistry::scan_roots(roots).await?;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["path", "name", "has state"]);
    for candidate in &candidates {
        table.add_row(vec![
            candidate.path.display().to_string(),
            candidate.name.clone(),
            candidate.has_state.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
