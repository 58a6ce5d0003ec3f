//! Foreman daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use foreman::adapters::{
    CommandTestRunner, CommandTestRunnerConfig, ProcessAgentConfig, ProcessAgentExecutor,
};
use foreman::cli::{handle_discover, handle_inspect, Cli, Commands};
use foreman::infrastructure::config::ConfigLoader;
use foreman::infrastructure::logging;
use foreman::infrastructure::persistence::FileStateStore;
use foreman::services::GlobalOrchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config validation runs before logging so errors stay on stderr.
    if let Commands::CheckConfig { path } = &cli.command {
        let config = ConfigLoader::load_from_file(path)?;
        println!("config ok: {} strategy, {} global agents", config.scheduler.strategy.as_str(), config.resources.max_agents);
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load().context("Failed to load configuration")?,
    };
    let _logging = logging::init(&config.logging)?;

    match cli.command {
        Commands::Start => {
            let root = config.global_root.clone().unwrap_or_else(|| PathBuf::from("."));
            let store = Arc::new(FileStateStore::new(
                &root,
                foreman::infrastructure::persistence::FileStoreConfig {
                    events_log_max_bytes: config.events.events_log_max_bytes,
                },
            ));
            let agents = Arc::new(ProcessAgentExecutor::new(ProcessAgentConfig {
                program: config.runners.agent_program.clone(),
                args: config.runners.agent_args.clone(),
                ..ProcessAgentConfig::default()
            }));
            let tests = Arc::new(CommandTestRunner::new(CommandTestRunnerConfig {
                program: config.runners.test_program.clone(),
                args: config.runners.test_args.clone(),
                coverage_threshold: config.runners.coverage_threshold,
                complexity_cap: config.runners.complexity_cap,
            }));

            let orchestrator = GlobalOrchestrator::new(config, store, agents, tests);
            orchestrator.start().await.context("engine startup failed")?;
            tracing::info!("foreman running; ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("signal handler failed")?;
            tracing::info!("shutdown requested");
            orchestrator.shutdown().await;
        }
        Commands::Inspect => {
            handle_inspect(&config).await?;
        }
        Commands::Discover { roots } => {
            handle_discover(&roots).await?;
        }
        Commands::CheckConfig { .. } => unreachable!("handled above"),
    }
    Ok(())
}
