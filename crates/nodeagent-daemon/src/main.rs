//! Node agent daemon.
//!
//! Runs the agent: binds the dataplane and ingress sockets, reconciles the
//! initial workload set and serves until interrupted. `nodeagent ctl ...`
//! talks to a running agent instead.

mod cli;
mod ctl;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use nodeagent::{AgentConfig, InMemoryPlatform, IngressServer, MeshDataplane, Telemetry};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    config.validate()?;

    let platform = match &config.initial_workloads {
        Some(path) => InMemoryPlatform::from_file(path)
            .await
            .with_context(|| format!("loading initial workloads from {}", path.display()))?,
        None => InMemoryPlatform::new(),
    };

    let telemetry = Telemetry::new();
    let agent = Arc::new(
        MeshDataplane::builder(config.clone())
            .platform(Arc::new(platform))
            .telemetry(telemetry)
            .build()
            .context("starting node agent")?,
    );

    if let Err(e) = agent.construct_initial_snapshot().await {
        warn!("initial snapshot incomplete: {}", e);
    }
    agent.start()?;
    let _ingress = IngressServer::start(&config.ingress_socket, Arc::clone(&agent)).await?;

    info!(
        dataplane = %config.dataplane_socket.display(),
        ingress = %config.ingress_socket.display(),
        "node agent running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    agent.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    match cli.command.take() {
        Some(Command::Ctl(command)) => ctl::run(&cli.ingress_socket, command).await,
        Some(Command::Run) | None => {
            init_logging(cli.debug, cli.json_logs);
            info!("Starting node agent {}", env!("CARGO_PKG_VERSION"));
            run_agent(cli.agent_config()).await
        }
    }
}
