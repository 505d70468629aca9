//! convoyd — the Convoy host daemon.
//!
//! Runs on every container host. In agent mode it keeps the apps assigned
//! to the host's pool running at their deployed versions, registers them
//! for routing and reaps the containers they replace.
//!
//! # Usage
//!
//! ```text
//! convoyd agent --registry redis://10.0.0.2:6379 --env prod --pool web --host-ip 10.0.0.7
//! ```

mod agent;
mod config;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{AgentArgs, AgentConfig};

#[derive(Parser)]
#[command(name = "convoyd", about = "Convoy host daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the host agent: converge, register and reap for one pool.
    Agent(AgentArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,convoyd=debug,convoy_registry=debug,convoy_runtime=debug")
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Agent(args) => {
            let config = AgentConfig::load(&args)?;
            agent::run_agent(config).await
        }
    }
}
