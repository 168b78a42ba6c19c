//! Berth - a minimal multi-service container orchestrator
//!
//! This is the main CLI entry point for Berth.

use berth::error::{BerthError, Result};
use berth::orchestrator::Orchestrator;
use berth::runtime::SimulatedDriver;
use berth::spec::SpecLoader;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Berth - minimal multi-service orchestrator
#[derive(Parser)]
#[command(name = "berth")]
#[command(version)]
#[command(about = "Bring multi-service topologies up and down", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Topology file (defaults to berth.yaml and friends in the working directory)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the topology and run until interrupted
    Up,

    /// Print the startup order without starting anything
    Plan,

    /// Validate the topology file and print the resolved services
    Config,
}

fn topology_file(cli_file: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(file) = cli_file {
        return Ok(file);
    }
    let working_dir = std::env::current_dir()?;
    SpecLoader::find_file(&working_dir)
        .ok_or_else(|| BerthError::Spec("no topology file found in working directory".to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let file = topology_file(cli.file)?;
    let topology = SpecLoader::load_file(&file)?;

    match cli.command {
        Commands::Up => {
            let driver = Arc::new(SimulatedDriver::new());
            let mut orchestrator = Orchestrator::new(topology, driver);

            let reports = orchestrator.up().await?;
            for report in &reports {
                match &report.error {
                    Some(error) => println!("{:<20} {:<10} {}", report.service, report.state, error),
                    None => println!("{:<20} {}", report.service, report.state),
                }
            }

            println!("Press Ctrl-C to stop...");
            tokio::signal::ctrl_c().await?;

            orchestrator.cancel();
            let reports = orchestrator.down().await?;
            for report in &reports {
                println!("{:<20} {}", report.service, report.state);
            }
        }
        Commands::Plan => {
            let driver = Arc::new(SimulatedDriver::new());
            let orchestrator = Orchestrator::new(topology, driver);
            for (i, service) in orchestrator.plan()?.iter().enumerate() {
                println!("{}. {}", i + 1, service);
            }
        }
        Commands::Config => {
            println!("name: {}", topology.name);
            for service in topology.services() {
                let image = service.image.as_deref().unwrap_or("(build)");
                println!("{:<20} {:<30} {}", service.name, image, service.restart);
            }
            for volume in topology.volumes() {
                println!("volume: {}", volume);
            }
        }
    }

    Ok(())
}
