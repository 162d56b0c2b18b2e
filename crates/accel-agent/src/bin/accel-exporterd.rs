//! Main binary for the exporter agent daemon (accel-exporterd)

use accel_agent::{init_agent, AgentConfig, AgentError, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "accel-exporterd")]
#[command(about = "Accelerator telemetry exporter and health daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json), overrides the configuration file
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start {
        /// Override configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start { ref config }) => {
            let config_path = config.clone().or(cli.config.clone());
            start_agent(config_path, &cli).await
        }
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => {
            let config_path = cli.config.clone();
            start_agent(config_path, &cli).await
        }
    }
}

async fn start_agent(config_path: Option<PathBuf>, cli: &Cli) -> Result<()> {
    let mut config = match config_path {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    // Apply CLI overrides
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    let mut agent = init_agent(&config).await?;

    info!(
        "Exporting GPU telemetry for {} (NIC {})",
        config.exporter.hostname,
        if config.exporter.nic.enabled { "enabled" } else { "disabled" }
    );

    if let Err(e) = agent.run().await {
        error!("Agent failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        let yaml = serde_yaml::to_string(&config)
            .map_err(|e| AgentError::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", yaml);
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = AgentConfig::from_file(&config_path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("Agent name: {}", config.agent.name);
    println!("Hostname: {}", config.exporter.hostname);
    println!("Control plane snapshot: {}", config.control_plane.snapshot_file.display());
    println!("Poll interval: {:?}", config.poll_interval());
    println!("Devices enabled:");
    if config.exporter.gpu.enabled {
        println!("  - GPU (selector {:?})", config.exporter.gpu.selector);
    }
    if config.exporter.nic.enabled {
        println!("  - NIC");
    }
    println!("Services enabled:");
    if config.services.metrics.enabled {
        println!("  - Metrics: {}", config.services.metrics.bind_addr);
    }
    if config.services.health.enabled {
        println!("  - Health query: {}", config.services.health.bind_addr);
    }

    Ok(())
}
