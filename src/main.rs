use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(version, about = "Execution engine for multi-phase agent cascades")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to cascade.toml. Defaults to ./cascade.toml, then the user config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the dependency graph and execution waves of a cascade file
    Plan {
        /// Cascade definition (.json, .yaml or .yml)
        file: PathBuf,
    },
    /// Check a cascade file for structural errors
    Validate {
        /// Cascade definition (.json, .yaml or .yml)
        file: PathBuf,
    },
    /// View or validate engine configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default cascade.toml in the current directory
    Init,
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "cascade=debug" } else { "cascade=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match &cli.command {
        Commands::Plan { file } => cmd::cmd_plan(&cli, file)?,
        Commands::Validate { file } => cmd::cmd_validate(&cli, file)?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
