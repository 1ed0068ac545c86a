//! Configuration view and validation commands: `cascade config`.

use anyhow::{Context, Result, bail};
use cascade::config::{CONFIG_FILE, EngineConfig};
use console::style;
use std::path::{Path, PathBuf};

use super::super::{Cli, ConfigCommands};

/// Where the effective configuration comes from: `--config`, then
/// `./cascade.toml`, then `<user config dir>/cascade/cascade.toml`.
pub fn resolve_config(cli: &Cli) -> Result<(Option<PathBuf>, EngineConfig)> {
    let path = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            Some(path.clone())
        }
        None => candidate_paths().into_iter().find(|p| p.exists()),
    };
    let config = match &path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    Ok((path, config.with_env()?))
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("cascade").join(CONFIG_FILE));
    }
    paths
}

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let (path, config) = resolve_config(cli)?;
            println!();
            println!("{}", style("Cascade Configuration").bold().cyan());
            println!();
            match &path {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No {} found, using defaults", CONFIG_FILE),
            }
            println!();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let (path, config) = resolve_config(cli)?;
            println!();
            println!("Validating configuration...");
            if path.is_none() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }
            let warnings = config.validate()?;
            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => init_config(Path::new(CONFIG_FILE))?,
    }
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    EngineConfig::default().save(path)?;
    println!("Created {}", path.display());
    Ok(())
}
