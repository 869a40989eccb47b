//! Configuration view and validation commands (`baton config`).

use anyhow::{Context, Result};
use std::path::Path;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use baton::baton_config::DEFAULT_TEMPLATE;
    use baton::config::Config;

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = Config::new(project_dir.to_path_buf(), cli.config.clone(), cli.verbose)?;

            println!();
            println!("Baton Configuration");
            println!("===================");
            println!();
            if config.config_file.exists() {
                println!("Config file: {}", config.config_file.display());
            } else {
                println!("No baton.toml found at {}", config.config_file.display());
                println!("Using defaults. Run 'baton config init' to create one.");
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render effective configuration")?;
            print!("{}", rendered);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let config = Config::new(project_dir.to_path_buf(), cli.config.clone(), cli.verbose)?;

            println!();
            println!("Validating configuration...");
            println!();

            let problems = config.toml.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                println!();
                return Ok(());
            }

            println!("Configuration problems:");
            for problem in &problems {
                println!("  - {}", problem);
            }
            println!();
            anyhow::bail!("{} configuration problem(s) found", problems.len());
        }
        Some(ConfigCommands::Init) => {
            let config_path = match &cli.config {
                Some(path) => path.clone(),
                None => project_dir.join(".baton").join("baton.toml"),
            };
            if config_path.exists() {
                println!("baton.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(&config_path, DEFAULT_TEMPLATE)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created baton.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [job] ceiling_minutes, floor_minutes, version_file, work_dir");
            println!("  - [stages.*] the commands each stage runs");
            println!("  - [transport] where checkpoints and artifacts are stored");
            println!();
        }
    }

    Ok(())
}
