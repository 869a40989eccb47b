//! Persisted-state inspection commands (`baton status`, `baton reset`, `baton budget`).

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::Path;

use super::super::Cli;

pub fn cmd_status(cli: &Cli, project_dir: &Path) -> Result<()> {
    use baton::config::Config;
    use baton::orchestrator::StageMarker;
    use baton::orchestrator::controller::read_version;

    let config = Config::new(project_dir.to_path_buf(), cli.config.clone(), cli.verbose)?;
    let toml = &config.toml;

    println!();
    println!("Baton Status");
    println!("============");
    println!();

    let version = match read_version(&config.version_file()) {
        Ok(version) => version,
        Err(e) => format!("unavailable ({})", e),
    };
    println!("Version:    {}", version);

    let marker = StageMarker::new(config.marker_file.clone());
    let stage = match marker.read() {
        Ok(Some(stage)) => stage.to_string(),
        Ok(None) => "none (next run starts at init)".to_string(),
        Err(e) => format!("corrupt ({:#})", e),
    };
    println!("Stage:      {}", stage);
    println!("Marker:     {}", config.marker_file.display());
    println!("Work dir:   {}", config.work_dir().display());
    println!("Output:     {}", config.package_output().display());
    println!();

    println!("Store:      {}", toml.transport.backend);
    if let Some(dir) = &toml.transport.dir {
        println!("  dir = {}", dir.display());
    }
    if let Some(url) = &toml.transport.url {
        println!("  url = {}", url);
    }
    println!("Checkpoint: {}", toml.checkpoint.name);
    if let Ok(version) = read_version(&config.version_file()) {
        println!("Artifact:   {}", toml.artifact.name_for(&version));
    } else {
        println!("Artifact:   {}", toml.artifact.name);
    }
    println!();

    Ok(())
}

pub fn cmd_reset(cli: &Cli, project_dir: &Path, force: bool) -> Result<()> {
    use baton::config::Config;
    use baton::orchestrator::StageMarker;
    use dialoguer::Confirm;

    let config = Config::new(project_dir.to_path_buf(), cli.config.clone(), cli.verbose)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will discard the persisted stage. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    StageMarker::new(config.marker_file.clone()).reset()?;

    if config.tmp_dir.exists() {
        std::fs::remove_dir_all(&config.tmp_dir).ok();
    }

    println!("Reset complete");
    Ok(())
}

pub fn cmd_budget(
    cli: &Cli,
    project_dir: &Path,
    job_started_at: Option<DateTime<Utc>>,
) -> Result<()> {
    use baton::budget::BudgetLimits;
    use baton::config::Config;
    use baton::ui::format_duration;

    let config = Config::new(project_dir.to_path_buf(), cli.config.clone(), cli.verbose)?;
    let limits = BudgetLimits::new(config.toml.job.ceiling(), config.toml.job.floor());

    let elapsed = job_started_at
        .and_then(|start| (Utc::now() - start).to_std().ok())
        .unwrap_or_default();
    let remaining = limits.remaining(elapsed);

    println!("{}", remaining.as_secs());
    eprintln!(
        "Build budget: {} ({} elapsed of {} window)",
        format_duration(remaining),
        format_duration(elapsed),
        format_duration(config.toml.job.ceiling())
    );
    Ok(())
}
