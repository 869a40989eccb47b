//! One resumable invocation (`baton run`).

use anyhow::Result;
use chrono::{DateTime, Utc};
use console::{Term, style};
use std::path::PathBuf;
use std::sync::Arc;

use super::super::Cli;

pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    finished: bool,
    from_artifact: bool,
    job_started_at: Option<DateTime<Utc>>,
) -> Result<()> {
    use baton::archive::TarCodec;
    use baton::cancel::CancellationPolicy;
    use baton::config::Config;
    use baton::errors::InvocationError;
    use baton::exec::TimedExecutor;
    use baton::orchestrator::controller::read_version;
    use baton::orchestrator::{CompletionSignal, Controller, InvocationFlags, Stage};
    use baton::ui::RunUI;

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;

    // A finished job needs neither stage commands nor a reachable store.
    if finished {
        let version = read_version(&config.version_file())?;
        tracing::info!(%version, "Job already finished, nothing to do");
        let signal = CompletionSignal::finished();
        signal.emit(config.toml.signal.output_file.as_deref())?;
        report(&signal);
        return Ok(());
    }

    let problems = config.toml.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!(%problem, "Invalid configuration");
        }
        return Err(InvocationError::Configuration(problems.join("; ")).into());
    }

    let store = config.open_store()?;

    // Spinners only make sense on an interactive terminal.
    let ui = Term::stderr()
        .is_term()
        .then(|| Arc::new(RunUI::new(Stage::ALL.len() as u64 - 1)));

    let job = &config.toml.job;
    let mut executor = TimedExecutor::new(config.toml.stages.build.grace(), job.progress_interval());
    if let Some(ui) = &ui {
        executor = executor.with_ui(Arc::clone(ui));
    }

    let policy = CancellationPolicy::new();
    let _guard = policy.install()?;

    let output_file = config.toml.signal.output_file.clone();
    let archive_excludes = config.archive_excludes();
    let mut controller = Controller::new(
        config,
        Arc::new(executor),
        Arc::new(TarCodec::new().excluding(archive_excludes)),
        store,
    )
    .with_job_started_at(job_started_at);
    if let Some(ui) = ui {
        controller = controller.with_ui(ui);
    }

    let signal = controller
        .invoke(InvocationFlags {
            finished,
            from_artifact,
        })
        .await?;

    if policy.ignored_count() > 0 {
        tracing::warn!(count = policy.ignored_count(), "Interruption signals were ignored during the run");
    }

    signal.emit(output_file.as_deref())?;
    report(&signal);
    Ok(())
}

fn report(signal: &baton::orchestrator::CompletionSignal) {
    let status = if signal.finished {
        style("finished").green().bold()
    } else {
        style("not finished, resume with --from-artifact true").yellow()
    };
    eprintln!("Job {}", status);
}
