mod cli;
mod cluster;
mod config;
mod error;
mod jobs;
mod lock;
mod manifests;
mod nodes;
mod resources;
mod sequencer;
mod state_machine;
mod ui;
mod version;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Command};
use cluster::live::KubeControlPlane;
use config::EdgectlConfig;
use lock::LockManager;
use sequencer::{StopSignal, TransitionRequest, TransitionSequencer};
use ui::TransitionProgress;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "edgectl=debug" } else { "edgectl=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded; `Err` is reserved for setup failures.
async fn execute(cli: Cli) -> anyhow::Result<bool> {
    let mut config = EdgectlConfig::load(cli.config.as_deref())?;
    if let Some(image) = cli.servant_image {
        config.servant_image = image;
        config.validate()?;
    }

    let client = KubeControlPlane::connect(cli.context.as_deref(), config.job_ttl_secs)
        .await
        .context("failed to connect to the cluster")?;

    let sequencer = TransitionSequencer::new(
        Arc::new(client),
        &config,
        LockManager::holder_identity(),
    )?
    .skip_version_check(cli.skip_version_check);

    let request = match cli.command {
        Command::Status => {
            ui::print_status(&sequencer.status().await?);
            return Ok(true);
        }
        Command::Convert(args) => TransitionRequest::Convert {
            selection: args.selection()?,
            autonomous: args.autonomous,
        },
        Command::Revert => TransitionRequest::Revert,
    };

    if cli.dry_run {
        ui::print_plan(&sequencer.plan(&request).await?);
        return Ok(true);
    }

    let (stop_tx, stop) = StopSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            let _ = stop_tx.send(true);
        }
    });

    let progress = TransitionProgress::start(request.direction());
    let bar = progress.bar();
    let direction = request.direction();
    let sequencer =
        sequencer.with_observer(move |state| bar.set_message(format!("{direction}: {state}")));

    let outcome = sequencer.run(&request, &stop).await;
    progress.complete(&outcome.report);
    if cli.verbose {
        progress.print_report(&outcome.report);
    }
    info!(run = %outcome.report.run_id, succeeded = outcome.report.succeeded, "run finished");
    Ok(outcome.result.is_ok())
}
