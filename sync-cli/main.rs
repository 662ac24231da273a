mod args;
mod render;

use anyhow::{Context, Result};
use args::{Cli, Command, FetchCommand, GlobalArgs, RunCommand};
use clap::Parser;
use report_sheet_sync::config::{load_config, resolve_config_path, Config};
use report_sheet_sync::table::write_csv;
use report_sheet_sync::{SyncError, SyncJob, WriteMode};
use std::fs;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LEARNERS_FILE: &str = "learner_profiles.csv";
const PROBLEMS_FILE: &str = "problem_responses.csv";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let as_json = cli.global.json;
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<SyncError>() {
            Some(sync_err) => {
                render::print_error(sync_err, as_json);
                ExitCode::from(sync_err.exit_code() as u8)
            }
            None => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_cli_config(&cli.global)?;
    match cli.command.unwrap_or(Command::Run(RunCommand::default())) {
        Command::Run(cmd) => handle_run(config, &cli.global, cmd).await,
        Command::Check => handle_check(config, &cli.global),
        Command::Fetch(cmd) => handle_fetch(config, cmd).await,
    }
}

fn load_cli_config(global: &GlobalArgs) -> Result<Config> {
    let path = resolve_config_path(global.config_path.as_deref());
    match load_config(&path) {
        Ok(config) => {
            init_tracing(&config.observability.log_level);
            info!("config loaded from {}", path.display());
            Ok(config)
        }
        Err(err) => {
            init_tracing("");
            Err(err.into())
        }
    }
}

fn init_tracing(log_level: &str) {
    let default_level = log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn handle_run(config: Config, global: &GlobalArgs, cmd: RunCommand) -> Result<()> {
    let job = SyncJob::prepare(config)?;
    let mode = if cmd.dry_run {
        WriteMode::DryRun
    } else {
        WriteMode::Write
    };
    let summary = job.run(mode).await?;
    render::print_summary(&summary, global.json);
    Ok(())
}

fn handle_check(config: Config, global: &GlobalArgs) -> Result<()> {
    let job = SyncJob::prepare(config)?;
    render::print_plan(job.config(), global.json);
    Ok(())
}

async fn handle_fetch(config: Config, cmd: FetchCommand) -> Result<()> {
    let job = SyncJob::prepare(config)?;
    fs::create_dir_all(&cmd.out_dir)
        .with_context(|| format!("create output dir failed: {}", cmd.out_dir.display()))?;
    let reports = job.fetch().await?;
    for (name, table) in [
        (LEARNERS_FILE, &reports.learner_profiles),
        (PROBLEMS_FILE, &reports.problem_responses),
    ] {
        let path = cmd.out_dir.join(name);
        fs::write(&path, write_csv(table)?)
            .with_context(|| format!("write {} failed", path.display()))?;
        println!("{}: {} rows", path.display(), table.len());
    }
    Ok(())
}
