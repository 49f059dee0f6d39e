//! NPSA batch runner CLI
//!
//! # Usage
//!
//! ```bash
//! # Start a run for every county of a state (stays in the foreground)
//! npsa-runner --config runner.yaml run --domain ohio
//!
//! # Continue a cancelled or failed run from its checkpoint
//! npsa-runner --config runner.yaml resume --run-id 3f2a9c1e-0b7d-4e55-8a61-2d9f0c4b7e10
//!
//! # History
//! npsa-runner list --all
//! npsa-runner --json status --run-id <id>
//! ```

use clap::{Parser, Subcommand};
use npsa_orchestration::{RunId, RunOrchestrator, RunSnapshot, RunStatus, RunnerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PROGRESS_EVERY: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "npsa-runner")]
#[command(about = "Batch run orchestrator for per-county lead extraction", long_about = None)]
struct Cli {
    /// Runner configuration (YAML, `version: 1`)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run and follow it until it stops
    Run {
        /// Domain (state) whose units are processed
        #[arg(short, long)]
        domain: String,
    },

    /// Resume a run from its checkpoint and follow it
    Resume {
        #[arg(short, long)]
        run_id: String,
    },

    /// Show the status of a run
    Status {
        #[arg(short, long)]
        run_id: String,
    },

    /// List runs, newest first
    List {
        /// Include soft-deleted runs
        #[arg(long)]
        all: bool,
    },

    /// Soft-delete a run (history is kept)
    Delete {
        #[arg(short, long)]
        run_id: String,
    },

    /// Mark a run as archived
    Archive {
        #[arg(short, long)]
        run_id: String,

        /// Clear the archived flag instead
        #[arg(long)]
        unset: bool,
    },

    /// Print the path of a run's final artifact
    Artifact {
        #[arg(short, long)]
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = RunnerConfig::load(cli.config.as_deref())?;
    let orchestrator = RunOrchestrator::from_config(&config)?;
    let json = cli.json;

    match cli.command {
        Commands::Run { domain } => {
            let run_id = orchestrator.start_run(&domain).await?;
            println!("Started run {}", run_id);
            follow(&orchestrator, &run_id, json).await
        }
        Commands::Resume { run_id } => {
            let run_id = RunId::parse(run_id)?;
            orchestrator.resume_run(&run_id).await?;
            println!("Resumed run {}", run_id);
            follow(&orchestrator, &run_id, json).await
        }
        Commands::Status { run_id } => {
            let snapshot = orchestrator.status(&RunId::parse(run_id)?).await?;
            print_snapshot(&snapshot, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List { all } => {
            let runs = orchestrator.list_runs(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs");
            } else {
                for run in &runs {
                    println!("{}", list_line(run));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { run_id } => {
            let run_id = RunId::parse(run_id)?;
            orchestrator.delete_run(&run_id).await?;
            println!("Deleted run {}", run_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Archive { run_id, unset } => {
            let run_id = RunId::parse(run_id)?;
            orchestrator.archive_run(&run_id, !unset).await?;
            println!(
                "Run {} {}",
                run_id,
                if unset { "unarchived" } else { "archived" }
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Artifact { run_id } => {
            let path = orchestrator.final_artifact(&RunId::parse(run_id)?).await?;
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Stay with a run until its controller stops; Ctrl-C requests cancellation.
async fn follow(
    orchestrator: &RunOrchestrator,
    run_id: &RunId,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut progress = tokio::time::interval(PROGRESS_EVERY);
    progress.tick().await;
    let mut cancel_sent = false;

    let status = loop {
        tokio::select! {
            status = orchestrator.wait(run_id) => break status?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if cancel_sent {
                    warn!("Interrupted again, exiting; resume run {} to continue", run_id);
                    return Ok(ExitCode::from(130));
                }
                cancel_sent = true;
                match orchestrator.cancel_run(run_id) {
                    Ok(()) => info!("Cancellation requested, waiting for running units to finish"),
                    Err(e) => warn!("Cannot cancel run {}: {}", run_id, e),
                }
            }
            _ = progress.tick() => {
                let snapshot = orchestrator.status(run_id).await?;
                println!("{}", progress_line(&snapshot));
            }
        }
    };

    print_snapshot(&orchestrator.status(run_id).await?, json)?;
    Ok(match status {
        RunStatus::Completed | RunStatus::Finalizing => ExitCode::SUCCESS,
        RunStatus::Cancelled => ExitCode::from(130),
        RunStatus::Running | RunStatus::Error => ExitCode::FAILURE,
    })
}

fn print_snapshot(snapshot: &RunSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!("Run:        {}", snapshot.run_id);
    println!("Domain:     {}", snapshot.domain);
    println!("Status:     {}", snapshot.status);
    println!(
        "Units:      {}/{} ({:.1}%), {} failed",
        snapshot.units_processed,
        snapshot.total_units,
        snapshot.progress_percent,
        snapshot.failed_units
    );
    println!(
        "Records:    {} ({} with email, {} without)",
        snapshot.records_found, snapshot.records_with_channel, snapshot.records_without_channel
    );
    if let Some(path) = &snapshot.final_artifact_path {
        println!("Artifact:   {}", path.display());
    }
    if let Some(error) = &snapshot.error {
        println!("Error:      {}", error);
    }
    Ok(())
}

fn progress_line(snapshot: &RunSnapshot) -> String {
    let eta = snapshot.eta_secs;
    format!(
        "[{}] {}/{} units ({:.1}%) | {} records | {} | ETA {}h{:02}m",
        snapshot.status,
        snapshot.units_processed,
        snapshot.total_units,
        snapshot.progress_percent,
        snapshot.records_found,
        snapshot.message,
        eta / 3600,
        (eta % 3600) / 60
    )
}

fn list_line(snapshot: &RunSnapshot) -> String {
    let mut flags = Vec::new();
    if snapshot.archived {
        flags.push("archived");
    }
    if snapshot.deleted {
        flags.push("deleted");
    }
    format!(
        "{}  {:<12} {:<10} {:>4}/{:<4} {:>7} records  {}{}",
        snapshot.run_id,
        snapshot.domain,
        snapshot.status.as_str(),
        snapshot.units_processed,
        snapshot.total_units,
        snapshot.records_found,
        snapshot.created_at.format("%Y-%m-%d %H:%M"),
        if flags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", flags.join(", "))
        }
    )
}
