use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::engine::types::RunStatus;
use crate::storage::StateStore;
use crate::storage::json_store::JsonStateStore;

#[derive(Parser)]
#[command(name = "microflow", version, about = "Deterministic DAG workflow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List past workflow runs
    List {
        /// Filter by status (pending, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// State store data directory
        #[arg(long, default_value = "data", env = "MICROFLOW_DATA_DIR")]
        data_dir: PathBuf,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a specific run
    Inspect {
        /// Run ID
        run_id: String,

        /// State store data directory
        #[arg(long, default_value = "data", env = "MICROFLOW_DATA_DIR")]
        data_dir: PathBuf,
    },

    /// Delete a run record
    Delete {
        /// Run ID
        run_id: String,

        /// State store data directory
        #[arg(long, default_value = "data", env = "MICROFLOW_DATA_DIR")]
        data_dir: PathBuf,
    },

    /// Delete runs older than a number of days
    Cleanup {
        /// Age threshold in days
        #[arg(long, default_value = "30")]
        days: i64,

        /// State store data directory
        #[arg(long, default_value = "data", env = "MICROFLOW_DATA_DIR")]
        data_dir: PathBuf,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref())?;

    match cli.command {
        Commands::List {
            status,
            data_dir,
            format,
        } => cmd_list(status, data_dir, format).await,
        Commands::Inspect { run_id, data_dir } => cmd_inspect(run_id, data_dir).await,
        Commands::Delete { run_id, data_dir } => cmd_delete(run_id, data_dir).await,
        Commands::Cleanup { days, data_dir } => cmd_cleanup(days, data_dir).await,
    }
}

/// Load environment variables before command dispatch. A path given on the
/// command line must load; the implicit cwd lookup is best-effort.
fn load_dotenv(explicit_path: Option<&Path>) -> Result<()> {
    if let Some(path) = explicit_path {
        dotenvy::from_path(path)
            .with_context(|| format!("failed to load env file {}", path.display()))?;
        info!(path = %path.display(), "Loaded environment file");
        return Ok(());
    }

    match dotenvy::dotenv() {
        Ok(path) => info!(path = %path.display(), "Loaded environment file"),
        Err(err) if err.not_found() => {}
        Err(err) => warn!(error = %err, "Ignoring unreadable .env file"),
    }
    Ok(())
}

fn parse_status(s: &str) -> Result<RunStatus> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        _ => Err(anyhow::anyhow!("Invalid status filter: {}", s)),
    }
}

async fn cmd_list(status_filter: Option<String>, data_dir: PathBuf, format: String) -> Result<()> {
    let store = JsonStateStore::new(data_dir);

    let status = status_filter.as_deref().map(parse_status).transpose()?;
    let runs = store.list_runs(status).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<24} {:<24}",
        "RUN ID", "STATUS", "CREATED", "UPDATED"
    );
    println!("{}", "-".repeat(96));

    for run in &runs {
        println!(
            "{:<38} {:<10} {:<24} {:<24}",
            run.run_id,
            run.status,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_inspect(run_id: String, data_dir: PathBuf) -> Result<()> {
    let store = JsonStateStore::new(data_dir);

    let run = store
        .load_run(&run_id)
        .await?
        .with_context(|| format!("Run '{}' not found", run_id))?;

    println!("{}", serde_json::to_string_pretty(&run)?);

    Ok(())
}

async fn cmd_delete(run_id: String, data_dir: PathBuf) -> Result<()> {
    let store = JsonStateStore::new(data_dir);
    store.delete_run(&run_id).await?;
    println!("Deleted run '{}'", run_id);
    Ok(())
}

async fn cmd_cleanup(days: i64, data_dir: PathBuf) -> Result<()> {
    let store = JsonStateStore::new(data_dir);
    let deleted = store.cleanup_old_runs(days).await?;
    println!("Deleted {} run(s) older than {} day(s)", deleted, days);
    Ok(())
}
