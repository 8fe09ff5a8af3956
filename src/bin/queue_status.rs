use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use tile_survey::config;
use tile_survey::db::{self, queue};
use tile_survey::status::StatusReporter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and repair the local sync queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the status snapshot as JSON (default)
    Status,
    /// List every queued item in replay order
    List,
    /// List items that failed permanently
    Failed,
    /// Drop a failed item for good
    Dismiss { item_id: Uuid },
    /// Put a failed item (and the failed items after it for the same inspection) back in line
    Retry { item_id: Uuid },
    /// Print local storage usage as JSON
    Usage,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::open(&cfg.database_url())
        .await
        .context("failed to open local store")?;
    let escalate_after = cfg.sync.escalate_after_attempts as i32;

    match args.command.unwrap_or(Command::Status) {
        Command::Status => {
            // Connectivity is unknown from here; report it as offline.
            let reporter = StatusReporter::new(false);
            let status = reporter.refresh(&pool, escalate_after).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::List => {
            for item in queue::list_all(&pool).await? {
                println!(
                    "{:>6}  {}  {:<22} {:<8} attempt={} target={} {}",
                    item.seq,
                    item.item_id,
                    item.kind.as_str(),
                    item.state.as_str(),
                    item.attempt,
                    item.target_local_id,
                    item.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Failed => {
            let failed = queue::list_failed(&pool).await?;
            if failed.is_empty() {
                println!("no failed items");
            }
            for item in failed {
                println!(
                    "{}  {:<22} target={} error={}",
                    item.item_id,
                    item.kind.as_str(),
                    item.target_local_id,
                    item.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Dismiss { item_id } => {
            queue::dismiss(&pool, item_id).await?;
            println!("dismissed {item_id}");
        }
        Command::Retry { item_id } => {
            let revived = queue::retry_failed(&pool, item_id).await?;
            println!("{revived} item(s) back in line");
        }
        Command::Usage => {
            let usage = db::storage_usage(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
    }
    Ok(())
}
