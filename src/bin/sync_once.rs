use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tile_survey::config;
use tile_survey::db::{self, queue};
use tile_survey::model::ItemState;
use tile_survey::remote::HttpInspectionApi;
use tile_survey::service::InspectionService;
use tile_survey::store::LocalStore;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Drain the sync queue against the server and exit when nothing more can be sent"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Wait for items in backoff instead of exiting as soon as none are due
    #[arg(long)]
    wait_backoff: bool,

    /// Exit non-zero when failed items remain
    #[arg(long)]
    strict: bool,
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
    cfg.ensure_dirs()?;

    let pool = db::open(&cfg.database_url()).await?;
    let api = HttpInspectionApi::from_config(&cfg.remote)?;
    let service = InspectionService::with_api(
        LocalStore::new(pool.clone()),
        Arc::new(api),
        cfg.sync_settings(),
        true,
    );

    let initial = service.get_sync_status().await?;
    info!(pending = initial.pending_count, "starting sync");

    let mut passes = 0usize;
    loop {
        let report = service.force_sync().await?;
        passes += 1;
        info!(
            pass = passes,
            succeeded = report.succeeded,
            requeued = report.requeued,
            failed = report.failed,
            "pass finished"
        );

        let pending = queue::count_pending(&pool).await?;
        if pending == 0 {
            break;
        }
        if report.aborted_offline {
            warn!(pending, "server unreachable; leaving items queued");
            break;
        }
        if !args.wait_backoff {
            warn!(pending, "remaining items are backing off; use --wait-backoff to wait for them");
            break;
        }

        let next_due = queue::list_all(&pool)
            .await?
            .iter()
            .filter(|item| item.state == ItemState::Pending)
            .map(|item| item.due_at_ms)
            .min()
            .unwrap_or_else(queue::now_ms);
        let wait_ms = (next_due - queue::now_ms()).clamp(200, 60_000);
        info!(pending, wait_ms, "waiting for backoff");
        tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
    }

    let status = service.get_sync_status().await?;
    let failed = service.failed_items().await?;
    for item in &failed {
        warn!(
            item_id = %item.item_id,
            kind = item.kind.as_str(),
            target = %item.target_local_id,
            error = item.last_error.as_deref().unwrap_or(""),
            "item needs attention"
        );
    }
    info!(
        pending = status.pending_count,
        failed = failed.len(),
        last_sync_at = ?status.last_sync_at,
        "sync finished"
    );

    if args.strict && !failed.is_empty() {
        bail!("{} item(s) failed permanently", failed.len());
    }
    Ok(())
}
