use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use tile_survey::config;
use tile_survey::db;
use tile_survey::remote::HttpInspectionApi;
use tile_survey::service::InspectionService;
use tile_survey::store::LocalStore;

#[derive(Debug, Parser)]
#[command(author, version, about = "Keep the local inspection store in sync with the server")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let settings = cfg.sync_settings();
    let poll_interval = settings.poll_interval;
    let service = InspectionService::with_api(
        LocalStore::new(pool),
        Arc::new(api),
        settings,
        cfg.sync.start_online,
    );

    let engine = service.engine().clone();
    let auto = engine.spawn_auto_sync();
    let periodic = engine.spawn_periodic();

    // No platform connectivity signal here: after a failed call marks the
    // monitor offline, retry optimistically once per poll interval.
    let probe = {
        let monitor = service.monitor().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !monitor.is_online() {
                    info!("probing server after offline period");
                    monitor.set_platform_state(true);
                }
            }
        })
    };

    let status = service.get_sync_status().await?;
    info!(
        status = status.status.as_str(),
        pending = status.pending_count,
        needs_attention = status.needs_attention,
        "sync daemon started"
    );

    if service.monitor().is_online() {
        match service.force_sync().await {
            Ok(report) => info!(?report, "startup drain finished"),
            Err(err) => warn!(?err, "startup drain failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    probe.abort();
    auto.abort();
    periodic.abort();
    Ok(())
}
