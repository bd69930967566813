use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use voyage_order::{Maintenance, MaintenanceReport};
use voyage_store::app_config::MaintenanceConfig;

/// One sweep. Errors are logged so the next tick still runs.
pub async fn sweep(maintenance: &Maintenance, dry_run: bool) -> Option<MaintenanceReport> {
    match maintenance.run_once(dry_run).await {
        Ok(report) => {
            info!(
                expired_carts = report.expired_carts,
                purged_idempotency_records = report.purged_idempotency_records,
                dry_run = report.dry_run,
                "Maintenance sweep finished"
            );
            Some(report)
        }
        Err(e) => {
            error!("Maintenance sweep failed: {}", e);
            None
        }
    }
}

/// Runs a sweep every `sweep_interval_secs` until ctrl-c.
pub async fn run(maintenance: Maintenance, config: &MaintenanceConfig) {
    let mut ticker = interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Maintenance worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&maintenance, config.dry_run).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping maintenance worker");
                break;
            }
        }
    }
}
