use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::scheduler::Scheduler;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Background task that declines pending approvals whose run has already
/// started. The `system` actor lands in the audit trail.
pub async fn run_approval_sweeper(scheduler: Arc<Scheduler>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let lapsed = scheduler.collect_lapsed_approvals(now_ms());
        for id in lapsed {
            match scheduler.decide(id, false, "system").await {
                Ok(_) => info!("declined lapsed approval {id}"),
                Err(e) => {
                    // May have been decided concurrently — that's fine
                    tracing::debug!("sweeper skip {id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(scheduler: Arc<Scheduler>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = scheduler.wal_appends_since_compact().await;
        if appends >= threshold {
            match scheduler.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
