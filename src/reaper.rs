use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::Ms;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Background task: rewrite the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task: physically drop CANCELED appointments whose window
/// ended more than `retention_ms` ago.
pub async fn run_purger(engine: Arc<Engine>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;
        purge_expired(&engine, now_ms() - retention_ms).await;
    }
}

pub async fn purge_expired(engine: &Engine, cutoff: Ms) -> usize {
    let mut purged = 0;
    for id in engine.collect_purgeable(cutoff) {
        match engine.purge_appointment(id).await {
            Ok(()) => purged += 1,
            // May have been purged by hand in the meantime.
            Err(e) => debug!("purger skip {id}: {e}"),
        }
    }
    if purged > 0 {
        info!(purged, "purged canceled appointments");
    }
    purged
}
