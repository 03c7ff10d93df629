use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;
use crate::observability;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task: compact the WAL once enough appends have piled up, and
/// drop notification channels nobody listens to anymore.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        maybe_compact(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether the WAL was rewritten.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> bool {
    metrics::gauge!(observability::VENUES_ACTIVE).set(engine.venue_count() as f64);
    let pruned = engine.notify.prune();
    if pruned > 0 {
        debug!("pruned {pruned} idle notification channels");
    }

    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            // The old log is left in place; next pass retries.
            warn!("WAL compaction failed after {appends} appends: {e}");
            false
        }
    }
}
