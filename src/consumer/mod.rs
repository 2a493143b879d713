pub mod batch;
pub mod notifier;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide ingestion counters, logged periodically and cheap to bump
/// from every worker.
#[derive(Default)]
pub struct ConsumerStats {
    pub processed: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub invalid: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl ConsumerStats {
    pub fn log_summary(&self) {
        tracing::info!(
            "consumer stats: processed={} dedup_hits={} invalid={} failed={} dead_lettered={}",
            self.processed.load(Ordering::Relaxed),
            self.dedup_hits.load(Ordering::Relaxed),
            self.invalid.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.dead_lettered.load(Ordering::Relaxed),
        );
    }
}
