pub mod http;
pub mod modem;
pub mod pool;
pub mod service;
pub mod store;

use std::sync::atomic::AtomicU64;

/// Gateway counters surfaced on `/metrics`.
#[derive(Default)]
pub struct GatewayStats {
    pub commands_processed: AtomicU64,
    pub commands_sent: AtomicU64,
    pub commands_failed: AtomicU64,
    pub commands_timed_out: AtomicU64,
    pub responses_matched: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub no_reply: AtomicU64,
}
