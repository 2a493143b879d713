use std::collections::VecDeque;

use chrono::NaiveDateTime;
use tokio::sync::Mutex;

use crate::db::Db;
use crate::models::laststatus::StateDelta;
use crate::models::metric_event::MetricEvent;

const MAX_PENDING: usize = 1000;
const FLUSH_BATCH: usize = 100;

/// One record's deferred writes, queued while the DB breaker is open.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub imei: i64,
    pub delta: StateDelta,
    pub events: Vec<MetricEvent>,
    pub gps_time: NaiveDateTime,
    pub distance_km: Option<f64>,
    pub trip_id: Option<i64>,
    pub insert_if_missing: Option<(f64, f64)>,
}

/// Bounded in-memory buffer for engine writes during DB outages. When full
/// the oldest entry is dropped with a warning; recovery drains in chunks so
/// live traffic is not starved.
#[derive(Default)]
pub struct PendingWrites {
    queue: Mutex<VecDeque<PendingWrite>>,
}

impl PendingWrites {
    pub async fn push(&self, write: PendingWrite) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= MAX_PENDING {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    "pending writes full (max={MAX_PENDING}); dropped oldest imei={} gps_time={}",
                    dropped.imei,
                    dropped.gps_time
                );
            }
        }
        queue.push_back(write);
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain up to one chunk. Stops at the first failure, requeuing the item
    /// (front when the breaker is open again, back otherwise so one poisoned
    /// item cannot block the rest).
    pub async fn flush(&self, db: &Db) -> anyhow::Result<usize> {
        let mut flushed = 0;
        while flushed < FLUSH_BATCH {
            let item = {
                let mut queue = self.queue.lock().await;
                match queue.pop_front() {
                    Some(item) => item,
                    None => break,
                }
            };
            let result = self.write_one(db, &item).await;
            match result {
                Ok(()) => flushed += 1,
                Err(e) => {
                    let open = db.write_breaker.state() == crate::infra::circuit_breaker::BreakerState::Open;
                    let mut queue = self.queue.lock().await;
                    if open {
                        queue.push_front(item);
                    } else {
                        tracing::warn!("pending flush failed for imei={}: {e:#}; requeued at back", item.imei);
                        queue.push_back(item);
                    }
                    break;
                }
            }
        }
        if flushed > 0 {
            tracing::info!("drained {flushed} pending engine writes");
        }
        Ok(flushed)
    }

    async fn write_one(&self, db: &Db, item: &PendingWrite) -> anyhow::Result<()> {
        if !item.delta.is_empty() {
            db.update_laststatus_engine(item.imei, &item.delta, item.gps_time, item.insert_if_missing)
                .await?;
        }
        if let (Some(trip_id), Some(km)) = (item.trip_id, item.distance_km) {
            if km > 0.0 {
                db.update_trip_accumulation(trip_id, km, item.gps_time).await?;
            }
        }
        if !item.events.is_empty() {
            db.insert_metric_events(&item.events).await?;
        }
        Ok(())
    }
}
