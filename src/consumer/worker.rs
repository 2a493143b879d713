use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::NaiveDateTime;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use tokio::sync::Mutex;

use crate::config::ConsumerConfig;
use crate::consumer::ConsumerStats;
use crate::consumer::batch::{dedup_last_wins, derive_message_id};
use crate::consumer::notifier;
use crate::db::Db;
use crate::infra::broker::{ALARMS_QUEUE, Broker, EVENTS_QUEUE, QueueSpec, TRACKDATA_QUEUE};
use crate::infra::dedup::DedupCache;
use crate::infra::retry::{RetryPolicy, retry_with_backoff};
use crate::infra::shutdown::Shutdown;
use crate::models::record::{AlarmExtras, EventExtras, RecordError, TrackRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Trackdata,
    Alarms,
    Events,
}

impl QueueKind {
    pub fn spec(&self) -> &'static QueueSpec {
        match self {
            QueueKind::Trackdata => &TRACKDATA_QUEUE,
            QueueKind::Alarms => &ALARMS_QUEUE,
            QueueKind::Events => &EVENTS_QUEUE,
        }
    }
}

struct Msg {
    record: TrackRecord,
    alarm: Option<AlarmExtras>,
    event: Option<EventExtras>,
    message_id: String,
    delivery: Delivery,
}

/// Writes held back while the database is unavailable. Bounded by record
/// count; oldest batches are dropped with a warning when the cap is hit.
/// Message ids ride along so the L2 dedup rows land with the data and any
/// broker redelivery of the same messages resolves as a duplicate.
enum HeldBatch {
    Track(Vec<TrackRecord>, Vec<String>),
    Alarms(Vec<(TrackRecord, AlarmExtras)>, Vec<String>),
    Events(Vec<(TrackRecord, EventExtras)>, Vec<String>),
}

impl HeldBatch {
    fn len(&self) -> usize {
        match self {
            HeldBatch::Track(rows, _) => rows.len(),
            HeldBatch::Alarms(rows, _) => rows.len(),
            HeldBatch::Events(rows, _) => rows.len(),
        }
    }
}

const MAX_HELD_RECORDS: usize = 1000;
const HELD_DRAIN_CHUNK: usize = 100;

#[derive(Default)]
pub struct HeldWrites {
    queue: Mutex<VecDeque<HeldBatch>>,
}

impl HeldWrites {
    async fn push(&self, batch: HeldBatch) {
        let mut queue = self.queue.lock().await;
        let mut total: usize = queue.iter().map(HeldBatch::len).sum();
        total += batch.len();
        while total > MAX_HELD_RECORDS {
            match queue.pop_front() {
                Some(dropped) => {
                    total -= dropped.len();
                    tracing::warn!("held-writes buffer full; dropped batch of {} records", dropped.len());
                }
                None => break,
            }
        }
        queue.push_back(batch);
    }

    /// Drain roughly one chunk of records; stops at the first failure.
    async fn drain(&self, db: &Db) -> anyhow::Result<usize> {
        let mut drained = 0;
        while drained < HELD_DRAIN_CHUNK {
            let batch = {
                let mut queue = self.queue.lock().await;
                match queue.pop_front() {
                    Some(b) => b,
                    None => break,
                }
            };
            let n = batch.len();
            let result = match &batch {
                HeldBatch::Track(rows, ids) => db.flush_trackdata(rows, ids).await.map(|_| ()),
                HeldBatch::Alarms(rows, ids) => db.flush_alarms(rows, ids).await.map(|_| ()),
                HeldBatch::Events(rows, ids) => db.flush_events(rows, ids).await.map(|_| ()),
            };
            match result {
                Ok(()) => drained += n,
                Err(e) => {
                    self.queue.lock().await.push_front(batch);
                    return Err(e);
                }
            }
        }
        if drained > 0 {
            tracing::info!("drained {drained} held records after recovery");
        }
        Ok(drained)
    }

    async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

pub struct ConsumerDeps {
    pub db: Arc<Db>,
    pub broker: Arc<Broker>,
    pub dedup: Arc<DedupCache>,
    pub stats: Arc<ConsumerStats>,
    pub held: Arc<HeldWrites>,
    pub config: ConsumerConfig,
}

/// One logical queue's consume loop: dedup, accumulate, flush on size or
/// timeout, ack strictly after the commit.
pub async fn run_queue(deps: Arc<ConsumerDeps>, kind: QueueKind, mut shutdown: Shutdown) {
    loop {
        if shutdown.is_shutdown() {
            return;
        }
        match consume_queue(&deps, kind, &mut shutdown).await {
            Ok(()) => return,
            Err(e) => {
                tracing::error!("{} consumer lost: {e:#}; reconnecting", kind.spec().name);
                if shutdown.sleep(Duration::from_secs(2)).await {
                    return;
                }
            }
        }
    }
}

async fn consume_queue(
    deps: &Arc<ConsumerDeps>,
    kind: QueueKind,
    shutdown: &mut Shutdown,
) -> anyhow::Result<()> {
    let spec = kind.spec();
    let channel =
        retry_with_backoff(&RetryPolicy::infinite(), spec.name, shutdown, || async {
            deps.broker.declare_tracking_topology(&[spec]).await
        })
        .await?;
    deps.broker.declare_alarm_exchange().await?;
    deps.broker.declare_invalid_data_queue().await?;
    channel.basic_qos(deps.config.prefetch_count, BasicQosOptions::default()).await?;

    // Several workers drain the queue (the broker fans out); all of them
    // feed the one batch accumulator below.
    let workers = deps.config.workers.max(1);
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Msg>(deps.config.batch_size * 2);
    let mut worker_tasks = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let consumer = channel
            .basic_consume(
                spec.name,
                &format!("ingest-{}-{worker_id}", spec.name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        worker_tasks.push(tokio::spawn(worker_consume(
            deps.clone(),
            kind,
            consumer,
            tx.clone(),
            shutdown.clone(),
        )));
    }
    drop(tx);
    tracing::info!(
        "consuming {} with {workers} workers (batch_size={})",
        spec.name,
        deps.config.batch_size
    );

    let mut batch: Vec<Msg> = Vec::with_capacity(deps.config.batch_size);
    let mut ticker = tokio::time::interval(Duration::from_millis(deps.config.batch_timeout_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    // All workers gone: connection-level problem.
                    break Err(anyhow::anyhow!("all {} workers stopped", spec.name));
                };
                batch.push(msg);
                if batch.len() >= deps.config.batch_size {
                    flush(deps, kind, &mut batch).await;
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(deps, kind, &mut batch).await;
                }
                if !deps.held.is_empty().await
                    && deps.db.write_breaker.state() != crate::infra::circuit_breaker::BreakerState::Open
                {
                    if let Err(e) = deps.held.drain(&deps.db).await {
                        tracing::debug!("held-writes drain failed: {e:#}");
                    }
                }
            }
            _ = shutdown.wait() => {
                break Ok(());
            }
        }
    };
    flush(deps, kind, &mut batch).await;
    for task in worker_tasks {
        task.abort();
    }
    result
}

/// One worker: pull deliveries, run dedup/validation, forward survivors to
/// the shared accumulator.
async fn worker_consume(
    deps: Arc<ConsumerDeps>,
    kind: QueueKind,
    mut consumer: lapin::Consumer,
    tx: tokio::sync::mpsc::Sender<Msg>,
    mut shutdown: Shutdown,
) {
    loop {
        let delivery = tokio::select! {
            d = consumer.next() => d,
            _ = shutdown.wait() => return,
        };
        let Some(delivery) = delivery else { return };
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("{} delivery error: {e}", kind.spec().name);
                return;
            }
        };
        match admit(&deps, kind, delivery).await {
            Ok(Some(msg)) => {
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("{} worker error: {e:#}", kind.spec().name);
                return;
            }
        }
    }
}

/// Parse, dedup and validate one delivery. Returns the message when it
/// belongs in the batch; handles ack/reject itself otherwise.
async fn admit(
    deps: &Arc<ConsumerDeps>,
    kind: QueueKind,
    delivery: Delivery,
) -> anyhow::Result<Option<Msg>> {
    let spec = kind.spec();
    let payload: serde_json::Value = match serde_json::from_slice(&delivery.data) {
        Ok(v) => v,
        Err(e) => {
            deps.stats.invalid.fetch_add(1, Ordering::Relaxed);
            let raw = serde_json::json!({ "raw": String::from_utf8_lossy(&delivery.data) });
            reject_invalid(deps, spec.name, &raw, "unparseable_json", None).await;
            delivery.acker.ack(BasicAckOptions::default()).await?;
            tracing::warn!("unparseable message on {}: {e}", spec.name);
            return Ok(None);
        }
    };

    let broker_id = delivery.properties.message_id().as_ref().map(|s| s.as_str().to_string());
    let message_id = derive_message_id(broker_id.as_deref(), &payload, &delivery.data);

    // Two-tier dedup: in-memory first, processed_message_ids second.
    if deps.dedup.contains(&message_id)
        || deps.db.is_message_processed(&message_id).await
    {
        deps.stats.dedup_hits.fetch_add(1, Ordering::Relaxed);
        deps.dedup.insert(&message_id);
        delivery.acker.ack(BasicAckOptions::default()).await?;
        return Ok(None);
    }

    let data = payload.get("data").cloned().unwrap_or(payload);
    let record = match TrackRecord::from_payload(&data) {
        Ok(r) => r,
        Err(e) => {
            let reason = match e {
                RecordError::MissingImei => "missing_imei",
                RecordError::InvalidImei => "invalid_imei",
            };
            deps.stats.invalid.fetch_add(1, Ordering::Relaxed);
            reject_invalid(deps, spec.name, &data, reason, Some(&message_id)).await;
            delivery.acker.ack(BasicAckOptions::default()).await?;
            return Ok(None);
        }
    };
    if let Some(reason) = record.validation_error() {
        deps.stats.invalid.fetch_add(1, Ordering::Relaxed);
        reject_invalid(deps, spec.name, &data, reason, Some(&message_id)).await;
        delivery.acker.ack(BasicAckOptions::default()).await?;
        return Ok(None);
    }

    let (alarm, event) = match kind {
        QueueKind::Trackdata => (None, None),
        QueueKind::Alarms => (Some(AlarmExtras::from_payload(&data)), None),
        QueueKind::Events => (None, Some(EventExtras::from_payload(&data))),
    };
    Ok(Some(Msg { record, alarm, event, message_id, delivery }))
}

async fn reject_invalid(
    deps: &Arc<ConsumerDeps>,
    source_queue: &str,
    data: &serde_json::Value,
    reason: &str,
    message_id: Option<&str>,
) {
    if let Err(e) = deps.broker.publish_invalid_data(data, reason).await {
        tracing::warn!("invalid-data publish failed: {e:#}");
    }
    let imei = data.get("imei").map(|v| v.to_string().trim_matches('"').to_string());
    if let Err(e) = deps
        .db
        .save_invalid_record(source_queue, data, reason, message_id, imei.as_deref())
        .await
    {
        tracing::debug!("invalid-data row insert failed: {e:#}");
    }
}

async fn flush(deps: &Arc<ConsumerDeps>, kind: QueueKind, batch: &mut Vec<Msg>) {
    if batch.is_empty() {
        return;
    }
    let msgs = std::mem::take(batch);
    let spec = kind.spec();
    let message_ids: Vec<String> = msgs.iter().map(|m| m.message_id.clone()).collect();

    let result: Result<Vec<(i64, NaiveDateTime, i64)>, _> = match kind {
        QueueKind::Trackdata => {
            let rows: Vec<(TrackRecord, ())> =
                msgs.iter().map(|m| (m.record.clone(), ())).collect();
            let rows: Vec<TrackRecord> =
                dedup_last_wins(rows).into_iter().map(|(r, _)| r).collect();
            deps.db
                .write_breaker
                .call(|| async { deps.db.flush_trackdata(&rows, &message_ids).await })
                .await
                .map(|_| Vec::new())
        }
        QueueKind::Alarms => {
            let rows: Vec<(TrackRecord, AlarmExtras)> = msgs
                .iter()
                .filter_map(|m| m.alarm.clone().map(|a| (m.record.clone(), a)))
                .collect();
            let rows = dedup_last_wins(rows);
            deps.db
                .write_breaker
                .call(|| async { deps.db.flush_alarms(&rows, &message_ids).await })
                .await
        }
        QueueKind::Events => {
            let rows: Vec<(TrackRecord, EventExtras)> = msgs
                .iter()
                .map(|m| (m.record.clone(), m.event.clone().unwrap_or_default()))
                .collect();
            let rows = dedup_last_wins(rows);
            deps.db
                .write_breaker
                .call(|| async { deps.db.flush_events(&rows, &message_ids).await })
                .await
                .map(|_| Vec::new())
        }
    };

    match result {
        Ok(alarm_ids) => {
            // Alarm notifications go out only after the commit, keyed by the
            // returned ids.
            if kind == QueueKind::Alarms && !alarm_ids.is_empty() {
                let by_key: HashMap<(i64, NaiveDateTime), i64> = alarm_ids
                    .into_iter()
                    .map(|(imei, gps_time, id)| ((imei, gps_time), id))
                    .collect();
                let mut notified: std::collections::HashSet<(i64, NaiveDateTime)> = Default::default();
                for msg in &msgs {
                    let key = (msg.record.imei, msg.record.gps_time);
                    if !notified.insert(key) {
                        continue;
                    }
                    if let (Some(id), Some(extras)) = (by_key.get(&key), msg.alarm.as_ref()) {
                        notifier::notify_alarm_saved(&deps.broker, &msg.record, extras, *id).await;
                    }
                }
            }
            for msg in msgs {
                deps.dedup.insert(&msg.message_id);
                deps.db.clear_retry_count(&msg.message_id).await;
                deps.stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = msg.delivery.acker.ack(BasicAckOptions::default()).await {
                    tracing::warn!("ack failed on {}: {e}", spec.name);
                }
            }
        }
        Err(e) => {
            let open = e.is_open();
            if open {
                // Keep the writes for the drain path; redeliveries dedup via L2
                // once the held batch lands.
                let held = match kind {
                    QueueKind::Trackdata => HeldBatch::Track(
                        msgs.iter().map(|m| m.record.clone()).collect(),
                        message_ids.clone(),
                    ),
                    QueueKind::Alarms => HeldBatch::Alarms(
                        msgs.iter()
                            .filter_map(|m| m.alarm.clone().map(|a| (m.record.clone(), a)))
                            .collect(),
                        message_ids.clone(),
                    ),
                    QueueKind::Events => HeldBatch::Events(
                        msgs.iter()
                            .map(|m| (m.record.clone(), m.event.clone().unwrap_or_default()))
                            .collect(),
                        message_ids.clone(),
                    ),
                };
                deps.held.push(held).await;
            } else {
                tracing::error!("batch flush failed on {}: {e}", spec.name);
            }
            for msg in msgs {
                deps.stats.failed.fetch_add(1, Ordering::Relaxed);
                let retries = deps
                    .db
                    .increment_retry_count(&msg.message_id, spec.name, Some(&e.to_string()))
                    .await;
                let requeue = retries < deps.config.max_message_retries;
                if !requeue {
                    deps.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "message {} exceeded {} retries on {}; dead-lettering",
                        msg.message_id,
                        deps.config.max_message_retries,
                        spec.name
                    );
                }
                if let Err(e) = msg
                    .delivery
                    .acker
                    .nack(BasicNackOptions { requeue, ..Default::default() })
                    .await
                {
                    tracing::warn!("nack failed on {}: {e}", spec.name);
                }
            }
        }
    }
}

/// Periodic housekeeping: L1 sweep every ten minutes, stats summary hourly,
/// L2/retry expiry daily.
pub async fn run_cleanup(deps: Arc<ConsumerDeps>, mut shutdown: Shutdown) {
    let mut ticks: u64 = 0;
    loop {
        if shutdown.sleep(Duration::from_secs(600)).await {
            return;
        }
        ticks += 1;
        let swept = deps.dedup.sweep();
        if swept > 0 {
            tracing::debug!("dedup cache sweep removed {swept} entries");
        }
        if ticks % 6 == 0 {
            deps.stats.log_summary();
        }
        if ticks % 144 == 0 {
            match deps.db.cleanup_message_bookkeeping(72, 24).await {
                Ok((processed, retries)) => tracing::info!(
                    "expired {processed} processed-message rows, {retries} retry rows"
                ),
                Err(e) => tracing::warn!("bookkeeping cleanup failed: {e:#}"),
            }
        }
    }
}
