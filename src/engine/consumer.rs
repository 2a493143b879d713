use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::config::MetricEngineConfig;
use crate::engine::pipeline::Pipeline;
use crate::infra::broker::{Broker, METRICS_QUEUE};
use crate::infra::retry::{RetryPolicy, retry_with_backoff};
use crate::infra::shutdown::Shutdown;

/// Stable message signature: the payload's message_id when present, else a
/// digest of the raw body. Truncated to 64 hex chars for the bookkeeping
/// tables.
pub fn message_signature(body: &[u8], payload: Option<&serde_json::Value>) -> String {
    if let Some(mid) = payload
        .and_then(|p| p.get("message_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        let mut hasher = Sha256::new();
        hasher.update(mid.as_bytes());
        return format!("{:x}", hasher.finalize())[..64].to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())[..64].to_string()
}

struct Job {
    delivery: Delivery,
    data: serde_json::Value,
    signature: String,
}

/// Consume `metrics_queue` and dispatch records to per-imei-hash workers so
/// each device's records are processed in arrival order. Ordering across
/// devices is unconstrained.
pub async fn run(
    broker: Arc<Broker>,
    pipeline: Arc<Pipeline>,
    config: MetricEngineConfig,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    let workers = config.workers.max(1);
    let mut senders: Vec<mpsc::Sender<Job>> = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let (tx, rx) = mpsc::channel::<Job>(64);
        senders.push(tx);
        let pipeline = pipeline.clone();
        let max_retries = config.max_message_retries;
        tokio::spawn(worker_loop(worker_id, rx, pipeline, max_retries));
    }

    loop {
        if shutdown.is_shutdown() {
            return Ok(());
        }
        let consume = consume_once(&broker, &pipeline, &config, &senders, &mut shutdown).await;
        match consume {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::error!("metric consumer connection lost: {e:#}; reconnecting");
                if shutdown.sleep(std::time::Duration::from_secs(2)).await {
                    return Ok(());
                }
            }
        }
    }
}

async fn consume_once(
    broker: &Arc<Broker>,
    pipeline: &Arc<Pipeline>,
    config: &MetricEngineConfig,
    senders: &[mpsc::Sender<Job>],
    shutdown: &mut Shutdown,
) -> anyhow::Result<()> {
    let channel = retry_with_backoff(&RetryPolicy::infinite(), "metric-engine connect", shutdown, || async {
        broker.declare_tracking_topology(&[&METRICS_QUEUE]).await
    })
    .await?;
    channel.basic_qos(config.prefetch_count, BasicQosOptions::default()).await?;
    let mut consumer = channel
        .basic_consume(
            METRICS_QUEUE.name,
            "metric-engine",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    tracing::info!("consuming {} (prefetch={})", METRICS_QUEUE.name, config.prefetch_count);

    loop {
        let delivery = tokio::select! {
            d = consumer.next() => d,
            _ = shutdown.wait() => return Ok(()),
        };
        let Some(delivery) = delivery else {
            anyhow::bail!("consumer stream closed");
        };
        let delivery = delivery?;

        let payload: serde_json::Value = match serde_json::from_slice(&delivery.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("unparseable message on {}: {e}", METRICS_QUEUE.name);
                delivery
                    .acker
                    .nack(BasicNackOptions { requeue: false, ..Default::default() })
                    .await?;
                continue;
            }
        };
        let signature = message_signature(&delivery.data, Some(&payload));
        if pipeline.db.is_engine_message_processed(&signature).await {
            tracing::debug!("duplicate message skipped (signature={})", &signature[..16]);
            delivery.acker.ack(BasicAckOptions::default()).await?;
            continue;
        }
        // Payloads nest the record under "data"; raw records are accepted too.
        let data = payload.get("data").cloned().unwrap_or(payload);
        let imei = crate::models::record::opt_i64(data.get("imei")).unwrap_or(0);
        let worker = (imei.unsigned_abs() as usize) % senders.len();
        if senders[worker]
            .send(Job { delivery, data, signature })
            .await
            .is_err()
        {
            anyhow::bail!("worker {worker} channel closed");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<Job>,
    pipeline: Arc<Pipeline>,
    max_retries: i32,
) {
    while let Some(job) = rx.recv().await {
        let result = pipeline.process_payload(&job.data).await;
        let ack_result = match result {
            Ok(()) => {
                pipeline.db.clear_engine_retry(&job.signature).await;
                if let Err(e) = pipeline.db.mark_engine_message_processed(&job.signature).await {
                    tracing::debug!("mark processed failed: {e:#}");
                }
                job.delivery.acker.ack(BasicAckOptions::default()).await
            }
            Err(e) => {
                let retries = pipeline
                    .db
                    .increment_engine_retry(&job.signature, Some(&format!("{e:#}")))
                    .await;
                if retries >= max_retries {
                    tracing::error!(
                        "message exceeded max retries ({max_retries}), dead-lettering (signature={})",
                        &job.signature[..16]
                    );
                    job.delivery
                        .acker
                        .nack(BasicNackOptions { requeue: false, ..Default::default() })
                        .await
                } else {
                    tracing::warn!("processing failed (retry {retries}/{max_retries}): {e:#}");
                    job.delivery
                        .acker
                        .nack(BasicNackOptions { requeue: true, ..Default::default() })
                        .await
                }
            }
        };
        if let Err(e) = ack_result {
            tracing::warn!("worker {worker_id}: ack/nack failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_prefers_message_id() {
        let payload = serde_json::json!({"message_id": "abc-123", "data": {}});
        let a = message_signature(b"body-one", Some(&payload));
        let b = message_signature(b"body-two", Some(&payload));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_falls_back_to_body_hash() {
        let a = message_signature(b"same-body", None);
        let b = message_signature(b"same-body", None);
        let c = message_signature(b"other-body", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
