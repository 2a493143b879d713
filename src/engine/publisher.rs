use lapin::BasicProperties;
use lapin::types::ShortString;

use crate::db::Db;
use crate::infra::broker::{ALARM_EXCHANGE, ALARM_ROUTING_KEY, Broker};
use crate::models::metric_event::MetricEvent;

/// Forward freshly inserted metric events to the alarm exchange, honouring
/// per-device `metrics_alarm_config`. Failures are logged, never propagated;
/// the dispatcher re-scans on startup for anything missed.
pub async fn publish_metric_events(broker: &Broker, db: &Db, events: &[MetricEvent]) {
    for ev in events {
        match db.metrics_alarm_suppressed(ev.imei, ev.event_type).await {
            Ok(true) => continue,
            Ok(false) => {}
            // No config readable: default to publishing.
            Err(e) => tracing::debug!("metrics_alarm_config lookup failed: {e:#}"),
        }
        let payload = serde_json::json!({
            "imei": ev.imei,
            "gps_time": ev.gps_time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "latitude": ev.latitude,
            "longitude": ev.longitude,
            "status": ev.event_type,
            "event_category": ev.event_category,
            "event_type": ev.event_type,
            "event_value": ev.event_value,
            "threshold_value": ev.threshold_value,
            "severity": ev.severity,
            "source": "metric_engine",
        });
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("metric event serialization failed: {e}");
                continue;
            }
        };
        let props = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"));
        if let Err(e) = broker.publish(ALARM_EXCHANGE, ALARM_ROUTING_KEY, &body, props).await {
            tracing::warn!("metric event publish failed (non-fatal): {e:#}");
        }
    }
}
