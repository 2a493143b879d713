use chrono::NaiveDateTime;
use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldTable, ShortString};

use crate::infra::broker::{ALARM_EXCHANGE, ALARM_ROUTING_KEY, Broker};
use crate::models::record::{AlarmExtras, TrackRecord};

/// Publish a persisted alarm to the alarm exchange for the dispatcher.
/// Fire-and-forget: the row is already committed, and the dispatcher
/// re-scans for unsent alarms on startup, so a lost notification only delays
/// delivery. Only called once an id is available.
pub async fn notify_alarm_saved(
    broker: &Broker,
    record: &TrackRecord,
    extras: &AlarmExtras,
    alarm_id: i64,
) {
    let body = serde_json::json!({
        "id": alarm_id,
        "imei": record.imei,
        "status": record.status,
        "priority": extras.priority,
        "scheduled_at": extras.scheduled_at.map(format_ts),
        "channels": {
            "sms": extras.is_sms != 0,
            "email": extras.is_email != 0,
            "voice": extras.is_call != 0,
        },
        "is_sms": extras.is_sms,
        "is_email": extras.is_email,
        "is_call": extras.is_call,
        "state": extras.state,
        "category": extras.category,
        "server_time": format_ts(record.server_time),
        "gps_time": format_ts(record.gps_time),
        "latitude": record.latitude,
        "longitude": record.longitude,
        "altitude": record.altitude,
        "angle": record.angle,
        "satellites": record.satellites,
        "speed": record.speed,
        "reference_id": record.reference_id,
        "distance": record.distance,
    });
    let payload = match serde_json::to_vec(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("alarm notification serialization failed: {e}");
            return;
        }
    };

    let mut headers = FieldTable::default();
    headers.insert(ShortString::from("alarm-type"), AMQPValue::LongString(record.status.clone().into()));
    headers.insert(ShortString::from("imei"), AMQPValue::LongString(record.imei.to_string().into()));

    let priority = extras.priority.clamp(0, 10) as u8;
    let props = BasicProperties::default()
        .with_content_type(ShortString::from("application/json"))
        .with_priority(priority)
        .with_message_id(ShortString::from(format!("alarm-{alarm_id}")))
        .with_headers(headers);

    if let Err(e) = broker.publish(ALARM_EXCHANGE, ALARM_ROUTING_KEY, &payload, props).await {
        tracing::warn!("alarm notification publish failed (non-fatal): {e:#}");
    } else {
        tracing::debug!("published alarm notification imei={} id={alarm_id}", record.imei);
    }
}

fn format_ts(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
