use chrono::NaiveTime;
use serde_json::Value;

use crate::db::Db;

/// Sentinel imei whose rows act as the template copied to newly discovered
/// devices.
pub const TEMPLATE_IMEI: i64 = 0;

#[derive(Debug, Clone)]
pub struct CameraAlarmConfig {
    pub enabled: bool,
    pub is_alarm: i16,
    pub is_sms: i16,
    pub is_email: i16,
    pub is_call: i16,
    pub priority: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl CameraAlarmConfig {
    pub fn should_alarm(&self) -> bool {
        self.enabled && self.is_alarm != 0
    }
}

/// Windows may cross midnight (22:00-06:00 means "night").
pub fn within_window(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start <= end {
        start <= t && t <= end
    } else {
        t >= start || t <= end
    }
}

impl Db {
    pub async fn camera_alarm_config(
        &self,
        imei: i64,
        event_type: &str,
    ) -> anyhow::Result<Option<CameraAlarmConfig>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT enabled, is_alarm, is_sms, is_email, is_call, priority, start_time, end_time \
                 FROM camera_alarm_config WHERE imei = $1 AND event_type = $2",
                &[&imei, &event_type],
            )
            .await?;
        Ok(row.map(|r| CameraAlarmConfig {
            enabled: r.get(0),
            is_alarm: r.get(1),
            is_sms: r.get(2),
            is_email: r.get(3),
            is_call: r.get(4),
            priority: r.get(5),
            start_time: r.get(6),
            end_time: r.get(7),
        }))
    }

    /// Copy the template row set to a newly discovered imei. A device that
    /// already has any row is left alone.
    pub async fn provision_camera_alarm_config(&self, imei: i64) -> anyhow::Result<u64> {
        if imei == TEMPLATE_IMEI {
            return Ok(0);
        }
        let client = self.client().await?;
        let existing = client
            .query_opt("SELECT 1 FROM camera_alarm_config WHERE imei = $1 LIMIT 1", &[&imei])
            .await?;
        if existing.is_some() {
            return Ok(0);
        }
        let copied = client
            .execute(
                "INSERT INTO camera_alarm_config \
                 (imei, event_type, enabled, is_alarm, is_sms, is_email, is_call, priority, start_time, end_time) \
                 SELECT $1, event_type, enabled, is_alarm, is_sms, is_email, is_call, priority, start_time, end_time \
                 FROM camera_alarm_config WHERE imei = $2 \
                 ON CONFLICT (imei, event_type) DO NOTHING",
                &[&imei, &TEMPLATE_IMEI],
            )
            .await?;
        if copied > 0 {
            tracing::info!("provisioned {copied} alarm-config rows for new camera imei={imei}");
        }
        Ok(copied)
    }
}

/// Stamp the outbound event's alarm flags from its config. Defaults (no
/// alarm) are written first so the consumer always sees the fields; an event
/// outside its time window or with no config stays a plain event.
pub async fn enrich_with_alarm_flags(db: &Db, data: &mut Value) {
    let obj = match data.as_object_mut() {
        Some(o) => o,
        None => return,
    };
    obj.insert("is_alarm".into(), Value::from(0));
    obj.insert("is_sms".into(), Value::from(0));
    obj.insert("is_email".into(), Value::from(0));
    obj.insert("is_call".into(), Value::from(0));
    obj.insert("priority".into(), Value::from(0));

    let event_type = obj.get("status").and_then(Value::as_str).unwrap_or("").to_string();
    if event_type.is_empty() || event_type == "Normal" {
        return;
    }
    let Some(imei) = obj.get("imei").and_then(|v| crate::models::record::opt_i64(Some(v))) else {
        return;
    };

    if let Err(e) = db.provision_camera_alarm_config(imei).await {
        tracing::debug!("alarm-config provisioning failed for imei={imei}: {e:#}");
    }
    let config = match db.camera_alarm_config(imei, &event_type).await {
        Ok(Some(c)) => c,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!("alarm-config lookup failed for imei={imei}: {e:#}");
            return;
        }
    };
    if !config.should_alarm() {
        return;
    }
    if let Some(gps_time) =
        crate::models::record::opt_datetime(obj.get("gps_time"))
    {
        if !within_window(config.start_time, config.end_time, gps_time.time()) {
            tracing::debug!("event {event_type} outside alarm window for imei={imei}");
            return;
        }
    }
    obj.insert("is_alarm".into(), Value::from(1));
    obj.insert("is_sms".into(), Value::from(config.is_sms));
    obj.insert("is_email".into(), Value::from(config.is_email));
    obj.insert("is_call".into(), Value::from(config.is_call));
    obj.insert("priority".into(), Value::from(config.priority));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn plain_window() {
        assert!(within_window(t(8, 0), t(18, 0), t(12, 0)));
        assert!(!within_window(t(8, 0), t(18, 0), t(19, 0)));
        assert!(within_window(t(8, 0), t(18, 0), t(8, 0)));
        assert!(within_window(t(8, 0), t(18, 0), t(18, 0)));
    }

    #[test]
    fn window_crossing_midnight() {
        assert!(within_window(t(22, 0), t(6, 0), t(23, 30)));
        assert!(within_window(t(22, 0), t(6, 0), t(2, 0)));
        assert!(!within_window(t(22, 0), t(6, 0), t(12, 0)));
    }
}
