use chrono::{NaiveDateTime, Utc};
use md5::{Digest, Md5};
use serde_json::{Value, json};

use crate::camera::cms_api::{CmsAlarm, CmsDevice};

pub const VENDOR: &str = "camera";
const VENDOR_VERSION: &str = "1.0";

/// Convert a CMS device id to the numeric imei key. Non-digit characters are
/// stripped (vendors pad ids with plate prefixes); anything that does not
/// leave 6-16 digits is unusable.
pub fn device_id_to_imei(device_id: &str) -> Option<i64> {
    let digits: String = device_id.chars().filter(|c| c.is_ascii_digit()).collect();
    if !(6..=16).contains(&digits.len()) {
        return None;
    }
    digits.parse().ok()
}

/// Deterministic message id so retransmits of the same observation dedup in
/// the ingestion tier.
pub fn deterministic_message_id(imei: i64, gps_time: NaiveDateTime, record_type: &str) -> String {
    let content = format!("{VENDOR}:{imei}:{}:{record_type}", gps_time.format("%Y-%m-%dT%H:%M:%SZ"));
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn format_ts(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// An outbound message in the parser wire shape:
/// `{vendor, imei, message_id, record_type, data}`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub imei: i64,
    pub message_id: String,
    pub body: Value,
}

pub fn device_to_trackdata(device: &CmsDevice) -> Option<OutboundMessage> {
    if !device.online {
        return None;
    }
    let imei = device_id_to_imei(&device.device_id)?;
    let now = Utc::now().naive_utc();
    let gps_time = device.gps_time.unwrap_or(now);
    let message_id = deterministic_message_id(imei, gps_time, "trackdata");
    let body = json!({
        "vendor": VENDOR,
        "vendor_version": VENDOR_VERSION,
        "timestamp": format_ts(now),
        "imei": imei.to_string(),
        "message_id": message_id,
        "record_type": "trackdata",
        "data": {
            "imei": imei.to_string(),
            "server_time": format_ts(now),
            "gps_time": format_ts(gps_time),
            "latitude": device.latitude,
            "longitude": device.longitude,
            "altitude": device.altitude,
            "angle": device.heading,
            "satellites": device.satellites,
            "speed": device.speed,
            "status": "Normal",
            "vendor": VENDOR,
        }
    });
    Some(OutboundMessage { imei, message_id, body })
}

pub fn alarm_to_event(alarm: &CmsAlarm) -> Option<OutboundMessage> {
    let imei = device_id_to_imei(&alarm.device_id)?;
    let now = Utc::now().naive_utc();
    let message_id = deterministic_message_id(imei, alarm.gps_time, "event");
    let body = json!({
        "vendor": VENDOR,
        "vendor_version": VENDOR_VERSION,
        "timestamp": format_ts(now),
        "imei": imei.to_string(),
        "message_id": message_id,
        "record_type": "event",
        "data": {
            "imei": imei.to_string(),
            "server_time": format_ts(now),
            "gps_time": format_ts(alarm.gps_time),
            "latitude": alarm.latitude,
            "longitude": alarm.longitude,
            "speed": alarm.speed,
            "status": alarm.alarm_name,
            "vendor": VENDOR,
            "photo_url": alarm.photo_url,
            "video_url": alarm.video_url,
            "dynamic_io": { "alarm_guid": alarm.guid, "alarm_type": alarm.alarm_type },
        }
    });
    Some(OutboundMessage { imei, message_id, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_strip_to_digits() {
        assert_eq!(device_id_to_imei("352094081234567"), Some(352094081234567));
        assert_eq!(device_id_to_imei("CAM-0012345678"), Some(12345678));
        assert_eq!(device_id_to_imei("ABC"), None);
        assert_eq!(device_id_to_imei("123"), None);
    }

    #[test]
    fn message_ids_are_deterministic_per_observation() {
        let t = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let a = deterministic_message_id(100, t, "trackdata");
        let b = deterministic_message_id(100, t, "trackdata");
        let c = deterministic_message_id(100, t, "event");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn offline_devices_produce_nothing() {
        let device = CmsDevice {
            device_id: "123456789".into(),
            plate_number: "ABC-123".into(),
            online: false,
            latitude: 31.5,
            longitude: 74.3,
            speed: 0,
            heading: 0,
            altitude: 0,
            satellites: 5,
            gps_time: None,
        };
        assert!(device_to_trackdata(&device).is_none());
    }
}
