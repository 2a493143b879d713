use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// One GPS/telemetry sample as consumed from the broker. Field coercion is
/// deliberately tolerant: the upstream parsers emit numbers as strings for
/// some vendors, and empty strings mean NULL.
#[derive(Debug, Clone)]
pub struct TrackRecord {
    pub imei: i64,
    pub gps_time: NaiveDateTime,
    pub server_time: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
    pub angle: i32,
    pub satellites: i32,
    pub speed: i32,
    pub status: String,
    pub vendor: String,
    pub ignition: Option<bool>,
    pub driver_seatbelt: Option<bool>,
    pub passenger_seatbelt: Option<bool>,
    pub door_status: Option<bool>,
    pub passenger_seat: Option<f64>,
    pub main_battery: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub fuel: Option<f64>,
    pub dallas_temperature_1: Option<f64>,
    pub dallas_temperature_2: Option<f64>,
    pub dallas_temperature_3: Option<f64>,
    pub dallas_temperature_4: Option<f64>,
    pub ble_temperature_1: Option<f64>,
    pub ble_temperature_2: Option<f64>,
    pub ble_temperature_3: Option<f64>,
    pub ble_temperature_4: Option<f64>,
    pub ble_humidity_1: Option<i32>,
    pub ble_humidity_2: Option<i32>,
    pub ble_humidity_3: Option<i32>,
    pub ble_humidity_4: Option<i32>,
    pub green_driving_value: Option<f64>,
    pub dynamic_io: Value,
    pub is_valid: i32,
    pub reference_id: Option<i32>,
    pub distance: Option<f64>,
}

/// Alarm-only columns carried by `tracking.*.alarm` payloads.
#[derive(Debug, Clone)]
pub struct AlarmExtras {
    pub is_sms: i16,
    pub is_email: i16,
    pub is_call: i16,
    pub priority: i16,
    pub category: Option<String>,
    pub scheduled_at: Option<NaiveDateTime>,
    pub state: Value,
}

/// Event-only columns (media URLs) carried by `tracking.*.event` payloads.
#[derive(Debug, Clone, Default)]
pub struct EventExtras {
    pub photo_url: Option<String>,
    pub video_url: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing_imei")]
    MissingImei,
    #[error("invalid_imei")]
    InvalidImei,
}

impl TrackRecord {
    /// Build from the `data` object of a broker payload. Only the imei is
    /// mandatory; everything else coerces or defaults.
    pub fn from_payload(data: &Value) -> Result<Self, RecordError> {
        let imei = parse_imei(data.get("imei"))?;
        let now = Utc::now().naive_utc();
        let server_time = opt_datetime(data.get("server_time")).unwrap_or(now);
        let gps_time = opt_datetime(data.get("gps_time")).unwrap_or(server_time);
        let dynamic_io = match data.get("dynamic_io") {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| Value::Object(Default::default())),
            Some(v @ Value::Object(_)) => v.clone(),
            _ => Value::Object(Default::default()),
        };
        Ok(Self {
            imei,
            gps_time,
            server_time,
            latitude: opt_f64(data.get("latitude")).unwrap_or(0.0),
            longitude: opt_f64(data.get("longitude")).unwrap_or(0.0),
            altitude: opt_i32(data.get("altitude")).unwrap_or(0),
            angle: opt_i32(data.get("angle")).unwrap_or(0),
            satellites: opt_i32(data.get("satellites")).unwrap_or(0),
            speed: opt_i32(data.get("speed")).unwrap_or(0),
            status: opt_str(data.get("status")).unwrap_or_else(|| "Normal".to_string()),
            vendor: opt_str(data.get("vendor")).unwrap_or_else(|| "teltonika".to_string()),
            ignition: opt_bool(data.get("ignition")),
            driver_seatbelt: opt_bool(data.get("driver_seatbelt")),
            passenger_seatbelt: opt_bool(data.get("passenger_seatbelt")),
            door_status: opt_bool(data.get("door_status")),
            passenger_seat: opt_f64(data.get("passenger_seat")),
            main_battery: opt_f64(data.get("main_battery")),
            battery_voltage: opt_f64(data.get("battery_voltage")),
            fuel: opt_f64(data.get("fuel")),
            dallas_temperature_1: opt_f64(data.get("dallas_temperature_1")),
            dallas_temperature_2: opt_f64(data.get("dallas_temperature_2")),
            dallas_temperature_3: opt_f64(data.get("dallas_temperature_3")),
            dallas_temperature_4: opt_f64(data.get("dallas_temperature_4")),
            ble_temperature_1: opt_f64(data.get("ble_temperature_1")),
            ble_temperature_2: opt_f64(data.get("ble_temperature_2")),
            ble_temperature_3: opt_f64(data.get("ble_temperature_3")),
            ble_temperature_4: opt_f64(data.get("ble_temperature_4")),
            ble_humidity_1: opt_i32(data.get("ble_humidity_1")),
            ble_humidity_2: opt_i32(data.get("ble_humidity_2")),
            ble_humidity_3: opt_i32(data.get("ble_humidity_3")),
            ble_humidity_4: opt_i32(data.get("ble_humidity_4")),
            green_driving_value: opt_f64(data.get("green_driving_value")),
            dynamic_io,
            is_valid: opt_i32(data.get("is_valid")).unwrap_or(1),
            reference_id: opt_i32(data.get("reference_id")),
            distance: opt_f64(data.get("distance")),
        })
    }

    /// GPS/speed validation per the ingestion contract. Returns the reason
    /// string used on the invalid-data queue, or None when the record is good.
    pub fn validation_error(&self) -> Option<&'static str> {
        if self.latitude == 0.0 && self.longitude == 0.0 {
            return Some("invalid_gps_zero");
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Some("invalid_latitude");
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Some("invalid_longitude");
        }
        if self.speed < 0 {
            return Some("invalid_speed_negative");
        }
        if self.speed > 250 {
            return Some("invalid_speed_max");
        }
        None
    }

    /// Ignition from the boolean column when present, else from the status
    /// text ("Ignition On"/"Ignition Off").
    pub fn ignition_on(&self) -> bool {
        if let Some(v) = self.ignition {
            return v;
        }
        let status = self.status.to_lowercase();
        if status.contains("ignition on") {
            return true;
        }
        false
    }

    pub fn status_contains(&self, needle: &str) -> bool {
        self.status.to_lowercase().contains(&needle.to_lowercase())
    }

    /// First populated temperature channel: dallas 1-4, then BLE 1-4.
    pub fn temperature(&self) -> Option<f64> {
        self.dallas_temperature_1
            .or(self.dallas_temperature_2)
            .or(self.dallas_temperature_3)
            .or(self.dallas_temperature_4)
            .or(self.ble_temperature_1)
            .or(self.ble_temperature_2)
            .or(self.ble_temperature_3)
            .or(self.ble_temperature_4)
    }

    /// First populated BLE humidity channel.
    pub fn humidity(&self) -> Option<i32> {
        self.ble_humidity_1
            .or(self.ble_humidity_2)
            .or(self.ble_humidity_3)
            .or(self.ble_humidity_4)
    }
}

impl AlarmExtras {
    pub fn from_payload(data: &Value) -> Self {
        Self {
            is_sms: opt_i32(data.get("is_sms")).unwrap_or(0) as i16,
            is_email: opt_i32(data.get("is_email")).unwrap_or(0) as i16,
            is_call: opt_i32(data.get("is_call")).unwrap_or(0) as i16,
            priority: opt_i32(data.get("priority")).unwrap_or(0).clamp(0, 10) as i16,
            category: opt_str(data.get("category")),
            scheduled_at: opt_datetime(data.get("scheduled_at")),
            state: data.get("state").cloned().unwrap_or(Value::Object(Default::default())),
        }
    }
}

impl EventExtras {
    pub fn from_payload(data: &Value) -> Self {
        Self {
            photo_url: opt_str(data.get("photo_url")),
            video_url: opt_str(data.get("video_url")),
        }
    }
}

fn parse_imei(v: Option<&Value>) -> Result<i64, RecordError> {
    match v {
        None | Some(Value::Null) => Err(RecordError::MissingImei),
        Some(Value::String(s)) if s.trim().is_empty() => Err(RecordError::MissingImei),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| RecordError::InvalidImei),
        Some(Value::Number(n)) => n.as_i64().ok_or(RecordError::InvalidImei),
        Some(_) => Err(RecordError::InvalidImei),
    }
}

/// Coerce string / int / float uniformly; empty string and null become None.
pub fn opt_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() { None } else { s.parse().ok() }
        }
        _ => None,
    }
}

/// Integer coercion routed through f64 so "12.0" parses as 12.
pub fn opt_i32(v: Option<&Value>) -> Option<i32> {
    opt_f64(v).map(|f| f as i32)
}

pub fn opt_i64(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
        }
        _ => None,
    }
}

pub fn opt_bool(v: Option<&Value>) -> Option<bool> {
    match v? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            if s.is_empty() {
                None
            } else {
                Some(matches!(s.as_str(), "true" | "1" | "yes" | "on"))
            }
        }
        _ => None,
    }
}

pub fn opt_str(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse the timestamp shapes the parsers emit: RFC3339 (with or without
/// fractional seconds), bare ISO, or `YYYY-MM-DD HH:MM:SS`. Result is naive
/// UTC, the representation every timestamp column stores.
pub fn opt_datetime(v: Option<&Value>) -> Option<NaiveDateTime> {
    let s = match v? {
        Value::String(s) => s.trim(),
        _ => return None,
    };
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coercion_handles_strings_and_empties() {
        assert_eq!(opt_f64(Some(&json!("12.5"))), Some(12.5));
        assert_eq!(opt_f64(Some(&json!(""))), None);
        assert_eq!(opt_f64(Some(&json!(7))), Some(7.0));
        assert_eq!(opt_i32(Some(&json!("12.0"))), Some(12));
        assert_eq!(opt_bool(Some(&json!("yes"))), Some(true));
        assert_eq!(opt_bool(Some(&json!(0))), Some(false));
        assert_eq!(opt_bool(None), None);
    }

    #[test]
    fn datetime_shapes() {
        let want = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        assert_eq!(opt_datetime(Some(&json!("2024-03-01T10:30:00Z"))), Some(want));
        assert_eq!(opt_datetime(Some(&json!("2024-03-01 10:30:00"))), Some(want));
        // Offset timestamps convert to UTC.
        assert_eq!(opt_datetime(Some(&json!("2024-03-01T15:30:00+05:00"))), Some(want));
        assert_eq!(opt_datetime(Some(&json!("garbage"))), None);
    }

    #[test]
    fn record_from_minimal_payload() {
        let data = json!({
            "imei": "352094081234567",
            "gps_time": "2024-03-01T10:30:00Z",
            "latitude": "31.5204",
            "longitude": 74.3587,
            "speed": "45",
            "fuel": ""
        });
        let rec = TrackRecord::from_payload(&data).unwrap();
        assert_eq!(rec.imei, 352094081234567);
        assert_eq!(rec.speed, 45);
        assert_eq!(rec.latitude, 31.5204);
        assert_eq!(rec.fuel, None);
        assert_eq!(rec.status, "Normal");
        assert_eq!(rec.validation_error(), None);
    }

    #[test]
    fn missing_and_invalid_imei() {
        assert_eq!(
            TrackRecord::from_payload(&json!({"latitude": 1.0})).unwrap_err(),
            RecordError::MissingImei
        );
        assert_eq!(
            TrackRecord::from_payload(&json!({"imei": "not-a-number"})).unwrap_err(),
            RecordError::InvalidImei
        );
        assert_eq!(
            TrackRecord::from_payload(&json!({"imei": ""})).unwrap_err(),
            RecordError::MissingImei
        );
    }

    #[test]
    fn validation_boundaries() {
        let mut rec = TrackRecord::from_payload(&json!({
            "imei": 100, "latitude": 10.0, "longitude": 20.0, "speed": 250
        }))
        .unwrap();
        assert_eq!(rec.validation_error(), None);

        rec.speed = 251;
        assert_eq!(rec.validation_error(), Some("invalid_speed_max"));
        rec.speed = -1;
        assert_eq!(rec.validation_error(), Some("invalid_speed_negative"));
        rec.speed = 0;
        rec.latitude = 90.0000001;
        assert_eq!(rec.validation_error(), Some("invalid_latitude"));
        rec.latitude = 0.0;
        rec.longitude = 0.0;
        assert_eq!(rec.validation_error(), Some("invalid_gps_zero"));
    }

    #[test]
    fn ignition_from_status_text() {
        let rec = TrackRecord::from_payload(&json!({
            "imei": 100, "latitude": 1.0, "longitude": 1.0, "status": "Ignition On"
        }))
        .unwrap();
        assert!(rec.ignition_on());
        let rec = TrackRecord::from_payload(&json!({
            "imei": 100, "latitude": 1.0, "longitude": 1.0, "ignition": "0", "status": "Ignition On"
        }))
        .unwrap();
        assert!(!rec.ignition_on());
    }

    #[test]
    fn sensor_coalesce_order() {
        let rec = TrackRecord::from_payload(&json!({
            "imei": 100, "latitude": 1.0, "longitude": 1.0,
            "dallas_temperature_2": "-5.5", "ble_temperature_1": 20.0,
            "ble_humidity_3": 55
        }))
        .unwrap();
        assert_eq!(rec.temperature(), Some(-5.5));
        assert_eq!(rec.humidity(), Some(55));
    }

    #[test]
    fn alarm_extras_clamp_priority() {
        let extras = AlarmExtras::from_payload(&json!({"priority": 15, "is_sms": "1"}));
        assert_eq!(extras.priority, 10);
        assert_eq!(extras.is_sms, 1);
        let extras = AlarmExtras::from_payload(&json!({"priority": -3}));
        assert_eq!(extras.priority, 0);
    }
}
