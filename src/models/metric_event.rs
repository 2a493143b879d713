use chrono::NaiveDateTime;
use serde_json::Value;

// Event categories as stored in metric_events.event_category.
pub const CATEGORY_SPEED: &str = "Speed";
pub const CATEGORY_HARSH: &str = "Harsh";
pub const CATEGORY_FENCE: &str = "Fence";
pub const CATEGORY_FUEL: &str = "Fuel";
pub const CATEGORY_IDLE: &str = "Idle";
pub const CATEGORY_SENSOR: &str = "Sensor";
pub const CATEGORY_SEATBELT: &str = "Seatbelt";
pub const CATEGORY_DRIVING: &str = "Driving";
pub const CATEGORY_ROUTE: &str = "Route";

// Event types by category.
pub const EVENT_OVERSPEED: &str = "Overspeed";
pub const EVENT_IDLE_VIOLATION: &str = "Idle_Violation";
pub const EVENT_HARSH_BRAKE: &str = "Harsh_Brake";
pub const EVENT_HARSH_ACCEL: &str = "Harsh_Accel";
pub const EVENT_HARSH_CORNER: &str = "Harsh_Corner";
pub const EVENT_FENCE_ENTER: &str = "Fence_Enter";
pub const EVENT_FENCE_EXIT: &str = "Fence_Exit";
pub const EVENT_FUEL_FILL: &str = "Fuel_Fill";
pub const EVENT_FUEL_THEFT: &str = "Fuel_Theft";
pub const EVENT_TEMP_HIGH: &str = "Temp_High";
pub const EVENT_TEMP_LOW: &str = "Temp_Low";
pub const EVENT_HUMIDITY_HIGH: &str = "Humidity_High";
pub const EVENT_HUMIDITY_LOW: &str = "Humidity_Low";
pub const EVENT_SEATBELT_VIOLATION: &str = "Seatbelt_Violation";
pub const EVENT_CONTINUOUS_DRIVING: &str = "Continuous_Driving_Violation";
pub const EVENT_REST_TIME_VIOLATION: &str = "Rest_Time_Violation";
pub const EVENT_NIGHT_DRIVING: &str = "Night_Driving";
pub const EVENT_ROUTE_DEVIATION: &str = "Route_Deviation";

pub const ALL_CATEGORIES: &[&str] = &[
    CATEGORY_SPEED,
    CATEGORY_HARSH,
    CATEGORY_FENCE,
    CATEGORY_FUEL,
    CATEGORY_IDLE,
    CATEGORY_SENSOR,
    CATEGORY_SEATBELT,
    CATEGORY_DRIVING,
    CATEGORY_ROUTE,
];

/// A derived event produced by one calculator. Metadata always carries the
/// imei and gps_time so rows can be joined back to trackdata.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub imei: i64,
    pub gps_time: NaiveDateTime,
    pub event_category: &'static str,
    pub event_type: &'static str,
    pub event_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub duration_sec: Option<i64>,
    pub severity: &'static str,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fence_id: Option<i64>,
    pub trip_id: Option<i64>,
    pub metadata: serde_json::Map<String, Value>,
    pub formula_version: Option<&'static str>,
}

impl MetricEvent {
    pub fn new(
        imei: i64,
        gps_time: NaiveDateTime,
        category: &'static str,
        event_type: &'static str,
    ) -> Self {
        Self {
            imei,
            gps_time,
            event_category: category,
            event_type,
            event_value: None,
            threshold_value: None,
            duration_sec: None,
            severity: "Medium",
            latitude: None,
            longitude: None,
            fence_id: None,
            trip_id: None,
            metadata: serde_json::Map::new(),
            formula_version: None,
        }
    }

    pub fn with_value(mut self, v: f64) -> Self {
        self.event_value = Some(v);
        self
    }

    pub fn with_threshold(mut self, v: f64) -> Self {
        self.threshold_value = Some(v);
        self
    }

    pub fn with_duration(mut self, secs: i64) -> Self {
        self.duration_sec = Some(secs);
        self
    }

    pub fn with_severity(mut self, s: &'static str) -> Self {
        self.severity = s;
        self
    }

    pub fn at(mut self, lat: Option<f64>, lon: Option<f64>) -> Self {
        self.latitude = lat;
        self.longitude = lon;
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Metadata as stored, with the imei/gps_time join keys stamped in.
    pub fn metadata_json(&self) -> Value {
        let mut meta = self.metadata.clone();
        meta.insert("imei".to_string(), Value::from(self.imei));
        meta.insert(
            "gps_time".to_string(),
            Value::from(self.gps_time.format("%Y-%m-%dT%H:%M:%S").to_string()),
        );
        Value::Object(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn metadata_always_carries_join_keys() {
        let t = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 30).unwrap();
        let ev = MetricEvent::new(100, t, CATEGORY_SPEED, EVENT_OVERSPEED)
            .with_meta("road_type", Value::from("Highway"));
        let meta = ev.metadata_json();
        assert_eq!(meta["imei"], Value::from(100));
        assert_eq!(meta["gps_time"], Value::from("2024-03-01T10:00:30"));
        assert_eq!(meta["road_type"], Value::from("Highway"));
    }
}
