use chrono::NaiveDateTime;

pub const TRIP_TYPE_IGNITION: &str = "Ignition-Based";
pub const TRIP_TYPE_ROUTE: &str = "Route-Based";
pub const TRIP_TYPE_ROUND: &str = "Round-Trip";
pub const TRIP_TYPE_FENCE_WISE: &str = "Fence-Wise";

pub const TRIP_STATUS_ONGOING: &str = "Ongoing";
pub const TRIP_STATUS_COMPLETED: &str = "Completed";

/// A driving session. Extension rows hold the type-specific fields.
#[derive(Debug, Clone)]
pub struct Trip {
    pub trip_id: i64,
    pub vehicle_id: i64,
    pub trip_type: String,
    pub status: String,
    pub creation_mode: String,
    pub trip_start_time: NaiveDateTime,
    pub trip_end_time: Option<NaiveDateTime>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub total_distance_km: f64,
    pub total_duration_sec: i64,
    pub fuel_consumed: Option<f64>,
}

/// Active Fence-Wise trip as read by the fence-wise calculator.
#[derive(Debug, Clone)]
pub struct FenceWiseTrip {
    pub trip_id: i64,
    pub origin_fence_id: i64,
    pub destination_fence_id: i64,
    pub source_exit_time: Option<NaiveDateTime>,
    pub destination_arrival_time: Option<NaiveDateTime>,
}

/// Active Round-Trip with its destination monitoring state.
#[derive(Debug, Clone)]
pub struct RoundTrip {
    pub trip_id: i64,
    pub planned_fence_id: i64,
    pub destination_arrival_time: Option<NaiveDateTime>,
    pub destination_exit_time: Option<NaiveDateTime>,
}

/// Upload-sheet row whose start time has been reached.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub upload_id: i64,
    pub destination_fence_id: i64,
    pub start_ts: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct RouteAssignment {
    pub route_id: i64,
}

#[derive(Debug, Clone)]
pub struct ActiveRouteTrip {
    pub trip_id: i64,
    pub deviation_count: i32,
}

/// A stop detected during a trip, appended to `trip_stoppage_log`.
#[derive(Debug, Clone)]
pub struct StoppageEntry {
    pub trip_id: i64,
    pub stoppage_type: &'static str,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub inside_fence_id: Option<i64>,
}

/// Tracker row capability flags gating sensor calculators.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    pub imei: i64,
    pub vehicle_id: Option<i64>,
    pub has_fuel_sensor: bool,
    pub has_temp_sensor: bool,
    pub has_humidity_sensor: bool,
    pub has_seatbelt_sensor: bool,
    pub has_mdvr: bool,
}

impl Tracker {
    pub fn has_capability(&self, name: &str) -> bool {
        match name {
            "has_fuel_sensor" => self.has_fuel_sensor,
            "has_temp_sensor" => self.has_temp_sensor,
            "has_humidity_sensor" => self.has_humidity_sensor,
            "has_seatbelt_sensor" => self.has_seatbelt_sensor,
            "has_mdvr" => self.has_mdvr,
            _ => false,
        }
    }
}

/// Fence reference loaded for containment checks.
#[derive(Debug, Clone)]
pub struct FenceRef {
    pub fence_id: i64,
    pub buffer_distance_m: i32,
}
