use chrono::NaiveDateTime;

/// Vehicle state machine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleState {
    Moving,
    Idle,
    Stopped,
    NotResponding,
}

impl VehicleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleState::Moving => "moving",
            VehicleState::Idle => "idle",
            VehicleState::Stopped => "stopped",
            VehicleState::NotResponding => "not_responding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "moving" => Some(VehicleState::Moving),
            "idle" => Some(VehicleState::Idle),
            "stopped" => Some(VehicleState::Stopped),
            "not_responding" => Some(VehicleState::NotResponding),
            _ => None,
        }
    }
}

/// Engine-owned columns of the `laststatus` row. The consumer never touches
/// these, and the engine never touches the consumer's mirror columns.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub vehicle_state: Option<VehicleState>,
    pub last_processed_gps_time: Option<NaiveDateTime>,
    pub idle_start_time: Option<NaiveDateTime>,
    pub speeding_start_time: Option<NaiveDateTime>,
    pub speeding_max_speed: Option<i32>,
    pub last_violation_time: Option<NaiveDateTime>,
    pub last_violation_type: Option<String>,
    pub temp_violation_start: Option<NaiveDateTime>,
    pub humidity_violation_start: Option<NaiveDateTime>,
    pub prev_temp_value: Option<f64>,
    pub prev_fuel_level: Option<f64>,
    pub trip_in_progress: bool,
    pub current_trip_id: Option<i64>,
    pub current_fence_ids: Vec<i64>,
    pub driving_session_start: Option<NaiveDateTime>,
    pub driving_session_distance: Option<f64>,
    pub rest_start_time: Option<NaiveDateTime>,
    pub seatbelt_unbuckled_start: Option<NaiveDateTime>,
    pub seatbelt_unbuckled_distance: Option<f64>,
    pub stoppage_start_time: Option<NaiveDateTime>,
    pub stoppage_start_lat: Option<f64>,
    pub stoppage_start_lon: Option<f64>,
    pub last_distance_km: Option<f64>,
}

/// What the pipeline reads before running calculators: the engine state plus
/// the last observed position/time from the consumer columns.
#[derive(Debug, Clone, Default)]
pub struct PriorState {
    pub exists: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub gps_time: Option<NaiveDateTime>,
    pub server_time: Option<NaiveDateTime>,
    pub engine: EngineState,
}

/// One field's pending change. `Keep` leaves the column alone so concurrent
/// calculators only write what they own.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }

    pub fn take_over(&mut self, other: Patch<T>) {
        if !other.is_keep() {
            *self = other;
        }
    }

    pub fn apply_to(&self, slot: &mut Option<T>)
    where
        T: Clone,
    {
        match self {
            Patch::Keep => {}
            Patch::Set(v) => *slot = Some(v.clone()),
            Patch::Clear => *slot = None,
        }
    }
}

/// Trip lifecycle transition detected by the ignition-trip calculator and
/// resolved by the pipeline in a single DB step.
#[derive(Debug, Clone, PartialEq)]
pub enum TripAction {
    Start { time: NaiveDateTime, lat: Option<f64>, lon: Option<f64> },
    End { time: NaiveDateTime, lat: Option<f64>, lon: Option<f64> },
}

/// Accumulated engine-column updates from one calculator chain run.
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub vehicle_state: Patch<VehicleState>,
    pub idle_start_time: Patch<NaiveDateTime>,
    pub speeding_start_time: Patch<NaiveDateTime>,
    pub speeding_max_speed: Patch<i32>,
    pub last_violation_time: Patch<NaiveDateTime>,
    pub last_violation_type: Patch<String>,
    pub temp_violation_start: Patch<NaiveDateTime>,
    pub humidity_violation_start: Patch<NaiveDateTime>,
    pub prev_temp_value: Patch<f64>,
    pub prev_fuel_level: Patch<f64>,
    pub trip_in_progress: Patch<bool>,
    pub current_trip_id: Patch<i64>,
    pub current_fence_ids: Patch<Vec<i64>>,
    pub driving_session_start: Patch<NaiveDateTime>,
    pub driving_session_distance: Patch<f64>,
    pub rest_start_time: Patch<NaiveDateTime>,
    pub seatbelt_unbuckled_start: Patch<NaiveDateTime>,
    pub seatbelt_unbuckled_distance: Patch<f64>,
    pub stoppage_start_time: Patch<NaiveDateTime>,
    pub stoppage_start_lat: Patch<f64>,
    pub stoppage_start_lon: Patch<f64>,
    pub last_distance_km: Patch<f64>,
    pub trip_action: Option<TripAction>,
}

impl StateDelta {
    /// Later calculators win on conflicting fields, matching chain order.
    pub fn merge(&mut self, other: StateDelta) {
        self.vehicle_state.take_over(other.vehicle_state);
        self.idle_start_time.take_over(other.idle_start_time);
        self.speeding_start_time.take_over(other.speeding_start_time);
        self.speeding_max_speed.take_over(other.speeding_max_speed);
        self.last_violation_time.take_over(other.last_violation_time);
        self.last_violation_type.take_over(other.last_violation_type);
        self.temp_violation_start.take_over(other.temp_violation_start);
        self.humidity_violation_start.take_over(other.humidity_violation_start);
        self.prev_temp_value.take_over(other.prev_temp_value);
        self.prev_fuel_level.take_over(other.prev_fuel_level);
        self.trip_in_progress.take_over(other.trip_in_progress);
        self.current_trip_id.take_over(other.current_trip_id);
        self.current_fence_ids.take_over(other.current_fence_ids);
        self.driving_session_start.take_over(other.driving_session_start);
        self.driving_session_distance.take_over(other.driving_session_distance);
        self.rest_start_time.take_over(other.rest_start_time);
        self.seatbelt_unbuckled_start.take_over(other.seatbelt_unbuckled_start);
        self.seatbelt_unbuckled_distance.take_over(other.seatbelt_unbuckled_distance);
        self.stoppage_start_time.take_over(other.stoppage_start_time);
        self.stoppage_start_lat.take_over(other.stoppage_start_lat);
        self.stoppage_start_lon.take_over(other.stoppage_start_lon);
        self.last_distance_km.take_over(other.last_distance_km);
        if other.trip_action.is_some() {
            self.trip_action = other.trip_action;
        }
    }

    /// Replay the delta onto an in-memory state; used by recalculation so
    /// history replays never touch the live laststatus row.
    pub fn apply_to(&self, state: &mut EngineState) {
        if let Patch::Set(v) = &self.vehicle_state {
            state.vehicle_state = Some(*v);
        } else if self.vehicle_state == Patch::Clear {
            state.vehicle_state = None;
        }
        self.idle_start_time.apply_to(&mut state.idle_start_time);
        self.speeding_start_time.apply_to(&mut state.speeding_start_time);
        self.speeding_max_speed.apply_to(&mut state.speeding_max_speed);
        self.last_violation_time.apply_to(&mut state.last_violation_time);
        self.last_violation_type.apply_to(&mut state.last_violation_type);
        self.temp_violation_start.apply_to(&mut state.temp_violation_start);
        self.humidity_violation_start.apply_to(&mut state.humidity_violation_start);
        self.prev_temp_value.apply_to(&mut state.prev_temp_value);
        self.prev_fuel_level.apply_to(&mut state.prev_fuel_level);
        match &self.trip_in_progress {
            Patch::Keep => {}
            Patch::Set(v) => state.trip_in_progress = *v,
            Patch::Clear => state.trip_in_progress = false,
        }
        self.current_trip_id.apply_to(&mut state.current_trip_id);
        match &self.current_fence_ids {
            Patch::Keep => {}
            Patch::Set(v) => state.current_fence_ids = v.clone(),
            Patch::Clear => state.current_fence_ids.clear(),
        }
        self.driving_session_start.apply_to(&mut state.driving_session_start);
        self.driving_session_distance.apply_to(&mut state.driving_session_distance);
        self.rest_start_time.apply_to(&mut state.rest_start_time);
        self.seatbelt_unbuckled_start.apply_to(&mut state.seatbelt_unbuckled_start);
        self.seatbelt_unbuckled_distance.apply_to(&mut state.seatbelt_unbuckled_distance);
        self.stoppage_start_time.apply_to(&mut state.stoppage_start_time);
        self.stoppage_start_lat.apply_to(&mut state.stoppage_start_lat);
        self.stoppage_start_lon.apply_to(&mut state.stoppage_start_lon);
        self.last_distance_km.apply_to(&mut state.last_distance_km);
    }

    pub fn is_empty(&self) -> bool {
        self.vehicle_state.is_keep()
            && self.idle_start_time.is_keep()
            && self.speeding_start_time.is_keep()
            && self.speeding_max_speed.is_keep()
            && self.last_violation_time.is_keep()
            && self.last_violation_type.is_keep()
            && self.temp_violation_start.is_keep()
            && self.humidity_violation_start.is_keep()
            && self.prev_temp_value.is_keep()
            && self.prev_fuel_level.is_keep()
            && self.trip_in_progress.is_keep()
            && self.current_trip_id.is_keep()
            && self.current_fence_ids.is_keep()
            && self.driving_session_start.is_keep()
            && self.driving_session_distance.is_keep()
            && self.rest_start_time.is_keep()
            && self.seatbelt_unbuckled_start.is_keep()
            && self.seatbelt_unbuckled_distance.is_keep()
            && self.stoppage_start_time.is_keep()
            && self.stoppage_start_lat.is_keep()
            && self.stoppage_start_lon.is_keep()
            && self.last_distance_km.is_keep()
            && self.trip_action.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn merge_later_wins() {
        let mut a = StateDelta { speeding_max_speed: Patch::Set(80), ..Default::default() };
        let b = StateDelta {
            speeding_max_speed: Patch::Set(95),
            idle_start_time: Patch::Set(ts(10, 0, 0)),
            ..Default::default()
        };
        a.merge(b);
        assert_eq!(a.speeding_max_speed, Patch::Set(95));
        assert_eq!(a.idle_start_time, Patch::Set(ts(10, 0, 0)));
    }

    #[test]
    fn merge_keep_does_not_clobber() {
        let mut a = StateDelta { speeding_max_speed: Patch::Set(80), ..Default::default() };
        a.merge(StateDelta::default());
        assert_eq!(a.speeding_max_speed, Patch::Set(80));
    }

    #[test]
    fn apply_set_and_clear() {
        let mut state = EngineState {
            idle_start_time: Some(ts(9, 0, 0)),
            trip_in_progress: true,
            ..Default::default()
        };
        let delta = StateDelta {
            idle_start_time: Patch::Clear,
            trip_in_progress: Patch::Set(false),
            current_trip_id: Patch::Clear,
            vehicle_state: Patch::Set(VehicleState::Stopped),
            ..Default::default()
        };
        delta.apply_to(&mut state);
        assert_eq!(state.idle_start_time, None);
        assert!(!state.trip_in_progress);
        assert_eq!(state.vehicle_state, Some(VehicleState::Stopped));
    }

    #[test]
    fn empty_delta_detection() {
        assert!(StateDelta::default().is_empty());
        let d = StateDelta { prev_fuel_level: Patch::Set(10.0), ..Default::default() };
        assert!(!d.is_empty());
    }
}
