use async_trait::async_trait;
use chrono::Utc;

use super::{Calculator, Category};
use crate::engine::context::{CalcContext, CalcOutcome};
use crate::models::laststatus::{Patch, StateDelta, VehicleState};

pub const EARTH_RADIUS_KM: f64 = 6371.0;
const MAX_POINT_DISTANCE_KM: f64 = 10.0;

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) =
        (lat1.to_radians(), lon1.to_radians(), lat2.to_radians(), lon2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().min(1.0).asin()
}

/// State machine: moving / idle / stopped / not_responding.
pub struct VehicleStateCalc;

#[async_trait]
impl Calculator for VehicleStateCalc {
    fn name(&self) -> &'static str {
        "vehicle_state"
    }

    fn category(&self) -> Category {
        Category::Core
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["NR_THRESHOLD", "IDLE_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let nr_secs = ctx.config.get_i64("NR_THRESHOLD", 86_400);
        let ignition = ctx.record.ignition_on();
        let speed = ctx.record.speed;

        let last_update = ctx.prev.server_time.or(ctx.prev.gps_time);
        let secs_since = last_update
            .map(|t| (Utc::now().naive_utc() - t).num_seconds())
            .unwrap_or(0);

        let new_state = if secs_since > nr_secs {
            VehicleState::NotResponding
        } else if !ignition {
            VehicleState::Stopped
        } else if speed > 0 {
            VehicleState::Moving
        } else {
            VehicleState::Idle
        };

        Ok(CalcOutcome {
            delta: StateDelta { vehicle_state: Patch::Set(new_state), ..Default::default() },
            ..Default::default()
        })
    }
}

/// Haversine segment distance with GPS-glitch filtering.
pub struct DistanceCalc;

#[async_trait]
impl Calculator for DistanceCalc {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn category(&self) -> Category {
        Category::Core
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["MAX_SPEED_FILTER"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let max_speed = ctx.config.get_i64("MAX_SPEED_FILTER", 200) as i32;
        let (Some(prev_lat), Some(prev_lon)) = (ctx.prev.latitude, ctx.prev.longitude) else {
            return Ok(CalcOutcome::default());
        };
        let dist_km = haversine_km(prev_lat, prev_lon, ctx.record.latitude, ctx.record.longitude);
        if ctx.record.speed <= 0 || ctx.record.speed >= max_speed || dist_km >= MAX_POINT_DISTANCE_KM {
            return Ok(CalcOutcome::default());
        }
        Ok(CalcOutcome {
            delta: StateDelta { last_distance_km: Patch::Set(dist_km), ..Default::default() },
            ..Default::default()
        })
    }
}

/// Speed has no state of its own; the violation calculator reads the record
/// directly. Present so the chain mirrors the metric catalog one-to-one.
pub struct SpeedCalc;

#[async_trait]
impl Calculator for SpeedCalc {
    fn name(&self) -> &'static str {
        "speed"
    }

    fn category(&self) -> Category {
        Category::Core
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["MAX_SPEED_FILTER"]
    }

    async fn calculate(&self, _ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        Ok(CalcOutcome::default())
    }
}

/// Tracks idle_start_time: set when entering idle (ignition on, speed 0),
/// cleared otherwise.
pub struct DurationCalc;

#[async_trait]
impl Calculator for DurationCalc {
    fn name(&self) -> &'static str {
        "duration"
    }

    fn category(&self) -> Category {
        Category::Core
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["IDLE_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let mut delta = StateDelta::default();
        if ctx.record.ignition_on() && ctx.record.speed == 0 {
            if ctx.prev.engine.idle_start_time.is_none() {
                delta.idle_start_time = Patch::Set(ctx.gps_time);
            }
        } else if ctx.prev.engine.idle_start_time.is_some() {
            delta.idle_start_time = Patch::Clear;
        }
        Ok(CalcOutcome { delta, ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{ctx, record, state_with};
    use crate::models::laststatus::PriorState;

    #[test]
    fn haversine_known_distance() {
        // Lahore to Islamabad is roughly 270 km great-circle.
        let d = haversine_km(31.5204, 74.3587, 33.6844, 73.0479);
        assert!((d - 270.0).abs() < 15.0, "got {d}");
        assert!(haversine_km(31.5, 74.3, 31.5, 74.3) < 1e-9);
    }

    #[tokio::test]
    async fn vehicle_state_transitions() {
        let calc = VehicleStateCalc;

        let rec = record(100, "10:00:00", |r| {
            r.speed = 40;
            r.ignition = Some(true);
        });
        let prior = state_with(|_s| {});
        let out = calc.calculate(&ctx(&rec, &prior)).await.unwrap();
        assert_eq!(out.delta.vehicle_state, Patch::Set(VehicleState::Moving));

        let rec = record(100, "10:00:00", |r| {
            r.speed = 0;
            r.ignition = Some(true);
        });
        let out = calc.calculate(&ctx(&rec, &prior)).await.unwrap();
        assert_eq!(out.delta.vehicle_state, Patch::Set(VehicleState::Idle));

        let rec = record(100, "10:00:00", |r| {
            r.speed = 0;
            r.ignition = Some(false);
        });
        let out = calc.calculate(&ctx(&rec, &prior)).await.unwrap();
        assert_eq!(out.delta.vehicle_state, Patch::Set(VehicleState::Stopped));
    }

    #[tokio::test]
    async fn distance_filters_glitches() {
        let calc = DistanceCalc;
        let mut prior = PriorState::default();
        prior.latitude = Some(31.5204);
        prior.longitude = Some(74.3587);

        // Normal segment.
        let rec = record(100, "10:00:10", |r| {
            r.latitude = 31.5300;
            r.longitude = 74.3600;
            r.speed = 40;
        });
        let out = calc.calculate(&ctx(&rec, &prior)).await.unwrap();
        assert!(matches!(out.delta.last_distance_km, Patch::Set(d) if d > 0.0 && d < 2.0));

        // Zero speed drops the segment.
        let rec = record(100, "10:00:10", |r| {
            r.latitude = 31.5300;
            r.longitude = 74.3600;
            r.speed = 0;
        });
        let out = calc.calculate(&ctx(&rec, &prior)).await.unwrap();
        assert!(out.delta.last_distance_km.is_keep());

        // A 10km+ jump is a GPS glitch.
        let rec = record(100, "10:00:10", |r| {
            r.latitude = 32.9;
            r.longitude = 74.3587;
            r.speed = 40;
        });
        let out = calc.calculate(&ctx(&rec, &prior)).await.unwrap();
        assert!(out.delta.last_distance_km.is_keep());
    }

    #[tokio::test]
    async fn duration_sets_and_clears_idle_start() {
        let calc = DurationCalc;
        let rec = record(100, "10:00:00", |r| {
            r.speed = 0;
            r.ignition = Some(true);
        });
        let prior = state_with(|_s| {});
        let out = calc.calculate(&ctx(&rec, &prior)).await.unwrap();
        assert_eq!(out.delta.idle_start_time, Patch::Set(rec.gps_time));

        let prior = state_with(|s| s.idle_start_time = Some(rec.gps_time));
        let moving = record(100, "10:05:00", |r| {
            r.speed = 30;
            r.ignition = Some(true);
        });
        let out = calc.calculate(&ctx(&moving, &prior)).await.unwrap();
        assert_eq!(out.delta.idle_start_time, Patch::Clear);
    }
}
