use async_trait::async_trait;

use super::{Calculator, Category};
use crate::engine::context::{CalcContext, CalcOutcome};
use crate::models::laststatus::{Patch, StateDelta, TripAction};
use crate::models::trip::StoppageEntry;

/// Ignition-based trips. The calculator only flags the transition; the
/// pipeline performs the trip insert/completion and rewrites
/// current_trip_id / trip_in_progress in one DB step.
pub struct IgnitionTripCalc;

#[async_trait]
impl Calculator for IgnitionTripCalc {
    fn name(&self) -> &'static str {
        "ignition_trip"
    }

    fn category(&self) -> Category {
        Category::Trip
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let mut delta = StateDelta::default();
        let lat = Some(ctx.record.latitude);
        let lon = Some(ctx.record.longitude);
        if ctx.record.status_contains("Ignition On") && !ctx.prev.engine.trip_in_progress {
            delta.trip_action = Some(TripAction::Start { time: ctx.gps_time, lat, lon });
        } else if ctx.record.status_contains("Ignition Off") && ctx.prev.engine.trip_in_progress {
            delta.trip_action = Some(TripAction::End { time: ctx.gps_time, lat, lon });
            delta.trip_in_progress = Patch::Set(false);
            delta.current_trip_id = Patch::Clear;
        }
        Ok(CalcOutcome { delta, ..Default::default() })
    }
}

/// Stop detection during an active trip: speed 0 opens a candidate stop,
/// movement closes it, and stops at least STOP_THRESHOLD long are logged.
pub struct StoppageCalc;

#[async_trait]
impl Calculator for StoppageCalc {
    fn name(&self) -> &'static str {
        "stoppage"
    }

    fn category(&self) -> Category {
        Category::Trip
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["STOP_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let mut delta = StateDelta::default();
        let mut stoppages = Vec::new();

        let Some(trip_id) = ctx.prev.engine.current_trip_id else {
            if ctx.prev.engine.stoppage_start_time.is_some() {
                delta.stoppage_start_time = Patch::Clear;
                delta.stoppage_start_lat = Patch::Clear;
                delta.stoppage_start_lon = Patch::Clear;
            }
            return Ok(CalcOutcome { delta, ..Default::default() });
        };

        let stop_threshold = ctx.config.get_i64("STOP_THRESHOLD", 60);
        if ctx.record.speed == 0 {
            if ctx.prev.engine.stoppage_start_time.is_none() {
                delta.stoppage_start_time = Patch::Set(ctx.gps_time);
                delta.stoppage_start_lat = Patch::Set(ctx.record.latitude);
                delta.stoppage_start_lon = Patch::Set(ctx.record.longitude);
            }
        } else if let Some(start) = ctx.prev.engine.stoppage_start_time {
            if ctx.secs_since(start) >= stop_threshold {
                stoppages.push(StoppageEntry {
                    trip_id,
                    stoppage_type: "Stop",
                    start_time: start,
                    end_time: ctx.gps_time,
                    latitude: ctx.prev.engine.stoppage_start_lat,
                    longitude: ctx.prev.engine.stoppage_start_lon,
                    inside_fence_id: None,
                });
            }
            delta.stoppage_start_time = Patch::Clear;
            delta.stoppage_start_lat = Patch::Clear;
            delta.stoppage_start_lon = Patch::Clear;
        }
        Ok(CalcOutcome { delta, stoppages, ..Default::default() })
    }
}

/// Fence-wise trips: record the origin exit, complete on destination entry.
pub struct FenceWiseTripCalc;

#[async_trait]
impl Calculator for FenceWiseTripCalc {
    fn name(&self) -> &'static str {
        "fence_wise_trip"
    }

    fn category(&self) -> Category {
        Category::Trip
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let (Some(db), Some(vehicle_id)) = (ctx.db, ctx.vehicle_id) else {
            return Ok(CalcOutcome::default());
        };
        let trips = db.active_fence_wise_trips(vehicle_id).await.unwrap_or_default();
        if trips.is_empty() {
            return Ok(CalcOutcome::default());
        }
        let lat = ctx.record.latitude;
        let lon = ctx.record.longitude;
        let prev_fences = &ctx.prev.engine.current_fence_ids;
        let mut delta = StateDelta::default();

        for trip in trips {
            let was_in_origin = prev_fences.contains(&trip.origin_fence_id);
            let in_origin = db.point_in_fence_simple(trip.origin_fence_id, lat, lon).await.unwrap_or(false);
            let in_dest = db
                .point_in_fence_simple(trip.destination_fence_id, lat, lon)
                .await
                .unwrap_or(false);

            if trip.source_exit_time.is_none() && was_in_origin && !in_origin {
                db.set_fence_wise_source_exit(trip.trip_id, ctx.gps_time).await?;
            }
            if trip.destination_arrival_time.is_none() && in_dest {
                db.set_fence_wise_destination_arrival(trip.trip_id, ctx.gps_time).await?;
                db.complete_trip(trip.trip_id, ctx.gps_time, Some(lat), Some(lon)).await?;
                if ctx.prev.engine.current_trip_id == Some(trip.trip_id) {
                    delta.trip_in_progress = Patch::Set(false);
                    delta.current_trip_id = Patch::Clear;
                }
            }
        }
        Ok(CalcOutcome { delta, ..Default::default() })
    }
}

/// Round trips from the upload sheet: create at the planned start time,
/// track destination dwell, grade time compliance on exit.
pub struct RoundTripCalc;

#[async_trait]
impl Calculator for RoundTripCalc {
    fn name(&self) -> &'static str {
        "round_trip"
    }

    fn category(&self) -> Category {
        Category::Trip
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["TIME_COMPLIANCE_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let (Some(db), Some(vehicle_id)) = (ctx.db, ctx.vehicle_id) else {
            return Ok(CalcOutcome::default());
        };
        let lat = ctx.record.latitude;
        let lon = ctx.record.longitude;
        let mut delta = StateDelta::default();

        if ctx.prev.engine.current_trip_id.is_none() {
            if let Some(upload) = db.pending_upload(vehicle_id).await.unwrap_or(None) {
                let trip_id = db.create_round_trip(vehicle_id, &upload, lat, lon).await?;
                delta.trip_in_progress = Patch::Set(true);
                delta.current_trip_id = Patch::Set(trip_id);
                return Ok(CalcOutcome { delta, ..Default::default() });
            }
        }

        let prev_fences = &ctx.prev.engine.current_fence_ids;
        for trip in db.active_round_trips(vehicle_id).await.unwrap_or_default() {
            let in_dest = db
                .point_in_fence_simple(trip.planned_fence_id, lat, lon)
                .await
                .unwrap_or(false);
            let was_in_dest = prev_fences.contains(&trip.planned_fence_id);

            match trip.destination_arrival_time {
                None if in_dest => {
                    db.set_round_trip_arrival(trip.trip_id, ctx.gps_time).await?;
                }
                Some(arrived) if was_in_dest && !in_dest => {
                    let threshold = ctx.config.get_i64("TIME_COMPLIANCE_THRESHOLD", 900);
                    let inside_secs = ctx.secs_since(arrived);
                    let compliance = if inside_secs >= threshold { "Compliant" } else { "Non-Compliant" };
                    db.finish_round_trip(trip.trip_id, ctx.gps_time, compliance).await?;
                    db.complete_trip(trip.trip_id, ctx.gps_time, Some(lat), Some(lon)).await?;
                    if ctx.prev.engine.current_trip_id == Some(trip.trip_id) {
                        delta.trip_in_progress = Patch::Set(false);
                        delta.current_trip_id = Patch::Clear;
                    }
                }
                _ => {}
            }
        }
        Ok(CalcOutcome { delta, ..Default::default() })
    }
}

/// Route-based trips: created when the vehicle is on its assigned route,
/// completed as Deviated when it leaves.
pub struct RouteTripCalc;

#[async_trait]
impl Calculator for RouteTripCalc {
    fn name(&self) -> &'static str {
        "route_trip"
    }

    fn category(&self) -> Category {
        Category::Trip
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["DEVIATION_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let (Some(db), Some(vehicle_id)) = (ctx.db, ctx.vehicle_id) else {
            return Ok(CalcOutcome::default());
        };
        let Some(assignment) = db.route_assignment_for_vehicle(vehicle_id).await.unwrap_or(None) else {
            return Ok(CalcOutcome::default());
        };
        let threshold_m = ctx.config.get_f64("DEVIATION_THRESHOLD", 500.0);
        let lat = ctx.record.latitude;
        let lon = ctx.record.longitude;

        let on_route = db
            .point_on_route(assignment.route_id, lat, lon, threshold_m)
            .await
            .unwrap_or(false);
        let current = db.active_route_trip(vehicle_id).await.unwrap_or(None);
        let mut delta = StateDelta::default();

        if on_route {
            if current.is_none() {
                let trip_id = db
                    .create_route_trip(vehicle_id, assignment.route_id, ctx.gps_time, lat, lon)
                    .await?;
                delta.trip_in_progress = Patch::Set(true);
                delta.current_trip_id = Patch::Set(trip_id);
            }
        } else if let Some(trip) = current {
            db.set_route_trip_deviated(trip.trip_id, trip.deviation_count + 1).await?;
            db.complete_trip(trip.trip_id, ctx.gps_time, Some(lat), Some(lon)).await?;
            if ctx.prev.engine.current_trip_id == Some(trip.trip_id) {
                delta.trip_in_progress = Patch::Set(false);
                delta.current_trip_id = Patch::Clear;
            }
        }
        Ok(CalcOutcome { delta, ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{config, ctx_with, record, state_with, ts};

    #[tokio::test]
    async fn ignition_on_flags_trip_start() {
        let calc = IgnitionTripCalc;
        let cfg = config(&[]);
        let rec = record(100, "08:00:00", |r| r.status = "Ignition On".to_string());
        let prior = state_with(|_| {});
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(matches!(out.delta.trip_action, Some(TripAction::Start { time, .. }) if time == ts("08:00:00")));

        // Already in a trip: a repeated Ignition On does nothing.
        let prior = state_with(|s| s.trip_in_progress = true);
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.delta.trip_action.is_none());
    }

    #[tokio::test]
    async fn ignition_off_flags_trip_end_and_clears_state() {
        let calc = IgnitionTripCalc;
        let cfg = config(&[]);
        let rec = record(100, "09:00:00", |r| r.status = "Ignition Off".to_string());
        let prior = state_with(|s| {
            s.trip_in_progress = true;
            s.current_trip_id = Some(7);
        });
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(matches!(out.delta.trip_action, Some(TripAction::End { .. })));
        assert_eq!(out.delta.trip_in_progress, Patch::Set(false));
        assert_eq!(out.delta.current_trip_id, Patch::Clear);
    }

    #[tokio::test]
    async fn stoppage_logged_only_past_threshold() {
        let calc = StoppageCalc;
        let cfg = config(&[("STOP_THRESHOLD", "60")]);

        // Standing still starts a candidate stop.
        let rec = record(100, "10:00:00", |r| r.speed = 0);
        let prior = state_with(|s| s.current_trip_id = Some(3));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.delta.stoppage_start_time, Patch::Set(ts("10:00:00")));
        assert!(out.stoppages.is_empty());

        // Moving again after 90s: one Stop entry.
        let rec = record(100, "10:01:30", |r| r.speed = 25);
        let prior = state_with(|s| {
            s.current_trip_id = Some(3);
            s.stoppage_start_time = Some(ts("10:00:00"));
            s.stoppage_start_lat = Some(31.5204);
            s.stoppage_start_lon = Some(74.3587);
        });
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.stoppages.len(), 1);
        assert_eq!(out.stoppages[0].trip_id, 3);
        assert_eq!(out.delta.stoppage_start_time, Patch::Clear);

        // A 30s pause is under the threshold and not logged.
        let rec = record(100, "10:00:30", |r| r.speed = 25);
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.stoppages.is_empty());
        assert_eq!(out.delta.stoppage_start_time, Patch::Clear);
    }

    #[tokio::test]
    async fn stoppage_state_clears_without_active_trip() {
        let calc = StoppageCalc;
        let cfg = config(&[]);
        let rec = record(100, "10:00:00", |r| r.speed = 0);
        let prior = state_with(|s| s.stoppage_start_time = Some(ts("09:59:00")));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.delta.stoppage_start_time, Patch::Clear);
    }
}
