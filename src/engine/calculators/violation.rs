use async_trait::async_trait;
use serde_json::Value;

use super::{Calculator, Category};
use crate::engine::context::{CalcContext, CalcOutcome};
use crate::models::laststatus::{Patch, StateDelta};
use crate::models::metric_event::{
    CATEGORY_DRIVING, CATEGORY_HARSH, CATEGORY_IDLE, CATEGORY_SEATBELT, CATEGORY_SPEED,
    EVENT_CONTINUOUS_DRIVING, EVENT_HARSH_ACCEL, EVENT_HARSH_BRAKE, EVENT_HARSH_CORNER,
    EVENT_IDLE_VIOLATION, EVENT_NIGHT_DRIVING, EVENT_OVERSPEED, EVENT_REST_TIME_VIOLATION,
    EVENT_SEATBELT_VIOLATION, MetricEvent,
};

fn limit_for_road_type(config: &crate::infra::config_cache::DeviceConfig, road_type: Option<&str>) -> i64 {
    let key = match road_type {
        Some("Intracity") => Some("SPEED_LIMIT_CITY"),
        Some("Highway") => Some("SPEED_LIMIT_HIGHWAY"),
        Some("Motorway") => Some("SPEED_LIMIT_MOTORWAY"),
        _ => None,
    };
    if let Some(key) = key {
        if let Some(v) = config.get(key).and_then(|v| v.trim().parse::<i64>().ok()) {
            return v;
        }
    }
    let city = config.get_i64("SPEED_LIMIT_CITY", 60);
    let highway = config.get_i64("SPEED_LIMIT_HIGHWAY", 100);
    let motorway = config.get_i64("SPEED_LIMIT_MOTORWAY", 120);
    city.max(highway).max(motorway)
}

/// Overspeed: speed above the road (or config) limit for MIN_DURATION_SPEED.
pub struct SpeedViolationCalc;

#[async_trait]
impl Calculator for SpeedViolationCalc {
    fn name(&self) -> &'static str {
        "speed_violation"
    }

    fn category(&self) -> Category {
        Category::Violation
    }

    fn formula_version(&self) -> &'static str {
        "1.1.0"
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["SPEED_LIMIT_CITY", "SPEED_LIMIT_HIGHWAY", "SPEED_LIMIT_MOTORWAY", "MIN_DURATION_SPEED"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        // Road-type limit beats config when the position matches a road.
        let road = match ctx.db {
            Some(db) => db
                .road_speed_limit(ctx.record.latitude, ctx.record.longitude)
                .await
                .unwrap_or_default(),
            None => None,
        };
        let road_type = road.as_ref().map(|r| r.road_type.clone());
        let limit = match road.as_ref().and_then(|r| r.speed_limit) {
            Some(l) => l as i64,
            None => limit_for_road_type(ctx.config, road_type.as_deref()),
        };
        let min_duration = ctx.config.get_i64("MIN_DURATION_SPEED", 30);
        let speed = ctx.record.speed as i64;

        let mut delta = StateDelta::default();
        let mut events = Vec::new();
        if speed > limit {
            match ctx.prev.engine.speeding_start_time {
                None => {
                    delta.speeding_start_time = Patch::Set(ctx.gps_time);
                    delta.speeding_max_speed = Patch::Set(ctx.record.speed);
                }
                Some(start) => {
                    let duration = ctx.secs_since(start);
                    let prev_max = ctx.prev.engine.speeding_max_speed.unwrap_or(0);
                    delta.speeding_max_speed = Patch::Set(prev_max.max(ctx.record.speed));
                    if duration >= min_duration {
                        let mut ev = MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_SPEED, EVENT_OVERSPEED)
                            .with_value(speed as f64)
                            .with_threshold(limit as f64)
                            .with_duration(duration)
                            .at(Some(ctx.record.latitude), Some(ctx.record.longitude));
                        if let Some(rt) = &road_type {
                            ev = ev.with_meta("road_type", Value::from(rt.clone()));
                        }
                        events.push(ev);
                        delta.last_violation_time = Patch::Set(ctx.gps_time);
                        delta.last_violation_type = Patch::Set(EVENT_OVERSPEED.to_string());
                    }
                }
            }
        } else if ctx.prev.engine.speeding_start_time.is_some() {
            delta.speeding_start_time = Patch::Clear;
            delta.speeding_max_speed = Patch::Clear;
        }
        Ok(CalcOutcome { delta, events, ..Default::default() })
    }
}

/// Idle duration past IDLE_MAX.
pub struct IdleViolationCalc;

#[async_trait]
impl Calculator for IdleViolationCalc {
    fn name(&self) -> &'static str {
        "idle_violation"
    }

    fn category(&self) -> Category {
        Category::Violation
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["IDLE_THRESHOLD", "IDLE_MAX"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let idle_max = ctx.config.get_i64("IDLE_MAX", 3600);
        let mut delta = StateDelta::default();
        let mut events = Vec::new();
        if ctx.record.ignition_on() && ctx.record.speed == 0 {
            if let Some(start) = ctx.prev.engine.idle_start_time {
                let duration = ctx.secs_since(start);
                if duration >= idle_max {
                    events.push(
                        MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_IDLE, EVENT_IDLE_VIOLATION)
                            .with_value(duration as f64)
                            .with_threshold(idle_max as f64)
                            .with_duration(duration)
                            .with_severity("Low")
                            .at(Some(ctx.record.latitude), Some(ctx.record.longitude)),
                    );
                    delta.last_violation_time = Patch::Set(ctx.gps_time);
                    delta.last_violation_type = Patch::Set(EVENT_IDLE_VIOLATION.to_string());
                }
            }
        }
        Ok(CalcOutcome { delta, events, ..Default::default() })
    }
}

/// Seatbelt open above the speed threshold for a minimum duration or distance.
pub struct SeatbeltViolationCalc;

#[async_trait]
impl Calculator for SeatbeltViolationCalc {
    fn name(&self) -> &'static str {
        "seatbelt_violation"
    }

    fn category(&self) -> Category {
        Category::Violation
    }

    fn required_sensors(&self) -> &'static [&'static str] {
        &["has_seatbelt_sensor"]
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["SEATBELT_SPEED_THRESHOLD", "SEATBELT_MIN_DURATION", "SEATBELT_MIN_DISTANCE"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let speed_threshold = ctx.config.get_i64("SEATBELT_SPEED_THRESHOLD", 20) as i32;
        let min_duration = ctx.config.get_i64("SEATBELT_MIN_DURATION", 120);
        let min_distance_km = ctx.config.get_f64("SEATBELT_MIN_DISTANCE", 1.0);

        let driver_buckled = ctx
            .record
            .driver_seatbelt
            .unwrap_or_else(|| !ctx.record.status_contains("Driver Seatbelt Open"));
        let passenger_buckled = ctx
            .record
            .passenger_seatbelt
            .unwrap_or_else(|| !ctx.record.status_contains("Passenger Seatbelt Open"));

        let mut delta = StateDelta::default();
        let mut events = Vec::new();

        if ctx.record.speed <= speed_threshold {
            if ctx.prev.engine.seatbelt_unbuckled_start.is_some() {
                delta.seatbelt_unbuckled_start = Patch::Clear;
                delta.seatbelt_unbuckled_distance = Patch::Clear;
            }
            return Ok(CalcOutcome { delta, events, ..Default::default() });
        }

        for (seat, buckled) in [("driver", driver_buckled), ("passenger", passenger_buckled)] {
            if buckled {
                continue;
            }
            let mut unbuckled_km = ctx.prev.engine.seatbelt_unbuckled_distance.unwrap_or(0.0);
            if let Some(km) = ctx.distance_km() {
                unbuckled_km += km;
            }
            let Some(start) = ctx.prev.engine.seatbelt_unbuckled_start else {
                delta.seatbelt_unbuckled_start = Patch::Set(ctx.gps_time);
                delta.seatbelt_unbuckled_distance = Patch::Set(unbuckled_km);
                continue;
            };
            let duration = ctx.secs_since(start);
            if duration >= min_duration || unbuckled_km >= min_distance_km {
                events.push(
                    MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_SEATBELT, EVENT_SEATBELT_VIOLATION)
                        .with_value(unbuckled_km)
                        .with_threshold(min_distance_km)
                        .with_duration(duration)
                        .at(Some(ctx.record.latitude), Some(ctx.record.longitude))
                        .with_meta("seat", Value::from(seat)),
                );
                delta.last_violation_time = Patch::Set(ctx.gps_time);
                delta.last_violation_type = Patch::Set(EVENT_SEATBELT_VIOLATION.to_string());
                delta.seatbelt_unbuckled_start = Patch::Clear;
                delta.seatbelt_unbuckled_distance = Patch::Clear;
            } else {
                delta.seatbelt_unbuckled_distance = Patch::Set(unbuckled_km);
            }
        }

        Ok(CalcOutcome { delta, events, ..Default::default() })
    }
}

/// Event-driven harsh braking / acceleration / cornering from the status text.
pub struct HarshViolationCalc;

#[async_trait]
impl Calculator for HarshViolationCalc {
    fn name(&self) -> &'static str {
        "harsh_violation"
    }

    fn category(&self) -> Category {
        Category::Violation
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["HARSH_SPEED_DROP_THRESHOLD", "HARSH_SPEED_INCREASE_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let mut events = Vec::new();
        let at = (Some(ctx.record.latitude), Some(ctx.record.longitude));
        if ctx.record.status_contains("Harsh Braking") {
            events.push(
                MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_HARSH, EVENT_HARSH_BRAKE)
                    .with_threshold(ctx.config.get_f64("HARSH_SPEED_DROP_THRESHOLD", 25.0))
                    .at(at.0, at.1),
            );
        }
        if ctx.record.status_contains("Harsh Acceleration") {
            events.push(
                MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_HARSH, EVENT_HARSH_ACCEL)
                    .with_threshold(ctx.config.get_f64("HARSH_SPEED_INCREASE_THRESHOLD", 15.0))
                    .at(at.0, at.1),
            );
        }
        if ctx.record.status_contains("Harsh Cornering") {
            events.push(
                MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_HARSH, EVENT_HARSH_CORNER)
                    .at(at.0, at.1),
            );
        }
        // The green-driving score, when reported, is the event magnitude.
        if let Some(v) = ctx.record.green_driving_value {
            for ev in &mut events {
                ev.event_value = Some(v);
            }
        }
        Ok(CalcOutcome { events, ..Default::default() })
    }
}

/// Continuous-driving, insufficient-rest and night-driving checks.
pub struct DrivingTimeViolationCalc;

#[async_trait]
impl Calculator for DrivingTimeViolationCalc {
    fn name(&self) -> &'static str {
        "driving_time_violation"
    }

    fn category(&self) -> Category {
        Category::Violation
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["MAX_DRIVING_HOURS", "MAX_DRIVING_DISTANCE", "MIN_REST_DURATION", "REST_DURATION", "NIGHT_START", "NIGHT_END"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        // MAX_DRIVING_HOURS is hours in small values, seconds in large ones
        // (legacy deployments stored both).
        let mut max_driving_secs = ctx.config.get_i64("MAX_DRIVING_HOURS", 9);
        if max_driving_secs < 1000 {
            max_driving_secs *= 3600;
        }
        let max_driving_km = ctx.config.get_f64("MAX_DRIVING_DISTANCE", 800.0);
        let rest_duration_secs = {
            let v = ctx.config.get_i64("REST_DURATION", 45);
            if v < 1000 { v * 60 } else { v }
        };
        let min_rest_secs = {
            let v = ctx.config.get_i64("MIN_REST_DURATION", 30);
            if v < 1000 { v * 60 } else { v }
        };

        let speed = ctx.record.speed;
        let dist_km = ctx.distance_km().unwrap_or(0.0);
        let at = (Some(ctx.record.latitude), Some(ctx.record.longitude));
        let mut delta = StateDelta::default();
        let mut events = Vec::new();

        // Resting → driving again: was the rest long enough?
        if let (true, Some(rest_start)) = (speed > 0, ctx.prev.engine.rest_start_time) {
            let rest_secs = ctx.secs_since(rest_start);
            if rest_secs < min_rest_secs {
                events.push(
                    MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_DRIVING, EVENT_REST_TIME_VIOLATION)
                        .with_value(rest_secs as f64 / 60.0)
                        .with_threshold(min_rest_secs as f64 / 60.0)
                        .with_duration(rest_secs)
                        .with_severity("High")
                        .at(at.0, at.1),
                );
            }
            delta.rest_start_time = Patch::Clear;
        } else if speed == 0 {
            if ctx.prev.engine.driving_session_start.is_some() {
                delta.rest_start_time = Patch::Set(ctx.gps_time);
            } else if let Some(rest_start) = ctx.prev.engine.rest_start_time {
                if ctx.secs_since(rest_start) >= rest_duration_secs {
                    delta.rest_start_time = Patch::Clear;
                }
            }
        }

        if speed > 0 && dist_km > 0.0 {
            match ctx.prev.engine.driving_session_start {
                None => {
                    delta.driving_session_start = Patch::Set(ctx.gps_time);
                    delta.driving_session_distance = Patch::Set(dist_km);
                }
                Some(start) => {
                    let session_km = ctx.prev.engine.driving_session_distance.unwrap_or(0.0) + dist_km;
                    delta.driving_session_distance = Patch::Set(session_km);
                    let elapsed = ctx.secs_since(start);
                    if elapsed >= max_driving_secs {
                        events.push(
                            MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_DRIVING, EVENT_CONTINUOUS_DRIVING)
                                .with_value(elapsed as f64 / 3600.0)
                                .with_threshold(max_driving_secs as f64 / 3600.0)
                                .with_duration(elapsed)
                                .with_severity("High")
                                .at(at.0, at.1),
                        );
                        delta.driving_session_start = Patch::Clear;
                        delta.driving_session_distance = Patch::Clear;
                    } else if session_km >= max_driving_km {
                        events.push(
                            MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_DRIVING, EVENT_CONTINUOUS_DRIVING)
                                .with_value(session_km)
                                .with_threshold(max_driving_km)
                                .with_severity("High")
                                .at(at.0, at.1)
                                .with_meta("by_distance", Value::from(true)),
                        );
                        delta.driving_session_start = Patch::Clear;
                        delta.driving_session_distance = Patch::Clear;
                    }
                }
            }
        } else if ctx.prev.engine.driving_session_start.is_some() {
            delta.driving_session_start = Patch::Clear;
            delta.driving_session_distance = Patch::Clear;
        }

        // Night window may cross midnight.
        if let (Some(night_start), Some(night_end)) = (
            ctx.config.get_minutes_of_day("NIGHT_START"),
            ctx.config.get_minutes_of_day("NIGHT_END"),
        ) {
            use chrono::Timelike;
            let minute_of_day = (ctx.gps_time.time().hour() * 60 + ctx.gps_time.time().minute()) as i32;
            let in_night = if night_start <= night_end {
                (night_start..=night_end).contains(&minute_of_day)
            } else {
                minute_of_day >= night_start || minute_of_day < night_end
            };
            if in_night && speed > 0 {
                events.push(
                    MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_DRIVING, EVENT_NIGHT_DRIVING)
                        .with_value(speed as f64)
                        .with_severity("Low")
                        .at(at.0, at.1),
                );
            }
        }

        Ok(CalcOutcome { delta, events, ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{config, ctx_with, record, state_with, ts};

    #[tokio::test]
    async fn overspeed_tracks_then_emits_after_min_duration() {
        let calc = SpeedViolationCalc;
        let cfg = config(&[("SPEED_LIMIT_CITY", "60"), ("SPEED_LIMIT_HIGHWAY", "60"),
                           ("SPEED_LIMIT_MOTORWAY", "60"), ("MIN_DURATION_SPEED", "30")]);

        // First overspeed sample starts the window.
        let rec = record(100, "10:00:00", |r| r.speed = 75);
        let prior = state_with(|_| {});
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.delta.speeding_start_time, Patch::Set(ts("10:00:00")));
        assert!(out.events.is_empty());

        // 20s in: still tracking, no event.
        let rec = record(100, "10:00:20", |r| r.speed = 80);
        let prior = state_with(|s| {
            s.speeding_start_time = Some(ts("10:00:00"));
            s.speeding_max_speed = Some(75);
        });
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.delta.speeding_max_speed, Patch::Set(80));

        // 30s in: Overspeed with current speed and the city limit.
        let rec = record(100, "10:00:30", |r| r.speed = 80);
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events.len(), 1);
        let ev = &out.events[0];
        assert_eq!(ev.event_type, EVENT_OVERSPEED);
        assert_eq!(ev.event_value, Some(80.0));
        assert_eq!(ev.threshold_value, Some(60.0));
        assert_eq!(ev.duration_sec, Some(30));

        // Dropping under the limit clears the tracking state.
        let rec = record(100, "10:00:45", |r| r.speed = 40);
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.delta.speeding_start_time, Patch::Clear);
        assert_eq!(out.delta.speeding_max_speed, Patch::Clear);
    }

    #[tokio::test]
    async fn config_fallback_uses_max_limit_without_road_match() {
        let calc = SpeedViolationCalc;
        let cfg = config(&[("SPEED_LIMIT_CITY", "60"), ("SPEED_LIMIT_HIGHWAY", "100"),
                           ("SPEED_LIMIT_MOTORWAY", "120")]);
        // 110 km/h is under the max (motorway 120), so no tracking starts.
        let rec = record(100, "10:00:00", |r| r.speed = 110);
        let prior = state_with(|_| {});
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.delta.speeding_start_time.is_keep());
    }

    #[tokio::test]
    async fn idle_violation_after_idle_max() {
        let calc = IdleViolationCalc;
        let cfg = config(&[("IDLE_MAX", "600")]);
        let rec = record(100, "10:20:00", |r| {
            r.speed = 0;
            r.ignition = Some(true);
        });
        let prior = state_with(|s| s.idle_start_time = Some(ts("10:00:00")));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, EVENT_IDLE_VIOLATION);
        assert_eq!(out.events[0].duration_sec, Some(1200));
    }

    #[tokio::test]
    async fn harsh_events_from_status_text() {
        let calc = HarshViolationCalc;
        let rec = record(100, "10:00:00", |r| {
            r.status = "Harsh Braking".to_string();
            r.green_driving_value = Some(2.4);
        });
        let prior = state_with(|_| {});
        let cfg = config(&[]);
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, EVENT_HARSH_BRAKE);
        assert_eq!(out.events[0].event_value, Some(2.4));
    }

    #[tokio::test]
    async fn seatbelt_violation_by_duration() {
        let calc = SeatbeltViolationCalc;
        let cfg = config(&[("SEATBELT_SPEED_THRESHOLD", "20"), ("SEATBELT_MIN_DURATION", "120"),
                           ("SEATBELT_MIN_DISTANCE", "50")]);
        let rec = record(100, "10:03:00", |r| {
            r.speed = 60;
            r.driver_seatbelt = Some(false);
            r.passenger_seatbelt = Some(true);
        });
        let prior = state_with(|s| s.seatbelt_unbuckled_start = Some(ts("10:00:00")));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, EVENT_SEATBELT_VIOLATION);
        assert_eq!(out.delta.seatbelt_unbuckled_start, Patch::Clear);

        // Below the speed threshold the tracking state resets quietly.
        let slow = record(100, "10:04:00", |r| {
            r.speed = 5;
            r.driver_seatbelt = Some(false);
        });
        let out = calc.calculate(&ctx_with(&slow, &prior, &cfg)).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.delta.seatbelt_unbuckled_start, Patch::Clear);
    }

    #[tokio::test]
    async fn rest_time_violation_when_driving_resumes_early() {
        let calc = DrivingTimeViolationCalc;
        let cfg = config(&[("MIN_REST_DURATION", "30")]);
        let rec = record(100, "10:10:00", |r| {
            r.speed = 40;
            r.distance = Some(500.0);
        });
        let prior = state_with(|s| s.rest_start_time = Some(ts("10:00:00")));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        let rest = out.events.iter().find(|e| e.event_type == EVENT_REST_TIME_VIOLATION);
        assert!(rest.is_some(), "10 minutes of rest is under the 30-minute minimum");
        assert_eq!(out.delta.rest_start_time, Patch::Clear);
    }

    #[tokio::test]
    async fn continuous_driving_by_distance() {
        let calc = DrivingTimeViolationCalc;
        let cfg = config(&[("MAX_DRIVING_DISTANCE", "800"), ("MAX_DRIVING_HOURS", "9")]);
        let rec = record(100, "12:00:00", |r| {
            r.speed = 80;
            r.distance = Some(2000.0);
        });
        let prior = state_with(|s| {
            s.driving_session_start = Some(ts("08:00:00"));
            s.driving_session_distance = Some(799.0);
        });
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        let ev = out
            .events
            .iter()
            .find(|e| e.event_type == EVENT_CONTINUOUS_DRIVING)
            .expect("distance cap crossed");
        assert_eq!(ev.threshold_value, Some(800.0));
        assert_eq!(out.delta.driving_session_start, Patch::Clear);
    }

    #[tokio::test]
    async fn night_driving_window_crossing_midnight() {
        let calc = DrivingTimeViolationCalc;
        let cfg = config(&[("NIGHT_START", "22:00"), ("NIGHT_END", "05:00")]);
        let rec = record(100, "23:30:00", |r| r.speed = 50);
        let prior = state_with(|_| {});
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.events.iter().any(|e| e.event_type == EVENT_NIGHT_DRIVING));

        let daytime = record(100, "12:00:00", |r| r.speed = 50);
        let out = calc.calculate(&ctx_with(&daytime, &prior, &cfg)).await.unwrap();
        assert!(!out.events.iter().any(|e| e.event_type == EVENT_NIGHT_DRIVING));
    }
}
