use async_trait::async_trait;
use serde_json::Value;

use super::{Calculator, Category};
use crate::engine::context::{CalcContext, CalcOutcome};
use crate::models::laststatus::{Patch, StateDelta};
use crate::models::metric_event::{
    CATEGORY_FUEL, CATEGORY_SENSOR, EVENT_FUEL_FILL, EVENT_FUEL_THEFT, EVENT_HUMIDITY_HIGH,
    EVENT_HUMIDITY_LOW, EVENT_TEMP_HIGH, EVENT_TEMP_LOW, MetricEvent,
};

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Temperature out of [TEMP_MIN, TEMP_MAX] for SENSOR_DURATION_THRESHOLD.
pub struct TemperatureCalc;

#[async_trait]
impl Calculator for TemperatureCalc {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn category(&self) -> Category {
        Category::Sensor
    }

    fn required_sensors(&self) -> &'static [&'static str] {
        &["has_temp_sensor"]
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["TEMP_MIN", "TEMP_MAX", "SENSOR_DURATION_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let Some(temp) = ctx.record.temperature() else {
            return Ok(CalcOutcome::default());
        };
        let temp_min = ctx.config.get_f64("TEMP_MIN", -30.0);
        let temp_max = ctx.config.get_f64("TEMP_MAX", 30.0);
        let min_duration = ctx.config.get_i64("SENSOR_DURATION_THRESHOLD", 300);

        let mut delta = StateDelta::default();
        let mut events = Vec::new();
        if temp < temp_min || temp > temp_max {
            match ctx.prev.engine.temp_violation_start {
                None => delta.temp_violation_start = Patch::Set(ctx.gps_time),
                Some(start) => {
                    let duration = ctx.secs_since(start);
                    if duration >= min_duration {
                        let (event_type, threshold) = if temp > temp_max {
                            (EVENT_TEMP_HIGH, temp_max)
                        } else {
                            (EVENT_TEMP_LOW, temp_min)
                        };
                        events.push(
                            MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_SENSOR, event_type)
                                .with_value(temp)
                                .with_threshold(threshold)
                                .with_duration(duration)
                                .at(Some(ctx.record.latitude), Some(ctx.record.longitude)),
                        );
                        delta.last_violation_time = Patch::Set(ctx.gps_time);
                        delta.last_violation_type = Patch::Set(event_type.to_string());
                    }
                }
            }
        } else if ctx.prev.engine.temp_violation_start.is_some() {
            delta.temp_violation_start = Patch::Clear;
        }
        delta.prev_temp_value = Patch::Set(temp);
        Ok(CalcOutcome { delta, events, ..Default::default() })
    }
}

/// Humidity out of range, same shape as temperature.
pub struct HumidityCalc;

#[async_trait]
impl Calculator for HumidityCalc {
    fn name(&self) -> &'static str {
        "humidity"
    }

    fn category(&self) -> Category {
        Category::Sensor
    }

    fn required_sensors(&self) -> &'static [&'static str] {
        &["has_humidity_sensor"]
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["HUMIDITY_MIN", "HUMIDITY_MAX", "SENSOR_DURATION_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let Some(humidity) = ctx.record.humidity() else {
            return Ok(CalcOutcome::default());
        };
        let humidity = humidity as f64;
        let min = ctx.config.get_f64("HUMIDITY_MIN", 0.0);
        let max = ctx.config.get_f64("HUMIDITY_MAX", 100.0);
        let min_duration = ctx.config.get_i64("SENSOR_DURATION_THRESHOLD", 300);

        let mut delta = StateDelta::default();
        let mut events = Vec::new();
        if humidity < min || humidity > max {
            match ctx.prev.engine.humidity_violation_start {
                None => delta.humidity_violation_start = Patch::Set(ctx.gps_time),
                Some(start) => {
                    let duration = ctx.secs_since(start);
                    if duration >= min_duration {
                        let (event_type, threshold) = if humidity > max {
                            (EVENT_HUMIDITY_HIGH, max)
                        } else {
                            (EVENT_HUMIDITY_LOW, min)
                        };
                        events.push(
                            MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_SENSOR, event_type)
                                .with_value(humidity)
                                .with_threshold(threshold)
                                .with_duration(duration)
                                .at(Some(ctx.record.latitude), Some(ctx.record.longitude)),
                        );
                        delta.last_violation_time = Patch::Set(ctx.gps_time);
                        delta.last_violation_type = Patch::Set(event_type.to_string());
                    }
                }
            }
        } else if ctx.prev.engine.humidity_violation_start.is_some() {
            delta.humidity_violation_start = Patch::Clear;
        }
        Ok(CalcOutcome { delta, events, ..Default::default() })
    }
}

/// Fuel fill/theft from the level delta, with calibration-translated litres
/// attached to metadata when a mapping exists for the vehicle.
pub struct FuelCalc;

#[async_trait]
impl Calculator for FuelCalc {
    fn name(&self) -> &'static str {
        "fuel"
    }

    fn category(&self) -> Category {
        Category::Sensor
    }

    fn formula_version(&self) -> &'static str {
        "1.2.0"
    }

    fn required_sensors(&self) -> &'static [&'static str] {
        &["has_fuel_sensor"]
    }

    fn required_config(&self) -> &'static [&'static str] {
        &["FILL_THRESHOLD", "THEFT_THRESHOLD"]
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let Some(fuel) = ctx.record.fuel else {
            return Ok(CalcOutcome::default());
        };
        let fill_threshold = ctx.config.get_f64("FILL_THRESHOLD", 20.0);
        let theft_threshold = ctx.config.get_f64("THEFT_THRESHOLD", 15.0);

        let mut delta = StateDelta::default();
        delta.prev_fuel_level = Patch::Set(fuel);
        let mut events = Vec::new();

        if let Some(prev_fuel) = ctx.prev.engine.prev_fuel_level {
            let change = fuel - prev_fuel;
            let (fuel_liters, prev_liters) = match (ctx.db, ctx.vehicle_id) {
                (Some(db), Some(vid)) => (
                    db.fuel_liters(vid, fuel).await.unwrap_or(None),
                    db.fuel_liters(vid, prev_fuel).await.unwrap_or(None),
                ),
                _ => (None, None),
            };
            if change >= fill_threshold {
                let mut ev = MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_FUEL, EVENT_FUEL_FILL)
                    .with_value(change)
                    .with_threshold(fill_threshold)
                    .with_severity("Low")
                    .at(Some(ctx.record.latitude), Some(ctx.record.longitude));
                if let Some(l) = fuel_liters {
                    ev = ev.with_meta("fuel_liters", Value::from(round4(l)));
                }
                if let (Some(now), Some(before)) = (fuel_liters, prev_liters) {
                    ev = ev.with_meta("delta_liters", Value::from(round4(now - before)));
                }
                events.push(ev);
            } else if change <= -theft_threshold {
                let mut ev = MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_FUEL, EVENT_FUEL_THEFT)
                    .with_value(-change)
                    .with_threshold(theft_threshold)
                    .with_severity("High")
                    .at(Some(ctx.record.latitude), Some(ctx.record.longitude));
                if let Some(l) = fuel_liters {
                    ev = ev.with_meta("fuel_liters", Value::from(round4(l)));
                }
                if let (Some(now), Some(before)) = (fuel_liters, prev_liters) {
                    ev = ev.with_meta("delta_liters", Value::from(round4(before - now)));
                }
                events.push(ev);
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
    async fn temperature_violation_needs_sustained_excursion() {
        let calc = TemperatureCalc;
        let cfg = config(&[("TEMP_MIN", "-30"), ("TEMP_MAX", "30"), ("SENSOR_DURATION_THRESHOLD", "300")]);

        // First out-of-range sample only starts the clock.
        let rec = record(100, "10:00:00", |r| r.dallas_temperature_1 = Some(35.0));
        let prior = state_with(|_| {});
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.delta.temp_violation_start, Patch::Set(ts("10:00:00")));

        // Still hot five minutes later: Temp_High.
        let rec = record(100, "10:05:00", |r| r.dallas_temperature_1 = Some(36.0));
        let prior = state_with(|s| s.temp_violation_start = Some(ts("10:00:00")));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, EVENT_TEMP_HIGH);
        assert_eq!(out.events[0].threshold_value, Some(30.0));

        // Back in range clears the start marker.
        let rec = record(100, "10:06:00", |r| r.dallas_temperature_1 = Some(20.0));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.delta.temp_violation_start, Patch::Clear);
    }

    #[tokio::test]
    async fn cold_excursion_reports_temp_low_with_min_threshold() {
        let calc = TemperatureCalc;
        let cfg = config(&[("TEMP_MIN", "-10"), ("TEMP_MAX", "30"), ("SENSOR_DURATION_THRESHOLD", "60")]);
        let rec = record(100, "10:02:00", |r| r.ble_temperature_1 = Some(-15.0));
        let prior = state_with(|s| s.temp_violation_start = Some(ts("10:00:00")));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events[0].event_type, EVENT_TEMP_LOW);
        assert_eq!(out.events[0].threshold_value, Some(-10.0));
    }

    #[tokio::test]
    async fn fuel_fill_and_theft_detection() {
        let calc = FuelCalc;
        let cfg = config(&[("FILL_THRESHOLD", "5"), ("THEFT_THRESHOLD", "5")]);

        let rec = record(100, "10:00:00", |r| r.fuel = Some(150.0));
        let prior = state_with(|s| s.prev_fuel_level = Some(100.0));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, EVENT_FUEL_FILL);
        assert_eq!(out.events[0].event_value, Some(50.0));
        assert_eq!(out.delta.prev_fuel_level, Patch::Set(150.0));

        let rec = record(100, "10:10:00", |r| r.fuel = Some(80.0));
        let prior = state_with(|s| s.prev_fuel_level = Some(100.0));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert_eq!(out.events[0].event_type, EVENT_FUEL_THEFT);
        assert_eq!(out.events[0].event_value, Some(20.0));

        // Small wobble stays quiet.
        let rec = record(100, "10:20:00", |r| r.fuel = Some(102.0));
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.events.is_empty());
    }

    #[tokio::test]
    async fn first_fuel_sample_only_seeds_state() {
        let calc = FuelCalc;
        let cfg = config(&[]);
        let rec = record(100, "10:00:00", |r| r.fuel = Some(60.0));
        let prior = state_with(|_| {});
        let out = calc.calculate(&ctx_with(&rec, &prior, &cfg)).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.delta.prev_fuel_level, Patch::Set(60.0));
    }
}
