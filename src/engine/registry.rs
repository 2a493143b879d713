use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::engine::calculators::core::{DistanceCalc, DurationCalc, SpeedCalc, VehicleStateCalc};
use crate::engine::calculators::geofence::FenceCalc;
use crate::engine::calculators::sensor::{FuelCalc, HumidityCalc, TemperatureCalc};
use crate::engine::calculators::trip::{
    FenceWiseTripCalc, IgnitionTripCalc, RoundTripCalc, RouteTripCalc, StoppageCalc,
};
use crate::engine::calculators::violation::{
    DrivingTimeViolationCalc, HarshViolationCalc, IdleViolationCalc, SeatbeltViolationCalc,
    SpeedViolationCalc,
};
use crate::engine::calculators::Calculator;
use crate::engine::context::{CalcContext, CalcOutcome};
use crate::infra::config_cache::DeviceConfig;
use crate::models::trip::Tracker;

#[derive(Default)]
pub struct CalcStats {
    pub invocations: AtomicU64,
    pub errors: AtomicU64,
    pub events_emitted: AtomicU64,
    pub total_micros: AtomicU64,
}

/// The full calculator set, enumerated statically in execution order. The
/// registry runs applicable calculators sequentially, isolates individual
/// failures, tags emitted events with the producer's formula version, and
/// keeps per-calculator counters.
pub struct Registry {
    calculators: Vec<Box<dyn Calculator>>,
    stats: HashMap<&'static str, CalcStats>,
}

fn build_calculators() -> Vec<Box<dyn Calculator>> {
    vec![
        Box::new(VehicleStateCalc),
        Box::new(DistanceCalc),
        Box::new(SpeedCalc),
        Box::new(DurationCalc),
        Box::new(SpeedViolationCalc),
        Box::new(IdleViolationCalc),
        Box::new(SeatbeltViolationCalc),
        Box::new(HarshViolationCalc),
        Box::new(DrivingTimeViolationCalc),
        Box::new(TemperatureCalc),
        Box::new(FuelCalc),
        Box::new(HumidityCalc),
        Box::new(IgnitionTripCalc),
        Box::new(StoppageCalc),
        Box::new(FenceWiseTripCalc),
        Box::new(RoundTripCalc),
        Box::new(RouteTripCalc),
        Box::new(FenceCalc),
    ]
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let calculators = build_calculators();
        let stats = calculators.iter().map(|c| (c.name(), CalcStats::default())).collect();
        tracing::info!("registered {} calculators", calculators.len());
        Self { calculators, stats }
    }

    pub fn calculators(&self) -> &[Box<dyn Calculator>] {
        &self.calculators
    }

    /// Declared formula versions, used by the startup recalculation sweep.
    pub fn formula_versions(&self) -> Vec<(&'static str, &'static str)> {
        self.calculators.iter().map(|c| (c.name(), c.formula_version())).collect()
    }

    pub fn stats(&self) -> &HashMap<&'static str, CalcStats> {
        &self.stats
    }

    /// Run every applicable calculator in registration order and merge the
    /// results. One calculator's failure is logged and skipped; the rest of
    /// the chain still runs.
    pub async fn run(
        &self,
        ctx: &CalcContext<'_>,
        tracker: Option<&Tracker>,
        config: &DeviceConfig,
    ) -> CalcOutcome {
        let mut merged = CalcOutcome::default();
        for calc in &self.calculators {
            if !calc.applies_to(tracker, config) {
                continue;
            }
            let stats = &self.stats[calc.name()];
            stats.invocations.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            match calc.calculate(ctx).await {
                Ok(mut outcome) => {
                    stats
                        .total_micros
                        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                    if !outcome.events.is_empty() {
                        stats.events_emitted.fetch_add(outcome.events.len() as u64, Ordering::Relaxed);
                    }
                    for ev in &mut outcome.events {
                        if ev.formula_version.is_none() {
                            ev.formula_version = Some(calc.formula_version());
                        }
                    }
                    merged.merge(outcome);
                }
                Err(e) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("calculator {} failed for imei={}: {e:#}", calc.name(), ctx.imei);
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{ctx, record, state_with};
    use crate::models::laststatus::Patch;

    #[test]
    fn registry_has_all_categories_and_unique_names() {
        use crate::engine::calculators::Category;
        let reg = Registry::new();
        let names: std::collections::HashSet<_> = reg.calculators().iter().map(|c| c.name()).collect();
        assert_eq!(names.len(), reg.calculators().len());
        for cat in [Category::Core, Category::Sensor, Category::Violation, Category::Trip, Category::Geofence] {
            assert!(reg.calculators().iter().any(|c| c.category() == cat), "missing {cat:?}");
        }
    }

    #[test]
    fn sensor_calculators_gate_on_capabilities() {
        let reg = Registry::new();
        let fuel = reg.calculators().iter().find(|c| c.name() == "fuel").unwrap();
        let no_fuel = Tracker { imei: 1, ..Default::default() };
        let with_fuel = Tracker { imei: 1, has_fuel_sensor: true, ..Default::default() };
        let cfg = DeviceConfig::default();
        assert!(!fuel.applies_to(Some(&no_fuel), &cfg));
        assert!(fuel.applies_to(Some(&with_fuel), &cfg));
        // Unknown tracker runs everything (new device before registration).
        assert!(fuel.applies_to(None, &cfg));
    }

    #[tokio::test]
    async fn run_merges_outcomes_and_tags_formula_version() {
        let reg = Registry::new();
        let rec = record(100, "10:00:00", |r| {
            r.speed = 0;
            r.ignition = Some(true);
            r.fuel = Some(150.0);
        });
        let prior = state_with(|s| s.prev_fuel_level = Some(100.0));
        let tracker = Tracker { imei: 100, has_fuel_sensor: true, ..Default::default() };
        let out = reg.run(&ctx(&rec, &prior), Some(&tracker), crate::engine::testutil::default_config()).await;

        // vehicle_state + duration + fuel all contributed.
        assert!(!out.delta.vehicle_state.is_keep());
        assert_eq!(out.delta.idle_start_time, Patch::Set(rec.gps_time));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].formula_version, Some("1.2.0"));
        assert_eq!(reg.stats()["fuel"].events_emitted.load(Ordering::Relaxed), 1);
    }
}
