//! Shared helpers for calculator unit tests.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::json;

use crate::engine::context::CalcContext;
use crate::infra::config_cache::{DeviceConfig, EMERGENCY_DEFAULTS};
use crate::models::laststatus::{EngineState, PriorState};
use crate::models::record::TrackRecord;

pub fn ts(hms: &str) -> NaiveDateTime {
    let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let t = chrono::NaiveTime::parse_from_str(hms, "%H:%M:%S").unwrap();
    date.and_time(t)
}

pub fn record(imei: i64, hms: &str, f: impl FnOnce(&mut TrackRecord)) -> TrackRecord {
    let mut rec = TrackRecord::from_payload(&json!({
        "imei": imei,
        "latitude": 31.5204,
        "longitude": 74.3587,
    }))
    .unwrap();
    rec.gps_time = ts(hms);
    rec.server_time = ts(hms);
    f(&mut rec);
    rec
}

pub fn state_with(f: impl FnOnce(&mut EngineState)) -> PriorState {
    let mut prior = PriorState {
        exists: true,
        latitude: Some(31.5204),
        longitude: Some(74.3587),
        gps_time: None,
        server_time: None,
        engine: EngineState::default(),
    };
    f(&mut prior.engine);
    prior
}

/// Emergency-default config shared by tests that do not override keys.
pub fn default_config() -> &'static DeviceConfig {
    static CONFIG: OnceLock<DeviceConfig> = OnceLock::new();
    CONFIG.get_or_init(|| {
        DeviceConfig::new(
            EMERGENCY_DEFAULTS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
    })
}

pub fn config(pairs: &[(&str, &str)]) -> DeviceConfig {
    let mut map: HashMap<String, String> =
        EMERGENCY_DEFAULTS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.to_string());
    }
    DeviceConfig::new(map)
}

pub fn ctx<'a>(rec: &'a TrackRecord, prior: &'a PriorState) -> CalcContext<'a> {
    CalcContext {
        imei: rec.imei,
        record: rec,
        gps_time: rec.gps_time,
        prev: prior,
        config: default_config(),
        vehicle_id: None,
        db: None,
    }
}

pub fn ctx_with<'a>(
    rec: &'a TrackRecord,
    prior: &'a PriorState,
    config: &'a DeviceConfig,
) -> CalcContext<'a> {
    CalcContext {
        imei: rec.imei,
        record: rec,
        gps_time: rec.gps_time,
        prev: prior,
        config,
        vehicle_id: None,
        db: None,
    }
}
