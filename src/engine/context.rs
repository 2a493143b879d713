use chrono::NaiveDateTime;

use crate::db::Db;
use crate::infra::config_cache::DeviceConfig;
use crate::models::laststatus::{PriorState, StateDelta};
use crate::models::metric_event::MetricEvent;
use crate::models::record::TrackRecord;
use crate::models::trip::StoppageEntry;

/// Everything one calculator invocation can see: the current record, the
/// device's prior state, its resolved config and identity. `db` is absent in
/// unit tests; calculators that need lookups degrade to their config
/// fallbacks when it is.
pub struct CalcContext<'a> {
    pub imei: i64,
    pub record: &'a TrackRecord,
    pub gps_time: NaiveDateTime,
    pub prev: &'a PriorState,
    pub config: &'a DeviceConfig,
    pub vehicle_id: Option<i64>,
    pub db: Option<&'a Db>,
}

impl CalcContext<'_> {
    /// Seconds from a prior timestamp to this record's gps_time.
    pub fn secs_since(&self, earlier: NaiveDateTime) -> i64 {
        (self.gps_time - earlier).num_seconds()
    }

    /// This record's reported segment distance, in kilometres.
    pub fn distance_km(&self) -> Option<f64> {
        self.record.distance.map(|m| m / 1000.0).filter(|km| *km > 0.0)
    }
}

/// Merged output of the calculator chain.
#[derive(Debug, Default)]
pub struct CalcOutcome {
    pub delta: StateDelta,
    pub events: Vec<MetricEvent>,
    pub stoppages: Vec<StoppageEntry>,
}

impl CalcOutcome {
    pub fn merge(&mut self, other: CalcOutcome) {
        self.delta.merge(other.delta);
        self.events.extend(other.events);
        self.stoppages.extend(other.stoppages);
    }
}
