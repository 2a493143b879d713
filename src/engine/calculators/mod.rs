pub mod core;
pub mod geofence;
pub mod sensor;
pub mod trip;
pub mod violation;

use async_trait::async_trait;

use crate::engine::context::{CalcContext, CalcOutcome};
use crate::infra::config_cache::DeviceConfig;
use crate::models::trip::Tracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Core,
    Sensor,
    Violation,
    Trip,
    Geofence,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Core => "core",
            Category::Sensor => "sensor",
            Category::Violation => "violation",
            Category::Trip => "trip",
            Category::Geofence => "geofence",
        }
    }
}

/// One metric computation unit. Calculators are pure given their context
/// (plus the read-only lookups they do through it); the registry runs them in
/// registration order and isolates individual failures.
#[async_trait]
pub trait Calculator: Send + Sync {
    fn name(&self) -> &'static str;
    fn category(&self) -> Category;

    /// Bumping this triggers a historical recalculation at next startup.
    fn formula_version(&self) -> &'static str {
        "1.0.0"
    }

    /// Tracker capability flags this calculator needs.
    fn required_sensors(&self) -> &'static [&'static str] {
        &[]
    }

    /// Config keys this calculator reads (documentation + catalog tooling).
    fn required_config(&self) -> &'static [&'static str] {
        &[]
    }

    fn applies_to(&self, tracker: Option<&Tracker>, _config: &DeviceConfig) -> bool {
        match tracker {
            None => true,
            Some(t) => self.required_sensors().iter().all(|s| t.has_capability(s)),
        }
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome>;
}
