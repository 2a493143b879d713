use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Data-driven recalculation catalog: which event categories a config key
/// invalidates and which materialised views need refreshing afterwards. New
/// keys or views are added in `recalculation_catalog.json`, not code. The
/// view list doubles as the whitelist for `REFRESH MATERIALIZED VIEW` (view
/// names are interpolated into SQL, so only known names are ever accepted).
#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    config_key_affected: HashMap<String, CatalogEntry>,
    #[serde(default)]
    materialized_views: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub event_categories: Vec<String>,
    #[serde(default)]
    pub view_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
    views: Vec<String>,
}

fn builtin_entries() -> HashMap<String, CatalogEntry> {
    fn entry(categories: &[&str], views: &[&str]) -> CatalogEntry {
        CatalogEntry {
            event_categories: categories.iter().map(|s| s.to_string()).collect(),
            view_names: views.iter().map(|s| s.to_string()).collect(),
        }
    }
    let mut map = HashMap::new();
    for key in ["SPEED_LIMIT_CITY", "SPEED_LIMIT_HIGHWAY", "SPEED_LIMIT_MOTORWAY", "MIN_DURATION_SPEED"] {
        map.insert(key.to_string(), entry(&["Speed"], &["mv_daily_violations", "mv_weekly_driver_scores"]));
    }
    for key in ["TEMP_MIN", "TEMP_MAX", "HUMIDITY_MIN", "HUMIDITY_MAX", "SENSOR_DURATION_THRESHOLD"] {
        map.insert(key.to_string(), entry(&["Sensor"], &["mv_daily_violations"]));
    }
    for key in ["SEATBELT_SPEED_THRESHOLD", "SEATBELT_MIN_DURATION", "SEATBELT_MIN_DISTANCE"] {
        map.insert(key.to_string(), entry(&["Seatbelt"], &["mv_daily_violations"]));
    }
    for key in ["HARSH_SPEED_DROP_THRESHOLD", "HARSH_SPEED_INCREASE_THRESHOLD", "HARSH_TIME_WINDOW"] {
        map.insert(key.to_string(), entry(&["Harsh"], &["mv_daily_violations", "mv_weekly_driver_scores"]));
    }
    for key in ["FILL_THRESHOLD", "THEFT_THRESHOLD"] {
        map.insert(key.to_string(), entry(&["Fuel"], &["mv_daily_fuel_consumption"]));
    }
    for key in ["IDLE_THRESHOLD", "IDLE_MAX"] {
        map.insert(key.to_string(), entry(&["Idle"], &["mv_daily_violations"]));
    }
    for key in ["MAX_DRIVING_HOURS", "MAX_DRIVING_DISTANCE", "REST_DURATION", "MIN_REST_DURATION"] {
        map.insert(key.to_string(), entry(&["Driving"], &["mv_weekly_driver_scores"]));
    }
    for key in ["DEVIATION_THRESHOLD", "ENTRY_THRESHOLD", "WAYPOINT_RADIUS"] {
        map.insert(key.to_string(), entry(&["Route"], &["mv_daily_violations"]));
    }
    map
}

fn builtin_views() -> Vec<String> {
    [
        "mv_daily_mileage",
        "mv_daily_violations",
        "mv_daily_fuel_consumption",
        "mv_daily_fence_stats",
        "mv_weekly_driver_scores",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub const SCORE_VIEWS: &[&str] = &["mv_weekly_driver_scores"];

impl Default for Catalog {
    fn default() -> Self {
        Self { entries: builtin_entries(), views: builtin_views() }
    }
}

impl Catalog {
    /// Load from `RECALC_CATALOG_PATH` / the configured path /
    /// `./recalculation_catalog.json`, falling back to the built-in table.
    pub fn load(configured_path: Option<&str>) -> Self {
        let path = std::env::var("RECALC_CATALOG_PATH")
            .ok()
            .or_else(|| configured_path.map(String::from))
            .unwrap_or_else(|| "./recalculation_catalog.json".to_string());
        if !Path::new(&path).exists() {
            tracing::warn!("recalculation catalog not found at {path}; using built-in table");
            return Self::default();
        }
        match std::fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|text| {
            serde_json::from_str::<CatalogFile>(&text).map_err(anyhow::Error::from)
        }) {
            Ok(file) => {
                tracing::info!("loaded recalculation catalog from {path}");
                let mut catalog = Self::default();
                if !file.config_key_affected.is_empty() {
                    catalog.entries = file.config_key_affected;
                }
                if !file.materialized_views.is_empty() {
                    catalog.views = file.materialized_views;
                }
                catalog
            }
            Err(e) => {
                tracing::warn!("failed to load recalculation catalog from {path}: {e:#}; using built-in table");
                Self::default()
            }
        }
    }

    /// `(categories to delete, views to refresh)` for a config key. `None`
    /// in either slot means "all" (unknown key: full recalculation).
    pub fn affected(&self, config_key: Option<&str>) -> (Option<Vec<String>>, Option<Vec<String>>) {
        match config_key.and_then(|k| self.entries.get(k)) {
            Some(entry) => {
                let categories =
                    (!entry.event_categories.is_empty()).then(|| entry.event_categories.clone());
                let views = (!entry.view_names.is_empty()).then(|| self.filter_views(&entry.view_names));
                (categories, views)
            }
            None => (None, None),
        }
    }

    pub fn refreshable_views(&self) -> &[String] {
        &self.views
    }

    /// Whitelist filter: only names in the catalog's view list survive.
    pub fn filter_views<S: AsRef<str>>(&self, names: &[S]) -> Vec<String> {
        names
            .iter()
            .map(|n| n.as_ref())
            .filter(|n| self.views.iter().any(|v| v == n))
            .map(String::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_key_maps_to_categories_and_views() {
        let catalog = Catalog::default();
        let (categories, views) = catalog.affected(Some("SPEED_LIMIT_CITY"));
        assert_eq!(categories, Some(vec!["Speed".to_string()]));
        assert!(views.unwrap().contains(&"mv_daily_violations".to_string()));
    }

    #[test]
    fn unknown_key_means_recalculate_everything() {
        let catalog = Catalog::default();
        let (categories, views) = catalog.affected(Some("BRAND_NEW_KEY"));
        assert!(categories.is_none());
        assert!(views.is_none());
        let (categories, _) = catalog.affected(None);
        assert!(categories.is_none());
    }

    #[test]
    fn view_whitelist_drops_unknown_names() {
        let catalog = Catalog::default();
        let filtered = catalog.filter_views(&["mv_daily_violations", "pg_shadow; DROP TABLE x"]);
        assert_eq!(filtered, vec!["mv_daily_violations".to_string()]);
    }
}
