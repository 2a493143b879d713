use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool_postgres::Pool;
use tokio::sync::Mutex;

/// Per-device configuration resolution with a three-tier fallback:
/// `tracker_config(imei, key)` → `client_config(client_id, key)` →
/// `system_config(key)` → `EMERGENCY_DEFAULTS`. Resolved maps are cached for
/// five minutes; the known key set is itself read from `system_config` with
/// the compiled-in list as fallback.
pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(300);

/// Compile-time safety net when a key is missing at every tier.
pub const EMERGENCY_DEFAULTS: &[(&str, &str)] = &[
    ("SPEED_LIMIT_CITY", "80"),
    ("SPEED_LIMIT_HIGHWAY", "120"),
    ("SPEED_LIMIT_MOTORWAY", "120"),
    ("MIN_DURATION_SPEED", "30"),
    ("MAX_SPEED_FILTER", "200"),
    ("IDLE_THRESHOLD", "300"),
    ("NR_THRESHOLD", "86400"),
    ("IDLE_MAX", "3600"),
    ("SEATBELT_SPEED_THRESHOLD", "20"),
    ("SEATBELT_MIN_DURATION", "5"),
    ("SEATBELT_MIN_DISTANCE", "0.1"),
    ("SEATBELT_DELAY_THRESHOLD", "10"),
    ("HARSH_SPEED_DROP_THRESHOLD", "25"),
    ("HARSH_SPEED_INCREASE_THRESHOLD", "15"),
    ("HARSH_TIME_WINDOW", "5"),
    ("HARSH_HEADING_THRESHOLD", "45"),
    ("TEMP_MIN", "-30"),
    ("TEMP_MAX", "30"),
    ("HUMIDITY_MIN", "0"),
    ("HUMIDITY_MAX", "100"),
    ("SENSOR_DURATION_THRESHOLD", "300"),
    ("FILL_THRESHOLD", "20"),
    ("THEFT_THRESHOLD", "15"),
    ("UNUSUAL_STOPPAGE_THRESHOLD", "1800"),
    ("STOP_COUNT_THRESHOLD", "10"),
    ("STOP_THRESHOLD", "60"),
    ("MAX_DRIVING_HOURS", "9"),
    ("MAX_DRIVING_DISTANCE", "800"),
    ("REST_DURATION", "45"),
    ("MIN_REST_DURATION", "30"),
    ("NIGHT_START", "22:00"),
    ("NIGHT_END", "05:00"),
    ("DEVIATION_THRESHOLD", "500"),
    ("ENTRY_THRESHOLD", "100"),
    ("WAYPOINT_RADIUS", "50"),
    ("TIME_COMPLIANCE_THRESHOLD", "900"),
    ("TRIP_END_DELAY", "300"),
];

struct KeyListCache {
    keys: Vec<String>,
    loaded_at: Instant,
}

pub struct ConfigCache {
    pool: Pool,
    cache: Mutex<HashMap<i64, (Arc<DeviceConfig>, Instant)>>,
    key_list: Mutex<Option<KeyListCache>>,
}

impl ConfigCache {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
            key_list: Mutex::new(None),
        }
    }

    /// Resolve the full config map for one imei, cached. Never fails: a DB
    /// outage degrades to emergency defaults.
    pub async fn resolve(&self, imei: i64) -> Arc<DeviceConfig> {
        {
            let cache = self.cache.lock().await;
            if let Some((cfg, at)) = cache.get(&imei) {
                if at.elapsed() < CONFIG_CACHE_TTL {
                    return cfg.clone();
                }
            }
        }
        let resolved = Arc::new(DeviceConfig::new(self.resolve_bulk(imei).await));
        let mut cache = self.cache.lock().await;
        cache.insert(imei, (resolved.clone(), Instant::now()));
        resolved
    }

    pub async fn invalidate(&self, imei: i64) {
        self.cache.lock().await.remove(&imei);
    }

    pub async fn invalidate_all(&self) {
        self.cache.lock().await.clear();
    }

    /// Bulk-resolve all known keys for one imei in at most four queries:
    /// client id, then one per tier, tracker overrides winning.
    async fn resolve_bulk(&self, imei: i64) -> HashMap<String, String> {
        let keys = self.config_keys().await;
        let mut out: HashMap<String, String> = keys
            .iter()
            .map(|k| (k.clone(), emergency_default(k).unwrap_or_default().to_string()))
            .collect();

        let client = match self.pool.get().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("config resolution for imei={imei} degraded to defaults: {e}");
                return out;
            }
        };
        let result: anyhow::Result<()> = async {
            let client_id: Option<i64> = client
                .query_opt(
                    "SELECT v.client_id FROM tracker t \
                     JOIN vehicle v ON v.vehicle_id = t.vehicle_id WHERE t.imei = $1",
                    &[&imei],
                )
                .await?
                .map(|r| r.get(0));

            for row in client
                .query(
                    "SELECT config_key, config_value FROM system_config WHERE config_key = ANY($1)",
                    &[&keys],
                )
                .await?
            {
                out.insert(row.get(0), row.get(1));
            }
            if let Some(cid) = client_id {
                for row in client
                    .query(
                        "SELECT config_key, config_value FROM client_config \
                         WHERE client_id = $1 AND config_key = ANY($2)",
                        &[&cid, &keys],
                    )
                    .await?
                {
                    out.insert(row.get(0), row.get(1));
                }
            }
            for row in client
                .query(
                    "SELECT config_key, config_value FROM tracker_config \
                     WHERE imei = $1 AND config_key = ANY($2)",
                    &[&imei, &keys],
                )
                .await?
            {
                out.insert(row.get(0), row.get(1));
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("config resolution failed for imei={imei}: {e:#}");
        }
        // Any key left empty still gets its emergency default.
        for (k, v) in out.iter_mut() {
            if v.is_empty() {
                if let Some(def) = emergency_default(k) {
                    *v = def.to_string();
                }
            }
        }
        out
    }

    /// The key set to resolve: DISTINCT config_key from system_config, cached
    /// with the same TTL; compiled-in list when the table is empty or down.
    async fn config_keys(&self) -> Vec<String> {
        {
            let guard = self.key_list.lock().await;
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < CONFIG_CACHE_TTL {
                    return cached.keys.clone();
                }
            }
        }
        let keys = match self.load_keys_from_db().await {
            Ok(keys) if !keys.is_empty() => keys,
            Ok(_) => {
                tracing::debug!("system_config has no keys; using built-in list");
                builtin_keys()
            }
            Err(e) => {
                tracing::warn!("failed to load config keys from db: {e:#}; using built-in list");
                builtin_keys()
            }
        };
        let mut guard = self.key_list.lock().await;
        *guard = Some(KeyListCache { keys: keys.clone(), loaded_at: Instant::now() });
        keys
    }

    async fn load_keys_from_db(&self) -> anyhow::Result<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT DISTINCT config_key FROM system_config ORDER BY config_key", &[])
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }
}

pub fn emergency_default(key: &str) -> Option<&'static str> {
    EMERGENCY_DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn builtin_keys() -> Vec<String> {
    EMERGENCY_DEFAULTS.iter().map(|(k, _)| k.to_string()).collect()
}

/// A resolved config map with typed accessors. Calculators read through this
/// so a malformed value degrades to the caller's default instead of aborting
/// the chain.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    values: HashMap<String, String>,
}

impl DeviceConfig {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
    }

    /// Parse `HH` or `HH:MM` into minutes since midnight.
    pub fn get_minutes_of_day(&self, key: &str) -> Option<i32> {
        let raw = self.get(key)?.trim();
        if raw.is_empty() {
            return None;
        }
        let (h, m) = match raw.split_once(':') {
            Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
            None => (raw.parse::<i32>().ok()?, 0),
        };
        Some(h * 60 + m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> DeviceConfig {
        DeviceConfig::new(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn typed_getters_fall_back_on_garbage() {
        let cfg = config(&[("SPEED_LIMIT_CITY", "60"), ("FILL_THRESHOLD", "not-a-number")]);
        assert_eq!(cfg.get_i64("SPEED_LIMIT_CITY", 80), 60);
        assert_eq!(cfg.get_f64("FILL_THRESHOLD", 5.0), 5.0);
        assert_eq!(cfg.get_i64("MISSING", 42), 42);
    }

    #[test]
    fn minutes_of_day_parses_both_shapes() {
        let cfg = config(&[("NIGHT_START", "22:30"), ("NIGHT_END", "5")]);
        assert_eq!(cfg.get_minutes_of_day("NIGHT_START"), Some(22 * 60 + 30));
        assert_eq!(cfg.get_minutes_of_day("NIGHT_END"), Some(5 * 60));
        assert_eq!(cfg.get_minutes_of_day("MISSING"), None);
    }

    #[test]
    fn every_default_key_has_a_value() {
        for (k, v) in EMERGENCY_DEFAULTS {
            assert!(!v.is_empty(), "empty emergency default for {k}");
        }
        assert_eq!(emergency_default("SPEED_LIMIT_CITY"), Some("80"));
        assert_eq!(emergency_default("NO_SUCH_KEY"), None);
    }
}
