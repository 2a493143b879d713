use serde::Deserialize;
use std::path::Path;

use crate::infra::broker::BrokerConfig;

/// Top-level config loaded from `fleet.toml`, with connection credentials
/// overridable from the environment (the containerised deployments only set
/// env vars).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rabbitmq: RabbitMqConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub metric_engine: MetricEngineConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub sms: SmsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub dbname: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            dbname: default_db_name(),
            user: default_db_user(),
            password: String::new(),
            pool_size: default_pool_size(),
        }
    }
}

impl DatabaseConfig {
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("DATABASE_PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("DATABASE_NAME") {
            self.dbname = v;
        }
        if let Ok(v) = std::env::var("DATABASE_USER") {
            self.user = v;
        }
        if let Ok(v) = std::env::var("DATABASE_PASSWORD") {
            self.password = v;
        }
    }

    /// libpq-style connection string for dedicated (non-pool) connections,
    /// e.g. the recalculation worker's LISTEN channel.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} connect_timeout=30",
            self.host, self.port, self.dbname, self.user, self.password
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqConfig {
    #[serde(default = "default_mq_host")]
    pub host: String,
    #[serde(default = "default_mq_port")]
    pub port: u16,
    #[serde(default = "default_mq_vhost")]
    pub virtual_host: String,
    #[serde(default = "default_mq_user")]
    pub username: String,
    #[serde(default = "default_mq_pass")]
    pub password: String,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: default_mq_host(),
            port: default_mq_port(),
            virtual_host: default_mq_vhost(),
            username: default_mq_user(),
            password: default_mq_pass(),
        }
    }
}

impl RabbitMqConfig {
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("RABBITMQ_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("RABBITMQ_VHOST") {
            self.virtual_host = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_USER") {
            self.username = v;
        }
        if let Ok(v) = std::env::var("RABBITMQ_PASSWORD") {
            self.password = v;
        }
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.host.clone(),
            port: self.port,
            virtual_host: self.virtual_host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_message_retries: i32,
    #[serde(default = "default_dedup_cache_size")]
    pub dedup_cache_size: usize,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            workers: default_workers(),
            max_message_retries: default_max_retries(),
            dedup_cache_size: default_dedup_cache_size(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            prefetch_count: default_prefetch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricEngineConfig {
    #[serde(default)]
    pub shadow_mode: bool,
    #[serde(default = "default_prefetch_engine")]
    pub prefetch_count: u16,
    #[serde(default = "default_max_retries")]
    pub max_message_retries: i32,
    #[serde(default = "default_engine_workers")]
    pub workers: usize,
    #[serde(default = "default_recalc_poll_secs")]
    pub recalc_poll_secs: u64,
    #[serde(default = "default_recalc_debounce_secs")]
    pub recalc_debounce_secs: u64,
    #[serde(default = "default_recalc_batch_size")]
    pub recalc_batch_size: i64,
    #[serde(default = "default_recalc_window_days")]
    pub recalc_window_days: i64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Optional path to recalculation_catalog.json (env RECALC_CATALOG_PATH
    /// overrides).
    #[serde(default)]
    pub catalog_path: Option<String>,
}

impl Default for MetricEngineConfig {
    fn default() -> Self {
        Self {
            shadow_mode: false,
            prefetch_count: default_prefetch_engine(),
            max_message_retries: default_max_retries(),
            workers: default_engine_workers(),
            recalc_poll_secs: default_recalc_poll_secs(),
            recalc_debounce_secs: default_recalc_debounce_secs(),
            recalc_batch_size: default_recalc_batch_size(),
            recalc_window_days: default_recalc_window_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            catalog_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// "rabbitmq" publishes to the tracking exchange; "csv" writes files
    /// (standalone mode, no broker required).
    #[serde(default = "default_camera_mode")]
    pub data_mode: String,
    #[serde(default = "default_csv_dir")]
    pub csv_dir: String,
    #[serde(default = "default_status_interval")]
    pub device_status_interval_secs: u64,
    #[serde(default = "default_alarm_interval")]
    pub safety_alarm_interval_secs: u64,
    #[serde(default = "default_alarm_lookback")]
    pub safety_alarm_lookback_mins: i64,
    #[serde(default = "default_realtime_interval")]
    pub realtime_alarm_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_backfill_hours")]
    pub backfill_hours: i64,
    #[serde(default = "default_gps_chunk")]
    pub backfill_device_chunk: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_true")]
    pub filter_alarm_types: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            data_mode: default_camera_mode(),
            csv_dir: default_csv_dir(),
            device_status_interval_secs: default_status_interval(),
            safety_alarm_interval_secs: default_alarm_interval(),
            safety_alarm_lookback_mins: default_alarm_lookback(),
            realtime_alarm_interval_secs: default_realtime_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            backfill_hours: default_backfill_hours(),
            backfill_device_chunk: default_gps_chunk(),
            max_concurrent_requests: default_max_concurrent(),
            filter_alarm_types: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_outbox_poll_secs")]
    pub outbox_poll_secs: u64,
    #[serde(default = "default_outbox_batch")]
    pub outbox_batch: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_outbox_timeout_mins")]
    pub outbox_timeout_mins: i64,
    #[serde(default = "default_reply_timeout_mins")]
    pub reply_timeout_mins: i64,
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            outbox_poll_secs: default_outbox_poll_secs(),
            outbox_batch: default_outbox_batch(),
            max_retries: default_max_retries(),
            outbox_timeout_mins: default_outbox_timeout_mins(),
            reply_timeout_mins: default_reply_timeout_mins(),
            cleanup_interval_secs: default_cleanup_secs(),
            http_port: default_http_port(),
        }
    }
}

fn default_db_host() -> String { "localhost".to_string() }
fn default_db_port() -> u16 { 5432 }
fn default_db_name() -> String { "tracking".to_string() }
fn default_db_user() -> String { "tracking_user".to_string() }
fn default_pool_size() -> usize { 16 }
fn default_mq_host() -> String { "localhost".to_string() }
fn default_mq_port() -> u16 { 5672 }
fn default_mq_vhost() -> String { "tracking_gateway".to_string() }
fn default_mq_user() -> String { "tracking_user".to_string() }
fn default_mq_pass() -> String { "tracking_password".to_string() }
fn default_batch_size() -> usize { 200 }
fn default_batch_timeout_ms() -> u64 { 2000 }
fn default_workers() -> usize { 4 }
fn default_max_retries() -> i32 { 3 }
fn default_dedup_cache_size() -> usize { 50_000 }
fn default_dedup_ttl_secs() -> u64 { 3600 }
fn default_prefetch() -> u16 { 200 }
fn default_prefetch_engine() -> u16 { 50 }
fn default_engine_workers() -> usize { 8 }
fn default_recalc_poll_secs() -> u64 { 60 }
fn default_recalc_debounce_secs() -> u64 { 5 }
fn default_recalc_batch_size() -> i64 { 500 }
fn default_recalc_window_days() -> i64 { 30 }
fn default_maintenance_interval_secs() -> u64 { 86_400 }
fn default_camera_mode() -> String { "rabbitmq".to_string() }
fn default_csv_dir() -> String { "./camera_data".to_string() }
fn default_status_interval() -> u64 { 30 }
fn default_alarm_interval() -> u64 { 60 }
fn default_alarm_lookback() -> i64 { 120 }
fn default_realtime_interval() -> u64 { 10 }
fn default_cleanup_interval() -> u64 { 300 }
fn default_backfill_hours() -> i64 { 168 }
fn default_gps_chunk() -> usize { 5 }
fn default_max_concurrent() -> usize { 10 }
fn default_outbox_poll_secs() -> u64 { 5 }
fn default_outbox_batch() -> i64 { 10 }
fn default_outbox_timeout_mins() -> i64 { 1 }
fn default_reply_timeout_mins() -> i64 { 2 }
fn default_cleanup_secs() -> u64 { 60 }
fn default_http_port() -> u16 { 8080 }
fn default_true() -> bool { true }

impl FleetConfig {
    /// Load from `FLEET_CONFIG` (default `./fleet.toml`), then overlay
    /// connection settings from the environment. A missing file is fine.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| "./fleet.toml".to_string());
        let mut config = Self::load_file(&path)?;
        config.database.apply_env();
        config.rabbitmq.apply_env();
        Ok(config)
    }

    fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.consumer.batch_size, 200);
        assert_eq!(cfg.consumer.batch_timeout_ms, 2000);
        assert_eq!(cfg.consumer.max_message_retries, 3);
        assert_eq!(cfg.sms.outbox_timeout_mins, 1);
        assert_eq!(cfg.sms.reply_timeout_mins, 2);
        assert_eq!(cfg.camera.backfill_hours, 168);
        assert_eq!(cfg.metric_engine.recalc_debounce_secs, 5);
    }

    #[test]
    fn toml_overlay_parses() {
        let cfg: FleetConfig = toml::from_str(
            r#"
            [consumer]
            batch_size = 500

            [camera]
            data_mode = "csv"

            [sms]
            http_port = 9090
            "#,
        )
        .unwrap();
        assert_eq!(cfg.consumer.batch_size, 500);
        assert_eq!(cfg.camera.data_mode, "csv");
        assert_eq!(cfg.sms.http_port, 9090);
        // Untouched sections keep defaults.
        assert_eq!(cfg.consumer.batch_timeout_ms, 2000);
    }
}
