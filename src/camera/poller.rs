use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::camera::alarm_config;
use crate::camera::cms_api::{CmsAlarm, CmsClient, CmsDevice};
use crate::camera::csv_sink::CsvSink;
use crate::camera::dedup::{AlarmDecision, CameraDedup};
use crate::camera::transform::{self, OutboundMessage, VENDOR, deterministic_message_id};
use crate::config::CameraConfig;
use crate::db::Db;
use crate::infra::broker::Broker;
use crate::infra::circuit_breaker::CircuitBreaker;
use crate::infra::shutdown::Shutdown;

const PER_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct PollerStats {
    pub trackdata_published: AtomicU64,
    pub events_published: AtomicU64,
    pub alarms_published: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub errors: AtomicU64,
    pub dead_letters: AtomicU64,
}

struct ServerHandle {
    client: Arc<CmsClient>,
    breaker: CircuitBreaker,
}

/// Multi-server CMS poller. Per server: a device-status loop, a safety-alarm
/// loop over a sliding lookback window, a realtime-alarm loop, and a shared
/// cleanup loop; HTTP concurrency is bounded process-wide.
pub struct Poller {
    db: Arc<Db>,
    broker: Option<Arc<Broker>>,
    csv: Option<CsvSink>,
    config: CameraConfig,
    dedup: Arc<CameraDedup>,
    semaphore: Arc<Semaphore>,
    pub stats: Arc<PollerStats>,
}

impl Poller {
    pub fn new(
        db: Arc<Db>,
        broker: Option<Arc<Broker>>,
        config: CameraConfig,
    ) -> anyhow::Result<Self> {
        let csv = if config.data_mode == "csv" {
            Some(CsvSink::new(&config.csv_dir)?)
        } else {
            None
        };
        Ok(Self {
            db,
            broker,
            csv,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            config,
            dedup: Arc::new(CameraDedup::default()),
            stats: Arc::new(PollerStats::default()),
        })
    }

    /// Load servers, run the startup backfill, then spawn the polling loops.
    /// Resolves when shutdown fires.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> anyhow::Result<()> {
        let servers = self.db.cms_servers().await?;
        anyhow::ensure!(!servers.is_empty(), "no enabled cms_servers configured");
        tracing::info!("camera poller starting with {} server(s)", servers.len());

        let mut handles = Vec::new();
        for server in servers {
            let name = server.name.clone();
            match CmsClient::new(server) {
                Ok(client) => handles.push(Arc::new(ServerHandle {
                    client: Arc::new(client),
                    breaker: CircuitBreaker::with_defaults("cms_server"),
                })),
                Err(e) => tracing::error!("skipping CMS server {name}: {e:#}"),
            }
        }

        for handle in &handles {
            let poller = self.clone();
            let handle = handle.clone();
            let sd = shutdown.clone();
            if let Err(e) = poller.backfill_server(&handle, sd).await {
                tracing::warn!("backfill failed for {}: {e:#}", handle.client.server.name);
            }
        }

        let mut tasks = Vec::new();
        for handle in handles {
            tasks.push(tokio::spawn(self.clone().device_status_loop(handle.clone(), shutdown.clone())));
            tasks.push(tokio::spawn(self.clone().safety_alarm_loop(handle.clone(), shutdown.clone())));
            tasks.push(tokio::spawn(self.clone().realtime_alarm_loop(handle.clone(), shutdown.clone())));
        }
        tasks.push(tokio::spawn(self.clone().cleanup_loop(shutdown.clone())));

        let mut sd = shutdown;
        sd.wait().await;
        for task in tasks {
            task.abort();
        }
        tracing::info!("camera poller stopped");
        Ok(())
    }

    async fn device_status_loop(self: Arc<Self>, handle: Arc<ServerHandle>, mut shutdown: Shutdown) {
        let interval = Duration::from_secs(self.config.device_status_interval_secs);
        loop {
            if shutdown.sleep(interval).await {
                return;
            }
            if handle.breaker.preflight().is_err() {
                continue;
            }
            match self.poll_server_devices(&handle).await {
                Ok(n) => {
                    handle.breaker.record_success();
                    tracing::debug!("{}: {n} device statuses", handle.client.server.name);
                }
                Err(e) => {
                    handle.breaker.record_failure();
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("device poll failed on {}: {e:#}", handle.client.server.name);
                }
            }
        }
    }

    async fn poll_server_devices(&self, handle: &ServerHandle) -> anyhow::Result<usize> {
        let _permit = self.semaphore.acquire().await?;
        let devices = tokio::time::timeout(PER_CALL_TIMEOUT, handle.client.all_devices()).await??;
        let mut published = 0;
        for device in devices.iter().filter(|d| d.online) {
            let detail = tokio::time::timeout(
                PER_CALL_TIMEOUT,
                handle.client.device_status(&device.device_id),
            )
            .await??;
            let Some(detail) = detail else { continue };
            if let Some(message) = transform::device_to_trackdata(&detail) {
                if self.emit(message).await {
                    published += 1;
                }
            }
        }
        Ok(published)
    }

    async fn safety_alarm_loop(self: Arc<Self>, handle: Arc<ServerHandle>, mut shutdown: Shutdown) {
        let interval = Duration::from_secs(self.config.safety_alarm_interval_secs);
        loop {
            if shutdown.sleep(interval).await {
                return;
            }
            if handle.breaker.preflight().is_err() {
                continue;
            }
            let end = Utc::now().naive_utc();
            let start = end - chrono::Duration::minutes(self.config.safety_alarm_lookback_mins);
            let result = async {
                let _permit = self.semaphore.acquire().await?;
                tokio::time::timeout(
                    PER_CALL_TIMEOUT,
                    handle.client.safety_alarms(start, end, self.config.filter_alarm_types),
                )
                .await?
            }
            .await;
            match result {
                Ok(alarms) => {
                    handle.breaker.record_success();
                    self.process_alarms(alarms).await;
                }
                Err(e) => {
                    handle.breaker.record_failure();
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("alarm poll failed on {}: {e:#}", handle.client.server.name);
                }
            }
        }
    }

    async fn realtime_alarm_loop(self: Arc<Self>, handle: Arc<ServerHandle>, mut shutdown: Shutdown) {
        let interval = Duration::from_secs(self.config.realtime_alarm_interval_secs);
        loop {
            if shutdown.sleep(interval).await {
                return;
            }
            if handle.breaker.preflight().is_err() {
                continue;
            }
            let result = async {
                let _permit = self.semaphore.acquire().await?;
                tokio::time::timeout(
                    PER_CALL_TIMEOUT,
                    handle.client.realtime_alarms(self.config.filter_alarm_types),
                )
                .await?
            }
            .await;
            match result {
                Ok(alarms) => {
                    handle.breaker.record_success();
                    self.process_alarms(alarms).await;
                }
                Err(e) => {
                    handle.breaker.record_failure();
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("realtime poll failed on {}: {e:#}", handle.client.server.name);
                }
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: Shutdown) {
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        loop {
            if shutdown.sleep(interval).await {
                return;
            }
            let (alarms, tracks) = self.dedup.sweep();
            if alarms + tracks > 0 {
                tracing::debug!("dedup sweep removed {alarms} alarm / {tracks} track entries");
            }
        }
    }

    async fn process_alarms(&self, alarms: Vec<CmsAlarm>) {
        for alarm in alarms {
            let has_video = alarm.has_video();
            match self.dedup.check_alarm(&alarm.guid, has_video) {
                AlarmDecision::Duplicate => {
                    self.stats.dedup_hits.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                AlarmDecision::VideoUpdate => {
                    tracing::debug!("re-emitting alarm {} with video", alarm.guid);
                }
                AlarmDecision::New => {}
            }
            let Some(mut message) = transform::alarm_to_event(&alarm) else {
                continue;
            };
            if let Some(data) = message.body.get_mut("data") {
                alarm_config::enrich_with_alarm_flags(&self.db, data).await;
            }
            if self.emit(message).await {
                self.stats.events_published.fetch_add(1, Ordering::Relaxed);
                self.dedup.mark_alarm(&alarm.guid, has_video);
            }
        }
    }

    /// Route one message the way the tracker parsers do: every record is
    /// trackdata; non-Normal status is also an event; is_alarm=1 is also an
    /// alarm. Each routing publishes independently with its own
    /// deterministic message id.
    async fn emit(&self, message: OutboundMessage) -> bool {
        let data = message.body.get("data").cloned().unwrap_or(Value::Null);
        let status = data.get("status").and_then(Value::as_str).unwrap_or("Normal");
        let gps_time = crate::models::record::opt_datetime(data.get("gps_time"))
            .unwrap_or_else(|| Utc::now().naive_utc());
        let is_event = status != "Normal";
        let is_alarm = data.get("is_alarm").and_then(Value::as_i64).unwrap_or(0) == 1;

        let mut routings = vec!["trackdata"];
        if is_event {
            routings.push("event");
        }
        if is_alarm {
            routings.push("alarm");
        }

        let mut all_ok = true;
        for record_type in routings {
            let message_id = deterministic_message_id(message.imei, gps_time, record_type);
            let mut body = message.body.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("record_type".into(), Value::from(record_type));
                obj.insert("message_id".into(), Value::from(message_id.clone()));
            }
            let ok = match (&self.broker, &self.csv) {
                (Some(broker), _) => {
                    let payload = match serde_json::to_vec(&body) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("message serialization failed: {e}");
                            all_ok = false;
                            continue;
                        }
                    };
                    match broker
                        .publish_tracking_record(VENDOR, record_type, &message_id, &payload)
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            self.stats.dead_letters.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("publish failed for {record_type} imei={}: {e:#}", message.imei);
                            false
                        }
                    }
                }
                (None, Some(csv)) => match csv.save(record_type, &body) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("csv save failed: {e:#}");
                        false
                    }
                },
                (None, None) => false,
            };
            if ok {
                match record_type {
                    "trackdata" => self.stats.trackdata_published.fetch_add(1, Ordering::Relaxed),
                    "alarm" => self.stats.alarms_published.fetch_add(1, Ordering::Relaxed),
                    _ => 0,
                };
            } else {
                all_ok = false;
            }
        }
        all_ok
    }

    /// Startup backfill: replay a window of safety alarms and GPS tracks.
    /// GPS backfill walks devices in chunks with a short pause so the CMS is
    /// not hammered on every restart.
    async fn backfill_server(&self, handle: &ServerHandle, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let end = Utc::now().naive_utc();
        let start = end - chrono::Duration::hours(self.config.backfill_hours);
        tracing::info!(
            "backfilling {} from {start} ({}h window)",
            handle.client.server.name,
            self.config.backfill_hours
        );

        let alarms = {
            let _permit = self.semaphore.acquire().await?;
            handle
                .client
                .safety_alarms(start, end, self.config.filter_alarm_types)
                .await?
        };
        let count = alarms.len();
        self.process_alarms(alarms).await;
        tracing::info!("{}: backfilled {count} alarms", handle.client.server.name);

        let devices = {
            let _permit = self.semaphore.acquire().await?;
            handle.client.all_devices().await?
        };
        for chunk in devices.chunks(self.config.backfill_device_chunk.max(1)) {
            if shutdown.is_shutdown() {
                return Ok(());
            }
            for device in chunk {
                match self.backfill_device_gps(handle, device, start, end).await {
                    Ok(n) if n > 0 => {
                        tracing::debug!("backfilled {n} track points for {}", device.device_id)
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("gps backfill failed for {}: {e:#}", device.device_id),
                }
            }
            let pause = Duration::from_millis(500 + rand::rng().random_range(0..500));
            if shutdown.sleep(pause).await {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn backfill_device_gps(
        &self,
        handle: &ServerHandle,
        device: &CmsDevice,
        start: chrono::NaiveDateTime,
        end: chrono::NaiveDateTime,
    ) -> anyhow::Result<usize> {
        let points = {
            let _permit = self.semaphore.acquire().await?;
            handle.client.gps_track(&device.device_id, start, end).await?
        };
        let mut published = 0;
        for point in points {
            let Some(imei) = transform::device_id_to_imei(&point.device_id) else {
                continue;
            };
            let Some(gps_time) = point.gps_time else { continue };
            if self.dedup.seen_track(imei, gps_time) {
                self.stats.dedup_hits.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(message) = transform::device_to_trackdata(&point) {
                if self.emit(message).await {
                    published += 1;
                }
            }
        }
        Ok(published)
    }
}
