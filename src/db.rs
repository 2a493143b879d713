use chrono::NaiveDateTime;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use serde_json::Value;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;

use crate::config::DatabaseConfig;
use crate::infra::circuit_breaker::CircuitBreaker;
use crate::models::record::{AlarmExtras, EventExtras, TrackRecord};

/// Boxed query parameter for dynamically built statements.
pub type SqlParam = Box<dyn ToSql + Sync + Send>;

pub fn param_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| &**p as &(dyn ToSql + Sync)).collect()
}

/// Process-global database handle: one deadpool pool plus the read/write
/// circuit breakers shared by every subsystem in the process.
pub struct Db {
    pool: Pool,
    pub read_breaker: CircuitBreaker,
    pub write_breaker: CircuitBreaker,
}

impl Db {
    pub fn connect(cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        let mut pc = PoolConfig::new();
        pc.host = Some(cfg.host.clone());
        pc.port = Some(cfg.port);
        pc.dbname = Some(cfg.dbname.clone());
        pc.user = Some(cfg.user.clone());
        pc.password = Some(cfg.password.clone());
        pc.connect_timeout = Some(std::time::Duration::from_secs(30));
        pc.pool = Some(deadpool_postgres::PoolConfig::new(cfg.pool_size));
        let pool = pc.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(Self {
            pool,
            read_breaker: CircuitBreaker::with_defaults("db_read"),
            write_breaker: CircuitBreaker::with_defaults("db_write"),
        })
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    pub async fn client(&self) -> anyhow::Result<deadpool_postgres::Object> {
        Ok(self.pool.get().await?)
    }

    // ── Batch flushes (C1) ──
    //
    // Each flush is one transaction: the bulk upsert, the per-record
    // LastStatus consumer-column updates, and the L2 dedup rows commit
    // together or not at all. The broker ack follows the commit.

    pub async fn flush_trackdata(
        &self,
        rows: &[TrackRecord],
        message_ids: &[String],
    ) -> anyhow::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let sql = multirow_upsert_sql("trackdata", TRACK_COLS, rows.len(), None);
        let mut params: Vec<SqlParam> = Vec::with_capacity(rows.len() * TRACK_COLS.len());
        for r in rows {
            push_track_params(&mut params, r);
        }
        let n = tx.execute(sql.as_str(), &param_refs(&params)).await?;
        for r in rows {
            upsert_laststatus_consumer_tx(&tx, r).await?;
        }
        mark_processed_tx(&tx, message_ids).await?;
        tx.commit().await?;
        Ok(n)
    }

    /// Alarms additionally return `(imei, gps_time, id)` for each row so the
    /// notifier can publish `alarm-<id>` messages.
    pub async fn flush_alarms(
        &self,
        rows: &[(TrackRecord, AlarmExtras)],
        message_ids: &[String],
    ) -> anyhow::Result<Vec<(i64, NaiveDateTime, i64)>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let sql = multirow_upsert_sql("alarms", ALARM_COLS, rows.len(), Some("imei, gps_time, id"));
        let mut params: Vec<SqlParam> = Vec::with_capacity(rows.len() * ALARM_COLS.len());
        for (r, extras) in rows {
            push_track_params(&mut params, r);
            params.push(Box::new(extras.is_sms));
            params.push(Box::new(extras.is_email));
            params.push(Box::new(extras.is_call));
            params.push(Box::new(extras.priority));
            params.push(Box::new(extras.category.clone()));
            params.push(Box::new(extras.scheduled_at));
            params.push(Box::new(extras.state.clone()));
        }
        let returned = tx.query(sql.as_str(), &param_refs(&params)).await?;
        for (r, _) in rows {
            upsert_laststatus_consumer_tx(&tx, r).await?;
        }
        mark_processed_tx(&tx, message_ids).await?;
        tx.commit().await?;
        Ok(returned
            .into_iter()
            .map(|row| (row.get::<_, i64>(0), row.get::<_, NaiveDateTime>(1), row.get::<_, i64>(2)))
            .collect())
    }

    pub async fn flush_events(
        &self,
        rows: &[(TrackRecord, EventExtras)],
        message_ids: &[String],
    ) -> anyhow::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let sql = multirow_upsert_sql("events", EVENT_COLS, rows.len(), None);
        let mut params: Vec<SqlParam> = Vec::with_capacity(rows.len() * EVENT_COLS.len());
        for (r, extras) in rows {
            push_track_params(&mut params, r);
            params.push(Box::new(extras.photo_url.clone()));
            params.push(Box::new(extras.video_url.clone()));
        }
        let n = tx.execute(sql.as_str(), &param_refs(&params)).await?;
        for (r, _) in rows {
            upsert_laststatus_consumer_tx(&tx, r).await?;
        }
        mark_processed_tx(&tx, message_ids).await?;
        tx.commit().await?;
        Ok(n)
    }

    // ── Dedup L2 + retry counts ──

    /// L2 lookup. Degrades to "not seen" on read failure so a DB blip does
    /// not stall the queue; the upsert sink is idempotent anyway.
    pub async fn is_message_processed(&self, message_id: &str) -> bool {
        let result: anyhow::Result<bool> = async {
            let client = self.client().await?;
            let row = client
                .query_opt("SELECT 1 FROM processed_message_ids WHERE message_id = $1", &[&message_id])
                .await?;
            Ok(row.is_some())
        }
        .await;
        match result {
            Ok(seen) => seen,
            Err(e) => {
                tracing::debug!("processed-message lookup failed for {message_id}: {e:#}");
                false
            }
        }
    }

    pub async fn mark_message_processed(&self, message_id: &str) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO processed_message_ids (message_id) VALUES ($1) ON CONFLICT DO NOTHING",
                &[&message_id],
            )
            .await?;
        Ok(())
    }

    pub async fn get_retry_count(&self, message_id: &str) -> i32 {
        let result: anyhow::Result<i32> = async {
            let client = self.client().await?;
            let row = client
                .query_opt("SELECT retry_count FROM message_retry_counts WHERE message_id = $1", &[&message_id])
                .await?;
            Ok(row.map(|r| r.get(0)).unwrap_or(0))
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::warn!("retry-count lookup failed for {message_id}: {e:#}");
            0
        })
    }

    pub async fn increment_retry_count(
        &self,
        message_id: &str,
        queue_name: &str,
        error: Option<&str>,
    ) -> i32 {
        let truncated = error.map(|e| e.chars().take(500).collect::<String>());
        let result: anyhow::Result<i32> = async {
            let client = self.client().await?;
            let row = client
                .query_one(
                    "INSERT INTO message_retry_counts (message_id, queue_name, retry_count, last_error) \
                     VALUES ($1, $2, 1, $3) \
                     ON CONFLICT (message_id) DO UPDATE SET \
                       retry_count = message_retry_counts.retry_count + 1, \
                       last_error = EXCLUDED.last_error, \
                       last_attempt_at = NOW() \
                     RETURNING retry_count",
                    &[&message_id, &queue_name, &truncated],
                )
                .await?;
            Ok(row.get(0))
        }
        .await;
        result.unwrap_or_else(|e| {
            tracing::warn!("retry-count increment failed for {message_id}: {e:#}");
            1
        })
    }

    pub async fn clear_retry_count(&self, message_id: &str) {
        let result: anyhow::Result<()> = async {
            let client = self.client().await?;
            client
                .execute("DELETE FROM message_retry_counts WHERE message_id = $1", &[&message_id])
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::debug!("retry-count clear failed for {message_id}: {e:#}");
        }
    }

    /// Maintenance sweep: expire processed-message rows past their TTL and
    /// stale retry counters.
    pub async fn cleanup_message_bookkeeping(
        &self,
        processed_ttl_hours: i64,
        retry_ttl_hours: i64,
    ) -> anyhow::Result<(u64, u64)> {
        let client = self.client().await?;
        let processed = client
            .execute(
                format!(
                    "DELETE FROM processed_message_ids WHERE processed_at < NOW() - INTERVAL '{processed_ttl_hours} hours'"
                ).as_str(),
                &[],
            )
            .await?;
        let retries = client
            .execute(
                format!(
                    "DELETE FROM message_retry_counts WHERE last_attempt_at < NOW() - INTERVAL '{retry_ttl_hours} hours'"
                ).as_str(),
                &[],
            )
            .await?;
        Ok((processed, retries))
    }

    /// Record a rejected record for manual review, alongside the queue publish.
    pub async fn save_invalid_record(
        &self,
        source_queue: &str,
        raw_payload: &Value,
        reason: &str,
        message_id: Option<&str>,
        imei: Option<&str>,
    ) -> anyhow::Result<()> {
        let client = self.client().await?;
        let errors = serde_json::json!({ "errors": [reason] });
        client
            .execute(
                "INSERT INTO invalid_data_queue (source_queue, message_id, raw_payload, validation_errors, imei) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[&source_queue, &message_id, raw_payload, &errors, &imei],
            )
            .await?;
        Ok(())
    }
}

// Column lists for the multi-row upserts. Order must match the
// push_track_params / extras push order below.
const TRACK_COLS: &[&str] = &[
    "imei",
    "gps_time",
    "server_time",
    "latitude",
    "longitude",
    "altitude",
    "angle",
    "satellites",
    "speed",
    "status",
    "vendor",
    "ignition",
    "driver_seatbelt",
    "passenger_seatbelt",
    "door_status",
    "passenger_seat",
    "main_battery",
    "battery_voltage",
    "fuel",
    "dallas_temperature_1",
    "dallas_temperature_2",
    "dallas_temperature_3",
    "dallas_temperature_4",
    "ble_temperature_1",
    "ble_temperature_2",
    "ble_temperature_3",
    "ble_temperature_4",
    "ble_humidity_1",
    "ble_humidity_2",
    "ble_humidity_3",
    "ble_humidity_4",
    "green_driving_value",
    "dynamic_io",
    "is_valid",
    "reference_id",
    "distance",
];

// Alarm rows carry notification flags. The dispatcher-owned columns
// (sms_sent_at, email_sent_at, call_sent_at, retry_count) are not in this
// list, so a retransmitted alarm can never clear dispatch progress.
const ALARM_COLS: &[&str] = &[
    "imei",
    "gps_time",
    "server_time",
    "latitude",
    "longitude",
    "altitude",
    "angle",
    "satellites",
    "speed",
    "status",
    "vendor",
    "ignition",
    "driver_seatbelt",
    "passenger_seatbelt",
    "door_status",
    "passenger_seat",
    "main_battery",
    "battery_voltage",
    "fuel",
    "dallas_temperature_1",
    "dallas_temperature_2",
    "dallas_temperature_3",
    "dallas_temperature_4",
    "ble_temperature_1",
    "ble_temperature_2",
    "ble_temperature_3",
    "ble_temperature_4",
    "ble_humidity_1",
    "ble_humidity_2",
    "ble_humidity_3",
    "ble_humidity_4",
    "green_driving_value",
    "dynamic_io",
    "is_valid",
    "reference_id",
    "distance",
    "is_sms",
    "is_email",
    "is_call",
    "priority",
    "category",
    "scheduled_at",
    "state",
];

const EVENT_COLS: &[&str] = &[
    "imei",
    "gps_time",
    "server_time",
    "latitude",
    "longitude",
    "altitude",
    "angle",
    "satellites",
    "speed",
    "status",
    "vendor",
    "ignition",
    "driver_seatbelt",
    "passenger_seatbelt",
    "door_status",
    "passenger_seat",
    "main_battery",
    "battery_voltage",
    "fuel",
    "dallas_temperature_1",
    "dallas_temperature_2",
    "dallas_temperature_3",
    "dallas_temperature_4",
    "ble_temperature_1",
    "ble_temperature_2",
    "ble_temperature_3",
    "ble_temperature_4",
    "ble_humidity_1",
    "ble_humidity_2",
    "ble_humidity_3",
    "ble_humidity_4",
    "green_driving_value",
    "dynamic_io",
    "is_valid",
    "reference_id",
    "distance",
    "photo_url",
    "video_url",
];

fn push_track_params(params: &mut Vec<SqlParam>, r: &TrackRecord) {
    params.push(Box::new(r.imei));
    params.push(Box::new(r.gps_time));
    params.push(Box::new(r.server_time));
    params.push(Box::new(r.latitude));
    params.push(Box::new(r.longitude));
    params.push(Box::new(r.altitude));
    params.push(Box::new(r.angle));
    params.push(Box::new(r.satellites));
    params.push(Box::new(r.speed));
    params.push(Box::new(r.status.clone()));
    params.push(Box::new(r.vendor.clone()));
    params.push(Box::new(r.ignition));
    params.push(Box::new(r.driver_seatbelt));
    params.push(Box::new(r.passenger_seatbelt));
    params.push(Box::new(r.door_status));
    params.push(Box::new(r.passenger_seat));
    params.push(Box::new(r.main_battery));
    params.push(Box::new(r.battery_voltage));
    params.push(Box::new(r.fuel));
    params.push(Box::new(r.dallas_temperature_1));
    params.push(Box::new(r.dallas_temperature_2));
    params.push(Box::new(r.dallas_temperature_3));
    params.push(Box::new(r.dallas_temperature_4));
    params.push(Box::new(r.ble_temperature_1));
    params.push(Box::new(r.ble_temperature_2));
    params.push(Box::new(r.ble_temperature_3));
    params.push(Box::new(r.ble_temperature_4));
    params.push(Box::new(r.ble_humidity_1));
    params.push(Box::new(r.ble_humidity_2));
    params.push(Box::new(r.ble_humidity_3));
    params.push(Box::new(r.ble_humidity_4));
    params.push(Box::new(r.green_driving_value));
    params.push(Box::new(r.dynamic_io.clone()));
    params.push(Box::new(r.is_valid));
    params.push(Box::new(r.reference_id));
    params.push(Box::new(r.distance));
}

/// `INSERT ... VALUES (...), (...) ON CONFLICT (imei, gps_time) DO UPDATE`
/// updating every non-key column from EXCLUDED (`created_at` is not in the
/// insert list and is left untouched).
fn multirow_upsert_sql(
    table: &str,
    cols: &[&str],
    nrows: usize,
    returning: Option<&str>,
) -> String {
    let ncols = cols.len();
    let mut values = String::new();
    for row in 0..nrows {
        if row > 0 {
            values.push_str(", ");
        }
        values.push('(');
        for col in 0..ncols {
            if col > 0 {
                values.push_str(", ");
            }
            values.push_str(&format!("${}", row * ncols + col + 1));
        }
        values.push(')');
    }
    let updates = cols
        .iter()
        .filter(|c| **c != "imei" && **c != "gps_time")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "INSERT INTO {table} ({}) VALUES {values} ON CONFLICT (imei, gps_time) DO UPDATE SET {updates}",
        cols.join(", ")
    );
    if let Some(ret) = returning {
        sql.push_str(&format!(" RETURNING {ret}"));
    }
    sql
}

/// LastStatus upsert writing **consumer-owned columns only**; the engine's
/// state columns belong to the metric engine and are never named here.
async fn upsert_laststatus_consumer_tx(
    tx: &tokio_postgres::Transaction<'_>,
    r: &TrackRecord,
) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO laststatus (imei, gps_time, server_time, latitude, longitude, altitude, angle, \
           satellites, speed, reference_id, distance, vendor, status, ignition, driver_seatbelt, \
           passenger_seatbelt, door_status, passenger_seat, main_battery, battery_voltage, fuel, \
           dallas_temperature_1, dallas_temperature_2, dallas_temperature_3, dallas_temperature_4, \
           ble_temperature_1, ble_temperature_2, ble_temperature_3, ble_temperature_4, \
           ble_humidity_1, ble_humidity_2, ble_humidity_3, ble_humidity_4, green_driving_value, \
           dynamic_io, is_valid, updateddate) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
           $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33, $34, $35, $36, NOW()) \
         ON CONFLICT (imei) DO UPDATE SET \
           gps_time = EXCLUDED.gps_time, server_time = EXCLUDED.server_time, \
           latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude, \
           altitude = EXCLUDED.altitude, angle = EXCLUDED.angle, satellites = EXCLUDED.satellites, \
           speed = EXCLUDED.speed, reference_id = EXCLUDED.reference_id, distance = EXCLUDED.distance, \
           vendor = EXCLUDED.vendor, status = EXCLUDED.status, ignition = EXCLUDED.ignition, \
           driver_seatbelt = EXCLUDED.driver_seatbelt, passenger_seatbelt = EXCLUDED.passenger_seatbelt, \
           door_status = EXCLUDED.door_status, passenger_seat = EXCLUDED.passenger_seat, \
           main_battery = EXCLUDED.main_battery, battery_voltage = EXCLUDED.battery_voltage, \
           fuel = EXCLUDED.fuel, \
           dallas_temperature_1 = EXCLUDED.dallas_temperature_1, \
           dallas_temperature_2 = EXCLUDED.dallas_temperature_2, \
           dallas_temperature_3 = EXCLUDED.dallas_temperature_3, \
           dallas_temperature_4 = EXCLUDED.dallas_temperature_4, \
           ble_temperature_1 = EXCLUDED.ble_temperature_1, ble_temperature_2 = EXCLUDED.ble_temperature_2, \
           ble_temperature_3 = EXCLUDED.ble_temperature_3, ble_temperature_4 = EXCLUDED.ble_temperature_4, \
           ble_humidity_1 = EXCLUDED.ble_humidity_1, ble_humidity_2 = EXCLUDED.ble_humidity_2, \
           ble_humidity_3 = EXCLUDED.ble_humidity_3, ble_humidity_4 = EXCLUDED.ble_humidity_4, \
           green_driving_value = EXCLUDED.green_driving_value, dynamic_io = EXCLUDED.dynamic_io, \
           is_valid = EXCLUDED.is_valid, updateddate = NOW()",
        &[
            &r.imei,
            &r.gps_time,
            &r.server_time,
            &r.latitude,
            &r.longitude,
            &r.altitude,
            &r.angle,
            &r.satellites,
            &r.speed,
            &r.reference_id,
            &r.distance,
            &r.vendor,
            &r.status,
            &r.ignition,
            &r.driver_seatbelt,
            &r.passenger_seatbelt,
            &r.door_status,
            &r.passenger_seat,
            &r.main_battery,
            &r.battery_voltage,
            &r.fuel,
            &r.dallas_temperature_1,
            &r.dallas_temperature_2,
            &r.dallas_temperature_3,
            &r.dallas_temperature_4,
            &r.ble_temperature_1,
            &r.ble_temperature_2,
            &r.ble_temperature_3,
            &r.ble_temperature_4,
            &r.ble_humidity_1,
            &r.ble_humidity_2,
            &r.ble_humidity_3,
            &r.ble_humidity_4,
            &r.green_driving_value,
            &r.dynamic_io,
            &r.is_valid,
        ],
    )
    .await?;
    Ok(())
}

/// ON CONFLICT DO NOTHING tolerates concurrent workers marking the same id.
async fn mark_processed_tx(
    tx: &tokio_postgres::Transaction<'_>,
    message_ids: &[String],
) -> anyhow::Result<()> {
    if message_ids.is_empty() {
        return Ok(());
    }
    tx.execute(
        "INSERT INTO processed_message_ids (message_id) \
         SELECT unnest($1::text[]) ON CONFLICT DO NOTHING",
        &[&message_ids],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multirow_sql_shape() {
        let sql = multirow_upsert_sql("trackdata", &["imei", "gps_time", "speed"], 2, None);
        assert!(sql.starts_with("INSERT INTO trackdata (imei, gps_time, speed) VALUES ($1, $2, $3), ($4, $5, $6)"));
        assert!(sql.contains("ON CONFLICT (imei, gps_time) DO UPDATE SET speed = EXCLUDED.speed"));
        assert!(!sql.contains("imei = EXCLUDED.imei"));
    }

    #[test]
    fn returning_clause_appended() {
        let sql = multirow_upsert_sql("alarms", &["imei", "gps_time"], 1, Some("imei, gps_time, id"));
        assert!(sql.ends_with("RETURNING imei, gps_time, id"));
    }

    #[test]
    fn alarm_cols_exclude_dispatcher_owned() {
        for owned in ["sms_sent_at", "email_sent_at", "call_sent_at", "retry_count"] {
            assert!(!ALARM_COLS.contains(&owned), "{owned} must stay dispatcher-owned");
        }
    }

    #[test]
    fn column_count_matches_param_pushers() {
        let r = TrackRecord::from_payload(&serde_json::json!({
            "imei": 1, "latitude": 1.0, "longitude": 2.0
        }))
        .unwrap();
        let mut params: Vec<SqlParam> = Vec::new();
        push_track_params(&mut params, &r);
        assert_eq!(params.len(), TRACK_COLS.len());
        assert_eq!(ALARM_COLS.len(), TRACK_COLS.len() + 7);
        assert_eq!(EVENT_COLS.len(), TRACK_COLS.len() + 2);
    }
}
