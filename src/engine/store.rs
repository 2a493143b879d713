use chrono::NaiveDateTime;
use serde_json::Value;
use tokio_postgres::types::ToSql;

use crate::db::{Db, SqlParam, param_refs};
use crate::models::laststatus::{EngineState, Patch, PriorState, StateDelta, VehicleState};
use crate::models::metric_event::MetricEvent;
use crate::models::record::TrackRecord;
use crate::models::trip::{
    ActiveRouteTrip, FenceRef, FenceWiseTrip, PendingUpload, RoundTrip, RouteAssignment,
    StoppageEntry, TRIP_STATUS_COMPLETED, TRIP_STATUS_ONGOING, TRIP_TYPE_IGNITION,
    TRIP_TYPE_ROUND, TRIP_TYPE_ROUTE, Tracker,
};

fn push_patch<T>(sets: &mut Vec<String>, params: &mut Vec<SqlParam>, col: &str, patch: &Patch<T>)
where
    T: ToSql + Sync + Send + Clone + 'static,
{
    match patch {
        Patch::Keep => {}
        Patch::Set(v) => {
            params.push(Box::new(v.clone()));
            sets.push(format!("{col} = ${}", params.len()));
        }
        Patch::Clear => sets.push(format!("{col} = NULL")),
    }
}

fn fence_ids_from_json(v: Option<Value>) -> Vec<i64> {
    match v {
        Some(Value::Array(items)) => items.iter().filter_map(|x| x.as_i64()).collect(),
        _ => Vec::new(),
    }
}

/// Engine-side queries: prior state, engine-column updates, metric events,
/// trips, calibration, and the engine's own message bookkeeping.
impl Db {
    pub async fn read_prior_state(&self, imei: i64) -> anyhow::Result<PriorState> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT latitude, longitude, gps_time, server_time, vehicle_state, \
                        last_processed_gps_time, idle_start_time, speeding_start_time, \
                        speeding_max_speed, last_violation_time, last_violation_type, \
                        temp_violation_start, humidity_violation_start, prev_temp_value, \
                        prev_fuel_level, trip_in_progress, current_trip_id, current_fence_ids, \
                        driving_session_start, driving_session_distance, rest_start_time, \
                        seatbelt_unbuckled_start, seatbelt_unbuckled_distance, \
                        stoppage_start_time, stoppage_start_lat, stoppage_start_lon, \
                        last_distance_km \
                 FROM laststatus WHERE imei = $1",
                &[&imei],
            )
            .await?;
        let Some(row) = row else {
            return Ok(PriorState::default());
        };
        Ok(PriorState {
            exists: true,
            latitude: row.get(0),
            longitude: row.get(1),
            gps_time: row.get(2),
            server_time: row.get(3),
            engine: EngineState {
                vehicle_state: row.get::<_, Option<String>>(4).as_deref().and_then(VehicleState::parse),
                last_processed_gps_time: row.get(5),
                idle_start_time: row.get(6),
                speeding_start_time: row.get(7),
                speeding_max_speed: row.get(8),
                last_violation_time: row.get(9),
                last_violation_type: row.get(10),
                temp_violation_start: row.get(11),
                humidity_violation_start: row.get(12),
                prev_temp_value: row.get(13),
                prev_fuel_level: row.get(14),
                trip_in_progress: row.get::<_, Option<bool>>(15).unwrap_or(false),
                current_trip_id: row.get(16),
                current_fence_ids: fence_ids_from_json(row.get(17)),
                driving_session_start: row.get(18),
                driving_session_distance: row.get(19),
                rest_start_time: row.get(20),
                seatbelt_unbuckled_start: row.get(21),
                seatbelt_unbuckled_distance: row.get(22),
                stoppage_start_time: row.get(23),
                stoppage_start_lat: row.get(24),
                stoppage_start_lon: row.get(25),
                last_distance_km: row.get(26),
            },
        })
    }

    /// Apply a state delta to the engine-owned laststatus columns. When
    /// `insert_if_missing` carries a position, a minimal row is created first
    /// so a brand-new device is persisted on first observation.
    pub async fn update_laststatus_engine(
        &self,
        imei: i64,
        delta: &StateDelta,
        gps_time: NaiveDateTime,
        insert_if_missing: Option<(f64, f64)>,
    ) -> anyhow::Result<()> {
        let client = self.client().await?;
        if let Some((lat, lon)) = insert_if_missing {
            client
                .execute(
                    "INSERT INTO laststatus (imei, latitude, longitude, gps_time) \
                     VALUES ($1, $2, $3, $4) ON CONFLICT (imei) DO NOTHING",
                    &[&imei, &lat, &lon, &gps_time],
                )
                .await?;
        }

        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        match &delta.vehicle_state {
            Patch::Keep => {}
            Patch::Set(v) => {
                params.push(Box::new(v.as_str().to_string()));
                sets.push(format!("vehicle_state = ${}", params.len()));
            }
            Patch::Clear => sets.push("vehicle_state = NULL".to_string()),
        }
        push_patch(&mut sets, &mut params, "idle_start_time", &delta.idle_start_time);
        push_patch(&mut sets, &mut params, "speeding_start_time", &delta.speeding_start_time);
        push_patch(&mut sets, &mut params, "speeding_max_speed", &delta.speeding_max_speed);
        push_patch(&mut sets, &mut params, "last_violation_time", &delta.last_violation_time);
        push_patch(&mut sets, &mut params, "last_violation_type", &delta.last_violation_type);
        push_patch(&mut sets, &mut params, "temp_violation_start", &delta.temp_violation_start);
        push_patch(&mut sets, &mut params, "humidity_violation_start", &delta.humidity_violation_start);
        push_patch(&mut sets, &mut params, "prev_temp_value", &delta.prev_temp_value);
        push_patch(&mut sets, &mut params, "prev_fuel_level", &delta.prev_fuel_level);
        match &delta.trip_in_progress {
            Patch::Keep => {}
            Patch::Set(v) => {
                params.push(Box::new(*v));
                sets.push(format!("trip_in_progress = ${}", params.len()));
            }
            // Column is NOT NULL; clearing means "no trip".
            Patch::Clear => sets.push("trip_in_progress = FALSE".to_string()),
        }
        push_patch(&mut sets, &mut params, "current_trip_id", &delta.current_trip_id);
        match &delta.current_fence_ids {
            Patch::Keep => {}
            Patch::Set(ids) => {
                params.push(Box::new(Value::from(ids.clone())));
                sets.push(format!("current_fence_ids = ${}", params.len()));
            }
            Patch::Clear => sets.push("current_fence_ids = NULL".to_string()),
        }
        push_patch(&mut sets, &mut params, "driving_session_start", &delta.driving_session_start);
        push_patch(&mut sets, &mut params, "driving_session_distance", &delta.driving_session_distance);
        push_patch(&mut sets, &mut params, "rest_start_time", &delta.rest_start_time);
        push_patch(&mut sets, &mut params, "seatbelt_unbuckled_start", &delta.seatbelt_unbuckled_start);
        push_patch(&mut sets, &mut params, "seatbelt_unbuckled_distance", &delta.seatbelt_unbuckled_distance);
        push_patch(&mut sets, &mut params, "stoppage_start_time", &delta.stoppage_start_time);
        push_patch(&mut sets, &mut params, "stoppage_start_lat", &delta.stoppage_start_lat);
        push_patch(&mut sets, &mut params, "stoppage_start_lon", &delta.stoppage_start_lon);
        push_patch(&mut sets, &mut params, "last_distance_km", &delta.last_distance_km);

        params.push(Box::new(gps_time));
        sets.push(format!("last_processed_gps_time = ${}", params.len()));

        params.push(Box::new(imei));
        let sql = format!(
            "UPDATE laststatus SET {} WHERE imei = ${}",
            sets.join(", "),
            params.len()
        );
        client.execute(sql.as_str(), &param_refs(&params)).await?;
        Ok(())
    }

    pub async fn insert_laststatus_history(
        &self,
        imei: i64,
        gps_time: NaiveDateTime,
        previous_state: Option<VehicleState>,
        new_state: VehicleState,
    ) -> anyhow::Result<()> {
        let client = self.client().await?;
        let prev = previous_state.map(|s| s.as_str());
        client
            .execute(
                "INSERT INTO laststatus_history (imei, gps_time, previous_state, new_state) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (imei, gps_time) DO NOTHING",
                &[&imei, &gps_time, &prev, &new_state.as_str()],
            )
            .await?;
        Ok(())
    }

    pub async fn insert_metric_events(&self, events: &[MetricEvent]) -> anyhow::Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        let client = self.client().await?;
        let mut values = String::new();
        let mut params: Vec<SqlParam> = Vec::with_capacity(events.len() * 14);
        for (i, ev) in events.iter().enumerate() {
            if i > 0 {
                values.push_str(", ");
            }
            let base = i * 14;
            values.push_str(&format!(
                "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                base + 1, base + 2, base + 3, base + 4, base + 5, base + 6, base + 7,
                base + 8, base + 9, base + 10, base + 11, base + 12, base + 13, base + 14
            ));
            params.push(Box::new(ev.imei));
            params.push(Box::new(ev.gps_time));
            params.push(Box::new(ev.event_category.to_string()));
            params.push(Box::new(ev.event_type.to_string()));
            params.push(Box::new(ev.event_value));
            params.push(Box::new(ev.threshold_value));
            params.push(Box::new(ev.duration_sec));
            params.push(Box::new(ev.severity.to_string()));
            params.push(Box::new(ev.latitude));
            params.push(Box::new(ev.longitude));
            params.push(Box::new(ev.fence_id));
            params.push(Box::new(ev.trip_id));
            params.push(Box::new(ev.metadata_json()));
            params.push(Box::new(ev.formula_version.map(|s| s.to_string())));
        }
        let sql = format!(
            "INSERT INTO metric_events (imei, gps_time, event_category, event_type, event_value, \
             threshold_value, duration_sec, severity, latitude, longitude, fence_id, trip_id, \
             metadata, formula_version) VALUES {values}"
        );
        Ok(client.execute(sql.as_str(), &param_refs(&params)).await?)
    }

    pub async fn insert_stoppage_logs(&self, entries: &[StoppageEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let client = self.client().await?;
        for e in entries {
            client
                .execute(
                    "INSERT INTO trip_stoppage_log (trip_id, stoppage_type, start_time, end_time, \
                     latitude, longitude, inside_fence_id) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    &[
                        &e.trip_id,
                        &e.stoppage_type,
                        &e.start_time,
                        &e.end_time,
                        &e.latitude,
                        &e.longitude,
                        &e.inside_fence_id,
                    ],
                )
                .await?;
        }
        Ok(())
    }

    pub async fn get_tracker(&self, imei: i64) -> anyhow::Result<Option<Tracker>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT imei, vehicle_id, has_fuel_sensor, has_temp_sensor, has_humidity_sensor, \
                        has_seatbelt_sensor, has_mdvr FROM tracker WHERE imei = $1",
                &[&imei],
            )
            .await?;
        Ok(row.map(|r| Tracker {
            imei: r.get(0),
            vehicle_id: r.get(1),
            has_fuel_sensor: r.get(2),
            has_temp_sensor: r.get(3),
            has_humidity_sensor: r.get(4),
            has_seatbelt_sensor: r.get(5),
            has_mdvr: r.get(6),
        }))
    }

    // ── Trips ──

    pub async fn create_ignition_trip(
        &self,
        vehicle_id: i64,
        start_time: NaiveDateTime,
        lat: Option<f64>,
        lon: Option<f64>,
    ) -> anyhow::Result<i64> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO trip (vehicle_id, trip_type, status, creation_mode, trip_start_time, \
                 start_latitude, start_longitude) VALUES ($1, $2, $3, 'Automatic', $4, $5, $6) \
                 RETURNING trip_id",
                &[&vehicle_id, &TRIP_TYPE_IGNITION, &TRIP_STATUS_ONGOING, &start_time, &lat, &lon],
            )
            .await?;
        Ok(row.get(0))
    }

    pub async fn complete_trip(
        &self,
        trip_id: i64,
        end_time: NaiveDateTime,
        lat: Option<f64>,
        lon: Option<f64>,
    ) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE trip SET status = $1, trip_end_time = $2, end_latitude = $3, \
                 end_longitude = $4, \
                 total_duration_sec = GREATEST(0, EXTRACT(EPOCH FROM ($2 - trip_start_time))::BIGINT) \
                 WHERE trip_id = $5 AND status = $6",
                &[&TRIP_STATUS_COMPLETED, &end_time, &lat, &lon, &trip_id, &TRIP_STATUS_ONGOING],
            )
            .await?;
        Ok(())
    }

    pub async fn update_trip_accumulation(
        &self,
        trip_id: i64,
        distance_km: f64,
        gps_time: NaiveDateTime,
    ) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE trip SET total_distance_km = total_distance_km + $1, \
                 total_duration_sec = GREATEST(0, EXTRACT(EPOCH FROM ($2 - trip_start_time))::BIGINT) \
                 WHERE trip_id = $3 AND status = $4",
                &[&distance_km, &gps_time, &trip_id, &TRIP_STATUS_ONGOING],
            )
            .await?;
        Ok(())
    }

    pub async fn active_fence_wise_trips(&self, vehicle_id: i64) -> anyhow::Result<Vec<FenceWiseTrip>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT t.trip_id, e.origin_fence_id, e.destination_fence_id, e.source_exit_time, \
                        e.destination_arrival_time \
                 FROM trip t JOIN trip_fence_wise_extension e ON e.trip_id = t.trip_id \
                 WHERE t.vehicle_id = $1 AND t.status = $2",
                &[&vehicle_id, &TRIP_STATUS_ONGOING],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| FenceWiseTrip {
                trip_id: r.get(0),
                origin_fence_id: r.get(1),
                destination_fence_id: r.get(2),
                source_exit_time: r.get(3),
                destination_arrival_time: r.get(4),
            })
            .collect())
    }

    pub async fn set_fence_wise_source_exit(&self, trip_id: i64, at: NaiveDateTime) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE trip_fence_wise_extension SET source_exit_time = $1 \
                 WHERE trip_id = $2 AND source_exit_time IS NULL",
                &[&at, &trip_id],
            )
            .await?;
        Ok(())
    }

    pub async fn set_fence_wise_destination_arrival(&self, trip_id: i64, at: NaiveDateTime) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE trip_fence_wise_extension SET destination_arrival_time = $1 \
                 WHERE trip_id = $2 AND destination_arrival_time IS NULL",
                &[&at, &trip_id],
            )
            .await?;
        Ok(())
    }

    pub async fn active_round_trips(&self, vehicle_id: i64) -> anyhow::Result<Vec<RoundTrip>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT t.trip_id, e.planned_fence_id, e.destination_arrival_time, e.destination_exit_time \
                 FROM trip t JOIN trip_round_extension e ON e.trip_id = t.trip_id \
                 WHERE t.vehicle_id = $1 AND t.status = $2",
                &[&vehicle_id, &TRIP_STATUS_ONGOING],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| RoundTrip {
                trip_id: r.get(0),
                planned_fence_id: r.get(1),
                destination_arrival_time: r.get(2),
                destination_exit_time: r.get(3),
            })
            .collect())
    }

    pub async fn set_round_trip_arrival(&self, trip_id: i64, at: NaiveDateTime) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE trip_round_extension SET destination_arrival_time = $1 \
                 WHERE trip_id = $2 AND destination_arrival_time IS NULL",
                &[&at, &trip_id],
            )
            .await?;
        Ok(())
    }

    pub async fn finish_round_trip(
        &self,
        trip_id: i64,
        exit_at: NaiveDateTime,
        time_compliance: &str,
    ) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE trip_round_extension SET destination_exit_time = $1, \
                 deviation_status = 'Non-Deviated', time_compliance = $2 WHERE trip_id = $3",
                &[&exit_at, &time_compliance, &trip_id],
            )
            .await?;
        Ok(())
    }

    /// First unconsumed upload-sheet row whose start time has passed.
    pub async fn pending_upload(&self, vehicle_id: i64) -> anyhow::Result<Option<PendingUpload>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT upload_id, destination_fence_id, start_ts FROM upload_sheet \
                 WHERE vehicle_id = $1 AND consumed = FALSE AND destination_fence_id IS NOT NULL \
                   AND start_ts <= (NOW() AT TIME ZONE 'UTC') \
                 ORDER BY start_ts LIMIT 1",
                &[&vehicle_id],
            )
            .await?;
        Ok(row.map(|r| PendingUpload {
            upload_id: r.get(0),
            destination_fence_id: r.get(1),
            start_ts: r.get(2),
        }))
    }

    pub async fn create_round_trip(
        &self,
        vehicle_id: i64,
        upload: &PendingUpload,
        lat: f64,
        lon: f64,
    ) -> anyhow::Result<i64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_one(
                "INSERT INTO trip (vehicle_id, trip_type, status, creation_mode, trip_start_time, \
                 start_latitude, start_longitude) VALUES ($1, $2, $3, 'Automatic', $4, $5, $6) \
                 RETURNING trip_id",
                &[&vehicle_id, &TRIP_TYPE_ROUND, &TRIP_STATUS_ONGOING, &upload.start_ts, &lat, &lon],
            )
            .await?;
        let trip_id: i64 = row.get(0);
        tx.execute(
            "INSERT INTO trip_round_extension (trip_id, upload_id, planned_fence_id) VALUES ($1, $2, $3)",
            &[&trip_id, &upload.upload_id, &upload.destination_fence_id],
        )
        .await?;
        tx.execute("UPDATE upload_sheet SET consumed = TRUE WHERE upload_id = $1", &[&upload.upload_id])
            .await?;
        tx.commit().await?;
        Ok(trip_id)
    }

    pub async fn route_assignment_for_vehicle(&self, vehicle_id: i64) -> anyhow::Result<Option<RouteAssignment>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT route_id FROM route_assignment WHERE vehicle_id = $1 AND active = TRUE LIMIT 1",
                &[&vehicle_id],
            )
            .await?;
        Ok(row.map(|r| RouteAssignment { route_id: r.get(0) }))
    }

    pub async fn active_route_trip(&self, vehicle_id: i64) -> anyhow::Result<Option<ActiveRouteTrip>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT t.trip_id, e.deviation_count FROM trip t \
                 JOIN trip_route_extension e ON e.trip_id = t.trip_id \
                 WHERE t.vehicle_id = $1 AND t.status = $2 AND t.trip_type = $3 LIMIT 1",
                &[&vehicle_id, &TRIP_STATUS_ONGOING, &TRIP_TYPE_ROUTE],
            )
            .await?;
        Ok(row.map(|r| ActiveRouteTrip { trip_id: r.get(0), deviation_count: r.get(1) }))
    }

    pub async fn create_route_trip(
        &self,
        vehicle_id: i64,
        route_id: i64,
        start_time: NaiveDateTime,
        lat: f64,
        lon: f64,
    ) -> anyhow::Result<i64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_one(
                "INSERT INTO trip (vehicle_id, trip_type, status, creation_mode, trip_start_time, \
                 start_latitude, start_longitude) VALUES ($1, $2, $3, 'Automatic', $4, $5, $6) \
                 RETURNING trip_id",
                &[&vehicle_id, &TRIP_TYPE_ROUTE, &TRIP_STATUS_ONGOING, &start_time, &lat, &lon],
            )
            .await?;
        let trip_id: i64 = row.get(0);
        tx.execute(
            "INSERT INTO trip_route_extension (trip_id, route_id) VALUES ($1, $2)",
            &[&trip_id, &route_id],
        )
        .await?;
        tx.commit().await?;
        Ok(trip_id)
    }

    pub async fn set_route_trip_deviated(&self, trip_id: i64, deviation_count: i32) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE trip_route_extension SET deviation_count = $1, deviation_status = 'Deviated' \
                 WHERE trip_id = $2",
                &[&deviation_count, &trip_id],
            )
            .await?;
        Ok(())
    }

    /// Fuel consumed across each completed trip of a vehicle, from
    /// calibration-translated litres at the trip boundaries.
    pub async fn recompute_trip_fuel(&self, vehicle_id: i64) -> anyhow::Result<u64> {
        let client = self.client().await?;
        Ok(client
            .execute(
                "UPDATE trip t SET fuel_consumed = sub.start_liters - sub.end_liters \
                 FROM ( \
                   SELECT t2.trip_id, \
                     (SELECT c.liters_min + (td.fuel - c.raw_min) / NULLIF(c.raw_max - c.raw_min, 0) \
                             * (c.liters_max - c.liters_min) \
                      FROM trackdata td JOIN tracker tr ON tr.imei = td.imei \
                      JOIN calibration c ON c.vehicle_id = tr.vehicle_id \
                        AND td.fuel BETWEEN c.raw_min AND c.raw_max \
                      WHERE tr.vehicle_id = t2.vehicle_id AND td.fuel IS NOT NULL \
                        AND td.gps_time >= t2.trip_start_time \
                      ORDER BY td.gps_time ASC, c.raw_min ASC LIMIT 1) AS start_liters, \
                     (SELECT c.liters_min + (td.fuel - c.raw_min) / NULLIF(c.raw_max - c.raw_min, 0) \
                             * (c.liters_max - c.liters_min) \
                      FROM trackdata td JOIN tracker tr ON tr.imei = td.imei \
                      JOIN calibration c ON c.vehicle_id = tr.vehicle_id \
                        AND td.fuel BETWEEN c.raw_min AND c.raw_max \
                      WHERE tr.vehicle_id = t2.vehicle_id AND td.fuel IS NOT NULL \
                        AND td.gps_time <= t2.trip_end_time \
                      ORDER BY td.gps_time DESC, c.raw_min ASC LIMIT 1) AS end_liters \
                   FROM trip t2 \
                   WHERE t2.vehicle_id = $1 AND t2.status = 'Completed' AND t2.trip_end_time IS NOT NULL \
                 ) sub \
                 WHERE t.trip_id = sub.trip_id \
                   AND sub.start_liters IS NOT NULL AND sub.end_liters IS NOT NULL",
                &[&vehicle_id],
            )
            .await?)
    }

    // ── Fences / calibration / alarm config ──

    /// Fences the tracker is eligible for, via vehicle → client.
    pub async fn fences_for_imei(&self, imei: i64) -> anyhow::Result<Vec<FenceRef>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT f.fence_id, COALESCE(f.buffer_distance, 50) FROM fence f \
                 JOIN vehicle v ON v.client_id = f.client_id \
                 JOIN tracker t ON t.vehicle_id = v.vehicle_id \
                 WHERE t.imei = $1 AND f.active = TRUE AND f.polygon IS NOT NULL",
                &[&imei],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| FenceRef { fence_id: r.get(0), buffer_distance_m: r.get(1) })
            .collect())
    }

    /// Piecewise-linear raw-sensor → litres translation.
    pub async fn fuel_liters(&self, vehicle_id: i64, raw: f64) -> anyhow::Result<Option<f64>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT raw_min, raw_max, liters_min, liters_max FROM calibration \
                 WHERE vehicle_id = $1 AND $2 >= raw_min AND $2 <= raw_max \
                 ORDER BY raw_min LIMIT 1",
                &[&vehicle_id, &raw],
            )
            .await?;
        Ok(row.map(|r| {
            let (raw_min, raw_max): (f64, f64) = (r.get(0), r.get(1));
            let (l_min, l_max): (f64, f64) = (r.get(2), r.get(3));
            if (raw_max - raw_min).abs() < f64::EPSILON {
                l_min
            } else {
                l_min + (raw - raw_min) / (raw_max - raw_min) * (l_max - l_min)
            }
        }))
    }

    /// Events allowed onto the alarm exchange: no config row means publish;
    /// otherwise enabled + is_alarm must both hold.
    pub async fn metrics_alarm_suppressed(
        &self,
        imei: i64,
        event_type: &str,
    ) -> anyhow::Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT enabled, is_alarm FROM metrics_alarm_config WHERE imei = $1 AND event_type = $2",
                &[&imei, &event_type],
            )
            .await?;
        Ok(match row {
            None => false,
            Some(r) => !(r.get::<_, bool>(0) && r.get::<_, i16>(1) != 0),
        })
    }

    // ── Engine message bookkeeping (separate tables from the consumer's) ──

    pub async fn is_engine_message_processed(&self, signature: &str) -> bool {
        let result: anyhow::Result<bool> = async {
            let client = self.client().await?;
            Ok(client
                .query_opt(
                    "SELECT 1 FROM metric_engine_processed_messages WHERE message_id = $1",
                    &[&signature],
                )
                .await?
                .is_some())
        }
        .await;
        result.unwrap_or(false)
    }

    pub async fn mark_engine_message_processed(&self, signature: &str) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO metric_engine_processed_messages (message_id) VALUES ($1) \
                 ON CONFLICT DO NOTHING",
                &[&signature],
            )
            .await?;
        Ok(())
    }

    pub async fn increment_engine_retry(&self, signature: &str, error: Option<&str>) -> i32 {
        let truncated = error.map(|e| e.chars().take(500).collect::<String>());
        let result: anyhow::Result<i32> = async {
            let client = self.client().await?;
            let row = client
                .query_one(
                    "INSERT INTO metric_engine_message_retries (message_id, retry_count, last_error) \
                     VALUES ($1, 1, $2) \
                     ON CONFLICT (message_id) DO UPDATE SET \
                       retry_count = metric_engine_message_retries.retry_count + 1, \
                       last_error = EXCLUDED.last_error, last_attempt_at = NOW() \
                     RETURNING retry_count",
                    &[&signature, &truncated],
                )
                .await?;
            Ok(row.get(0))
        }
        .await;
        result.unwrap_or(1)
    }

    pub async fn clear_engine_retry(&self, signature: &str) {
        let result: anyhow::Result<()> = async {
            let client = self.client().await?;
            client
                .execute("DELETE FROM metric_engine_message_retries WHERE message_id = $1", &[&signature])
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::debug!("engine retry clear failed: {e:#}");
        }
    }

    /// One page of historical trackdata for recalculation, in gps_time order.
    pub async fn trackdata_page(
        &self,
        imei: i64,
        from: NaiveDateTime,
        to: NaiveDateTime,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<TrackRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT imei, gps_time, server_time, latitude, longitude, altitude, angle, \
                        satellites, speed, status, vendor, ignition, driver_seatbelt, \
                        passenger_seatbelt, door_status, passenger_seat, main_battery, \
                        battery_voltage, fuel, dallas_temperature_1, dallas_temperature_2, \
                        dallas_temperature_3, dallas_temperature_4, ble_temperature_1, \
                        ble_temperature_2, ble_temperature_3, ble_temperature_4, ble_humidity_1, \
                        ble_humidity_2, ble_humidity_3, ble_humidity_4, green_driving_value, \
                        dynamic_io, is_valid, reference_id, distance \
                 FROM trackdata WHERE imei = $1 AND gps_time >= $2 AND gps_time <= $3 \
                 ORDER BY gps_time ASC LIMIT $4 OFFSET $5",
                &[&imei, &from, &to, &limit, &offset],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| TrackRecord {
                imei: r.get(0),
                gps_time: r.get(1),
                server_time: r.get(2),
                latitude: r.get(3),
                longitude: r.get(4),
                altitude: r.get(5),
                angle: r.get(6),
                satellites: r.get(7),
                speed: r.get(8),
                status: r.get(9),
                vendor: r.get(10),
                ignition: r.get(11),
                driver_seatbelt: r.get(12),
                passenger_seatbelt: r.get(13),
                door_status: r.get(14),
                passenger_seat: r.get(15),
                main_battery: r.get(16),
                battery_voltage: r.get(17),
                fuel: r.get(18),
                dallas_temperature_1: r.get(19),
                dallas_temperature_2: r.get(20),
                dallas_temperature_3: r.get(21),
                dallas_temperature_4: r.get(22),
                ble_temperature_1: r.get(23),
                ble_temperature_2: r.get(24),
                ble_temperature_3: r.get(25),
                ble_temperature_4: r.get(26),
                ble_humidity_1: r.get(27),
                ble_humidity_2: r.get(28),
                ble_humidity_3: r.get(29),
                ble_humidity_4: r.get(30),
                green_driving_value: r.get(31),
                dynamic_io: r.get(32),
                is_valid: r.get(33),
                reference_id: r.get(34),
                distance: r.get(35),
            })
            .collect())
    }
}
