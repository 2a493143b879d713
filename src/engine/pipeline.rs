use std::sync::Arc;

use serde_json::Value;

use crate::db::Db;
use crate::engine::context::CalcContext;
use crate::engine::pending::{PendingWrite, PendingWrites};
use crate::engine::publisher;
use crate::engine::registry::Registry;
use crate::infra::broker::Broker;
use crate::infra::config_cache::ConfigCache;
use crate::models::laststatus::{Patch, PriorState, TripAction};
use crate::models::record::{RecordError, TrackRecord};
use crate::models::trip::StoppageEntry;

/// The per-record metric pipeline: validate, load prior state and config,
/// run the calculator chain, then apply state updates, trips, stoppages and
/// events. Backfill runs replay against a caller-owned state and write only
/// metric events, so recalculation can never disturb live `laststatus` rows
/// or duplicate trips and stoppage logs.
pub struct Pipeline {
    pub db: Arc<Db>,
    pub broker: Option<Arc<Broker>>,
    pub config_cache: Arc<ConfigCache>,
    pub registry: Arc<Registry>,
    pub pending: Arc<PendingWrites>,
    pub shadow_mode: bool,
}

impl Pipeline {
    /// Live path: one broker payload (the `data` object).
    pub async fn process_payload(&self, data: &Value) -> anyhow::Result<()> {
        let record = match TrackRecord::from_payload(data) {
            Ok(r) => r,
            Err(e) => {
                let reason = match e {
                    RecordError::MissingImei => "missing_imei",
                    RecordError::InvalidImei => "invalid_imei",
                };
                self.reject_invalid(data, reason).await;
                return Ok(());
            }
        };
        if let Some(reason) = record.validation_error() {
            self.reject_invalid(data, reason).await;
            return Ok(());
        }
        self.run_record(&record, false, None).await
    }

    /// Recalculation path: replay one stored record against a running state.
    pub async fn process_backfill_record(
        &self,
        record: &TrackRecord,
        state: &mut PriorState,
    ) -> anyhow::Result<()> {
        self.run_record(record, true, Some(state)).await
    }

    async fn run_record(
        &self,
        record: &TrackRecord,
        backfill: bool,
        mut state_override: Option<&mut PriorState>,
    ) -> anyhow::Result<()> {
        let imei = record.imei;
        let gps_time = record.gps_time;

        let prior: PriorState = match state_override.as_deref() {
            Some(s) => s.clone(),
            None => self.db.read_prior_state(imei).await?,
        };

        // Consumer races can deliver out of order; anything at or before the
        // last processed point is dropped.
        let last_seen = prior.engine.last_processed_gps_time.or(prior.gps_time);
        if let Some(last) = last_seen {
            if gps_time <= last {
                tracing::debug!("skipping stale record imei={imei} gps_time={gps_time} <= {last}");
                return Ok(());
            }
        }

        let config = self.config_cache.resolve(imei).await;
        let tracker = self.db.get_tracker(imei).await.unwrap_or(None);
        let vehicle_id = tracker.as_ref().and_then(|t| t.vehicle_id);

        let ctx = CalcContext {
            imei,
            record,
            gps_time,
            prev: &prior,
            config: &config,
            vehicle_id,
            db: Some(&self.db),
        };
        let mut outcome = self.registry.run(&ctx, tracker.as_ref(), &config).await;

        if self.shadow_mode && !backfill {
            tracing::info!(
                "shadow_mode: imei={imei} gps_time={gps_time} delta_empty={} events={}",
                outcome.delta.is_empty(),
                outcome.events.len()
            );
            return Ok(());
        }

        // Events attach to whichever trip is current after this record.
        let effective_trip_id = match &outcome.delta.current_trip_id {
            Patch::Set(id) => Some(*id),
            _ => prior.engine.current_trip_id,
        };

        if backfill {
            for ev in &mut outcome.events {
                if ev.trip_id.is_none() {
                    ev.trip_id = effective_trip_id;
                }
            }
            if !outcome.events.is_empty() {
                self.db.insert_metric_events(&outcome.events).await?;
            }
            if let Some(state) = state_override.as_deref_mut() {
                outcome.delta.apply_to(&mut state.engine);
                state.engine.last_processed_gps_time = Some(gps_time);
                state.latitude = Some(record.latitude);
                state.longitude = Some(record.longitude);
                state.gps_time = Some(gps_time);
                state.server_time = Some(record.server_time);
            }
            return Ok(());
        }

        // Resolve the ignition trip action in one DB step.
        let mut trip_ended: Option<i64> = None;
        match outcome.delta.trip_action.take() {
            Some(TripAction::Start { time, lat, lon }) => {
                if let Some(vehicle_id) = vehicle_id {
                    match self.db.create_ignition_trip(vehicle_id, time, lat, lon).await {
                        Ok(trip_id) => {
                            outcome.delta.current_trip_id = Patch::Set(trip_id);
                            outcome.delta.trip_in_progress = Patch::Set(true);
                        }
                        Err(e) => tracing::warn!("trip start failed for imei={imei}: {e:#}"),
                    }
                } else {
                    tracing::debug!("ignition-on without vehicle mapping for imei={imei}; no trip");
                }
            }
            Some(TripAction::End { time, lat, lon }) => {
                if let Some(trip_id) = prior.engine.current_trip_id {
                    if let Err(e) = self.db.complete_trip(trip_id, time, lat, lon).await {
                        tracing::warn!("trip completion failed for trip={trip_id}: {e:#}");
                    }
                    trip_ended = Some(trip_id);
                }
            }
            None => {}
        }
        let effective_trip_id = match &outcome.delta.current_trip_id {
            Patch::Set(id) => Some(*id),
            _ => prior.engine.current_trip_id,
        };
        for ev in &mut outcome.events {
            if ev.trip_id.is_none() {
                ev.trip_id = effective_trip_id;
            }
        }

        let insert_if_missing = (!prior.exists).then_some((record.latitude, record.longitude));
        let distance_km = record.distance.map(|m| m / 1000.0).filter(|km| *km > 0.0);

        if !outcome.delta.is_empty() {
            let write = self
                .db
                .write_breaker
                .call(|| async {
                    self.db
                        .update_laststatus_engine(imei, &outcome.delta, gps_time, insert_if_missing)
                        .await
                })
                .await;
            if let Err(e) = write {
                if !e.is_open() {
                    tracing::warn!("laststatus update failed (queueing): imei={imei} {e}");
                }
                self.pending
                    .push(PendingWrite {
                        imei,
                        delta: outcome.delta.clone(),
                        events: outcome.events.clone(),
                        gps_time,
                        distance_km,
                        trip_id: effective_trip_id,
                        insert_if_missing,
                    })
                    .await;
                return Ok(());
            }
        }

        // Vehicle-state transitions feed the append-only history log.
        if let Patch::Set(new_state) = &outcome.delta.vehicle_state {
            let new_state = *new_state;
            if prior.engine.vehicle_state != Some(new_state) {
                if let Err(e) = self
                    .db
                    .insert_laststatus_history(imei, gps_time, prior.engine.vehicle_state, new_state)
                    .await
                {
                    tracing::warn!("laststatus_history insert failed: {e:#}");
                }
            }
        }

        if let (Some(trip_id), Some(km)) = (effective_trip_id, distance_km) {
            if let Err(e) = self.db.update_trip_accumulation(trip_id, km, gps_time).await {
                tracing::warn!("trip accumulation failed for trip={trip_id}: {e:#}");
            }
        }

        // A trip ending with an open stop closes it as a final Stop entry.
        if let (Some(trip_id), Some(stop_start)) = (trip_ended, prior.engine.stoppage_start_time) {
            outcome.stoppages.push(StoppageEntry {
                trip_id,
                stoppage_type: "Stop",
                start_time: stop_start,
                end_time: gps_time,
                latitude: prior.engine.stoppage_start_lat,
                longitude: prior.engine.stoppage_start_lon,
                inside_fence_id: None,
            });
        }
        if let Err(e) = self.db.insert_stoppage_logs(&outcome.stoppages).await {
            tracing::warn!("stoppage log insert failed: {e:#}");
        }

        if !outcome.events.is_empty() {
            let insert = self
                .db
                .write_breaker
                .call(|| async { self.db.insert_metric_events(&outcome.events).await })
                .await;
            match insert {
                Ok(_) => {
                    if let Some(broker) = &self.broker {
                        publisher::publish_metric_events(broker, &self.db, &outcome.events).await;
                    }
                }
                Err(e) => {
                    if !e.is_open() {
                        tracing::warn!("metric event insert failed (queueing): imei={imei} {e}");
                    }
                    self.pending
                        .push(PendingWrite {
                            imei,
                            delta: Default::default(),
                            events: outcome.events.clone(),
                            gps_time,
                            distance_km: None,
                            trip_id: effective_trip_id,
                            insert_if_missing: None,
                        })
                        .await;
                    return Ok(());
                }
            }
        }

        // A successful pass is the recovery signal for queued writes.
        if self.pending.len().await > 0 {
            if let Err(e) = self.pending.flush(&self.db).await {
                tracing::debug!("pending flush failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn reject_invalid(&self, data: &Value, reason: &str) {
        tracing::debug!("invalid record rejected: {reason}");
        if let Some(broker) = &self.broker {
            if let Err(e) = broker.publish_invalid_data(data, reason).await {
                tracing::warn!("invalid-data publish failed: {e:#}");
            }
        }
        let imei = data
            .get("imei")
            .map(|v| v.to_string().trim_matches('"').to_string());
        if let Err(e) = self
            .db
            .save_invalid_record("metrics_queue", data, reason, None, imei.as_deref())
            .await
        {
            tracing::debug!("invalid-data row insert failed: {e:#}");
        }
    }
}
