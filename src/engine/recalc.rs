use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use futures_util::future;
use tokio_postgres::{AsyncMessage, NoTls};

use crate::config::{DatabaseConfig, MetricEngineConfig};
use crate::db::Db;
use crate::engine::catalog::{Catalog, SCORE_VIEWS};
use crate::engine::pipeline::Pipeline;
use crate::engine::registry::Registry;
use crate::infra::shutdown::Shutdown;
use crate::models::laststatus::PriorState;

pub const JOB_RECALC_VIOLATIONS: &str = "RECALC_VIOLATIONS";
pub const JOB_RECALC_FUEL: &str = "RECALC_FUEL";
pub const JOB_RECALC_FENCE: &str = "RECALC_FENCE";
pub const JOB_REFRESH_VIEW: &str = "REFRESH_VIEW";
pub const JOB_REFRESH_VIEWS: &str = "REFRESH_VIEWS";
pub const JOB_REFRESH_SCORE_VIEWS: &str = "REFRESH_SCORE_VIEWS";

#[derive(Debug, Clone)]
struct RecalcJob {
    id: i64,
    job_type: String,
    scope_imei: Option<i64>,
    scope_client_id: Option<i64>,
    scope_vehicle_id: Option<i64>,
    scope_fence_id: Option<i64>,
    scope_date_from: Option<NaiveDateTime>,
    scope_date_to: Option<NaiveDateTime>,
    config_change_id: Option<i64>,
    reason: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct NewJob {
    pub job_type: &'static str,
    pub trigger_type: &'static str,
    pub scope_imei: Option<i64>,
    pub scope_client_id: Option<i64>,
    pub scope_vehicle_id: Option<i64>,
    pub scope_fence_id: Option<i64>,
    pub config_change_id: Option<i64>,
    pub reason: Option<String>,
}

pub async fn enqueue_job(db: &Db, job: NewJob) -> anyhow::Result<i64> {
    let client = db.client().await?;
    let row = client
        .query_one(
            "INSERT INTO recalculation_queue (job_type, trigger_type, scope_imei, scope_client_id, \
             scope_vehicle_id, scope_fence_id, config_change_id, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            &[
                &job.job_type,
                &job.trigger_type,
                &job.scope_imei,
                &job.scope_client_id,
                &job.scope_vehicle_id,
                &job.scope_fence_id,
                &job.config_change_id,
                &job.reason,
            ],
        )
        .await?;
    Ok(row.get(0))
}

/// Dedicated LISTEN connection. A NOTIFY from the config-change triggers
/// just sets the pending flag; the poll loop owns the real work, so missed
/// notifications only cost one poll interval.
pub async fn run_listener(
    db_config: DatabaseConfig,
    notify: Arc<AtomicBool>,
    mut shutdown: Shutdown,
) {
    loop {
        if shutdown.is_shutdown() {
            return;
        }
        match listen_once(&db_config, &notify, &mut shutdown).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!("config_change listener dropped: {e:#}; reconnecting in 5s");
                if shutdown.sleep(Duration::from_secs(5)).await {
                    return;
                }
            }
        }
    }
}

async fn listen_once(
    db_config: &DatabaseConfig,
    notify: &Arc<AtomicBool>,
    shutdown: &mut Shutdown,
) -> anyhow::Result<()> {
    let (client, mut connection) =
        tokio_postgres::connect(&db_config.connection_string(), NoTls).await?;
    let flag = notify.clone();
    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<anyhow::Error>(1);
    let driver = tokio::spawn(async move {
        loop {
            match future::poll_fn(|cx| connection.poll_message(cx)).await {
                Some(Ok(AsyncMessage::Notification(n))) => {
                    tracing::debug!("config_change notification from table {}", n.payload());
                    flag.store(true, Ordering::SeqCst);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = done_tx.send(anyhow::Error::from(e)).await;
                    return;
                }
                None => {
                    let _ = done_tx.send(anyhow::anyhow!("listen connection closed")).await;
                    return;
                }
            }
        }
    });
    client.batch_execute("LISTEN config_change").await?;
    tracing::info!("listening on config_change channel");

    let result = tokio::select! {
        err = done_rx.recv() => Err(err.unwrap_or_else(|| anyhow::anyhow!("listener ended"))),
        _ = shutdown.wait() => Ok(()),
    };
    driver.abort();
    result
}

/// Poll `config_change_log`, coalesce pending rows, dispatch recalculation
/// jobs, then process the queue. The notify flag shortens the wait to the
/// debounce interval when a LISTEN callback fired.
pub async fn run_worker(
    db: Arc<Db>,
    pipeline: Arc<Pipeline>,
    registry: Arc<Registry>,
    catalog: Arc<Catalog>,
    config: MetricEngineConfig,
    notify: Arc<AtomicBool>,
    mut shutdown: Shutdown,
) {
    if let Err(e) = enqueue_formula_version_changes(&db, &registry).await {
        tracing::warn!("formula version sweep failed: {e:#}");
    }
    loop {
        let wait = if notify.swap(false, Ordering::SeqCst) {
            Duration::from_secs(config.recalc_debounce_secs)
        } else {
            Duration::from_secs(config.recalc_poll_secs)
        };
        if shutdown.sleep(wait).await {
            return;
        }
        if let Err(e) = poll_config_changes(&db, &catalog).await {
            tracing::warn!("config change poll failed: {e:#}");
        }
        match process_pending_jobs(&db, &pipeline, &catalog, &config).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("processed {n} recalculation jobs"),
            Err(e) => tracing::warn!("recalculation processing failed: {e:#}"),
        }
    }
}

/// Daily maintenance: refresh every whitelisted view and expire old
/// dedup/retry bookkeeping rows.
pub async fn run_maintenance(
    db: Arc<Db>,
    catalog: Arc<Catalog>,
    config: MetricEngineConfig,
    mut shutdown: Shutdown,
) {
    loop {
        if shutdown.sleep(Duration::from_secs(config.maintenance_interval_secs)).await {
            return;
        }
        for view in catalog.refreshable_views() {
            if let Err(e) = refresh_view(&db, view).await {
                tracing::warn!("scheduled refresh of {view} failed: {e:#}");
            }
        }
        match db.cleanup_message_bookkeeping(72, 24).await {
            Ok((processed, retries)) => {
                tracing::info!("maintenance: expired {processed} processed ids, {retries} retry rows")
            }
            Err(e) => tracing::warn!("maintenance cleanup failed: {e:#}"),
        }
        if let Err(e) = cleanup_engine_bookkeeping(&db).await {
            tracing::warn!("engine bookkeeping cleanup failed: {e:#}");
        }
    }
}

async fn cleanup_engine_bookkeeping(db: &Db) -> anyhow::Result<()> {
    let client = db.client().await?;
    client
        .execute(
            "DELETE FROM metric_engine_processed_messages WHERE processed_at < NOW() - INTERVAL '72 hours'",
            &[],
        )
        .await?;
    client
        .execute(
            "DELETE FROM metric_engine_message_retries WHERE last_attempt_at < NOW() - INTERVAL '24 hours'",
            &[],
        )
        .await?;
    Ok(())
}

/// At startup, any calculator whose declared formula version differs from
/// the stored one gets a full recalculation, and the registry row is updated.
pub async fn enqueue_formula_version_changes(db: &Db, registry: &Registry) -> anyhow::Result<()> {
    let client = db.client().await?;
    for (name, version) in registry.formula_versions() {
        let stored: Option<String> = client
            .query_opt("SELECT version FROM formula_version_registry WHERE metric_name = $1", &[&name])
            .await?
            .map(|r| r.get(0));
        match stored.as_deref() {
            Some(v) if v == version => continue,
            stored => {
                tracing::info!(
                    "formula version change for {name}: {:?} -> {version}; enqueueing recalculation",
                    stored
                );
                enqueue_job(
                    db,
                    NewJob {
                        job_type: JOB_RECALC_VIOLATIONS,
                        trigger_type: "formula_version",
                        reason: Some(format!("formula_version_change:{name}")),
                        ..Default::default()
                    },
                )
                .await?;
            }
        }
        client
            .execute(
                "INSERT INTO formula_version_registry (metric_name, version) VALUES ($1, $2) \
                 ON CONFLICT (metric_name) DO UPDATE SET version = EXCLUDED.version, updated_at = NOW()",
                &[&name, &version],
            )
            .await?;
    }
    Ok(())
}

/// Coalesce unprocessed config edits (latest row per table/record/key wins)
/// and dispatch one job per distinct change.
async fn poll_config_changes(db: &Db, _catalog: &Catalog) -> anyhow::Result<()> {
    let client = db.client().await?;
    let rows = client
        .query(
            "SELECT id, table_name, record_key, config_key FROM config_change_log \
             WHERE processed = FALSE ORDER BY created_at ASC LIMIT 500",
            &[],
        )
        .await?;
    if rows.is_empty() {
        return Ok(());
    }
    let mut all_ids: Vec<i64> = Vec::with_capacity(rows.len());
    let mut latest: HashMap<(String, Option<String>, Option<String>), i64> = HashMap::new();
    let mut by_id: HashMap<i64, (String, Option<String>, Option<String>)> = HashMap::new();
    for row in rows {
        let id: i64 = row.get(0);
        let key = (
            row.get::<_, String>(1),
            row.get::<_, Option<String>>(2),
            row.get::<_, Option<String>>(3),
        );
        all_ids.push(id);
        latest.insert(key.clone(), id);
        by_id.insert(id, key);
    }

    for (&id, (table, record_key, _config_key)) in
        by_id.iter().filter(|(id, _)| latest.values().any(|v| v == *id))
    {
        let record_id = record_key.as_deref().and_then(|k| k.parse::<i64>().ok());
        let job = match table.as_str() {
            "calibration" => NewJob {
                job_type: JOB_RECALC_FUEL,
                trigger_type: "config_change",
                scope_vehicle_id: record_id,
                config_change_id: Some(id),
                ..Default::default()
            },
            "fence" => NewJob {
                job_type: JOB_RECALC_FENCE,
                trigger_type: "config_change",
                scope_fence_id: record_id,
                config_change_id: Some(id),
                ..Default::default()
            },
            "score_weights" => NewJob {
                job_type: JOB_REFRESH_SCORE_VIEWS,
                trigger_type: "config_change",
                config_change_id: Some(id),
                ..Default::default()
            },
            "tracker_config" => NewJob {
                job_type: JOB_RECALC_VIOLATIONS,
                trigger_type: "config_change",
                scope_imei: record_id,
                config_change_id: Some(id),
                ..Default::default()
            },
            "client_config" => NewJob {
                job_type: JOB_RECALC_VIOLATIONS,
                trigger_type: "config_change",
                scope_client_id: record_id,
                config_change_id: Some(id),
                ..Default::default()
            },
            _ => NewJob {
                job_type: JOB_RECALC_VIOLATIONS,
                trigger_type: "config_change",
                config_change_id: Some(id),
                ..Default::default()
            },
        };
        enqueue_job(db, job).await?;
    }

    client
        .execute(
            "UPDATE config_change_log SET processed = TRUE WHERE id = ANY($1)",
            &[&all_ids],
        )
        .await?;
    Ok(())
}

async fn process_pending_jobs(
    db: &Db,
    pipeline: &Pipeline,
    catalog: &Catalog,
    config: &MetricEngineConfig,
) -> anyhow::Result<usize> {
    let mut processed = 0;
    loop {
        let client = db.client().await?;
        let row = client
            .query_opt(
                "SELECT id, job_type, scope_imei, scope_client_id, scope_vehicle_id, scope_fence_id, \
                        scope_date_from, scope_date_to, config_change_id, reason \
                 FROM recalculation_queue WHERE status = 'PENDING' \
                 ORDER BY priority ASC, created_at ASC LIMIT 1",
                &[],
            )
            .await?;
        let Some(row) = row else {
            return Ok(processed);
        };
        let job = RecalcJob {
            id: row.get(0),
            job_type: row.get(1),
            scope_imei: row.get(2),
            scope_client_id: row.get(3),
            scope_vehicle_id: row.get(4),
            scope_fence_id: row.get(5),
            scope_date_from: row.get(6),
            scope_date_to: row.get(7),
            config_change_id: row.get(8),
            reason: row.get(9),
        };
        client
            .execute(
                "UPDATE recalculation_queue SET status = 'PROCESSING', started_at = NOW() WHERE id = $1",
                &[&job.id],
            )
            .await?;
        drop(client);

        match run_job(db, pipeline, catalog, config, &job).await {
            Ok(rows_affected) => {
                let client = db.client().await?;
                client
                    .execute(
                        "UPDATE recalculation_queue SET status = 'COMPLETED', completed_at = NOW(), \
                         rows_affected = $1 WHERE id = $2",
                        &[&(rows_affected as i64), &job.id],
                    )
                    .await?;
            }
            Err(e) => {
                tracing::error!("recalculation job {} ({}) failed: {e:#}", job.id, job.job_type);
                let client = db.client().await?;
                client
                    .execute(
                        "UPDATE recalculation_queue SET status = 'FAILED', completed_at = NOW(), \
                         error_message = $1 WHERE id = $2",
                        &[&format!("{e:#}"), &job.id],
                    )
                    .await?;
            }
        }
        processed += 1;
    }
}

fn default_window(job: &RecalcJob, window_days: i64) -> (NaiveDateTime, NaiveDateTime) {
    let now = Utc::now().naive_utc();
    let from = job.scope_date_from.unwrap_or(now - chrono::Duration::days(window_days));
    let to = job.scope_date_to.unwrap_or(now);
    (from, to)
}

async fn run_job(
    db: &Db,
    pipeline: &Pipeline,
    catalog: &Catalog,
    config: &MetricEngineConfig,
    job: &RecalcJob,
) -> anyhow::Result<u64> {
    let (from, to) = default_window(job, config.recalc_window_days);
    match job.job_type.as_str() {
        JOB_RECALC_VIOLATIONS => {
            let config_key = match job.config_change_id {
                Some(change_id) => config_key_for_change(db, change_id).await?,
                None => None,
            };
            let (categories, views) = catalog.affected(config_key.as_deref());
            let imeis = imeis_for_scope(db, job.scope_imei, job.scope_client_id).await?;
            let mut affected =
                delete_events(db, &imeis, categories.as_deref(), from, to).await?;
            for imei in &imeis {
                affected += reprocess_imei(db, pipeline, *imei, from, to, config.recalc_batch_size).await?;
            }
            let view_list = match views {
                Some(v) => serde_json::to_string(&v)?,
                None => "all".to_string(),
            };
            enqueue_job(
                db,
                NewJob {
                    job_type: JOB_REFRESH_VIEWS,
                    trigger_type: "follow_up",
                    reason: Some(view_list),
                    ..Default::default()
                },
            )
            .await?;
            Ok(affected)
        }
        JOB_RECALC_FUEL => {
            let Some(vehicle_id) = job.scope_vehicle_id else {
                anyhow::bail!("RECALC_FUEL requires scope_vehicle_id");
            };
            let imeis = imeis_for_vehicle(db, vehicle_id).await?;
            let fuel = vec!["Fuel".to_string()];
            let mut affected = delete_events(db, &imeis, Some(&fuel), from, to).await?;
            for imei in &imeis {
                affected += reprocess_imei(db, pipeline, *imei, from, to, config.recalc_batch_size).await?;
            }
            affected += db.recompute_trip_fuel(vehicle_id).await?;
            if let Err(e) = refresh_view(db, "mv_daily_fuel_consumption").await {
                tracing::warn!("refresh mv_daily_fuel_consumption failed: {e:#}");
            }
            Ok(affected)
        }
        JOB_RECALC_FENCE => {
            let Some(fence_id) = job.scope_fence_id else {
                anyhow::bail!("RECALC_FENCE requires scope_fence_id");
            };
            // Targeted reprocess when the fence already has events; a new or
            // never-crossed fence falls back to every tracker so its first
            // enter/exit pairs get generated.
            let mut imeis = imeis_for_fence_events(db, fence_id).await?;
            if imeis.is_empty() {
                imeis = imeis_for_scope(db, None, None).await?;
            }
            let client = db.client().await?;
            let mut affected = client
                .execute(
                    "DELETE FROM metric_events WHERE fence_id = $1 AND event_category = 'Fence'",
                    &[&fence_id],
                )
                .await?;
            drop(client);
            for imei in &imeis {
                affected += reprocess_imei(db, pipeline, *imei, from, to, config.recalc_batch_size).await?;
            }
            if let Err(e) = refresh_view(db, "mv_daily_fence_stats").await {
                tracing::warn!("refresh mv_daily_fence_stats failed: {e:#}");
            }
            Ok(affected)
        }
        JOB_REFRESH_VIEW => {
            let name = job.reason.clone().unwrap_or_default();
            let allowed = catalog.filter_views(&[name.as_str()]);
            anyhow::ensure!(!allowed.is_empty(), "view {name:?} is not whitelisted");
            refresh_view(db, &allowed[0]).await?;
            Ok(1)
        }
        JOB_REFRESH_VIEWS => {
            let views: Vec<String> = match job.reason.as_deref() {
                None | Some("all") | Some("") => catalog.refreshable_views().to_vec(),
                Some(json) => {
                    let requested: Vec<String> = serde_json::from_str(json).unwrap_or_default();
                    let filtered = catalog.filter_views(&requested);
                    if filtered.is_empty() { catalog.refreshable_views().to_vec() } else { filtered }
                }
            };
            let mut refreshed = 0u64;
            let mut failures = Vec::new();
            for view in &views {
                match refresh_view(db, view).await {
                    Ok(()) => refreshed += 1,
                    Err(e) => failures.push(format!("{view}: {e:#}")),
                }
            }
            if !failures.is_empty() {
                let client = db.client().await?;
                client
                    .execute(
                        "UPDATE recalculation_queue SET error_message = $1 WHERE id = $2",
                        &[&failures.join("; "), &job.id],
                    )
                    .await?;
            }
            Ok(refreshed)
        }
        JOB_REFRESH_SCORE_VIEWS => {
            let views = catalog.filter_views(SCORE_VIEWS);
            let mut refreshed = 0u64;
            for view in &views {
                match refresh_view(db, view).await {
                    Ok(()) => refreshed += 1,
                    Err(e) => tracing::warn!("refresh {view} failed: {e:#}"),
                }
            }
            Ok(refreshed)
        }
        other => anyhow::bail!("unknown job_type {other}"),
    }
}

async fn config_key_for_change(db: &Db, change_id: i64) -> anyhow::Result<Option<String>> {
    let client = db.client().await?;
    Ok(client
        .query_opt("SELECT config_key FROM config_change_log WHERE id = $1", &[&change_id])
        .await?
        .and_then(|r| r.get(0)))
}

async fn imeis_for_scope(
    db: &Db,
    scope_imei: Option<i64>,
    scope_client_id: Option<i64>,
) -> anyhow::Result<Vec<i64>> {
    if let Some(imei) = scope_imei {
        return Ok(vec![imei]);
    }
    let client = db.client().await?;
    let rows = match scope_client_id {
        Some(client_id) => {
            client
                .query(
                    "SELECT t.imei FROM tracker t JOIN vehicle v ON v.vehicle_id = t.vehicle_id \
                     WHERE v.client_id = $1",
                    &[&client_id],
                )
                .await?
        }
        None => client.query("SELECT imei FROM tracker", &[]).await?,
    };
    Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

async fn imeis_for_vehicle(db: &Db, vehicle_id: i64) -> anyhow::Result<Vec<i64>> {
    let client = db.client().await?;
    let rows = client.query("SELECT imei FROM tracker WHERE vehicle_id = $1", &[&vehicle_id]).await?;
    Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

async fn imeis_for_fence_events(db: &Db, fence_id: i64) -> anyhow::Result<Vec<i64>> {
    let client = db.client().await?;
    let rows = client
        .query(
            "SELECT DISTINCT imei FROM metric_events \
             WHERE fence_id = $1 AND event_category = 'Fence' \
               AND gps_time >= NOW() - INTERVAL '90 days'",
            &[&fence_id],
        )
        .await?;
    Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

async fn delete_events(
    db: &Db,
    imeis: &[i64],
    categories: Option<&[String]>,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> anyhow::Result<u64> {
    if imeis.is_empty() {
        return Ok(0);
    }
    let client = db.client().await?;
    let deleted = match categories {
        Some(categories) => {
            client
                .execute(
                    "DELETE FROM metric_events WHERE imei = ANY($1) AND event_category = ANY($2) \
                     AND gps_time >= $3 AND gps_time <= $4",
                    &[&imeis, &categories, &from, &to],
                )
                .await?
        }
        None => {
            client
                .execute(
                    "DELETE FROM metric_events WHERE imei = ANY($1) AND gps_time >= $2 AND gps_time <= $3",
                    &[&imeis, &from, &to],
                )
                .await?
        }
    };
    Ok(deleted)
}

/// Replay one imei's history through the pipeline against a fresh in-memory
/// state. Individual record failures are logged and skipped so one bad row
/// cannot wedge the whole job.
async fn reprocess_imei(
    db: &Db,
    pipeline: &Pipeline,
    imei: i64,
    from: NaiveDateTime,
    to: NaiveDateTime,
    batch_size: i64,
) -> anyhow::Result<u64> {
    let mut state = PriorState::default();
    let mut offset: i64 = 0;
    let mut count: u64 = 0;
    loop {
        let page = db.trackdata_page(imei, from, to, batch_size, offset).await?;
        let page_len = page.len();
        for record in &page {
            if let Err(e) = pipeline.process_backfill_record(record, &mut state).await {
                tracing::warn!("backfill record failed imei={imei} gps_time={}: {e:#}", record.gps_time);
            }
            count += 1;
        }
        if (page_len as i64) < batch_size {
            break;
        }
        offset += batch_size;
    }
    tracing::debug!("reprocessed {count} records for imei={imei}");
    Ok(count)
}

/// CONCURRENTLY first (no reader stalls); plain refresh as fallback for
/// views without a unique index.
async fn refresh_view(db: &Db, view: &str) -> anyhow::Result<()> {
    let client = db.client().await?;
    match client
        .batch_execute(&format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}"))
        .await
    {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!("concurrent refresh of {view} failed ({e}); retrying plain");
            client.batch_execute(&format!("REFRESH MATERIALIZED VIEW {view}")).await?;
            Ok(())
        }
    }
}
