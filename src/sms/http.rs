use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::sms::service::SmsService;

#[derive(Clone)]
struct HttpState {
    service: Arc<SmsService>,
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<HttpState>) -> Json<Value> {
    let stats = &state.service.stats;
    let modems: Vec<Value> = match state.service.db.modem_health_snapshot().await {
        Ok(rows) => rows
            .into_iter()
            .map(|(name, health, sent, limit)| {
                json!({ "name": name, "health": health, "sms_sent": sent, "sms_limit": limit })
            })
            .collect(),
        Err(e) => {
            tracing::warn!("modem snapshot failed: {e:#}");
            Vec::new()
        }
    };
    Json(json!({
        "commands_processed": stats.commands_processed.load(Ordering::Relaxed),
        "commands_sent": stats.commands_sent.load(Ordering::Relaxed),
        "commands_failed": stats.commands_failed.load(Ordering::Relaxed),
        "commands_timed_out": stats.commands_timed_out.load(Ordering::Relaxed),
        "responses_matched": stats.responses_matched.load(Ordering::Relaxed),
        "duplicates_skipped": stats.duplicates_skipped.load(Ordering::Relaxed),
        "no_reply": stats.no_reply.load(Ordering::Relaxed),
        "modems": modems,
    }))
}

/// Serve `/health` and `/metrics` for probes and dashboards.
pub async fn serve(service: Arc<SmsService>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(HttpState { service });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("sms-gateway http listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
