use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use fleet_pipeline::config::FleetConfig;
use fleet_pipeline::db::Db;
use fleet_pipeline::engine::catalog::Catalog;
use fleet_pipeline::engine::pending::PendingWrites;
use fleet_pipeline::engine::pipeline::Pipeline;
use fleet_pipeline::engine::registry::Registry;
use fleet_pipeline::engine::{consumer, recalc};
use fleet_pipeline::infra::broker::Broker;
use fleet_pipeline::infra::config_cache::ConfigCache;
use fleet_pipeline::infra::shutdown;
use fleet_pipeline::migrations;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleet_pipeline=debug,metric_engine=debug")),
        )
        .init();

    let config = FleetConfig::load()?;
    let db = Arc::new(Db::connect(&config.database)?);
    migrations::run(&db).await?;

    let broker = Arc::new(Broker::new(config.rabbitmq.broker()));
    broker.declare_alarm_exchange().await.ok();
    broker.declare_invalid_data_queue().await.ok();

    let registry = Arc::new(Registry::new());
    let catalog = Arc::new(Catalog::load(config.metric_engine.catalog_path.as_deref()));
    let pipeline = Arc::new(Pipeline {
        db: db.clone(),
        broker: Some(broker.clone()),
        config_cache: Arc::new(ConfigCache::new(db.pool())),
        registry: registry.clone(),
        pending: Arc::new(PendingWrites::default()),
        shadow_mode: config.metric_engine.shadow_mode,
    });
    if config.metric_engine.shadow_mode {
        tracing::warn!("shadow mode enabled: calculators run, nothing is written or published");
    }

    let (handle, sd) = shutdown::channel();
    shutdown::listen_for_signals(handle);

    tracing::info!("metric-engine starting");
    let notify = Arc::new(AtomicBool::new(false));
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(recalc::run_listener(
        config.database.clone(),
        notify.clone(),
        sd.clone(),
    )));
    tasks.push(tokio::spawn(recalc::run_worker(
        db.clone(),
        pipeline.clone(),
        registry.clone(),
        catalog.clone(),
        config.metric_engine.clone(),
        notify,
        sd.clone(),
    )));
    tasks.push(tokio::spawn(recalc::run_maintenance(
        db.clone(),
        catalog,
        config.metric_engine.clone(),
        sd.clone(),
    )));

    let consume = tokio::spawn(consumer::run(
        broker.clone(),
        pipeline,
        config.metric_engine.clone(),
        sd.clone(),
    ));

    let mut sd_main = sd;
    sd_main.wait().await;
    tracing::info!("shutting down; waiting up to 5s for in-flight processing");
    let drain = async {
        let _ = consume.await;
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("forced shutdown with tasks still running");
    }
    broker.close().await;
    Ok(())
}
