use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use fleet_pipeline::config::FleetConfig;
use fleet_pipeline::consumer::ConsumerStats;
use fleet_pipeline::consumer::worker::{ConsumerDeps, HeldWrites, QueueKind, run_cleanup, run_queue};
use fleet_pipeline::db::Db;
use fleet_pipeline::infra::broker::Broker;
use fleet_pipeline::infra::dedup::DedupCache;
use fleet_pipeline::infra::shutdown;
use fleet_pipeline::migrations;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleet_pipeline=debug,ingest_consumer=debug")),
        )
        .init();

    let config = FleetConfig::load()?;
    let db = Arc::new(Db::connect(&config.database)?);
    migrations::run(&db).await?;

    let broker = Arc::new(Broker::new(config.rabbitmq.broker()));
    let deps = Arc::new(ConsumerDeps {
        db,
        broker,
        dedup: Arc::new(DedupCache::new(
            config.consumer.dedup_cache_size,
            Duration::from_secs(config.consumer.dedup_ttl_secs),
        )),
        stats: Arc::new(ConsumerStats::default()),
        held: Arc::new(HeldWrites::default()),
        config: config.consumer.clone(),
    });

    let (handle, sd) = shutdown::channel();
    shutdown::listen_for_signals(handle);

    tracing::info!("ingest-consumer starting");
    let mut tasks = Vec::new();
    for kind in [QueueKind::Trackdata, QueueKind::Alarms, QueueKind::Events] {
        tasks.push(tokio::spawn(run_queue(deps.clone(), kind, sd.clone())));
    }
    tasks.push(tokio::spawn(run_cleanup(deps.clone(), sd.clone())));

    let mut sd_main = sd;
    sd_main.wait().await;
    tracing::info!("shutting down; waiting up to 5s for in-flight batches");
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("forced shutdown with tasks still running");
    }
    deps.broker.close().await;
    deps.stats.log_summary();
    Ok(())
}
