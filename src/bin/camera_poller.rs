use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use fleet_pipeline::camera::poller::Poller;
use fleet_pipeline::config::FleetConfig;
use fleet_pipeline::db::Db;
use fleet_pipeline::infra::broker::Broker;
use fleet_pipeline::infra::shutdown;
use fleet_pipeline::migrations;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleet_pipeline=debug,camera_poller=debug")),
        )
        .init();

    let config = FleetConfig::load()?;
    let db = Arc::new(Db::connect(&config.database)?);
    migrations::run(&db).await?;

    // Standalone (csv) mode needs no broker at all.
    let broker = if config.camera.data_mode == "csv" {
        tracing::info!("standalone mode: writing CSV to {}", config.camera.csv_dir);
        None
    } else {
        let broker = Arc::new(Broker::new(config.rabbitmq.broker()));
        broker.declare_tracking_topology(&[]).await?;
        Some(broker)
    };

    let (handle, sd) = shutdown::channel();
    shutdown::listen_for_signals(handle);

    let poller = Arc::new(Poller::new(db, broker.clone(), config.camera.clone())?);
    poller.run(sd).await?;

    if let Some(broker) = broker {
        broker.close().await;
    }
    Ok(())
}
