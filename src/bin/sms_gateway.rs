use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use fleet_pipeline::config::FleetConfig;
use fleet_pipeline::db::Db;
use fleet_pipeline::infra::shutdown;
use fleet_pipeline::migrations;
use fleet_pipeline::sms::http;
use fleet_pipeline::sms::service::SmsService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleet_pipeline=debug,sms_gateway=debug,tower_http=info")),
        )
        .init();

    let config = FleetConfig::load()?;
    let db = Arc::new(Db::connect(&config.database)?);
    migrations::run(&db).await?;

    let (handle, sd) = shutdown::channel();
    shutdown::listen_for_signals(handle);

    let service = Arc::new(SmsService::new(db, config.sms.clone()));

    let http_service = service.clone();
    let port = config.sms.http_port;
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_service, port).await {
            tracing::error!("http listener failed: {e:#}");
        }
    });

    tracing::info!("sms-gateway starting (poll every {}s)", config.sms.outbox_poll_secs);
    service.run(sd).await;
    Ok(())
}
