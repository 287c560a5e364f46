mod aggregator;
mod config;
mod processor;
mod publish;
mod service;
mod setup;

use config::Settings;
use eyre::{Result, WrapErr};
use lapin::{Connection, ConnectionProperties};
use service::AggregatorService;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    tracing_subscriber::fmt()
        .with_max_level(settings.log_level())
        .init();

    let conn = Connection::connect(&settings.amqp_url, ConnectionProperties::default())
        .await
        .wrap_err_with(|| format!("failed to connect to bus at {}", settings.amqp_url))?;

    let clickhouse = clickhouse::Client::default()
        .with_url(settings.clickhouse_url.as_str())
        .with_user(settings.clickhouse_username.as_str())
        .with_password(settings.clickhouse_password.as_str())
        .with_database(settings.clickhouse_db.as_str());
    setup::ensure_schema(&clickhouse)
        .await
        .wrap_err("failed to prepare the clickhouse schema")?;

    let service = AggregatorService::start(&conn, clickhouse, &settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(service.run(shutdown_rx));

    wait_for_shutdown().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    worker.await??;
    conn.close(200, "shutdown").await?;
    info!("aggregator stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
