mod config;
mod forwarder;
mod registry;
mod session;

use std::sync::Arc;

use config::Settings;
use eyre::{Result, WrapErr};
use forwarder::Forwarder;
use lapin::{Connection, ConnectionProperties};
use registry::ConnectionRegistry;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    tracing_subscriber::fmt()
        .with_max_level(settings.log_level())
        .init();

    let registry = Arc::new(ConnectionRegistry::new());

    let conn = Connection::connect(&settings.amqp_url, ConnectionProperties::default())
        .await
        .wrap_err_with(|| format!("failed to connect to bus at {}", settings.amqp_url))?;
    let forwarder = Forwarder::start(&conn, registry.clone(), &settings).await?;

    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .wrap_err_with(|| format!("failed to bind {}", settings.listen_addr))?;
    info!(addr = %settings.listen_addr, "websocket server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(forwarder.run(shutdown_rx.clone()));

    let accept_registry = registry.clone();
    let mut accept_shutdown = shutdown_rx;
    let acceptor = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_shutdown.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(session::handle_session(
                                accept_registry.clone(),
                                stream,
                                peer,
                            ));
                        }
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }
    });

    wait_for_shutdown().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // New connections stop first; then the consumer drains and the bus
    // resources close in order.
    acceptor.await?;
    worker.await??;
    conn.close(200, "shutdown").await?;
    info!("fan-out stopped");
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
