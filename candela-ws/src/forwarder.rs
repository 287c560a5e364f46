use std::sync::Arc;

use eyre::Result;
use futures::StreamExt;
use lapin::{
    Channel, Connection, Consumer,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{config::Settings, registry::ConnectionRegistry};

/// Forwards every OHLC message from the bus into the registry's broadcast.
///
/// Shared consumption: fan-out replicas attach to the same queue and each
/// receives a disjoint subset of the stream.
pub struct Forwarder {
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
    registry: Arc<ConnectionRegistry>,
}

impl Forwarder {
    pub async fn start(
        conn: &Connection,
        registry: Arc<ConnectionRegistry>,
        settings: &Settings,
    ) -> Result<Self> {
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                &settings.ohlc_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                &settings.ohlc_queue,
                &settings.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            channel,
            consumer,
            consumer_tag: settings.consumer_tag.clone(),
            registry,
        })
    }

    /// Consume → broadcast → ack loop; nack with requeue on failure. Runs
    /// until the shutdown flag flips, then closes consumer and channel.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("forwarder consuming");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = self.consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.handle(delivery).await,
                        Some(Err(e)) => error!(error = %e, "consumer stream error"),
                        None => {
                            warn!("consumer stream closed by broker");
                            break;
                        }
                    }
                }
            }
        }

        self.close().await
    }

    async fn handle(&self, mut delivery: Delivery) {
        let data = std::mem::take(&mut delivery.data);
        let outcome = match String::from_utf8(data) {
            Ok(text) => self.registry.broadcast(text.into()).await,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "failed to ack candle");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to broadcast candle, requeueing");
                let requeue = BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                };
                if let Err(e) = delivery.nack(requeue).await {
                    error!(error = %e, "failed to nack candle");
                }
            }
        }
    }

    async fn close(self) -> Result<()> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        self.channel.close(200, "shutdown").await?;
        info!("forwarder closed");
        Ok(())
    }
}
