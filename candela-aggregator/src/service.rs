use std::time::Duration;

use candela_shared::timeframes::{only_seconds, timeframes};
use eyre::Result;
use futures::StreamExt;
use lapin::{
    Channel, Connection, Consumer,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{
    aggregator::OhlcAggregator,
    config::Settings,
    processor::TradeProcessor,
    publish::{BusPublisher, ClickhousePublisher, Publisher},
    setup,
};

/// Consumes the trades queue and drives the processor under at-least-once
/// discipline: ack only after the trade is fully aggregated and fanned out,
/// nack with requeue on any failure.
pub struct AggregatorService {
    consume_channel: Channel,
    publish_channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
    processor: TradeProcessor,
    cleanup_interval: Duration,
    window_max_age: chrono::Duration,
    event_time_eviction: bool,
}

impl AggregatorService {
    /// Declares the queues, wires the publishers, and attaches the consumer.
    ///
    /// The trades queue is declared single-active-consumer so per-key order
    /// survives standby replicas; publisher confirms are enabled so a lost
    /// publish fails (and requeues) the originating trade.
    pub async fn start(
        conn: &Connection,
        clickhouse: clickhouse::Client,
        settings: &Settings,
    ) -> Result<Self> {
        let publish_channel = conn.create_channel().await?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        publish_channel
            .queue_declare(
                &settings.ohlc_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consume_channel = conn.create_channel().await?;
        // One unacked message at a time: fan-out for a trade completes before
        // the next trade of the partition is delivered.
        consume_channel.basic_qos(1, BasicQosOptions::default()).await?;

        let mut queue_args = FieldTable::default();
        queue_args.insert("x-single-active-consumer".into(), AMQPValue::Boolean(true));
        consume_channel
            .queue_declare(
                &settings.trades_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_args,
            )
            .await?;

        let consumer = consume_channel
            .basic_consume(
                &settings.trades_queue,
                &settings.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let store_timeframes = if settings.clickhouse_seconds_only {
            only_seconds()
        } else {
            timeframes()
        };
        let publishers: Vec<Box<dyn Publisher>> = vec![
            Box::new(BusPublisher::new(
                publish_channel.clone(),
                settings.ohlc_queue.clone(),
                timeframes(),
            )),
            Box::new(ClickhousePublisher::new(
                clickhouse,
                setup::BASE_TABLE,
                store_timeframes,
            )),
        ];

        let processor = TradeProcessor::new(
            OhlcAggregator::new(timeframes(), settings.smooth_gaps),
            publishers,
        );

        Ok(Self {
            consume_channel,
            publish_channel,
            consumer,
            consumer_tag: settings.consumer_tag.clone(),
            processor,
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
            window_max_age: chrono::Duration::seconds(settings.window_max_age_secs as i64),
            event_time_eviction: settings.event_time_eviction,
        })
    }

    /// Consume → process → ack loop. Runs until the shutdown flag flips,
    /// finishes the in-flight message, then closes consumer and channels in
    /// order. One bad message never ends the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut cleanup = tokio::time::interval(self.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("aggregator consuming");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = cleanup.tick() => {
                    let aggregator = self.processor.aggregator_mut();
                    if self.event_time_eviction {
                        aggregator.cleanup_stale_windows(self.window_max_age);
                    } else {
                        aggregator.cleanup_old_windows(self.window_max_age);
                    }
                }
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

    async fn handle(&mut self, mut delivery: Delivery) {
        match self.processor.process(&mut delivery.data).await {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "failed to ack trade");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to process trade, requeueing");
                let requeue = BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                };
                if let Err(e) = delivery.nack(requeue).await {
                    error!(error = %e, "failed to nack trade");
                }
            }
        }
    }

    /// Consumer first (stops new receives), then the channels.
    async fn close(self) -> Result<()> {
        self.consume_channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        self.consume_channel.close(200, "shutdown").await?;
        self.publish_channel.close(200, "shutdown").await?;
        info!("aggregator service closed");
        Ok(())
    }
}
