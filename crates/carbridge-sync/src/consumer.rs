//! AMQP consumer for the sync worker
//!
//! Implements the QueueConsumer strategy over RabbitMQ: declares the topic
//! exchange, the queue and its bindings, limits in-flight deliveries with
//! `basic_qos`, and settles every delivery exactly once.

use async_trait::async_trait;
use carbridge_core::prelude::*;
use carbridge_core::{ConnectionMetrics, QueueConfig};
use futures::{FutureExt, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, trace, warn};

/// Acknowledgement primitives of one lapin delivery
pub struct LapinAcknowledger {
    acker: Acker,
}

impl LapinAcknowledger {
    pub fn new(acker: Acker) -> Self {
        Self { acker }
    }
}

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|e| SyncError::queue_with_source("Failed to ack delivery", e))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|e| SyncError::queue_with_source("Failed to nack delivery", e))
    }
}

/// Run the handler on one payload and settle the delivery with its verdict
///
/// A panicking handler counts as a transient failure and the delivery is
/// requeued.
pub async fn dispatch(
    handler: &dyn EventHandler,
    payload: &[u8],
    handle: DeliveryHandle,
) -> Result<Disposition> {
    let delivery_tag = handle.delivery_tag();

    let disposition = match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
        Ok(disposition) => disposition,
        Err(_) => {
            error!(delivery_tag, "Handler panicked, requeueing delivery");
            Disposition::Requeue
        }
    };

    handle.settle(disposition).await?;
    trace!(delivery_tag, %disposition, "Delivery settled");
    Ok(disposition)
}

/// RabbitMQ queue consumer
pub struct AmqpConsumer {
    config: QueueConfig,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    running: Arc<AtomicBool>,
    metrics: ConnectionMetrics,
}

impl AmqpConsumer {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            metrics: ConnectionMetrics::new("amqp"),
        }
    }

    /// Declare exchange, queue and bindings, then cap in-flight deliveries
    async fn declare_topology(&self, channel: &Channel) -> Result<()> {
        let cfg = &self.config;

        channel
            .exchange_declare(
                &cfg.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: cfg.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SyncError::queue_with_source("Failed to declare exchange", e))?;

        channel
            .queue_declare(
                &cfg.queue,
                QueueDeclareOptions {
                    durable: cfg.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SyncError::queue_with_source("Failed to declare queue", e))?;

        for routing_key in &cfg.routing_keys {
            channel
                .queue_bind(
                    &cfg.queue,
                    &cfg.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| SyncError::queue_with_source("Failed to bind queue", e))?;
            debug!(queue = %cfg.queue, exchange = %cfg.exchange, %routing_key, "Queue bound");
        }

        channel
            .basic_qos(cfg.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| SyncError::queue_with_source("Failed to set prefetch", e))?;

        Ok(())
    }

    async fn settle_delivery(&self, handler: &dyn EventHandler, delivery: Delivery) -> Result<()> {
        let Delivery {
            delivery_tag,
            redelivered,
            data,
            acker,
            ..
        } = delivery;
        trace!(delivery_tag, redelivered, bytes = data.len(), "Delivery received");

        let handle = DeliveryHandle::new(delivery_tag, LapinAcknowledger::new(acker));
        dispatch(handler, &data, handle).await.map(|_| ())
    }
}

#[async_trait]
impl Lifecycle for AmqpConsumer {
    async fn start(&self) -> Result<()> {
        info!(queue = %self.config.queue, exchange = %self.config.exchange, "Connecting to AMQP broker");

        let properties =
            ConnectionProperties::default().with_connection_name(self.config.consumer_tag.clone().into());
        let connection = Connection::connect(&self.config.url, properties)
            .await
            .map_err(|e| SyncError::queue_with_source("Failed to connect", e))?;

        let running = self.running.clone();
        let metrics = self.metrics.clone();
        connection.on_error(move |e| {
            error!(error = %e, "AMQP connection lost");
            running.store(false, Ordering::SeqCst);
            metrics.set_connected(false);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SyncError::queue_with_source("Failed to open channel", e))?;
        self.declare_topology(&channel).await?;

        *self.connection.write().await = Some(connection);
        *self.channel.write().await = Some(channel);
        self.running.store(true, Ordering::SeqCst);
        self.metrics.set_connected(true);

        info!(prefetch = self.config.prefetch, "AMQP consumer started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(channel) = self.channel.write().await.take() {
            if let Err(e) = channel.close(200, "shutdown").await {
                warn!(error = %e, "Failed to close channel");
            }
        }
        if let Some(connection) = self.connection.write().await.take() {
            if let Err(e) = connection.close(200, "shutdown").await {
                warn!(error = %e, "Failed to close connection");
            }
        }
        self.metrics.set_connected(false);

        info!("AMQP consumer stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for AmqpConsumer {
    async fn health_check(&self) -> Result<()> {
        let connection = self.connection.read().await;
        match connection.as_ref() {
            Some(c) if c.status().connected() => Ok(()),
            Some(_) => Err(SyncError::queue("Not connected")),
            None => Err(SyncError::queue("Connection not initialized")),
        }
    }

    fn component_name(&self) -> &'static str {
        "amqp_consumer"
    }
}

#[async_trait]
impl QueueConsumer for AmqpConsumer {
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::queue("Channel not initialized"))?;

        let mut deliveries = channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SyncError::queue_with_source("Failed to start consuming", e))?;

        info!(queue = %self.config.queue, "Ready to handle queued cars");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                next = deliveries.next() => next,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match next {
                Some(Ok(delivery)) => self.settle_delivery(handler.as_ref(), delivery).await?,
                Some(Err(e)) => {
                    return Err(SyncError::queue_with_source("Delivery stream failed", e));
                }
                None => return Err(SyncError::queue("Delivery stream ended")),
            }
        }

        info!("Stopped consuming");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingAcker {
        calls: Arc<Mutex<Vec<Disposition>>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<()> {
            self.calls.lock().unwrap().push(Disposition::Ack);
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<()> {
            self.calls.lock().unwrap().push(if requeue {
                Disposition::Requeue
            } else {
                Disposition::Discard
            });
            Ok(())
        }
    }

    struct FixedHandler(Disposition);

    #[async_trait]
    impl EventHandler for FixedHandler {
        async fn handle(&self, _payload: &[u8]) -> Disposition {
            self.0
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _payload: &[u8]) -> Disposition {
            panic!("handler bug")
        }
    }

    struct FailingAcker;

    #[async_trait]
    impl Acknowledger for FailingAcker {
        async fn ack(&self) -> Result<()> {
            Err(SyncError::queue("channel closed"))
        }

        async fn reject(&self, _requeue: bool) -> Result<()> {
            Err(SyncError::queue("channel closed"))
        }
    }

    #[tokio::test]
    async fn test_dispatch_settles_with_handler_verdict() {
        for expected in [Disposition::Ack, Disposition::Requeue, Disposition::Discard] {
            let acker = RecordingAcker::default();
            let handle = DeliveryHandle::new(1, acker.clone());

            let disposition = dispatch(&FixedHandler(expected), b"{}", handle).await.unwrap();

            assert_eq!(disposition, expected);
            assert_eq!(*acker.calls.lock().unwrap(), vec![expected]);
        }
    }

    #[tokio::test]
    async fn test_dispatch_requeues_on_panic() {
        let acker = RecordingAcker::default();
        let handle = DeliveryHandle::new(7, acker.clone());

        let disposition = dispatch(&PanickingHandler, br#"{"id":"X1"}"#, handle).await.unwrap();

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(*acker.calls.lock().unwrap(), vec![Disposition::Requeue]);
    }

    #[tokio::test]
    async fn test_dispatch_surfaces_ack_failure() {
        let handle = DeliveryHandle::new(3, FailingAcker);
        let err = dispatch(&FixedHandler(Disposition::Ack), b"{}", handle).await.unwrap_err();
        assert!(matches!(err, SyncError::Queue { .. }));
    }

    #[tokio::test]
    async fn test_consumer_requires_start() {
        let consumer = AmqpConsumer::new(QueueConfig::default());
        assert!(!consumer.is_running());
        assert!(consumer.health_check().await.is_err());

        let (_tx, rx) = watch::channel(false);
        let err = consumer
            .subscribe(Arc::new(FixedHandler(Disposition::Ack)), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Queue { .. }));
    }
}
