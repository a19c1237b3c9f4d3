//! Process wiring
//!
//! Builds one long-lived handle per external dependency, passes them into
//! the worker and consumer by constructor, and runs the pipeline until a
//! shutdown signal or a fatal dependency failure.

use crate::consumer::AmqpConsumer;
use crate::record_store::MongoRecordStore;
use crate::search_index::HttpSearchIndex;
use crate::worker::SyncWorker;
use carbridge_core::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Ping `component` every `interval` and return the first failure
///
/// Never returns while the component stays healthy.
pub async fn watch_health(component: &dyn HealthCheck, interval: Duration) -> SyncError {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = component.health_check().await {
            error!(
                component = component.component_name(),
                error = %e,
                "Dependency lost"
            );
            return e;
        }
    }
}

enum Exit {
    Consumer(Result<()>),
    Unhealthy(SyncError),
    Signal,
}

/// Consume until `shutdown` resolves, the consumer fails, or the store
/// becomes unreachable
///
/// On shutdown the in-flight delivery is settled before returning.
pub async fn run_pipeline<Q, S>(
    consumer: &Q,
    handler: Arc<dyn EventHandler>,
    store: &dyn HealthCheck,
    health_interval: Duration,
    shutdown: S,
) -> Result<()>
where
    Q: QueueConsumer + ?Sized,
    S: Future<Output = ()>,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let consume = consumer.subscribe(handler, stop_rx);
    tokio::pin!(consume);
    tokio::pin!(shutdown);

    let exit = tokio::select! {
        result = &mut consume => Exit::Consumer(result),
        e = watch_health(store, health_interval) => Exit::Unhealthy(e),
        _ = &mut shutdown => Exit::Signal,
    };

    match exit {
        Exit::Consumer(Ok(())) => Ok(()),
        Exit::Consumer(Err(e)) => {
            error!(error = %e, "Consumer failed");
            Err(e)
        }
        Exit::Unhealthy(e) => Err(e),
        Exit::Signal => {
            info!("Shutdown signal received");
            let _ = stop_tx.send(true);
            consume.await
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// The assembled bridge process
pub struct Bridge {
    config: BridgeConfig,
    consumer: Arc<AmqpConsumer>,
    store: Arc<MongoRecordStore>,
    index: Arc<HttpSearchIndex>,
    worker: Arc<SyncWorker<MongoRecordStore, HttpSearchIndex>>,
}

impl Bridge {
    /// Validate configuration and construct every adapter
    pub async fn build(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(MongoRecordStore::connect(&config.store).await?);
        let index = Arc::new(HttpSearchIndex::new(config.index.clone())?);
        let worker = Arc::new(SyncWorker::new(
            store.clone(),
            index.clone(),
            config.worker.clone(),
        ));
        let consumer = Arc::new(AmqpConsumer::new(config.queue.clone()));

        Ok(Self {
            config,
            consumer,
            store,
            index,
            worker,
        })
    }

    /// Run until shutdown; errors out on fatal connection problems
    pub async fn run(&self) -> Result<()> {
        info!("Up and ready to sync cars");

        self.store.start().await?;

        // an unreachable index only requeues events, it does not block startup
        if let Err(e) = self.index.start().await {
            warn!(error = %e, index = %self.index.index(), "Search index not reachable yet");
        }

        if let Err(e) = self.consumer.start().await {
            let _ = self.store.stop().await;
            return Err(e);
        }

        let handler: Arc<dyn EventHandler> = self.worker.clone();
        let result = run_pipeline(
            self.consumer.as_ref(),
            handler,
            self.store.as_ref(),
            self.config.store.health_interval,
            shutdown_signal(),
        )
        .await;

        self.consumer.stop().await?;
        self.index.stop().await?;
        self.store.stop().await?;

        info!(
            synced = self.worker.synced_count(),
            requeued = self.worker.requeued_count(),
            discarded = self.worker.discarded_count(),
            "Bridge stopped"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryQueue, MemoryRecordStore, MemorySearchIndex, Settlement};
    use async_trait::async_trait;
    use carbridge_core::WorkerConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::oneshot;

    struct FlakyHealth {
        healthy_pings: u32,
        pings: AtomicU32,
    }

    #[async_trait]
    impl HealthCheck for FlakyHealth {
        async fn health_check(&self) -> Result<()> {
            if self.pings.fetch_add(1, Ordering::SeqCst) < self.healthy_pings {
                Ok(())
            } else {
                Err(SyncError::store("disconnected"))
            }
        }

        fn component_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn healthy() -> FlakyHealth {
        FlakyHealth {
            healthy_pings: u32::MAX,
            pings: AtomicU32::new(0),
        }
    }

    async fn wait_for_settlements(queue: &MemoryQueue, count: usize) -> Vec<Settlement> {
        for _ in 0..200 {
            let settled = queue.settlements();
            if settled.len() >= count {
                return settled;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} settlements, got {:?}", count, queue.settlements());
    }

    #[tokio::test]
    async fn test_watch_health_returns_first_failure() {
        let health = FlakyHealth {
            healthy_pings: 2,
            pings: AtomicU32::new(0),
        };

        let err = watch_health(&health, Duration::from_millis(5)).await;
        assert!(matches!(err, SyncError::RecordStore { .. }));
        assert_eq!(health.pings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemorySearchIndex::new());
        store
            .put(json!({"_id": "oid", "__v": 0, "fzg_id": "X1", "color": "red"}))
            .await
            .unwrap();
        index.fail_creates(2);

        let worker = Arc::new(SyncWorker::new(store.clone(), index.clone(), WorkerConfig::default()));

        queue.publish(br#"{"id":"X1"}"#.to_vec()).unwrap();
        queue.publish(br#"{"id":"X2"}"#.to_vec()).unwrap();
        queue.publish(b"{}".to_vec()).unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let pipeline = {
            let queue = queue.clone();
            let health = healthy();
            tokio::spawn(async move {
                run_pipeline(queue.as_ref(), worker, &health, Duration::from_secs(60), async {
                    let _ = stop_rx.await;
                })
                .await
            })
        };

        // X1 fails twice on create and is redelivered behind X2 and {}
        let settled = wait_for_settlements(&queue, 5).await;
        let _ = stop_tx.send(());
        pipeline.await.unwrap().unwrap();

        let dispositions: Vec<(Vec<u8>, Disposition)> = settled
            .into_iter()
            .map(|s| (s.payload, s.disposition))
            .collect();
        assert_eq!(
            dispositions,
            vec![
                (br#"{"id":"X1"}"#.to_vec(), Disposition::Requeue),
                (br#"{"id":"X2"}"#.to_vec(), Disposition::Ack),
                (b"{}".to_vec(), Disposition::Discard),
                (br#"{"id":"X1"}"#.to_vec(), Disposition::Requeue),
                (br#"{"id":"X1"}"#.to_vec(), Disposition::Ack),
            ]
        );
        assert_eq!(index.get("X1").await, Some(json!({"fzg_id": "X1", "color": "red"})));
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_pipeline_stops_when_store_is_lost() {
        let queue = MemoryQueue::new();
        let worker = Arc::new(SyncWorker::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemorySearchIndex::new()),
            WorkerConfig::default(),
        ));
        let health = FlakyHealth {
            healthy_pings: 1,
            pings: AtomicU32::new(0),
        };

        let result = run_pipeline(
            &queue,
            worker,
            &health,
            Duration::from_millis(5),
            std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(SyncError::RecordStore { .. })));
    }

    #[tokio::test]
    async fn test_pipeline_graceful_shutdown() {
        let queue = MemoryQueue::new();
        let worker = Arc::new(SyncWorker::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemorySearchIndex::new()),
            WorkerConfig::default(),
        ));

        let result = run_pipeline(&queue, worker, &healthy(), Duration::from_secs(60), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
        .await;

        assert!(result.is_ok());
        assert!(queue.settlements().is_empty());
    }
}
