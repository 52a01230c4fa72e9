//! Worker pool lifecycle management.
//!
//! Spawns the configured number of [`DeliveryWorker`] tasks over shared
//! state and joins them again on graceful shutdown. Workers stop through
//! the shared cancellation token; the pool never aborts tasks mid-job.

use std::{sync::Arc, time::Duration};

use courier_core::{time::Clock, EventHandler};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    circuit::CircuitBreakerManager,
    error::{DeliveryError, Result},
    metrics::DeliveryMetrics,
    retry::RetryCoordinator,
    smtp::MailTransport,
    storage::DeliveryStorage,
    template::TemplateClient,
    worker::{DeliveryConfig, DeliveryWorker},
};

/// Pool of delivery worker tasks sharing one set of dependencies.
pub(crate) struct WorkerPool {
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    transport: Arc<dyn MailTransport>,
    templates: Arc<TemplateClient>,
    circuit_manager: Arc<CircuitBreakerManager>,
    retry: Arc<RetryCoordinator>,
    metrics: Arc<RwLock<DeliveryMetrics>>,
    cancellation_token: CancellationToken,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        transport: Arc<dyn MailTransport>,
        templates: Arc<TemplateClient>,
        circuit_manager: Arc<CircuitBreakerManager>,
        retry: Arc<RetryCoordinator>,
        metrics: Arc<RwLock<DeliveryMetrics>>,
        cancellation_token: CancellationToken,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            config,
            transport,
            templates,
            circuit_manager,
            retry,
            metrics,
            cancellation_token,
            event_handler,
            clock,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns the configured number of worker tasks.
    pub(crate) async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        {
            let mut metrics = self.metrics.write().await;
            metrics.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.storage.clone(),
                self.config.clone(),
                self.transport.clone(),
                self.templates.clone(),
                self.circuit_manager.clone(),
                self.retry.clone(),
                self.metrics.clone(),
                self.cancellation_token.clone(),
                self.event_handler.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                match &result {
                    Ok(()) => info!(worker_id, "delivery worker completed"),
                    Err(error) => error!(worker_id, %error, "delivery worker failed"),
                }
                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Cancels workers and waits for them to finish, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::WorkerPanic`] if a worker task panicked and
    /// [`DeliveryError::ShutdownTimeout`] if workers miss the deadline.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(timeout_seconds = timeout.as_secs(), "starting graceful worker shutdown");

        self.cancellation_token.cancel();

        let metrics = self.metrics.clone();
        let join_all = async {
            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(Ok(())) => info!(worker_id, "worker shut down cleanly"),
                    Ok(Err(error)) => {
                        warn!(worker_id, %error, "worker finished with error during shutdown");
                    }
                    Err(join_error) => {
                        error!(worker_id, %join_error, "worker task panicked");
                        return Err(DeliveryError::WorkerPanic {
                            message: format!("worker {worker_id} panicked: {join_error}"),
                        });
                    }
                }
            }

            metrics.write().await.active_workers = 0;
            Ok(())
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(result) => {
                if result.is_ok() {
                    info!("all workers shut down gracefully");
                }
                result
            }
            Err(_) => {
                error!(timeout_seconds = timeout.as_secs(), "worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            }
        }
    }

    /// True while any worker task is still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancellation_token.is_cancelled() {
            warn!("worker pool dropped without graceful shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{time::TestClock, NoOpEventHandler};

    use super::*;
    use crate::{
        smtp::mock::MockMailTransport,
        storage::mock::MockDeliveryStorage,
        template::TemplateConfig,
    };

    fn test_pool(worker_count: usize) -> (WorkerPool, Arc<RwLock<DeliveryMetrics>>) {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let storage: Arc<dyn DeliveryStorage> = Arc::new(MockDeliveryStorage::new());
        let config = DeliveryConfig { worker_count, ..DeliveryConfig::default() };
        let transport: Arc<dyn MailTransport> = Arc::new(MockMailTransport::new());
        let templates = Arc::new(
            TemplateClient::new(TemplateConfig::new("http://localhost:8000"))
                .expect("template client"),
        );
        let circuit_manager =
            Arc::new(CircuitBreakerManager::with_clock(config.circuit.clone(), clock.clone()));
        let retry = Arc::new(RetryCoordinator::new(
            config.retry_policy.clone(),
            storage.clone(),
            clock.clone(),
        ));
        let metrics = Arc::new(RwLock::new(DeliveryMetrics::default()));

        let pool = WorkerPool::new(
            storage,
            config,
            transport,
            templates,
            circuit_manager,
            retry,
            metrics.clone(),
            CancellationToken::new(),
            Arc::new(NoOpEventHandler::new()),
            clock,
        );
        (pool, metrics)
    }

    #[tokio::test]
    async fn spawns_configured_worker_count() {
        let (mut pool, metrics) = test_pool(3);

        pool.spawn_workers().await.expect("workers should spawn");

        assert_eq!(pool.worker_handles.len(), 3);
        assert!(pool.has_active_workers());
        assert_eq!(metrics.read().await.active_workers, 3);

        pool.shutdown_graceful(Duration::from_secs(5)).await.expect("shutdown should succeed");
    }

    #[tokio::test]
    async fn graceful_shutdown_zeroes_active_worker_gauge() {
        let (mut pool, metrics) = test_pool(2);
        pool.spawn_workers().await.expect("workers should spawn");

        pool.shutdown_graceful(Duration::from_secs(5)).await.expect("shutdown should succeed");

        assert_eq!(metrics.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn shutdown_without_spawn_completes_immediately() {
        let (pool, _metrics) = test_pool(2);

        pool.shutdown_graceful(Duration::from_millis(50))
            .await
            .expect("empty pool should shut down");
    }

    #[tokio::test]
    async fn drop_cancels_workers_left_running() {
        let (mut pool, _metrics) = test_pool(1);
        pool.spawn_workers().await.expect("workers should spawn");

        let token = pool.cancellation_token.clone();
        drop(pool);

        assert!(token.is_cancelled());
    }
}
