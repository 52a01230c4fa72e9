//! Delivery engine and the per-job delivery pipeline.
//!
//! [`DeliveryEngine`] owns the worker pool, the maintenance sweep, and the
//! shared reliability state (circuit breakers, retry coordinator, metrics).
//! [`DeliveryWorker`] is the unit the pool spawns: it claims batches of
//! pending jobs and walks each one through idempotency check, breaker gate,
//! SMTP send, and the retry-or-dead-letter outcome.

use std::{sync::Arc, time::Duration};

use courier_core::{
    models::{DeliveryAttempt, EmailJob},
    time::Clock,
    CourierError, DeliveryEvent, EventHandler, JobDeliveredEvent, JobFailedEvent,
    MulticastEventHandler, Storage,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    circuit::{CircuitBreakerManager, CircuitConfig},
    classify,
    error::{DeliveryError, Result},
    metrics::DeliveryMetrics,
    retry::{RetryCoordinator, RetryPolicy, RetryVerdict},
    smtp::{MailTransport, SendReceipt, SmtpConfig, SmtpMailer},
    status::StatusPublisherHandler,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    template::{TemplateClient, TemplateConfig},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum jobs claimed per batch.
    pub batch_size: usize,

    /// Interval between claim polls when the queue is empty.
    pub poll_interval: Duration,

    /// Upper bound of the random jitter added to each idle poll.
    ///
    /// Staggers claim polls across replicas so they do not hammer the
    /// queue table in lockstep.
    pub poll_jitter: Duration,

    /// How long a claimed job may sit in `delivering` before the
    /// maintenance sweep releases it back to `pending`.
    pub visibility_timeout: Duration,

    /// Interval between maintenance sweeps (abandoned-claim release and
    /// expiry purges).
    pub maintenance_interval: Duration,

    /// SMTP relay settings.
    pub smtp: SmtpConfig,

    /// Template service settings.
    pub template: TemplateConfig,

    /// Circuit breaker settings for the SMTP relay.
    pub circuit: CircuitConfig,

    /// Retry budget and backoff base.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers during graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(30),
            smtp: SmtpConfig::default(),
            template: TemplateConfig::default(),
            circuit: CircuitConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Email delivery engine.
///
/// Coordinates a pool of [`DeliveryWorker`]s over shared storage, a shared
/// mail transport, and shared reliability state. Start it with [`start`],
/// stop it with [`shutdown`]; a background maintenance task releases
/// abandoned claims and purges expired idempotency records while the
/// engine runs.
///
/// [`start`]: DeliveryEngine::start
/// [`shutdown`]: DeliveryEngine::shutdown
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    transport: Arc<dyn MailTransport>,
    templates: Arc<TemplateClient>,
    circuit_manager: Arc<CircuitBreakerManager>,
    retry: Arc<RetryCoordinator>,
    metrics: Arc<RwLock<DeliveryMetrics>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    maintenance_handle: Option<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
}

impl DeliveryEngine {
    /// Creates a delivery engine backed by Postgres.
    ///
    /// Builds the SMTP transport and template client from `config` and
    /// wires the status publisher into the event fan-out, so terminal
    /// outcomes land on the status feed without further setup.
    ///
    /// # Errors
    ///
    /// Returns an error if the SMTP transport or the template HTTP client
    /// cannot be constructed from `config`.
    pub fn new(pool: &PgPool, config: DeliveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let storage: Arc<dyn DeliveryStorage> =
            Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool.clone()))));

        let mut event_handler = MulticastEventHandler::new();
        event_handler.add_subscriber(Arc::new(StatusPublisherHandler::new(storage.clone())));

        Self::with_event_handler(storage, config, clock, Arc::new(event_handler))
    }

    /// Creates a delivery engine over explicit storage and event fan-out.
    ///
    /// # Errors
    ///
    /// Returns an error if the SMTP transport or the template HTTP client
    /// cannot be constructed from `config`.
    pub fn with_event_handler(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let transport: Arc<dyn MailTransport> = Arc::new(SmtpMailer::new(config.smtp.clone())?);
        let templates = TemplateClient::new(config.template.clone())?;
        Ok(Self::with_transport(storage, config, transport, templates, clock, event_handler))
    }

    /// Creates a delivery engine with every dependency injected.
    ///
    /// Tests use this with mock storage and a scripted transport.
    pub fn with_transport(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        transport: Arc<dyn MailTransport>,
        templates: TemplateClient,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        let circuit_manager =
            Arc::new(CircuitBreakerManager::with_clock(config.circuit.clone(), clock.clone()));
        let retry = Arc::new(RetryCoordinator::new(
            config.retry_policy.clone(),
            storage.clone(),
            clock.clone(),
        ));

        Self {
            storage,
            config,
            transport,
            templates: Arc::new(templates),
            circuit_manager,
            retry,
            metrics: Arc::new(RwLock::new(DeliveryMetrics::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            maintenance_handle: None,
            clock,
            event_handler,
        }
    }

    /// Starts the worker pool and the maintenance task.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            transport_key = self.transport.transport_key(),
            "starting email delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
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
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);
        self.maintenance_handle = Some(self.spawn_maintenance());

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Stops workers gracefully and joins the maintenance task.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker panicked or the pool misses the
    /// shutdown deadline.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        self.cancellation_token.cancel();

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }

        if let Some(handle) = self.maintenance_handle.take() {
            if let Err(error) = handle.await {
                warn!(%error, "maintenance task panicked during shutdown");
            }
        }

        Ok(())
    }

    /// Snapshot of the delivery counters.
    pub async fn metrics(&self) -> DeliveryMetrics {
        self.metrics.read().await.clone()
    }

    /// Shared handle to the delivery counters, for the metrics endpoint.
    pub fn metrics_handle(&self) -> Arc<RwLock<DeliveryMetrics>> {
        self.metrics.clone()
    }

    /// Claims and processes one batch on the calling task.
    ///
    /// Drives the same pipeline the pooled workers run, which makes batch
    /// outcomes observable without starting the pool. Returns the number
    /// of jobs processed.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming the batch fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.inline_worker().process_batch().await
    }

    /// Runs one maintenance sweep on the calling task.
    ///
    /// # Errors
    ///
    /// Returns an error if any sweep step fails against storage.
    pub async fn run_maintenance(&self) -> Result<()> {
        run_maintenance_sweep(&self.storage, &self.clock, self.config.visibility_timeout).await
    }

    fn inline_worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(
            0,
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
        )
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let storage = self.storage.clone();
        let clock = self.clock.clone();
        let cancellation_token = self.cancellation_token.clone();
        let interval = self.config.maintenance_interval;
        let visibility_timeout = self.config.visibility_timeout;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = clock.sleep(interval) => {}
                    () = cancellation_token.cancelled() => break,
                }

                if let Err(error) =
                    run_maintenance_sweep(&storage, &clock, visibility_timeout).await
                {
                    warn!(%error, "maintenance sweep failed");
                }
            }
        })
    }

    /// Forces the breaker for `transport_key` into `state`.
    #[cfg(test)]
    pub async fn force_circuit_state(
        &self,
        transport_key: &str,
        state: crate::circuit::CircuitState,
    ) {
        self.circuit_manager.force_circuit_state(transport_key, state).await;
    }
}

/// Releases abandoned claims and purges expired reliability records.
async fn run_maintenance_sweep(
    storage: &Arc<dyn DeliveryStorage>,
    clock: &Arc<dyn Clock>,
    visibility_timeout: Duration,
) -> Result<()> {
    let window = chrono::Duration::from_std(visibility_timeout)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));

    let released = storage
        .release_abandoned(clock.now_utc() - window)
        .await
        .map_err(|e| DeliveryError::database(format!("failed to release abandoned jobs: {e}")))?;
    if released > 0 {
        warn!(released, "released jobs stuck in delivering past the visibility timeout");
    }

    let purged_completions = storage
        .purge_expired_idempotency()
        .await
        .map_err(|e| DeliveryError::database(format!("failed to purge idempotency records: {e}")))?;
    let purged_counters = storage
        .purge_expired_retry_counters()
        .await
        .map_err(|e| DeliveryError::database(format!("failed to purge retry counters: {e}")))?;
    if purged_completions > 0 || purged_counters > 0 {
        debug!(purged_completions, purged_counters, "purged expired reliability records");
    }

    Ok(())
}

/// Single delivery worker.
///
/// Claims batches of pending jobs and processes each through the delivery
/// pipeline. Workers share storage, transport, breaker state, and metrics;
/// they hold no per-worker state beyond their id.
pub(crate) struct DeliveryWorker {
    id: usize,
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
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
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
            id,
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
        }
    }

    /// Runs the claim-process loop until cancellation.
    pub(crate) async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker started");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker stopping");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    let idle = self.config.poll_interval + sample_jitter(self.config.poll_jitter);
                    tokio::select! {
                        () = self.clock.sleep(idle) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
                Ok(count) => {
                    debug!(worker_id = self.id, jobs_processed = count, "batch completed");
                }
                Err(error) => {
                    error!(worker_id = self.id, %error, "batch processing failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Claims one batch and processes every job in it.
    pub(crate) async fn process_batch(&self) -> Result<usize> {
        let claimed = self
            .storage
            .claim_pending_jobs(self.config.batch_size)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim pending jobs: {e}")))?;

        if claimed.is_empty() {
            return Ok(0);
        }

        {
            let mut metrics = self.metrics.write().await;
            metrics.jobs_claimed += claimed.len() as u64;
        }

        debug!(worker_id = self.id, claimed = claimed.len(), "claimed pending jobs");

        let mut processed = 0;
        for job in claimed {
            if self.cancellation_token.is_cancelled() {
                // Unprocessed claims stay in delivering; the visibility
                // sweep releases them after the timeout.
                info!(worker_id = self.id, "cancellation requested, stopping mid-batch");
                break;
            }

            if let Err(error) = self.process_job(&job).await {
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    job_key = %job.job_key,
                    %error,
                    "job processing failed"
                );
            }
            processed += 1;
        }

        Ok(processed)
    }

    async fn process_job(&self, job: &EmailJob) -> Result<()> {
        if let Err(violation) = job.validate_claimed() {
            return self.reject_malformed(job, &violation).await;
        }

        match self.storage.is_completed(job.job_key.clone()).await {
            Ok(true) => {
                debug!(
                    worker_id = self.id,
                    job_id = %job.id,
                    job_key = %job.job_key,
                    "job already completed, acknowledging redelivery"
                );
                return self.storage.mark_delivered(job.id).await.map_err(|e| {
                    DeliveryError::database(format!("failed to acknowledge duplicate job: {e}"))
                });
            }
            Ok(false) => {}
            Err(error) => {
                // An unreachable idempotency store must not stall the
                // queue; the risk is a duplicate send, not a lost job.
                warn!(
                    worker_id = self.id,
                    job_key = %job.job_key,
                    %error,
                    "idempotency store unreachable, proceeding with delivery"
                );
            }
        }

        self.attempt_delivery(job).await
    }

    async fn attempt_delivery(&self, job: &EmailJob) -> Result<()> {
        let attempt_number = self.next_attempt_number(job).await;
        let transport_key = self.transport.transport_key();

        if !self.circuit_manager.can_request(transport_key).await {
            debug!(
                worker_id = self.id,
                job_id = %job.id,
                transport_key,
                "circuit open, delivery blocked"
            );
            // A denial never reaches the relay, so it records no breaker
            // failure; the retry budget still burns an attempt.
            let denial = DeliveryError::circuit_open(transport_key);
            return self.handle_failed_delivery(job, &denial, attempt_number).await;
        }

        match self.send_mail(job, attempt_number).await {
            Ok(receipt) => self.finalize_delivered(job, attempt_number, &receipt).await,
            Err(error) => {
                self.circuit_manager.record_failure(transport_key).await;
                self.handle_failed_delivery(job, &error, attempt_number).await
            }
        }
    }

    async fn send_mail(&self, job: &EmailJob, attempt_number: u32) -> Result<SendReceipt> {
        let span = info_span!(
            "email_delivery",
            job_id = %job.id,
            job_key = %job.job_key,
            recipient = %job.recipient,
            attempt = attempt_number
        );

        async move {
            let rendered = self.templates.render_for_job(job).await?;
            debug!("submitting message to relay");
            self.transport.send(&job.recipient, &rendered.subject, &rendered.html).await
        }
        .instrument(span)
        .await
    }

    async fn finalize_delivered(
        &self,
        job: &EmailJob,
        attempt_number: u32,
        receipt: &SendReceipt,
    ) -> Result<()> {
        // Completion record lands before the queue ack. A crash between
        // the two redelivers the job, and the idempotency check turns that
        // redelivery into an ack instead of a second send.
        if let Err(error) = self.storage.mark_completed(job.job_key.clone()).await {
            warn!(
                worker_id = self.id,
                job_key = %job.job_key,
                %error,
                "failed to record completion, redelivery may send a duplicate"
            );
        }

        self.storage
            .mark_delivered(job.id)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to mark job delivered: {e}")))?;

        self.circuit_manager.record_success(self.transport.transport_key()).await;

        {
            let mut metrics = self.metrics.write().await;
            metrics.delivered += 1;
        }

        self.record_attempt(job, attempt_number, receipt.smtp_code, true, None).await;

        info!(
            worker_id = self.id,
            job_id = %job.id,
            job_key = %job.job_key,
            recipient = %job.recipient,
            attempt_number,
            smtp_code = receipt.smtp_code,
            "email delivered"
        );

        self.publish_delivered(job, attempt_number, receipt.smtp_code).await;

        Ok(())
    }

    async fn handle_failed_delivery(
        &self,
        job: &EmailJob,
        error: &DeliveryError,
        attempt_number: u32,
    ) -> Result<()> {
        let classification = classify::classify(error);
        let reason = classification.reason.clone();

        self.record_attempt(job, attempt_number, error.smtp_code(), false, Some(reason.clone()))
            .await;

        {
            let mut metrics = self.metrics.write().await;
            if classification.is_permanent() {
                metrics.bounced += 1;
            } else {
                metrics.failed += 1;
            }
        }

        self.publish_failed(
            job,
            attempt_number,
            &reason,
            classification.is_permanent(),
            error.smtp_code(),
        )
        .await;

        if classification.is_permanent() {
            // Hard bounces skip the retry ladder entirely.
            self.dead_letter(job, &reason).await?;
            error!(
                worker_id = self.id,
                job_id = %job.id,
                job_key = %job.job_key,
                reason = %reason,
                "permanent failure, job dead lettered"
            );
            return Ok(());
        }

        match self.retry.handle_failure(&job.job_key).await {
            RetryVerdict::Retry { delay, next_attempt_at, .. } => {
                self.storage
                    .schedule_retry(job.id, reason.clone(), next_attempt_at)
                    .await
                    .map_err(|e| {
                        DeliveryError::database(format!("failed to schedule retry: {e}"))
                    })?;

                {
                    let mut metrics = self.metrics.write().await;
                    metrics.retries_scheduled += 1;
                }

                warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    job_key = %job.job_key,
                    attempt_number,
                    next_retry_at = %next_attempt_at,
                    delay_ms = delay.as_millis(),
                    %error,
                    "delivery failed, retry scheduled"
                );
            }
            RetryVerdict::DeadLetter { attempts } => {
                self.dead_letter(job, &reason).await?;
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    job_key = %job.job_key,
                    attempts,
                    "retry budget exhausted, job dead lettered"
                );
            }
        }

        Ok(())
    }

    /// Dead-letters a job that failed validation at claim time.
    ///
    /// The row never made it into the pipeline, so no breaker, counter,
    /// or bounce accounting applies; the failure event carries attempt
    /// number zero.
    async fn reject_malformed(&self, job: &EmailJob, violation: &CourierError) -> Result<()> {
        let detail = match violation {
            CourierError::MalformedJob { reason } => reason.clone(),
            other => other.to_string(),
        };
        let reason = format!("MALFORMED_JOB: {detail}");

        warn!(
            worker_id = self.id,
            job_id = %job.id,
            job_key = %job.job_key,
            reason = %reason,
            "claimed job failed validation, dead lettering"
        );

        self.dead_letter(job, &reason).await?;
        self.publish_failed(job, 0, &reason, true, None).await;
        Ok(())
    }

    async fn dead_letter(&self, job: &EmailJob, reason: &str) -> Result<()> {
        self.storage
            .mark_dead_letter(job.id, reason.to_string())
            .await
            .map_err(|e| DeliveryError::database(format!("failed to dead letter job: {e}")))?;

        let mut metrics = self.metrics.write().await;
        metrics.dead_lettered += 1;
        Ok(())
    }

    /// 1-based ordinal of the attempt about to run.
    ///
    /// A counter outage degrades to 1 so delivery proceeds; the retry
    /// coordinator logs the outage when it matters.
    async fn next_attempt_number(&self, job: &EmailJob) -> u32 {
        self.storage
            .current_attempts(job.job_key.clone())
            .await
            .map_or(1, |previous| previous.saturating_add(1))
    }

    async fn record_attempt(
        &self,
        job: &EmailJob,
        attempt_number: u32,
        smtp_code: Option<u16>,
        succeeded: bool,
        error_message: Option<String>,
    ) {
        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            job_id: job.id,
            attempt_number: i32::try_from(attempt_number).unwrap_or(i32::MAX),
            smtp_code: smtp_code.map(i32::from),
            succeeded,
            error_message,
            attempted_at: self.clock.now_utc(),
        };

        // Audit trail only; losing a row never affects the outcome.
        if let Err(error) = self.storage.record_delivery_attempt(attempt).await {
            warn!(
                worker_id = self.id,
                job_id = %job.id,
                %error,
                "failed to record delivery attempt"
            );
        }
    }

    async fn publish_delivered(&self, job: &EmailJob, attempt_number: u32, smtp_code: Option<u16>) {
        let event = DeliveryEvent::Delivered(JobDeliveredEvent {
            job_id: job.id,
            job_key: job.job_key.clone(),
            recipient: job.recipient.clone(),
            attempt_number,
            smtp_code,
            delivered_at: self.clock.now_utc(),
        });
        self.event_handler.handle_event(event).await;
    }

    async fn publish_failed(
        &self,
        job: &EmailJob,
        attempt_number: u32,
        reason: &str,
        permanent: bool,
        smtp_code: Option<u16>,
    ) {
        let event = DeliveryEvent::Failed(JobFailedEvent {
            job_id: job.id,
            job_key: job.job_key.clone(),
            recipient: job.recipient.clone(),
            attempt_number,
            reason: reason.to_string(),
            permanent,
            smtp_code,
            failed_at: self.clock.now_utc(),
        });
        self.event_handler.handle_event(event).await;
    }
}

/// Uniform jitter in `0..=max`.
fn sample_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{
        models::{JobPayload, JobStatus},
        time::TestClock,
        NoOpEventHandler,
    };
    use serde_json::json;
    use wiremock::{
        matchers::{method, path_regex},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        circuit::CircuitState,
        smtp::mock::MockMailTransport,
        storage::mock::MockDeliveryStorage,
    };

    struct TestPipeline {
        engine: DeliveryEngine,
        storage: Arc<MockDeliveryStorage>,
        transport: Arc<MockMailTransport>,
        clock: Arc<TestClock>,
        _template_server: MockServer,
    }

    async fn pipeline() -> TestPipeline {
        pipeline_with_config(DeliveryConfig::default()).await
    }

    async fn pipeline_with_config(config: DeliveryConfig) -> TestPipeline {
        let template_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/templates/.+$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"html": "<p>{{message}}</p>"})),
            )
            .mount(&template_server)
            .await;

        let clock = Arc::new(TestClock::new());
        let storage = Arc::new(MockDeliveryStorage::with_clock(clock.clone()));
        let transport = Arc::new(MockMailTransport::new());
        let templates = TemplateClient::new(TemplateConfig::new(template_server.uri()))
            .expect("template client");

        let engine = DeliveryEngine::with_transport(
            storage.clone(),
            config,
            transport.clone(),
            templates,
            clock.clone(),
            Arc::new(NoOpEventHandler::new()),
        );

        TestPipeline { engine, storage, transport, clock, _template_server: template_server }
    }

    fn make_job(job_key: &str, recipient: &str) -> EmailJob {
        let payload = JobPayload {
            job_id: job_key.to_string(),
            recipient: recipient.to_string(),
            template_ref: "welcome".to_string(),
            params: json!({"message": "hello"}),
            priority: 5,
        };
        EmailJob::from_payload(payload, Utc::now())
    }

    #[tokio::test]
    async fn engine_starts_and_shuts_down_with_configured_workers() {
        let mut pipeline = pipeline_with_config(DeliveryConfig {
            worker_count: 2,
            ..DeliveryConfig::default()
        })
        .await;

        pipeline.engine.start().await.expect("engine should start");
        assert_eq!(pipeline.engine.metrics().await.active_workers, 2);

        pipeline.engine.shutdown().await.expect("engine should shut down");
    }

    #[tokio::test]
    async fn process_batch_delivers_pending_job() {
        let pipeline = pipeline().await;
        let job = make_job("job-1", "alice@example.com");
        pipeline.storage.add_pending_job(job.clone()).await;

        let processed = pipeline.engine.process_batch().await.expect("batch should succeed");

        assert_eq!(processed, 1);
        assert_eq!(pipeline.transport.sent_count().await, 1);
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Delivered).await);
        assert!(pipeline.storage.is_marked_completed("job-1").await);

        let metrics = pipeline.engine.metrics().await;
        assert_eq!(metrics.jobs_claimed, 1);
        assert_eq!(metrics.delivered, 1);

        let attempts = pipeline.storage.recorded_attempts().await;
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].succeeded);
        assert_eq!(attempts[0].attempt_number, 1);
        assert_eq!(attempts[0].smtp_code, Some(250));
    }

    #[tokio::test]
    async fn duplicate_redelivery_acks_without_sending() {
        let pipeline = pipeline().await;
        let job = make_job("job-dup", "alice@example.com");
        pipeline.storage.seed_completed("job-dup").await;
        pipeline.storage.add_pending_job(job.clone()).await;

        pipeline.engine.process_batch().await.expect("batch should succeed");

        assert_eq!(pipeline.transport.sent_count().await, 0);
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Delivered).await);
        assert_eq!(pipeline.engine.metrics().await.delivered, 0);
    }

    #[tokio::test]
    async fn malformed_claimed_job_dead_letters_without_accounting() {
        let pipeline = pipeline().await;
        let mut job = make_job("job-bad", "alice@example.com");
        job.recipient = "not-an-address".to_string();
        pipeline.storage.add_pending_job(job.clone()).await;

        pipeline.engine.process_batch().await.expect("batch should succeed");

        assert_eq!(pipeline.transport.sent_count().await, 0);
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::DeadLetter).await);
        let stored = pipeline.storage.job(job.id).await.expect("job should exist");
        assert!(stored.last_error.as_deref().is_some_and(|r| r.starts_with("MALFORMED_JOB: ")));

        let metrics = pipeline.engine.metrics().await;
        assert_eq!(metrics.dead_lettered, 1);
        assert_eq!(metrics.bounced, 0);
        assert_eq!(metrics.failed, 0);
        assert!(pipeline.storage.recorded_attempts().await.is_empty());
        assert_eq!(pipeline.storage.attempt_counter("job-bad").await, 0);
    }

    #[tokio::test]
    async fn open_circuit_blocks_send_and_schedules_retry() {
        let pipeline = pipeline().await;
        let job = make_job("job-blocked", "alice@example.com");
        pipeline.storage.add_pending_job(job.clone()).await;

        pipeline.engine.force_circuit_state("smtp.test.invalid", CircuitState::Open).await;
        pipeline.engine.process_batch().await.expect("batch should succeed");

        assert_eq!(pipeline.transport.sent_count().await, 0);
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Pending).await);
        let stored = pipeline.storage.job(job.id).await.expect("job should exist");
        assert!(stored.next_retry_at.is_some());

        // The denial consumes retry budget even though no send happened.
        assert_eq!(pipeline.storage.attempt_counter("job-blocked").await, 1);

        let metrics = pipeline.engine.metrics().await;
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.retries_scheduled, 1);

        let attempts = pipeline.storage.recorded_attempts().await;
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].succeeded);
        assert_eq!(attempts[0].smtp_code, None);
    }

    #[tokio::test]
    async fn permanent_rejection_dead_letters_without_retry() {
        let pipeline = pipeline().await;
        let job = make_job("job-bounce", "gone@example.com");
        pipeline.storage.add_pending_job(job.clone()).await;
        pipeline
            .transport
            .script_failure(DeliveryError::smtp_rejection(Some(550), "5.1.1 User unknown"))
            .await;

        pipeline.engine.process_batch().await.expect("batch should succeed");

        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::DeadLetter).await);
        let stored = pipeline.storage.job(job.id).await.expect("job should exist");
        assert_eq!(stored.last_error.as_deref(), Some("5.1.1 User unknown"));

        // Permanent classification bypasses the retry coordinator.
        assert_eq!(pipeline.storage.attempt_counter("job-bounce").await, 0);

        let metrics = pipeline.engine.metrics().await;
        assert_eq!(metrics.bounced, 1);
        assert_eq!(metrics.failed, 0);
        assert_eq!(metrics.dead_lettered, 1);
        assert_eq!(metrics.retries_scheduled, 0);
    }

    #[tokio::test]
    async fn transient_failure_schedules_backoff_and_redelivers() {
        let pipeline = pipeline().await;
        let job = make_job("job-retry", "alice@example.com");
        pipeline.storage.add_pending_job(job.clone()).await;
        pipeline
            .transport
            .script_failure(DeliveryError::smtp_rejection(Some(421), "4.3.2 Try again later"))
            .await;

        pipeline.engine.process_batch().await.expect("batch should succeed");

        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Pending).await);
        let stored = pipeline.storage.job(job.id).await.expect("job should exist");
        let next_retry_at = stored.next_retry_at.expect("retry should be scheduled");
        assert_eq!(next_retry_at, pipeline.clock.now_utc() + chrono::Duration::seconds(1));

        // Not claimable until the backoff elapses.
        assert_eq!(pipeline.engine.process_batch().await.expect("batch should succeed"), 0);

        pipeline.clock.advance(Duration::from_secs(1));
        let processed = pipeline.engine.process_batch().await.expect("batch should succeed");
        assert_eq!(processed, 1);
        assert_eq!(pipeline.transport.sent_count().await, 1);
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Delivered).await);
    }

    #[tokio::test]
    async fn maintenance_releases_jobs_stuck_in_delivering() {
        let pipeline = pipeline().await;
        let job = make_job("job-stuck", "alice@example.com");
        pipeline.storage.add_pending_job(job.clone()).await;

        // Claim without processing, as if the worker died mid-flight.
        let claimed =
            pipeline.storage.claim_pending_jobs(10).await.expect("claim should succeed");
        assert_eq!(claimed.len(), 1);
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Delivering).await);

        // Inside the visibility window the claim is left alone.
        pipeline.engine.run_maintenance().await.expect("sweep should succeed");
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Delivering).await);

        pipeline.clock.advance(Duration::from_secs(301));
        pipeline.engine.run_maintenance().await.expect("sweep should succeed");
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Pending).await);

        assert_eq!(pipeline.engine.process_batch().await.expect("batch should succeed"), 1);
        assert!(pipeline.storage.verify_job_status(job.id, JobStatus::Delivered).await);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        assert_eq!(sample_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            let jitter = sample_jitter(Duration::from_millis(250));
            assert!(jitter <= Duration::from_millis(250));
        }
    }
}
