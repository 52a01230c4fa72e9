//! Storage abstraction layer for the delivery engine.
//!
//! Provides trait-based abstractions over storage operations to enable
//! testability without database dependencies. Production implementations
//! use the concrete `courier_core::storage::Storage` while tests can provide
//! mock implementations for deterministic behavior validation.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{DeliveryAttempt, EmailJob, JobId, JobStatus, StatusKind, StatusUpdate},
};

/// Storage operations required by the delivery pipeline.
///
/// This trait abstracts all stores the pipeline touches: the job queue, the
/// idempotency records, the retry counters, the status feed, and the attempt
/// audit trail. The separation allows testing delivery logic, retry policy,
/// and failure handling without database overhead, including simulating
/// partial store outages that production must survive.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Claims pending email jobs for processing.
    ///
    /// Uses FOR UPDATE SKIP LOCKED in production to enable lock-free
    /// concurrent claiming. Returns up to `batch_size` jobs, highest
    /// priority first and oldest first within a priority.
    fn claim_pending_jobs(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EmailJob>>> + Send + '_>>;

    /// Marks an email job as successfully delivered. Terminal state.
    fn mark_delivered(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns a failed job to the queue for redelivery after
    /// `next_retry_at`.
    ///
    /// The broker-native analog of a delayed negative acknowledgement: the
    /// job becomes claimable again once the time passes, without occupying
    /// any worker in the meantime.
    fn schedule_retry(
        &self,
        job_id: JobId,
        reason: String,
        next_retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Routes a job to the dead letter destination with its final reason.
    /// Terminal state.
    fn mark_dead_letter(
        &self,
        job_id: JobId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns jobs claimed before the cutoff to pending.
    ///
    /// Stands in for the broker's visibility timeout: claims abandoned by a
    /// crashed worker become claimable again.
    fn release_abandoned(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Checks whether the job already completed within the idempotency
    /// window.
    fn is_completed(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Records the job as completed for the idempotency window.
    fn mark_completed(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Reads the retry attempts consumed so far for a job key.
    fn current_attempts(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>>;

    /// Atomically increments the retry counter, returning the new count.
    ///
    /// Atomic check-and-increment keeps two concurrent redeliveries of the
    /// same job from double-counting an attempt.
    fn increment_attempts(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>>;

    /// Publishes a delivery status event to the feedback channel.
    ///
    /// Best effort from the caller's perspective: publish failures are
    /// reported but must never decide the job's own fate.
    fn publish_status(
        &self,
        notification_id: String,
        status: StatusKind,
        error: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Claims a batch of unconsumed status events for the feedback
    /// consumer, marking them consumed.
    fn claim_status_updates(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StatusUpdate>>> + Send + '_>>;

    /// Records a delivery attempt for the audit trail.
    fn record_delivery_attempt(
        &self,
        attempt: DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Finds the current status of a job.
    ///
    /// Used for verification in tests and monitoring the job lifecycle.
    fn find_job_status(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + '_>>;

    /// Finds all delivery attempts for a job, oldest first.
    fn find_delivery_attempts(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>>;

    /// Removes idempotency records older than the completion window.
    fn purge_expired_idempotency(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Removes retry counters untouched for longer than their TTL.
    fn purge_expired_retry_counters(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
///
/// Wraps the concrete `courier_core::storage::Storage` to implement the
/// `DeliveryStorage` trait. All database operations go through the
/// repository pattern for consistency and type safety.
pub struct PostgresDeliveryStorage {
    storage: Arc<courier_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn claim_pending_jobs(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EmailJob>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.email_jobs.claim_pending(batch_size).await })
    }

    fn mark_delivered(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.email_jobs.mark_delivered(job_id).await })
    }

    fn schedule_retry(
        &self,
        job_id: JobId,
        reason: String,
        next_retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.email_jobs.schedule_retry(job_id, &reason, next_retry_at).await
        })
    }

    fn mark_dead_letter(
        &self,
        job_id: JobId,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.email_jobs.mark_dead_letter(job_id, &reason).await })
    }

    fn release_abandoned(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.email_jobs.release_abandoned(claimed_before).await })
    }

    fn is_completed(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.idempotency.is_completed(&job_key).await })
    }

    fn mark_completed(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.idempotency.mark_completed(&job_key).await })
    }

    fn current_attempts(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_counters.current_attempts(&job_key).await })
    }

    fn increment_attempts(
        &self,
        job_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_counters.increment(&job_key).await })
    }

    fn publish_status(
        &self,
        notification_id: String,
        status: StatusKind,
        error: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .status_updates
                .publish(&notification_id, status, error.as_deref())
                .await
                .map(|_| ())
        })
    }

    fn claim_status_updates(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StatusUpdate>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.status_updates.claim_unconsumed(batch_size).await })
    }

    fn record_delivery_attempt(
        &self,
        attempt: DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.record(&attempt).await.map(|_| ()) })
    }

    fn find_job_status(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .email_jobs
                .find_by_id(job_id)
                .await?
                .ok_or_else(|| {
                    courier_core::error::CoreError::NotFound(format!("job {job_id} not found"))
                })
                .map(|job| job.status)
        })
    }

    fn find_delivery_attempts(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.find_for_job(job_id).await })
    }

    fn purge_expired_idempotency(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.idempotency.purge_expired().await })
    }

    fn purge_expired_retry_counters(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_counters.purge_expired().await })
    }
}

pub mod mock {
    //! Mock storage implementation for testing.
    //!
    //! Provides deterministic, in-memory storage for testing delivery logic
    //! without database dependencies. Each backing store can be put into an
    //! outage independently, which is how the partial-failure contracts
    //! (counter store down, idempotency store down) get exercised.

    use std::{
        collections::{HashMap, HashSet},
        future::Future,
        pin::Pin,
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        time::{Clock, RealClock},
    };
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{DeliveryAttempt, DeliveryStorage, EmailJob, JobId, JobStatus, StatusKind,
                StatusUpdate};

    /// Mock storage for testing delivery logic without a database.
    ///
    /// Stores data in-memory with configurable behavior. Supports injecting
    /// store outages, controlling job sequences, and verifying operations.
    pub struct MockDeliveryStorage {
        jobs: Arc<RwLock<HashMap<JobId, EmailJob>>>,
        pending: Arc<RwLock<Vec<EmailJob>>>,
        completed: Arc<RwLock<HashSet<String>>>,
        counters: Arc<RwLock<HashMap<String, u32>>>,
        statuses: Arc<RwLock<Vec<StatusUpdate>>>,
        attempts: Arc<RwLock<Vec<DeliveryAttempt>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        idempotency_down: Arc<RwLock<bool>>,
        counters_down: Arc<RwLock<bool>>,
        publish_down: Arc<RwLock<bool>>,
        clock: Arc<dyn Clock>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates a mock storage whose readiness checks use the given clock.
        ///
        /// Pair this with the same `TestClock` the engine runs on so that
        /// advancing the clock makes scheduled retries claimable.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self {
                jobs: Arc::new(RwLock::new(HashMap::new())),
                pending: Arc::new(RwLock::new(Vec::new())),
                completed: Arc::new(RwLock::new(HashSet::new())),
                counters: Arc::new(RwLock::new(HashMap::new())),
                statuses: Arc::new(RwLock::new(Vec::new())),
                attempts: Arc::new(RwLock::new(Vec::new())),
                claim_error: Arc::new(RwLock::new(None)),
                idempotency_down: Arc::new(RwLock::new(false)),
                counters_down: Arc::new(RwLock::new(false)),
                publish_down: Arc::new(RwLock::new(false)),
                clock,
            }
        }

        /// Adds an email job to the pending queue.
        pub async fn add_pending_job(&self, job: EmailJob) {
            self.jobs.write().await.insert(job.id, job.clone());
            self.pending.write().await.push(job);
        }

        /// Seeds the idempotency store with an already-completed key.
        pub async fn seed_completed(&self, job_key: impl Into<String>) {
            self.completed.write().await.insert(job_key.into());
        }

        /// Seeds the retry counter for a key.
        pub async fn seed_attempts(&self, job_key: impl Into<String>, attempts: u32) {
            self.counters.write().await.insert(job_key.into(), attempts);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: String) {
            *self.claim_error.write().await = Some(error);
        }

        /// Puts the idempotency store into or out of an outage.
        pub async fn set_idempotency_outage(&self, down: bool) {
            *self.idempotency_down.write().await = down;
        }

        /// Puts the retry counter store into or out of an outage.
        pub async fn set_counter_outage(&self, down: bool) {
            *self.counters_down.write().await = down;
        }

        /// Puts the status feed into or out of an outage.
        pub async fn set_publish_outage(&self, down: bool) {
            *self.publish_down.write().await = down;
        }

        /// Returns all published status events, oldest first.
        pub async fn published_statuses(&self) -> Vec<StatusUpdate> {
            self.statuses.read().await.clone()
        }

        /// Returns all recorded delivery attempts for verification.
        pub async fn recorded_attempts(&self) -> Vec<DeliveryAttempt> {
            self.attempts.read().await.clone()
        }

        /// Returns the stored job, including its current status and error.
        pub async fn job(&self, job_id: JobId) -> Option<EmailJob> {
            self.jobs.read().await.get(&job_id).cloned()
        }

        /// Verifies a job reached the expected status.
        pub async fn verify_job_status(&self, job_id: JobId, expected: JobStatus) -> bool {
            self.jobs.read().await.get(&job_id).is_some_and(|j| j.status == expected)
        }

        /// Returns true if the key is marked completed in the idempotency
        /// store.
        pub async fn is_marked_completed(&self, job_key: &str) -> bool {
            self.completed.read().await.contains(job_key)
        }

        /// Returns the current retry counter value for a key.
        pub async fn attempt_counter(&self, job_key: &str) -> u32 {
            self.counters.read().await.get(job_key).copied().unwrap_or(0)
        }
    }

    impl Default for MockDeliveryStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn claim_pending_jobs(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<EmailJob>>> + Send + '_>> {
            let claim_error = self.claim_error.clone();
            let pending = self.pending.clone();
            let jobs = self.jobs.clone();
            let clock = self.clock.clone();

            Box::pin(async move {
                let error = claim_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Database(error));
                }

                let now = clock.now_utc();
                let mut queue = pending.write().await;

                // Same selection rule as production: ready rows only,
                // highest priority first, FIFO within a priority.
                queue.sort_by(|a, b| {
                    b.priority.cmp(&a.priority).then_with(|| a.received_at.cmp(&b.received_at))
                });

                let mut claimed = Vec::new();
                let mut remaining = Vec::new();
                for job in queue.drain(..) {
                    let ready = job.next_retry_at.is_none_or(|at| at <= now);
                    if ready && claimed.len() < batch_size {
                        claimed.push(job);
                    } else {
                        remaining.push(job);
                    }
                }
                *queue = remaining;
                drop(queue);

                let mut jobs_map = jobs.write().await;
                for job in &mut claimed {
                    job.status = JobStatus::Delivering;
                    job.claimed_at = Some(now);
                    if let Some(stored) = jobs_map.get_mut(&job.id) {
                        stored.status = JobStatus::Delivering;
                        stored.claimed_at = Some(now);
                    }
                }

                Ok(claimed)
            })
        }

        fn mark_delivered(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let clock = self.clock.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    job.status = JobStatus::Delivered;
                    job.delivered_at = Some(clock.now_utc());
                    job.claimed_at = None;
                }
                Ok(())
            })
        }

        fn schedule_retry(
            &self,
            job_id: JobId,
            reason: String,
            next_retry_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let pending = self.pending.clone();
            Box::pin(async move {
                let mut jobs_map = jobs.write().await;
                if let Some(job) = jobs_map.get_mut(&job_id) {
                    job.status = JobStatus::Pending;
                    job.last_error = Some(reason);
                    job.next_retry_at = Some(next_retry_at);
                    job.claimed_at = None;
                    pending.write().await.push(job.clone());
                }
                Ok(())
            })
        }

        fn mark_dead_letter(
            &self,
            job_id: JobId,
            reason: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let clock = self.clock.clone();
            Box::pin(async move {
                if let Some(job) = jobs.write().await.get_mut(&job_id) {
                    job.status = JobStatus::DeadLetter;
                    job.last_error = Some(reason);
                    job.dead_lettered_at = Some(clock.now_utc());
                    job.next_retry_at = None;
                    job.claimed_at = None;
                }
                Ok(())
            })
        }

        fn release_abandoned(
            &self,
            claimed_before: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let jobs = self.jobs.clone();
            let pending = self.pending.clone();
            Box::pin(async move {
                let mut released = 0;
                let mut jobs_map = jobs.write().await;
                let mut queue = pending.write().await;
                for job in jobs_map.values_mut() {
                    let abandoned = job.status == JobStatus::Delivering
                        && job.claimed_at.is_some_and(|at| at < claimed_before);
                    if abandoned {
                        job.status = JobStatus::Pending;
                        job.claimed_at = None;
                        queue.push(job.clone());
                        released += 1;
                    }
                }
                Ok(released)
            })
        }

        fn is_completed(
            &self,
            job_key: String,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let completed = self.completed.clone();
            let down = self.idempotency_down.clone();
            Box::pin(async move {
                if *down.read().await {
                    return Err(CoreError::Database("idempotency store unreachable".to_string()));
                }
                Ok(completed.read().await.contains(&job_key))
            })
        }

        fn mark_completed(
            &self,
            job_key: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let completed = self.completed.clone();
            let down = self.idempotency_down.clone();
            Box::pin(async move {
                if *down.read().await {
                    return Err(CoreError::Database("idempotency store unreachable".to_string()));
                }
                completed.write().await.insert(job_key);
                Ok(())
            })
        }

        fn current_attempts(
            &self,
            job_key: String,
        ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
            let counters = self.counters.clone();
            let down = self.counters_down.clone();
            Box::pin(async move {
                if *down.read().await {
                    return Err(CoreError::Database("counter store unreachable".to_string()));
                }
                Ok(counters.read().await.get(&job_key).copied().unwrap_or(0))
            })
        }

        fn increment_attempts(
            &self,
            job_key: String,
        ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
            let counters = self.counters.clone();
            let down = self.counters_down.clone();
            Box::pin(async move {
                if *down.read().await {
                    return Err(CoreError::Database("counter store unreachable".to_string()));
                }
                let mut map = counters.write().await;
                let count = map.entry(job_key).or_insert(0);
                *count += 1;
                Ok(*count)
            })
        }

        fn publish_status(
            &self,
            notification_id: String,
            status: StatusKind,
            error: Option<String>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let statuses = self.statuses.clone();
            let down = self.publish_down.clone();
            let clock = self.clock.clone();
            Box::pin(async move {
                if *down.read().await {
                    return Err(CoreError::Database("status feed unreachable".to_string()));
                }
                statuses.write().await.push(StatusUpdate {
                    id: Uuid::new_v4(),
                    notification_id,
                    status,
                    error,
                    created_at: clock.now_utc(),
                    consumed_at: None,
                });
                Ok(())
            })
        }

        fn claim_status_updates(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<StatusUpdate>>> + Send + '_>> {
            let statuses = self.statuses.clone();
            let clock = self.clock.clone();
            Box::pin(async move {
                let now = clock.now_utc();
                let mut all = statuses.write().await;
                let mut claimed = Vec::new();
                for update in all.iter_mut() {
                    if update.consumed_at.is_none() && claimed.len() < batch_size {
                        update.consumed_at = Some(now);
                        claimed.push(update.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn record_delivery_attempt(
            &self,
            attempt: DeliveryAttempt,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let attempts = self.attempts.clone();
            Box::pin(async move {
                attempts.write().await.push(attempt);
                Ok(())
            })
        }

        fn find_job_status(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                jobs.read().await.get(&job_id).map(|j| j.status).ok_or_else(|| {
                    CoreError::NotFound(format!("job {} not found", job_id.0))
                })
            })
        }

        fn find_delivery_attempts(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
            let attempts = self.attempts.clone();
            Box::pin(async move {
                let matching = attempts
                    .read()
                    .await
                    .iter()
                    .filter(|attempt| attempt.job_id == job_id)
                    .cloned()
                    .collect();
                Ok(matching)
            })
        }

        // The in-memory stores carry no timestamps, so expiry purges are
        // no-ops here.
        fn purge_expired_idempotency(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move { Ok(0) })
        }

        fn purge_expired_retry_counters(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move { Ok(0) })
        }
    }
}
