//! Status publication into the outbox.
//!
//! Subscribes to delivery events and writes `status_updates` rows that the
//! feedback consumer later claims. Publish failures are logged and dropped:
//! the status channel is observability, never an input to the delivery
//! decision, so an unreachable outbox must not fail or retry the job.

use std::{fmt, sync::Arc};

use courier_core::{DeliveryEvent, EventHandler, StatusKind};
use tracing::{debug, warn};

use crate::storage::DeliveryStorage;

/// Publishes delivery outcomes as status events keyed by the caller-assigned
/// job identifier.
#[derive(Clone)]
pub struct StatusPublisherHandler {
    storage: Arc<dyn DeliveryStorage>,
}

impl fmt::Debug for StatusPublisherHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusPublisherHandler").finish_non_exhaustive()
    }
}

impl StatusPublisherHandler {
    /// Creates a publisher writing through the given storage.
    pub fn new(storage: Arc<dyn DeliveryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl EventHandler for StatusPublisherHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let result = match &event {
            DeliveryEvent::Delivered(delivered) => {
                self.storage
                    .publish_status(delivered.job_key.clone(), StatusKind::Delivered, None)
                    .await
            },
            DeliveryEvent::Failed(failed) => {
                self.storage
                    .publish_status(
                        failed.job_key.clone(),
                        StatusKind::Failed,
                        Some(failed.reason.clone()),
                    )
                    .await
            },
        };

        match result {
            Ok(()) => debug!(job_key = event.job_key(), "status update published"),
            Err(error) => {
                warn!(
                    job_key = event.job_key(),
                    error = %error,
                    "failed to publish status update"
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{JobDeliveredEvent, JobFailedEvent, JobId};

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    fn delivered(job_key: &str) -> DeliveryEvent {
        DeliveryEvent::Delivered(JobDeliveredEvent {
            job_id: JobId::new(),
            job_key: job_key.to_string(),
            recipient: "a@example.com".to_string(),
            attempt_number: 1,
            smtp_code: Some(250),
            delivered_at: Utc::now(),
        })
    }

    fn failed(job_key: &str, reason: &str) -> DeliveryEvent {
        DeliveryEvent::Failed(JobFailedEvent {
            job_id: JobId::new(),
            job_key: job_key.to_string(),
            recipient: "a@example.com".to_string(),
            attempt_number: 1,
            reason: reason.to_string(),
            permanent: true,
            smtp_code: Some(550),
            failed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn delivered_event_publishes_delivered_status() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let handler = StatusPublisherHandler::new(storage.clone());

        handler.handle_event(delivered("j-1")).await;

        let published = storage.published_statuses().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].notification_id, "j-1");
        assert_eq!(published[0].status, StatusKind::Delivered);
        assert_eq!(published[0].error, None);
    }

    #[tokio::test]
    async fn failed_event_publishes_classified_reason() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let handler = StatusPublisherHandler::new(storage.clone());

        handler.handle_event(failed("j-2", "5.1.1 User unknown")).await;

        let published = storage.published_statuses().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].status, StatusKind::Failed);
        assert_eq!(published[0].error.as_deref(), Some("5.1.1 User unknown"));
    }

    #[tokio::test]
    async fn outbox_outage_is_swallowed() {
        let storage = Arc::new(MockDeliveryStorage::new());
        storage.set_publish_outage(true).await;
        let handler = StatusPublisherHandler::new(storage.clone());

        handler.handle_event(delivered("j-3")).await;

        assert!(storage.published_statuses().await.is_empty());
    }
}
