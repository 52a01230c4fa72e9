//! Event system for decoupled delivery-outcome consumers.
//!
//! The delivery engine emits typed events; subscribers (status publisher,
//! logging, future audit sinks) register against an explicit handler trait
//! with multicast dispatch. One handler per concern, exhaustive over the
//! declared outcomes, no dispatch-by-string-name.
//!
//! ```text
//! ┌────────────────┐  Delivered/Failed   ┌──────────────────────┐
//! │ DeliveryWorker │ ───────────────────▶│ MulticastEventHandler│
//! └────────────────┘                     └──────────┬───────────┘
//!                                                   │
//!                                  ┌────────────────┴────────────────┐
//!                                  ▼                                 ▼
//!                       StatusPublisherHandler              (other subscribers)
//!                       inserts status_updates rows
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::JobId;

/// Events emitted by the delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// An email job was delivered.
    Delivered(JobDeliveredEvent),

    /// A delivery attempt failed (possibly terminally).
    Failed(JobFailedEvent),
}

impl DeliveryEvent {
    /// Caller-assigned job identifier the event refers to.
    pub fn job_key(&self) -> &str {
        match self {
            Self::Delivered(e) => &e.job_key,
            Self::Failed(e) => &e.job_key,
        }
    }
}

/// Payload for a successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDeliveredEvent {
    /// Job row that was delivered.
    pub job_id: JobId,

    /// Caller-assigned job identifier.
    pub job_key: String,

    /// Destination address.
    pub recipient: String,

    /// 1-based attempt ordinal that succeeded.
    pub attempt_number: u32,

    /// SMTP reply code when the transport reported one (usually 250).
    pub smtp_code: Option<u16>,

    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Payload for a failed delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailedEvent {
    /// Job row that failed.
    pub job_id: JobId,

    /// Caller-assigned job identifier.
    pub job_key: String,

    /// Destination address.
    pub recipient: String,

    /// 1-based attempt ordinal that failed. Zero when the job was rejected
    /// before any send attempt was made.
    pub attempt_number: u32,

    /// Classified failure reason (raw message, `SMTP_<code>` or
    /// `SMTP_unknown`).
    pub reason: String,

    /// Whether the failure classified permanent (bounce).
    pub permanent: bool,

    /// SMTP reply code when the transport answered.
    pub smtp_code: Option<u16>,

    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Trait for subscribers reacting to delivery outcomes.
///
/// Implementations must not block the delivery pipeline and must swallow
/// their own failures: a status sink that is down is a secondary failure
/// channel, logged but never escalated into the job's outcome.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Event handler that discards everything.
///
/// Used when no subscribers are wired up, and in tests that do not care
/// about the feedback loop.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards events to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        // Subscriber failures never propagate into delivery processing.
        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        seen: Arc<AtomicUsize>,
    }

    impl CountingHandler {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let seen = Arc::new(AtomicUsize::new(0));
            (Self { seen: seen.clone() }, seen)
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn delivered_event(job_key: &str) -> DeliveryEvent {
        DeliveryEvent::Delivered(JobDeliveredEvent {
            job_id: JobId::new(),
            job_key: job_key.to_string(),
            recipient: "a@example.com".to_string(),
            attempt_number: 1,
            smtp_code: Some(250),
            delivered_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let mut multicast = MulticastEventHandler::new();
        let (first, first_seen) = CountingHandler::new();
        let (second, second_seen) = CountingHandler::new();
        multicast.add_subscriber(Arc::new(first));
        multicast.add_subscriber(Arc::new(second));

        assert_eq!(multicast.subscriber_count(), 2);

        multicast.handle_event(delivered_event("j-1")).await;

        assert_eq!(first_seen.load(Ordering::SeqCst), 1);
        assert_eq!(second_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multicast_tolerates_zero_subscribers() {
        let multicast = MulticastEventHandler::new();
        multicast.handle_event(delivered_event("j-2")).await;
    }

    #[tokio::test]
    async fn no_op_handler_discards_events() {
        NoOpEventHandler::new().handle_event(delivered_event("j-3")).await;
    }

    #[test]
    fn job_key_accessor_covers_both_variants() {
        assert_eq!(delivered_event("j-4").job_key(), "j-4");

        let failed = DeliveryEvent::Failed(JobFailedEvent {
            job_id: JobId::new(),
            job_key: "j-5".to_string(),
            recipient: "a@example.com".to_string(),
            attempt_number: 2,
            reason: "SMTP_451".to_string(),
            permanent: false,
            smtp_code: Some(451),
            failed_at: Utc::now(),
        });
        assert_eq!(failed.job_key(), "j-5");
    }
}
