//! Read side of the status feed.
//!
//! Workers publish terminal outcomes onto the `status_updates` feed; the
//! [`FeedbackConsumer`] claims them in batches and keeps running tallies of
//! what it observed. The tallies are deliberately separate from
//! [`DeliveryMetrics`]: the worker counters are the canonical outcome
//! counts, while these reflect what actually arrived on the feed, so the
//! two can be compared when debugging feed lag or publish outages.
//!
//! [`DeliveryMetrics`]: crate::metrics::DeliveryMetrics

use std::{sync::Arc, time::Duration};

use courier_core::{models::StatusKind, time::Clock};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    classify::matches_permanent_phrase,
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

/// Outcome counts observed on the status feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedTallies {
    /// Delivered statuses consumed.
    pub delivered: u64,
    /// Failed statuses whose error did not look like a hard bounce.
    pub failed: u64,
    /// Failed statuses whose error matched a permanent-failure phrase.
    pub bounced: u64,
}

/// Consumes status updates and tallies observed outcomes.
///
/// Failed statuses are split into bounced and failed by re-applying the
/// permanent-failure phrase match to the error text, since the feed does
/// not carry the worker's classification.
pub struct FeedbackConsumer {
    storage: Arc<dyn DeliveryStorage>,
    batch_size: usize,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
    tallies: Arc<RwLock<ObservedTallies>>,
}

impl FeedbackConsumer {
    /// Creates a consumer over the given feed storage.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        batch_size: usize,
        poll_interval: Duration,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            batch_size,
            poll_interval,
            cancellation_token,
            clock,
            tallies: Arc::new(RwLock::new(ObservedTallies::default())),
        }
    }

    /// Runs the claim-tally loop until cancellation.
    pub async fn run(&self) {
        info!(batch_size = self.batch_size, "feedback consumer started");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!("feedback consumer stopping");
                break;
            }

            match self.process_pending().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "status feed read failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
            }
        }
    }

    /// Claims one batch of unconsumed updates and applies it to the tallies.
    ///
    /// Returns the number of updates consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be read.
    pub async fn process_pending(&self) -> Result<usize> {
        let updates = self
            .storage
            .claim_status_updates(self.batch_size)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim status updates: {e}")))?;

        if updates.is_empty() {
            return Ok(0);
        }

        let mut tallies = self.tallies.write().await;
        for update in &updates {
            match update.status {
                StatusKind::Delivered => tallies.delivered += 1,
                StatusKind::Failed => {
                    let bounced =
                        update.error.as_deref().is_some_and(matches_permanent_phrase);
                    if bounced {
                        tallies.bounced += 1;
                    } else {
                        tallies.failed += 1;
                    }
                }
            }
            debug!(
                notification_id = %update.notification_id,
                status = ?update.status,
                "consumed status update"
            );
        }
        drop(tallies);

        Ok(updates.len())
    }

    /// Snapshot of the observed tallies.
    pub async fn tallies(&self) -> ObservedTallies {
        *self.tallies.read().await
    }
}
