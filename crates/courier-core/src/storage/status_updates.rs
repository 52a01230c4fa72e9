//! Repository for delivery status updates.
//!
//! Status updates form the outbound feedback channel: the delivery pipeline
//! publishes one row per terminal outcome and the feedback consumer drains
//! them with the same skip-locked claim used for jobs. Publish failures are
//! the caller's concern; this layer only reports them.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{StatusKind, StatusUpdate},
};

/// Columns returned for every `StatusUpdate` query, in `FromRow` order.
const STATUS_COLUMNS: &str = "id, notification_id, status, error, created_at, consumed_at";

/// Repository for status update database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Publishes a status update for a notification.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn publish(
        &self,
        notification_id: &str,
        status: StatusKind,
        error: Option<&str>,
    ) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO status_updates (id, notification_id, status, error, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id
            ",
        )
        .bind(Uuid::new_v4())
        .bind(notification_id)
        .bind(status.to_string())
        .bind(error)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Claims a batch of unconsumed status updates and marks them consumed.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent consumers never tally the
    /// same update twice. Claim and consume happen in one transaction; a
    /// consumer crash before the commit leaves the rows unconsumed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_unconsumed(&self, batch_size: usize) -> Result<Vec<StatusUpdate>> {
        let mut tx = self.pool.begin().await?;

        let update_ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM status_updates
            WHERE consumed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if update_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let updates = sqlx::query_as::<_, StatusUpdate>(&format!(
            r"
            UPDATE status_updates
            SET consumed_at = NOW()
            WHERE id = ANY($1)
            RETURNING {STATUS_COLUMNS}
            ",
        ))
        .bind(&update_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(updates)
    }

    /// Counts status updates not yet drained by the feedback consumer.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_unconsumed(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM status_updates
            WHERE consumed_at IS NULL
            ",
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }

    /// Finds recent status updates for a notification, newest first.
    ///
    /// Used for troubleshooting a single notification's delivery history.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_notification(
        &self,
        notification_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<StatusUpdate>> {
        let updates = sqlx::query_as::<_, StatusUpdate>(&format!(
            r"
            SELECT {STATUS_COLUMNS}
            FROM status_updates
            WHERE notification_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        ))
        .bind(notification_id)
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
