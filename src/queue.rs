//! Persistent FIFO of production requests.
//!
//! Items move `queued -> processing -> done | error`. At most one item is
//! `processing` at any time; `claim_next` enforces that in a single statement.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::model::{ProductionRequest, QueueItem, QueueStatus};

#[derive(Clone)]
pub struct WorkQueue {
    pool: SqlitePool,
    changed: Arc<Notify>,
}

impl WorkQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append a request with status `queued`.
    pub async fn enqueue(&self, req: &ProductionRequest) -> Result<QueueItem> {
        if req.script.trim().is_empty() {
            return Err(anyhow!("script must not be empty"));
        }
        if req.channel_id.trim().is_empty() {
            return Err(anyhow!("channel id must not be empty"));
        }
        let item = db::insert_item(&self.pool, req).await?;
        info!(id = %item.request.id, name = %item.request.name, "queued production");
        self.changed.notify_one();
        Ok(item)
    }

    /// Remove a request that is not currently being processed.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        if db::delete_item(&self.pool, id).await? {
            info!(%id, "removed queue item");
            return Ok(());
        }
        match db::get_item(&self.pool, id).await? {
            Some(item) if item.status == QueueStatus::Processing => {
                Err(anyhow!("queue item {id} is processing and cannot be removed"))
            }
            _ => Err(anyhow!("queue item {id} not found")),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueueItem>> {
        db::get_item(&self.pool, id).await
    }

    /// All items in insertion order.
    pub async fn list(&self) -> Result<Vec<QueueItem>> {
        db::list_items(&self.pool).await
    }

    pub async fn peek_next(&self) -> Result<Option<QueueItem>> {
        db::next_queued(&self.pool).await
    }

    pub async fn has_pending(&self) -> Result<bool> {
        Ok(self.peek_next().await?.is_some())
    }

    /// Claim the oldest queued item, or `None` if the queue is empty or an
    /// item is already processing.
    pub async fn claim_next(&self) -> Result<Option<QueueItem>> {
        db::claim_next(&self.pool).await
    }

    pub async fn mark_done(&self, id: Uuid) -> Result<()> {
        db::transition(
            &self.pool,
            id,
            &[QueueStatus::Processing],
            QueueStatus::Done,
            None,
        )
        .await?;
        self.changed.notify_one();
        Ok(())
    }

    pub async fn mark_error(&self, id: Uuid, message: &str) -> Result<()> {
        db::transition(
            &self.pool,
            id,
            &[QueueStatus::Processing],
            QueueStatus::Error,
            Some(message),
        )
        .await?;
        self.changed.notify_one();
        Ok(())
    }

    /// Put an item back at its original position: a claimed item that could not
    /// start, or a failed item the user wants to try again.
    pub async fn requeue(&self, id: Uuid) -> Result<()> {
        db::transition(
            &self.pool,
            id,
            &[QueueStatus::Processing, QueueStatus::Error],
            QueueStatus::Queued,
            None,
        )
        .await?;
        self.changed.notify_one();
        Ok(())
    }

    /// Recover items left `processing` by a previous session.
    pub async fn requeue_stale(&self) -> Result<u64> {
        let n = db::requeue_stale(&self.pool).await?;
        if n > 0 {
            info!(count = n, "requeued stale items");
            self.changed.notify_one();
        }
        Ok(n)
    }

    /// Resolves after the next queue change (stores a permit if none is waiting).
    pub async fn notified(&self) {
        self.changed.notified().await
    }
}
