//! Work queue: durable FIFO handoff between execution creation and broadcast.
//!
//! Items live in the `work_queue` table of the same libSQL file as the task
//! store, so a push survives restarts and is visible to other processes.
//! `pop` removes the oldest row with a single `DELETE ... RETURNING`, so two
//! poppers never receive the same item.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::params;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::QueueError;
use crate::store::ConnectionSource;
use crate::store::libsql_backend::format_ts;

/// Default queue name for executions awaiting broadcast.
pub const DEFAULT_QUEUE_NAME: &str = "tasks:pending";

/// Back-off between empty polls while waiting in `pop`.
const POLL_BACKOFF: Duration = Duration::from_millis(250);

/// A single named FIFO of string items with at-least-once delivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Name of the underlying queue.
    fn name(&self) -> &str;

    /// Append an item. Does not block on consumers.
    async fn push(&self, item: &str) -> Result<(), QueueError>;

    /// Append an item unless an equal one is already queued. Returns whether
    /// it was appended.
    async fn push_unique(&self, item: &str) -> Result<bool, QueueError>;

    /// Remove and return the oldest item, waiting up to `timeout` for one.
    async fn pop(&self, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Number of items currently queued.
    async fn len(&self) -> Result<u64, QueueError>;
}

/// libSQL-backed [`WorkQueue`].
pub struct LibSqlWorkQueue {
    source: ConnectionSource,
    name: String,
    notify: Arc<Notify>,
}

impl LibSqlWorkQueue {
    pub fn new(source: ConnectionSource, name: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
            notify: Arc::new(Notify::new()),
        }
    }

    async fn try_pop(&self) -> Result<Option<String>, QueueError> {
        let conn = self.source.connect().await.map_err(|e| self.pop_err(e))?;
        let mut rows = conn
            .query(
                "DELETE FROM work_queue WHERE seq = \
                 (SELECT seq FROM work_queue WHERE queue = ?1 ORDER BY seq LIMIT 1) \
                 RETURNING item",
                params![self.name.clone()],
            )
            .await
            .map_err(|e| self.pop_err(e))?;

        match rows.next().await.map_err(|e| self.pop_err(e))? {
            Some(row) => {
                let item: String = row.get(0).map_err(|e| self.pop_err(e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    fn push_err(&self, e: impl std::fmt::Display) -> QueueError {
        QueueError::PushFailed {
            queue: self.name.clone(),
            reason: e.to_string(),
        }
    }

    fn pop_err(&self, e: impl std::fmt::Display) -> QueueError {
        QueueError::PopFailed {
            queue: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl WorkQueue for LibSqlWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, item: &str) -> Result<(), QueueError> {
        let conn = self.source.connect().await.map_err(|e| self.push_err(e))?;
        conn.execute(
            "INSERT INTO work_queue (queue, item, enqueued_at) VALUES (?1, ?2, ?3)",
            params![self.name.clone(), item, format_ts(&Utc::now())],
        )
        .await
        .map_err(|e| self.push_err(e))?;

        debug!(queue = %self.name, item, "Pushed to work queue");
        self.notify.notify_one();
        Ok(())
    }

    async fn push_unique(&self, item: &str) -> Result<bool, QueueError> {
        let conn = self.source.connect().await.map_err(|e| self.push_err(e))?;
        let inserted = conn
            .execute(
                "INSERT INTO work_queue (queue, item, enqueued_at) \
                 SELECT ?1, ?2, ?3 \
                 WHERE NOT EXISTS (SELECT 1 FROM work_queue WHERE queue = ?1 AND item = ?2)",
                params![self.name.clone(), item, format_ts(&Utc::now())],
            )
            .await
            .map_err(|e| self.push_err(e))?;

        if inserted == 0 {
            debug!(queue = %self.name, item, "Item already queued");
            return Ok(false);
        }
        self.notify.notify_one();
        Ok(true)
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(item) = self.try_pop().await? {
                return Ok(Some(item));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wait = POLL_BACKOFF.min(deadline - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let conn = self
            .source
            .connect()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM work_queue WHERE queue = ?1",
                params![self.name.clone()],
            )
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?
        {
            Some(row) => {
                let count: i64 = row.get(0).map_err(|e| QueueError::Backend(e.to_string()))?;
                Ok(count as u64)
            }
            None => Ok(0),
        }
    }
}
