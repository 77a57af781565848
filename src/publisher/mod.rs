//! Publisher: bridges the work queue to the chat transport.
//!
//! Pops execution ids, renders a broadcast for each PENDING execution, sends
//! it to the monitored channel and flips the row to BROADCASTED. Anything not
//! PENDING is skipped, so a re-delivered id never produces a second broadcast.

pub mod broadcast;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::Transport;
use crate::config::PublisherConfig;
use crate::queue::WorkQueue;
use crate::store::Database;
use crate::tasks::ExecutionStatus;

use self::broadcast::{BroadcastPayload, format_broadcast, validate_task_config};

/// Error message recorded when a task's configuration cannot be broadcast.
pub const INVALID_CONFIG_MESSAGE: &str = "Invalid task configuration";

/// What happened to one popped item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent and moved to BROADCASTED.
    Broadcasted,
    /// Sent, but the row left PENDING before it could be marked.
    BroadcastRaced,
    /// The item is not an execution id.
    Malformed,
    /// No execution with that id.
    NotFound,
    /// Execution was not PENDING.
    Skipped(ExecutionStatus),
    /// Config unusable; execution moved to FAILED.
    InvalidConfig,
    /// Transport or store failure; execution left PENDING.
    Failed,
}

/// Queue-to-transport bridge.
pub struct Publisher {
    config: PublisherConfig,
    channel_id: String,
    store: Arc<dyn Database>,
    queue: Arc<dyn WorkQueue>,
    transport: Arc<dyn Transport>,
}

impl Publisher {
    pub fn new(
        config: PublisherConfig,
        channel_id: impl Into<String>,
        store: Arc<dyn Database>,
        queue: Arc<dyn WorkQueue>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            channel_id: channel_id.into(),
            store,
            queue,
            transport,
        }
    }

    /// Handle one popped queue item.
    pub async fn process_execution(&self, item: &str) -> PublishOutcome {
        let Ok(execution_id) = Uuid::parse_str(item.trim()) else {
            warn!(item, "Dropping queue item that is not an execution id");
            return PublishOutcome::Malformed;
        };

        let (execution, task) = match self.store.get_execution_with_task(execution_id).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                error!(execution_id = %execution_id, "Execution not found in database");
                return PublishOutcome::NotFound;
            }
            Err(e) => {
                error!(execution_id = %execution_id, "Failed to load execution: {e}");
                return PublishOutcome::Failed;
            }
        };

        if execution.status != ExecutionStatus::Pending {
            warn!(
                execution_id = %execution_id,
                status = %execution.status,
                "Execution is not PENDING; skipping broadcast"
            );
            return PublishOutcome::Skipped(execution.status);
        }

        if let Err(reason) = validate_task_config(&task.config) {
            error!(task_id = %task.task_id, execution_id = %execution_id, "Invalid task config: {reason}");
            return match self
                .store
                .fail_pending(execution_id, INVALID_CONFIG_MESSAGE, Utc::now())
                .await
            {
                Ok(true) => PublishOutcome::InvalidConfig,
                Ok(false) => {
                    warn!(execution_id = %execution_id, "Execution left PENDING before it could be failed");
                    PublishOutcome::InvalidConfig
                }
                Err(e) => {
                    error!(execution_id = %execution_id, "Failed to mark execution FAILED: {e}");
                    PublishOutcome::Failed
                }
            };
        }

        let payload = BroadcastPayload::new(&execution, &task, Utc::now());
        let text = match format_broadcast(&payload) {
            Ok(t) => t,
            Err(e) => {
                error!(execution_id = %execution_id, "Failed to render broadcast: {e}");
                return PublishOutcome::Failed;
            }
        };

        info!(execution_id = %execution_id, channel = %self.channel_id, "Broadcasting execution");
        if let Err(e) = self.transport.send(&self.channel_id, &text).await {
            error!(execution_id = %execution_id, "Broadcast send failed; execution left PENDING: {e}");
            return PublishOutcome::Failed;
        }

        match self.store.mark_broadcasted(execution_id, Utc::now()).await {
            Ok(true) => {
                info!(execution_id = %execution_id, "Successfully broadcast execution");
                PublishOutcome::Broadcasted
            }
            Ok(false) => {
                warn!(execution_id = %execution_id, "Execution left PENDING during broadcast");
                PublishOutcome::BroadcastRaced
            }
            Err(e) => {
                error!(execution_id = %execution_id, "Failed to mark execution BROADCASTED: {e}");
                PublishOutcome::Failed
            }
        }
    }

    /// Pop one item and handle it. Returns `None` when the queue stayed empty.
    pub async fn poll_once(&self) -> Option<PublishOutcome> {
        match self.queue.pop(self.config.poll_timeout).await {
            Ok(Some(item)) => Some(self.process_execution(&item).await),
            Ok(None) => {
                debug!(queue = self.queue.name(), "Queue idle");
                None
            }
            Err(e) => {
                error!("Queue pop failed: {e}");
                tokio::time::sleep(self.config.poll_timeout).await;
                None
            }
        }
    }

    /// Spawn the publish loop. Set the returned flag to stop it.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(
                queue = self.queue.name(),
                channel = %self.channel_id,
                "Publisher started"
            );

            while !shutdown.load(Ordering::Relaxed) {
                self.poll_once().await;
            }

            info!("Publisher stopped");
        });

        (handle, shutdown_flag)
    }
}
