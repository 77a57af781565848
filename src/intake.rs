//! Intake: task and bot management used by any outer surface.
//!
//! New executions are always committed before their id is pushed, so a
//! failed push never loses work. Such rows stay PENDING until
//! [`Intake::reconcile_pending`] pushes them again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::IntakeError;
use crate::orchestrator::cron;
use crate::publisher::broadcast::validate_task_config;
use crate::queue::WorkQueue;
use crate::store::Database;
use crate::tasks::{Bot, MAX_TIMEOUT_SECONDS, NewBot, NewTask, Task, TaskExecution};

/// What [`Intake::create_task`] produced.
#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: Task,
    /// The run-now execution, if one was requested.
    pub execution: Option<TaskExecution>,
}

pub struct Intake {
    store: Arc<dyn Database>,
    queue: Arc<dyn WorkQueue>,
}

impl Intake {
    pub fn new(store: Arc<dyn Database>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Validate and store a new task. A run-now request also creates a
    /// PENDING execution in the same transaction and queues it.
    pub async fn create_task(
        &self,
        request: NewTask,
        now: DateTime<Utc>,
    ) -> Result<CreatedTask, IntakeError> {
        if request.name.trim().is_empty() {
            return Err(IntakeError::InvalidConfig("task name cannot be empty".into()));
        }
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&request.timeout_seconds) {
            return Err(IntakeError::InvalidConfig(format!(
                "timeout must be between 1 and {MAX_TIMEOUT_SECONDS} seconds, got {}",
                request.timeout_seconds
            )));
        }
        validate_task_config(&request.config).map_err(IntakeError::InvalidConfig)?;

        let cron_schedule = request
            .cron_schedule
            .map(|expr| expr.trim().to_string())
            .filter(|expr| !expr.is_empty());
        let next_run = match &cron_schedule {
            Some(expr) => schedule_after(expr, now)?,
            None => None,
        };

        let task = Task {
            task_id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            config: request.config,
            cron_schedule,
            timeout_seconds: request.timeout_seconds,
            is_active: true,
            is_hidden: false,
            next_run,
            last_run: None,
            created_by: request.created_by,
            created_at: now,
        };

        let execution = request
            .run_now
            .then(|| TaskExecution::pending(task.task_id, now));
        self.store.create_task(&task, execution.as_ref()).await?;
        info!(task_id = %task.task_id, name = %task.name, "Created task");

        if let Some(exec) = &execution {
            self.enqueue(exec.execution_id).await?;
        }

        Ok(CreatedTask { task, execution })
    }

    /// Create and queue a manual execution of an existing task.
    pub async fn trigger_execution(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TaskExecution, IntakeError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|t| !t.is_hidden)
            .ok_or(IntakeError::TaskNotFound(task_id))?;
        if !task.is_active {
            return Err(IntakeError::TaskInactive(task_id));
        }

        let execution = TaskExecution::pending(task_id, now);
        self.store.insert_execution(&execution).await?;
        self.enqueue(execution.execution_id).await?;
        Ok(execution)
    }

    /// Replace a task's cron schedule; `None` makes it manual-only.
    pub async fn update_schedule(
        &self,
        task_id: Uuid,
        cron_schedule: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, IntakeError> {
        let cron_schedule = cron_schedule.map(str::trim).filter(|e| !e.is_empty());
        let next_run = match cron_schedule {
            Some(expr) => schedule_after(expr, now)?,
            None => None,
        };

        if !self
            .store
            .update_task_schedule(task_id, cron_schedule, next_run)
            .await?
        {
            return Err(IntakeError::TaskNotFound(task_id));
        }
        info!(task_id = %task_id, next_run = ?next_run, "Updated task schedule");
        Ok(next_run)
    }

    /// Soft-delete a task along with its executions.
    pub async fn hide_task(&self, task_id: Uuid) -> Result<(), IntakeError> {
        if !self.store.hide_task(task_id).await? {
            return Err(IntakeError::TaskNotFound(task_id));
        }
        info!(task_id = %task_id, "Hid task");
        Ok(())
    }

    /// Register a worker bot.
    pub async fn register_bot(&self, request: NewBot, now: DateTime<Utc>) -> Result<Bot, IntakeError> {
        if request.username.trim().is_empty() {
            return Err(IntakeError::InvalidConfig("bot username cannot be empty".into()));
        }

        let bot = Bot {
            bot_id: Uuid::new_v4(),
            username: request.username,
            token: request.token,
            last_checkin: None,
            created_by: request.created_by,
            created_at: now,
            is_hidden: false,
        };
        self.store.insert_bot(&bot).await?;
        info!(bot_id = %bot.bot_id, username = %bot.username, "Registered bot");
        Ok(bot)
    }

    pub async fn hide_bot(&self, bot_id: Uuid) -> Result<(), IntakeError> {
        if !self.store.hide_bot(bot_id).await? {
            return Err(IntakeError::BotNotFound(bot_id));
        }
        info!(bot_id = %bot_id, "Hid bot");
        Ok(())
    }

    /// Push again every PENDING execution submitted more than `stale_after`
    /// before `now` and not already waiting in the queue. Returns how many
    /// were queued.
    pub async fn reconcile_pending(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, IntakeError> {
        let cutoff = now
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| IntakeError::InvalidConfig(e.to_string()))?;
        let stale = self.store.list_stale_pending(cutoff).await?;

        let mut queued = 0;
        for execution_id in stale {
            match self.queue.push_unique(&execution_id.to_string()).await {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => error!(execution_id = %execution_id, "Re-queue failed: {e}"),
            }
        }

        if queued > 0 {
            warn!(count = queued, "Re-queued stale PENDING executions");
        }
        Ok(queued)
    }

    async fn enqueue(&self, execution_id: Uuid) -> Result<(), IntakeError> {
        self.queue
            .push(&execution_id.to_string())
            .await
            .map_err(|e| {
                error!(execution_id = %execution_id, "Failed to queue execution: {e}");
                IntakeError::QueueFailed {
                    execution_id,
                    reason: e.to_string(),
                }
            })?;
        info!(execution_id = %execution_id, "Queued execution");
        Ok(())
    }
}

fn schedule_after(expr: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, IntakeError> {
    cron::next_run_after(expr, now).map_err(|reason| IntakeError::InvalidCron {
        expr: expr.to_string(),
        reason,
    })
}
