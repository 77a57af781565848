//! `Database` trait: the task store every service reads and writes.
//!
//! Status-changing writes are conditional: each returns `Ok(true)` when the
//! guarded update applied and `Ok(false)` when the row was not in the
//! expected state. Losing a race is not an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::{Bot, Task, TaskExecution};

/// An in-flight execution together with its task's deadline budget.
#[derive(Debug, Clone)]
pub struct InFlightExecution {
    pub execution: TaskExecution,
    pub timeout_seconds: i64,
}

/// Backend-agnostic store for tasks, executions, and bots.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task and, optionally, its first execution in one transaction.
    async fn create_task(
        &self,
        task: &Task,
        initial: Option<&TaskExecution>,
    ) -> Result<(), DatabaseError>;

    /// Get a task by ID (hidden tasks included).
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Active, visible, scheduled tasks whose `next_run <= now`.
    async fn list_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Atomically record one cron firing: advance the task's `last_run` /
    /// `next_run` and insert the new PENDING execution. The schedule only
    /// advances if `next_run` still equals `observed_next_run`; otherwise
    /// nothing is written and `Ok(false)` is returned.
    async fn record_cron_firing(
        &self,
        task_id: Uuid,
        observed_next_run: DateTime<Utc>,
        execution: &TaskExecution,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    /// Replace a task's schedule. Returns false if the task does not exist.
    async fn update_task_schedule(
        &self,
        task_id: Uuid,
        cron_schedule: Option<&str>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    /// Soft-delete a task and hide all of its executions.
    async fn hide_task(&self, task_id: Uuid) -> Result<bool, DatabaseError>;

    // ── Executions ──────────────────────────────────────────────────

    /// Insert a new execution.
    async fn insert_execution(&self, execution: &TaskExecution) -> Result<(), DatabaseError>;

    /// Get an execution by ID.
    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<TaskExecution>, DatabaseError>;

    /// Get an execution joined with its task.
    async fn get_execution_with_task(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<(TaskExecution, Task)>, DatabaseError>;

    /// List a task's executions, oldest first.
    async fn list_executions_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TaskExecution>, DatabaseError>;

    /// PENDING → BROADCASTED, stamping `queued_at`.
    async fn mark_broadcasted(
        &self,
        execution_id: Uuid,
        queued_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// PENDING → FAILED (unusable task config).
    async fn fail_pending(
        &self,
        execution_id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// BROADCASTED → IN_PROGRESS if unassigned or already assigned to `bot_id`.
    async fn claim_execution(
        &self,
        execution_id: Uuid,
        bot_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// IN_PROGRESS → COMPLETED if assigned to `bot_id`.
    async fn complete_execution(
        &self,
        execution_id: Uuid,
        bot_id: Uuid,
        results: &serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// IN_PROGRESS → FAILED if assigned to `bot_id`.
    async fn fail_execution(
        &self,
        execution_id: Uuid,
        bot_id: Uuid,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Visible executions in PENDING, BROADCASTED or IN_PROGRESS.
    async fn list_in_flight_executions(&self) -> Result<Vec<InFlightExecution>, DatabaseError>;

    /// Any in-flight state → TIMEDOUT.
    async fn time_out_execution(
        &self,
        execution_id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Visible PENDING executions submitted before `submitted_before`.
    async fn list_stale_pending(
        &self,
        submitted_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Bots ────────────────────────────────────────────────────────

    /// Register a bot.
    async fn insert_bot(&self, bot: &Bot) -> Result<(), DatabaseError>;

    /// Get a bot that is not hidden.
    async fn get_active_bot(&self, bot_id: Uuid) -> Result<Option<Bot>, DatabaseError>;

    /// Stamp a bot's `last_checkin`.
    async fn touch_bot_checkin(
        &self,
        bot_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Soft-delete a bot.
    async fn hide_bot(&self, bot_id: Uuid) -> Result<bool, DatabaseError>;
}
