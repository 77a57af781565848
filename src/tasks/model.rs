//! Task data model: tasks and their executions plus worker bots.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::ExecutionStatus;

/// Default execution deadline when a task does not set one.
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 3600;

/// Longest execution deadline intake accepts (one week).
pub const MAX_TIMEOUT_SECONDS: i64 = 7 * 24 * 3600;

/// A unit of recurring or on-demand work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque configuration handed to workers.
    pub config: serde_json::Value,
    /// Cron expression; `None` means manual runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,
    pub timeout_seconds: i64,
    pub is_active: bool,
    pub is_hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Owning user reference.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// One attempt to run a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    /// First claimant; immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Uuid>,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    /// When the broadcast went out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set iff the status is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Reserved; nothing increments it yet.
    pub retry_count: u32,
    pub is_hidden: bool,
}

impl TaskExecution {
    /// A fresh PENDING execution for `task_id`, submitted at `now`.
    pub fn pending(task_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            task_id,
            assigned_to: None,
            status: ExecutionStatus::Pending,
            submitted_at: now,
            queued_at: None,
            claimed_at: None,
            completed_at: None,
            results: None,
            error_message: None,
            retry_count: 0,
            is_hidden: false,
        }
    }

    /// Deadline after which the timeout monitor resolves this execution.
    /// `None` when the timeout does not fit in a timestamp.
    pub fn deadline(&self, timeout_seconds: i64) -> Option<DateTime<Utc>> {
        chrono::TimeDelta::try_seconds(timeout_seconds)
            .and_then(|timeout| self.submitted_at.checked_add_signed(timeout))
    }
}

/// A registered remote worker.
#[derive(Debug, Clone)]
pub struct Bot {
    pub bot_id: Uuid,
    /// Transport-level handle (Telegram username).
    pub username: String,
    pub token: SecretString,
    pub last_checkin: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub is_hidden: bool,
}

/// Intake request for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub config: serde_json::Value,
    #[serde(default)]
    pub cron_schedule: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    pub created_by: String,
    /// Create and queue an execution immediately.
    #[serde(default)]
    pub run_now: bool,
}

fn default_timeout() -> i64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl NewTask {
    pub fn new(
        name: impl Into<String>,
        config: serde_json::Value,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            config,
            cron_schedule: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            created_by: created_by.into(),
            run_now: false,
        }
    }

    /// Builder: set a cron schedule.
    pub fn with_cron(mut self, expr: impl Into<String>) -> Self {
        self.cron_schedule = Some(expr.into());
        self
    }

    /// Builder: set the execution timeout.
    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Builder: queue an execution on creation.
    pub fn run_now(mut self) -> Self {
        self.run_now = true;
        self
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Intake request for a new worker bot.
#[derive(Debug, Clone)]
pub struct NewBot {
    pub username: String,
    pub token: SecretString,
    pub created_by: String,
}
