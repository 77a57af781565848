//! Orchestrator: turns due schedules into queued work and times out stuck executions.
//!
//! Two independent loops share the task store:
//! - A **cron evaluator** that creates one PENDING execution per due task
//!   and pushes its id onto the work queue
//! - A **timeout monitor** that resolves executions past their deadline
//!
//! Each task or execution is its own unit of work. A failure on one is
//! logged and never aborts the rest of the cycle.

pub mod cron;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, IntakeError};
use crate::queue::WorkQueue;
use crate::store::{Database, InFlightExecution};
use crate::tasks::{Task, TaskExecution};

/// How often an idle loop checks its shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Error message recorded on executions resolved by the timeout monitor.
pub fn timeout_message(timeout_seconds: i64) -> String {
    format!("Execution exceeded timeout of {timeout_seconds} seconds")
}

/// Schedule evaluator and timeout monitor.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn Database>,
    queue: Arc<dyn WorkQueue>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Database>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
        }
    }

    // ── Cron evaluator ──────────────────────────────────────────────

    /// Fire every task due at `now`. Returns the number of executions created.
    ///
    /// Several missed firings between cycles collapse into one execution.
    pub async fn run_cron_cycle(&self, now: DateTime<Utc>) -> usize {
        let tasks = match self.store.list_due_tasks(now).await {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to load due tasks: {e}");
                return 0;
            }
        };

        if tasks.is_empty() {
            debug!("No tasks due");
            return 0;
        }

        let mut fired = 0;
        for task in tasks {
            match self.fire_task(&task, now).await {
                Ok(Some(execution_id)) => {
                    info!(task_id = %task.task_id, execution_id = %execution_id, "Created scheduled execution");
                    fired += 1;
                }
                Ok(None) => {
                    debug!(task_id = %task.task_id, "Schedule already advanced elsewhere; skipping");
                }
                Err(e) => {
                    error!(task_id = %task.task_id, "Error creating execution: {e}");
                }
            }
        }
        fired
    }

    /// Create one execution for `task` and advance its schedule.
    ///
    /// The execution and the schedule update commit together before the id
    /// is pushed, so the publisher never pops an uncommitted row. A failed
    /// push leaves the execution PENDING for reconciliation. Returns `None`
    /// when another evaluator already fired this occurrence.
    async fn fire_task(&self, task: &Task, now: DateTime<Utc>) -> Result<Option<Uuid>, Error> {
        let Some(observed_next_run) = task.next_run else {
            return Ok(None);
        };
        let expr = task.cron_schedule.as_deref().unwrap_or_default();
        let next_run = cron::next_run_after(expr, now).map_err(|reason| IntakeError::InvalidCron {
            expr: expr.to_string(),
            reason,
        })?;

        let execution = TaskExecution::pending(task.task_id, now);
        let recorded = self
            .store
            .record_cron_firing(task.task_id, observed_next_run, &execution, now, next_run)
            .await?;
        if !recorded {
            return Ok(None);
        }

        if let Some(next) = next_run {
            debug!(task_id = %task.task_id, next_run = %next, "Next run scheduled");
        }

        let execution_id = execution.execution_id;
        if let Err(e) = self.queue.push(&execution_id.to_string()).await {
            error!(
                execution_id = %execution_id,
                "Failed to queue execution; left PENDING for reconciliation: {e}"
            );
        }

        Ok(Some(execution_id))
    }

    // ── Timeout monitor ─────────────────────────────────────────────

    /// Time out every in-flight execution past its deadline at `now`.
    /// Returns the number of executions transitioned.
    pub async fn run_timeout_cycle(&self, now: DateTime<Utc>) -> usize {
        let in_flight = match self.store.list_in_flight_executions().await {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to load in-flight executions: {e}");
                return 0;
            }
        };

        let mut timed_out = 0;
        for item in in_flight {
            match self.check_timeout(&item, now).await {
                Ok(true) => timed_out += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(execution_id = %item.execution.execution_id, "Timeout check failed: {e}");
                }
            }
        }
        timed_out
    }

    async fn check_timeout(&self, item: &InFlightExecution, now: DateTime<Utc>) -> Result<bool, Error> {
        let execution = &item.execution;
        let Some(deadline) = execution.deadline(item.timeout_seconds) else {
            warn!(
                execution_id = %execution.execution_id,
                timeout_seconds = item.timeout_seconds,
                "Timeout out of range; execution has no reachable deadline"
            );
            return Ok(false);
        };
        if now <= deadline {
            return Ok(false);
        }

        let applied = self
            .store
            .time_out_execution(
                execution.execution_id,
                &timeout_message(item.timeout_seconds),
                now,
            )
            .await?;

        if applied {
            warn!(
                execution_id = %execution.execution_id,
                submitted_at = %execution.submitted_at,
                timeout_seconds = item.timeout_seconds,
                "Execution timed out"
            );
        } else {
            debug!(
                execution_id = %execution.execution_id,
                "Execution resolved before timeout could apply"
            );
        }
        Ok(applied)
    }

    // ── Loops ───────────────────────────────────────────────────────

    /// Spawn both loops. Set the returned flag to stop them.
    pub fn spawn(self: Arc<Self>) -> (Vec<JoinHandle<()>>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));

        let cron = {
            let orchestrator = Arc::clone(&self);
            let shutdown = Arc::clone(&shutdown);
            let interval = self.config.cron_check_interval;
            tokio::spawn(async move {
                info!("Cron evaluator started, checking every {}s", interval.as_secs());
                run_every(interval, &shutdown, || orchestrator.run_cron_cycle(Utc::now())).await;
                info!("Cron evaluator stopped");
            })
        };

        let timeout = {
            let orchestrator = Arc::clone(&self);
            let shutdown = Arc::clone(&shutdown);
            let interval = self.config.timeout_check_interval;
            tokio::spawn(async move {
                info!("Timeout monitor started, checking every {}s", interval.as_secs());
                run_every(interval, &shutdown, || orchestrator.run_timeout_cycle(Utc::now())).await;
                info!("Timeout monitor stopped");
            })
        };

        (vec![cron, timeout], shutdown)
    }
}

/// Tick `cycle` on a fixed interval until `shutdown` is set. The flag is
/// also watched between ticks, so long intervals still stop promptly.
async fn run_every<F, Fut>(interval: Duration, shutdown: &AtomicBool, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = usize>,
{
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = wait_for_shutdown(shutdown) => return,
        }

        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        cycle().await;
    }
}

async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }
}
