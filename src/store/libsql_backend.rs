//! libSQL backend: async `Database` trait implementation.
//!
//! Every unit of work asks the [`ConnectionSource`] for its own connection.
//! Multi-statement units run inside an IMMEDIATE transaction that commits on
//! success and rolls back when dropped. Status transitions are single
//! conditional `UPDATE`s whose affected-row count says whether they applied.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, InFlightExecution};
use crate::tasks::{Bot, ExecutionStatus, Task, TaskExecution};

/// SQL list of the given statuses, e.g. `'pending', 'broadcasted'`.
fn status_list(statuses: &[ExecutionStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Hands out connections for units of work.
///
/// File databases get a fresh connection per call. In-memory databases only
/// exist on the connection that created them, so that one is shared.
#[derive(Clone)]
pub struct ConnectionSource {
    db: Arc<LibSqlDatabase>,
    shared: Option<Connection>,
}

impl ConnectionSource {
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        if let Some(conn) = &self.shared {
            return Ok(conn.clone());
        }
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {e}")))?;
        Ok(conn)
    }
}

/// libSQL database backend.
pub struct LibSqlBackend {
    source: ConnectionSource,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self {
            source: ConnectionSource {
                db: Arc::new(db),
                shared: None,
            },
        };

        let conn = backend.source.connect().await?;
        conn.query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;

        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            source: ConnectionSource {
                db: Arc::new(db),
                shared: Some(conn),
            },
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Connection source for collaborators sharing this database file.
    pub fn connection_source(&self) -> ConnectionSource {
        self.source.clone()
    }

    async fn conn(&self) -> Result<Connection, DatabaseError> {
        self.source.connect().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexical order in SQL equals time order.
pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(format_ts(&dt)),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn get_text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn get_i64(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn get_uuid(row: &libsql::Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let s = get_text(row, idx)?;
    Uuid::parse_str(&s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn get_opt_uuid(row: &libsql::Row, idx: i32) -> Option<Uuid> {
    get_opt_text(row, idx).and_then(|s| Uuid::parse_str(&s).ok())
}

fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    get_opt_text(row, idx).map(|s| parse_datetime(&s))
}

fn get_opt_json(row: &libsql::Row, idx: i32) -> Option<serde_json::Value> {
    get_opt_text(row, idx).and_then(|s| serde_json::from_str(&s).ok())
}

const TASK_COLUMNS: &str = "task_id, name, description, config, cron_schedule, timeout_seconds, is_active, is_hidden, next_run, last_run, created_by, created_at";
const TASK_COLUMNS_T: &str = "t.task_id, t.name, t.description, t.config, t.cron_schedule, t.timeout_seconds, t.is_active, t.is_hidden, t.next_run, t.last_run, t.created_by, t.created_at";

const EXEC_COLUMNS: &str = "execution_id, task_id, assigned_to, status, submitted_at, queued_at, claimed_at, completed_at, results, error_message, retry_count, is_hidden";
const EXEC_COLUMNS_E: &str = "e.execution_id, e.task_id, e.assigned_to, e.status, e.submitted_at, e.queued_at, e.claimed_at, e.completed_at, e.results, e.error_message, e.retry_count, e.is_hidden";
const EXEC_COLUMN_COUNT: i32 = 12;

const BOT_COLUMNS: &str = "bot_id, username, token, last_checkin, created_by, created_at, is_hidden";

/// Map a row to a Task; columns start at `base` in TASK_COLUMNS order.
fn row_to_task(row: &libsql::Row, base: i32) -> Result<Task, DatabaseError> {
    let config_str = get_text(row, base + 3)?;
    let config = serde_json::from_str(&config_str)
        .map_err(|e| DatabaseError::Serialization(format!("task config: {e}")))?;

    Ok(Task {
        task_id: get_uuid(row, base)?,
        name: get_text(row, base + 1)?,
        description: get_opt_text(row, base + 2),
        config,
        cron_schedule: get_opt_text(row, base + 4),
        timeout_seconds: get_i64(row, base + 5)?,
        is_active: get_i64(row, base + 6)? != 0,
        is_hidden: get_i64(row, base + 7)? != 0,
        next_run: get_opt_ts(row, base + 8),
        last_run: get_opt_ts(row, base + 9),
        created_by: get_text(row, base + 10)?,
        created_at: parse_datetime(&get_text(row, base + 11)?),
    })
}

/// Map a row to a TaskExecution; columns in EXEC_COLUMNS order from 0.
fn row_to_execution(row: &libsql::Row) -> Result<TaskExecution, DatabaseError> {
    let status_str = get_text(row, 3)?;
    let status: ExecutionStatus = status_str
        .parse()
        .map_err(DatabaseError::Serialization)?;

    Ok(TaskExecution {
        execution_id: get_uuid(row, 0)?,
        task_id: get_uuid(row, 1)?,
        assigned_to: get_opt_uuid(row, 2),
        status,
        submitted_at: parse_datetime(&get_text(row, 4)?),
        queued_at: get_opt_ts(row, 5),
        claimed_at: get_opt_ts(row, 6),
        completed_at: get_opt_ts(row, 7),
        results: get_opt_json(row, 8),
        error_message: get_opt_text(row, 9),
        retry_count: get_i64(row, 10)? as u32,
        is_hidden: get_i64(row, 11)? != 0,
    })
}

fn row_to_bot(row: &libsql::Row) -> Result<Bot, DatabaseError> {
    Ok(Bot {
        bot_id: get_uuid(row, 0)?,
        username: get_text(row, 1)?,
        token: SecretString::from(get_text(row, 2)?),
        last_checkin: get_opt_ts(row, 3),
        created_by: get_text(row, 4)?,
        created_at: parse_datetime(&get_text(row, 5)?),
        is_hidden: get_i64(row, 6)? != 0,
    })
}

async fn insert_task_on(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            task.task_id.to_string(),
            task.name.clone(),
            opt_text(task.description.as_deref()),
            to_json(&task.config)?,
            opt_text(task.cron_schedule.as_deref()),
            task.timeout_seconds,
            task.is_active as i64,
            task.is_hidden as i64,
            opt_ts(task.next_run),
            opt_ts(task.last_run),
            task.created_by.clone(),
            format_ts(&task.created_at),
        ],
    )
    .await
    .map_err(query_err("insert_task"))?;
    Ok(())
}

async fn insert_execution_on(
    conn: &Connection,
    exec: &TaskExecution,
) -> Result<(), DatabaseError> {
    let results = match &exec.results {
        Some(v) => libsql::Value::Text(to_json(v)?),
        None => libsql::Value::Null,
    };

    conn.execute(
        &format!(
            "INSERT INTO task_executions ({EXEC_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            exec.execution_id.to_string(),
            exec.task_id.to_string(),
            opt_uuid(exec.assigned_to),
            exec.status.as_str(),
            format_ts(&exec.submitted_at),
            opt_ts(exec.queued_at),
            opt_ts(exec.claimed_at),
            opt_ts(exec.completed_at),
            results,
            opt_text(exec.error_message.as_deref()),
            exec.retry_count as i64,
            exec.is_hidden as i64,
        ],
    )
    .await
    .map_err(query_err("insert_execution"))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        migrations::run_migrations(&conn).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        task: &Task,
        initial: Option<&TaskExecution>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("create_task: begin"))?;

        insert_task_on(&tx, task).await?;
        if let Some(exec) = initial {
            insert_execution_on(&tx, exec).await?;
        }

        tx.commit().await.map_err(query_err("create_task: commit"))?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(query_err("get_task"))?;

        match rows.next().await.map_err(query_err("get_task"))? {
            Some(row) => Ok(Some(row_to_task(&row, 0)?)),
            None => Ok(None),
        }
    }

    async fn list_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE is_active = 1 AND is_hidden = 0 AND cron_schedule IS NOT NULL \
                     AND next_run IS NOT NULL AND next_run <= ?1 \
                     ORDER BY next_run"
                ),
                params![format_ts(&now)],
            )
            .await
            .map_err(query_err("list_due_tasks"))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_due_tasks"))? {
            match row_to_task(&row, 0) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping due task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn record_cron_firing(
        &self,
        task_id: Uuid,
        observed_next_run: DateTime<Utc>,
        execution: &TaskExecution,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("record_cron_firing: begin"))?;

        let updated = tx
            .execute(
                "UPDATE tasks SET last_run = ?1, next_run = ?2 \
                 WHERE task_id = ?3 AND next_run = ?4",
                params![
                    format_ts(&last_run),
                    opt_ts(next_run),
                    task_id.to_string(),
                    format_ts(&observed_next_run)
                ],
            )
            .await
            .map_err(query_err("record_cron_firing"))?;

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(query_err("record_cron_firing: rollback"))?;
            return Ok(false);
        }

        insert_execution_on(&tx, execution).await?;

        tx.commit()
            .await
            .map_err(query_err("record_cron_firing: commit"))?;
        Ok(true)
    }

    async fn update_task_schedule(
        &self,
        task_id: Uuid,
        cron_schedule: Option<&str>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE tasks SET cron_schedule = ?1, next_run = ?2 WHERE task_id = ?3",
                params![opt_text(cron_schedule), opt_ts(next_run), task_id.to_string()],
            )
            .await
            .map_err(query_err("update_task_schedule"))?;
        Ok(count > 0)
    }

    async fn hide_task(&self, task_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("hide_task: begin"))?;

        let count = tx
            .execute(
                "UPDATE tasks SET is_hidden = 1 WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(query_err("hide_task"))?;
        if count == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE task_executions SET is_hidden = 1 WHERE task_id = ?1",
            params![task_id.to_string()],
        )
        .await
        .map_err(query_err("hide_task: executions"))?;

        tx.commit().await.map_err(query_err("hide_task: commit"))?;
        Ok(true)
    }

    // ── Executions ──────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &TaskExecution) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        insert_execution_on(&conn, execution).await
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<TaskExecution>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {EXEC_COLUMNS} FROM task_executions WHERE execution_id = ?1"),
                params![execution_id.to_string()],
            )
            .await
            .map_err(query_err("get_execution"))?;

        match rows.next().await.map_err(query_err("get_execution"))? {
            Some(row) => Ok(Some(row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_execution_with_task(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<(TaskExecution, Task)>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EXEC_COLUMNS_E}, {TASK_COLUMNS_T} FROM task_executions e \
                     JOIN tasks t ON e.task_id = t.task_id \
                     WHERE e.execution_id = ?1"
                ),
                params![execution_id.to_string()],
            )
            .await
            .map_err(query_err("get_execution_with_task"))?;

        match rows
            .next()
            .await
            .map_err(query_err("get_execution_with_task"))?
        {
            Some(row) => {
                let exec = row_to_execution(&row)?;
                let task = row_to_task(&row, EXEC_COLUMN_COUNT)?;
                Ok(Some((exec, task)))
            }
            None => Ok(None),
        }
    }

    async fn list_executions_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TaskExecution>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EXEC_COLUMNS} FROM task_executions WHERE task_id = ?1 ORDER BY submitted_at"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(query_err("list_executions_for_task"))?;

        let mut executions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_err("list_executions_for_task"))?
        {
            executions.push(row_to_execution(&row)?);
        }
        Ok(executions)
    }

    async fn mark_broadcasted(
        &self,
        execution_id: Uuid,
        queued_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE task_executions SET status = 'broadcasted', queued_at = ?1 \
                 WHERE execution_id = ?2 AND status = 'pending'",
                params![format_ts(&queued_at), execution_id.to_string()],
            )
            .await
            .map_err(query_err("mark_broadcasted"))?;
        Ok(count > 0)
    }

    async fn fail_pending(
        &self,
        execution_id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE task_executions SET status = 'failed', error_message = ?1, completed_at = ?2 \
                 WHERE execution_id = ?3 AND status = 'pending'",
                params![error_message, format_ts(&now), execution_id.to_string()],
            )
            .await
            .map_err(query_err("fail_pending"))?;
        Ok(count > 0)
    }

    async fn claim_execution(
        &self,
        execution_id: Uuid,
        bot_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE task_executions SET status = 'in_progress', assigned_to = ?1, claimed_at = ?2 \
                 WHERE execution_id = ?3 AND status = 'broadcasted' \
                 AND (assigned_to IS NULL OR assigned_to = ?1)",
                params![
                    bot_id.to_string(),
                    format_ts(&claimed_at),
                    execution_id.to_string()
                ],
            )
            .await
            .map_err(query_err("claim_execution"))?;
        Ok(count > 0)
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        bot_id: Uuid,
        results: &serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE task_executions SET status = 'completed', results = ?1, completed_at = ?2 \
                 WHERE execution_id = ?3 AND status = 'in_progress' AND assigned_to = ?4",
                params![
                    to_json(results)?,
                    format_ts(&completed_at),
                    execution_id.to_string(),
                    bot_id.to_string()
                ],
            )
            .await
            .map_err(query_err("complete_execution"))?;
        Ok(count > 0)
    }

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        bot_id: Uuid,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE task_executions SET status = 'failed', error_message = ?1, completed_at = ?2 \
                 WHERE execution_id = ?3 AND status = 'in_progress' AND assigned_to = ?4",
                params![
                    error_message,
                    format_ts(&completed_at),
                    execution_id.to_string(),
                    bot_id.to_string()
                ],
            )
            .await
            .map_err(query_err("fail_execution"))?;
        Ok(count > 0)
    }

    async fn list_in_flight_executions(&self) -> Result<Vec<InFlightExecution>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EXEC_COLUMNS_E}, t.timeout_seconds FROM task_executions e \
                     JOIN tasks t ON e.task_id = t.task_id \
                     WHERE e.is_hidden = 0 AND e.status IN ({}) \
                     ORDER BY e.submitted_at",
                    status_list(&ExecutionStatus::IN_FLIGHT)
                ),
                (),
            )
            .await
            .map_err(query_err("list_in_flight_executions"))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_err("list_in_flight_executions"))?
        {
            match (row_to_execution(&row), get_i64(&row, EXEC_COLUMN_COUNT)) {
                (Ok(execution), Ok(timeout_seconds)) => out.push(InFlightExecution {
                    execution,
                    timeout_seconds,
                }),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Skipping in-flight execution row: {e}")
                }
            }
        }
        Ok(out)
    }

    async fn time_out_execution(
        &self,
        execution_id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                &format!(
                    "UPDATE task_executions SET status = '{}', completed_at = ?1, error_message = ?2 \
                     WHERE execution_id = ?3 AND status IN ({})",
                    ExecutionStatus::TimedOut.as_str(),
                    status_list(&ExecutionStatus::IN_FLIGHT)
                ),
                params![format_ts(&now), error_message, execution_id.to_string()],
            )
            .await
            .map_err(query_err("time_out_execution"))?;
        Ok(count > 0)
    }

    async fn list_stale_pending(
        &self,
        submitted_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT execution_id FROM task_executions \
                 WHERE status = 'pending' AND is_hidden = 0 AND submitted_at < ?1 \
                 ORDER BY submitted_at",
                params![format_ts(&submitted_before)],
            )
            .await
            .map_err(query_err("list_stale_pending"))?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_stale_pending"))? {
            ids.push(get_uuid(&row, 0)?);
        }
        Ok(ids)
    }

    // ── Bots ────────────────────────────────────────────────────────

    async fn insert_bot(&self, bot: &Bot) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            &format!("INSERT INTO bots ({BOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                bot.bot_id.to_string(),
                bot.username.clone(),
                bot.token.expose_secret().to_string(),
                opt_ts(bot.last_checkin),
                bot.created_by.clone(),
                format_ts(&bot.created_at),
                bot.is_hidden as i64,
            ],
        )
        .await
        .map_err(query_err("insert_bot"))?;
        Ok(())
    }

    async fn get_active_bot(&self, bot_id: Uuid) -> Result<Option<Bot>, DatabaseError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {BOT_COLUMNS} FROM bots WHERE bot_id = ?1 AND is_hidden = 0"),
                params![bot_id.to_string()],
            )
            .await
            .map_err(query_err("get_active_bot"))?;

        match rows.next().await.map_err(query_err("get_active_bot"))? {
            Some(row) => Ok(Some(row_to_bot(&row)?)),
            None => Ok(None),
        }
    }

    async fn touch_bot_checkin(
        &self,
        bot_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE bots SET last_checkin = ?1 WHERE bot_id = ?2",
                params![format_ts(&now), bot_id.to_string()],
            )
            .await
            .map_err(query_err("touch_bot_checkin"))?;
        Ok(count > 0)
    }

    async fn hide_bot(&self, bot_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "UPDATE bots SET is_hidden = 1 WHERE bot_id = ?1",
                params![bot_id.to_string()],
            )
            .await
            .map_err(query_err("hide_bot"))?;
        Ok(count > 0)
    }
}
