//! Bot protocol handler: applies worker commands read from the monitored channel.
//!
//! Every inbound message is handled on its own: parse, check the bot, then
//! apply one conditional update. Rejections and malformed input are logged
//! and dropped; nothing here ever stops the listening loop. A bot's
//! `last_checkin` moves only when its command is applied.

pub mod wire;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::Transport;
use crate::error::{DatabaseError, ProtocolError};
use crate::store::Database;
use crate::tasks::{Bot, ExecutionStatus, TaskExecution};

pub use wire::WireCommand;

/// How often the listener checks its shutdown flag while the channel is quiet.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Transition or check-in applied.
    Applied,
    /// Same command already applied; nothing changed.
    Duplicate,
    /// Guard failed; nothing changed.
    Rejected,
    /// Not addressed to workers (broadcasts, chatter).
    NotACommand,
    /// Command with an unusable body.
    Malformed,
    UnknownBot,
    UnknownExecution,
    /// Store failure.
    Failed,
}

/// Applies [`WireCommand`]s to the task store.
pub struct ProtocolHandler {
    store: Arc<dyn Database>,
}

impl ProtocolHandler {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Handle one inbound message received at `now`.
    pub async fn handle_text(&self, text: &str, now: DateTime<Utc>) -> CommandOutcome {
        let command = match WireCommand::parse(text) {
            Ok(c) => c,
            Err(ProtocolError::UnknownCommand(_)) => return CommandOutcome::NotACommand,
            Err(e) => {
                error!("Dropping worker message: {e}");
                return CommandOutcome::Malformed;
            }
        };

        match self.dispatch(command, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Error handling worker command: {e}");
                CommandOutcome::Failed
            }
        }
    }

    async fn dispatch(
        &self,
        command: WireCommand,
        now: DateTime<Utc>,
    ) -> Result<CommandOutcome, DatabaseError> {
        let bot_id = command.bot_id();
        let Some(bot) = self.store.get_active_bot(bot_id).await? else {
            warn!(bot_id = %bot_id, command = command.name(), "Command from unknown or hidden bot");
            return Ok(CommandOutcome::UnknownBot);
        };

        let outcome = match command {
            WireCommand::Claim {
                execution_id,
                claimed_at,
                ..
            } => {
                self.claim(&bot, execution_id, claimed_at.unwrap_or(now))
                    .await?
            }
            WireCommand::Status {
                execution_id,
                message,
                ..
            } => {
                if self.load_execution(&bot, execution_id, "status").await?.is_none() {
                    return Ok(CommandOutcome::UnknownExecution);
                }
                info!(
                    bot = %bot.username,
                    execution_id = %execution_id,
                    "Status: {message}"
                );
                CommandOutcome::Applied
            }
            WireCommand::Complete {
                execution_id,
                results,
                completed_at,
                ..
            } => {
                self.resolve(
                    &bot,
                    execution_id,
                    Resolution::Completed(results),
                    completed_at.unwrap_or(now),
                )
                .await?
            }
            WireCommand::Failed {
                execution_id,
                error_message,
                completed_at,
                ..
            } => {
                self.resolve(
                    &bot,
                    execution_id,
                    Resolution::Failed(error_message),
                    completed_at.unwrap_or(now),
                )
                .await?
            }
            WireCommand::Checkin { .. } => {
                debug!(bot = %bot.username, "Bot checked in");
                CommandOutcome::Applied
            }
        };

        // Only accepted commands count as a sign of life.
        if outcome == CommandOutcome::Applied {
            self.store.touch_bot_checkin(bot_id, now).await?;
        }
        Ok(outcome)
    }

    async fn load_execution(
        &self,
        bot: &Bot,
        execution_id: Uuid,
        command: &str,
    ) -> Result<Option<TaskExecution>, DatabaseError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.is_none() {
            warn!(
                bot_id = %bot.bot_id,
                execution_id = %execution_id,
                command,
                "Command for non-existent execution"
            );
        }
        Ok(execution)
    }

    async fn claim(
        &self,
        bot: &Bot,
        execution_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Result<CommandOutcome, DatabaseError> {
        let Some(execution) = self.load_execution(bot, execution_id, "claim").await? else {
            return Ok(CommandOutcome::UnknownExecution);
        };

        if let Some(outcome) = classify(bot, &execution, ExecutionStatus::InProgress, "claim") {
            return Ok(outcome);
        }

        if self
            .store
            .claim_execution(execution_id, bot.bot_id, claimed_at)
            .await?
        {
            info!(bot = %bot.username, execution_id = %execution_id, "Bot claimed execution");
            return Ok(CommandOutcome::Applied);
        }

        self.lost_update(bot, execution_id, ExecutionStatus::InProgress, "claim")
            .await
    }

    async fn resolve(
        &self,
        bot: &Bot,
        execution_id: Uuid,
        resolution: Resolution,
        completed_at: DateTime<Utc>,
    ) -> Result<CommandOutcome, DatabaseError> {
        let command = resolution.command();
        let target = resolution.target();
        let Some(execution) = self.load_execution(bot, execution_id, command).await? else {
            return Ok(CommandOutcome::UnknownExecution);
        };

        if execution.assigned_to != Some(bot.bot_id) {
            warn!(
                bot_id = %bot.bot_id,
                execution_id = %execution_id,
                assigned_to = ?execution.assigned_to,
                "Result from bot that does not own the execution"
            );
            return Ok(CommandOutcome::Rejected);
        }

        if let Some(outcome) = classify(bot, &execution, target, command) {
            return Ok(outcome);
        }

        let applied = match &resolution {
            Resolution::Completed(results) => {
                self.store
                    .complete_execution(execution_id, bot.bot_id, results, completed_at)
                    .await?
            }
            Resolution::Failed(message) => {
                self.store
                    .fail_execution(execution_id, bot.bot_id, message, completed_at)
                    .await?
            }
        };

        if !applied {
            return self.lost_update(bot, execution_id, target, command).await;
        }

        match &resolution {
            Resolution::Completed(_) => {
                info!(bot = %bot.username, execution_id = %execution_id, "Bot completed execution");
            }
            Resolution::Failed(message) => {
                warn!(bot = %bot.username, execution_id = %execution_id, "Bot failed execution: {message}");
            }
        }
        Ok(CommandOutcome::Applied)
    }

    /// A guarded update matched no row: re-read to see what won.
    async fn lost_update(
        &self,
        bot: &Bot,
        execution_id: Uuid,
        target: ExecutionStatus,
        command: &str,
    ) -> Result<CommandOutcome, DatabaseError> {
        let Some(current) = self.store.get_execution(execution_id).await? else {
            return Ok(CommandOutcome::UnknownExecution);
        };
        Ok(classify(bot, &current, target, command).unwrap_or_else(|| {
            warn!(
                bot_id = %bot.bot_id,
                execution_id = %execution_id,
                status = %current.status,
                command,
                "Command rejected by store guard"
            );
            CommandOutcome::Rejected
        }))
    }

    /// Subscribe to `channel` and spawn the dispatch loop. Set the returned
    /// flag to stop it.
    pub async fn spawn(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        channel: &str,
    ) -> Result<(JoinHandle<()>, Arc<AtomicBool>), crate::error::ChannelError> {
        let mut stream = transport.subscribe(channel).await?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let channel = channel.to_string();

        let handle = tokio::spawn(async move {
            info!(channel = %channel, "Monitoring channel for worker commands");

            while !shutdown.load(Ordering::Relaxed) {
                match tokio::time::timeout(SHUTDOWN_POLL, stream.next()).await {
                    Ok(Some(message)) => {
                        let outcome = self.handle_text(&message.text, Utc::now()).await;
                        debug!(sender = ?message.sender, ?outcome, "Handled inbound message");
                    }
                    Ok(None) => {
                        warn!("Inbound message stream ended");
                        break;
                    }
                    Err(_) => {}
                }
            }

            info!("Protocol handler stopped");
        });

        Ok((handle, shutdown_flag))
    }
}

/// Decide from the current row whether moving it to `target` on behalf of
/// `bot` is a repeat, is not allowed, or should be attempted (`None`).
fn classify(
    bot: &Bot,
    execution: &TaskExecution,
    target: ExecutionStatus,
    command: &str,
) -> Option<CommandOutcome> {
    if let Some(owner) = execution.assigned_to.filter(|owner| *owner != bot.bot_id) {
        warn!(
            bot_id = %bot.bot_id,
            execution_id = %execution.execution_id,
            assigned_to = %owner,
            command,
            "Execution is assigned to another bot"
        );
        return Some(CommandOutcome::Rejected);
    }
    if execution.status == target {
        debug!(execution_id = %execution.execution_id, command, "Duplicate command ignored");
        return Some(CommandOutcome::Duplicate);
    }
    if !execution.status.can_transition_to(target) {
        warn!(
            bot_id = %bot.bot_id,
            execution_id = %execution.execution_id,
            status = %execution.status,
            command,
            "Command rejected; transition not allowed"
        );
        return Some(CommandOutcome::Rejected);
    }
    None
}

/// Terminal outcome reported by a worker.
enum Resolution {
    Completed(serde_json::Value),
    Failed(String),
}

impl Resolution {
    fn command(&self) -> &'static str {
        match self {
            Self::Completed(_) => "complete",
            Self::Failed(_) => "failed",
        }
    }

    fn target(&self) -> ExecutionStatus {
        match self {
            Self::Completed(_) => ExecutionStatus::Completed,
            Self::Failed(_) => ExecutionStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::Task;

    struct Fixture {
        store: Arc<LibSqlBackend>,
        handler: ProtocolHandler,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let handler = ProtocolHandler::new(store.clone());
        Fixture { store, handler }
    }

    async fn add_bot(store: &LibSqlBackend, name: &str) -> Uuid {
        let bot = Bot {
            bot_id: Uuid::new_v4(),
            username: name.into(),
            token: SecretString::from("tok".to_string()),
            last_checkin: None,
            created_by: "admin".into(),
            created_at: Utc::now(),
            is_hidden: false,
        };
        store.insert_bot(&bot).await.unwrap();
        bot.bot_id
    }

    async fn broadcasted(store: &LibSqlBackend) -> Uuid {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            name: "scan".into(),
            description: None,
            config: serde_json::json!({"target": "x"}),
            cron_schedule: None,
            timeout_seconds: 3600,
            is_active: true,
            is_hidden: false,
            next_run: None,
            last_run: None,
            created_by: "admin".into(),
            created_at: now,
        };
        let exec = TaskExecution::pending(task.task_id, now);
        store.create_task(&task, Some(&exec)).await.unwrap();
        store.mark_broadcasted(exec.execution_id, now).await.unwrap();
        exec.execution_id
    }

    fn claim(exec: Uuid, bot: Uuid) -> String {
        format!(r#"/claim {{"execution_id": "{exec}", "bot_id": "{bot}"}}"#)
    }

    fn complete(exec: Uuid, bot: Uuid) -> String {
        format!(
            r#"/complete {{"execution_id": "{exec}", "bot_id": "{bot}", "status": "completed", "results": {{"x": 1}}}}"#
        )
    }

    fn failed(exec: Uuid, bot: Uuid) -> String {
        format!(
            r#"/failed {{"execution_id": "{exec}", "bot_id": "{bot}", "status": "failed", "error_message": "boom"}}"#
        )
    }

    #[tokio::test]
    async fn claim_then_complete() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;

        assert_eq!(fx.handler.handle_text(&claim(exec, bot), Utc::now()).await, CommandOutcome::Applied);
        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::InProgress);
        assert_eq!(loaded.assigned_to, Some(bot));
        assert!(loaded.claimed_at.is_some());

        assert_eq!(fx.handler.handle_text(&complete(exec, bot), Utc::now()).await, CommandOutcome::Applied);
        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.results, Some(serde_json::json!({"x": 1})));
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn claim_uses_payload_time() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;

        let text = format!(
            r#"/claim {{"execution_id": "{exec}", "bot_id": "{bot}", "claimed_at": "2026-03-01T10:00:00Z"}}"#
        );
        fx.handler.handle_text(&text, Utc::now()).await;
        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.claimed_at, wire::parse_timestamp("2026-03-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn duplicate_claim_keeps_first_timestamp() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;

        fx.handler.handle_text(&claim(exec, bot), Utc::now()).await;
        let first = fx.store.get_execution(exec).await.unwrap().unwrap();

        assert_eq!(fx.handler.handle_text(&claim(exec, bot), Utc::now()).await, CommandOutcome::Duplicate);
        let second = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(second.status, ExecutionStatus::InProgress);
        assert_eq!(second.assigned_to, Some(bot));
        assert_eq!(second.claimed_at, first.claimed_at);
    }

    #[tokio::test]
    async fn competing_claims_have_one_owner() {
        let fx = fixture().await;
        let a = add_bot(&fx.store, "worker_a").await;
        let b = add_bot(&fx.store, "worker_b").await;
        let exec = broadcasted(&fx.store).await;

        let (ca, cb) = (claim(exec, a), claim(exec, b));
        let (ra, rb) = tokio::join!(
            fx.handler.handle_text(&ca, Utc::now()),
            fx.handler.handle_text(&cb, Utc::now()),
        );
        let outcomes = [ra, rb];
        assert_eq!(outcomes.iter().filter(|o| **o == CommandOutcome::Applied).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == CommandOutcome::Rejected).count(), 1);

        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        let winner = if outcomes[0] == CommandOutcome::Applied { a } else { b };
        assert_eq!(loaded.assigned_to, Some(winner));
    }

    #[tokio::test]
    async fn non_owner_cannot_resolve() {
        let fx = fixture().await;
        let owner = add_bot(&fx.store, "owner").await;
        let intruder = add_bot(&fx.store, "intruder").await;
        let exec = broadcasted(&fx.store).await;
        fx.handler.handle_text(&claim(exec, owner), Utc::now()).await;

        assert_eq!(fx.handler.handle_text(&complete(exec, intruder), Utc::now()).await, CommandOutcome::Rejected);
        assert_eq!(fx.handler.handle_text(&failed(exec, intruder), Utc::now()).await, CommandOutcome::Rejected);

        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::InProgress);
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn result_before_claim_is_rejected() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;

        assert_eq!(fx.handler.handle_text(&complete(exec, bot), Utc::now()).await, CommandOutcome::Rejected);
        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Broadcasted);
    }

    #[tokio::test]
    async fn terminal_executions_accept_no_more_results() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;
        fx.handler.handle_text(&claim(exec, bot), Utc::now()).await;
        fx.handler.handle_text(&failed(exec, bot), Utc::now()).await;

        assert_eq!(fx.handler.handle_text(&failed(exec, bot), Utc::now()).await, CommandOutcome::Duplicate);
        assert_eq!(fx.handler.handle_text(&complete(exec, bot), Utc::now()).await, CommandOutcome::Rejected);
        assert_eq!(fx.handler.handle_text(&claim(exec, bot), Utc::now()).await, CommandOutcome::Rejected);

        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_and_hidden_bots_are_dropped() {
        let fx = fixture().await;
        let exec = broadcasted(&fx.store).await;
        let ghost = Uuid::new_v4();
        assert_eq!(fx.handler.handle_text(&claim(exec, ghost), Utc::now()).await, CommandOutcome::UnknownBot);

        let retired = add_bot(&fx.store, "retired").await;
        fx.store.hide_bot(retired).await.unwrap();
        assert_eq!(fx.handler.handle_text(&claim(exec, retired), Utc::now()).await, CommandOutcome::UnknownBot);

        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Broadcasted);
        assert!(loaded.assigned_to.is_none());
    }

    #[tokio::test]
    async fn unknown_execution_leaves_checkin_alone() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let ghost = Uuid::new_v4();

        let outcome = fx.handler.handle_text(&claim(ghost, bot), Utc::now()).await;
        assert_eq!(outcome, CommandOutcome::UnknownExecution);
        let status = format!(r#"/status {{"execution_id": "{ghost}", "bot_id": "{bot}"}}"#);
        let outcome = fx.handler.handle_text(&status, Utc::now()).await;
        assert_eq!(outcome, CommandOutcome::UnknownExecution);

        let loaded = fx.store.get_active_bot(bot).await.unwrap().unwrap();
        assert!(loaded.last_checkin.is_none());
    }

    #[tokio::test]
    async fn rejected_claim_leaves_checkin_alone() {
        let fx = fixture().await;
        let owner = add_bot(&fx.store, "owner").await;
        let late = add_bot(&fx.store, "late").await;
        let exec = broadcasted(&fx.store).await;
        fx.handler.handle_text(&claim(exec, owner), Utc::now()).await;

        assert_eq!(fx.handler.handle_text(&claim(exec, late), Utc::now()).await, CommandOutcome::Rejected);
        assert!(fx.store.get_active_bot(late).await.unwrap().unwrap().last_checkin.is_none());
        assert!(fx.store.get_active_bot(owner).await.unwrap().unwrap().last_checkin.is_some());
    }

    #[tokio::test]
    async fn complete_with_failed_status_fails_execution() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;
        fx.handler.handle_text(&claim(exec, bot), Utc::now()).await;

        let text = format!(
            r#"/complete {{"execution_id": "{exec}", "bot_id": "{bot}", "status": "failed", "error_message": "x"}}"#
        );
        assert_eq!(fx.handler.handle_text(&text, Utc::now()).await, CommandOutcome::Applied);

        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("x"));
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn claim_before_broadcast_is_rejected() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            name: "scan".into(),
            description: None,
            config: serde_json::json!({}),
            cron_schedule: None,
            timeout_seconds: 3600,
            is_active: true,
            is_hidden: false,
            next_run: None,
            last_run: None,
            created_by: "admin".into(),
            created_at: now,
        };
        let exec = TaskExecution::pending(task.task_id, now);
        fx.store.create_task(&task, Some(&exec)).await.unwrap();

        let outcome = fx.handler.handle_text(&claim(exec.execution_id, bot), now).await;
        assert_eq!(outcome, CommandOutcome::Rejected);
        let loaded = fx.store.get_execution(exec.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn malformed_claim_mutates_nothing() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;

        assert_eq!(fx.handler.handle_text("/claim {not valid json", Utc::now()).await, CommandOutcome::Malformed);

        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Broadcasted);
        assert!(fx.store.get_active_bot(bot).await.unwrap().unwrap().last_checkin.is_none());
    }

    #[tokio::test]
    async fn status_and_checkin_touch_bot_only() {
        let fx = fixture().await;
        let bot = add_bot(&fx.store, "worker_one").await;
        let exec = broadcasted(&fx.store).await;

        let status = format!(
            r#"/status {{"execution_id": "{exec}", "bot_id": "{bot}", "message": "50% done"}}"#
        );
        assert_eq!(fx.handler.handle_text(&status, Utc::now()).await, CommandOutcome::Applied);
        let checkin = format!(r#"/checkin {{"bot_id": "{bot}", "timestamp": "2026-03-01T10:00:00Z"}}"#);
        assert_eq!(fx.handler.handle_text(&checkin, Utc::now()).await, CommandOutcome::Applied);

        let loaded = fx.store.get_execution(exec).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Broadcasted);
        assert!(fx.store.get_active_bot(bot).await.unwrap().unwrap().last_checkin.is_some());
    }

    #[tokio::test]
    async fn broadcast_text_is_not_a_command() {
        let fx = fixture().await;
        let outcome = fx.handler.handle_text("🎯 *New Task Available*", Utc::now()).await;
        assert_eq!(outcome, CommandOutcome::NotACommand);
    }
}
