//! End-to-end execution lifecycle.
//!
//! Each test wires intake, publisher, protocol handler and orchestrator to
//! one file-backed store and a stub chat transport that records broadcasts
//! and lets the test inject worker messages.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use urza::channels::{IncomingMessage, MessageStream, Transport};
use urza::config::{OrchestratorConfig, PublisherConfig};
use urza::error::ChannelError;
use urza::intake::Intake;
use urza::orchestrator::{Orchestrator, timeout_message};
use urza::protocol::{CommandOutcome, ProtocolHandler};
use urza::publisher::broadcast::extract_payload;
use urza::publisher::{PublishOutcome, Publisher};
use urza::queue::{LibSqlWorkQueue, WorkQueue};
use urza::store::{Database, LibSqlBackend};
use urza::tasks::{ExecutionStatus, NewBot, NewTask, TaskExecution};

/// Maximum time any wait in these tests may take before it counts as hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const CHANNEL: &str = "@urza_tasks";

/// In-process chat: broadcasts are recorded, inbound messages come from a
/// sender the test holds.
struct StubChat {
    sent: Mutex<Vec<String>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<IncomingMessage>>>,
}

impl StubChat {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<IncomingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chat = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(rx)),
        });
        (chat, tx)
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for StubChat {
    fn name(&self) -> &str {
        "stub"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send(&self, _channel: &str, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<MessageStream, ChannelError> {
        let rx = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: "stub".into(),
                reason: "already subscribed".into(),
            })?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<LibSqlBackend>,
    queue: Arc<LibSqlWorkQueue>,
    chat: Arc<StubChat>,
    inbound: mpsc::UnboundedSender<IncomingMessage>,
    intake: Intake,
    publisher: Publisher,
    handler: ProtocolHandler,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LibSqlBackend::new_local(&dir.path().join("urza.db")).await.unwrap());
    let queue = Arc::new(LibSqlWorkQueue::new(store.connection_source(), "tasks:pending"));
    let (chat, inbound) = StubChat::new();

    let intake = Intake::new(store.clone(), queue.clone());
    let publisher = Publisher::new(
        PublisherConfig {
            poll_timeout: Duration::from_millis(50),
        },
        CHANNEL,
        store.clone(),
        queue.clone(),
        chat.clone(),
    );
    let handler = ProtocolHandler::new(store.clone());

    Harness {
        _dir: dir,
        store,
        queue,
        chat,
        inbound,
        intake,
        publisher,
        handler,
    }
}

async fn register(h: &Harness, username: &str) -> Uuid {
    h.intake
        .register_bot(
            NewBot {
                username: username.into(),
                token: SecretString::from(format!("{username}-token")),
                created_by: "admin".into(),
            },
            Utc::now(),
        )
        .await
        .unwrap()
        .bot_id
}

/// Poll until the execution reaches `status`.
async fn wait_for_status(store: &LibSqlBackend, execution_id: Uuid, status: ExecutionStatus) -> TaskExecution {
    timeout(TEST_TIMEOUT, async {
        loop {
            let exec = store.get_execution(execution_id).await.unwrap().unwrap();
            if exec.status == status {
                return exec;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("execution never reached expected status")
}

#[tokio::test]
async fn run_now_task_completes_end_to_end() {
    let h = harness().await;
    let bot = register(&h, "worker_one").await;

    let created = h
        .intake
        .create_task(
            NewTask::new("port scan", serde_json::json!({"target": "10.0.0.1"}), "admin").run_now(),
            Utc::now(),
        )
        .await
        .unwrap();
    let execution_id = created.execution.unwrap().execution_id;

    assert_eq!(h.publisher.poll_once().await, Some(PublishOutcome::Broadcasted));
    let broadcasted = h.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(broadcasted.status, ExecutionStatus::Broadcasted);
    assert!(broadcasted.queued_at.is_some());

    // The worker reads the execution id from the broadcast itself.
    let sent = h.chat.sent();
    assert_eq!(sent.len(), 1);
    let payload = extract_payload(&sent[0]).unwrap();
    assert_eq!(payload.execution_id, execution_id);
    assert_eq!(payload.config, serde_json::json!({"target": "10.0.0.1"}));

    let claim = format!(
        r#"/claim {{"execution_id": "{}", "bot_id": "{bot}"}}"#,
        payload.execution_id
    );
    assert_eq!(h.handler.handle_text(&claim, Utc::now()).await, CommandOutcome::Applied);

    let complete = format!(
        r#"/complete {{"execution_id": "{execution_id}", "bot_id": "{bot}", "status": "completed", "results": {{"x": 1}}}}"#
    );
    assert_eq!(h.handler.handle_text(&complete, Utc::now()).await, CommandOutcome::Applied);

    let done = h.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.assigned_to, Some(bot));
    assert_eq!(done.results, Some(serde_json::json!({"x": 1})));
    assert!(done.completed_at.is_some());

    // A late timeout sweep leaves the finished execution alone.
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), h.store.clone(), h.queue.clone());
    let far_future = Utc::now() + chrono::Duration::days(1);
    assert_eq!(orchestrator.run_timeout_cycle(far_future).await, 0);
}

#[tokio::test]
async fn services_drive_lifecycle_through_chat() {
    let h = harness().await;
    let bot = register(&h, "worker_one").await;

    let Harness {
        _dir,
        store,
        queue,
        chat,
        inbound,
        intake,
        publisher,
        handler,
    } = h;

    let (publish_loop, publish_stop) = Arc::new(publisher).spawn();
    let (listen_loop, listen_stop) = Arc::new(handler)
        .spawn(chat.clone(), CHANNEL)
        .await
        .unwrap();

    let created = intake
        .create_task(
            NewTask::new("sweep", serde_json::json!({"depth": 2}), "admin").run_now(),
            Utc::now(),
        )
        .await
        .unwrap();
    let execution_id = created.execution.unwrap().execution_id;

    wait_for_status(&store, execution_id, ExecutionStatus::Broadcasted).await;

    // Broadcasts echo back on the channel and must be ignored.
    for text in chat.sent() {
        inbound.send(IncomingMessage::new("stub", CHANNEL, text)).unwrap();
    }
    inbound
        .send(
            IncomingMessage::new(
                "stub",
                CHANNEL,
                format!(r#"/claim {{"execution_id": "{execution_id}", "bot_id": "{bot}"}}"#),
            )
            .with_sender("worker_one"),
        )
        .unwrap();
    wait_for_status(&store, execution_id, ExecutionStatus::InProgress).await;

    inbound
        .send(IncomingMessage::new(
            "stub",
            CHANNEL,
            format!(
                r#"/failed {{"execution_id": "{execution_id}", "bot_id": "{bot}", "status": "failed", "error_message": "target unreachable"}}"#
            ),
        ))
        .unwrap();
    let failed = wait_for_status(&store, execution_id, ExecutionStatus::Failed).await;
    assert_eq!(failed.error_message.as_deref(), Some("target unreachable"));

    publish_stop.store(true, std::sync::atomic::Ordering::Relaxed);
    listen_stop.store(true, std::sync::atomic::Ordering::Relaxed);
    timeout(TEST_TIMEOUT, publish_loop).await.unwrap().unwrap();
    timeout(TEST_TIMEOUT, listen_loop).await.unwrap().unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn unclaimed_broadcast_times_out() {
    let h = harness().await;
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), h.store.clone(), h.queue.clone());

    let now = Utc::now();
    let created = h
        .intake
        .create_task(
            NewTask::new("ping", serde_json::json!({"host": "a"}), "admin")
                .with_timeout(60)
                .run_now(),
            now,
        )
        .await
        .unwrap();
    let execution_id = created.execution.unwrap().execution_id;
    assert_eq!(h.publisher.poll_once().await, Some(PublishOutcome::Broadcasted));

    assert_eq!(orchestrator.run_timeout_cycle(now + chrono::Duration::seconds(61)).await, 1);
    let exec = h.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::TimedOut);
    assert_eq!(exec.error_message, Some(timeout_message(60)));

    // A claim arriving after the timeout is rejected.
    let bot = register(&h, "slowpoke").await;
    let claim = format!(r#"/claim {{"execution_id": "{execution_id}", "bot_id": "{bot}"}}"#);
    assert_eq!(h.handler.handle_text(&claim, Utc::now()).await, CommandOutcome::Rejected);
}

#[tokio::test]
async fn malformed_worker_input_changes_nothing() {
    let h = harness().await;
    let bot = register(&h, "worker_one").await;
    let created = h
        .intake
        .create_task(
            NewTask::new("scan", serde_json::json!({"target": "x"}), "admin").run_now(),
            Utc::now(),
        )
        .await
        .unwrap();
    let execution_id = created.execution.unwrap().execution_id;
    h.publisher.poll_once().await;

    let wrong_status = format!(
        r#"/complete {{"execution_id": "{execution_id}", "bot_id": "{bot}", "status": "cancelled"}}"#
    );
    for text in [
        "/claim {not valid json",
        "/claim {}",
        wrong_status.as_str(),
        "/claim",
    ] {
        assert_eq!(h.handler.handle_text(text, Utc::now()).await, CommandOutcome::Malformed, "{text}");
    }

    let exec = h.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Broadcasted);
    assert!(exec.assigned_to.is_none());
}

#[tokio::test]
async fn cron_task_fires_and_publishes() {
    let h = harness().await;
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), h.store.clone(), h.queue.clone());

    let created_at = Utc::now();
    let created = h
        .intake
        .create_task(
            NewTask::new("hourly", serde_json::json!({"scope": "all"}), "admin").with_cron("0 * * * *"),
            created_at,
        )
        .await
        .unwrap();
    let next_run = created.task.next_run.unwrap();

    assert_eq!(orchestrator.run_cron_cycle(created_at).await, 0);
    assert_eq!(orchestrator.run_cron_cycle(next_run).await, 1);
    assert_eq!(h.publisher.poll_once().await, Some(PublishOutcome::Broadcasted));

    let execs = h.store.list_executions_for_task(created.task.task_id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecutionStatus::Broadcasted);
}
