//! Broadcast payload rendering.
//!
//! A broadcast is a short Markdown header for humans followed by a fenced
//! JSON block that workers parse. Field order in the JSON is fixed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::{Task, TaskExecution};

/// Machine-readable part of a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub config: serde_json::Value,
    pub timeout_seconds: i64,
    pub broadcast_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

impl BroadcastPayload {
    pub fn new(execution: &TaskExecution, task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            execution_id: execution.execution_id,
            task_id: task.task_id,
            config: task.config.clone(),
            timeout_seconds: task.timeout_seconds,
            broadcast_time: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            task_name: Some(task.name.clone()).filter(|n| !n.trim().is_empty()),
        }
    }
}

/// Check that a task configuration is a non-empty JSON object.
pub fn validate_task_config(config: &serde_json::Value) -> Result<(), String> {
    match config.as_object() {
        None => Err("task config must be a JSON object".to_string()),
        Some(map) if map.is_empty() => Err("task config cannot be empty".to_string()),
        Some(_) => Ok(()),
    }
}

/// Render the full broadcast message.
pub fn format_broadcast(payload: &BroadcastPayload) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string_pretty(payload)?;
    let id = payload.execution_id;

    let mut text = String::from("🎯 *New Task Available*\n");
    if let Some(name) = &payload.task_name {
        text.push_str(&format!("*Task:* {name}\n"));
    }
    text.push_str(&format!("*Execution ID:* `{id}`\n"));
    text.push_str(&format!("*Timeout:* {}s\n", payload.timeout_seconds));
    text.push_str("\n*Configuration:*\n");
    text.push_str(&format!("```json\n{json}\n```\n"));
    text.push_str(&format!(
        "\n💡 *To claim:* `/claim {{\"execution_id\": \"{id}\", \"bot_id\": \"your-bot-id\"}}`"
    ));
    Ok(text)
}

/// Pull the JSON payload back out of a rendered broadcast.
pub fn extract_payload(text: &str) -> Option<BroadcastPayload> {
    let start = text.find("```json\n")? + "```json\n".len();
    let end = start + text[start..].find("\n```")?;
    serde_json::from_str(&text[start..end]).ok()
}
