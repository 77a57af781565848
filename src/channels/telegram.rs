//! Telegram transport: long-polls the Bot API for updates.
//!
//! Broadcasts go out with `sendMessage`; worker commands come back through
//! `getUpdates`, either as group messages or as channel posts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channels::{IncomingMessage, MessageStream, Transport};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates, in seconds.
const LONG_POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Telegram transport: connects to the Bot API via long-polling.
pub struct TelegramTransport {
    bot_token: SecretString,
    client: reqwest::Client,
    running: Arc<AtomicBool>,
}

impl TelegramTransport {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.bot_token, method)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);

        for chunk in &chunks {
            self.send_message_chunk(chat_id, chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        // Retry without parse_mode
        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {}, plain: {})",
                    markdown_status, plain_err
                ),
            });
        }

        Ok(())
    }
}

// ── Transport trait implementation ──────────────────────────────────

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            tracing::info!("Telegram transport connected");
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), ChannelError> {
        self.send_message(channel, text).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bot_token = self.bot_token.clone();
        let client = self.client.clone();
        let running = Arc::clone(&self.running);
        let channel = channel.to_string();

        running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!(channel = %channel, "Telegram transport listening for messages...");

            while running.load(Ordering::SeqCst) {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": LONG_POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "channel_post"]
                });

                let resp = match client
                    .post(api_url(&bot_token, "getUpdates"))
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                let results = match updates_result(&data) {
                    Ok(r) => r,
                    Err(description) => {
                        tracing::warn!("Telegram getUpdates refused: {description}");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(incoming) = parse_update(update, &channel) else {
                        continue;
                    };

                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }

            tracing::info!("Telegram listener stopped");
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram transport shutting down");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(bot_token: &SecretString, method: &str) -> String {
    format!(
        "https://api.telegram.org/bot{}/{method}",
        bot_token.expose_secret()
    )
}

/// The update list of a `getUpdates` reply, or the API's error description.
fn updates_result(data: &Value) -> Result<&Vec<Value>, String> {
    if data.get("ok").and_then(Value::as_bool) != Some(true) {
        let code = data.get("error_code").and_then(Value::as_i64).unwrap_or_default();
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description");
        return Err(format!("{code} {description}"));
    }
    data.get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| "reply has no result list".to_string())
}

/// Whether a Telegram `chat` object is the monitored channel.
///
/// `channel` is either a numeric chat id or an `@username`.
fn chat_matches(chat: &Value, channel: &str) -> bool {
    let id_matches = chat
        .get("id")
        .and_then(Value::as_i64)
        .is_some_and(|id| id.to_string() == channel);
    if id_matches {
        return true;
    }
    match (channel.strip_prefix('@'), chat.get("username").and_then(Value::as_str)) {
        (Some(wanted), Some(username)) => wanted.eq_ignore_ascii_case(username),
        _ => false,
    }
}

/// Turn one `getUpdates` entry into an inbound message for `channel`.
fn parse_update(update: &Value, channel: &str) -> Option<IncomingMessage> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;

    let chat = message.get("chat")?;
    if !chat_matches(chat, channel) {
        return None;
    }

    let text = message.get("text").and_then(Value::as_str)?;

    let mut incoming = IncomingMessage::new("telegram", channel, text);

    let sender = message
        .get("from")
        .and_then(|f| f.get("username"))
        .and_then(Value::as_str)
        .or_else(|| message.get("author_signature").and_then(Value::as_str));
    if let Some(sender) = sender {
        incoming = incoming.with_sender(sender);
    }

    Some(incoming)
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }

        // Find a good split point
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(cut);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { cut } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
