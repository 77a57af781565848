//! Chat transport abstraction: the message bus between Urza and its workers.

pub mod telegram;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;

pub use telegram::TelegramTransport;

/// An inbound text event from the monitored channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Transport that delivered the message.
    pub transport: String,
    /// Chat the message was posted in.
    pub chat_id: String,
    /// Sender handle, when the transport exposes one.
    pub sender: Option<String>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        transport: impl Into<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            transport: transport.into(),
            chat_id: chat_id.into(),
            sender: None,
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// Stream of inbound messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// Best-effort, at-least-once chat transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Validate credentials and reachability.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Post `text` to `channel`.
    async fn send(&self, channel: &str, text: &str) -> Result<(), ChannelError>;

    /// Stream every text message posted to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, ChannelError>;

    /// Stop listeners and release the client.
    async fn disconnect(&self) -> Result<(), ChannelError>;
}
