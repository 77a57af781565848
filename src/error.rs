//! Error types for Urza.

use uuid::Uuid;

/// Error for service cycles that touch the store and intake validation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Work queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Push to queue {queue} failed: {reason}")]
    PushFailed { queue: String, reason: String },

    #[error("Pop from queue {queue} failed: {reason}")]
    PopFailed { queue: String, reason: String },

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// Chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },
}

/// Worker wire protocol errors. Always dropped and logged, never surfaced.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Not a worker command: {0}")]
    UnknownCommand(String),

    #[error("Malformed /{command} payload: {reason}")]
    MalformedPayload { command: String, reason: String },

    #[error("Invalid status '{status}' for /{command}")]
    InvalidStatus { command: String, status: String },
}

/// Intake (task/bot management) errors.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Task {0} is inactive")]
    TaskInactive(Uuid),

    #[error("Bot {0} not found")]
    BotNotFound(Uuid),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Invalid task configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to queue execution {execution_id}: {reason}")]
    QueueFailed { execution_id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
