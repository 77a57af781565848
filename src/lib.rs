//! Urza: task orchestration for a fleet of chat-connected worker bots.

pub mod channels;
pub mod config;
pub mod error;
pub mod intake;
pub mod orchestrator;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod store;
pub mod tasks;
