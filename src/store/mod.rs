//! Persistence layer: libSQL-backed storage for tasks, executions, and bots.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{ConnectionSource, LibSqlBackend};
pub use traits::{Database, InFlightExecution};
