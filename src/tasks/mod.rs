//! Tasks, executions, worker bots, and the execution state machine.

pub mod model;
pub mod state;

pub use model::{
    Bot, DEFAULT_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS, NewBot, NewTask, Task, TaskExecution,
};
pub use state::ExecutionStatus;
