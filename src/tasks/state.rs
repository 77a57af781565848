//! Task execution state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, waiting for the publisher.
    Pending,
    /// Sent to the worker channel, waiting for a claim.
    Broadcasted,
    /// Claimed by a worker bot.
    InProgress,
    /// Worker reported success.
    Completed,
    /// Worker reported failure, or the task config was unusable.
    Failed,
    /// Deadline passed before a result arrived.
    #[serde(rename = "timedout")]
    TimedOut,
}

impl ExecutionStatus {
    /// States the timeout monitor may resolve.
    pub const IN_FLIGHT: [ExecutionStatus; 3] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Broadcasted,
        ExecutionStatus::InProgress,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Broadcasted) | (Pending, Failed) | (Pending, TimedOut) |
            // From Broadcasted
            (Broadcasted, InProgress) | (Broadcasted, TimedOut) |
            // From InProgress
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, TimedOut)
        )
    }

    /// Terminal states accept no further writes from workers.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Broadcasted => "broadcasted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timedout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "broadcasted" => Ok(Self::Broadcasted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timedout" => Ok(Self::TimedOut),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}
