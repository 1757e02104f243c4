//! Run status and run events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ToolCallRequest;

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted by the platform, not started yet
    Queued,
    /// Agent is working
    InProgress,
    /// Agent is waiting for tool results
    RequiresAction,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped before finishing
    Cancelled,
    /// Deadline passed before finishing
    Expired,
}

impl RunStatus {
    /// Check if the status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Check if the status represents an active state
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted while a run advances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Status changed
    StatusChanged {
        run_id: Uuid,
        old_status: RunStatus,
        new_status: RunStatus,
    },

    /// The agent asked for a tool call
    ToolCallRequested { run_id: Uuid, call: ToolCallRequest },

    /// The run reached a terminal status
    Completed {
        run_id: Uuid,
        status: RunStatus,
        result: Option<String>,
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::StatusChanged { run_id, .. }
            | Self::ToolCallRequested { run_id, .. }
            | Self::Completed { run_id, .. } => *run_id,
        }
    }
}

/// A run event with its position in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventRecord {
    /// Position in the log, starting at 1
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: RunEvent,
}

/// Append-only log of run events
///
/// Sequence numbers start at 1, so a checkpoint of 0 replays everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventLog {
    records: Vec<RunEventRecord>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return its sequence number
    pub fn push(&mut self, event: RunEvent) -> u64 {
        let seq = self.last_seq() + 1;
        self.records.push(RunEventRecord {
            seq,
            timestamp: Utc::now(),
            event,
        });
        seq
    }

    /// Events recorded after `checkpoint`
    pub fn since(&self, checkpoint: u64) -> impl Iterator<Item = &RunEventRecord> {
        let start = self.records.partition_point(|record| record.seq <= checkpoint);
        self.records[start..].iter()
    }

    pub fn last_seq(&self) -> u64 {
        self.records.last().map_or(0, |record| record.seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunEventRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
