use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The unit of bulk work: every pending session of one group on one date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkTarget {
    pub group_id: String,
    pub date: NaiveDate,
}

impl WorkTarget {
    pub fn new(group_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            group_id: group_id.into(),
            date,
        }
    }

    /// Identifier sent to the backend, e.g. `grade-7b:2026-10-19`.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.group_id, self.date.format("%Y-%m-%d"))
    }
}

impl fmt::Display for WorkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

/// Server-issued position into the ordered approval queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub offset: u64,
    pub cumulative_sent: u64,
}

impl Cursor {
    pub const ZERO: Cursor = Cursor {
        offset: 0,
        cumulative_sent: 0,
    };
}

/// Outcome of one batch step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub records_approved: u64,
    /// Cumulative for the whole run, as reported by the server.
    pub messages_sent: u64,
    /// Local to this step.
    pub messages_skipped: u64,
    pub next_cursor: Cursor,
    pub has_more: bool,
    pub needs_break: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Cooling { remaining_secs: u64 },
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Cooling { .. } => "cooling",
            Phase::Completed => "completed",
            Phase::Failed { .. } => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Failed { .. } | Phase::Cancelled
        )
    }

    /// Running or cooling: a run is in progress and may be cancelled.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Running | Phase::Cooling { .. })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Cooling { remaining_secs } => write!(f, "cooling ({remaining_secs}s left)"),
            Phase::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Externally observable state of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub target: Option<WorkTarget>,
    pub total_approved: u64,
    pub total_sent_messages: u64,
    pub total_skipped_messages: u64,
    pub current_cursor: Cursor,
    pub phase: Phase,
    /// Step results folded so far.
    pub steps: u64,
    /// Cool-downs armed so far.
    pub pauses: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunProgress {
    pub fn idle() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            target: None,
            total_approved: 0,
            total_sent_messages: 0,
            total_skipped_messages: 0,
            current_cursor: Cursor::ZERO,
            phase: Phase::Idle,
            steps: 0,
            pauses: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::idle()
    }
}

/// Result of the unpaced "approve everything pending" operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproveAllSummary {
    pub approved_count: u64,
    pub failed_count: u64,
}
