use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::SlaveSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    Failure,
    Interrupted,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        *self == BuildOutcome::Success
    }
}

impl std::fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildOutcome::Success => write!(f, "success"),
            BuildOutcome::Failure => write!(f, "failure"),
            BuildOutcome::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Summary returned when a build ends.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    /// Command edges the build wanted.
    pub total_commands: usize,
    /// Commands that succeeded locally.
    pub local_commands: usize,
    /// Commands that succeeded on a slave and were fetched back.
    pub remote_commands: usize,
    /// Remote commands that reported failure.
    pub remote_failures: usize,
    /// Remote results given up on and re-run locally.
    pub requeued_locally: usize,
    /// Artifact fetches started.
    pub artifact_fetches: usize,
    /// Outputs of the edges that failed.
    pub failed_edges: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    WaitingForSlaves,
    Building,
    Finished,
}

/// Live view of a build, published for the status page.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSnapshot {
    pub phase: BuildPhase,
    pub total_commands: usize,
    pub finished_commands: usize,
    pub local_commands: usize,
    pub remote_commands: usize,
    pub running_local: usize,
    pub outstanding_remote: usize,
    pub failed: bool,
    pub outcome: Option<BuildOutcome>,
    pub slaves: Vec<SlaveSummary>,
    pub updated_at: DateTime<Utc>,
}

impl Default for BuildSnapshot {
    fn default() -> Self {
        Self {
            phase: BuildPhase::WaitingForSlaves,
            total_commands: 0,
            finished_commands: 0,
            local_commands: 0,
            remote_commands: 0,
            running_local: 0,
            outstanding_remote: 0,
            failed: false,
            outcome: None,
            slaves: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}
