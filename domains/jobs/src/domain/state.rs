//! Job lifecycle: Queued -> Running -> {Succeeded, Failed, Cancelled},
//! plus Queued -> Cancelled for jobs cancelled before pickup.
//!
//! Only `JobStateMachine::transition` decides whether a status change is
//! allowed; every status write on a `Job` goes through it.

use serde::{Deserialize, Serialize};

pub use docmaker_common::StateError;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Events that trigger job state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// Worker picks up the job for processing
    WorkerPicksUp,
    /// Every stage finished
    Success,
    /// A stage gave up, or the orchestrator aborted the job
    Failure,
    /// Job is cancelled by user, deadline, or shutdown
    Cancel,
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerPicksUp => write!(f, "worker_picks_up"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Job state machine
pub struct JobStateMachine;

impl JobStateMachine {
    /// Attempt a state transition
    ///
    /// Returns the new state if the transition is valid, or an error otherwise.
    pub fn transition(current: JobStatus, event: JobEvent) -> Result<JobStatus, StateError> {
        if current.is_terminal() {
            return Err(StateError::TerminalState(current.to_string()));
        }

        let next = match (current, event) {
            // From Queued
            (JobStatus::Queued, JobEvent::WorkerPicksUp) => JobStatus::Running,
            (JobStatus::Queued, JobEvent::Cancel) => JobStatus::Cancelled,

            // From Running
            (JobStatus::Running, JobEvent::Success) => JobStatus::Succeeded,
            (JobStatus::Running, JobEvent::Failure) => JobStatus::Failed,
            (JobStatus::Running, JobEvent::Cancel) => JobStatus::Cancelled,

            // Invalid transitions
            _ => {
                return Err(StateError::InvalidTransition {
                    from: current.to_string(),
                    event: event.to_string(),
                });
            }
        };

        Ok(next)
    }
}
