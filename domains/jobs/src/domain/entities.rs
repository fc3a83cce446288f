//! Job domain entities
//!
//! `Job` is the mutable record a single worker owns while driving it through
//! its stage plan. Every status change goes through `JobStateMachine`; an
//! illegal change is an orchestrator bug and surfaces as `Error::Internal`.
//! Readers never see a `Job` directly, only immutable `JobSnapshot` copies.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docmaker_common::{Error, Result};
use docmaker_stages::{Artifact, JobRequest, StageKind};

use crate::domain::plan::StagePlan;
use crate::domain::progress::ProgressAggregator;
use crate::domain::state::{JobEvent, JobStateMachine, JobStatus, StateError};

/// Stage name recorded when the orchestrator itself aborts a job
pub const ORCHESTRATOR_STAGE: &str = "orchestrator";

/// Why a job ended up Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    /// Explicit cancel request from a client
    User,
    /// Per-job or per-stage deadline elapsed
    Timeout,
    /// The job manager is stopping
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Timeout => write!(f, "timeout"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Terminal failure summary of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Failing stage name, or `orchestrator` for aborts
    pub stage: String,
    pub message: String,
    pub retryable: bool,
    /// Executions of the failing stage
    pub attempts: u32,
}

impl JobError {
    pub fn orchestrator(message: impl Into<String>) -> Self {
        Self {
            stage: ORCHESTRATOR_STAGE.to_string(),
            message: message.into(),
            retryable: false,
            attempts: 0,
        }
    }
}

/// Progress of one planned stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub name: StageKind,
    pub weight: f64,
    pub progress: f64,
    pub attempts: u32,
}

/// Immutable, point-in-time copy of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub overall_progress: f64,
    pub current_stage: Option<StageKind>,
    pub stages: Vec<StageSnapshot>,
    pub per_stage_progress: BTreeMap<StageKind, f64>,
    pub request: JobRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic revision, bumped on every change
    #[serde(skip)]
    pub revision: u64,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn stage_attempts(&self, kind: StageKind) -> Option<u32> {
        self.stages
            .iter()
            .find(|s| s.name == kind)
            .map(|s| s.attempts)
    }
}

/// Video generation job
#[derive(Debug, Clone)]
pub struct Job {
    id: Uuid,
    request: JobRequest,
    plan: StagePlan,
    status: JobStatus,
    current_stage: usize,
    attempts: Vec<u32>,
    progress: ProgressAggregator,
    result: Option<Artifact>,
    error: Option<JobError>,
    cancel_requested: Option<CancelReason>,
    cancel_reason: Option<CancelReason>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    revision: u64,
}

impl Job {
    /// Create a queued job, planning its stages from the request settings
    pub fn new(request: JobRequest) -> Result<Self> {
        request.validate()?;

        let plan = StagePlan::for_settings(&request.settings);
        let progress = ProgressAggregator::new(plan.weights());
        let now = Utc::now();
        Ok(Job {
            id: Uuid::new_v4(),
            attempts: vec![0; plan.len()],
            request,
            plan,
            status: JobStatus::default(),
            current_stage: 0,
            progress,
            result: None,
            error: None,
            cancel_requested: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            revision: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_stage(&self) -> usize {
        self.current_stage
    }

    pub fn overall_progress(&self) -> f64 {
        self.progress.overall()
    }

    pub fn attempts(&self, index: usize) -> u32 {
        self.attempts.get(index).copied().unwrap_or(0)
    }

    pub fn result(&self) -> Option<&Artifact> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    /// Reason recorded by a pending cancellation request
    pub fn cancel_requested(&self) -> Option<CancelReason> {
        self.cancel_requested
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason
    }

    /// Worker picked the job up
    pub fn start(&mut self) -> Result<()> {
        self.status = self.apply_transition(JobEvent::WorkerPicksUp)?;
        self.started_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Enter (or re-enter, on retry) the stage at `index`.
    ///
    /// Returns the attempt number of this execution. The stage's own
    /// progress is reset to 0; overall progress is unaffected.
    pub fn begin_stage(&mut self, index: usize) -> Result<u32> {
        if self.status != JobStatus::Running {
            return Err(Error::Internal(format!(
                "Cannot begin stage {} of job {} in '{}' state",
                index, self.id, self.status
            )));
        }
        if index >= self.plan.len() {
            return Err(Error::Internal(format!(
                "Stage index {} out of range for job {} with {} stages",
                index,
                self.id,
                self.plan.len()
            )));
        }
        if index < self.current_stage {
            return Err(Error::Internal(format!(
                "Stage index of job {} cannot rewind from {} to {}",
                self.id, self.current_stage, index
            )));
        }

        self.current_stage = index;
        self.attempts[index] += 1;
        self.progress.reset_stage(index);
        self.touch();
        Ok(self.attempts[index])
    }

    /// Record progress of the running stage; returns the overall value
    pub fn record_progress(&mut self, index: usize, fraction: f64) -> f64 {
        if self.status == JobStatus::Running && index == self.current_stage {
            self.progress.update(index, fraction);
            self.touch();
        }
        self.progress.overall()
    }

    pub fn complete_stage(&mut self, index: usize) -> f64 {
        self.record_progress(index, 1.0)
    }

    /// Every stage finished; `artifact` is the final render output
    pub fn succeed(&mut self, artifact: Artifact) -> Result<()> {
        if !self.progress.is_complete() {
            return Err(Error::Internal(format!(
                "Job {} cannot succeed with unfinished stages",
                self.id
            )));
        }
        self.status = self.apply_transition(JobEvent::Success)?;
        self.result = Some(artifact);
        self.finish();
        Ok(())
    }

    /// A stage gave up after its retries
    pub fn fail(&mut self, error: JobError) -> Result<()> {
        self.status = self.apply_transition(JobEvent::Failure)?;
        self.error = Some(error);
        self.finish();
        Ok(())
    }

    pub fn cancel(&mut self, reason: CancelReason) -> Result<()> {
        self.status = self.apply_transition(JobEvent::Cancel)?;
        self.cancel_reason = Some(reason);
        self.finish();
        Ok(())
    }

    /// Set the cancellation flag; returns false if already set or terminal
    pub fn request_cancel(&mut self, reason: CancelReason) -> bool {
        if self.is_terminal() || self.cancel_requested.is_some() {
            return false;
        }
        self.cancel_requested = Some(reason);
        self.touch();
        true
    }

    /// Force a non-terminal job to Failed after an orchestrator fault
    pub fn abort(&mut self, message: impl Into<String>) -> Result<()> {
        if self.status == JobStatus::Queued {
            self.start()?;
        }
        self.fail(JobError::orchestrator(message))
    }

    /// User-facing status line
    pub fn message(&self) -> String {
        match self.status {
            JobStatus::Queued => "Analyzing your prompt...".to_string(),
            JobStatus::Running => self
                .plan
                .get(self.current_stage)
                .map(|stage| stage.kind.status_message().to_string())
                .unwrap_or_default(),
            JobStatus::Succeeded => "Complete!".to_string(),
            JobStatus::Failed => match &self.error {
                Some(error) => format!("Failed during {} stage", error.stage),
                None => "Failed".to_string(),
            },
            JobStatus::Cancelled => match self.cancel_reason {
                Some(CancelReason::Timeout) => "Cancelled: timed out".to_string(),
                Some(CancelReason::Shutdown) => "Cancelled: service shutting down".to_string(),
                _ => "Cancelled".to_string(),
            },
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let stages: Vec<StageSnapshot> = self
            .plan
            .stages()
            .iter()
            .enumerate()
            .map(|(index, stage)| StageSnapshot {
                name: stage.kind,
                weight: stage.weight,
                progress: self.progress.stage_progress(index),
                attempts: self.attempts(index),
            })
            .collect();
        let per_stage_progress = stages.iter().map(|s| (s.name, s.progress)).collect();
        let current_stage = match self.status {
            JobStatus::Queued => None,
            _ => self.plan.get(self.current_stage).map(|s| s.kind),
        };

        JobSnapshot {
            job_id: self.id,
            status: self.status,
            message: self.message(),
            overall_progress: self.progress.overall(),
            current_stage,
            stages,
            per_stage_progress,
            request: self.request.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            cancel_reason: self.cancel_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            revision: self.revision,
        }
    }

    /// Check record invariants
    pub fn validate(&self) -> Result<()> {
        let violation = |msg: &str| Err(Error::Internal(format!("Job {}: {}", self.id, msg)));

        if self.is_terminal() && self.completed_at.is_none() {
            return violation("terminal jobs must have a completion timestamp");
        }
        if self.status != JobStatus::Queued && self.started_at.is_none() {
            return violation("started jobs must have a start timestamp");
        }
        match self.status {
            JobStatus::Succeeded if self.result.is_none() || self.error.is_some() => {
                violation("succeeded jobs carry a result and no error")
            }
            JobStatus::Failed if self.error.is_none() || self.result.is_some() => {
                violation("failed jobs carry an error and no result")
            }
            JobStatus::Cancelled if self.error.is_some() || self.result.is_some() => {
                violation("cancelled jobs carry neither result nor error")
            }
            JobStatus::Queued | JobStatus::Running
                if self.error.is_some() || self.result.is_some() =>
            {
                violation("active jobs carry neither result nor error")
            }
            _ => Ok(()),
        }
    }

    fn apply_transition(&self, event: JobEvent) -> Result<JobStatus> {
        JobStateMachine::transition(self.status, event).map_err(|e| match e {
            StateError::InvalidTransition { from, event } => Error::Internal(format!(
                "Invalid job transition for {}: cannot apply '{}' event from '{}' state",
                self.id, event, from
            )),
            StateError::TerminalState(state) => Error::Internal(format!(
                "Job {} is in terminal state '{}' and cannot transition",
                self.id, state
            )),
        })
    }

    fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }
}
