//! Mock Stage Executor Implementation
//!
//! Programmable mock for testing stage workflows:
//! - `MockStageExecutor`: serves one stage kind and counts invocations
//! - `MockStageBehavior`: controls outcome, step delay, progress steps
//! - `MockOutcome`: Complete, Fail, or Hang

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    Artifact, ProgressReporter, StageContext, StageError, StageErrorKind, StageExecutor,
    StageKind,
};

const DEFAULT_DELAY_MS: u64 = 50;
const DEFAULT_STEPS: [f64; 3] = [0.25, 0.5, 0.75];

/// What outcome the mock should produce
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum MockOutcome {
    /// Finish with an artifact
    #[default]
    Complete,
    /// Fail every attempt with the given error kind
    Fail(StageErrorKind),
    /// Report progress, then block until cancelled
    Hang,
}

/// Programmable behavior for a mock stage
#[derive(Debug)]
pub struct MockStageBehavior {
    outcome: RwLock<MockOutcome>,
    delay_ms: RwLock<u64>,
    progress_steps: RwLock<Vec<f64>>,
    failures_before_success: RwLock<u32>,
    error_message: RwLock<Option<String>>,
}

impl Default for MockStageBehavior {
    fn default() -> Self {
        Self {
            outcome: RwLock::new(MockOutcome::Complete),
            delay_ms: RwLock::new(DEFAULT_DELAY_MS),
            progress_steps: RwLock::new(DEFAULT_STEPS.to_vec()),
            failures_before_success: RwLock::new(0),
            error_message: RwLock::new(None),
        }
    }
}

impl MockStageBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        *write(&self.outcome) = outcome;
    }

    /// Delay before every progress step and before completion
    pub fn set_delay_ms(&self, delay: u64) {
        *write(&self.delay_ms) = delay;
    }

    pub fn set_progress_steps(&self, steps: Vec<f64>) {
        *write(&self.progress_steps) = steps;
    }

    /// Fail the first `count` invocations with a transient error
    pub fn set_failures_before_success(&self, count: u32) {
        *write(&self.failures_before_success) = count;
    }

    pub fn set_error_message(&self, message: impl Into<String>) {
        *write(&self.error_message) = Some(message.into());
    }

    /// Reset to default behavior
    pub fn reset(&self) {
        *write(&self.outcome) = MockOutcome::Complete;
        *write(&self.delay_ms) = DEFAULT_DELAY_MS;
        *write(&self.progress_steps) = DEFAULT_STEPS.to_vec();
        *write(&self.failures_before_success) = 0;
        *write(&self.error_message) = None;
    }

    pub fn outcome(&self) -> MockOutcome {
        *read(&self.outcome)
    }

    pub fn delay_ms(&self) -> u64 {
        *read(&self.delay_ms)
    }

    pub fn progress_steps(&self) -> Vec<f64> {
        read(&self.progress_steps).clone()
    }

    pub fn failures_before_success(&self) -> u32 {
        *read(&self.failures_before_success)
    }

    fn error_message(&self) -> Option<String> {
        read(&self.error_message).clone()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Mock stage executor with programmable behavior
#[derive(Debug, Clone)]
pub struct MockStageExecutor {
    kind: StageKind,
    behavior: Arc<MockStageBehavior>,
    invocations: Arc<AtomicU32>,
}

impl MockStageExecutor {
    pub fn new(kind: StageKind) -> Self {
        Self::with_behavior(kind, Arc::new(MockStageBehavior::new()))
    }

    pub fn with_behavior(kind: StageKind, behavior: Arc<MockStageBehavior>) -> Self {
        Self {
            kind,
            behavior,
            invocations: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared behavior for external configuration
    pub fn behavior(&self) -> &Arc<MockStageBehavior> {
        &self.behavior
    }

    /// Number of times `execute` has been called
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn artifact(&self, ctx: &StageContext) -> Artifact {
        let settings = &ctx.request.settings;
        match self.kind {
            StageKind::Script => {
                let scenes = (settings.duration.as_secs() / 15).max(2);
                Artifact::new(
                    StageKind::Script,
                    format!("memory://jobs/{}/script.txt", ctx.job_id),
                    json!({
                        "narration": format!(
                            "A {} documentary: {}",
                            settings.style,
                            ctx.request.prompt.trim()
                        ),
                        "scenes": scenes,
                    }),
                )
            }
            StageKind::Visual => {
                let scenes = ctx
                    .output(StageKind::Script)
                    .and_then(|script| script.metadata["scenes"].as_u64())
                    .unwrap_or(1);
                Artifact::new(
                    StageKind::Visual,
                    format!("memory://jobs/{}/visuals", ctx.job_id),
                    json!({ "style": settings.style, "clips": scenes }),
                )
            }
            StageKind::Audio => Artifact::new(
                StageKind::Audio,
                format!("memory://jobs/{}/audio.wav", ctx.job_id),
                json!({ "music": settings.music, "voice": settings.voice }),
            ),
            StageKind::Render => {
                let inputs: Vec<String> = ctx.outputs().map(|a| a.uri.clone()).collect();
                Artifact::new(
                    StageKind::Render,
                    format!("generated-video-{}", Utc::now().timestamp_millis()),
                    json!({
                        "duration_secs": settings.duration.as_secs(),
                        "voice": settings.voice,
                        "inputs": inputs,
                    }),
                )
            }
        }
    }
}

/// Sleep for `delay`, returning early with a cancellation error
async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), StageError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StageError::cancelled()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[async_trait]
impl StageExecutor for MockStageExecutor {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Artifact, StageError> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            job_id = %ctx.job_id,
            stage = %self.kind,
            invocation,
            "Mock stage: executing"
        );

        let outcome = self.behavior.outcome();
        let delay = Duration::from_millis(self.behavior.delay_ms());

        progress.report(0.0);
        for step in self.behavior.progress_steps() {
            pause(delay, cancel).await?;
            progress.report(step);
        }

        match outcome {
            MockOutcome::Hang => {
                cancel.cancelled().await;
                Err(StageError::cancelled())
            }
            MockOutcome::Fail(kind) => {
                let message = self
                    .behavior
                    .error_message()
                    .unwrap_or_else(|| format!("simulated {} failure", self.kind));
                Err(StageError::new(kind, message))
            }
            MockOutcome::Complete => {
                if invocation <= self.behavior.failures_before_success() {
                    return Err(StageError::transient(format!(
                        "simulated transient {} failure ({} of {})",
                        self.kind,
                        invocation,
                        self.behavior.failures_before_success()
                    )));
                }
                pause(delay, cancel).await?;
                progress.report(1.0);
                Ok(self.artifact(ctx))
            }
        }
    }
}
