//! Single-stage execution
//!
//! `StageRunner` resolves the executor for a stage kind, hands it a fresh
//! progress reporter and a cancellation token, and folds the result into a
//! `StageOutcome` the job manager can act on. It never touches job status.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use docmaker_stages::{
    Artifact, ProgressReporter, ProgressSink, StageContext, StageError, StageExecutors, StageKind,
};

/// Terminal per-stage outcome of one execution
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(Artifact),
    Failed(StageError),
    /// The job token fired before or during execution
    Cancelled,
    /// The per-stage deadline elapsed
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct StageRunner {
    executors: StageExecutors,
    stage_timeout: Option<Duration>,
}

impl StageRunner {
    pub fn new(executors: StageExecutors, stage_timeout: Option<Duration>) -> Self {
        Self {
            executors,
            stage_timeout,
        }
    }

    pub fn executors(&self) -> &StageExecutors {
        &self.executors
    }

    /// Execute `kind` once against `ctx`.
    ///
    /// The executor observes a child of `cancel`; a stage deadline cancels
    /// only that child and waits for the executor to wind down.
    pub async fn run(
        &self,
        kind: StageKind,
        ctx: &StageContext,
        sink: ProgressSink,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let Some(executor) = self.executors.get(kind) else {
            return StageOutcome::Failed(StageError::unsupported(format!(
                "No executor registered for stage '{}'",
                kind
            )));
        };
        if cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        let progress = ProgressReporter::new(sink);
        let stage_cancel = cancel.child_token();
        let started = Instant::now();
        tracing::debug!(job_id = %ctx.job_id, stage = %kind, "Stage started");

        let execution = executor.execute(ctx, &progress, &stage_cancel);
        tokio::pin!(execution);

        let result = match self.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut execution).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        job_id = %ctx.job_id,
                        stage = %kind,
                        timeout_ms = limit.as_millis() as u64,
                        "Stage timed out, cancelling"
                    );
                    stage_cancel.cancel();
                    let _ = execution.await;
                    return StageOutcome::TimedOut;
                }
            },
            None => execution.await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(artifact) => {
                tracing::debug!(
                    job_id = %ctx.job_id,
                    stage = %kind,
                    elapsed_ms,
                    uri = %artifact.uri,
                    "Stage completed"
                );
                StageOutcome::Completed(artifact)
            }
            Err(error) if error.is_cancelled() || cancel.is_cancelled() => {
                tracing::debug!(job_id = %ctx.job_id, stage = %kind, elapsed_ms, "Stage cancelled");
                StageOutcome::Cancelled
            }
            Err(error) => {
                tracing::debug!(
                    job_id = %ctx.job_id,
                    stage = %kind,
                    elapsed_ms,
                    error = %error,
                    "Stage failed"
                );
                StageOutcome::Failed(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmaker_stages::mock::{MockOutcome, MockStageExecutor};
    use docmaker_stages::{JobRequest, StageErrorKind, VideoSettings};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn context() -> StageContext {
        StageContext::new(
            Uuid::new_v4(),
            JobRequest::new("volcanoes", VideoSettings::default()).unwrap(),
        )
    }

    fn mock(kind: StageKind) -> Arc<MockStageExecutor> {
        let executor = Arc::new(MockStageExecutor::new(kind));
        executor.behavior().set_delay_ms(1);
        executor
    }

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        (
            Arc::new(move |p| sink_seen.lock().unwrap().push(p)),
            seen,
        )
    }

    #[tokio::test]
    async fn test_completed_stage_reports_progress() {
        let executor = mock(StageKind::Script);
        let runner = StageRunner::new(StageExecutors::new().with(executor.clone()), None);
        let (sink, seen) = recording_sink();

        let outcome = runner
            .run(StageKind::Script, &context(), sink, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, StageOutcome::Completed(ref a) if a.stage == StageKind::Script));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(executor.invocations(), 1);
    }

    #[tokio::test]
    async fn test_missing_executor_is_unsupported() {
        let runner = StageRunner::new(StageExecutors::new(), None);
        let (sink, _) = recording_sink();
        let outcome = runner
            .run(StageKind::Audio, &context(), sink, &CancellationToken::new())
            .await;
        match outcome {
            StageOutcome::Failed(error) => assert_eq!(error.kind, StageErrorKind::Unsupported),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_is_passed_through() {
        let executor = mock(StageKind::Visual);
        executor
            .behavior()
            .set_outcome(MockOutcome::Fail(StageErrorKind::InvalidInput));
        let runner = StageRunner::new(StageExecutors::new().with(executor), None);
        let (sink, _) = recording_sink();

        let outcome = runner
            .run(StageKind::Visual, &context(), sink, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            StageOutcome::Failed(StageError {
                kind: StageErrorKind::InvalidInput,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_already_cancelled_token_skips_execution() {
        let executor = mock(StageKind::Render);
        let runner = StageRunner::new(StageExecutors::new().with(executor.clone()), None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (sink, _) = recording_sink();

        let outcome = runner.run(StageKind::Render, &context(), sink, &cancel).await;
        assert_eq!(outcome, StageOutcome::Cancelled);
        assert_eq!(executor.invocations(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_execution() {
        let executor = mock(StageKind::Visual);
        executor.behavior().set_outcome(MockOutcome::Hang);
        let runner = StageRunner::new(StageExecutors::new().with(executor), None);
        let cancel = CancellationToken::new();
        let (sink, _) = recording_sink();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = runner.run(StageKind::Visual, &context(), sink, &cancel).await;
        assert_eq!(outcome, StageOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_stage_timeout_cancels_only_the_stage() {
        let executor = mock(StageKind::Audio);
        executor.behavior().set_outcome(MockOutcome::Hang);
        let runner = StageRunner::new(
            StageExecutors::new().with(executor),
            Some(Duration::from_millis(30)),
        );
        let cancel = CancellationToken::new();
        let (sink, _) = recording_sink();

        let outcome = runner.run(StageKind::Audio, &context(), sink, &cancel).await;
        assert_eq!(outcome, StageOutcome::TimedOut);
        assert!(!cancel.is_cancelled());
    }
}
