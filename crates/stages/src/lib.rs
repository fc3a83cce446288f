//! Docmaker Stage Services
//!
//! The narrow capability interface the job orchestrator drives:
//! - `StageExecutor`: one implementation per stage kind (script, visual, audio, render)
//! - `StageContext`: the request plus artifacts produced by earlier stages
//! - `ProgressReporter`: monotonic progress callback handed to executors
//! - Mock executors with programmable behavior for testing and development

pub mod mock;
pub mod progress;
pub mod request;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use progress::{ProgressReporter, ProgressSink};
pub use request::{
    InvalidSetting, JobRequest, MusicTrack, VideoDuration, VideoSettings, VisualStyle,
    VoiceProfile,
};

/// Pipeline stage kinds, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Script,
    Visual,
    Audio,
    Render,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [Self::Script, Self::Visual, Self::Audio, Self::Render];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Visual => "visual",
            Self::Audio => "audio",
            Self::Render => "render",
        }
    }

    /// Status line shown to users while this stage runs
    pub fn status_message(&self) -> &'static str {
        match self {
            Self::Script => "Generating script...",
            Self::Visual => "Creating visuals...",
            Self::Audio => "Adding music and voice...",
            Self::Render => "Rendering video...",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of stage failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Temporary failure of the backing service
    Transient,
    /// Quota, memory or capacity exhausted
    ResourceExhausted,
    /// The request cannot be processed by this stage
    InvalidInput,
    /// The stage does not support the requested configuration
    Unsupported,
    /// The stage observed a cancellation signal
    Cancelled,
    /// Bug or unexpected state inside the executor
    Internal,
}

impl StageErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::ResourceExhausted)
    }
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::ResourceExhausted => "resource_exhausted",
            Self::InvalidInput => "invalid_input",
            Self::Unsupported => "unsupported",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error returned by a stage executor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Transient, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::ResourceExhausted, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::InvalidInput, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Unsupported, message)
    }

    pub fn cancelled() -> Self {
        Self::new(StageErrorKind::Cancelled, "stage execution was cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == StageErrorKind::Cancelled
    }
}

/// Output of a single stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub stage: StageKind,
    pub uri: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(stage: StageKind, uri: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            stage,
            uri: uri.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Everything a stage may read: the original request and prior outputs
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub request: JobRequest,
    outputs: BTreeMap<StageKind, Artifact>,
}

impl StageContext {
    pub fn new(job_id: Uuid, request: JobRequest) -> Self {
        Self {
            job_id,
            request,
            outputs: BTreeMap::new(),
        }
    }

    /// Artifact produced by an earlier stage, if it ran
    pub fn output(&self, kind: StageKind) -> Option<&Artifact> {
        self.outputs.get(&kind)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Artifact> {
        self.outputs.values()
    }

    pub fn record_output(&mut self, artifact: Artifact) {
        self.outputs.insert(artifact.stage, artifact);
    }
}

/// Stage executor trait, implemented by each generation backend
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    /// Stage kind this executor serves
    fn kind(&self) -> StageKind;

    /// Run the stage.
    ///
    /// Implementations report progress through `progress` and should check
    /// `cancel` between units of work, returning `StageError::cancelled()`
    /// promptly once it fires.
    async fn execute(
        &self,
        ctx: &StageContext,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Artifact, StageError>;
}

/// Executors keyed by stage kind
#[derive(Clone, Default)]
pub struct StageExecutors {
    executors: HashMap<StageKind, Arc<dyn StageExecutor>>,
}

impl StageExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for the same kind
    pub fn register(&mut self, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.executors.contains_key(&kind)
    }
}

impl fmt::Debug for StageExecutors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.executors.keys().collect();
        kinds.sort();
        f.debug_struct("StageExecutors")
            .field("kinds", &kinds)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum StageServiceError {
    #[error("Stage service configuration error: {0}")]
    Configuration(String),
}

/// Stage service configuration
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub provider: String,
    pub mock_step_delay_ms: u64,
}

impl From<&docmaker_common::Config> for StageConfig {
    fn from(config: &docmaker_common::Config) -> Self {
        Self {
            provider: config.stage_provider.clone(),
            mock_step_delay_ms: config.mock_step_delay_ms,
        }
    }
}

/// Factory for creating the executor set of a provider
pub struct StageServiceFactory;

impl StageServiceFactory {
    pub fn create(config: StageConfig) -> Result<StageExecutors, StageServiceError> {
        match config.provider.as_str() {
            "mock" => {
                tracing::info!(
                    step_delay_ms = config.mock_step_delay_ms,
                    "Creating mock stage executors"
                );
                let executors = StageKind::ALL
                    .into_iter()
                    .fold(StageExecutors::new(), |executors, kind| {
                        let behavior = mock::MockStageBehavior::new();
                        behavior.set_delay_ms(config.mock_step_delay_ms);
                        executors.with(Arc::new(mock::MockStageExecutor::with_behavior(
                            kind,
                            Arc::new(behavior),
                        )))
                    });
                Ok(executors)
            }
            provider => Err(StageServiceError::Configuration(format!(
                "Unknown stage provider: {}. Supported providers: mock",
                provider
            ))),
        }
    }
}
