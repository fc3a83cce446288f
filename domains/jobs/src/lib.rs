//! Jobs domain: video generation jobs, worker pool, progress, retry, results

pub mod api;
pub mod domain;
pub mod manager;
pub mod runner;
pub mod store;

// Re-export domain types at the crate root for convenience
pub use domain::entities::*;
pub use domain::plan::{PlannedStage, StagePlan};
pub use domain::progress::ProgressAggregator;
pub use domain::retry::{Backoff, RetryDecision, RetryPolicy};
pub use domain::state::{JobEvent, JobStateMachine, JobStatus, StateError};

// Re-export orchestration types
pub use manager::{CancelAck, JobManager, JobManagerConfig};
pub use runner::{StageOutcome, StageRunner};
pub use store::ResultStore;

// Re-export API types
pub use api::routes;
pub use api::JobsState;
