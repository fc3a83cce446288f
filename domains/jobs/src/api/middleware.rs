//! Jobs domain state

use crate::manager::JobManager;

/// Application state for the Jobs domain
#[derive(Clone, Debug)]
pub struct JobsState {
    pub manager: JobManager,
}

impl JobsState {
    pub fn new(manager: JobManager) -> Self {
        Self { manager }
    }
}
