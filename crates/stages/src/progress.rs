//! Monotonic progress reporting for a single stage execution

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Receiver of accepted progress fractions
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Progress callback handed to a stage executor.
///
/// Accepted values are clamped into `[0, 1]` and never decrease within one
/// execution; a regression or a non-finite value is dropped. A fresh
/// reporter is created for every attempt, so a retried stage starts from 0.
pub struct ProgressReporter {
    sink: ProgressSink,
    last: Mutex<Option<f64>>,
}

impl ProgressReporter {
    pub fn new(sink: ProgressSink) -> Self {
        Self {
            sink,
            last: Mutex::new(None),
        }
    }

    /// Reporter that discards everything, for executors run outside a job
    pub fn noop() -> Self {
        Self::new(Arc::new(|_| {}))
    }

    /// Report a fraction of completion; returns the value now in effect
    pub fn report(&self, fraction: f64) -> f64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        if !fraction.is_finite() {
            tracing::debug!(fraction, "Ignoring non-finite stage progress");
            return last.unwrap_or(0.0);
        }

        let clamped = fraction.clamp(0.0, 1.0);
        if let Some(previous) = *last {
            if clamped < previous {
                tracing::debug!(previous, reported = clamped, "Ignoring stage progress regression");
                return previous;
            }
            if clamped == previous {
                return previous;
            }
        }

        *last = Some(clamped);
        // Forward while holding the guard so the sink sees values in order
        (self.sink)(clamped);
        clamped
    }

    /// Last accepted fraction, 0 if nothing was reported
    pub fn current(&self) -> f64 {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(0.0)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("current", &self.current())
            .finish()
    }
}
