//! Stage-weighted overall progress
//!
//! `overall = Σ weight[i] × progress[i]`, reported through a high-water mark
//! so that resetting a retried stage to 0 never makes the figure go down.

/// Aggregates per-stage fractions into one monotonic overall value
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressAggregator {
    weights: Vec<f64>,
    stage_progress: Vec<f64>,
    high_water: f64,
}

impl ProgressAggregator {
    pub fn new(weights: Vec<f64>) -> Self {
        let stage_progress = vec![0.0; weights.len()];
        Self {
            weights,
            stage_progress,
            high_water: 0.0,
        }
    }

    /// Set one stage's fraction; returns the overall value
    pub fn update(&mut self, index: usize, fraction: f64) -> f64 {
        if let Some(slot) = self.stage_progress.get_mut(index) {
            if fraction.is_finite() {
                *slot = fraction.clamp(0.0, 1.0);
            }
        }
        self.refresh()
    }

    /// Zero a stage before it is re-executed
    pub fn reset_stage(&mut self, index: usize) -> f64 {
        self.update(index, 0.0)
    }

    pub fn complete_stage(&mut self, index: usize) -> f64 {
        self.update(index, 1.0)
    }

    /// Last reported overall value
    pub fn overall(&self) -> f64 {
        self.high_water
    }

    pub fn stage_progress(&self, index: usize) -> f64 {
        self.stage_progress.get(index).copied().unwrap_or(0.0)
    }

    pub fn is_complete(&self) -> bool {
        self.stage_progress.iter().all(|p| *p >= 1.0)
    }

    fn computed(&self) -> f64 {
        // Exact 1.0 once everything is done, whatever the float rounding
        if self.is_complete() {
            return 1.0;
        }
        self.weights
            .iter()
            .zip(&self.stage_progress)
            .map(|(weight, progress)| weight * progress)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }

    fn refresh(&mut self) -> f64 {
        self.high_water = self.high_water.max(self.computed());
        self.high_water
    }
}
