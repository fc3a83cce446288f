//! Stage planning
//!
//! A job's stage list and weights are fixed once, at submission, from the
//! request settings. Weights always sum to 1.0 so that a fully completed
//! plan maps to 100% overall progress.

use serde::Serialize;

use docmaker_stages::{StageKind, VideoSettings};

/// Relative cost of each stage before normalization
fn base_weight(kind: StageKind) -> f64 {
    match kind {
        StageKind::Script => 0.20,
        StageKind::Visual => 0.35,
        StageKind::Audio => 0.20,
        StageKind::Render => 0.25,
    }
}

/// One step of a job's pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlannedStage {
    pub kind: StageKind,
    pub weight: f64,
}

/// Ordered, weighted stage list for one job
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    stages: Vec<PlannedStage>,
}

impl StagePlan {
    /// Build the plan for a request's settings.
    ///
    /// The audio mix stage is only planned when a music bed was chosen;
    /// the surviving stages are renormalized to sum to 1.0.
    pub fn for_settings(settings: &VideoSettings) -> Self {
        let kinds: Vec<StageKind> = StageKind::ALL
            .into_iter()
            .filter(|kind| *kind != StageKind::Audio || settings.has_music())
            .collect();
        Self::weighted(&kinds)
    }

    fn weighted(kinds: &[StageKind]) -> Self {
        let total: f64 = kinds.iter().map(|k| base_weight(*k)).sum();
        let stages = kinds
            .iter()
            .map(|kind| PlannedStage {
                kind: *kind,
                weight: base_weight(*kind) / total,
            })
            .collect();
        Self { stages }
    }

    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn get(&self, index: usize) -> Option<&PlannedStage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.stages.iter().map(|s| s.weight).collect()
    }

    pub fn position(&self, kind: StageKind) -> Option<usize> {
        self.stages.iter().position(|s| s.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmaker_stages::{MusicTrack, VideoDuration, VisualStyle, VoiceProfile};

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_full_plan_uses_base_weights() {
        let settings = VideoSettings {
            duration: VideoDuration::Seconds60,
            style: VisualStyle::Cinematic,
            music: MusicTrack::Epic,
            voice: VoiceProfile::Narrator,
        };
        let plan = StagePlan::for_settings(&settings);

        let kinds: Vec<StageKind> = plan.stages().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Script,
                StageKind::Visual,
                StageKind::Audio,
                StageKind::Render
            ]
        );
        let expected = [0.20, 0.35, 0.20, 0.25];
        for (stage, want) in plan.stages().iter().zip(expected) {
            assert!((stage.weight - want).abs() < EPSILON, "{:?}", stage);
        }
    }

    #[test]
    fn test_no_music_drops_audio_and_renormalizes() {
        let settings = VideoSettings {
            music: MusicTrack::None,
            ..Default::default()
        };
        let plan = StagePlan::for_settings(&settings);

        assert_eq!(plan.len(), 3);
        assert!(plan.position(StageKind::Audio).is_none());
        assert!((plan.stages()[0].weight - 0.25).abs() < EPSILON);
        assert!((plan.stages()[1].weight - 0.4375).abs() < EPSILON);
        assert!((plan.stages()[2].weight - 0.3125).abs() < EPSILON);
    }

    #[test]
    fn test_no_voice_keeps_audio_when_music_is_selected() {
        let settings = VideoSettings {
            voice: VoiceProfile::None,
            ..Default::default()
        };
        let plan = StagePlan::for_settings(&settings);
        assert_eq!(plan.position(StageKind::Audio), Some(2));
    }

    #[test]
    fn test_weights_sum_to_one_for_every_setting_combination() {
        for duration in VideoDuration::ALL {
            for style in VisualStyle::ALL {
                for music in MusicTrack::ALL {
                    for voice in VoiceProfile::ALL {
                        let settings = VideoSettings {
                            duration,
                            style: *style,
                            music: *music,
                            voice: *voice,
                        };
                        let plan = StagePlan::for_settings(&settings);
                        let sum: f64 = plan.weights().iter().sum();
                        assert!((sum - 1.0).abs() < EPSILON, "{:?} sums to {}", settings, sum);
                        assert!(plan.weights().iter().all(|w| *w > 0.0));
                        assert_eq!(plan.stages().first().map(|s| s.kind), Some(StageKind::Script));
                        assert_eq!(plan.stages().last().map(|s| s.kind), Some(StageKind::Render));
                    }
                }
            }
        }
    }
}
