//! Track: motion model, shape, class belief, existence and lifecycle state.

use crate::{
    motion_model::MotionModel,
    types::{
        ClassDistribution, DetectedObject, Kinematics, ObjectClass, Shape, Time, TrackId,
        TrackPhase, TrackedObject,
    },
};

/// A single tracked object.
#[derive(Clone, Debug)]
pub struct Track {
    /// Unique identifier, never reused
    pub id: TrackId,
    /// Kinematic state (variant chosen from the class at spawn)
    pub model: MotionModel,
    /// Smoothed extent
    pub shape: Shape,
    /// Class-label belief
    pub classification: ClassDistribution,
    /// Existence score at `last_updated`; decays afterwards
    pub existence: f64,
    /// Matched-update counter, saturating
    pub confirmation_count: u32,
    /// Number of detections received from each input channel
    pub channel_hits: Vec<u32>,
    /// Lifecycle phase
    pub phase: TrackPhase,
    /// Time of the last successful measurement update
    pub last_updated: Time,
    /// Time of birth
    pub created_at: Time,
}

impl Track {
    /// Create a new tentative track from a world-frame detection.
    pub fn new(
        id: TrackId,
        model: MotionModel,
        object: &DetectedObject,
        existence: f64,
        channel: usize,
        channel_count: usize,
        time: Time,
    ) -> Self {
        let mut channel_hits = vec![0; channel_count.max(channel + 1)];
        channel_hits[channel] = 1;
        Self {
            id,
            model,
            shape: object.shape.clone(),
            classification: object.classification,
            existence,
            confirmation_count: 1,
            channel_hits,
            phase: TrackPhase::Tentative,
            last_updated: time,
            created_at: time,
        }
    }

    pub fn label(&self) -> ObjectClass {
        self.classification.label()
    }

    pub fn is_confirmed(&self) -> bool {
        self.phase == TrackPhase::Confirmed
    }

    /// Existence score decayed from `last_updated` to `time`.
    pub fn existence_at(&self, time: Time, decay_time: f64) -> f64 {
        let dt = (time - self.last_updated).max(0.0);
        if decay_time <= 0.0 {
            return self.existence;
        }
        self.existence * (-dt / decay_time).exp()
    }

    /// Current (predicted) kinematics.
    pub fn kinematics(&self) -> Kinematics {
        self.model.kinematics()
    }

    /// Promote to Confirmed once the counter reaches `threshold`. Never
    /// demotes.
    pub fn refresh_phase(&mut self, threshold: u32) -> bool {
        if self.phase == TrackPhase::Tentative && self.confirmation_count >= threshold {
            self.phase = TrackPhase::Confirmed;
            return true;
        }
        false
    }

    /// Snapshot extrapolated to `time` without touching the stored state.
    pub fn to_tracked_object(&self, time: Time, decay_time: f64) -> TrackedObject {
        TrackedObject {
            id: self.id,
            kinematics: self.model.predicted(time).kinematics(),
            shape: self.shape.clone(),
            classification: self.classification,
            existence_probability: self.existence_at(time, decay_time),
            phase: self.phase,
            confirmation_count: self.confirmation_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion_model::{MotionModelKind, MotionNoiseConfig};
    use approx::assert_abs_diff_eq;

    fn track() -> Track {
        let object = DetectedObject {
            kinematics: Kinematics::new(0.0, 0.0, 0.0),
            shape: Shape::bounding_box(4.0, 2.0, 1.5),
            classification: ClassDistribution::certain(ObjectClass::Car),
            existence_probability: 0.7,
        };
        let model = MotionModel::new(
            MotionModelKind::ConstantVelocity,
            &object,
            0.0,
            MotionNoiseConfig::default(),
        );
        Track::new(TrackId(7), model, &object, 0.6, 1, 3, 0.0)
    }

    #[test]
    fn new_track_is_tentative_with_one_hit() {
        let t = track();
        assert_eq!(t.phase, TrackPhase::Tentative);
        assert_eq!(t.confirmation_count, 1);
        assert_eq!(t.channel_hits, vec![0, 1, 0]);
    }

    #[test]
    fn phase_never_reverts() {
        let mut t = track();
        t.confirmation_count = 3;
        assert!(t.refresh_phase(3));
        assert!(!t.refresh_phase(10));
        assert_eq!(t.phase, TrackPhase::Confirmed);
    }

    #[test]
    fn existence_decays_exponentially() {
        let t = track();
        assert_abs_diff_eq!(t.existence_at(0.0, 2.0), 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(t.existence_at(2.0, 2.0), 0.6 * (-1.0f64).exp(), epsilon = 1e-12);
    }
}
