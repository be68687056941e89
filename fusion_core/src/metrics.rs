//! Tracking metrics: RMSE position/speed, ID switches, precision/recall.

use crate::types::{ObjectClass, Time, TrackId, TrackedObjects};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ground-truth state of one target at a given time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    /// True target ID (from simulator)
    pub target_id: u64,
    pub time: Time,
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub speed: f64,
    pub class: ObjectClass,
}

/// Accumulated metric statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrackingMetrics {
    /// Number of frames evaluated
    pub n_frames: u64,
    /// Total number of matched (track, target) pairs evaluated
    pub n_matched: u64,
    /// Sum of squared position errors (for RMSE)
    pub sum_sq_pos_err: f64,
    /// Sum of squared speed errors (for RMSE)
    pub sum_sq_speed_err: f64,
    /// Matched pairs whose track label equals the true class
    pub class_correct: u64,
    pub true_positives: u64,
    /// Tracks with no target within the match distance
    pub false_positives: u64,
    /// Targets with no track within the match distance
    pub false_negatives: u64,
    /// Times a target was matched to a different track than before
    pub id_switches: u64,
    #[serde(skip)]
    last_track: HashMap<u64, TrackId>,
}

impl TrackingMetrics {
    /// Root-mean-square position error (meters, 2D).
    pub fn rmse_position(&self) -> f64 {
        if self.n_matched == 0 {
            return 0.0;
        }
        (self.sum_sq_pos_err / self.n_matched as f64).sqrt()
    }

    /// Root-mean-square speed error (m/s).
    pub fn rmse_speed(&self) -> f64 {
        if self.n_matched == 0 {
            return 0.0;
        }
        (self.sum_sq_speed_err / self.n_matched as f64).sqrt()
    }

    /// Precision = TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        let denom = (self.true_positives + self.false_positives) as f64;
        if denom == 0.0 {
            1.0
        } else {
            self.true_positives as f64 / denom
        }
    }

    /// Recall = TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        let denom = (self.true_positives + self.false_negatives) as f64;
        if denom == 0.0 {
            1.0
        } else {
            self.true_positives as f64 / denom
        }
    }

    pub fn class_accuracy(&self) -> f64 {
        if self.n_matched == 0 {
            return 1.0;
        }
        self.class_correct as f64 / self.n_matched as f64
    }

    /// Score one published frame against the targets alive at its stamp.
    /// Pairs are matched greedily by ascending distance up to
    /// `match_distance`.
    pub fn accumulate(
        &mut self,
        output: &TrackedObjects,
        ground_truths: &[GroundTruth],
        match_distance: f64,
    ) {
        self.n_frames += 1;

        let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
        for (ti, track) in output.objects.iter().enumerate() {
            for (gi, gt) in ground_truths.iter().enumerate() {
                let d = (track.kinematics.x - gt.x).hypot(track.kinematics.y - gt.y);
                if d <= match_distance {
                    candidates.push((d, ti, gi));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut track_used = vec![false; output.objects.len()];
        let mut gt_used = vec![false; ground_truths.len()];
        for (d, ti, gi) in candidates {
            if track_used[ti] || gt_used[gi] {
                continue;
            }
            track_used[ti] = true;
            gt_used[gi] = true;

            let track = &output.objects[ti];
            let gt = &ground_truths[gi];
            let speed = track.kinematics.velocity.unwrap_or(0.0);
            self.sum_sq_pos_err += d * d;
            self.sum_sq_speed_err += (speed - gt.speed).powi(2);
            self.n_matched += 1;
            self.true_positives += 1;
            if track.classification.label() == gt.class {
                self.class_correct += 1;
            }
            if let Some(previous) = self.last_track.insert(gt.target_id, track.id) {
                if previous != track.id {
                    self.id_switches += 1;
                }
            }
        }

        self.false_positives += track_used.iter().filter(|u| !**u).count() as u64;
        self.false_negatives += gt_used.iter().filter(|u| !**u).count() as u64;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassDistribution, Kinematics, Shape, TrackPhase, TrackedObject};
    use approx::assert_abs_diff_eq;

    fn tracked(id: u64, x: f64) -> TrackedObject {
        let mut kinematics = Kinematics::new(x, 0.0, 0.0);
        kinematics.velocity = Some(10.0);
        TrackedObject {
            id: TrackId(id),
            kinematics,
            shape: Shape::bounding_box(4.0, 2.0, 1.5),
            classification: ClassDistribution::certain(ObjectClass::Car),
            existence_probability: 0.9,
            phase: TrackPhase::Confirmed,
            confirmation_count: 3,
        }
    }

    fn truth(id: u64, x: f64) -> GroundTruth {
        GroundTruth {
            target_id: id,
            time: 0.0,
            x,
            y: 0.0,
            yaw: 0.0,
            speed: 9.0,
            class: ObjectClass::Car,
        }
    }

    fn frame(objects: Vec<TrackedObject>) -> TrackedObjects {
        TrackedObjects {
            stamp: 0.0,
            frame_id: "map".into(),
            objects,
        }
    }

    #[test]
    fn counts_hits_misses_and_false_alarms() {
        let mut m = TrackingMetrics::default();
        m.accumulate(
            &frame(vec![tracked(0, 0.5), tracked(1, 50.0)]),
            &[truth(7, 0.0), truth(8, 20.0)],
            2.0,
        );
        assert_eq!(m.true_positives, 1);
        assert_eq!(m.false_positives, 1);
        assert_eq!(m.false_negatives, 1);
        assert_abs_diff_eq!(m.rmse_position(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(m.rmse_speed(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.precision(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn detects_id_switch() {
        let mut m = TrackingMetrics::default();
        m.accumulate(&frame(vec![tracked(0, 0.0)]), &[truth(7, 0.0)], 2.0);
        m.accumulate(&frame(vec![tracked(0, 0.0)]), &[truth(7, 0.0)], 2.0);
        assert_eq!(m.id_switches, 0);
        m.accumulate(&frame(vec![tracked(3, 0.0)]), &[truth(7, 0.0)], 2.0);
        assert_eq!(m.id_switches, 1);
    }
}
