//! Per-class-pair gating and association scoring.
//!
//! # Gating criterion
//! A (track, measurement) pair is a candidate only if, for the limits in row
//! `track label`, column `measurement label`:
//! - the pair may be assigned at all (`can_assign`)
//! - centre distance ≤ `max_dist`
//! - measurement footprint area is within `[min_area, max_area]`
//! - heading difference modulo π ≤ `max_rad` (skipped when the measurement
//!   heading is unavailable)
//! - footprint IoU ≥ `min_iou`
//!
//! # Score
//! `cost = w_dist · d / max_dist + w_iou · (1 − IoU)`; lower is better.

use crate::{
    error::{FusionError, Result},
    geometry::{axis_angle_diff, footprint_area, iou_2d},
    types::{DetectedObject, Kinematics, ObjectClass, OrientationAvailability, Shape, N_CLASSES},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const N_PAIRS: usize = N_CLASSES * N_CLASSES;

/// A Uniform Grid spatial index for 2D points.
/// Used to skip measurements that are certainly outside every distance gate.
pub struct SpatialGrid {
    cell_size: f64,
    /// Maps cell key (ix, iy) to a list of measurement indices.
    cells: HashMap<(i64, i64), Vec<usize>>,
}

impl SpatialGrid {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: cell_size.max(1e-3),
            cells: HashMap::new(),
        }
    }

    fn key(&self, x: f64, y: f64) -> (i64, i64) {
        (
            (x / self.cell_size).floor() as i64,
            (y / self.cell_size).floor() as i64,
        )
    }

    /// Insert a measurement into the grid at position (x, y).
    pub fn insert(&mut self, idx: usize, x: f64, y: f64) {
        let key = self.key(x, y);
        self.cells.entry(key).or_default().push(idx);
    }

    /// Indices in the cell containing (x, y) and its 8 neighbours, ascending.
    pub fn query_nearby(&self, x: f64, y: f64) -> Vec<usize> {
        let (ix, iy) = self.key(x, y);
        let mut results = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(indices) = self.cells.get(&(ix + dx, iy + dy)) {
                    results.extend_from_slice(indices);
                }
            }
        }
        results.sort_unstable();
        results
    }
}

/// Weights of the association cost.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorePolicy {
    pub distance_weight: f64,
    pub iou_weight: f64,
}

impl Default for ScorePolicy {
    fn default() -> Self {
        Self {
            distance_weight: 1.0,
            iou_weight: 0.5,
        }
    }
}

impl ScorePolicy {
    pub fn cost(&self, distance: f64, max_dist: f64, iou: f64) -> f64 {
        let normalised = if max_dist > 0.0 { distance / max_dist } else { 0.0 };
        self.distance_weight * normalised + self.iou_weight * (1.0 - iou)
    }
}

/// Association parameters as they appear in configuration. Every matrix is
/// row-major over the 8 labels, row = track label, column = measurement label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Non-zero entries allow the pair
    pub can_assign_matrix: Vec<u8>,
    pub max_dist_matrix: Vec<f64>,
    pub max_area_matrix: Vec<f64>,
    pub min_area_matrix: Vec<f64>,
    pub max_rad_matrix: Vec<f64>,
    pub min_iou_matrix: Vec<f64>,
    pub score_policy: ScorePolicy,
}

#[rustfmt::skip]
const DEFAULT_CAN_ASSIGN: [u8; N_PAIRS] = [
    // UNK CAR TRK BUS TRL MOT BIC PED
       1,  0,  0,  0,  0,  0,  0,  0, // UNKNOWN
       1,  1,  1,  1,  1,  0,  0,  0, // CAR
       1,  1,  1,  1,  1,  0,  0,  0, // TRUCK
       1,  1,  1,  1,  1,  0,  0,  0, // BUS
       1,  1,  1,  1,  1,  0,  0,  0, // TRAILER
       1,  0,  0,  0,  0,  1,  1,  1, // MOTORCYCLE
       1,  0,  0,  0,  0,  1,  1,  1, // BICYCLE
       1,  0,  0,  0,  0,  1,  1,  1, // PEDESTRIAN
];

#[rustfmt::skip]
const DEFAULT_MAX_DIST: [f64; N_PAIRS] = [
    4.0, 4.0, 5.0, 5.0, 5.0, 2.0, 2.0, 2.0,
    4.0, 2.0, 5.0, 5.0, 5.0, 2.0, 2.0, 2.0,
    5.0, 5.0, 5.0, 5.0, 5.0, 2.0, 2.0, 2.0,
    5.0, 5.0, 5.0, 5.0, 5.0, 2.0, 2.0, 2.0,
    5.0, 5.0, 5.0, 5.0, 5.0, 2.0, 2.0, 2.0,
    2.0, 2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0,
    2.0, 2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0,
    2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0,
];

const OPEN: f64 = 10000.0;

#[rustfmt::skip]
const DEFAULT_MAX_AREA: [f64; N_PAIRS] = [
    OPEN,  OPEN,  OPEN,  OPEN,  OPEN,  OPEN, OPEN, OPEN,
    12.10, 12.10, 36.00, 60.00, 60.00, OPEN, OPEN, OPEN,
    36.00, 12.10, 36.00, 60.00, 60.00, OPEN, OPEN, OPEN,
    60.00, 12.10, 36.00, 60.00, 60.00, OPEN, OPEN, OPEN,
    60.00, 12.10, 36.00, 60.00, 60.00, OPEN, OPEN, OPEN,
    2.50,  OPEN,  OPEN,  OPEN,  OPEN,  2.50, 2.50, 1.00,
    2.50,  OPEN,  OPEN,  OPEN,  OPEN,  2.50, 2.50, 1.00,
    2.00,  OPEN,  OPEN,  OPEN,  OPEN,  1.50, 1.50, 1.00,
];

#[rustfmt::skip]
const DEFAULT_MIN_AREA: [f64; N_PAIRS] = [
    0.0,   0.0, 0.0, 0.0,  0.0,  0.0, 0.0, 0.0,
    3.6,   3.6, 6.0, 10.0, 10.0, 0.0, 0.0, 0.0,
    6.0,   3.6, 6.0, 10.0, 10.0, 0.0, 0.0, 0.0,
    10.0,  3.6, 6.0, 10.0, 10.0, 0.0, 0.0, 0.0,
    10.0,  3.6, 6.0, 10.0, 10.0, 0.0, 0.0, 0.0,
    0.001, 0.0, 0.0, 0.0,  0.0,  0.1, 0.1, 0.1,
    0.001, 0.0, 0.0, 0.0,  0.0,  0.1, 0.1, 0.1,
    0.001, 0.0, 0.0, 0.0,  0.0,  0.1, 0.1, 0.1,
];

const ANY: f64 = 3.15;

#[rustfmt::skip]
const DEFAULT_MAX_RAD: [f64; N_PAIRS] = [
    ANY, ANY,   ANY,   ANY,   ANY,   ANY, ANY, ANY,
    ANY, 1.047, 1.047, 1.047, 1.047, ANY, ANY, ANY,
    ANY, 1.047, 1.047, 1.047, 1.047, ANY, ANY, ANY,
    ANY, 1.047, 1.047, 1.047, 1.047, ANY, ANY, ANY,
    ANY, 1.047, 1.047, 1.047, 1.047, ANY, ANY, ANY,
    ANY, ANY,   ANY,   ANY,   ANY,   ANY, ANY, ANY,
    ANY, ANY,   ANY,   ANY,   ANY,   ANY, ANY, ANY,
    ANY, ANY,   ANY,   ANY,   ANY,   ANY, ANY, ANY,
];

#[rustfmt::skip]
const DEFAULT_MIN_IOU: [f64; N_PAIRS] = [
    0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001,
    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,
    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,
    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,
    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,    0.1,
    0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001,
    0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001,
    0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001, 0.0001,
];

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            can_assign_matrix: DEFAULT_CAN_ASSIGN.to_vec(),
            max_dist_matrix: DEFAULT_MAX_DIST.to_vec(),
            max_area_matrix: DEFAULT_MAX_AREA.to_vec(),
            min_area_matrix: DEFAULT_MIN_AREA.to_vec(),
            max_rad_matrix: DEFAULT_MAX_RAD.to_vec(),
            min_iou_matrix: DEFAULT_MIN_IOU.to_vec(),
            score_policy: ScorePolicy::default(),
        }
    }
}

impl AssociationConfig {
    pub fn validate(&self) -> Result<()> {
        let lengths = [
            ("can_assign_matrix", self.can_assign_matrix.len()),
            ("max_dist_matrix", self.max_dist_matrix.len()),
            ("max_area_matrix", self.max_area_matrix.len()),
            ("min_area_matrix", self.min_area_matrix.len()),
            ("max_rad_matrix", self.max_rad_matrix.len()),
            ("min_iou_matrix", self.min_iou_matrix.len()),
        ];
        for (name, len) in lengths {
            if len != N_PAIRS {
                return Err(FusionError::InvalidConfig(format!(
                    "{name} has {len} entries, expected {N_PAIRS}"
                )));
            }
        }
        let policy = self.score_policy;
        if !(policy.distance_weight >= 0.0 && policy.iou_weight >= 0.0) {
            return Err(FusionError::InvalidConfig(
                "score_policy weights must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Gate limits for one (track label, measurement label) pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateLimits {
    pub can_assign: bool,
    pub max_dist: f64,
    pub max_area: f64,
    pub min_area: f64,
    pub max_rad: f64,
    pub min_iou: f64,
}

/// Validated lookup table of [`GateLimits`].
#[derive(Clone, Debug)]
pub struct GatingTable {
    limits: Vec<GateLimits>,
    policy: ScorePolicy,
    max_gate_distance: f64,
}

impl GatingTable {
    pub fn from_config(config: &AssociationConfig) -> Result<Self> {
        config.validate()?;
        let limits: Vec<GateLimits> = (0..N_PAIRS)
            .map(|i| GateLimits {
                can_assign: config.can_assign_matrix[i] != 0,
                max_dist: config.max_dist_matrix[i],
                max_area: config.max_area_matrix[i],
                min_area: config.min_area_matrix[i],
                max_rad: config.max_rad_matrix[i],
                min_iou: config.min_iou_matrix[i],
            })
            .collect();
        let max_gate_distance = limits
            .iter()
            .filter(|l| l.can_assign)
            .map(|l| l.max_dist)
            .fold(0.0, f64::max);
        Ok(Self {
            limits,
            policy: config.score_policy,
            max_gate_distance,
        })
    }

    pub fn limits(&self, track: ObjectClass, measurement: ObjectClass) -> GateLimits {
        self.limits[track.index() * N_CLASSES + measurement.index()]
    }

    pub fn policy(&self) -> ScorePolicy {
        self.policy
    }

    /// Largest distance any assignable pair may be apart.
    pub fn max_gate_distance(&self) -> f64 {
        self.max_gate_distance
    }

    /// Cost of assigning `measurement` to a track predicted at `track_pose`,
    /// or `None` if any gate rejects the pair.
    pub fn score(
        &self,
        track_label: ObjectClass,
        track_pose: &Kinematics,
        track_shape: &Shape,
        measurement: &DetectedObject,
    ) -> Option<f64> {
        let limits = self.limits(track_label, measurement.label());
        if !limits.can_assign {
            return None;
        }
        let m = &measurement.kinematics;
        let distance = (m.x - track_pose.x).hypot(m.y - track_pose.y);
        if !(distance <= limits.max_dist) {
            return None;
        }
        let area = footprint_area(&measurement.shape);
        if !(area >= limits.min_area && area <= limits.max_area) {
            return None;
        }
        if m.orientation != OrientationAvailability::Unavailable
            && axis_angle_diff(m.yaw, track_pose.yaw) > limits.max_rad
        {
            return None;
        }
        let iou = iou_2d(track_shape, track_pose, &measurement.shape, m);
        if !(iou >= limits.min_iou) {
            return None;
        }
        let cost = self.policy.cost(distance, limits.max_dist, iou);
        cost.is_finite().then_some(cost)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassDistribution;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    fn car(x: f64, y: f64, yaw: f64) -> DetectedObject {
        DetectedObject {
            kinematics: Kinematics::new(x, y, yaw),
            shape: Shape::bounding_box(4.0, 2.0, 1.5),
            classification: ClassDistribution::certain(ObjectClass::Car),
            existence_probability: 0.9,
        }
    }

    fn table() -> GatingTable {
        GatingTable::from_config(&AssociationConfig::default()).unwrap()
    }

    #[test]
    fn coincident_car_costs_nothing() {
        let det = car(0.0, 0.0, 0.0);
        let cost = table()
            .score(ObjectClass::Car, &det.kinematics, &det.shape, &det)
            .unwrap();
        assert_abs_diff_eq!(cost, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn distance_gate_rejects_far_measurement() {
        let track = car(0.0, 0.0, 0.0);
        let det = car(2.5, 0.0, 0.0);
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_none());
    }

    #[test]
    fn class_gate_rejects_pedestrian_for_car() {
        let track = car(0.0, 0.0, 0.0);
        let mut det = car(0.0, 0.0, 0.0);
        det.classification = ClassDistribution::certain(ObjectClass::Pedestrian);
        det.shape = Shape::Cylinder {
            diameter: 0.6,
            height: 1.7,
        };
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_none());
    }

    #[test]
    fn heading_gate_is_skipped_without_orientation() {
        let track = car(0.0, 0.0, 0.0);
        let mut det = car(0.0, 0.0, FRAC_PI_2);
        det.shape = Shape::bounding_box(3.0, 3.0, 1.5);
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_none());
        det.kinematics.orientation = OrientationAvailability::Unavailable;
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_some());
    }

    #[test]
    fn area_gate_rejects_undersized_footprint() {
        let track = car(0.0, 0.0, 0.0);
        let mut det = car(0.0, 0.0, 0.0);
        // 1 m² is below the car/car minimum of 3.6 m²
        det.shape = Shape::bounding_box(1.0, 1.0, 1.5);
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_none());
        det.shape = Shape::bounding_box(3.0, 2.0, 1.5);
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_some());
    }

    #[test]
    fn area_gate_rejects_oversized_footprint() {
        let track = car(0.0, 0.0, 0.0);
        let mut det = car(0.0, 0.0, 0.0);
        det.shape = Shape::bounding_box(6.0, 2.5, 1.5);
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_none());
    }

    #[test]
    fn iou_gate_rejects_barely_overlapping_boxes() {
        // side by side, 1.9 m apart: inside the distance gate, IoU ≈ 0.026
        let track = car(0.0, 0.0, 0.0);
        let det = car(0.0, 1.9, 0.0);
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_none());
        let mut open = AssociationConfig::default();
        open.min_iou_matrix[ObjectClass::Car.index() * N_CLASSES + ObjectClass::Car.index()] = 0.0;
        let open = GatingTable::from_config(&open).unwrap();
        assert!(open
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_some());
    }

    #[test]
    fn nan_dimensions_never_pass_the_gates() {
        let track = car(0.0, 0.0, 0.0);
        let mut det = car(0.0, 0.0, 0.0);
        det.shape = Shape::bounding_box(f64::NAN, 2.0, 1.5);
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track.shape, &det)
            .is_none());
        let mut track_shape = track.shape.clone();
        if let Shape::BoundingBox { width, .. } = &mut track_shape {
            *width = f64::NAN;
        }
        assert!(table()
            .score(ObjectClass::Car, &track.kinematics, &track_shape, &car(0.0, 0.0, 0.0))
            .is_none());
    }

    #[test]
    fn wrong_matrix_size_is_rejected() {
        let config = AssociationConfig {
            max_dist_matrix: vec![1.0; 10],
            ..AssociationConfig::default()
        };
        assert!(matches!(
            GatingTable::from_config(&config),
            Err(FusionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn grid_query_is_sorted() {
        let mut grid = SpatialGrid::new(5.0);
        grid.insert(3, 1.0, 1.0);
        grid.insert(0, 6.0, 1.0);
        grid.insert(7, 40.0, 40.0);
        assert_eq!(grid.query_nearby(0.0, 0.0), vec![0, 3]);
    }
}
