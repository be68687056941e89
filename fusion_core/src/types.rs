//! Fundamental types used across the entire workspace.

use crate::error::FusionError;
use nalgebra::{Matrix3, Matrix5, Vector5};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

// ---------------------------------------------------------------------------
// Scalar and matrix aliases. Time is seconds on the engine clock.
// ---------------------------------------------------------------------------

/// Timestamp in seconds.
pub type Time = f64;

/// Motion-model state vector. The meaning of the last two entries depends on
/// the model: `[x, y, yaw, vx, vy]` (CV) or `[x, y, yaw, v, yaw_rate]` (CTRV).
pub type StateVec = Vector5<f64>;

/// 5×5 state covariance.
pub type StateCov = Matrix5<f64>;

/// 3×3 pose covariance over `(x, y, yaw)`.
pub type PoseCov = Matrix3<f64>;

// ---------------------------------------------------------------------------
// Identifier types — newtype wrappers so IDs are never confused at compile time
// ---------------------------------------------------------------------------

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TrackId(pub u64);

/// Index of a configured input channel (position in `selected_input_channels`).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChannelId(pub usize);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Object classes
// ---------------------------------------------------------------------------

pub const N_CLASSES: usize = 8;

/// Object class label. The discriminant is the row/column index used by the
/// per-class-pair gating tables.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectClass {
    #[default]
    Unknown = 0,
    Car = 1,
    Truck = 2,
    Bus = 3,
    Trailer = 4,
    #[serde(alias = "MOTORBIKE")]
    Motorcycle = 5,
    Bicycle = 6,
    Pedestrian = 7,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; N_CLASSES] = [
        ObjectClass::Unknown,
        ObjectClass::Car,
        ObjectClass::Truck,
        ObjectClass::Bus,
        ObjectClass::Trailer,
        ObjectClass::Motorcycle,
        ObjectClass::Bicycle,
        ObjectClass::Pedestrian,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectClass::Unknown => "UNKNOWN",
            ObjectClass::Car => "CAR",
            ObjectClass::Truck => "TRUCK",
            ObjectClass::Bus => "BUS",
            ObjectClass::Trailer => "TRAILER",
            ObjectClass::Motorcycle => "MOTORCYCLE",
            ObjectClass::Bicycle => "BICYCLE",
            ObjectClass::Pedestrian => "PEDESTRIAN",
        }
    }

    pub fn is_known(self) -> bool {
        self != ObjectClass::Unknown
    }

    /// Priority used when two overlapping tracks compete: any known class
    /// outranks UNKNOWN.
    pub fn priority(self) -> u8 {
        u8::from(self.is_known())
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObjectClass {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "MOTORBIKE" => Ok(ObjectClass::Motorcycle),
            other => ObjectClass::ALL
                .into_iter()
                .find(|c| c.name() == other)
                .ok_or_else(|| FusionError::UnknownClass(s.to_string())),
        }
    }
}

/// Probability distribution over [`ObjectClass`] labels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassDistribution {
    probs: [f64; N_CLASSES],
}

impl Default for ClassDistribution {
    fn default() -> Self {
        Self::certain(ObjectClass::Unknown)
    }
}

impl ClassDistribution {
    /// All mass on one label.
    pub fn certain(class: ObjectClass) -> Self {
        let mut probs = [0.0; N_CLASSES];
        probs[class.index()] = 1.0;
        Self { probs }
    }

    /// Build from `(label, probability)` pairs. Negative or non-finite
    /// entries are ignored; the result is normalised.
    pub fn from_pairs(pairs: &[(ObjectClass, f64)]) -> Self {
        let mut probs = [0.0; N_CLASSES];
        for &(class, p) in pairs {
            if p.is_finite() && p > 0.0 {
                probs[class.index()] += p;
            }
        }
        let mut out = Self { probs };
        out.normalise();
        out
    }

    pub fn probability(&self, class: ObjectClass) -> f64 {
        self.probs[class.index()]
    }

    /// Most probable label. Ties go to the lower label index.
    pub fn label(&self) -> ObjectClass {
        let mut best = ObjectClass::Unknown;
        let mut best_p = 0.0;
        for class in ObjectClass::ALL {
            let p = self.probs[class.index()];
            if p > best_p {
                best = class;
                best_p = p;
            }
        }
        best
    }

    /// Exponential blend toward `other`: `(1 - weight) * self + weight * other`.
    pub fn blend(&mut self, other: &ClassDistribution, weight: f64) {
        let w = weight.clamp(0.0, 1.0);
        for (p, q) in self.probs.iter_mut().zip(other.probs.iter()) {
            *p = (1.0 - w) * *p + w * q;
        }
        self.normalise();
    }

    fn normalise(&mut self) {
        let total: f64 = self.probs.iter().sum();
        if total > 0.0 && total.is_finite() {
            self.probs.iter_mut().for_each(|p| *p /= total);
        } else {
            *self = Self::certain(ObjectClass::Unknown);
        }
    }
}

// ---------------------------------------------------------------------------
// Kinematics and shape
// ---------------------------------------------------------------------------

/// How much of the reported heading can be trusted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationAvailability {
    /// Heading carries no information (e.g. cylinders, point clusters).
    Unavailable,
    /// Axis is known but the sign may be flipped by π.
    #[default]
    SignUnknown,
    /// Heading is fully observed.
    Available,
}

/// Planar pose, optional longitudinal speed and their uncertainty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kinematics {
    pub x: f64,
    pub y: f64,
    /// Heading (radians, world frame once transformed)
    pub yaw: f64,
    /// Covariance over `(x, y, yaw)`
    pub pose_cov: PoseCov,
    #[serde(default)]
    pub orientation: OrientationAvailability,
    /// Speed along the heading (m/s), if the sensor observes it
    #[serde(default)]
    pub velocity: Option<f64>,
    /// Variance of `velocity` (m²/s²)
    #[serde(default)]
    pub velocity_var: f64,
}

impl Kinematics {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self {
            x,
            y,
            yaw,
            pose_cov: PoseCov::from_diagonal(&nalgebra::Vector3::new(0.25, 0.25, 0.01)),
            orientation: OrientationAvailability::SignUnknown,
            velocity: None,
            velocity_var: 0.0,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.yaw.is_finite()
            && self.velocity.map_or(true, f64::is_finite)
    }
}

/// Object extent. Footprints are built in the object's own frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    BoundingBox { length: f64, width: f64, height: f64 },
    Cylinder { diameter: f64, height: f64 },
    /// Convex footprint in the object frame (counter-clockwise).
    Polygon { footprint: Vec<[f64; 2]>, height: f64 },
}

impl Shape {
    pub fn bounding_box(length: f64, width: f64, height: f64) -> Self {
        Shape::BoundingBox { length, width, height }
    }

    pub fn height(&self) -> f64 {
        match self {
            Shape::BoundingBox { height, .. }
            | Shape::Cylinder { height, .. }
            | Shape::Polygon { height, .. } => *height,
        }
    }

    /// Finite, positive footprint dimensions and a finite non-negative height.
    pub fn is_valid(&self) -> bool {
        let positive = |d: f64| d.is_finite() && d > 0.0;
        let height = self.height();
        let footprint = match self {
            Shape::BoundingBox { length, width, .. } => positive(*length) && positive(*width),
            Shape::Cylinder { diameter, .. } => positive(*diameter),
            Shape::Polygon { footprint, .. } => {
                footprint.len() >= 3 && footprint.iter().flatten().all(|v| v.is_finite())
            }
        };
        footprint && height.is_finite() && height >= 0.0
    }
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// One detected object in one channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub kinematics: Kinematics,
    pub shape: Shape,
    pub classification: ClassDistribution,
    /// Existence probability reported by the detector, in [0, 1]
    #[serde(default)]
    pub existence_probability: f64,
}

impl DetectedObject {
    pub fn label(&self) -> ObjectClass {
        self.classification.label()
    }
}

/// All detections from one channel at one timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    pub channel: ChannelId,
    /// Measurement time (header stamp)
    pub timestamp: Time,
    /// Frame the object poses are expressed in
    pub frame_id: String,
    pub objects: Vec<DetectedObject>,
}

impl DetectionBatch {
    pub fn new(channel: ChannelId, timestamp: Time, frame_id: impl Into<String>) -> Self {
        Self {
            channel,
            timestamp,
            frame_id: frame_id.into(),
            objects: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Lifecycle phase of a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPhase {
    /// Not yet confirmed; may be spurious
    Tentative,
    /// Confirmation counter reached the class threshold
    Confirmed,
}

/// One track projected to an output timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: TrackId,
    pub kinematics: Kinematics,
    pub shape: Shape,
    pub classification: ClassDistribution,
    pub existence_probability: f64,
    pub phase: TrackPhase,
    pub confirmation_count: u32,
}

/// A published set of tracked objects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedObjects {
    pub stamp: Time,
    pub frame_id: String,
    pub objects: Vec<TrackedObject>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn class_names_parse_with_aliases() {
        assert_eq!("car".parse::<ObjectClass>().unwrap(), ObjectClass::Car);
        assert_eq!(
            "MOTORBIKE".parse::<ObjectClass>().unwrap(),
            ObjectClass::Motorcycle
        );
        assert!("spaceship".parse::<ObjectClass>().is_err());
    }

    #[test]
    fn distribution_label_prefers_lower_index_on_tie() {
        let d = ClassDistribution::from_pairs(&[
            (ObjectClass::Truck, 0.5),
            (ObjectClass::Car, 0.5),
        ]);
        assert_eq!(d.label(), ObjectClass::Car);
    }

    #[test]
    fn blend_moves_mass_and_stays_normalised() {
        let mut d = ClassDistribution::certain(ObjectClass::Car);
        d.blend(&ClassDistribution::certain(ObjectClass::Truck), 0.25);
        assert_abs_diff_eq!(d.probability(ObjectClass::Car), 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(d.probability(ObjectClass::Truck), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn empty_distribution_falls_back_to_unknown() {
        let d = ClassDistribution::from_pairs(&[(ObjectClass::Car, f64::NAN)]);
        assert_eq!(d.label(), ObjectClass::Unknown);
    }

    #[test]
    fn batch_parses_from_json_with_defaults() {
        let json = r#"{
            "channel": 1,
            "timestamp": 12.5,
            "frame_id": "front_radar",
            "objects": [{
                "kinematics": {
                    "x": 1.0, "y": 2.0, "yaw": 0.0,
                    "pose_cov": [0.5, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, 0.1]
                },
                "shape": { "type": "cylinder", "diameter": 0.6, "height": 1.7 },
                "classification": { "probs": [0, 0, 0, 0, 0, 0, 0, 1] }
            }]
        }"#;
        let batch: DetectionBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.channel, ChannelId(1));
        let object = &batch.objects[0];
        assert_eq!(object.label(), ObjectClass::Pedestrian);
        assert_eq!(object.kinematics.velocity, None);
        assert_eq!(object.kinematics.orientation, OrientationAvailability::SignUnknown);
        assert_eq!(object.shape.height(), 1.7);
    }
}
