//! Planar geometry: rigid transforms, object footprints, convex polygon
//! clipping and IoU.
//!
//! # Footprints
//! Every [`Shape`] is reduced to a convex counter-clockwise polygon in the
//! world frame. Cylinders are approximated by a regular polygon with
//! [`CYLINDER_SEGMENTS`] vertices.
//!
//! # Overlap
//! Intersection uses Sutherland–Hodgman clipping of one convex polygon by
//! the other; IoU = |A ∩ B| / (|A| + |B| − |A ∩ B|).

use crate::types::{DetectedObject, Kinematics, PoseCov, Shape};
use nalgebra::{Matrix3, Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const CYLINDER_SEGMENTS: usize = 12;

/// Wrap an angle to (-π, π].
pub fn normalize_angle(a: f64) -> f64 {
    let wrapped = (a + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Smallest absolute difference between two headings, treating `yaw` and
/// `yaw + π` as the same axis. Result lies in [0, π/2].
pub fn axis_angle_diff(a: f64, b: f64) -> f64 {
    let d = normalize_angle(a - b).abs();
    d.min(PI - d)
}

// ---------------------------------------------------------------------------
// Transform2D
// ---------------------------------------------------------------------------

/// Planar rigid transform: maps points in a child frame into the parent frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform2D {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl Transform2D {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn rotation(&self) -> Rotation2<f64> {
        Rotation2::new(self.yaw)
    }

    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        self.rotation() * p + Vector2::new(self.x, self.y)
    }

    /// `self ∘ child`: first apply `child`, then `self`.
    pub fn compose(&self, child: &Transform2D) -> Transform2D {
        let p = self.apply(Point2::new(child.x, child.y));
        Transform2D::new(p.x, p.y, normalize_angle(self.yaw + child.yaw))
    }

    pub fn inverse(&self) -> Transform2D {
        let r_inv = self.rotation().inverse();
        let t = r_inv * Vector2::new(-self.x, -self.y);
        Transform2D::new(t.x, t.y, normalize_angle(-self.yaw))
    }

    /// Linear interpolation between two transforms (`ratio` in [0, 1]).
    pub fn interpolate(&self, other: &Transform2D, ratio: f64) -> Transform2D {
        let dyaw = normalize_angle(other.yaw - self.yaw);
        Transform2D::new(
            self.x + (other.x - self.x) * ratio,
            self.y + (other.y - self.y) * ratio,
            normalize_angle(self.yaw + dyaw * ratio),
        )
    }

    /// Express `kinematics` (given in the child frame) in the parent frame,
    /// rotating the pose covariance accordingly.
    pub fn transform_kinematics(&self, k: &Kinematics) -> Kinematics {
        let p = self.apply(Point2::new(k.x, k.y));
        let (s, c) = self.yaw.sin_cos();
        #[rustfmt::skip]
        let j = Matrix3::new(
            c,  -s,  0.0,
            s,   c,  0.0,
            0.0, 0.0, 1.0,
        );
        let pose_cov: PoseCov = j * k.pose_cov * j.transpose();
        Kinematics {
            x: p.x,
            y: p.y,
            yaw: normalize_angle(k.yaw + self.yaw),
            pose_cov,
            ..k.clone()
        }
    }

    pub fn transform_object(&self, object: &DetectedObject) -> DetectedObject {
        DetectedObject {
            kinematics: self.transform_kinematics(&object.kinematics),
            ..object.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Footprints
// ---------------------------------------------------------------------------

/// Footprint polygon of `shape` in its own frame (counter-clockwise).
pub fn local_footprint(shape: &Shape) -> Vec<Point2<f64>> {
    match shape {
        Shape::BoundingBox { length, width, .. } => {
            let (hl, hw) = (length / 2.0, width / 2.0);
            vec![
                Point2::new(hl, hw),
                Point2::new(-hl, hw),
                Point2::new(-hl, -hw),
                Point2::new(hl, -hw),
            ]
        }
        Shape::Cylinder { diameter, .. } => {
            let r = diameter / 2.0;
            (0..CYLINDER_SEGMENTS)
                .map(|i| {
                    let a = 2.0 * PI * i as f64 / CYLINDER_SEGMENTS as f64;
                    Point2::new(r * a.cos(), r * a.sin())
                })
                .collect()
        }
        Shape::Polygon { footprint, .. } => {
            let mut pts: Vec<Point2<f64>> =
                footprint.iter().map(|p| Point2::new(p[0], p[1])).collect();
            if signed_area(&pts) < 0.0 {
                pts.reverse();
            }
            pts
        }
    }
}

/// Footprint polygon of `shape` placed at `(x, y, yaw)` in the world frame.
pub fn footprint(shape: &Shape, x: f64, y: f64, yaw: f64) -> Vec<Point2<f64>> {
    let tf = Transform2D::new(x, y, yaw);
    local_footprint(shape).into_iter().map(|p| tf.apply(p)).collect()
}

/// Footprint area in m².
pub fn footprint_area(shape: &Shape) -> f64 {
    match shape {
        Shape::BoundingBox { length, width, .. } => length * width,
        Shape::Cylinder { diameter, .. } => PI * diameter * diameter / 4.0,
        Shape::Polygon { .. } => polygon_area(&local_footprint(shape)),
    }
}

fn signed_area(poly: &[Point2<f64>]) -> f64 {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for i in 0..poly.len() {
        let a = poly[i];
        let b = poly[(i + 1) % poly.len()];
        acc += a.x * b.y - b.x * a.y;
    }
    acc / 2.0
}

/// Unsigned shoelace area.
pub fn polygon_area(poly: &[Point2<f64>]) -> f64 {
    signed_area(poly).abs()
}

fn cross(o: Point2<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn line_intersection(
    p1: Point2<f64>,
    p2: Point2<f64>,
    q1: Point2<f64>,
    q2: Point2<f64>,
) -> Point2<f64> {
    let r = p2 - p1;
    let s = q2 - q1;
    let denom = r.x * s.y - r.y * s.x;
    if denom.abs() < 1e-12 {
        return p2;
    }
    let t = ((q1.x - p1.x) * s.y - (q1.y - p1.y) * s.x) / denom;
    p1 + r * t
}

/// Intersection of two convex counter-clockwise polygons.
pub fn convex_intersection(subject: &[Point2<f64>], clip: &[Point2<f64>]) -> Vec<Point2<f64>> {
    if subject.len() < 3 || clip.len() < 3 {
        return Vec::new();
    }
    let mut output = subject.to_vec();
    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let c1 = clip[i];
        let c2 = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);
        for j in 0..input.len() {
            let cur = input[j];
            let prev = input[(j + input.len() - 1) % input.len()];
            let cur_in = cross(c1, c2, cur) >= 0.0;
            let prev_in = cross(c1, c2, prev) >= 0.0;
            if cur_in {
                if !prev_in {
                    output.push(line_intersection(prev, cur, c1, c2));
                }
                output.push(cur);
            } else if prev_in {
                output.push(line_intersection(prev, cur, c1, c2));
            }
        }
    }
    output
}

/// 2D IoU of two world-frame footprints.
pub fn polygon_iou(a: &[Point2<f64>], b: &[Point2<f64>]) -> f64 {
    let area_a = polygon_area(a);
    let area_b = polygon_area(b);
    if !(area_a > 0.0 && area_b > 0.0) {
        return 0.0;
    }
    let inter = polygon_area(&convex_intersection(a, b));
    let iou = inter / (area_a + area_b - inter);
    if iou.is_finite() {
        iou.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// 2D IoU of two placed shapes.
pub fn iou_2d(shape_a: &Shape, pose_a: &Kinematics, shape_b: &Shape, pose_b: &Kinematics) -> f64 {
    let a = footprint(shape_a, pose_a.x, pose_a.y, pose_a.yaw);
    let b = footprint(shape_b, pose_b.x, pose_b.y, pose_b.yaw);
    polygon_iou(&a, &b)
}

/// Offset (world frame) that moves a partially observed box so that its
/// surface facing the ego vehicle coincides with the surface of the larger
/// tracked box. Zero when the measurement is not smaller than the track.
pub fn anchor_offset(
    ego: &Transform2D,
    measured: &Kinematics,
    measured_size: (f64, f64),
    tracked_size: (f64, f64),
) -> Vector2<f64> {
    let object_tf = Transform2D::new(measured.x, measured.y, measured.yaw);
    let ego_local = object_tf.inverse().apply(Point2::new(ego.x, ego.y));
    let (ml, mw) = measured_size;
    let (tl, tw) = tracked_size;
    // push the centre away from the ego along each axis by half the missing extent
    let dl = if tl > ml { -ego_local.x.signum() * (tl - ml) / 2.0 } else { 0.0 };
    let dw = if tw > mw { -ego_local.y.signum() * (tw - mw) / 2.0 } else { 0.0 };
    object_tf.rotation() * Vector2::new(dl, dw)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn placed(x: f64, y: f64, yaw: f64) -> Kinematics {
        Kinematics::new(x, y, yaw)
    }

    #[test]
    fn normalize_angle_wraps_into_range() {
        assert_abs_diff_eq!(normalize_angle(3.0 * PI), PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(-PI / 2.0 - 2.0 * PI), -PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(axis_angle_diff(0.1, PI + 0.1), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn compose_with_inverse_is_identity() {
        let tf = Transform2D::new(3.0, -2.0, 0.7);
        let id = tf.compose(&tf.inverse());
        assert_abs_diff_eq!(id.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(id.y, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(id.yaw, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn identical_boxes_have_unit_iou() {
        let s = Shape::bounding_box(4.0, 2.0, 1.5);
        let k = placed(10.0, 5.0, 0.3);
        assert_abs_diff_eq!(iou_2d(&s, &k, &s, &k), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn half_shifted_boxes() {
        // 2×2 squares shifted by 1 m → inter 2, union 6
        let s = Shape::bounding_box(2.0, 2.0, 1.0);
        let iou = iou_2d(&s, &placed(0.0, 0.0, 0.0), &s, &placed(1.0, 0.0, 0.0));
        assert_abs_diff_eq!(iou, 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let s = Shape::bounding_box(2.0, 2.0, 1.0);
        let iou = iou_2d(&s, &placed(0.0, 0.0, 0.0), &s, &placed(10.0, 0.0, 0.0));
        assert_eq!(iou, 0.0);
    }

    #[test]
    fn rotated_square_inside_larger_square() {
        let small = Shape::bounding_box(1.0, 1.0, 1.0);
        let big = Shape::bounding_box(4.0, 4.0, 1.0);
        let iou = iou_2d(&small, &placed(0.0, 0.0, PI / 4.0), &big, &placed(0.0, 0.0, 0.0));
        assert_abs_diff_eq!(iou, 1.0 / 16.0, epsilon = 1e-9);
    }

    #[test]
    fn cylinder_area_is_close_to_circle() {
        let s = Shape::Cylinder { diameter: 2.0, height: 1.0 };
        let poly = footprint(&s, 0.0, 0.0, 0.0);
        let exact = footprint_area(&s);
        assert!((polygon_area(&poly) - exact).abs() / exact < 0.05);
    }

    #[test]
    fn anchor_offset_pushes_away_from_ego() {
        // ego behind the object on its -x side: the short measurement sees the rear
        let ego = Transform2D::new(-10.0, 0.0, 0.0);
        let offset = anchor_offset(&ego, &placed(0.0, 0.0, 0.0), (2.0, 2.0), (4.0, 2.0));
        assert_abs_diff_eq!(offset.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(offset.y, 0.0, epsilon = 1e-12);
    }
}
