//! Ground-truth road users and their motion.
//!
//! A target carries a planar state `(x, y, yaw, speed)`, a class with a
//! fixed extent, and a `MotionSpec` describing how it moves. The ego vehicle
//! is a target too; its pose becomes the `map → base_link` transform.

use fusion_core::{
    geometry::{normalize_angle, Transform2D},
    metrics::GroundTruth,
    types::{ObjectClass, Shape, Time},
};
use serde::{Deserialize, Serialize};

/// How a target moves between steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MotionSpec {
    /// Straight line at constant speed.
    ConstantVelocity,
    /// Constant yaw rate (rad/s) at constant speed.
    ConstantTurn { yaw_rate: f64 },
    /// Longitudinal acceleration (m/s²); speed never drops below zero.
    ConstantAccel { accel: f64 },
    /// Switch motion at given times.
    /// `segments` is sorted by start time; the active spec is the last one
    /// whose start is `<= t`.
    Segmented { segments: Vec<(f64, MotionSpec)> },
}

/// Planar true state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    /// Speed along the heading (m/s)
    pub speed: f64,
}

/// A simulated road user with ground-truth state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Unique target ID (used for metrics)
    pub id: u64,
    pub class: ObjectClass,
    pub shape: Shape,
    pub state: TargetState,
    pub motion: MotionSpec,
    /// No detections before this time
    pub appear_at: Option<f64>,
    /// No detections from this time on
    pub disappear_at: Option<f64>,
}

impl Target {
    pub fn new(id: u64, class: ObjectClass, state: TargetState, motion: MotionSpec) -> Self {
        Self {
            id,
            class,
            shape: default_shape(class),
            state,
            motion,
            appear_at: None,
            disappear_at: None,
        }
    }

    pub fn with_window(mut self, appear_at: Option<f64>, disappear_at: Option<f64>) -> Self {
        self.appear_at = appear_at;
        self.disappear_at = disappear_at;
        self
    }

    /// Propagate the true state by `dt` seconds.
    pub fn step(&mut self, t: f64, dt: f64) {
        step_state(&mut self.state, &self.motion, t, dt);
    }

    /// True if target is visible at time `t`.
    pub fn is_active(&self, t: f64) -> bool {
        if self.appear_at.is_some_and(|appear| t < appear) {
            return false;
        }
        if self.disappear_at.is_some_and(|disappear| t >= disappear) {
            return false;
        }
        true
    }

    /// Pose as a child → world transform.
    pub fn pose(&self) -> Transform2D {
        Transform2D::new(self.state.x, self.state.y, self.state.yaw)
    }

    pub fn ground_truth(&self, time: Time) -> GroundTruth {
        GroundTruth {
            target_id: self.id,
            time,
            x: self.state.x,
            y: self.state.y,
            yaw: self.state.yaw,
            speed: self.state.speed,
            class: self.class,
        }
    }
}

fn step_state(s: &mut TargetState, motion: &MotionSpec, t: f64, dt: f64) {
    match motion {
        MotionSpec::ConstantVelocity => {
            s.x += s.speed * s.yaw.cos() * dt;
            s.y += s.speed * s.yaw.sin() * dt;
        }
        MotionSpec::ConstantTurn { yaw_rate } => {
            if yaw_rate.abs() < 1e-9 {
                s.x += s.speed * s.yaw.cos() * dt;
                s.y += s.speed * s.yaw.sin() * dt;
            } else {
                let new_yaw = s.yaw + yaw_rate * dt;
                s.x += s.speed / yaw_rate * (new_yaw.sin() - s.yaw.sin());
                s.y += s.speed / yaw_rate * (s.yaw.cos() - new_yaw.cos());
                s.yaw = normalize_angle(new_yaw);
            }
        }
        MotionSpec::ConstantAccel { accel } => {
            let v0 = s.speed;
            let v1 = (v0 + accel * dt).max(0.0);
            let distance = 0.5 * (v0 + v1) * dt;
            s.x += distance * s.yaw.cos();
            s.y += distance * s.yaw.sin();
            s.speed = v1;
        }
        MotionSpec::Segmented { segments } => {
            match segments.iter().filter(|(start, _)| *start <= t).last() {
                Some((_, spec)) => step_state(s, spec, t, dt),
                // before the first segment: CV
                None => step_state(s, &MotionSpec::ConstantVelocity, t, dt),
            }
        }
    }
}

/// Typical extent for a class.
pub fn default_shape(class: ObjectClass) -> Shape {
    match class {
        ObjectClass::Car | ObjectClass::Unknown => Shape::bounding_box(4.5, 1.9, 1.5),
        ObjectClass::Truck => Shape::bounding_box(8.0, 2.5, 3.2),
        ObjectClass::Bus => Shape::bounding_box(12.0, 2.6, 3.2),
        ObjectClass::Trailer => Shape::bounding_box(10.0, 2.5, 3.5),
        ObjectClass::Motorcycle => Shape::bounding_box(2.2, 0.8, 1.4),
        ObjectClass::Bicycle => Shape::bounding_box(1.8, 0.6, 1.6),
        ObjectClass::Pedestrian => Shape::Cylinder {
            diameter: 0.6,
            height: 1.7,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    fn state(speed: f64) -> TargetState {
        TargetState {
            speed,
            ..Default::default()
        }
    }

    #[test]
    fn constant_velocity_moves_along_heading() {
        let mut t = Target::new(0, ObjectClass::Car, state(10.0), MotionSpec::ConstantVelocity);
        t.step(0.0, 0.5);
        assert_abs_diff_eq!(t.state.x, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.state.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn quarter_turn_ends_on_the_circle() {
        // radius 10 m, a quarter circle in one step
        let mut t = Target::new(
            0,
            ObjectClass::Car,
            state(10.0),
            MotionSpec::ConstantTurn { yaw_rate: 1.0 },
        );
        t.step(0.0, FRAC_PI_2);
        assert_abs_diff_eq!(t.state.x, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(t.state.y, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(t.state.yaw, FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn braking_stops_at_zero_speed() {
        let mut t = Target::new(
            0,
            ObjectClass::Car,
            state(2.0),
            MotionSpec::ConstantAccel { accel: -4.0 },
        );
        t.step(0.0, 1.0);
        assert_eq!(t.state.speed, 0.0);
        // travelled the average of 2 and 0 over the step
        assert_abs_diff_eq!(t.state.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn segmented_switches_at_start_time() {
        let motion = MotionSpec::Segmented {
            segments: vec![
                (0.0, MotionSpec::ConstantVelocity),
                (1.0, MotionSpec::ConstantAccel { accel: 2.0 }),
            ],
        };
        let mut t = Target::new(0, ObjectClass::Car, state(1.0), motion);
        t.step(0.5, 0.5);
        assert_eq!(t.state.speed, 1.0);
        t.step(1.0, 0.5);
        assert_abs_diff_eq!(t.state.speed, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn visibility_window() {
        let t = Target::new(0, ObjectClass::Pedestrian, state(1.0), MotionSpec::ConstantVelocity)
            .with_window(Some(1.0), Some(2.0));
        assert!(!t.is_active(0.5));
        assert!(t.is_active(1.0));
        assert!(!t.is_active(2.0));
        assert!(matches!(t.shape, Shape::Cylinder { .. }));
    }
}
