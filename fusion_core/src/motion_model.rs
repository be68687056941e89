//! Per-track motion models: predict and correct steps.
//!
//! # Design choices
//! - A closed set of variants ([`MotionModel`]) selected by class label at
//!   spawn time; every variant exposes the same `predict` / `update` /
//!   `kinematics` capability.
//! - All math is done in `f64` via `nalgebra`.
//! - Corrections use the EKF form with a Joseph-form covariance update so the
//!   same routine serves linear (position, heading) and linearised (speed
//!   along heading) observations.
//!
//! ## Constant velocity (CV)
//! x = [px, py, yaw, vx, vy]ᵀ,  px += vx·dt,  py += vy·dt,  yaw constant.
//! Q uses the discrete white-noise acceleration (DWNA) blocks on (p, v).
//!
//! ## Constant turn rate and velocity (CTRV)
//! x = [px, py, yaw, v, ω]ᵀ, propagated in closed form along the arc;
//! covariance propagated with the analytic Jacobian.

use crate::{
    error::{FusionError, Result},
    geometry::normalize_angle,
    types::{DetectedObject, Kinematics, OrientationAvailability, StateCov, StateVec, Time},
};
use nalgebra::{DMatrix, DVector, Matrix5, Vector5};
use serde::{Deserialize, Serialize};
use std::{f64::consts::FRAC_PI_2, str::FromStr};

const IDX_X: usize = 0;
const IDX_Y: usize = 1;
const IDX_YAW: usize = 2;

/// Turn rates below this are propagated with the straight-line limit.
const MIN_TURN_RATE: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Model selection
// ---------------------------------------------------------------------------

/// Which kinematic model a track runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionModelKind {
    ConstantVelocity,
    ConstantTurnRate,
}

impl FromStr for MotionModelKind {
    type Err = FusionError;

    /// Accepts the model names and the tracker-type names used in the
    /// class → tracker table.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "constant_velocity"
            | "pedestrian_and_bicycle_tracker"
            | "pedestrian_tracker"
            | "bicycle_tracker"
            | "pass_through_tracker" => Ok(MotionModelKind::ConstantVelocity),
            "constant_turn_rate" | "multi_vehicle_tracker" | "normal_vehicle_tracker"
            | "big_vehicle_tracker" => Ok(MotionModelKind::ConstantTurnRate),
            other => Err(FusionError::UnknownMotionModel(other.to_string())),
        }
    }
}

/// Process and initialisation noise, shared by both models.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionNoiseConfig {
    /// Acceleration std dev (m/s²)
    pub accel_std: f64,
    /// Heading random walk std dev (rad/√s)
    pub yaw_std: f64,
    /// Yaw acceleration std dev for CTRV (rad/s²)
    pub yaw_rate_std: f64,
    /// Initial velocity std dev when the detector reports none (m/s)
    pub init_velocity_std: f64,
    /// Initial turn-rate std dev (rad/s)
    pub init_yaw_rate_std: f64,
}

impl Default for MotionNoiseConfig {
    fn default() -> Self {
        Self {
            accel_std: 3.0,
            yaw_std: 0.2,
            yaw_rate_std: 0.5,
            init_velocity_std: 10.0,
            init_yaw_rate_std: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Filter core
// ---------------------------------------------------------------------------

/// Filter state shared by every variant.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    pub state: StateVec,
    pub cov: StateCov,
    /// Time the state refers to
    pub time: Time,
}

/// One stacked observation: z, h(x), H and R, plus the rows holding angles.
struct Observation {
    z: DVector<f64>,
    hx: DVector<f64>,
    h: DMatrix<f64>,
    r: DMatrix<f64>,
    angle_rows: Vec<usize>,
}

/// EKF correction with Joseph-form covariance. Returns `None` when the
/// innovation covariance is singular (state left untouched).
fn ekf_update(filter: &mut FilterState, obs: &Observation) -> Option<()> {
    let x = DVector::from_iterator(5, filter.state.iter().copied());
    let p = DMatrix::from_fn(5, 5, |r, c| filter.cov[(r, c)]);

    // Innovation ν = z − h(x), angles wrapped
    let mut innovation = &obs.z - &obs.hx;
    for &row in &obs.angle_rows {
        innovation[row] = normalize_angle(innovation[row]);
    }

    // S = H·P·Hᵀ + R
    let s = &obs.h * &p * obs.h.transpose() + &obs.r;
    let s_inv = s.lu().try_inverse()?;

    // K = P·Hᵀ·S⁻¹
    let k = &p * obs.h.transpose() * s_inv;
    let new_x = x + &k * innovation;

    // P' = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ
    let i_kh = DMatrix::identity(5, 5) - &k * &obs.h;
    let new_p = &i_kh * &p * i_kh.transpose() + &k * &obs.r * k.transpose();

    filter.state = Vector5::from_iterator(new_x.iter().copied());
    filter.state[IDX_YAW] = normalize_angle(filter.state[IDX_YAW]);
    let sym = StateCov::from_fn(|r, c| new_p[(r, c)]);
    filter.cov = (sym + sym.transpose()) * 0.5;
    Some(())
}

/// Heading to fold in, flipped by π when the detector cannot tell front from
/// back and the flip is closer to the tracked heading. The flag reports a flip.
fn measured_yaw(object: &Kinematics, tracked_yaw: f64) -> (f64, bool) {
    let diff = normalize_angle(object.yaw - tracked_yaw);
    if object.orientation != OrientationAvailability::Available && diff.abs() > FRAC_PI_2 {
        (normalize_angle(object.yaw + std::f64::consts::PI), true)
    } else {
        (object.yaw, false)
    }
}

/// Position (+ heading when available) rows of an observation.
fn pose_observation(filter: &FilterState, object: &Kinematics) -> Observation {
    let with_yaw = object.orientation != OrientationAvailability::Unavailable;
    let dim = if with_yaw { 3 } else { 2 };
    let mut z = DVector::zeros(dim);
    let mut hx = DVector::zeros(dim);
    let mut h = DMatrix::zeros(dim, 5);
    let r = DMatrix::from_fn(dim, dim, |i, j| object.pose_cov[(i, j)]);

    z[0] = object.x;
    z[1] = object.y;
    hx[0] = filter.state[IDX_X];
    hx[1] = filter.state[IDX_Y];
    h[(0, IDX_X)] = 1.0;
    h[(1, IDX_Y)] = 1.0;
    let mut angle_rows = Vec::new();
    if with_yaw {
        z[2] = measured_yaw(object, filter.state[IDX_YAW]).0;
        hx[2] = filter.state[IDX_YAW];
        h[(2, IDX_YAW)] = 1.0;
        angle_rows.push(2);
    }
    Observation { z, hx, h, r, angle_rows }
}

/// Append one scalar row to an observation.
fn push_row(obs: &mut Observation, z: f64, hx: f64, h_row: [f64; 5], var: f64) {
    let n = obs.z.len();
    obs.z = obs.z.clone().insert_row(n, z);
    obs.hx = obs.hx.clone().insert_row(n, hx);
    let mut h = obs.h.clone().insert_row(n, 0.0);
    for (c, v) in h_row.iter().enumerate() {
        h[(n, c)] = *v;
    }
    obs.h = h;
    let mut r = obs.r.clone().insert_row(n, 0.0).insert_column(n, 0.0);
    r[(n, n)] = var;
    obs.r = r;
}

// ---------------------------------------------------------------------------
// Constant Velocity model
// ---------------------------------------------------------------------------

/// Constant-velocity model, `[x, y, yaw, vx, vy]`.
#[derive(Clone, Debug, PartialEq)]
pub struct CvModel {
    pub filter: FilterState,
    pub noise: MotionNoiseConfig,
}

impl CvModel {
    pub fn new(object: &DetectedObject, time: Time, noise: MotionNoiseConfig) -> Self {
        let k = &object.kinematics;
        let (s, c) = k.yaw.sin_cos();
        let v = k.velocity.unwrap_or(0.0);
        let v_var = if k.velocity.is_some() {
            k.velocity_var.max(0.01)
        } else {
            noise.init_velocity_std * noise.init_velocity_std
        };
        let mut cov = StateCov::zeros();
        cov.fixed_view_mut::<3, 3>(0, 0).copy_from(&k.pose_cov);
        cov[(3, 3)] = v_var;
        cov[(4, 4)] = v_var;
        Self {
            filter: FilterState {
                state: Vector5::new(k.x, k.y, k.yaw, v * c, v * s),
                cov,
                time,
            },
            noise,
        }
    }

    /// State transition matrix F for timestep dt.
    pub fn transition_matrix(dt: f64) -> Matrix5<f64> {
        let mut f = Matrix5::<f64>::identity();
        f[(0, 3)] = dt;
        f[(1, 4)] = dt;
        f
    }

    /// DWNA process noise for timestep dt.
    fn process_noise(&self, dt: f64) -> Matrix5<f64> {
        let q = self.noise.accel_std * self.noise.accel_std;
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt3 * dt;
        let mut qm = Matrix5::<f64>::zeros();
        for i in 0..2usize {
            qm[(i, i)] = q * dt4 / 4.0;
            qm[(i + 3, i + 3)] = q * dt2;
            qm[(i, i + 3)] = q * dt3 / 2.0;
            qm[(i + 3, i)] = q * dt3 / 2.0;
        }
        qm[(2, 2)] = self.noise.yaw_std * self.noise.yaw_std * dt;
        qm
    }

    pub fn predict(&mut self, time: Time) {
        let dt = time - self.filter.time;
        if dt <= 0.0 {
            return;
        }
        let f = Self::transition_matrix(dt);
        self.filter.state = f * self.filter.state;
        self.filter.cov = f * self.filter.cov * f.transpose() + self.process_noise(dt);
        self.filter.time = time;
    }

    pub fn update(&mut self, object: &Kinematics) -> bool {
        let mut obs = pose_observation(&self.filter, object);
        if let Some(v) = object.velocity {
            // speed along the heading: h(x) = vx·cos(yaw) + vy·sin(yaw)
            let x = &self.filter.state;
            let (s, c) = x[IDX_YAW].sin_cos();
            let hx = x[3] * c + x[4] * s;
            let dyaw = -x[3] * s + x[4] * c;
            // a flipped heading observes the negated speed
            let sign = if measured_yaw(object, x[IDX_YAW]).1 { -1.0 } else { 1.0 };
            push_row(&mut obs, sign * v, hx, [0.0, 0.0, dyaw, c, s], object.velocity_var.max(0.01));
        }
        ekf_update(&mut self.filter, &obs).is_some()
    }

    pub fn kinematics(&self) -> Kinematics {
        let x = &self.filter.state;
        let p = &self.filter.cov;
        let (s, c) = x[IDX_YAW].sin_cos();
        let j = nalgebra::RowVector5::new(0.0, 0.0, 0.0, c, s);
        Kinematics {
            x: x[IDX_X],
            y: x[IDX_Y],
            yaw: x[IDX_YAW],
            pose_cov: p.fixed_view::<3, 3>(0, 0).into_owned(),
            orientation: OrientationAvailability::SignUnknown,
            velocity: Some(x[3] * c + x[4] * s),
            velocity_var: (j * p * j.transpose())[(0, 0)].max(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Constant Turn Rate and Velocity model
// ---------------------------------------------------------------------------

/// CTRV model, `[x, y, yaw, v, yaw_rate]`.
#[derive(Clone, Debug, PartialEq)]
pub struct CtrvModel {
    pub filter: FilterState,
    pub noise: MotionNoiseConfig,
}

impl CtrvModel {
    pub fn new(object: &DetectedObject, time: Time, noise: MotionNoiseConfig) -> Self {
        let k = &object.kinematics;
        let v_var = if k.velocity.is_some() {
            k.velocity_var.max(0.01)
        } else {
            noise.init_velocity_std * noise.init_velocity_std
        };
        let mut cov = StateCov::zeros();
        cov.fixed_view_mut::<3, 3>(0, 0).copy_from(&k.pose_cov);
        cov[(3, 3)] = v_var;
        cov[(4, 4)] = noise.init_yaw_rate_std * noise.init_yaw_rate_std;
        Self {
            filter: FilterState {
                state: Vector5::new(k.x, k.y, k.yaw, k.velocity.unwrap_or(0.0), 0.0),
                cov,
                time,
            },
            noise,
        }
    }

    /// Propagate the state along the arc and return the Jacobian ∂f/∂x.
    pub fn transition(state: &StateVec, dt: f64) -> (StateVec, Matrix5<f64>) {
        let (x, y, yaw, v, w) = (state[0], state[1], state[2], state[3], state[4]);
        let mut f = Matrix5::<f64>::identity();
        let (nx, ny);
        if w.abs() < MIN_TURN_RATE {
            let (s, c) = yaw.sin_cos();
            nx = x + v * c * dt;
            ny = y + v * s * dt;
            f[(0, 2)] = -v * s * dt;
            f[(0, 3)] = c * dt;
            f[(0, 4)] = -0.5 * v * s * dt * dt;
            f[(1, 2)] = v * c * dt;
            f[(1, 3)] = s * dt;
            f[(1, 4)] = 0.5 * v * c * dt * dt;
        } else {
            let yaw2 = yaw + w * dt;
            let (s1, c1) = yaw.sin_cos();
            let (s2, c2) = yaw2.sin_cos();
            nx = x + v / w * (s2 - s1);
            ny = y + v / w * (c1 - c2);
            f[(0, 2)] = v / w * (c2 - c1);
            f[(0, 3)] = (s2 - s1) / w;
            f[(0, 4)] = -v / (w * w) * (s2 - s1) + v / w * c2 * dt;
            f[(1, 2)] = v / w * (s2 - s1);
            f[(1, 3)] = (c1 - c2) / w;
            f[(1, 4)] = -v / (w * w) * (c1 - c2) + v / w * s2 * dt;
        }
        f[(2, 4)] = dt;
        (Vector5::new(nx, ny, normalize_angle(yaw + w * dt), v, w), f)
    }

    fn process_noise(&self, dt: f64) -> Matrix5<f64> {
        let qa = self.noise.accel_std * self.noise.accel_std;
        let qw = self.noise.yaw_rate_std * self.noise.yaw_rate_std;
        let pos = qa * dt.powi(4) / 4.0;
        Matrix5::from_diagonal(&Vector5::new(
            pos,
            pos,
            self.noise.yaw_std * self.noise.yaw_std * dt + qw * dt.powi(4) / 4.0,
            qa * dt * dt,
            qw * dt * dt,
        ))
    }

    pub fn predict(&mut self, time: Time) {
        let dt = time - self.filter.time;
        if dt <= 0.0 {
            return;
        }
        let (state, f) = Self::transition(&self.filter.state, dt);
        self.filter.state = state;
        self.filter.cov = f * self.filter.cov * f.transpose() + self.process_noise(dt);
        self.filter.time = time;
    }

    pub fn update(&mut self, object: &Kinematics) -> bool {
        let mut obs = pose_observation(&self.filter, object);
        if let Some(v) = object.velocity {
            let sign = if measured_yaw(object, self.filter.state[IDX_YAW]).1 {
                -1.0
            } else {
                1.0
            };
            let hx = self.filter.state[3];
            push_row(&mut obs, sign * v, hx, [0.0, 0.0, 0.0, 1.0, 0.0], object.velocity_var.max(0.01));
        }
        ekf_update(&mut self.filter, &obs).is_some()
    }

    pub fn kinematics(&self) -> Kinematics {
        let x = &self.filter.state;
        let p = &self.filter.cov;
        Kinematics {
            x: x[IDX_X],
            y: x[IDX_Y],
            yaw: x[IDX_YAW],
            pose_cov: p.fixed_view::<3, 3>(0, 0).into_owned(),
            orientation: OrientationAvailability::SignUnknown,
            velocity: Some(x[3]),
            velocity_var: p[(3, 3)].max(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Closed set of variants
// ---------------------------------------------------------------------------

/// Motion model carried by a track.
#[derive(Clone, Debug, PartialEq)]
pub enum MotionModel {
    ConstantVelocity(CvModel),
    ConstantTurnRate(CtrvModel),
}

impl MotionModel {
    /// Initialise a model of `kind` from a detection observed at `time`.
    pub fn new(
        kind: MotionModelKind,
        object: &DetectedObject,
        time: Time,
        noise: MotionNoiseConfig,
    ) -> Self {
        match kind {
            MotionModelKind::ConstantVelocity => {
                MotionModel::ConstantVelocity(CvModel::new(object, time, noise))
            }
            MotionModelKind::ConstantTurnRate => {
                MotionModel::ConstantTurnRate(CtrvModel::new(object, time, noise))
            }
        }
    }

    pub fn kind(&self) -> MotionModelKind {
        match self {
            MotionModel::ConstantVelocity(_) => MotionModelKind::ConstantVelocity,
            MotionModel::ConstantTurnRate(_) => MotionModelKind::ConstantTurnRate,
        }
    }

    /// Advance to `time`. Non-positive elapsed time is a no-op.
    pub fn predict(&mut self, time: Time) {
        match self {
            MotionModel::ConstantVelocity(m) => m.predict(time),
            MotionModel::ConstantTurnRate(m) => m.predict(time),
        }
    }

    /// Fold a world-frame measurement in. Returns `false` (state untouched)
    /// if the innovation covariance was singular.
    pub fn update(&mut self, object: &Kinematics) -> bool {
        match self {
            MotionModel::ConstantVelocity(m) => m.update(object),
            MotionModel::ConstantTurnRate(m) => m.update(object),
        }
    }

    pub fn kinematics(&self) -> Kinematics {
        match self {
            MotionModel::ConstantVelocity(m) => m.kinematics(),
            MotionModel::ConstantTurnRate(m) => m.kinematics(),
        }
    }

    pub fn filter(&self) -> &FilterState {
        match self {
            MotionModel::ConstantVelocity(m) => &m.filter,
            MotionModel::ConstantTurnRate(m) => &m.filter,
        }
    }

    pub fn time(&self) -> Time {
        self.filter().time
    }

    /// Copy of the model advanced to `time`; `self` is untouched.
    pub fn predicted(&self, time: Time) -> MotionModel {
        let mut m = self.clone();
        m.predict(time);
        m
    }
}

/// Parse a model name, mapping the error into the crate error type.
pub fn parse_model_kind(name: &str) -> Result<MotionModelKind> {
    name.parse()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassDistribution, ObjectClass, Shape};
    use approx::assert_abs_diff_eq;

    fn detection(x: f64, y: f64, yaw: f64, v: Option<f64>) -> DetectedObject {
        let mut k = Kinematics::new(x, y, yaw);
        k.velocity = v;
        k.velocity_var = 1.0;
        DetectedObject {
            kinematics: k,
            shape: Shape::bounding_box(4.5, 1.8, 1.5),
            classification: ClassDistribution::certain(ObjectClass::Car),
            existence_probability: 0.9,
        }
    }

    #[test]
    fn cv_predict_moves_along_velocity() {
        let mut m = MotionModel::new(
            MotionModelKind::ConstantVelocity,
            &detection(0.0, 0.0, 0.0, Some(10.0)),
            0.0,
            MotionNoiseConfig::default(),
        );
        m.predict(1.0);
        let k = m.kinematics();
        assert_abs_diff_eq!(k.x, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(k.velocity.unwrap(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn ctrv_quarter_turn() {
        // v = π/2 m/s, ω = π/2 rad/s for 1 s → quarter circle of radius 1
        let state = Vector5::new(0.0, 0.0, 0.0, FRAC_PI_2, FRAC_PI_2);
        let (next, _) = CtrvModel::transition(&state, 1.0);
        assert_abs_diff_eq!(next[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(next[1], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(next[2], FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn ctrv_jacobian_matches_finite_difference() {
        let state = Vector5::new(1.0, 2.0, 0.3, 5.0, 0.2);
        let dt = 0.5;
        let (_, f) = CtrvModel::transition(&state, dt);
        let eps = 1e-6;
        for col in 0..5 {
            let mut plus = state;
            plus[col] += eps;
            let mut minus = state;
            minus[col] -= eps;
            let (a, _) = CtrvModel::transition(&plus, dt);
            let (b, _) = CtrvModel::transition(&minus, dt);
            for row in 0..2 {
                let numeric = (a[row] - b[row]) / (2.0 * eps);
                assert_abs_diff_eq!(f[(row, col)], numeric, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn update_reduces_uncertainty() {
        for kind in [MotionModelKind::ConstantVelocity, MotionModelKind::ConstantTurnRate] {
            let mut m = MotionModel::new(kind, &detection(0.0, 0.0, 0.0, None), 0.0, MotionNoiseConfig::default());
            m.predict(0.5);
            let prior = m.filter().cov.trace();
            assert!(m.update(&detection(0.2, 0.0, 0.0, Some(0.4)).kinematics));
            assert!(m.filter().cov.trace() < prior, "{kind:?} update should shrink P");
        }
    }

    #[test]
    fn flipped_heading_is_folded_back() {
        let mut m = MotionModel::new(
            MotionModelKind::ConstantTurnRate,
            &detection(0.0, 0.0, 0.0, None),
            0.0,
            MotionNoiseConfig::default(),
        );
        let flipped = detection(0.0, 0.0, std::f64::consts::PI, None);
        m.update(&flipped.kinematics);
        assert!(m.kinematics().yaw.abs() < 0.05);
    }

    #[test]
    fn predicted_copy_leaves_original() {
        let m = MotionModel::new(
            MotionModelKind::ConstantVelocity,
            &detection(0.0, 0.0, 0.0, Some(2.0)),
            0.0,
            MotionNoiseConfig::default(),
        );
        let ahead = m.predicted(2.0);
        assert_abs_diff_eq!(ahead.kinematics().x, 4.0, epsilon = 1e-9);
        assert_eq!(m.time(), 0.0);
    }

    #[test]
    fn tracker_names_map_to_models() {
        assert_eq!(
            parse_model_kind("multi_vehicle_tracker").unwrap(),
            MotionModelKind::ConstantTurnRate
        );
        assert_eq!(
            parse_model_kind("pedestrian_and_bicycle_tracker").unwrap(),
            MotionModelKind::ConstantVelocity
        );
        assert!(parse_model_kind("warp_drive").is_err());
    }
}
