//! Measurement uncertainty: ego-odometry propagation and covariance
//! normalisation.
//!
//! # Odometry propagation
//! The ego pose/twist uncertainty is treated as independent of the detector
//! noise and added in (x, y, yaw). For an object at offset `r` from the ego:
//! - Σ_xy  += Σ_ego_xy + σ²_ego_yaw · r⊥ r⊥ᵀ,   r⊥ = (−r_y, r_x)
//! - σ²_yaw += σ²_ego_yaw
//! - σ²_v   += σ²_ego_vx + σ²_ego_yaw_rate · |r|²
//!
//! # Normalisation
//! Non-finite entries are zeroed, the matrix is symmetrised and projected
//! onto the PSD cone, then each diagonal entry is raised to the class floor.
//! Raising a PSD diagonal keeps it PSD, so gating never sees a singular S.

use crate::{
    geometry::Transform2D,
    types::{DetectedObject, ObjectClass, PoseCov, Time},
};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Estimated ego motion with its covariance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    pub stamp: Time,
    /// Ego (`base_link`) pose in the world frame
    pub pose: Transform2D,
    pub vx: f64,
    pub vy: f64,
    pub yaw_rate: f64,
    /// Covariance over (x, y, yaw)
    pub pose_cov: PoseCov,
    /// Covariance over (vx, vy, yaw_rate)
    pub twist_cov: Matrix3<f64>,
}

impl Odometry {
    /// Fixed covariance model used when only the ego transform is known.
    pub fn modelled(pose: Transform2D, stamp: Time) -> Self {
        Self {
            stamp,
            pose,
            vx: 10.0,
            vy: 0.1,
            yaw_rate: 0.1,
            pose_cov: Matrix3::from_diagonal(&Vector3::new(0.1, 0.1, 0.0001)),
            twist_cov: Matrix3::from_diagonal(&Vector3::new(2.0, 0.2, 0.001)),
        }
    }
}

/// Minimum standard deviations enforced by [`normalize_uncertainty`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CovarianceFloor {
    /// Position std dev floor (m), applied to x and y
    pub position_std: f64,
    /// Heading std dev floor (rad)
    pub yaw_std: f64,
    /// Speed std dev floor (m/s)
    pub velocity_std: f64,
}

impl CovarianceFloor {
    pub const fn new(position_std: f64, yaw_std: f64, velocity_std: f64) -> Self {
        Self {
            position_std,
            yaw_std,
            velocity_std,
        }
    }
}

/// Per-class covariance floors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    pub floors: BTreeMap<ObjectClass, CovarianceFloor>,
    /// Floor for classes missing from `floors`
    pub default_floor: CovarianceFloor,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        let vehicle = CovarianceFloor::new(0.5, 0.1, 1.0);
        let two_wheeler = CovarianceFloor::new(0.4, 0.2, 0.7);
        let floors = BTreeMap::from([
            (ObjectClass::Unknown, CovarianceFloor::new(0.5, 0.5, 1.0)),
            (ObjectClass::Car, vehicle),
            (ObjectClass::Truck, CovarianceFloor::new(0.7, 0.1, 1.0)),
            (ObjectClass::Bus, CovarianceFloor::new(0.7, 0.1, 1.0)),
            (ObjectClass::Trailer, CovarianceFloor::new(0.7, 0.1, 1.0)),
            (ObjectClass::Motorcycle, two_wheeler),
            (ObjectClass::Bicycle, two_wheeler),
            (ObjectClass::Pedestrian, CovarianceFloor::new(0.3, 0.3, 0.5)),
        ]);
        Self {
            floors,
            default_floor: vehicle,
        }
    }
}

impl UncertaintyConfig {
    pub fn floor(&self, class: ObjectClass) -> CovarianceFloor {
        self.floors.get(&class).copied().unwrap_or(self.default_floor)
    }
}

/// Inflate every object's covariance by the propagated ego uncertainty.
/// Objects must already be expressed in the world frame.
pub fn add_odometry_uncertainty(odometry: &Odometry, objects: &mut [DetectedObject]) {
    let ego_xy: Matrix2<f64> = odometry.pose_cov.fixed_view::<2, 2>(0, 0).into_owned();
    let yaw_var = odometry.pose_cov[(2, 2)].max(0.0);
    let vx_var = odometry.twist_cov[(0, 0)].max(0.0);
    let yaw_rate_var = odometry.twist_cov[(2, 2)].max(0.0);

    for object in objects.iter_mut() {
        let k = &mut object.kinematics;
        let r = Vector2::new(k.x - odometry.pose.x, k.y - odometry.pose.y);
        let r_perp = Vector2::new(-r.y, r.x);
        let added_xy = ego_xy + r_perp * r_perp.transpose() * yaw_var;

        let mut added = PoseCov::zeros();
        added.fixed_view_mut::<2, 2>(0, 0).copy_from(&added_xy);
        added[(2, 2)] = yaw_var;
        k.pose_cov += added;
        if k.velocity.is_some() {
            k.velocity_var += vx_var + yaw_rate_var * r.norm_squared();
        }
    }
}

/// Project a 3×3 covariance onto a valid (finite, symmetric, PSD) matrix.
fn sanitize(cov: &PoseCov) -> PoseCov {
    let finite = cov.map(|v| if v.is_finite() { v } else { 0.0 });
    let sym = (finite + finite.transpose()) * 0.5;
    let eig = sym.symmetric_eigen();
    let clamped = eig.eigenvalues.map(|v| v.max(0.0));
    let psd = eig.eigenvectors * Matrix3::from_diagonal(&clamped) * eig.eigenvectors.transpose();
    (psd + psd.transpose()) * 0.5
}

/// Enforce covariance validity and the class floors on every object.
/// Returns how many objects needed a correction beyond symmetrisation.
pub fn normalize_uncertainty(objects: &mut [DetectedObject], config: &UncertaintyConfig) -> usize {
    let mut corrected = 0;
    for object in objects.iter_mut() {
        let floor = config.floor(object.label());
        let k = &mut object.kinematics;
        let mut cov = sanitize(&k.pose_cov);
        let floors = [floor.position_std, floor.position_std, floor.yaw_std];
        let mut touched = !k.pose_cov.iter().all(|v| v.is_finite());
        for (i, std) in floors.iter().enumerate() {
            let min_var = std * std;
            if cov[(i, i)] < min_var {
                cov[(i, i)] = min_var;
                touched = true;
            }
        }
        k.pose_cov = cov;

        let min_v_var = floor.velocity_std * floor.velocity_std;
        if !k.velocity_var.is_finite() || k.velocity_var < min_v_var {
            k.velocity_var = min_v_var;
            touched |= k.velocity.is_some();
        }
        if touched {
            corrected += 1;
        }
    }
    if corrected > 0 {
        tracing::trace!(corrected, "covariance floors applied");
    }
    corrected
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassDistribution, Kinematics, Shape};
    use approx::assert_abs_diff_eq;

    fn object_at(x: f64, y: f64, cov: PoseCov) -> DetectedObject {
        let mut k = Kinematics::new(x, y, 0.0);
        k.pose_cov = cov;
        k.velocity = Some(5.0);
        k.velocity_var = 1.0;
        DetectedObject {
            kinematics: k,
            shape: Shape::bounding_box(4.0, 2.0, 1.5),
            classification: ClassDistribution::certain(ObjectClass::Car),
            existence_probability: 0.8,
        }
    }

    fn is_psd(m: &PoseCov) -> bool {
        m.symmetric_eigen().eigenvalues.iter().all(|&v| v >= -1e-12)
    }

    #[test]
    fn odometry_yaw_uncertainty_grows_with_lateral_lever_arm() {
        let odom = Odometry {
            pose_cov: Matrix3::from_diagonal(&Vector3::new(0.0, 0.0, 0.01)),
            twist_cov: Matrix3::zeros(),
            ..Odometry::modelled(Transform2D::identity(), 0.0)
        };
        let mut objects = vec![object_at(10.0, 0.0, PoseCov::zeros())];
        add_odometry_uncertainty(&odom, &mut objects);
        let cov = objects[0].kinematics.pose_cov;
        // r = (10, 0) → r⊥ = (0, 10): only y grows, by 0.01 · 100
        assert_abs_diff_eq!(cov[(0, 0)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(1, 1)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(2, 2)], 0.01, epsilon = 1e-12);
    }

    #[test]
    fn odometry_twist_inflates_velocity_variance() {
        let odom = Odometry::modelled(Transform2D::identity(), 0.0);
        let mut objects = vec![object_at(3.0, 4.0, PoseCov::identity())];
        add_odometry_uncertainty(&odom, &mut objects);
        // 1.0 + 2.0 + 0.001 · 25
        assert_abs_diff_eq!(objects[0].kinematics.velocity_var, 3.025, epsilon = 1e-12);
    }

    #[test]
    fn normalisation_repairs_nan_and_negative_definite() {
        let mut bad = PoseCov::identity();
        bad[(0, 1)] = f64::NAN;
        bad[(1, 1)] = -4.0;
        let mut objects = vec![object_at(0.0, 0.0, bad)];
        let corrected = normalize_uncertainty(&mut objects, &UncertaintyConfig::default());
        assert_eq!(corrected, 1);
        let cov = objects[0].kinematics.pose_cov;
        assert!(cov.iter().all(|v| v.is_finite()));
        assert!(is_psd(&cov));
        assert!(cov[(1, 1)] >= 0.25 - 1e-12);
    }

    #[test]
    fn normalisation_keeps_large_covariance() {
        let big = PoseCov::identity() * 9.0;
        let mut objects = vec![object_at(0.0, 0.0, big)];
        let corrected = normalize_uncertainty(&mut objects, &UncertaintyConfig::default());
        assert_eq!(corrected, 0);
        assert_abs_diff_eq!(objects[0].kinematics.pose_cov, big, epsilon = 1e-9);
    }
}
