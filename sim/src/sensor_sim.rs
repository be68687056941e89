//! Object-detection sensor simulator.
//!
//! Generates asynchronous, per-channel detection batches with:
//! - Gaussian pose / speed / extent noise
//! - Miss probability (1 - P_D)
//! - Poisson clutter (false alarms) labelled `UNKNOWN`
//! - Misclassification
//! - Fixed delivery latency
//!
//! Detections are expressed in the sensor's own frame; the sensor is mounted
//! on the ego vehicle through a static `base_link → sensor` transform.

use crate::target::Target;
use fusion_core::{
    geometry::{normalize_angle, Transform2D},
    types::{
        ChannelId, ClassDistribution, DetectedObject, DetectionBatch, Kinematics, ObjectClass,
        OrientationAvailability, PoseCov, Shape, Time,
    },
};
use nalgebra::{Point2, Vector3};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Cap on clutter returns drawn per scan.
const MAX_CLUTTER_PER_SCAN: usize = 50;

/// Physical and reporting configuration of one detection channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    /// Channel key in the engine configuration
    pub key: String,
    /// Frame the detections are reported in
    pub frame_id: String,
    /// Sensor pose on the vehicle (sensor → base_link)
    pub mount: Transform2D,
    /// Scan rate (Hz)
    pub rate: f64,
    /// Time of the first scan (s)
    pub phase: f64,
    /// Delay between scan and delivery (s)
    pub latency: f64,
    pub max_range: f64,
    /// Field of view half-angle (radians)
    pub fov_half: f64,
    /// Probability of detection per target per scan
    pub p_detection: f64,
    /// Mean number of clutter returns per scan
    pub lambda_clutter: f64,
    pub position_noise_std: f64,
    pub yaw_noise_std: f64,
    /// `None` if the sensor does not observe speed
    pub speed_noise_std: Option<f64>,
    /// Relative extent noise (fraction of each dimension)
    pub shape_noise: f64,
    /// Probability of reporting the true label instead of `UNKNOWN`
    pub classification_accuracy: f64,
    pub orientation: OrientationAvailability,
    pub can_spawn_new_tracker: bool,
}

impl SensorSpec {
    /// Roof lidar with a 360° view.
    pub fn lidar(key: &str) -> Self {
        Self {
            key: key.into(),
            frame_id: format!("{key}_link"),
            mount: Transform2D::new(1.2, 0.0, 0.0),
            rate: 10.0,
            phase: 0.0,
            latency: 0.06,
            max_range: 80.0,
            fov_half: std::f64::consts::PI,
            p_detection: 0.95,
            lambda_clutter: 0.3,
            position_noise_std: 0.15,
            yaw_noise_std: 0.03,
            speed_noise_std: None,
            shape_noise: 0.05,
            classification_accuracy: 0.9,
            orientation: OrientationAvailability::SignUnknown,
            can_spawn_new_tracker: true,
        }
    }

    /// Forward radar: long range, observes speed, never spawns.
    pub fn front_radar(key: &str) -> Self {
        Self {
            key: key.into(),
            frame_id: format!("{key}_link"),
            mount: Transform2D::new(3.8, 0.0, 0.0),
            rate: 20.0,
            phase: 0.025,
            latency: 0.03,
            max_range: 150.0,
            fov_half: 0.6,
            p_detection: 0.85,
            lambda_clutter: 0.5,
            position_noise_std: 0.5,
            yaw_noise_std: 0.1,
            speed_noise_std: Some(0.2),
            shape_noise: 0.2,
            classification_accuracy: 0.5,
            orientation: OrientationAvailability::Available,
            can_spawn_new_tracker: false,
        }
    }

    /// Front camera: good labels, poor range accuracy.
    pub fn camera(key: &str) -> Self {
        Self {
            key: key.into(),
            frame_id: format!("{key}_link"),
            mount: Transform2D::new(2.0, 0.0, 0.0),
            rate: 15.0,
            phase: 0.01,
            latency: 0.1,
            max_range: 60.0,
            fov_half: 0.9,
            p_detection: 0.9,
            lambda_clutter: 0.1,
            position_noise_std: 0.6,
            yaw_noise_std: 0.05,
            speed_noise_std: None,
            shape_noise: 0.1,
            classification_accuracy: 0.98,
            orientation: OrientationAvailability::SignUnknown,
            can_spawn_new_tracker: true,
        }
    }
}

/// A batch together with the time it reaches the tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimedBatch {
    pub arrival: Time,
    pub channel: usize,
    pub batch: DetectionBatch,
}

/// One configured sensor in the simulation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimSensor {
    pub channel: usize,
    pub spec: SensorSpec,
    /// Next scheduled scan time
    pub next_scan_time: f64,
}

impl SimSensor {
    pub fn new(channel: usize, spec: SensorSpec) -> Self {
        Self {
            channel,
            next_scan_time: spec.phase,
            spec,
        }
    }

    /// Check if this sensor should fire at the current simulation time.
    pub fn should_scan(&self, t: f64) -> bool {
        t + 1e-9 >= self.next_scan_time
    }

    /// Advance the schedule by one scan interval.
    pub fn advance_schedule(&mut self) {
        self.next_scan_time += 1.0 / self.spec.rate;
    }
}

/// Generates detection batches from a set of targets.
pub struct SensorSimulator {
    pub sensors: Vec<SimSensor>,
    rng: ChaCha8Rng,
}

impl SensorSimulator {
    pub fn new(specs: Vec<SensorSpec>, seed: u64) -> Self {
        Self {
            sensors: specs
                .into_iter()
                .enumerate()
                .map(|(channel, spec)| SimSensor::new(channel, spec))
                .collect(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Generate the batches of every sensor due at `sim_time`. Batches are
    /// stamped with `sim_time`; `ego` is the `base_link → map` pose at that
    /// time.
    pub fn generate_batches(
        &mut self,
        targets: &[Target],
        ego: &Transform2D,
        sim_time: f64,
    ) -> Vec<TimedBatch> {
        let mut batches = Vec::new();

        for sensor in &mut self.sensors {
            if !sensor.should_scan(sim_time) {
                continue;
            }
            sensor.advance_schedule();
            let spec = &sensor.spec;
            let world_from_sensor = ego.compose(&spec.mount);
            let sensor_from_world = world_from_sensor.inverse();

            let mut batch = DetectionBatch::new(ChannelId(sensor.channel), sim_time, &spec.frame_id);

            // True detections
            for target in targets {
                if !target.is_active(sim_time) {
                    continue;
                }
                let p = sensor_from_world.apply(Point2::new(target.state.x, target.state.y));
                let range = p.coords.norm();
                let azimuth = p.y.atan2(p.x);
                if range > spec.max_range || azimuth.abs() > spec.fov_half {
                    continue;
                }
                // Miss detection?
                if self.rng.gen::<f64>() > spec.p_detection {
                    continue;
                }

                let yaw = normalize_angle(
                    target.state.yaw - world_from_sensor.yaw + gaussian(&mut self.rng, spec.yaw_noise_std),
                );
                let mut kinematics = Kinematics::new(
                    p.x + gaussian(&mut self.rng, spec.position_noise_std),
                    p.y + gaussian(&mut self.rng, spec.position_noise_std),
                    yaw,
                );
                kinematics.pose_cov = pose_cov(spec);
                kinematics.orientation = spec.orientation;
                if let Some(std) = spec.speed_noise_std {
                    kinematics.velocity = Some(target.state.speed + gaussian(&mut self.rng, std));
                    kinematics.velocity_var = std * std;
                }

                let label = if self.rng.gen::<f64>() < spec.classification_accuracy {
                    target.class
                } else {
                    ObjectClass::Unknown
                };
                let shape = perturb_shape(&target.shape, spec.shape_noise, &mut self.rng);

                batch.objects.push(DetectedObject {
                    kinematics,
                    shape,
                    classification: ClassDistribution::certain(label),
                    existence_probability: 0.6 + 0.4 * self.rng.gen::<f64>(),
                });
            }

            // Clutter (Poisson by multiplying uniforms until below e^{-lambda})
            let lambda = spec.lambda_clutter;
            let n_clutter = if lambda <= 0.0 {
                0usize
            } else {
                let mut n = 0usize;
                let threshold = (-lambda).exp();
                let mut prod = self.rng.gen::<f64>();
                while prod > threshold && n < MAX_CLUTTER_PER_SCAN {
                    prod *= self.rng.gen::<f64>();
                    n += 1;
                }
                n
            };
            for _ in 0..n_clutter {
                let range = spec.max_range * self.rng.gen::<f64>().sqrt();
                let azimuth = (2.0 * self.rng.gen::<f64>() - 1.0) * spec.fov_half;
                let mut kinematics = Kinematics::new(
                    range * azimuth.cos(),
                    range * azimuth.sin(),
                    self.rng.gen::<f64>() * TAU - std::f64::consts::PI,
                );
                kinematics.pose_cov = pose_cov(spec);
                batch.objects.push(DetectedObject {
                    kinematics,
                    shape: Shape::bounding_box(1.0, 1.0, 1.0),
                    classification: ClassDistribution::certain(ObjectClass::Unknown),
                    existence_probability: 0.2 + 0.3 * self.rng.gen::<f64>(),
                });
            }

            tracing::trace!(
                sensor = %spec.key,
                time = sim_time,
                objects = batch.objects.len(),
                clutter = n_clutter,
                "scan"
            );
            batches.push(TimedBatch {
                arrival: sim_time + spec.latency,
                channel: sensor.channel,
                batch,
            });
        }

        batches
    }
}

fn pose_cov(spec: &SensorSpec) -> PoseCov {
    let p = spec.position_noise_std.powi(2).max(1e-4);
    let y = spec.yaw_noise_std.powi(2).max(1e-6);
    PoseCov::from_diagonal(&Vector3::new(p, p, y))
}

/// Zero-mean normal sample (Box–Muller).
fn gaussian<R: Rng>(rng: &mut R, std: f64) -> f64 {
    if std <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    std * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

fn perturb_shape<R: Rng>(shape: &Shape, noise: f64, rng: &mut R) -> Shape {
    let mut scale = |d: f64| (d * (1.0 + gaussian(rng, noise))).max(0.1);
    match shape {
        Shape::BoundingBox { length, width, height } => Shape::BoundingBox {
            length: scale(*length),
            width: scale(*width),
            height: *height,
        },
        Shape::Cylinder { diameter, height } => Shape::Cylinder {
            diameter: scale(*diameter),
            height: *height,
        },
        Shape::Polygon { .. } => shape.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
