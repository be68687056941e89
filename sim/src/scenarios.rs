//! Scenario definitions.
//!
//! Each scenario is a named configuration of an ego vehicle, road users and
//! sensors. All scenarios are deterministic given the same seed.

use crate::{
    sensor_sim::SensorSpec,
    target::{MotionSpec, Target, TargetState},
};
use fusion_core::{
    config::{ChannelConfig, EngineConfig},
    types::ObjectClass,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

/// Which pre-defined scenario to load.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum ScenarioKind {
    /// 3 cars, parked ego, one lidar, no clutter
    Simple,
    /// Ego at 20 m/s among cars and a truck; lidar, front radar, camera
    Highway,
    /// Parked ego at a crossing: cross traffic, pedestrians, a turning bicycle
    Intersection,
    /// 60 random road users around the ego; scalability check
    Dense,
}

/// A fully configured simulation scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub seed: u64,
    pub duration: f64,
    /// Simulation step (s)
    pub sim_dt: f64,
    /// Ego vehicle; its pose is `base_link` in `map`
    pub ego: Target,
    pub targets: Vec<Target>,
    /// One per input channel, in channel-index order
    pub sensors: Vec<SensorSpec>,
}

impl Scenario {
    /// Build the named scenario. Uses `seed` for repeatability.
    pub fn build(kind: ScenarioKind, seed: u64) -> Self {
        match kind {
            ScenarioKind::Simple => Self::simple(seed),
            ScenarioKind::Highway => Self::highway(seed),
            ScenarioKind::Intersection => Self::intersection(seed),
            ScenarioKind::Dense => Self::dense(seed),
        }
    }

    /// Engine configuration with one input channel per sensor; everything
    /// else comes from `base`.
    pub fn engine_config(&self, base: EngineConfig) -> EngineConfig {
        channel_config(base, &self.sensors)
    }

    // -----------------------------------------------------------------------
    // Scenario 1: Simple
    // -----------------------------------------------------------------------
    fn simple(seed: u64) -> Self {
        let targets = vec![
            car(0, ObjectClass::Car, [20.0, 0.0, 0.0, 5.0], MotionSpec::ConstantVelocity),
            car(1, ObjectClass::Car, [10.0, 10.0, PI, 3.0], MotionSpec::ConstantVelocity),
            car(2, ObjectClass::Car, [-15.0, -8.0, FRAC_PI_2, 4.0], MotionSpec::ConstantVelocity),
        ];
        let lidar = SensorSpec {
            lambda_clutter: 0.0,
            ..SensorSpec::lidar("lidar")
        };

        Scenario {
            name: "simple".into(),
            seed,
            duration: 10.0,
            sim_dt: 0.01,
            ego: parked_ego(),
            targets,
            sensors: vec![lidar],
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 2: Highway
    // -----------------------------------------------------------------------
    fn highway(seed: u64) -> Self {
        const LANE: f64 = 3.5;
        let lane_change = MotionSpec::Segmented {
            segments: vec![
                (0.0, MotionSpec::ConstantVelocity),
                (6.0, MotionSpec::ConstantTurn { yaw_rate: 0.1 }),
                (7.0, MotionSpec::ConstantTurn { yaw_rate: -0.1 }),
                (8.0, MotionSpec::ConstantVelocity),
            ],
        };
        let targets = vec![
            car(0, ObjectClass::Car, [30.0, 0.0, 0.0, 18.0], MotionSpec::ConstantVelocity),
            car(1, ObjectClass::Car, [10.0, LANE, 0.0, 23.0], MotionSpec::ConstantVelocity),
            car(2, ObjectClass::Truck, [45.0, -LANE, 0.0, 16.0], MotionSpec::ConstantVelocity),
            car(3, ObjectClass::Car, [-20.0, -LANE, 0.0, 25.0], lane_change),
            car(4, ObjectClass::Motorcycle, [60.0, LANE, 0.0, 20.0], MotionSpec::ConstantAccel { accel: -0.5 }),
            // oncoming lane behind the barrier
            car(5, ObjectClass::Bus, [120.0, 3.0 * LANE, PI, 20.0], MotionSpec::ConstantVelocity),
        ];
        let ego = Target::new(
            u64::MAX,
            ObjectClass::Car,
            TargetState {
                speed: 20.0,
                ..Default::default()
            },
            MotionSpec::ConstantVelocity,
        );

        Scenario {
            name: "highway".into(),
            seed,
            duration: 20.0,
            sim_dt: 0.01,
            ego,
            targets,
            sensors: vec![
                SensorSpec::lidar("lidar"),
                SensorSpec::front_radar("front_radar"),
                SensorSpec::camera("camera"),
            ],
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 3: Intersection
    // -----------------------------------------------------------------------
    fn intersection(seed: u64) -> Self {
        let targets = vec![
            // cross traffic, both directions
            car(0, ObjectClass::Car, [0.0, -40.0, FRAC_PI_2, 10.0], MotionSpec::ConstantVelocity),
            car(1, ObjectClass::Car, [4.0, 45.0, -FRAC_PI_2, 9.0], MotionSpec::ConstantVelocity),
            car(2, ObjectClass::Truck, [-3.5, -70.0, FRAC_PI_2, 8.0], MotionSpec::ConstantVelocity)
                .with_window(Some(2.0), None),
            // pedestrians on the crosswalk
            car(3, ObjectClass::Pedestrian, [-8.0, -6.0, FRAC_PI_2, 1.4], MotionSpec::ConstantVelocity),
            car(4, ObjectClass::Pedestrian, [-7.0, 6.0, -FRAC_PI_2, 1.2], MotionSpec::ConstantVelocity)
                .with_window(Some(3.0), None),
            // bicycle turning right in front of the ego
            car(
                5,
                ObjectClass::Bicycle,
                [-20.0, 2.0, 0.0, 5.0],
                MotionSpec::Segmented {
                    segments: vec![
                        (0.0, MotionSpec::ConstantVelocity),
                        (3.0, MotionSpec::ConstantTurn { yaw_rate: -0.6 }),
                        (3.0 + FRAC_PI_2 / 0.6, MotionSpec::ConstantVelocity),
                    ],
                },
            ),
        ];
        let mut ego = parked_ego();
        ego.state.x = -15.0;
        ego.state.y = -2.0;

        Scenario {
            name: "intersection".into(),
            seed,
            duration: 20.0,
            sim_dt: 0.01,
            ego,
            targets,
            sensors: vec![SensorSpec::lidar("lidar"), SensorSpec::camera("camera")],
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 4: Dense
    // -----------------------------------------------------------------------
    fn dense(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(1));
        let classes = [
            ObjectClass::Car,
            ObjectClass::Car,
            ObjectClass::Car,
            ObjectClass::Truck,
            ObjectClass::Bicycle,
            ObjectClass::Pedestrian,
        ];

        let targets = (0..60)
            .map(|i| {
                let class = classes[rng.gen_range(0..classes.len())];
                let r = 8.0 + rng.gen::<f64>() * 60.0;
                let bearing = rng.gen::<f64>() * 2.0 * PI;
                let speed = match class {
                    ObjectClass::Pedestrian => 0.5 + rng.gen::<f64>(),
                    ObjectClass::Bicycle => 3.0 + rng.gen::<f64>() * 3.0,
                    _ => 5.0 + rng.gen::<f64>() * 10.0,
                };
                let yaw = rng.gen::<f64>() * 2.0 * PI - PI;
                let motion = if rng.gen::<f64>() < 0.3 {
                    MotionSpec::ConstantTurn {
                        yaw_rate: rng.gen::<f64>() * 0.4 - 0.2,
                    }
                } else {
                    MotionSpec::ConstantVelocity
                };
                car(i, class, [r * bearing.cos(), r * bearing.sin(), yaw, speed], motion)
            })
            .collect();

        Scenario {
            name: "dense".into(),
            seed,
            duration: 15.0,
            sim_dt: 0.01,
            ego: parked_ego(),
            targets,
            sensors: vec![
                SensorSpec::lidar("lidar"),
                SensorSpec::front_radar("front_radar"),
            ],
        }
    }
}

/// Replace the channel tables of `base` with one channel per sensor.
pub(crate) fn channel_config(mut base: EngineConfig, sensors: &[SensorSpec]) -> EngineConfig {
    base.selected_input_channels.clear();
    base.input_channels.clear();
    for spec in sensors {
        base = base.with_channel(
            &spec.key,
            ChannelConfig {
                can_spawn_new_tracker: spec.can_spawn_new_tracker,
                ..ChannelConfig::new(format!("/sensing/{}/objects", spec.key))
            },
        );
    }
    base
}

fn parked_ego() -> Target {
    Target::new(
        u64::MAX,
        ObjectClass::Car,
        TargetState::default(),
        MotionSpec::ConstantVelocity,
    )
}

// Helper: build a target from `[x, y, yaw, speed]`.
fn car(id: u64, class: ObjectClass, s: [f64; 4], motion: MotionSpec) -> Target {
    Target::new(
        id,
        class,
        TargetState {
            x: s[0],
            y: s[1],
            yaw: s[2],
            speed: s[3],
        },
        motion,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn every_scenario_has_a_valid_engine_config() {
        for kind in ScenarioKind::value_variants() {
            let scenario = Scenario::build(*kind, 7);
            let config = scenario.engine_config(EngineConfig::default());
            config.validate().unwrap();
            assert_eq!(config.selected_input_channels.len(), scenario.sensors.len());
        }
    }

    #[test]
    fn radar_channel_cannot_spawn() {
        let scenario = Scenario::build(ScenarioKind::Highway, 7);
        let config = scenario.engine_config(EngineConfig::default());
        assert!(!config.input_channels["front_radar"].can_spawn_new_tracker);
        assert!(config.input_channels["lidar"].can_spawn_new_tracker);
    }

    #[test]
    fn dense_scenario_is_seeded() {
        let a = Scenario::build(ScenarioKind::Dense, 3);
        let b = Scenario::build(ScenarioKind::Dense, 3);
        let c = Scenario::build(ScenarioKind::Dense, 4);
        assert_eq!(a.targets, b.targets);
        assert_ne!(a.targets, c.targets);
    }
}
