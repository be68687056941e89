//! `sim` — Scenario simulator: road users, detection sensors, replay and
//! offline playback through the tracking engine.

pub mod playback;
pub mod replay;
pub mod scenarios;
pub mod sensor_sim;
pub mod target;

pub use playback::{play, PlaybackOptions, PlaybackReport};
pub use replay::{load_replay, save_replay, GroundTruthFrame, ReplayLog};
pub use scenarios::{Scenario, ScenarioKind};
pub use sensor_sim::{SensorSimulator, SensorSpec, TimedBatch};
pub use target::{MotionSpec, Target, TargetState};
