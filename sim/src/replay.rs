//! Replay: record a scenario into a log and (de)serialize it for offline
//! playback.

use crate::{
    scenarios::{channel_config, Scenario},
    sensor_sim::{SensorSimulator, SensorSpec, TimedBatch},
};
use anyhow::Context;
use fusion_core::{
    config::EngineConfig, geometry::Transform2D, metrics::GroundTruth,
    transform::TransformBuffer, types::Time,
};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A full recorded simulation log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayLog {
    pub scenario_name: String,
    pub seed: u64,
    pub sim_dt: f64,
    pub duration: f64,
    pub world_frame_id: String,
    pub ego_frame_id: String,
    /// Sensor descriptions, in channel-index order
    pub sensors: Vec<SensorSpec>,
    /// `base_link → map` at every step
    pub ego_poses: Vec<(Time, Transform2D)>,
    /// All batches in arrival order
    pub batches: Vec<TimedBatch>,
    /// Ground-truth target states, sampled every `sim_dt`
    pub ground_truth: Vec<GroundTruthFrame>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthFrame {
    pub time: Time,
    pub targets: Vec<GroundTruth>,
}

impl ReplayLog {
    /// Run `scenario` to completion and record everything the tracker and
    /// the evaluation need.
    pub fn record(scenario: &Scenario) -> Self {
        let defaults = EngineConfig::default();
        let mut sensors = SensorSimulator::new(scenario.sensors.clone(), scenario.seed);
        let mut ego = scenario.ego.clone();
        let mut targets = scenario.targets.clone();

        let steps = (scenario.duration / scenario.sim_dt).round() as usize;
        let mut ego_poses = Vec::with_capacity(steps + 1);
        let mut ground_truth = Vec::with_capacity(steps + 1);
        let mut batches = Vec::new();

        for k in 0..=steps {
            let t = k as f64 * scenario.sim_dt;
            let pose = ego.pose();
            ego_poses.push((t, pose));
            ground_truth.push(GroundTruthFrame {
                time: t,
                targets: targets
                    .iter()
                    .filter(|target| target.is_active(t))
                    .map(|target| target.ground_truth(t))
                    .collect(),
            });
            batches.extend(sensors.generate_batches(&targets, &pose, t));

            ego.step(t, scenario.sim_dt);
            for target in &mut targets {
                target.step(t, scenario.sim_dt);
            }
        }
        // latencies differ per sensor
        batches.sort_by(|a, b| a.arrival.total_cmp(&b.arrival).then(a.channel.cmp(&b.channel)));

        tracing::info!(
            scenario = %scenario.name,
            steps,
            batches = batches.len(),
            "recorded scenario"
        );
        ReplayLog {
            scenario_name: scenario.name.clone(),
            seed: scenario.seed,
            sim_dt: scenario.sim_dt,
            duration: scenario.duration,
            world_frame_id: defaults.world_frame_id,
            ego_frame_id: defaults.ego_frame_id,
            sensors: scenario.sensors.clone(),
            ego_poses,
            batches,
            ground_truth,
        }
    }

    /// `base` with frame ids and channel tables taken from the log.
    pub fn engine_config(&self, base: EngineConfig) -> EngineConfig {
        let mut config = channel_config(base, &self.sensors);
        config.world_frame_id = self.world_frame_id.clone();
        config.ego_frame_id = self.ego_frame_id.clone();
        config
    }

    /// Transform tree holding the ego trajectory and the sensor mounts.
    pub fn transform_buffer(&self) -> TransformBuffer {
        let mut tf = TransformBuffer::new(0.0);
        for spec in &self.sensors {
            tf.set_static(&self.ego_frame_id, &spec.frame_id, spec.mount);
        }
        for (t, pose) in &self.ego_poses {
            tf.set_transform(&self.world_frame_id, &self.ego_frame_id, *t, *pose);
        }
        tf
    }

    /// Ground-truth frame closest to `time`, if within half a step.
    pub fn truth_at(&self, time: Time) -> Option<&GroundTruthFrame> {
        let idx = self.ground_truth.partition_point(|f| f.time < time);
        let candidates = [idx.checked_sub(1), Some(idx)];
        candidates
            .into_iter()
            .flatten()
            .filter_map(|i| self.ground_truth.get(i))
            .min_by(|a, b| (a.time - time).abs().total_cmp(&(b.time - time).abs()))
            .filter(|f| (f.time - time).abs() <= 0.5 * self.sim_dt + 1e-9)
    }
}

/// Save a replay log to a JSON file.
pub fn save_replay(log: &ReplayLog, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating replay file {}", path.display()))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, log)?;
    Ok(())
}

/// Load a replay log from a JSON file.
pub fn load_replay(path: &Path) -> anyhow::Result<ReplayLog> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening replay file {}", path.display()))?;
    let reader = BufReader::new(file);
    let log: ReplayLog = serde_json::from_reader(reader)
        .with_context(|| format!("parsing replay file {}", path.display()))?;
    Ok(log)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::ScenarioKind;
    use approx::assert_abs_diff_eq;
    use fusion_core::transform::TransformProvider;

    fn short(kind: ScenarioKind) -> Scenario {
        Scenario {
            duration: 2.0,
            ..Scenario::build(kind, 11)
        }
    }

    #[test]
    fn recording_is_deterministic() {
        let scenario = short(ScenarioKind::Highway);
        let a = ReplayLog::record(&scenario);
        let b = ReplayLog::record(&scenario);
        assert_eq!(a.batches, b.batches);
        assert_eq!(a.ground_truth, b.ground_truth);
        assert!(!a.batches.is_empty());
    }

    #[test]
    fn batches_are_in_arrival_order() {
        let log = ReplayLog::record(&short(ScenarioKind::Highway));
        assert!(log.batches.windows(2).all(|w| w[0].arrival <= w[1].arrival));
        // three sensors
        assert!(log.batches.iter().any(|b| b.channel == 2));
    }

    #[test]
    fn transform_buffer_follows_the_ego() {
        let log = ReplayLog::record(&short(ScenarioKind::Highway));
        let tf = log.transform_buffer();
        // ego drives at 20 m/s along x; lidar sits 1.2 m ahead of base_link
        let world_from_lidar = tf.lookup("map", "lidar_link", 1.0).unwrap();
        assert_abs_diff_eq!(world_from_lidar.x, 21.2, epsilon = 1e-6);
        assert_abs_diff_eq!(world_from_lidar.y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn truth_lookup_snaps_to_the_nearest_step() {
        let log = ReplayLog::record(&short(ScenarioKind::Simple));
        let frame = log.truth_at(1.004).unwrap();
        assert_abs_diff_eq!(frame.time, 1.0, epsilon = 1e-9);
        assert!(log.truth_at(5.0).is_none());
    }

    #[test]
    fn replay_round_trip_through_a_file() {
        let log = ReplayLog::record(&short(ScenarioKind::Intersection));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intersection.json");
        save_replay(&log, &path).unwrap();
        let loaded = load_replay(&path).unwrap();
        assert_eq!(loaded.scenario_name, "intersection");
        assert_eq!(loaded.batches.len(), log.batches.len());
        assert_eq!(loaded.ground_truth.len(), log.ground_truth.len());
        assert_eq!(loaded.sensors, log.sensors);
    }

    #[test]
    fn loading_a_missing_file_fails_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_replay(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }
}
