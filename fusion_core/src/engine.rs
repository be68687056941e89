//! Engine orchestrator: the full measurement cycle for every ready batch and
//! the publish path.
//!
//! # Processing steps per batch
//! 1. Drop non-finite detections
//! 2. Look up `ego → world` and `sensor → world` (skip the batch on failure)
//! 3. Transform detections to the world frame
//! 4. Optionally inflate covariance by ego-motion uncertainty, then normalise
//! 5. Predict all tracks to the batch timestamp
//! 6. Gate + score, then global assignment
//! 7. Update matched tracks
//! 8. Spawn tentative tracks for unmatched detections (spawn-enabled channels)
//! 9. Prune

use crate::{
    association::DataAssociation,
    config::EngineConfig,
    error::Result,
    input::InputManager,
    processor::{SpawnStats, TrackProcessor},
    scheduler::PublishScheduler,
    track::Track,
    transform::TransformProvider,
    types::{ChannelId, DetectionBatch, Time, TrackedObjects},
    uncertainty::{add_odometry_uncertainty, normalize_uncertainty, Odometry},
};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Destination of published track sets.
pub trait ObjectSink: Send {
    /// Number of consumers; publishing is skipped when zero.
    fn subscriber_count(&self) -> usize;
    fn publish(&mut self, objects: &TrackedObjects);
}

/// Sink that keeps every published set in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    published: Arc<Mutex<Vec<TrackedObjects>>>,
    subscribers: usize,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::with_subscribers(1)
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscribers(subscribers: usize) -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            subscribers,
        }
    }

    /// Shared view of the published sets; stays valid after the sink moved
    /// into an engine.
    pub fn handle(&self) -> Arc<Mutex<Vec<TrackedObjects>>> {
        Arc::clone(&self.published)
    }
}

impl ObjectSink for MemorySink {
    fn subscriber_count(&self) -> usize {
        self.subscribers
    }

    fn publish(&mut self, objects: &TrackedObjects) {
        if let Ok(mut published) = self.published.lock() {
            published.push(objects.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Running counters over the engine's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub batches_processed: u64,
    /// Batches skipped because a transform was unavailable
    pub batches_skipped: u64,
    /// Non-finite detections dropped
    pub objects_dropped: u64,
    pub tracks_spawned: u64,
    pub tracks_confirmed: u64,
    pub tracks_pruned: u64,
    pub publishes: u64,
    /// Wall time of the last measurement cycle (µs)
    pub last_cycle_us: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Multi-channel tracking engine. Single owner; every entry point runs to
/// completion. Times are seconds on the caller's clock, whose epoch is the
/// engine construction.
pub struct TrackerEngine<T: TransformProvider> {
    config: EngineConfig,
    transforms: T,
    input: InputManager,
    association: DataAssociation,
    processor: TrackProcessor,
    scheduler: PublishScheduler,
    sink: Box<dyn ObjectSink>,
    tentative_sink: Option<Box<dyn ObjectSink>>,
    stats: CycleStats,
}

impl<T: TransformProvider> TrackerEngine<T> {
    pub fn new(config: EngineConfig, transforms: T, sink: Box<dyn ObjectSink>) -> Result<Self> {
        config.validate()?;
        let channels = config.channels()?;
        let channel_count = channels.len();
        let input = InputManager::new(config.input, channels)?;
        let association = DataAssociation::new(&config.association)?;
        let processor = TrackProcessor::new(
            config.processor.clone(),
            config.motion_models()?,
            channel_count,
            config.world_frame_id.clone(),
        );
        let scheduler = PublishScheduler::new(
            config.publish_rate,
            config.enable_delay_compensation,
            0.0,
        )?;
        tracing::info!(
            channels = channel_count,
            publish_rate = config.publish_rate,
            delay_compensation = config.enable_delay_compensation,
            world = %config.world_frame_id,
            "tracker engine initialised"
        );
        Ok(Self {
            config,
            transforms,
            input,
            association,
            processor,
            scheduler,
            sink,
            tentative_sink: None,
            stats: CycleStats::default(),
        })
    }

    /// Secondary output for Tentative tracks.
    pub fn with_tentative_sink(mut self, sink: Box<dyn ObjectSink>) -> Self {
        self.tentative_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn tracks(&self) -> &[Track] {
        self.processor.tracks()
    }

    pub fn transforms_mut(&mut self) -> &mut T {
        &mut self.transforms
    }

    /// Polling period when delay compensation is enabled.
    pub fn timer_period(&self) -> Option<f64> {
        self.scheduler.timer_period()
    }

    /// A detection set arrived on channel `channel`.
    pub fn on_detections(&mut self, channel: usize, batch: DetectionBatch, now: Time) -> Result<()> {
        if self.input.push(channel, batch, now)? {
            self.on_trigger(now);
        }
        Ok(())
    }

    /// Process every ready batch, oldest first, then run the event publish
    /// path.
    pub fn on_trigger(&mut self, now: Time) {
        let Some(batches) = self.input.take_ready(now) else {
            return;
        };
        let started = Instant::now();
        let mut latest = None;
        for batch in batches {
            let stamp = batch.timestamp;
            if self.run_process(batch) {
                latest = Some(stamp);
            }
        }
        self.stats.cycles += 1;
        self.stats.last_cycle_us = started.elapsed().as_micros() as u64;

        if let Some(latest) = latest {
            self.scheduler.mark_updated(now);
            if let Some(publish_time) = self.scheduler.on_cycle_complete(latest) {
                self.check_and_publish(publish_time, now);
            }
        }
    }

    /// Timer path. Also drains input that became ready only through the
    /// readiness timeout.
    pub fn on_timer(&mut self, now: Time) {
        if self.input.is_ready(now) {
            self.on_trigger(now);
        }
        if !self.scheduler.delay_compensation() {
            return;
        }
        if let Some(publish_time) = self.scheduler.on_timer(now) {
            self.check_and_publish(publish_time, now);
        }
    }

    /// One measurement cycle. Returns `false` if the batch was skipped.
    pub fn run_process(&mut self, mut batch: DetectionBatch) -> bool {
        let time = batch.timestamp;
        let channel = batch.channel;

        let before = batch.objects.len();
        batch
            .objects
            .retain(|o| o.kinematics.is_finite() && o.shape.is_valid());
        let dropped = before - batch.objects.len();
        if dropped > 0 {
            tracing::debug!(%channel, dropped, "dropping malformed detections");
            self.stats.objects_dropped += dropped as u64;
        }

        let world = self.config.world_frame_id.as_str();
        let Some(ego) = self.transforms.lookup(world, &self.config.ego_frame_id, time) else {
            tracing::warn!(%channel, time, frame = %self.config.ego_frame_id, "no ego transform, skipping batch");
            self.stats.batches_skipped += 1;
            return false;
        };
        let Some(sensor) = self.transforms.lookup(world, &batch.frame_id, time) else {
            tracing::warn!(%channel, time, frame = %batch.frame_id, "no sensor transform, skipping batch");
            self.stats.batches_skipped += 1;
            return false;
        };

        let mut objects: Vec<_> = batch
            .objects
            .iter()
            .map(|o| sensor.transform_object(o))
            .collect();
        if self.config.consider_odometry_uncertainty {
            add_odometry_uncertainty(&Odometry::modelled(ego, time), &mut objects);
        }
        normalize_uncertainty(&mut objects, &self.config.uncertainty);
        let batch = DetectionBatch {
            channel,
            timestamp: time,
            frame_id: self.config.world_frame_id.clone(),
            objects,
        };

        self.processor.predict(time);
        let matrix = self
            .association
            .calc_score_matrix(&batch.objects, self.processor.tracks());
        let assignment = self.association.assign(&matrix);
        let confirmed = self.processor.update(&batch, &ego, &assignment.direct);

        // unknown channels never reach here; InputManager rejects them on push
        let spawned = if self.input.is_channel_spawn_enabled(channel.0).unwrap_or(false) {
            self.processor.spawn(&batch, &assignment.reverse)
        } else {
            SpawnStats::default()
        };
        let pruned = self.processor.prune(time).total();

        self.stats.batches_processed += 1;
        self.stats.tracks_confirmed += (confirmed + spawned.confirmed) as u64;
        self.stats.tracks_spawned += spawned.created as u64;
        self.stats.tracks_pruned += pruned as u64;
        tracing::debug!(
            %channel,
            time,
            detections = batch.objects.len(),
            matched = assignment.len(),
            spawned = spawned.created,
            pruned,
            tracks = self.processor.len(),
            "measurement cycle"
        );
        true
    }

    /// Prune to `time` and publish, if anyone listens.
    pub fn check_and_publish(&mut self, time: Time, now: Time) {
        self.stats.tracks_pruned += self.processor.prune(time).total() as u64;

        if self.sink.subscriber_count() > 0 {
            let output = self.processor.tracked_objects(time);
            self.sink.publish(&output);
            self.stats.publishes += 1;
            tracing::trace!(stamp = time, objects = output.objects.len(), "published");
        }
        if let Some(tentative) = self
            .tentative_sink
            .as_mut()
            .filter(|s| s.subscriber_count() > 0)
        {
            tentative.publish(&self.processor.tentative_objects(time));
        }
        self.scheduler.mark_published(now);
    }

    /// Channel index of a configured channel key.
    pub fn channel_index(&self, key: &str) -> Option<ChannelId> {
        self.config
            .selected_input_channels
            .iter()
            .position(|k| k == key)
            .map(ChannelId)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
