//! Track lifecycle: predict / update / spawn / prune.
//!
//! # State machine
//! ```text
//!  spawn ──► Tentative ──(counter ≥ class threshold)──► Confirmed
//!                │                                         │
//!                └────── lifetime expiry / faded / IoU ────┴──► removed
//! ```
//!
//! # Existence score
//! Raised on every match, `s ← s + gain · (1 − s)`, and decayed with the time
//! since the last update, `s(t) = s_update · exp(−(t − t_update) / decay_time)`.

use crate::{
    error::{FusionError, Result},
    geometry::{anchor_offset, iou_2d, Transform2D},
    motion_model::{MotionModel, MotionModelKind, MotionNoiseConfig},
    track::Track,
    types::{
        DetectionBatch, DetectedObject, ObjectClass, Shape, Time, TrackId, TrackPhase,
        TrackedObjects,
    },
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Existence-score parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExistenceConfig {
    /// Lower bound of the score given to a freshly spawned track
    pub initial: f64,
    /// Fraction of the remaining gap to 1 closed on each match
    pub gain: f64,
    /// Decay time constant (s)
    pub decay_time: f64,
    /// Tracks whose decayed score falls below this are removed
    pub min_existence: f64,
}

impl Default for ExistenceConfig {
    fn default() -> Self {
        Self {
            initial: 0.5,
            gain: 0.5,
            decay_time: 1.0,
            min_existence: 0.1,
        }
    }
}

/// Track lifecycle configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Max time without update before a track is removed (s)
    pub tracker_lifetime: f64,
    /// IoU above which the weaker of two known-class tracks is removed
    pub min_known_object_removal_iou: f64,
    /// Same, when either track is UNKNOWN
    pub min_unknown_object_removal_iou: f64,
    /// Pairs farther apart than this are never compared by IoU (m)
    pub distance_threshold: f64,
    /// Matched-update count at which a track becomes Confirmed, per label
    pub confident_count_threshold: BTreeMap<ObjectClass, u32>,
    /// Saturation value of the confirmation counter
    pub max_confirmation_count: u32,
    /// Weight of a new measurement in the shape average
    pub shape_smoothing: f64,
    /// Weight of a new measurement in the class belief
    pub class_blend: f64,
    pub existence: ExistenceConfig,
    pub motion_noise: MotionNoiseConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tracker_lifetime: 1.0,
            min_known_object_removal_iou: 0.1,
            min_unknown_object_removal_iou: 0.001,
            distance_threshold: 5.0,
            confident_count_threshold: ObjectClass::ALL.into_iter().map(|c| (c, 3)).collect(),
            max_confirmation_count: 10,
            shape_smoothing: 0.3,
            class_blend: 0.3,
            existence: ExistenceConfig::default(),
            motion_noise: MotionNoiseConfig::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn confirmation_threshold(&self, class: ObjectClass) -> u32 {
        self.confident_count_threshold.get(&class).copied().unwrap_or(3)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(FusionError::InvalidConfig(msg.to_string()));
        if !(self.tracker_lifetime > 0.0) {
            return invalid("tracker_lifetime must be positive");
        }
        if !(self.distance_threshold >= 0.0) {
            return invalid("distance_threshold must be non-negative");
        }
        if self.max_confirmation_count == 0 {
            return invalid("max_confirmation_count must be at least 1");
        }
        if self
            .confident_count_threshold
            .values()
            .any(|&n| n == 0 || n > self.max_confirmation_count)
        {
            return invalid("confident_count_threshold must be in 1..=max_confirmation_count");
        }
        let e = &self.existence;
        if !(0.0..=1.0).contains(&e.initial) || !(0.0..=1.0).contains(&e.gain) {
            return invalid("existence initial and gain must be in [0, 1]");
        }
        if !(e.decay_time > 0.0) {
            return invalid("existence decay_time must be positive");
        }
        if !(e.min_existence < e.initial) {
            return invalid("existence min_existence must be below initial");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Counts of tracks removed by one prune pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub expired: usize,
    pub faded: usize,
    pub suppressed: usize,
}

impl PruneStats {
    pub fn total(&self) -> usize {
        self.expired + self.faded + self.suppressed
    }
}

/// Tracks created by one spawn pass, and how many of them start Confirmed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpawnStats {
    pub created: usize,
    pub confirmed: usize,
}

/// Owns the track collection.
pub struct TrackProcessor {
    config: ProcessorConfig,
    models: BTreeMap<ObjectClass, MotionModelKind>,
    channel_count: usize,
    frame_id: String,
    tracks: Vec<Track>,
    next_id: u64,
}

impl TrackProcessor {
    pub fn new(
        config: ProcessorConfig,
        models: BTreeMap<ObjectClass, MotionModelKind>,
        channel_count: usize,
        frame_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            models,
            channel_count,
            frame_id: frame_id.into(),
            tracks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn model_kind(&self, class: ObjectClass) -> MotionModelKind {
        self.models.get(&class).copied().unwrap_or(match class {
            ObjectClass::Pedestrian | ObjectClass::Bicycle | ObjectClass::Unknown => {
                MotionModelKind::ConstantVelocity
            }
            _ => MotionModelKind::ConstantTurnRate,
        })
    }

    /// Advance every track to `time`.
    pub fn predict(&mut self, time: Time) {
        self.tracks
            .par_iter_mut()
            .for_each(|track| track.model.predict(time));
    }

    /// Fold matched measurements into their tracks. `direct` maps track
    /// index → measurement index; unmatched tracks keep their prediction.
    /// Returns the number of tracks promoted to Confirmed.
    pub fn update(
        &mut self,
        batch: &DetectionBatch,
        self_transform: &Transform2D,
        direct: &BTreeMap<usize, usize>,
    ) -> usize {
        let time = batch.timestamp;
        let channel = batch.channel.0;
        let cfg = &self.config;
        let mut promoted = 0;

        for (&ti, &mi) in direct {
            let (Some(track), Some(object)) = (self.tracks.get_mut(ti), batch.objects.get(mi))
            else {
                continue;
            };

            let measured = anchored(track, object, self_transform);
            if !track.model.update(&measured) {
                tracing::debug!(track = %track.id, "singular innovation, keeping prediction");
            }
            smooth_shape(&mut track.shape, &object.shape, cfg.shape_smoothing);
            track
                .classification
                .blend(&object.classification, cfg.class_blend);

            let e = cfg.existence;
            track.existence = (track.existence + e.gain * (1.0 - track.existence)).min(1.0);
            track.confirmation_count = (track.confirmation_count + 1).min(cfg.max_confirmation_count);
            if track.channel_hits.len() <= channel {
                track.channel_hits.resize(channel + 1, 0);
            }
            track.channel_hits[channel] = track.channel_hits[channel].saturating_add(1);
            track.last_updated = time;

            if track.refresh_phase(cfg.confirmation_threshold(track.label())) {
                tracing::debug!(track = %track.id, "confirmed");
                promoted += 1;
            }
        }
        promoted
    }

    /// Create a track for every measurement absent from `reverse`. A new track
    /// starts Tentative unless its class threshold is already met.
    pub fn spawn(&mut self, batch: &DetectionBatch, reverse: &BTreeMap<usize, usize>) -> SpawnStats {
        let mut stats = SpawnStats::default();
        for (mi, object) in batch.objects.iter().enumerate() {
            if reverse.contains_key(&mi) {
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id += 1;
            let kind = self.model_kind(object.label());
            let model = MotionModel::new(kind, object, batch.timestamp, self.config.motion_noise.clone());
            let existence = object
                .existence_probability
                .clamp(0.0, 1.0)
                .max(self.config.existence.initial);
            let mut track = Track::new(
                id,
                model,
                object,
                existence,
                batch.channel.0,
                self.channel_count,
                batch.timestamp,
            );
            if track.refresh_phase(self.config.confirmation_threshold(object.label())) {
                tracing::debug!(track = %id, "confirmed on spawn");
                stats.confirmed += 1;
            }
            self.tracks.push(track);
            stats.created += 1;
        }
        stats
    }

    /// Remove expired, faded and overlapping tracks.
    pub fn prune(&mut self, time: Time) -> PruneStats {
        let cfg = &self.config;
        let mut stats = PruneStats::default();

        let before = self.tracks.len();
        self.tracks
            .retain(|t| time - t.last_updated <= cfg.tracker_lifetime);
        stats.expired = before - self.tracks.len();

        let before = self.tracks.len();
        let decay = cfg.existence.decay_time;
        let min_existence = cfg.existence.min_existence;
        self.tracks.retain(|t| {
            t.last_updated >= time || t.existence_at(time, decay) >= min_existence
        });
        stats.faded = before - self.tracks.len();

        let losers = self.overlap_losers(time);
        if !losers.is_empty() {
            let mut idx = 0;
            self.tracks.retain(|_| {
                let keep = !losers.contains(&idx);
                idx += 1;
                keep
            });
        }
        stats.suppressed = losers.len();

        if stats.total() > 0 {
            tracing::debug!(
                expired = stats.expired,
                faded = stats.faded,
                suppressed = stats.suppressed,
                remaining = self.tracks.len(),
                "pruned tracks"
            );
        }
        stats
    }

    /// Indices of tracks that lose an overlap contest, ascending.
    fn overlap_losers(&self, time: Time) -> Vec<usize> {
        let cfg = &self.config;
        let n = self.tracks.len();
        let poses: Vec<_> = self.tracks.iter().map(Track::kinematics).collect();
        let mut removed = vec![false; n];

        for i in 0..n {
            for j in (i + 1)..n {
                if removed[i] {
                    break;
                }
                if removed[j] {
                    continue;
                }
                let (a, b) = (&self.tracks[i], &self.tracks[j]);
                let (pa, pb) = (&poses[i], &poses[j]);
                if !((pa.x - pb.x).hypot(pa.y - pb.y) <= cfg.distance_threshold) {
                    continue;
                }
                let (la, lb) = (a.label(), b.label());
                let threshold = if la.is_known() && lb.is_known() {
                    cfg.min_known_object_removal_iou
                } else {
                    cfg.min_unknown_object_removal_iou
                };
                if !(iou_2d(&a.shape, pa, &b.shape, pb) > threshold) {
                    continue;
                }
                let loser = match la.priority().cmp(&lb.priority()) {
                    std::cmp::Ordering::Less => i,
                    std::cmp::Ordering::Greater => j,
                    std::cmp::Ordering::Equal => {
                        let ea = a.existence_at(time, cfg.existence.decay_time);
                        let eb = b.existence_at(time, cfg.existence.decay_time);
                        if ea < eb {
                            i
                        } else if eb < ea {
                            j
                        } else if a.id > b.id {
                            i
                        } else {
                            j
                        }
                    }
                };
                tracing::trace!(
                    kept = %self.tracks[i + j - loser].id,
                    removed = %self.tracks[loser].id,
                    "overlapping tracks"
                );
                removed[loser] = true;
            }
        }
        (0..n).filter(|&k| removed[k]).collect()
    }

    fn project(&self, time: Time, phase: TrackPhase) -> TrackedObjects {
        let decay = self.config.existence.decay_time;
        TrackedObjects {
            stamp: time,
            frame_id: self.frame_id.clone(),
            objects: self
                .tracks
                .iter()
                .filter(|t| t.phase == phase)
                .map(|t| t.to_tracked_object(time, decay))
                .collect(),
        }
    }

    /// Confirmed tracks extrapolated to `time`.
    pub fn tracked_objects(&self, time: Time) -> TrackedObjects {
        self.project(time, TrackPhase::Confirmed)
    }

    /// Tentative tracks extrapolated to `time`.
    pub fn tentative_objects(&self, time: Time) -> TrackedObjects {
        self.project(time, TrackPhase::Tentative)
    }
}

/// World-frame kinematics of `object`, shifted so a partially observed box
/// shares its ego-facing surface with the larger tracked box.
fn anchored(
    track: &Track,
    object: &DetectedObject,
    self_transform: &Transform2D,
) -> crate::types::Kinematics {
    let mut k = object.kinematics.clone();
    if let (
        Shape::BoundingBox {
            length: ml,
            width: mw,
            ..
        },
        Shape::BoundingBox {
            length: tl,
            width: tw,
            ..
        },
    ) = (&object.shape, &track.shape)
    {
        let offset = anchor_offset(self_transform, &k, (*ml, *mw), (*tl, *tw));
        k.x += offset.x;
        k.y += offset.y;
    }
    k
}

fn smooth_shape(current: &mut Shape, measured: &Shape, alpha: f64) {
    let a = alpha.clamp(0.0, 1.0);
    let mix = |old: &mut f64, new: f64| *old = (1.0 - a) * *old + a * new;
    match (current, measured) {
        (
            Shape::BoundingBox {
                length,
                width,
                height,
            },
            Shape::BoundingBox {
                length: l,
                width: w,
                height: h,
            },
        ) => {
            mix(length, *l);
            mix(width, *w);
            mix(height, *h);
        }
        (
            Shape::Cylinder { diameter, height },
            Shape::Cylinder {
                diameter: d,
                height: h,
            },
        ) => {
            mix(diameter, *d);
            mix(height, *h);
        }
        (current, measured) => *current = measured.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
