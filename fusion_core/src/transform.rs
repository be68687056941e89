//! Coordinate-frame lookup.
//!
//! The engine only needs [`TransformProvider`]; [`TransformBuffer`] is an
//! in-memory tree of static and time-stamped edges used by the simulator,
//! replay and tests.

use crate::{geometry::Transform2D, types::Time};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Longest parent chain walked before a lookup gives up.
const MAX_CHAIN_DEPTH: usize = 64;

/// Source of rigid transforms between named frames.
pub trait TransformProvider {
    /// Transform mapping points in `source` into `target` at `time`, if known.
    fn lookup(&self, target: &str, source: &str, time: Time) -> Option<Transform2D>;
}

impl<T: TransformProvider + ?Sized> TransformProvider for Arc<RwLock<T>> {
    fn lookup(&self, target: &str, source: &str, time: Time) -> Option<Transform2D> {
        self.read().ok()?.lookup(target, source, time)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct DynamicEdge {
    parent: String,
    /// Ascending by time
    samples: Vec<(Time, Transform2D)>,
}

impl DynamicEdge {
    fn at(&self, time: Time) -> Option<Transform2D> {
        let idx = self.samples.partition_point(|(t, _)| *t < time);
        match (idx.checked_sub(1).map(|i| self.samples[i]), self.samples.get(idx)) {
            (_, Some(&(t, tf))) if t == time => Some(tf),
            (Some((t0, a)), Some(&(t1, b))) => Some(a.interpolate(&b, (time - t0) / (t1 - t0))),
            _ => None,
        }
    }
}

/// Static and time-indexed parent → child edges.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransformBuffer {
    /// child → (parent, child-to-parent)
    static_edges: HashMap<String, (String, Transform2D)>,
    dynamic_edges: HashMap<String, DynamicEdge>,
    /// Samples older than the newest minus this are discarded (s)
    cache_time: f64,
}

impl TransformBuffer {
    pub fn new(cache_time: f64) -> Self {
        Self {
            cache_time,
            ..Self::default()
        }
    }

    pub fn set_static(&mut self, parent: &str, child: &str, transform: Transform2D) {
        self.static_edges
            .insert(child.to_string(), (parent.to_string(), transform));
    }

    /// Record `child` → `parent` at `time`. Out-of-order samples are inserted
    /// in place.
    pub fn set_transform(&mut self, parent: &str, child: &str, time: Time, transform: Transform2D) {
        let edge = self
            .dynamic_edges
            .entry(child.to_string())
            .or_insert_with(|| DynamicEdge {
                parent: parent.to_string(),
                samples: Vec::new(),
            });
        edge.parent = parent.to_string();
        let idx = edge.samples.partition_point(|(t, _)| *t < time);
        match edge.samples.get(idx) {
            Some((t, _)) if *t == time => edge.samples[idx].1 = transform,
            _ => edge.samples.insert(idx, (time, transform)),
        }
        if self.cache_time > 0.0 {
            if let Some(&(newest, _)) = edge.samples.last() {
                let horizon = newest - self.cache_time;
                let keep_from = edge.samples.partition_point(|(t, _)| *t < horizon);
                edge.samples.drain(..keep_from);
            }
        }
    }

    fn parent_of(&self, frame: &str, time: Time) -> Option<Option<(&str, Transform2D)>> {
        if let Some((parent, tf)) = self.static_edges.get(frame) {
            return Some(Some((parent.as_str(), *tf)));
        }
        match self.dynamic_edges.get(frame) {
            Some(edge) => edge.at(time).map(|tf| Some((edge.parent.as_str(), tf))),
            None => Some(None),
        }
    }

    /// Root frame of `frame` and the transform from `frame` into it. `None`
    /// if an edge on the way has no sample covering `time`.
    fn to_root<'a>(&'a self, frame: &'a str, time: Time) -> Option<(&'a str, Transform2D)> {
        let mut current = frame;
        let mut acc = Transform2D::identity();
        for _ in 0..MAX_CHAIN_DEPTH {
            match self.parent_of(current, time)? {
                Some((parent, tf)) => {
                    acc = tf.compose(&acc);
                    current = parent;
                }
                None => return Some((current, acc)),
            }
        }
        None
    }
}

impl TransformProvider for TransformBuffer {
    fn lookup(&self, target: &str, source: &str, time: Time) -> Option<Transform2D> {
        if target == source {
            return Some(Transform2D::identity());
        }
        let (source_root, root_from_source) = self.to_root(source, time)?;
        let (target_root, root_from_target) = self.to_root(target, time)?;
        (source_root == target_root).then(|| root_from_target.inverse().compose(&root_from_source))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Point2;
    use std::f64::consts::FRAC_PI_2;

    fn buffer() -> TransformBuffer {
        let mut tf = TransformBuffer::new(10.0);
        tf.set_transform("map", "base_link", 0.0, Transform2D::new(0.0, 0.0, 0.0));
        tf.set_transform("map", "base_link", 1.0, Transform2D::new(10.0, 0.0, FRAC_PI_2));
        tf.set_static("base_link", "front_radar", Transform2D::new(2.0, 0.0, 0.0));
        tf
    }

    #[test]
    fn chains_static_and_dynamic_edges() {
        let tf = buffer().lookup("map", "front_radar", 1.0).unwrap();
        let p = tf.apply(Point2::new(1.0, 0.0));
        assert_abs_diff_eq!(p.x, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p.y, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn interpolates_between_samples() {
        let tf = buffer().lookup("map", "base_link", 0.5).unwrap();
        assert_abs_diff_eq!(tf.x, 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(tf.yaw, FRAC_PI_2 / 2.0, epsilon = 1e-9);
    }

    #[test]
    fn inverse_lookup() {
        let tf = buffer().lookup("base_link", "map", 0.0).unwrap();
        let p = tf.apply(Point2::new(3.0, 0.0));
        assert_abs_diff_eq!(p.x, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn out_of_range_or_disconnected_is_none() {
        let tf = buffer();
        assert!(tf.lookup("map", "base_link", 1.5).is_none());
        assert!(tf.lookup("map", "lidar", 0.5).is_none());
    }

    #[test]
    fn shared_buffer_is_a_provider() {
        let shared = Arc::new(RwLock::new(buffer()));
        assert!(shared.lookup("map", "base_link", 0.25).is_some());
    }
}
