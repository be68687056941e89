//! `fusion_core` — multi-channel object tracking engine.
//!
//! # Module layout
//! - [`types`]        — IDs, classes, kinematics, shapes, batches, outputs
//! - [`geometry`]     — 2D transforms, footprints, polygon IoU
//! - [`motion_model`] — constant-velocity / CTRV filters behind one enum
//! - [`uncertainty`]  — odometry uncertainty and covariance normalisation
//! - [`gating`]       — per-class-pair gates and the association score
//! - [`association`]  — bipartite graph, connected components, Hungarian solver
//! - [`track`]        — Track struct and phase logic
//! - [`processor`]    — predict / update / spawn / prune
//! - [`input`]        — per-channel buffering and cycle trigger
//! - [`scheduler`]    — publish rate cap and staleness bound
//! - [`transform`]    — frame lookup capability and in-memory buffer
//! - [`engine`]       — orchestrator and output sinks
//! - [`runtime`]      — serialized event loop and clocks
//! - [`config`]       — engine configuration
//! - [`metrics`]      — RMSE, ID-switch, precision/recall

pub mod association;
pub mod config;
pub mod engine;
pub mod error;
pub mod gating;
pub mod geometry;
pub mod input;
pub mod metrics;
pub mod motion_model;
pub mod processor;
pub mod runtime;
pub mod scheduler;
pub mod track;
pub mod transform;
pub mod types;
pub mod uncertainty;

pub use config::{ChannelConfig, EngineConfig};
pub use engine::{CycleStats, MemorySink, ObjectSink, TrackerEngine};
pub use error::{FusionError, Result};
pub use geometry::Transform2D;
pub use track::Track;
pub use transform::{TransformBuffer, TransformProvider};
pub use types::{
    ChannelId, ClassDistribution, DetectedObject, DetectionBatch, Kinematics, ObjectClass,
    Shape, Time, TrackId, TrackPhase, TrackedObject, TrackedObjects,
};
