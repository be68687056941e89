//! Error type shared by every engine component.

use thiserror::Error;

/// Errors raised while building or driving the fusion engine.
///
/// Runtime conditions that the engine recovers from on its own (missing
/// transforms, empty batches, unmatched detections) are logged, not returned.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("no input channels are configured")]
    NoInputChannels,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown input channel index {0}")]
    UnknownChannel(usize),

    #[error("unknown object class '{0}'")]
    UnknownClass(String),

    #[error("unknown motion model '{0}'")]
    UnknownMotionModel(String),

    #[error("engine event queue is closed")]
    QueueClosed,

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, FusionError>;
