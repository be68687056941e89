//! Serialized event loop.
//!
//! Producers (one per sensor channel, any thread) send [`EngineEvent`]s
//! through an [`EngineHandle`]. [`run`] owns the engine and `select!`s over
//! that queue and a ticker, so every unit of work runs to completion before
//! the next starts.

use crate::{
    engine::TrackerEngine,
    error::{FusionError, Result},
    transform::TransformProvider,
    types::{DetectionBatch, Time},
};
use crossbeam::channel::{self, select, Receiver, Sender};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Work items for the engine loop.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Detections { channel: usize, batch: DetectionBatch },
    Shutdown,
}

/// Cloneable producer side of the engine queue.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    sender: Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn send_detections(&self, channel: usize, batch: DetectionBatch) -> Result<()> {
        self.sender
            .send(EngineEvent::Detections { channel, batch })
            .map_err(|_| FusionError::QueueClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.sender
            .send(EngineEvent::Shutdown)
            .map_err(|_| FusionError::QueueClosed)
    }
}

/// Create the engine queue.
pub fn event_channel() -> (EngineHandle, Receiver<EngineEvent>) {
    let (sender, receiver) = channel::unbounded();
    (EngineHandle { sender }, receiver)
}

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Source of engine time (seconds).
pub trait Clock {
    fn now(&self) -> Time;
}

/// Seconds since construction.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Time {
        self.start.elapsed().as_secs_f64()
    }
}

/// Externally driven clock; clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Time) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    pub fn set(&self, t: Time) {
        self.bits.store(t.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) {
        self.set(self.now() + dt);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Drive `engine` until a `Shutdown` event arrives or every handle is
/// dropped.
///
/// The ticker runs at the publish-timer period with delay compensation, and
/// at the readiness timeout otherwise so silent channels cannot stall a
/// cycle.
pub fn run<T, C>(engine: &mut TrackerEngine<T>, clock: &C, events: &Receiver<EngineEvent>)
where
    T: TransformProvider,
    C: Clock,
{
    let period = engine
        .timer_period()
        .unwrap_or(engine.config().input.readiness_timeout);
    let ticker = if period > 0.0 {
        channel::tick(Duration::from_secs_f64(period))
    } else {
        channel::never()
    };
    tracing::info!(period, "engine loop started");

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(EngineEvent::Detections { channel, batch }) => {
                    if let Err(e) = engine.on_detections(channel, batch, clock.now()) {
                        tracing::warn!(channel, error = %e, "rejected detections");
                    }
                }
                Ok(EngineEvent::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                let now = clock.now();
                engine.on_timer(now);
            }
        }
    }
    tracing::info!(stats = ?engine.stats(), "engine loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ChannelConfig, EngineConfig},
        engine::MemorySink,
        geometry::Transform2D,
        transform::TransformBuffer,
        types::ChannelId,
    };
    use std::thread;

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new(1.0);
        let other = clock.clone();
        other.advance(0.5);
        assert_eq!(clock.now(), 1.5);
    }

    #[test]
    fn loop_processes_events_from_producers() {
        let config = EngineConfig::default()
            .with_channel("a", ChannelConfig::new("/a"))
            .with_channel("b", ChannelConfig::new("/b"));
        let mut tf = TransformBuffer::new(0.0);
        tf.set_static("map", "base_link", Transform2D::identity());
        let sink = MemorySink::new();
        let published = sink.handle();
        let mut engine = TrackerEngine::new(config, tf, Box::new(sink)).unwrap();

        let (handle, events) = event_channel();
        let producers: Vec<_> = (0..2)
            .map(|channel| {
                let handle = handle.clone();
                thread::spawn(move || {
                    let batch = DetectionBatch::new(ChannelId(channel), 1.0, "base_link");
                    handle.send_detections(channel, batch)
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap().unwrap();
        }
        handle.shutdown().unwrap();

        let clock = ManualClock::new(1.0);
        run(&mut engine, &clock, &events);
        assert_eq!(engine.stats().batches_processed, 2);
        assert_eq!(published.lock().unwrap().len(), 1);
    }

    #[test]
    fn closed_queue_is_reported() {
        let (handle, events) = event_channel();
        drop(events);
        assert!(matches!(handle.shutdown(), Err(FusionError::QueueClosed)));
    }
}
