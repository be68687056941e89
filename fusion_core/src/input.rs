//! Per-channel detection buffering and the measurement-cycle trigger.

use crate::{
    error::{FusionError, Result},
    types::{ChannelId, DetectionBatch, Time},
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Input buffering parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputManagerConfig {
    /// A cycle is triggered once the oldest pending batch waited this long,
    /// even if some channels are silent (s)
    pub readiness_timeout: f64,
    /// Per-channel buffer capacity; the oldest batch is dropped on overflow
    pub max_buffered_batches: usize,
}

impl Default for InputManagerConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: 0.1,
            max_buffered_batches: 8,
        }
    }
}

/// Static description of one input channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputChannel {
    pub name: String,
    pub short_name: String,
    pub can_spawn_new_tracker: bool,
}

struct ChannelBuffer {
    info: InputChannel,
    /// (batch, arrival time)
    pending: VecDeque<(DetectionBatch, Time)>,
    received: u64,
    dropped: u64,
}

/// Buffers batches from every channel and decides when a cycle may run.
pub struct InputManager {
    config: InputManagerConfig,
    channels: Vec<ChannelBuffer>,
    last_consumed: Option<Time>,
}

impl InputManager {
    pub fn new(config: InputManagerConfig, channels: Vec<InputChannel>) -> Result<Self> {
        if channels.is_empty() {
            return Err(FusionError::NoInputChannels);
        }
        Ok(Self {
            config,
            channels: channels
                .into_iter()
                .map(|info| ChannelBuffer {
                    info,
                    pending: VecDeque::new(),
                    received: 0,
                    dropped: 0,
                })
                .collect(),
            last_consumed: None,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Result<&InputChannel> {
        self.channels
            .get(index)
            .map(|c| &c.info)
            .ok_or(FusionError::UnknownChannel(index))
    }

    pub fn is_channel_spawn_enabled(&self, index: usize) -> Result<bool> {
        self.channel(index).map(|c| c.can_spawn_new_tracker)
    }

    /// Timestamp of the newest batch handed out so far.
    pub fn last_consumed(&self) -> Option<Time> {
        self.last_consumed
    }

    /// Batches dropped because a channel buffer overflowed.
    pub fn dropped(&self, index: usize) -> Result<u64> {
        self.channels
            .get(index)
            .map(|c| c.dropped)
            .ok_or(FusionError::UnknownChannel(index))
    }

    /// Store `batch` for channel `index`. Returns whether a cycle is ready.
    pub fn push(&mut self, index: usize, mut batch: DetectionBatch, now: Time) -> Result<bool> {
        let capacity = self.config.max_buffered_batches.max(1);
        let channel = self
            .channels
            .get_mut(index)
            .ok_or(FusionError::UnknownChannel(index))?;
        batch.channel = ChannelId(index);
        if channel.pending.len() >= capacity {
            channel.pending.pop_front();
            channel.dropped += 1;
            tracing::warn!(channel = %channel.info.name, capacity, "input buffer full, dropping oldest batch");
        }
        channel.pending.push_back((batch, now));
        channel.received += 1;
        Ok(self.is_ready(now))
    }

    fn is_fresh(&self, t: Time) -> bool {
        self.last_consumed.map_or(true, |last| t > last)
    }

    /// Every channel holds a fresh batch, or the oldest pending batch has
    /// waited longer than the readiness timeout.
    pub fn is_ready(&self, now: Time) -> bool {
        let all_fresh = self.channels.iter().all(|c| {
            c.pending
                .iter()
                .any(|(batch, _)| self.is_fresh(batch.timestamp))
        });
        if all_fresh {
            return true;
        }
        self.channels
            .iter()
            .flat_map(|c| c.pending.iter().map(|(_, arrival)| *arrival))
            .fold(None, |oldest: Option<Time>, t| {
                Some(oldest.map_or(t, |o| o.min(t)))
            })
            .is_some_and(|oldest| now - oldest > self.config.readiness_timeout)
    }

    /// Drain all buffers if ready. Fresh batches come back ordered by
    /// timestamp (ties by channel index); stale ones are dropped.
    pub fn take_ready(&mut self, now: Time) -> Option<Vec<DetectionBatch>> {
        if !self.is_ready(now) {
            return None;
        }
        let last = self.last_consumed;
        let mut batches = Vec::new();
        for channel in &mut self.channels {
            for (batch, _) in channel.pending.drain(..) {
                if last.map_or(true, |l| batch.timestamp > l) {
                    batches.push(batch);
                } else {
                    tracing::debug!(
                        channel = %channel.info.name,
                        stamp = batch.timestamp,
                        "dropping stale batch"
                    );
                }
            }
        }
        // stable: equal stamps keep channel order
        batches.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        if let Some(newest) = batches.last() {
            self.last_consumed = Some(newest.timestamp);
        }
        Some(batches)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
