//! Publish scheduling: rate cap and bounded staleness.
//!
//! With delay compensation enabled a fast timer (`TIMER_MULTIPLIER` × the
//! publish rate) polls [`PublishScheduler::on_timer`]; output is extrapolated
//! to the current time. Without it every completed measurement cycle
//! publishes at the newest measurement time.

use crate::{
    error::{FusionError, Result},
    types::Time,
};

/// Never publish sooner than this fraction of the period after the last one.
pub const MINIMUM_PUBLISH_INTERVAL_RATIO: f64 = 0.85;
/// Always publish once this fraction of the period has elapsed.
pub const MAXIMUM_PUBLISH_INTERVAL_RATIO: f64 = 1.05;
/// Timer rate relative to the publish rate.
pub const TIMER_MULTIPLIER: f64 = 10.0;

#[derive(Clone, Debug)]
pub struct PublishScheduler {
    publisher_period: f64,
    delay_compensation: bool,
    last_published: Time,
    last_updated: Time,
}

impl PublishScheduler {
    pub fn new(publish_rate: f64, delay_compensation: bool, now: Time) -> Result<Self> {
        if !(publish_rate > 0.0 && publish_rate.is_finite()) {
            return Err(FusionError::InvalidConfig(format!(
                "publish_rate must be positive, got {publish_rate}"
            )));
        }
        Ok(Self {
            publisher_period: 1.0 / publish_rate,
            delay_compensation,
            last_published: now,
            last_updated: now,
        })
    }

    pub fn publisher_period(&self) -> f64 {
        self.publisher_period
    }

    pub fn delay_compensation(&self) -> bool {
        self.delay_compensation
    }

    pub fn last_published(&self) -> Time {
        self.last_published
    }

    pub fn last_updated(&self) -> Time {
        self.last_updated
    }

    /// Period of the polling timer, or `None` when publishing is event driven.
    pub fn timer_period(&self) -> Option<f64> {
        self.delay_compensation
            .then(|| self.publisher_period / TIMER_MULTIPLIER)
    }

    /// Timer path: the time to publish at, if a publish is due.
    pub fn on_timer(&self, now: Time) -> Option<Time> {
        let elapsed = now - self.last_published;
        if elapsed < self.publisher_period * MINIMUM_PUBLISH_INTERVAL_RATIO {
            return None;
        }
        let has_new_data = self.last_updated > self.last_published;
        let overdue = elapsed > self.publisher_period * MAXIMUM_PUBLISH_INTERVAL_RATIO;
        (has_new_data || overdue).then_some(now)
    }

    /// Event path, after all ready batches were processed.
    pub fn on_cycle_complete(&self, latest_measurement_time: Time) -> Option<Time> {
        (!self.delay_compensation).then_some(latest_measurement_time)
    }

    pub fn mark_updated(&mut self, now: Time) {
        self.last_updated = now;
    }

    pub fn mark_published(&mut self, now: Time) {
        self.last_published = now;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rejects_non_positive_rate() {
        assert!(PublishScheduler::new(0.0, true, 0.0).is_err());
        assert!(PublishScheduler::new(f64::NAN, true, 0.0).is_err());
    }

    #[test]
    fn timer_period_only_with_delay_compensation() {
        let s = PublishScheduler::new(10.0, true, 0.0).unwrap();
        assert_abs_diff_eq!(s.timer_period().unwrap(), 0.01, epsilon = 1e-12);
        let s = PublishScheduler::new(10.0, false, 0.0).unwrap();
        assert!(s.timer_period().is_none());
    }

    #[test]
    fn rate_cap_holds_back_early_publish() {
        let mut s = PublishScheduler::new(10.0, true, 0.0).unwrap();
        s.mark_updated(0.05);
        assert_eq!(s.on_timer(0.08), None);
        assert_eq!(s.on_timer(0.09), Some(0.09));
    }

    #[test]
    fn publishes_without_new_data_once_overdue() {
        let s = PublishScheduler::new(10.0, true, 0.0).unwrap();
        assert_eq!(s.on_timer(0.1), None);
        assert_eq!(s.on_timer(0.106), Some(0.106));
    }

    #[test]
    fn event_path_depends_on_delay_compensation() {
        let s = PublishScheduler::new(10.0, false, 0.0).unwrap();
        assert_eq!(s.on_cycle_complete(3.2), Some(3.2));
        let s = PublishScheduler::new(10.0, true, 0.0).unwrap();
        assert_eq!(s.on_cycle_complete(3.2), None);
    }
}
