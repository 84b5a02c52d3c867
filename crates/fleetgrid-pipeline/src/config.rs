//! Pipeline tuning knobs.

use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

/// Timing and queue sizing of one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Written to `lock_owner` on every claimed row.
    pub name: String,
    pub workers: usize,
    /// Lease length granted on claim and on every heartbeat.
    pub lock_timeout: Duration,
    /// Interval between lease renewals of an in-flight item.
    pub heartbeat_trigger: Duration,
    /// Rows processed more recently than this are not fetched.
    pub min_processing_interval: Duration,
    /// Sleep after a fetch that returned nothing.
    pub fetch_delay: Duration,
    pub queue_desired_minsize: usize,
    pub queue_lower_limit_factor: f64,
    pub queue_upper_limit_factor: f64,
    /// Sleep while the queue is at or above its upper limit.
    pub queue_check_delay: Duration,
}

impl PipelineConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.workers == 0 {
            return Err(PipelineError::Config(format!("{}: workers must be at least 1", self.name)));
        }
        if self.queue_desired_minsize == 0 {
            return Err(PipelineError::Config(format!(
                "{}: queue_desired_minsize must be at least 1",
                self.name
            )));
        }
        if !(self.queue_lower_limit_factor > 0.0
            && self.queue_lower_limit_factor <= self.queue_upper_limit_factor)
        {
            return Err(PipelineError::Config(format!(
                "{}: queue limit factors must satisfy 0 < lower <= upper",
                self.name
            )));
        }
        if self.heartbeat_trigger >= self.lock_timeout {
            return Err(PipelineError::Config(format!(
                "{}: heartbeat_trigger must be shorter than lock_timeout",
                self.name
            )));
        }
        Ok(())
    }

    /// Queue length at which the fetcher stops fetching.
    pub fn queue_upper_limit(&self) -> usize {
        ((self.queue_desired_minsize as f64 * self.queue_upper_limit_factor).ceil() as usize).max(1)
    }

    /// Queue length below which the fetcher refills to the upper limit.
    pub fn queue_lower_limit(&self) -> usize {
        (self.queue_desired_minsize as f64 * self.queue_lower_limit_factor).ceil() as usize
    }

    /// How many items to fetch given the current queue length.
    ///
    /// `None` means the queue is full and the fetcher should back off.
    pub fn batch_limit(&self, queue_len: usize) -> Option<usize> {
        let upper = self.queue_upper_limit();
        if queue_len >= upper {
            return None;
        }
        let room = upper - queue_len;
        if queue_len < self.queue_lower_limit() {
            Some(room)
        } else {
            Some(self.queue_desired_minsize.min(room))
        }
    }

    pub fn lock_timeout_ms(&self) -> u64 {
        self.lock_timeout.as_millis() as u64
    }

    pub fn min_processing_interval_ms(&self) -> u64 {
        self.min_processing_interval.as_millis() as u64
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            workers: 4,
            lock_timeout: Duration::from_secs(30),
            heartbeat_trigger: Duration::from_secs(10),
            min_processing_interval: Duration::from_secs(10),
            fetch_delay: Duration::from_secs(2),
            queue_desired_minsize: 8,
            queue_lower_limit_factor: 0.5,
            queue_upper_limit_factor: 2.0,
            queue_check_delay: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn limits_follow_factors() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_upper_limit(), 16);
        assert_eq!(config.queue_lower_limit(), 4);
    }

    #[test]
    fn batch_limit_backpressure() {
        let config = PipelineConfig::default();
        // Below the lower limit: refill all the way up.
        assert_eq!(config.batch_limit(0), Some(16));
        assert_eq!(config.batch_limit(3), Some(13));
        // Between limits: top up by at most the desired size.
        assert_eq!(config.batch_limit(4), Some(8));
        assert_eq!(config.batch_limit(12), Some(4));
        // Full.
        assert_eq!(config.batch_limit(16), None);
        assert_eq!(config.batch_limit(20), None);
    }

    #[test]
    fn rejects_bad_configs() {
        let mut config = PipelineConfig::named("fleets");
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::named("fleets");
        config.heartbeat_trigger = config.lock_timeout;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::named("fleets");
        config.queue_lower_limit_factor = 3.0;
        assert!(config.validate().is_err());
    }
}
