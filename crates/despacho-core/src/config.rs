use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

pub use crate::cache::CacheConfig;

/// Top-level runtime configuration, deserializable from TOML. Each section
/// maps onto one component's constructor parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub channel: ChannelConfig,
    pub consumer: ConsumerConfig,
    pub cache: CacheConfig,
    pub dispatch: DispatchConfig,
    pub sweeper: SweeperConfig,
    pub scheduler: SchedulerConfig,
}

/// Channel front-buffer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffer capacity, 1-10. One extra slot beyond this is reserved for
    /// the shutdown sentinel.
    pub max_buffer_size: usize,
    /// How long a `receive` waits on the underlying consumer when the
    /// buffer is empty.
    pub pull_timeout_ms: u64,
}

impl ChannelConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 3,
            pull_timeout_ms: 1_000,
        }
    }
}

/// Consumer-side delivery bookkeeping.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// How long a received message may stay unacknowledged before it is
    /// presumed abandoned and requeued. `-1` disables the reclaim scan.
    pub ack_timeout_ms: i64,
    /// Redelivery ceiling the caller's policy checks via
    /// `Message::handled_count_reached`.
    pub requeue_limit: u32,
}

impl ConsumerConfig {
    /// Reclaim period, or `None` when the scan is disabled (non-positive
    /// timeout).
    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms as u64))
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 30_000,
            requeue_limit: 10,
        }
    }
}

/// Dispatch pipeline configuration (retries, outstanding recount, archive
/// paging).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Minimum interval between outstanding-message recounts.
    pub monitor_min_interval_ms: u64,
    /// Page size for the outbox archiver.
    pub archive_batch_size: usize,
}

impl DispatchConfig {
    pub fn monitor_min_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_min_interval_ms)
    }

    /// Retry policy these knobs describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.retry_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 50,
            monitor_min_interval_ms: 1_000,
            archive_batch_size: 100,
        }
    }
}

/// Outbox sweeper cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub period_ms: u64,
    /// Only messages written at least this long ago are re-driven, so the
    /// sweeper never races a dispatch still in flight.
    pub min_age_ms: u64,
    pub batch_size: usize,
}

impl SweeperConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_millis(self.min_age_ms)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            period_ms: 5_000,
            min_age_ms: 5_000,
            batch_size: 100,
        }
    }
}

/// Delayed-message scheduler cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub initial_delay_ms: u64,
    pub period_ms: u64,
}

impl SchedulerConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            period_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.channel.max_buffer_size, 3);
        assert_eq!(config.channel.pull_timeout_ms, 1_000);
        assert_eq!(config.consumer.ack_timeout_ms, 30_000);
        assert_eq!(config.consumer.requeue_limit, 10);
        assert_eq!(config.cache.entry_ttl_ms, 300_000);
        assert_eq!(config.cache.scan_interval_ms, 600_000);
        assert_eq!(config.cache.entry_limit, 2048);
        assert_eq!(config.dispatch.retry_attempts, 3);
        assert_eq!(config.dispatch.archive_batch_size, 100);
        assert_eq!(config.sweeper.period_ms, 5_000);
        assert_eq!(config.scheduler.period_ms, 1_000);
    }

    #[test]
    fn toml_parsing_with_overrides() {
        let toml_str = r#"
            [channel]
            max_buffer_size = 5

            [consumer]
            ack_timeout_ms = -1

            [dispatch]
            retry_attempts = 7
        "#;
        let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.channel.max_buffer_size, 5);
        assert_eq!(config.consumer.ack_timeout_ms, -1);
        assert_eq!(config.dispatch.retry_attempts, 7);
        // Untouched sections keep their defaults
        assert_eq!(config.sweeper.batch_size, 100);
    }

    #[test]
    fn toml_parsing_empty_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.channel.max_buffer_size, 3);
        assert_eq!(config.cache.entry_limit, 2048);
    }

    #[test]
    fn dispatch_config_builds_its_retry_policy() {
        let config = DispatchConfig {
            retry_attempts: 5,
            ..DispatchConfig::default()
        };
        assert_eq!(config.retry_policy().attempts(), 5);
    }

    #[test]
    fn negative_ack_timeout_disables_the_reclaim_scan() {
        let config = ConsumerConfig {
            ack_timeout_ms: -1,
            ..ConsumerConfig::default()
        };
        assert_eq!(config.ack_timeout(), None);

        let config = ConsumerConfig::default();
        assert_eq!(config.ack_timeout(), Some(Duration::from_secs(30)));
    }
}
