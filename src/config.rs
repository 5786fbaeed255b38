//! Configuration types.

use std::time::Duration;

/// Engine configuration.
///
/// Retry behaviour is deliberately a plain value object so tests can
/// construct deterministic policies with a controllable clock.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent processing workers.
    pub workers: usize,
    /// Capacity of the bounded processing queue.
    pub queue_capacity: usize,
    /// Maximum re-processing attempts before a message is permanently failed.
    pub max_retries: u32,
    /// Fixed delay before a failed message becomes retry-eligible.
    pub retry_delay: Duration,
    /// How often the retry scan looks for due messages.
    pub retry_scan_interval: Duration,
    /// Messages in PROCESSING longer than this are flagged for manual review.
    pub processing_timeout: Duration,
    /// How often the stuck-message sweep runs.
    pub stuck_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            max_retries: 3,
            retry_delay: Duration::from_secs(300), // 5 minutes
            retry_scan_interval: Duration::from_secs(60),
            processing_timeout: Duration::from_secs(900), // 15 minutes
            stuck_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    /// Build a config from `GUARANTY_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("GUARANTY_WORKERS", defaults.workers),
            queue_capacity: env_parse("GUARANTY_QUEUE_CAPACITY", defaults.queue_capacity),
            max_retries: env_parse("GUARANTY_MAX_RETRIES", defaults.max_retries),
            retry_delay: Duration::from_secs(env_parse(
                "GUARANTY_RETRY_DELAY_SECS",
                defaults.retry_delay.as_secs(),
            )),
            retry_scan_interval: Duration::from_secs(env_parse(
                "GUARANTY_RETRY_SCAN_SECS",
                defaults.retry_scan_interval.as_secs(),
            )),
            processing_timeout: Duration::from_secs(env_parse(
                "GUARANTY_PROCESSING_TIMEOUT_SECS",
                defaults.processing_timeout.as_secs(),
            )),
            stuck_sweep_interval: Duration::from_secs(env_parse(
                "GUARANTY_STUCK_SWEEP_SECS",
                defaults.stuck_sweep_interval.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behaviour() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay, Duration::from_secs(300));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // Unset var → default
        assert_eq!(env_parse("GUARANTY_TEST_UNSET_VAR", 7u32), 7);
    }
}
