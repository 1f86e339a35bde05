//! Worker configuration loaded from environment variables.

use std::time::Duration;

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_LOCK_TTL_MS`: lease TTL per run (default: `15000`, `0` disables expiry)
/// - `SAGA_MAX_COMPENSATION_MS`: compensation time limit (default: `0`, unbounded)
/// - `SAGA_POLL_INTERVAL_MS`: pause between runs of a non-terminal saga (default: `500`)
/// - `SAGA_MAX_RUNS`: runs attempted before the driver gives up (default: `20`)
/// - `SAGA_FAIL_STEP`: demo step forced to fail (default: none)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub lock_ttl: Duration,
    pub max_compensation_time: Option<Duration>,
    pub poll_interval: Duration,
    pub max_runs: u32,
    pub fail_step: Option<String>,
    pub log_level: String,
}

impl WorkerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            lock_ttl: millis("SAGA_LOCK_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_ttl),
            max_compensation_time: match millis("SAGA_MAX_COMPENSATION_MS") {
                Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
                Some(_) => None,
                None => defaults.max_compensation_time,
            },
            poll_interval: millis("SAGA_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            max_runs: lookup("SAGA_MAX_RUNS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|runs| *runs > 0)
                .unwrap_or(defaults.max_runs),
            fail_step: lookup("SAGA_FAIL_STEP")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_millis(15_000),
            max_compensation_time: None,
            poll_interval: Duration::from_millis(500),
            max_runs: 20,
            fail_step: None,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> WorkerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_pairs(&[]);
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.lock_ttl, Duration::from_secs(15));
        assert_eq!(config.max_compensation_time, None);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_runs, 20);
        assert_eq!(config.fail_step, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("SAGA_LOCK_TTL_MS", "3000"),
            ("SAGA_MAX_COMPENSATION_MS", "2500"),
            ("SAGA_POLL_INTERVAL_MS", "50"),
            ("SAGA_MAX_RUNS", "3"),
            ("SAGA_FAIL_STEP", "charge_payment"),
            ("RUST_LOG", "debug"),
        ]);
        assert_eq!(config.lock_ttl, Duration::from_secs(3));
        assert_eq!(config.max_compensation_time, Some(Duration::from_millis(2500)));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_runs, 3);
        assert_eq!(config.fail_step.as_deref(), Some("charge_payment"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("SAGA_LOCK_TTL_MS", "soon"),
            ("SAGA_MAX_COMPENSATION_MS", "0"),
            ("SAGA_MAX_RUNS", "0"),
            ("SAGA_FAIL_STEP", "  "),
        ]);
        assert_eq!(config.lock_ttl, Duration::from_secs(15));
        assert_eq!(config.max_compensation_time, None);
        assert_eq!(config.max_runs, 20);
        assert_eq!(config.fail_step, None);
    }
}
