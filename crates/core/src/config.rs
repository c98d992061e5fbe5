//! Pipeline configuration.
//!
//! Configuration is plain data, set once when a pipeline is built. Every
//! section is optional: an absent section disables the corresponding
//! behaviour (no token bucket, no circuit breaker, no retries).
//!
//! Durations are expressed in milliseconds on the wire:
//!
//! ```toml
//! global_concurrency = 8
//! queue_enabled = true
//!
//! [endpoint_concurrency]
//! "/search" = 2
//!
//! [token_bucket]
//! capacity = 20
//! refill_rate = 5
//! interval_ms = 1000
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! reset_timeout_ms = 30000
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! jitter = true
//! ```

use std::collections::HashMap;
use std::time::Duration;

use callgate_common::duration_millis;
use callgate_common::error::{CommonError, CommonResult};
use serde::{Deserialize, Serialize};

/// Status codes counted as circuit failures unless configured otherwise.
pub const DEFAULT_MONITORED_STATUS_CODES: [u16; 4] = [500, 502, 503, 504];

/// Top-level configuration of a pipeline instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum in-flight requests across all endpoints.
    pub global_concurrency: Option<usize>,
    /// Maximum in-flight requests per endpoint key.
    pub endpoint_concurrency: HashMap<String, usize>,
    /// Queue requests that cannot be admitted instead of rejecting them.
    pub queue_enabled: bool,
    /// Upper bound on queued requests; unbounded when absent.
    pub max_queue_depth: Option<usize>,
    pub token_bucket: Option<TokenBucketConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    /// Tokens added on every refill tick.
    pub refill_rate: u32,
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive monitored failures that open the circuit.
    pub failure_threshold: u32,
    #[serde(rename = "reset_timeout_ms", with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Status codes counted as failures. Network and timeout failures, which
    /// carry no status, are always counted.
    pub monitored_status_codes: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitored_status_codes: DEFAULT_MONITORED_STATUS_CODES.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    /// Add up to 50% random delay on top of each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl PipelineConfig {
    /// Validate limits and timings.
    ///
    /// # Errors
    ///
    /// Returns `CommonError::Config` naming the offending field.
    pub fn validate(&self) -> CommonResult<()> {
        if self.global_concurrency == Some(0) {
            return Err(CommonError::config_field(
                "global_concurrency",
                "must be greater than zero",
            ));
        }

        if let Some((key, _)) = self.endpoint_concurrency.iter().find(|(_, limit)| **limit == 0) {
            return Err(CommonError::config_field(
                format!("endpoint_concurrency.{key}"),
                "must be greater than zero",
            ));
        }

        if self.max_queue_depth == Some(0) {
            return Err(CommonError::config_field(
                "max_queue_depth",
                "must be greater than zero",
            ));
        }

        if let Some(bucket) = &self.token_bucket {
            bucket.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        Ok(())
    }
}

impl TokenBucketConfig {
    pub fn validate(&self) -> CommonResult<()> {
        if self.capacity == 0 {
            return Err(CommonError::config_field(
                "token_bucket.capacity",
                "must be greater than zero",
            ));
        }
        if self.refill_rate == 0 {
            return Err(CommonError::config_field(
                "token_bucket.refill_rate",
                "must be greater than zero",
            ));
        }
        if self.interval.is_zero() {
            return Err(CommonError::config_field(
                "token_bucket.interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> CommonResult<()> {
        if self.failure_threshold == 0 {
            return Err(CommonError::config_field(
                "circuit_breaker.failure_threshold",
                "must be greater than zero",
            ));
        }
        if self.reset_timeout.is_zero() {
            return Err(CommonError::config_field(
                "circuit_breaker.reset_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> CommonResult<()> {
        if self.base_delay > self.max_delay {
            return Err(CommonError::config_field(
                "retry.base_delay_ms",
                format!(
                    "base_delay ({:?}) cannot be greater than max_delay ({:?})",
                    self.base_delay, self.max_delay
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid_and_unlimited() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.global_concurrency, None);
        assert!(!config.queue_enabled);
        assert!(config.circuit_breaker.is_none());
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        assert!(retry.jitter);
    }

    /// Validates rejection of zero limits.
    ///
    /// Assertions:
    /// - Zero global and per-endpoint limits are rejected with the field name.
    #[test]
    fn test_zero_limits_rejected() {
        let config = PipelineConfig { global_concurrency: Some(0), ..Default::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("global_concurrency"));

        let config = PipelineConfig {
            endpoint_concurrency: HashMap::from([("/a".to_string(), 0)]),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("endpoint_concurrency./a"));
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let config = PipelineConfig {
            token_bucket: Some(TokenBucketConfig {
                capacity: 2,
                refill_rate: 1,
                interval: Duration::ZERO,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            retry: Some(RetryConfig {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.base_delay_ms"));
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r#"{
            "global_concurrency": 2,
            "endpoint_concurrency": {"/a": 1},
            "queue_enabled": true,
            "token_bucket": {"capacity": 2, "refill_rate": 1, "interval_ms": 100},
            "circuit_breaker": {"failure_threshold": 3, "reset_timeout_ms": 1000},
            "retry": {"max_retries": 2, "jitter": false}
        }"#;

        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.global_concurrency, Some(2));
        assert_eq!(config.endpoint_concurrency.get("/a"), Some(&1));
        assert_eq!(
            config.token_bucket.as_ref().map(|b| b.interval),
            Some(Duration::from_millis(100))
        );

        let breaker = config.circuit_breaker.unwrap();
        assert_eq!(breaker.reset_timeout, Duration::from_secs(1));
        assert_eq!(breaker.monitored_status_codes, DEFAULT_MONITORED_STATUS_CODES.to_vec());

        let retry = config.retry.unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert!(!retry.jitter);
    }
}
