// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::IngestError;
use crate::record::Target;
use crate::results::DEFAULT_RETAINED_DISPOSITIONS;
use crate::retry::RetryStrategy;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use zstd::zstd_safe::CompressionLevel;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Configuration for the HTTP ingester
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Target used when a submission does not name one
    pub default_target: Option<String>,
    /// Records per batch before it closes
    pub max_batch_records: usize,
    /// Encoded body size per batch before it closes
    pub max_batch_bytes: usize,
    /// How long a batch stays open after its first record
    pub linger: Duration,
    /// Batches in flight per target
    pub max_in_flight_per_target: usize,
    /// How long a closed batch waits for an in-flight slot
    pub admit_timeout: Duration,
    /// Records queued per target before submitters suspend
    pub queue_capacity: usize,
    pub retry_strategy: RetryStrategy,
    /// Timeout of a single request
    pub request_timeout: Duration,
    pub verify_tls: bool,
    pub content_type: String,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// zstd level of the request body, uncompressed when unset
    pub compression_level: Option<CompressionLevel>,
    /// Settled record dispositions kept queryable per target
    pub retained_dispositions: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_target: None,
            max_batch_records: 500,
            max_batch_bytes: 1024 * 1024,
            linger: Duration::from_secs(1),
            max_in_flight_per_target: 4,
            admit_timeout: Duration::from_secs(60),
            queue_capacity: 1024,
            retry_strategy: RetryStrategy::default(),
            request_timeout: Duration::from_secs(30),
            verify_tls: true,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            https_proxy: None,
            compression_level: None,
            retained_dispositions: DEFAULT_RETAINED_DISPOSITIONS,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key lookup, using the same keys as [`Self::from_env`].
    /// Values that do not parse fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let default_retry = &defaults.retry_strategy;
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parse_or(lookup(key), default.as_millis() as u64))
        };

        let default_target = lookup("INGEST_HTTP_DEFAULT_TARGET")
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty());
        let retry_strategy = RetryStrategy::ExponentialBackoff {
            max_attempts: parse_or(
                lookup("INGEST_HTTP_MAX_ATTEMPTS"),
                default_retry.max_attempts(),
            ),
            base_delay: millis("INGEST_HTTP_BACKOFF_BASE_MS", default_retry.base_backoff(1)),
            max_delay: millis(
                "INGEST_HTTP_BACKOFF_MAX_MS",
                default_retry.base_backoff(u32::MAX),
            ),
        };
        let verify_tls = lookup("INGEST_HTTP_VERIFY_TLS")
            .map(|val| val.trim().to_lowercase() != "false")
            .unwrap_or(defaults.verify_tls);
        let content_type = lookup("INGEST_HTTP_CONTENT_TYPE")
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty())
            .unwrap_or(defaults.content_type);
        let https_proxy = lookup("INGEST_HTTP_PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY"));
        let compression_level = lookup("INGEST_HTTP_COMPRESSION_LEVEL")
            .and_then(|val| val.trim().parse::<CompressionLevel>().ok());

        let config = Self {
            default_target,
            max_batch_records: parse_or(
                lookup("INGEST_HTTP_MAX_BATCH_RECORDS"),
                defaults.max_batch_records,
            ),
            max_batch_bytes: parse_or(
                lookup("INGEST_HTTP_MAX_BATCH_BYTES"),
                defaults.max_batch_bytes,
            ),
            linger: millis("INGEST_HTTP_LINGER_MS", defaults.linger),
            max_in_flight_per_target: parse_or(
                lookup("INGEST_HTTP_MAX_IN_FLIGHT"),
                defaults.max_in_flight_per_target,
            ),
            admit_timeout: millis("INGEST_HTTP_ADMIT_TIMEOUT_MS", defaults.admit_timeout),
            queue_capacity: parse_or(
                lookup("INGEST_HTTP_QUEUE_CAPACITY"),
                defaults.queue_capacity,
            ),
            retry_strategy,
            request_timeout: millis("INGEST_HTTP_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            verify_tls,
            content_type,
            https_proxy,
            compression_level,
            retained_dispositions: parse_or(
                lookup("INGEST_HTTP_RETAINED_DISPOSITIONS"),
                defaults.retained_dispositions,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), IngestError> {
        if let Some(target) = &self.default_target {
            Target::new(target, None)?;
        }

        if self.max_batch_records == 0 {
            return Err(IngestError::Configuration(
                "max batch records must be greater than 0".to_string(),
            ));
        }

        // an empty array body is two bytes
        if self.max_batch_bytes < 2 {
            return Err(IngestError::Configuration(
                "max batch bytes must be at least 2".to_string(),
            ));
        }

        if self.max_in_flight_per_target == 0 {
            return Err(IngestError::Configuration(
                "max in-flight batches per target must be greater than 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(IngestError::Configuration(
                "queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(IngestError::Configuration(
                "request timeout must be greater than 0".to_string(),
            ));
        }

        match &self.retry_strategy {
            RetryStrategy::Immediate(0) | RetryStrategy::LinearBackoff(0, _) => {
                return Err(IngestError::Configuration(
                    "max attempts must be greater than 0".to_string(),
                ));
            }
            RetryStrategy::ExponentialBackoff {
                max_attempts,
                base_delay,
                max_delay,
            } => {
                if *max_attempts == 0 {
                    return Err(IngestError::Configuration(
                        "max attempts must be greater than 0".to_string(),
                    ));
                }
                if base_delay > max_delay {
                    return Err(IngestError::Configuration(format!(
                        "backoff base delay {base_delay:?} is larger than the max delay {max_delay:?}"
                    )));
                }
            }
            _ => {}
        }

        if self.content_type.trim().is_empty() {
            return Err(IngestError::Configuration(
                "content type cannot be empty".to_string(),
            ));
        }

        if let Some(level) = self.compression_level {
            let range = zstd::compression_level_range();
            if !range.contains(&level) {
                return Err(IngestError::Configuration(format!(
                    "Invalid compression level {level}. Must be between {} and {}",
                    range.start(),
                    range.end()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.content_type, "application/octet-stream");
        assert!(config.verify_tls);
    }

    #[test]
    fn test_from_lookup_reads_every_key() {
        let config = IngestConfig::from_lookup(lookup_from(&[
            ("INGEST_HTTP_DEFAULT_TARGET", " http://example.com/data-source "),
            ("INGEST_HTTP_MAX_BATCH_RECORDS", "100"),
            ("INGEST_HTTP_MAX_BATCH_BYTES", "2048"),
            ("INGEST_HTTP_LINGER_MS", "250"),
            ("INGEST_HTTP_MAX_IN_FLIGHT", "2"),
            ("INGEST_HTTP_ADMIT_TIMEOUT_MS", "1000"),
            ("INGEST_HTTP_QUEUE_CAPACITY", "16"),
            ("INGEST_HTTP_MAX_ATTEMPTS", "3"),
            ("INGEST_HTTP_BACKOFF_BASE_MS", "10"),
            ("INGEST_HTTP_BACKOFF_MAX_MS", "500"),
            ("INGEST_HTTP_REQUEST_TIMEOUT_MS", "5000"),
            ("INGEST_HTTP_VERIFY_TLS", "FALSE"),
            ("INGEST_HTTP_CONTENT_TYPE", "application/json"),
            ("INGEST_HTTP_COMPRESSION_LEVEL", "3"),
            ("INGEST_HTTP_PROXY_HTTPS", "http://proxy:3128"),
            ("INGEST_HTTP_RETAINED_DISPOSITIONS", "50"),
        ]))
        .unwrap();

        assert_eq!(
            config.default_target.as_deref(),
            Some("http://example.com/data-source")
        );
        assert_eq!(config.max_batch_records, 100);
        assert_eq!(config.max_batch_bytes, 2048);
        assert_eq!(config.linger, Duration::from_millis(250));
        assert_eq!(config.max_in_flight_per_target, 2);
        assert_eq!(config.admit_timeout, Duration::from_secs(1));
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(
            config.retry_strategy,
            RetryStrategy::ExponentialBackoff {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(500),
            }
        );
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(!config.verify_tls);
        assert_eq!(config.content_type, "application/json");
        assert_eq!(config.compression_level, Some(3));
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.retained_dispositions, 50);
    }

    #[test]
    fn test_from_lookup_falls_back_on_unparseable_values() {
        let config = IngestConfig::from_lookup(lookup_from(&[
            ("INGEST_HTTP_MAX_BATCH_RECORDS", "lots"),
            ("INGEST_HTTP_LINGER_MS", "-5"),
            ("INGEST_HTTP_DEFAULT_TARGET", "  "),
        ]))
        .unwrap();
        let defaults = IngestConfig::default();
        assert_eq!(config.max_batch_records, defaults.max_batch_records);
        assert_eq!(config.linger, defaults.linger);
        assert_eq!(config.default_target, None);
        assert_eq!(config.retry_strategy, defaults.retry_strategy);
    }

    #[test]
    fn test_https_proxy_falls_back_to_standard_variable() {
        let config =
            IngestConfig::from_lookup(lookup_from(&[("HTTPS_PROXY", "http://fallback:3128")]))
                .unwrap();
        assert_eq!(config.https_proxy.as_deref(), Some("http://fallback:3128"));
    }

    #[test]
    fn test_from_lookup_validates() {
        let result = IngestConfig::from_lookup(lookup_from(&[(
            "INGEST_HTTP_DEFAULT_TARGET",
            "not a url",
        )]));
        assert!(matches!(result, Err(IngestError::Configuration(_))));

        let result =
            IngestConfig::from_lookup(lookup_from(&[("INGEST_HTTP_MAX_IN_FLIGHT", "0")]));
        assert!(matches!(result, Err(IngestError::Configuration(_))));
    }

    #[test]
    fn test_validate_zero_limits() {
        for config in [
            IngestConfig {
                max_batch_records: 0,
                ..Default::default()
            },
            IngestConfig {
                max_batch_bytes: 1,
                ..Default::default()
            },
            IngestConfig {
                queue_capacity: 0,
                ..Default::default()
            },
            IngestConfig {
                request_timeout: Duration::ZERO,
                ..Default::default()
            },
            IngestConfig {
                retry_strategy: RetryStrategy::Immediate(0),
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be invalid");
        }
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let config = IngestConfig {
            retry_strategy: RetryStrategy::ExponentialBackoff {
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(1),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_compression_level() {
        let config = IngestConfig {
            compression_level: Some(1_000),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IngestConfig {
            compression_level: Some(6),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
