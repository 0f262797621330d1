//! Process configuration, read from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `REDIS_URL` | required when persistent |
//! | `LEDGER_BIND_ADDR` | `0.0.0.0:8080` |
//! | `LEDGER_PARTITIONS` | `8` |
//! | `LEDGER_PRODUCER_BUFFER` | `1024` |
//! | `LEDGER_ENQUEUE_TIMEOUT_MS` | `100` |
//! | `LEDGER_CONSUMER_BATCH` | `32` |
//! | `LEDGER_CONSUMER_POLL_MS` | `250` |
//! | `LEDGER_RETRY_BACKOFF_MS` | `500` |
//! | `LEDGER_BROKER_BUFFER` | `256` |
//! | `LEDGER_DB_MAX_CONNECTIONS` | `10` |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use ledgerline_events::DEFAULT_SUBSCRIBER_BUFFER;

use crate::pipeline::{ConsumerConfig, ProducerConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("{key} must be set when USE_PERSISTENT_STORES is enabled")]
    Missing { key: &'static str },
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Postgres + Redis when true, in-memory store and queue otherwise.
    pub persistent: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub partitions: u32,
    pub db_max_connections: u32,
    pub broker_buffer: usize,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            database_url: None,
            redis_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            partitions: 8,
            db_max_connections: 10,
            broker_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let persistent = match get("USE_PERSISTENT_STORES") {
            Some(v) => parse_bool("USE_PERSISTENT_STORES", &v)?,
            None => false,
        };
        let database_url = get("DATABASE_URL");
        let redis_url = get("REDIS_URL");
        if persistent {
            if database_url.is_none() {
                return Err(ConfigError::Missing { key: "DATABASE_URL" });
            }
            if redis_url.is_none() {
                return Err(ConfigError::Missing { key: "REDIS_URL" });
            }
        }

        let bind_addr = parsed(&get, "LEDGER_BIND_ADDR")?.unwrap_or(defaults.bind_addr);
        let partitions = positive(&get, "LEDGER_PARTITIONS")?.unwrap_or(defaults.partitions);
        let db_max_connections =
            positive(&get, "LEDGER_DB_MAX_CONNECTIONS")?.unwrap_or(defaults.db_max_connections);
        let broker_buffer =
            positive(&get, "LEDGER_BROKER_BUFFER")?.unwrap_or(defaults.broker_buffer);

        let mut producer = defaults.producer;
        if let Some(buffer) = positive(&get, "LEDGER_PRODUCER_BUFFER")? {
            producer = producer.with_buffer(buffer);
        }
        if let Some(ms) = parsed::<u64>(&get, "LEDGER_ENQUEUE_TIMEOUT_MS")? {
            producer = producer.with_enqueue_timeout(Duration::from_millis(ms));
        }

        let mut consumer = defaults.consumer;
        if let Some(batch) = positive(&get, "LEDGER_CONSUMER_BATCH")? {
            consumer = consumer.with_batch_size(batch);
        }
        if let Some(ms) = parsed::<u64>(&get, "LEDGER_CONSUMER_POLL_MS")? {
            consumer = consumer.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parsed::<u64>(&get, "LEDGER_RETRY_BACKOFF_MS")? {
            consumer = consumer.with_retry_backoff(Duration::from_millis(ms));
        }

        Ok(Self {
            persistent,
            database_url,
            redis_url,
            bind_addr,
            partitions,
            db_max_connections,
            broker_buffer,
            producer,
            consumer,
        })
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| value.parse::<T>().map_err(|_| ConfigError::Invalid { key, value }))
        .transpose()
}

fn positive<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match parsed::<T>(get, key)? {
        Some(n) if n <= T::default() => Err(ConfigError::Invalid {
            key,
            value: get(key).unwrap_or_default(),
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<LedgerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LedgerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let c = config(&[]).unwrap();
        assert!(!c.persistent);
        assert_eq!(c.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(c.partitions, 8);
        assert_eq!(c.db_max_connections, 10);
        assert_eq!(c.broker_buffer, 256);
        assert_eq!(c.producer.buffer, 1024);
        assert_eq!(c.producer.enqueue_timeout, Duration::from_millis(100));
        assert_eq!(c.consumer.batch_size, 32);
        assert_eq!(c.consumer.poll_interval, Duration::from_millis(250));
        assert_eq!(c.consumer.retry_backoff, Duration::from_millis(500));
    }

    #[test]
    fn overrides_are_applied() {
        let c = config(&[
            ("LEDGER_BIND_ADDR", "127.0.0.1:9000"),
            ("LEDGER_PARTITIONS", "3"),
            ("LEDGER_PRODUCER_BUFFER", "16"),
            ("LEDGER_ENQUEUE_TIMEOUT_MS", "5"),
            ("LEDGER_CONSUMER_BATCH", "4"),
            ("LEDGER_RETRY_BACKOFF_MS", "10"),
        ])
        .unwrap();
        assert_eq!(c.bind_addr.port(), 9000);
        assert_eq!(c.partitions, 3);
        assert_eq!(c.producer.buffer, 16);
        assert_eq!(c.producer.enqueue_timeout, Duration::from_millis(5));
        assert_eq!(c.consumer.batch_size, 4);
        assert_eq!(c.consumer.retry_backoff, Duration::from_millis(10));
    }

    #[test]
    fn bool_flag_accepts_common_spellings() {
        for yes in ["true", "1", "YES", "on"] {
            let c = config(&[
                ("USE_PERSISTENT_STORES", yes),
                ("DATABASE_URL", "postgres://localhost/ledger"),
                ("REDIS_URL", "redis://localhost"),
            ])
            .unwrap();
            assert!(c.persistent, "{yes}");
        }
        assert!(!config(&[("USE_PERSISTENT_STORES", "off")]).unwrap().persistent);
        assert_eq!(
            config(&[("USE_PERSISTENT_STORES", "maybe")]).unwrap_err(),
            ConfigError::Invalid {
                key: "USE_PERSISTENT_STORES",
                value: "maybe".into()
            }
        );
    }

    #[test]
    fn persistent_mode_needs_both_urls() {
        assert_eq!(
            config(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing { key: "DATABASE_URL" }
        );
        assert_eq!(
            config(&[
                ("USE_PERSISTENT_STORES", "true"),
                ("DATABASE_URL", "postgres://localhost/ledger"),
            ])
            .unwrap_err(),
            ConfigError::Missing { key: "REDIS_URL" }
        );
    }

    #[test]
    fn zero_and_garbage_numbers_are_rejected() {
        assert_eq!(
            config(&[("LEDGER_PARTITIONS", "0")]).unwrap_err(),
            ConfigError::Invalid {
                key: "LEDGER_PARTITIONS",
                value: "0".into()
            }
        );
        assert!(matches!(
            config(&[("LEDGER_CONSUMER_POLL_MS", "soon")]),
            Err(ConfigError::Invalid { key: "LEDGER_CONSUMER_POLL_MS", .. })
        ));
        assert!(matches!(
            config(&[("LEDGER_BIND_ADDR", "nowhere")]),
            Err(ConfigError::Invalid { key: "LEDGER_BIND_ADDR", .. })
        ));
    }
}
