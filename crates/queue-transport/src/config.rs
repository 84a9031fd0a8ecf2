//! Transport configuration.
//!
//! Every field carries a serde default so a partially specified file produces
//! a complete configuration. [`TransportSettings::validate`] enforces the
//! documented ranges; out-of-range values are rejected, never clamped.

use crate::addressing::QueueAddress;
use crate::error::ConfigurationError;
use crate::message::QueueName;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Hard cap on messages per receive call imposed by the queue service
pub const MAX_RECEIVE_BATCH_SIZE: u32 = 32;

/// Longest time-to-live the queue service accepts for a message
pub const MAX_TIME_TO_LIVE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const MIN_INVISIBLE_TIME_SECONDS: u64 = 1;
const MAX_INVISIBLE_TIME_SECONDS: u64 = 7 * 24 * 60 * 60;
const MIN_IDLE_WAIT_MS: u64 = 100;
const MAX_IDLE_WAIT_MS: u64 = 60_000;

/// How received messages are acknowledged relative to processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Acknowledge before processing; a failure loses the message
    None,
    /// Acknowledge after processing; a failure makes the message visible again
    #[default]
    ReceiveOnly,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Queue this endpoint receives from
    pub input_queue: String,

    /// Queue failed messages are moved to
    pub error_queue: String,

    pub transaction_mode: TransactionMode,

    /// How long a received message stays hidden from other consumers
    pub message_invisible_time_seconds: u64,

    /// Idle delay growth per empty poll
    pub peek_interval_ms: u64,

    /// Ceiling on the idle delay between empty polls
    pub max_wait_time_when_idle_ms: u64,

    /// Fixed messages per receive call (1-32); derived from concurrency when absent
    pub receive_batch_size: Option<u32>,

    /// Fixed number of poll loops (1-32); derived from concurrency when absent
    pub degree_of_receive_parallelism: Option<u32>,

    /// How long stop waits for in-flight messages
    pub shutdown_timeout_seconds: u64,

    pub circuit_breaker: CircuitBreakerSettings,

    /// Alias under which the endpoint's own account is known
    pub default_account_alias: String,

    /// Alias to storage account name
    pub account_aliases: BTreeMap<String, String>,

    pub delayed_delivery: DelayedDeliverySettings,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            input_queue: "endpoint".to_string(),
            error_queue: "error".to_string(),
            transaction_mode: TransactionMode::default(),
            message_invisible_time_seconds: 30,
            peek_interval_ms: 50,
            max_wait_time_when_idle_ms: 1_000,
            receive_batch_size: None,
            degree_of_receive_parallelism: None,
            shutdown_timeout_seconds: 30,
            circuit_breaker: CircuitBreakerSettings::default(),
            default_account_alias: "default".to_string(),
            account_aliases: BTreeMap::new(),
            delayed_delivery: DelayedDeliverySettings::default(),
        }
    }
}

impl TransportSettings {
    pub fn message_invisible_time(&self) -> Duration {
        Duration::from_secs(self.message_invisible_time_seconds)
    }

    pub fn peek_interval(&self) -> Duration {
        Duration::from_millis(self.peek_interval_ms)
    }

    pub fn max_wait_time_when_idle(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_when_idle_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn input_queue_name(&self) -> Result<QueueName, ConfigurationError> {
        queue_name_setting("input_queue", &self.input_queue)
    }

    pub fn error_queue_address(&self) -> Result<QueueAddress, ConfigurationError> {
        QueueAddress::parse(&self.error_queue)
    }

    /// Check every setting against its allowed range
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.input_queue_name()?;
        self.error_queue_address()?;

        check_range(
            "message_invisible_time_seconds",
            self.message_invisible_time_seconds,
            MIN_INVISIBLE_TIME_SECONDS,
            MAX_INVISIBLE_TIME_SECONDS,
        )?;
        check_range(
            "max_wait_time_when_idle_ms",
            self.max_wait_time_when_idle_ms,
            MIN_IDLE_WAIT_MS,
            MAX_IDLE_WAIT_MS,
        )?;

        if self.peek_interval_ms == 0 {
            return Err(ConfigurationError::OutOfRange {
                key: "peek_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if let Some(batch_size) = self.receive_batch_size {
            check_range(
                "receive_batch_size",
                batch_size as u64,
                1,
                MAX_RECEIVE_BATCH_SIZE as u64,
            )?;
        }
        if let Some(parallelism) = self.degree_of_receive_parallelism {
            check_range(
                "degree_of_receive_parallelism",
                parallelism as u64,
                1,
                MAX_RECEIVE_BATCH_SIZE as u64,
            )?;
        }

        if self.default_account_alias.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "default_account_alias".to_string(),
            });
        }
        for (alias, account) in &self.account_aliases {
            if alias.trim().is_empty() || account.trim().is_empty() {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "account alias entry '{}' -> '{}' must name both alias and account",
                        alias, account
                    ),
                });
            }
        }

        self.circuit_breaker.validate()?;
        self.delayed_delivery.validate()
    }
}

/// Settings for the repeated-failure circuit breakers guarding poll loops
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// How long failures must persist before a critical error is raised
    pub time_to_wait_before_triggering_seconds: u64,

    /// Pause after each failure while the breaker is armed
    pub delay_after_failure_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            time_to_wait_before_triggering_seconds: 120,
            delay_after_failure_ms: 1_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn time_to_wait_before_triggering(&self) -> Duration {
        Duration::from_secs(self.time_to_wait_before_triggering_seconds)
    }

    pub fn delay_after_failure(&self) -> Duration {
        Duration::from_millis(self.delay_after_failure_ms)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.time_to_wait_before_triggering_seconds == 0 {
            return Err(ConfigurationError::OutOfRange {
                key: "circuit_breaker.time_to_wait_before_triggering_seconds".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Native delayed delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedDeliverySettings {
    pub enabled: bool,

    /// Table holding delayed entries; letters and digits, starting with a letter, 3-63 chars
    pub table_name: String,

    /// Where entries that fail to dispatch go; the error queue when absent
    pub poison_queue: Option<String>,

    /// Maximum entries fetched per poll
    pub batch_size: usize,

    /// Duration of the leader election lease
    pub lease_duration_seconds: u64,
}

impl Default for DelayedDeliverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            table_name: "delays".to_string(),
            poison_queue: None,
            batch_size: 50,
            lease_duration_seconds: 15,
        }
    }
}

impl DelayedDeliverySettings {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn poison_queue_address(&self) -> Result<Option<QueueAddress>, ConfigurationError> {
        self.poison_queue
            .as_deref()
            .map(QueueAddress::parse)
            .transpose()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.enabled {
            return Ok(());
        }

        if !table_name_pattern().is_match(&self.table_name) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "delayed delivery table name '{}' must be 3-63 letters or digits starting with a letter",
                    self.table_name
                ),
            });
        }

        self.poison_queue_address()?;

        if self.batch_size == 0 {
            return Err(ConfigurationError::OutOfRange {
                key: "delayed_delivery.batch_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        // Renewal happens at half the lease; a one second lease leaves no room.
        check_range(
            "delayed_delivery.lease_duration_seconds",
            self.lease_duration_seconds,
            2,
            60,
        )
    }
}

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9]{2,62}$").expect("table name pattern is valid")
    })
}

fn queue_name_setting(key: &str, value: &str) -> Result<QueueName, ConfigurationError> {
    QueueName::new(value.to_string()).map_err(|e| ConfigurationError::Invalid {
        message: format!("{}: {}", key, e),
    })
}

fn check_range(key: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigurationError> {
    if value < min || value > max {
        return Err(ConfigurationError::OutOfRange {
            key: key.to_string(),
            message: format!("{} is outside [{}, {}]", value, min, max),
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
