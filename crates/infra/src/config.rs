//! Process configuration loaded from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | `postgres://localhost:5432/orderflow` |
//! | `AMQP_URL` | `amqp://localhost:5672/%2f` |
//! | `ORDER_EXPIRES_IN_HOURS` | `24` |
//! | `REFUND_WINDOW_DAYS` | `30` |
//! | `ORDER_CURRENCY` | `USD` |
//! | `OUTBOX_POLL_INTERVAL_SECS` | `5` |
//! | `OUTBOX_BATCH_SIZE` | `100` |
//! | `EXPIRY_SWEEP_INTERVAL_SECS` | `300` |
//! | `EXPIRY_GRACE_MINUTES` | `60` |
//! | `GATEWAY_TIMEOUT_SECS` | `10` |
//! | `BROKER_TIMEOUT_SECS` | `5` |

use std::time::Duration as StdDuration;

use chrono::Duration;
use thiserror::Error;
use tracing::warn;

use orderflow_core::Currency;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/orderflow";
const DEFAULT_AMQP_URL: &str = "amqp://localhost:5672/%2f";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Order lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSettings {
    /// How long a new order stays payable.
    pub ttl: Duration,
    pub currency: Currency,
    /// Refunds may be requested this long after payment.
    pub refund_window: Duration,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            currency: Currency::usd(),
            refund_window: Duration::days(30),
        }
    }
}

/// Outbox publisher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxSettings {
    pub poll_interval: StdDuration,
    pub batch_size: usize,
    /// Upper bound on a single broker publish.
    pub publish_timeout: StdDuration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval: StdDuration::from_secs(5),
            batch_size: 100,
            publish_timeout: StdDuration::from_secs(5),
        }
    }
}

/// Expiry sweep settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirySettings {
    pub interval: StdDuration,
    /// Orders are swept once they are this far past `expires_at`.
    pub grace: Duration,
    pub batch_size: usize,
}

impl Default for ExpirySettings {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(300),
            grace: Duration::minutes(60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub amqp_url: String,
    pub orders: OrderSettings,
    pub outbox: OutboxSettings,
    pub expiry: ExpirySettings,
    /// Upper bound on every payment gateway call.
    pub gateway_timeout: StdDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            amqp_url: DEFAULT_AMQP_URL.to_string(),
            orders: OrderSettings::default(),
            outbox: OutboxSettings::default(),
            expiry: ExpirySettings::default(),
            gateway_timeout: StdDuration::from_secs(10),
        }
    }
}

impl Config {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| {
            warn!(default = DEFAULT_DATABASE_URL, "DATABASE_URL not set, using default");
            defaults.database_url.clone()
        });
        let amqp_url = lookup("AMQP_URL").unwrap_or_else(|| {
            warn!(default = DEFAULT_AMQP_URL, "AMQP_URL not set, using default");
            defaults.amqp_url.clone()
        });

        let currency = match lookup("ORDER_CURRENCY") {
            Some(raw) => raw.parse::<Currency>().map_err(|e| ConfigError::Invalid {
                key: "ORDER_CURRENCY",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.orders.currency.clone(),
        };

        let orders = OrderSettings {
            ttl: Duration::hours(positive(&lookup, "ORDER_EXPIRES_IN_HOURS", 24)? as i64),
            currency,
            refund_window: Duration::days(positive(&lookup, "REFUND_WINDOW_DAYS", 30)? as i64),
        };

        let outbox = OutboxSettings {
            poll_interval: StdDuration::from_secs(positive(&lookup, "OUTBOX_POLL_INTERVAL_SECS", 5)?),
            batch_size: positive(&lookup, "OUTBOX_BATCH_SIZE", 100)? as usize,
            publish_timeout: StdDuration::from_secs(positive(&lookup, "BROKER_TIMEOUT_SECS", 5)?),
        };

        let expiry = ExpirySettings {
            interval: StdDuration::from_secs(positive(&lookup, "EXPIRY_SWEEP_INTERVAL_SECS", 300)?),
            grace: Duration::minutes(non_negative(&lookup, "EXPIRY_GRACE_MINUTES", 60)? as i64),
            batch_size: defaults.expiry.batch_size,
        };

        Ok(Self {
            database_url,
            amqp_url,
            orders,
            outbox,
            expiry,
            gateway_timeout: StdDuration::from_secs(positive(&lookup, "GATEWAY_TIMEOUT_SECS", 10)?),
        })
    }
}

fn non_negative<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = non_negative(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    // Keeps hour/day counts convertible to chrono durations.
    if value > i32::MAX as u64 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "value too large".to_string(),
        });
    }
    Ok(value)
}
