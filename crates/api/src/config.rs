//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use coordinator::{CoordinatorConfig, RetryPolicy};
use domain::OutOfOrderPolicy;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory store when unset
/// - `ALPHA_MAILBOX_CAPACITY`
/// - `ALPHA_OUT_OF_ORDER`: `strict` or `lenient`
/// - `ALPHA_OUT_OF_ORDER_WINDOW_MS`
/// - `ALPHA_COMPENSATION_MAX_ATTEMPTS`
/// - `ALPHA_COMPENSATION_BACKOFF_MS`
/// - `ALPHA_COMPENSATION_MAX_BACKOFF_MS`
/// - `ALPHA_BRANCH_TIMEOUT_MS`: unset disables branch timeouts
/// - `ALPHA_SNAPSHOT_INTERVAL`: 0 disables snapshots
/// - `ALPHA_CALLBACK_TIMEOUT_MS`: how long an omega has to acknowledge a
///   compensation command
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub callback_timeout: Duration,
    pub coordinator: CoordinatorConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    ///
    /// Values that fail to parse are logged and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| parse_var::<u64>(&lookup, key);

        let retry_defaults = &defaults.coordinator.retry;
        let retry = RetryPolicy::new(
            parse_var(&lookup, "ALPHA_COMPENSATION_MAX_ATTEMPTS")
                .unwrap_or(retry_defaults.max_attempts),
            parse("ALPHA_COMPENSATION_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.initial_backoff),
            parse("ALPHA_COMPENSATION_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_backoff),
        );

        let coordinator = defaults
            .coordinator
            .clone()
            .with_mailbox_capacity(
                parse_var(&lookup, "ALPHA_MAILBOX_CAPACITY")
                    .unwrap_or(defaults.coordinator.mailbox_capacity),
            )
            .with_out_of_order(
                parse_var::<OutOfOrderPolicy>(&lookup, "ALPHA_OUT_OF_ORDER")
                    .unwrap_or(defaults.coordinator.out_of_order),
                parse("ALPHA_OUT_OF_ORDER_WINDOW_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.coordinator.out_of_order_window),
            )
            .with_retry(retry)
            .with_branch_timeout(parse("ALPHA_BRANCH_TIMEOUT_MS").map(Duration::from_millis))
            .with_snapshot_interval(
                parse("ALPHA_SNAPSHOT_INTERVAL").unwrap_or(defaults.coordinator.snapshot_interval),
            );

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            callback_timeout: parse("ALPHA_CALLBACK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.callback_timeout),
            coordinator,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            database_max_connections: 10,
            callback_timeout: Duration::from_secs(30),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, value = %raw, error = %err, "ignoring invalid setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert!(config.coordinator.branch_timeout.is_none());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.coordinator.mailbox_capacity, 256);
        assert_eq!(config.coordinator.out_of_order, OutOfOrderPolicy::Strict);
        assert_eq!(config.coordinator.retry, RetryPolicy::default());
    }

    #[test]
    fn coordinator_settings_are_read() {
        let config = from_pairs(&[
            ("PORT", "8081"),
            ("DATABASE_URL", "postgres://alpha@localhost/alpha"),
            ("ALPHA_MAILBOX_CAPACITY", "32"),
            ("ALPHA_OUT_OF_ORDER", "lenient"),
            ("ALPHA_OUT_OF_ORDER_WINDOW_MS", "750"),
            ("ALPHA_COMPENSATION_MAX_ATTEMPTS", "7"),
            ("ALPHA_COMPENSATION_BACKOFF_MS", "50"),
            ("ALPHA_COMPENSATION_MAX_BACKOFF_MS", "1000"),
            ("ALPHA_BRANCH_TIMEOUT_MS", "60000"),
            ("ALPHA_SNAPSHOT_INTERVAL", "0"),
        ]);

        assert_eq!(config.port, 8081);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://alpha@localhost/alpha")
        );
        let c = &config.coordinator;
        assert_eq!(c.mailbox_capacity, 32);
        assert_eq!(c.out_of_order, OutOfOrderPolicy::Lenient);
        assert_eq!(c.out_of_order_window, Duration::from_millis(750));
        assert_eq!(c.retry.max_attempts, 7);
        assert_eq!(c.retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(c.retry.max_backoff, Duration::from_secs(1));
        assert_eq!(c.branch_timeout, Some(Duration::from_secs(60)));
        assert_eq!(c.snapshot_interval, 0);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "not-a-port"),
            ("ALPHA_OUT_OF_ORDER", "sometimes"),
            ("DATABASE_URL", "  "),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.coordinator.out_of_order, OutOfOrderPolicy::Strict);
        assert!(config.database_url.is_none());
    }
}
