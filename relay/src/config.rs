//! Relay configuration, read from the environment.

use std::time::Duration;

/// Delay before retrying a fetch that hit the platform quota.
pub const DEFAULT_OVERQUOTA_DELAY: Duration = Duration::from_secs(4);

/// Delay before retrying a fetch whose channel was closed.
pub const DEFAULT_CLOSED_DELAY: Duration = Duration::from_secs(1);

/// Fetch attempts per carrier request.
pub const FETCH_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Shared secret clients must send; empty disables the check.
    pub password: String,
    pub version: String,
    pub overquota_delay: Duration,
    pub closed_delay: Duration,
    /// Largest carrier request body accepted.
    pub max_request_body: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            password: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            overquota_delay: DEFAULT_OVERQUOTA_DELAY,
            closed_delay: DEFAULT_CLOSED_DELAY,
            max_request_body: 32 * 1024 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            port: lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(defaults.port),
            password: lookup("GTUNNEL_PASSWORD").unwrap_or(defaults.password),
            version: lookup("GTUNNEL_VERSION").unwrap_or(defaults.version),
            overquota_delay: millis("GTUNNEL_OVERQUOTA_DELAY_MS", defaults.overquota_delay),
            closed_delay: millis("GTUNNEL_CLOSED_DELAY_MS", defaults.closed_delay),
            max_request_body: lookup("GTUNNEL_MAX_REQUEST_BODY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_request_body),
        }
    }
}
