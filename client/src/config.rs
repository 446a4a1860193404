//! Configuration file parser for GTunnel
//!
//! Supports gtunnel.yml with relay definitions and retry policy.
//! Command-line flags override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GTunnelConfig {
    /// Relay endpoints, tried in rotation
    #[serde(default)]
    pub relays: Vec<RelayConfig>,

    /// Shared secret for relays that do not set their own
    pub password: Option<String>,

    /// Local proxy address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Attempts per request
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// Delay after a saturation signal, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Relay fetch deadline in seconds
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Largest response body a relay fetches
    #[serde(default = "default_maxsize")]
    pub maxsize: usize,

    /// Ask relays to verify origin certificates
    #[serde(default)]
    pub sslverify: bool,

    /// Ask relays to log parsed exchanges
    #[serde(default)]
    pub debug: bool,

    /// How long a saturated relay is skipped, in seconds
    #[serde(default = "default_bad_server_cooldown_secs")]
    pub bad_server_cooldown_secs: u64,
}

/// Single relay definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: String,

    /// Overrides the global password
    pub password: Option<String>,
}

impl Default for GTunnelConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            password: None,
            listen: default_listen(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            deadline_secs: default_deadline_secs(),
            maxsize: default_maxsize(),
            sslverify: false,
            debug: false,
            bad_server_cooldown_secs: default_bad_server_cooldown_secs(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8087))
}

fn default_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_deadline_secs() -> u64 {
    gtunnel_shared::protocol::DEFAULT_DEADLINE.as_secs()
}

fn default_maxsize() -> usize {
    gtunnel_shared::protocol::DEFAULT_MAX_SIZE
}

fn default_bad_server_cooldown_secs() -> u64 {
    60
}

impl GTunnelConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: GTunnelConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate the merged configuration
    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            anyhow::bail!("No relays configured; pass --relay or list them in gtunnel.yml");
        }
        if self.retries == 0 {
            anyhow::bail!("retries must be at least 1");
        }

        for relay in &self.relays {
            let uri: http::Uri = relay
                .url
                .parse()
                .with_context(|| format!("Invalid relay URL '{}'", relay.url))?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => anyhow::bail!("Relay URL '{}' must be http or https", relay.url),
            }
            if uri.host().is_none() {
                anyhow::bail!("Relay URL '{}' has no host", relay.url);
            }
        }

        Ok(())
    }

    /// Password sent to `relay`
    pub fn password_for(&self, relay: &RelayConfig) -> Option<String> {
        relay.password.clone().or_else(|| self.password.clone())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn bad_server_cooldown(&self) -> Duration {
        Duration::from_secs(self.bad_server_cooldown_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["gtunnel.yml", "gtunnel.yaml", ".gtunnel.yml", ".gtunnel.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
relays:
  - url: https://relay-a.example/_gh/
  - url: https://relay-b.example/_gh/
    password: override
password: "shared-secret"
retries: 5
retry_delay_ms: 250
sslverify: true
"#;
        let config: GTunnelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.retries, 5);
        assert_eq!(config.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.deadline(), Duration::from_secs(20));
        assert_eq!(config.maxsize, 4 * 1024 * 1024);
        assert_eq!(config.listen, "127.0.0.1:8087".parse::<SocketAddr>().unwrap());
        assert!(config.sslverify);
        assert_eq!(config.password_for(&config.relays[0]).as_deref(), Some("shared-secret"));
        assert_eq!(config.password_for(&config.relays[1]).as_deref(), Some("override"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_and_zero() {
        let config = GTunnelConfig::default();
        assert!(config.validate().is_err());

        let config = GTunnelConfig {
            relays: vec![RelayConfig {
                url: "https://relay.example/_gh/".into(),
                password: None,
            }],
            retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = GTunnelConfig {
            relays: vec![RelayConfig {
                url: "ftp://relay.example/".into(),
                password: None,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
