//! Per-request tunnel options carried in [`OPTIONS_HEADER`].
//!
//! Format: comma-separated `key` or `key=value` pairs, e.g.
//! `debug,deadline=5,maxsize=2048`.
//!
//! [`OPTIONS_HEADER`]: crate::protocol::OPTIONS_HEADER

use std::time::Duration;

use crate::protocol::{DEFAULT_DEADLINE, DEFAULT_MAX_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    pub deadline: Duration,
    pub maxsize: usize,
    /// Shared secret; empty when not supplied.
    pub password: String,
    pub sslverify: bool,
    pub debug: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            maxsize: DEFAULT_MAX_SIZE,
            password: String::new(),
            sslverify: false,
            debug: false,
        }
    }
}

impl TunnelOptions {
    /// Parse a header value. Unknown keys are ignored, unparsable numbers
    /// keep their defaults.
    pub fn parse(value: &str) -> Self {
        let mut opts = Self::default();

        for pair in value.split(',') {
            let (key, val) = match pair.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (pair.trim(), ""),
            };

            match key {
                "debug" => opts.debug = true,
                "sslverify" => opts.sslverify = true,
                "password" => opts.password = val.to_string(),
                "deadline" => {
                    if let Ok(secs) = val.parse::<u64>() {
                        opts.deadline = Duration::from_secs(secs);
                    }
                }
                "maxsize" => {
                    if let Ok(n) = val.parse::<usize>() {
                        opts.maxsize = n;
                    }
                }
                _ => {}
            }
        }

        opts
    }

    /// Render back to header form. Flags are emitted only when set.
    pub fn to_header_value(&self) -> String {
        let mut pairs = Vec::with_capacity(5);
        if self.debug {
            pairs.push("debug".to_string());
        }
        if self.sslverify {
            pairs.push("sslverify".to_string());
        }
        if !self.password.is_empty() {
            pairs.push(format!("password={}", self.password));
        }
        pairs.push(format!("deadline={}", self.deadline.as_secs()));
        pairs.push(format!("maxsize={}", self.maxsize));
        pairs.join(",")
    }
}
