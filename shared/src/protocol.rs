//! Header-block text model for the tunnel envelope.
//!
//! A request block is `METHOD target HTTP/1.1\r\n` followed by header lines,
//! a response block is `HTTP/1.1 status reason\r\n` followed by header lines.

use std::fmt::Write as _;
use std::time::Duration;

use crate::{Error, Result};

/// Request header that carries per-request tunnel options.
pub const OPTIONS_HEADER: &str = "X-UrlFetch-Options";

/// Declared content type of every carrier exchange.
pub const CARRIER_CONTENT_TYPE: &str = "image/gif";

/// Fetch deadline when the options header does not set one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(20);

/// Largest response body the relay fetches in one go (4 MiB).
pub const DEFAULT_MAX_SIZE: usize = 4 * 1024 * 1024;

const PROTOCOL: &str = "HTTP/1.1";

/// Ordered, case-insensitive header list. Duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value for `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.0[pos].1 = value;
                let mut idx = 0;
                self.0.retain(|(k, _)| {
                    let keep = idx <= pos || !k.eq_ignore_ascii_case(name);
                    idx += 1;
                    keep
                });
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write_lines(&self, out: &mut String) {
        for (k, v) in &self.0 {
            let _ = write!(out, "{k}: {v}\r\n");
        }
    }

    /// Collect `Name: Value` lines; lines without a colon are skipped.
    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let mut headers = Self::new();
        for line in lines {
            if let Some((k, v)) = line.split_once(':') {
                let k = k.trim();
                if !k.is_empty() {
                    headers.append(k, v.trim());
                }
            }
        }
        headers
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Request line and headers of a tunnelled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Absolute-form request target.
    pub target: String,
    pub headers: HeaderList,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: HeaderList::new(),
        }
    }

    pub fn to_block(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, PROTOCOL);
        self.headers.write_lines(&mut out);
        out.push_str("\r\n");
        out
    }

    pub fn parse(block: &str) -> Result<Self> {
        let mut lines = block.lines();
        let line = lines
            .next()
            .ok_or_else(|| Error::Protocol("empty request block".into()))?;

        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() != 3 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(Error::Protocol(format!("invalid request line: {line:?}")));
        }

        Ok(Self {
            method: parts[0].to_string(),
            target: parts[1].to_string(),
            headers: HeaderList::parse_lines(lines),
        })
    }
}

/// Status line and headers of a tunnelled response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// Reason phrase, possibly empty.
    pub reason: String,
    pub headers: HeaderList,
}

impl ResponseHead {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: HeaderList::new(),
        }
    }

    pub fn to_block(&self) -> String {
        let mut out = if self.reason.is_empty() {
            format!("{} {}\r\n", PROTOCOL, self.status)
        } else {
            format!("{} {} {}\r\n", PROTOCOL, self.status, self.reason)
        };
        self.headers.write_lines(&mut out);
        out.push_str("\r\n");
        out
    }

    pub fn parse(block: &str) -> Result<Self> {
        let mut lines = block.lines();
        let line = lines
            .next()
            .ok_or_else(|| Error::Protocol("empty response block".into()))?;

        let mut parts = line.splitn(3, ' ');
        let proto = parts.next().unwrap_or_default();
        if !proto.starts_with("HTTP/") {
            return Err(Error::Protocol(format!("invalid status line: {line:?}")));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|s| (100..1000).contains(s))
            .ok_or_else(|| Error::Protocol(format!("invalid status line: {line:?}")))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        Ok(Self {
            status,
            reason,
            headers: HeaderList::parse_lines(lines),
        })
    }
}
