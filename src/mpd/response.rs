//! Response decoding: `key: value` attributes and ACK lines.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use super::error::AckError;

static ACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ACK \[(\d+)@(\d+)\] \{([^}]*)\} ?(.*)$").expect("ACK pattern is valid")
});

/// Decode an `ACK [code@index] {command} message` line.
pub fn parse_ack(line: &str) -> Option<AckError> {
    let caps = ACK_RE.captures(line)?;
    Some(AckError {
        code: caps[1].parse().ok()?,
        index: caps[2].parse().ok()?,
        command: caps[3].to_string(),
        message: caps[4].to_string(),
    })
}

/// Split a `key: value` line. Keys never contain `": "`.
pub fn parse_pair(line: &str) -> Option<(&str, &str)> {
    line.split_once(": ")
}

/// Attributes returned by one command, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pairs: Vec<(String, String)>,
}

impl Response {
    /// Build from raw lines (terminator already stripped).
    /// Lines without a `": "` separator are ignored.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pairs = lines
            .into_iter()
            .filter_map(|line| {
                parse_pair(line.as_ref()).map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// MPD booleans are `0`/`1`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }
}
