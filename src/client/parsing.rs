//! Regex based parsing of Valkey text replies.
//!
//! All functions here are pure, so they are tested without a server.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::types::{NodeAddress, Redirect, RedirectKind};

/// Errors that can occur during parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to compile regex: {0}")]
    RegexCompilation(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

static REDIRECT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(MOVED|ASK) (\d+) (\S*):(\d+)\b").ok());

/// Parse key-value pairs from INFO output.
///
/// INFO output format: `key:value` per line, with section headers starting with `#`.
///
/// # Example
/// ```
/// use valkey_reshard::client::parsing::parse_info_output;
///
/// let info = "# Memory\nused_memory:1048576\n";
/// let parsed = parse_info_output(info).unwrap();
/// assert_eq!(parsed.get("used_memory"), Some(&"1048576".to_string()));
/// ```
pub fn parse_info_output(info: &str) -> Result<HashMap<String, String>, ParseError> {
    let kv_regex =
        Regex::new(r"^([\w-]+):(.+)$").map_err(|e| ParseError::RegexCompilation(e.to_string()))?;

    let mut result = HashMap::new();
    for line in info.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(caps) = kv_regex.captures(line)
            && let (Some(key), Some(value)) = (caps.get(1), caps.get(2))
        {
            result.insert(key.as_str().to_string(), value.as_str().to_string());
        }
    }

    Ok(result)
}

/// Parse a specific value from INFO output by key name.
pub fn parse_info_value(info: &str, key: &str) -> Option<String> {
    parse_info_output(info)
        .ok()
        .and_then(|map| map.get(key).cloned())
}

/// Parse an integer value from INFO output.
pub fn parse_info_int(info: &str, key: &str) -> Option<i64> {
    parse_info_value(info, key).and_then(|v| v.trim().parse().ok())
}

/// Parsed `INFO memory` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryInfo {
    /// Bytes allocated by the server (`used_memory`).
    pub used_memory: u64,
    pub used_memory_human: Option<String>,
    pub used_memory_peak: Option<u64>,
    pub used_memory_rss: Option<u64>,
    pub used_memory_dataset: Option<u64>,
    /// 0 means no limit.
    pub maxmemory: Option<u64>,
    pub mem_fragmentation_ratio: Option<f64>,
}

impl MemoryInfo {
    /// Parse from INFO MEMORY output. `used_memory` is required.
    pub fn parse(info: &str) -> Result<Self, ParseError> {
        let parsed = parse_info_output(info)?;
        let num = |key: &str| parsed.get(key).and_then(|v| v.trim().parse::<u64>().ok());

        Ok(MemoryInfo {
            used_memory: num("used_memory")
                .ok_or_else(|| ParseError::MissingField("used_memory".to_string()))?,
            used_memory_human: parsed.get("used_memory_human").cloned(),
            used_memory_peak: num("used_memory_peak"),
            used_memory_rss: num("used_memory_rss"),
            used_memory_dataset: num("used_memory_dataset"),
            maxmemory: num("maxmemory"),
            mem_fragmentation_ratio: parsed
                .get("mem_fragmentation_ratio")
                .and_then(|v| v.trim().parse().ok()),
        })
    }
}

/// Parse a `MOVED <slot> <host>:<port>` or `ASK <slot> <host>:<port>` reply.
///
/// The marker may be preceded by other text, as client libraries often wrap
/// server errors in their own message. A server that does not know its own
/// announced address replies with an empty host (`MOVED 3999 :6381`); the
/// host is then left empty, see [`Redirect::or_host`].
pub fn parse_redirect(message: &str) -> Option<Redirect> {
    let caps = REDIRECT_RE.as_ref()?.captures(message)?;
    let kind = match caps.get(1)?.as_str() {
        "MOVED" => RedirectKind::Moved,
        _ => RedirectKind::Ask,
    };
    let slot = caps.get(2)?.as_str().parse().ok()?;
    let host = caps.get(3)?.as_str();
    let port = caps.get(4)?.as_str().parse().ok()?;

    Some(Redirect {
        kind,
        slot,
        address: NodeAddress::new(host, port),
    })
}
