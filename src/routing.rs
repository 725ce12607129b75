//! Device GUID extraction and destination rewriting
//!
//! The proxy inspects only the first line of a connection's opening bytes.
//! Anything shaped like a dashed GUID in that line is treated as an opaque
//! routing key; no version or variant bits are checked, so pre-RFC4122
//! identifiers route the same way.

use regex::bytes::Regex;
use std::sync::LazyLock;

/// Matches any 8-4-4-4-12 dashed hex token, compiled once per process.
static GUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "[a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12}",
    )
    .expect("failed to compile GUID pattern")
});

/// Extract a device GUID from the first line of `data`.
///
/// Returns `None` when there is no newline, the first line is empty, or the
/// line contains no GUID-shaped token. Bytes after the first newline are
/// never inspected.
#[must_use]
pub fn extract_guid(data: &[u8]) -> Option<&str> {
    let newline = data.iter().position(|&b| b == b'\n')?;
    if newline == 0 {
        return None;
    }
    let found = GUID_PATTERN.find(&data[..newline])?;
    // The pattern only matches hex digits and dashes, so this is ASCII.
    std::str::from_utf8(found.as_bytes()).ok()
}

/// Rewrite `target` (`host:port`) to point at `instance`, keeping the port.
#[must_use]
pub fn with_instance_host(target: &str, instance: &str) -> String {
    match target.rsplit_once(':') {
        Some((_, port)) => format!("{instance}:{port}"),
        None => instance.to_string(),
    }
}
