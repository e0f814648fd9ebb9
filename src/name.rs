//! Element and bucket naming
//!
//! Element names are 14 lowercase hex digits packing seconds since the
//! epoch (8), microseconds (5) and a PID-derived digit (1), so lexical
//! order approximates insertion order. Bucket names are 8 hex digits.
//! Two calls within the same microsecond by the same process can
//! collide; callers treat that as a retryable race.

use regex::Regex;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Staging directory for elements being populated by producers
pub const TEMPORARY_DIR: &str = "temporary";

/// Staging directory for elements being torn down by consumers
pub const OBSOLETE_DIR: &str = "obsolete";

/// Lock marker directory inside an element
pub const LOCKED_DIR: &str = "locked";

/// Lock suffix used by single-payload file elements
pub const LOCKED_SUFFIX: &str = ".lck";

/// Leaf element name: 14 lowercase hex digits
pub static ELEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{14}$").expect("invalid element regex"));

/// Bucket name: 8 lowercase hex digits
pub static BUCKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{8}$").expect("invalid bucket regex"));

/// Full element path relative to the queue root
pub static ELEMENT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{8}/[0-9a-f]{14}$").expect("invalid element path regex"));

/// Locked single-payload element: leaf name plus the lock suffix
pub static LOCKED_ELEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{14}\.lck$").expect("invalid locked element regex"));

/// Schema field name: alphanumeric, `locked` excluded separately
pub static FIELD_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-zA-Z]+$").expect("invalid field name regex"));

/// Generate a fresh element name from the current time and PID
pub fn new_name() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() as u32;
    let micros = now.subsec_micros();
    let digit = std::process::id() % 16;
    format!("{secs:08x}{micros:05x}{digit:01x}")
}

/// Format a bucket name from its sequence number
pub fn bucket_name(seq: u32) -> String {
    format!("{seq:08x}")
}

/// Parse a bucket name back to its sequence number
pub fn bucket_seq(name: &str) -> Option<u32> {
    u32::from_str_radix(name, 16).ok()
}

/// Split an element path into its bucket and leaf components
pub fn split_element_path(name: &str) -> Option<(&str, &str)> {
    let (bucket, leaf) = name.split_once('/')?;
    if BUCKET_RE.is_match(bucket) && ELEMENT_RE.is_match(leaf) {
        Some((bucket, leaf))
    } else {
        None
    }
}
