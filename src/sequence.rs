//! Serial-number ordering for snapshot sequence IDs
//!
//! The coordination service assigns snapshot nodes a monotonic sequence number
//! that wraps across the signed 32-bit range. Snapshot names therefore cannot
//! be ordered with a plain integer compare; this module implements RFC-1982
//! style serial-number arithmetic over a 32-bit sliding window.

use std::cmp::Ordering;
use once_cell::sync::Lazy;
use regex::Regex;

/// Size of the sliding window in bits. Sequence IDs live in a signed 32-bit
/// counter on the service side.
const SERIAL_BITS: u32 = 32;

static SNAPSHOT_NODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^sqlite-db#(-?\d+)$").unwrap_or_else(|e| panic!("invalid snapshot node regex: {e}"))
});

/// Extract the sequence ID from a snapshot node name (`sqlite-db#<seq>`).
/// Returns `None` for names that are not snapshot nodes.
pub fn snapshot_seq(name: &str) -> Option<&str> {
    SNAPSHOT_NODE_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Compare two sequence ID strings with wraparound-aware serial arithmetic.
///
/// An absent ID sorts below any present ID. Present IDs are parsed as signed
/// integers; `a < b` iff (`a < b` and `b - a < 2^31`) or (`a > b` and
/// `a - b > 2^31`).
pub fn sequence_cmp(a: Option<&str>, b: Option<&str>) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let seq_a = match a.and_then(|s| s.parse::<i64>().ok()) {
        Some(v) => v,
        None => return Ordering::Less,
    };
    let seq_b = match b.and_then(|s| s.parse::<i64>().ok()) {
        Some(v) => v,
        None => return Ordering::Greater,
    };
    if seq_a == seq_b {
        return Ordering::Equal;
    }
    let half = 1i64 << (SERIAL_BITS - 1);
    if (seq_a < seq_b && seq_b - seq_a < half) || (seq_a > seq_b && seq_a - seq_b > half) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Compare two snapshot node names by their embedded sequence IDs.
pub fn entry_cmp(a: &str, b: &str) -> Ordering {
    sequence_cmp(snapshot_seq(a), snapshot_seq(b))
}
