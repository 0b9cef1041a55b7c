//! Utilities used in this crate.
//!
//! This is not part of the public interface of the crate.

use lazy_static::lazy_static;
use nix::libc;
use regex::Regex;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

lazy_static! {
    static ref LEADING_INT: Regex = Regex::new(r"^\s*([+-]?\d+)").unwrap();
}

/// Parse the leading integer of a string the way C's `atoi` does.
///
/// Returns `0` if the string does not start with a number.
pub fn atoi(s: &str) -> i64 {
    LEADING_INT
        .captures(s)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Remove every whitespace character from `s`.
pub fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Create `dir` and all missing parents with owner-only permissions.
pub fn mkdir_p(dir: &Path) -> std::io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

/// Seconds since the epoch, saturating at zero for clocks set before 1970.
pub fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Format `t` in local time as `YYYYMMDD-HHMMSS`.
pub fn local_timestamp(t: SystemTime) -> String {
    let secs = unix_seconds(t) as libc::time_t;
    // SAFETY: `tm` is plain old data, zeroed and then filled by `localtime_r`, which only
    // reads `secs` and writes through the two valid pointers.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        libc::localtime_r(&secs, &mut tm);
    }
    format!(
        "{}{:02}{:02}-{:02}{:02}{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}
