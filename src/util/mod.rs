//! Utility module
//!
//! This module provides common helpers used throughout the library.

use std::fmt::Write;
use std::time::Duration;

/// Formats a byte slice as lowercase hex for log output
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Converts a whole number of seconds to a duration
pub fn secs(secs: u32) -> Duration {
    Duration::from_secs(u64::from(secs))
}
