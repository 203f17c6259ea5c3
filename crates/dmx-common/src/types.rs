//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Time code in seconds (f64 precision).
///
/// Packet timestamps that may be absent ("unset" in container terms) are
/// carried as `Option<TimeCode>`; the helpers below implement the pick-the-
/// set-one comparison semantics the buffering logic relies on.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TimeCode(pub f64);

impl TimeCode {
    pub const ZERO: Self = Self(0.0);

    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    pub fn as_millis(self) -> f64 {
        self.0 * 1000.0
    }
}

impl Add for TimeCode {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for TimeCode {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Add<f64> for TimeCode {
    type Output = Self;
    fn add(self, rhs: f64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<f64> for TimeCode {
    type Output = Self;
    fn sub(self, rhs: f64) -> Self {
        Self(self.0 - rhs)
    }
}

impl fmt::Display for TimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0)
    }
}

/// Minimum of two optional timestamps. If one side is unset, the other wins.
pub fn ts_min(a: Option<TimeCode>, b: Option<TimeCode>) -> Option<TimeCode> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Maximum of two optional timestamps. If one side is unset, the other wins.
pub fn ts_max(a: Option<TimeCode>, b: Option<TimeCode>) -> Option<TimeCode> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.0 >= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Shift an optional timestamp by `offset` seconds; unset stays unset.
pub fn ts_add(t: Option<TimeCode>, offset: f64) -> Option<TimeCode> {
    t.map(|t| t + offset)
}

/// Kind of an elementary stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Unknown,
}

impl StreamKind {
    /// Short label for logging and display.
    pub fn name(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "sub",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
