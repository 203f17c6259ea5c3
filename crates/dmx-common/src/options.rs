//! Buffering and seeking options.

use serde::{Deserialize, Serialize};

/// Tuning knobs for the demultiplexer engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemuxOptions {
    /// Minimum seconds of forward buffer to maintain per active stream.
    pub readahead_secs: f64,
    /// Supersedes `readahead_secs` (if larger) for network or cached sources.
    pub cache_secs: f64,
    /// Engine-wide forward-window byte cap.
    pub max_bytes: usize,
    /// Engine-wide back-window byte cap.
    pub max_bytes_bw: usize,
    /// Mark partially-seekable sources as seekable.
    pub force_seekable: bool,
    /// Allow seeks inside the buffered range without touching the driver.
    pub seekable_cache: bool,
    /// Allow drivers to load referenced external media.
    pub access_references: bool,
    /// Pre-create a closed-caption sibling track for every video stream.
    pub create_ccs: bool,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            readahead_secs: 1.0,
            cache_secs: 10.0,
            max_bytes: 400 * 1024 * 1024,
            max_bytes_bw: 0,
            force_seekable: false,
            seekable_cache: false,
            access_references: true,
            create_ccs: false,
        }
    }
}
