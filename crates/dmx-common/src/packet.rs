//! Demuxed packets — output of a format driver, input to a decoder.

use crate::types::TimeCode;

/// Fixed per-packet bookkeeping overhead used by the size estimate.
///
/// Counts queue-node and header cost on top of the payload so that byte
/// accounting does not undercount streams with many tiny packets.
const PACKET_OVERHEAD: usize = 64;

/// Clip bounds for packets of a timeline-segmented stream.
///
/// Timestamps outside `[start, end]` belong to a neighbouring segment and are
/// ignored by keyframe-range timestamp scans.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Segment {
    pub start: Option<TimeCode>,
    pub end: Option<TimeCode>,
}

/// A single demuxed packet.
///
/// Packets are immutable once submitted to the engine. The engine keeps the
/// queued original until it is evicted; the consumer receives a clone with
/// the timestamp offset applied.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Compressed payload bytes, opaque to the engine.
    pub payload: Vec<u8>,
    /// Presentation timestamp.
    pub pts: Option<TimeCode>,
    /// Decode timestamp.
    pub dts: Option<TimeCode>,
    /// Byte offset of the packet in the source, if known.
    pub pos: Option<u64>,
    /// Whether decoding can start at this packet.
    pub keyframe: bool,
    /// Clip bounds when the stream is timeline-segmented.
    pub segment: Option<Segment>,
    /// Index of the stream this packet belongs to. Assigned on submission.
    pub stream: usize,
}

impl Packet {
    /// Create a packet holding `payload` with no timestamps set.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            pts: None,
            dts: None,
            pos: None,
            keyframe: false,
            segment: None,
            stream: 0,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Stable byte estimate of payload plus bookkeeping overhead.
    ///
    /// Append, dequeue, and prune all use this same estimate, which keeps the
    /// incremental forward/back byte totals consistent with a recount.
    pub fn estimated_size(&self) -> usize {
        self.payload.len() + PACKET_OVERHEAD
    }

    /// The timestamp the buffering logic orders by: DTS if present, else PTS.
    pub fn queue_ts(&self) -> Option<TimeCode> {
        self.dts.or(self.pts)
    }

    /// PTS if present, else DTS. Used for seek-target timestamps.
    pub fn present_ts(&self) -> Option<TimeCode> {
        self.pts.or(self.dts)
    }
}
