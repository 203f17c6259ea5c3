//! Stream identity and registration types.
//!
//! A driver describes each elementary stream with a [`StreamHeader`]; the
//! engine assigns a dense index and freezes the description into a
//! [`StreamInfo`] that is shared with the consumer. The mutable buffering
//! state lives in the per-stream queue, looked up by index; the header
//! never owns or points at the queue.

use std::sync::Arc;

use dmx_common::{Packet, StreamKind, TagMap};

use crate::queue::StreamQueue;

/// Dense index of a registered stream, assigned at registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub usize);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Codec description, opaque to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecDesc {
    /// Codec name, e.g. `h264` or `eia_608`.
    pub name: String,
    /// Codec-specific initialization data (SPS/PPS and friends).
    pub extra_data: Vec<u8>,
}

impl CodecDesc {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_data: Vec::new(),
        }
    }
}

/// Stream description as built by a format driver, before registration.
#[derive(Clone, Debug)]
pub struct StreamHeader {
    pub kind: StreamKind,
    pub codec: CodecDesc,
    /// Initial tags. Post-registration updates go through
    /// [`ProducerContext::set_stream_tags`](crate::producer::ProducerContext::set_stream_tags).
    pub tags: TagMap,
    /// Container-assigned stream id. Synthesized (count of same-kind
    /// streams) when absent.
    pub demuxer_id: Option<u32>,
    /// Whether the container marks this track as default.
    pub default_track: bool,
    /// Cover art: a single packet delivered at most once per session.
    pub attached_picture: Option<Packet>,
}

impl StreamHeader {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            codec: CodecDesc::default(),
            tags: TagMap::new(),
            demuxer_id: None,
            default_track: false,
            attached_picture: None,
        }
    }
}

/// Immutable description of a registered stream, shared with the consumer.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub id: StreamId,
    pub kind: StreamKind,
    pub codec: CodecDesc,
    pub demuxer_id: u32,
    pub default_track: bool,
    pub attached_picture: Option<Packet>,
}

/// Buffer accounting snapshot for one stream queue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Packets waiting for the consumer.
    pub fw_packs: usize,
    /// Bytes (estimated) waiting for the consumer.
    pub fw_bytes: usize,
    /// Bytes (estimated) retained behind the reader cursor.
    pub bw_bytes: usize,
    /// All packets currently held, back buffer included.
    pub total_packs: usize,
}

/// One registered stream: frozen info plus mutable buffering state.
/// All fields are guarded by the engine lock.
pub(crate) struct StreamState {
    pub info: Arc<StreamInfo>,
    /// Consumer-visible tags; replaced wholesale by staged updates.
    pub tags: TagMap,
    pub q: StreamQueue,
    /// Synthetic closed-caption sibling, created lazily.
    pub cc: Option<StreamId>,
}

impl StreamState {
    pub fn new(info: StreamInfo, tags: TagMap) -> Self {
        let kind = info.kind;
        Self {
            info: Arc::new(info),
            tags,
            q: StreamQueue::new(kind),
            cc: None,
        }
    }
}
