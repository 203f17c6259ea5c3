//! Producer API — the surface a format driver publishes through.
//!
//! Every driver call receives a [`ProducerContext`]. It carries the driver's
//! own mutable view of the container plus the handles needed to push
//! streams, packets, and change notifications into the engine. All methods
//! take the engine lock internally; the driver itself never sees it.

use std::sync::Arc;

use tracing::trace;

use dmx_common::{sort_chapters, ts_add, Attachment, Chapter, Packet, StreamKind, TagMap, TimeCode};

use crate::engine::{fire_wakeup, Events, Shared, State, ViewState};
use crate::driver::ByteSource;
use crate::queue::AppendResult;
use crate::stream::{CodecDesc, StreamHeader, StreamId, StreamInfo, StreamState};

/// Handle passed to each [`FormatDriver`](crate::driver::FormatDriver) call.
pub struct ProducerContext<'a> {
    shared: Arc<Shared>,
    view: &'a mut ViewState,
    source: Arc<dyn ByteSource>,
}

impl<'a> ProducerContext<'a> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        view: &'a mut ViewState,
        source: Arc<dyn ByteSource>,
    ) -> Self {
        Self {
            shared,
            view,
            source,
        }
    }

    /// The driver's mutable view of container-level info. Changes become
    /// visible to the consumer once published with [`changed`](Self::changed).
    pub fn view_mut(&mut self) -> &mut ViewState {
        self.view
    }

    pub fn view(&self) -> &ViewState {
        self.view
    }

    /// Whether the consumer asked to abort. Long driver operations should
    /// poll this and bail out early.
    pub fn cancel_test(&self) -> bool {
        self.source.cancelled()
    }

    /// Register a new elementary stream and return its dense index.
    ///
    /// Streams are immutable once registered; only their tags can change,
    /// via [`set_stream_tags`](Self::set_stream_tags).
    pub fn register_stream(&mut self, header: StreamHeader) -> StreamId {
        let mut state = self.shared.state.lock();
        add_stream_locked(&mut state, header)
    }

    /// Submit a demuxed packet for the given stream.
    pub fn submit_packet(&mut self, id: StreamId, packet: Packet) {
        let mut state = self.shared.state.lock();
        add_packet_locked(&self.shared, &mut state, id, packet);
    }

    /// Submit a closed-caption packet extracted from a video stream.
    ///
    /// The caption sibling (a subtitle stream excluded from EOF detection)
    /// is created on first use and linked to the video stream. Timestamps
    /// arrive in consumer time and are shifted back to engine time.
    pub fn submit_caption(&mut self, video: StreamId, mut packet: Packet) {
        let mut state = self.shared.state.lock();
        let cc = get_or_create_cc_locked(&mut state, video);
        let off = -state.ts_offset;
        packet.pts = ts_add(packet.pts, off);
        packet.dts = ts_add(packet.dts, off);
        add_packet_locked(&self.shared, &mut state, cc, packet);
    }

    /// Replace a stream's tags. The update is staged and becomes visible to
    /// the consumer on its next `pull_updates`.
    pub fn set_stream_tags(&mut self, id: StreamId, tags: TagMap) {
        if self.view.stream_tags.len() <= id.0 {
            self.view.stream_tags.resize(id.0 + 1, None);
        }
        self.view.stream_tags[id.0] = Some(tags);
        self.changed(Events::METADATA);
    }

    /// Append a chapter to the container info (INIT group). Returns its
    /// index in driver order; chapters are sorted by time on publication.
    pub fn add_chapter(&mut self, title: &str, pts: TimeCode, demuxer_id: u64) -> usize {
        let index = self.view.chapters.len();
        self.view
            .chapters
            .push(Chapter::new(title, pts, demuxer_id, index));
        index
    }

    /// Append an attachment to the container info (INIT group).
    pub fn add_attachment(&mut self, name: &str, mime_type: &str, data: Vec<u8>) -> usize {
        self.view.attachments.push(Attachment {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            data,
        });
        self.view.attachments.len() - 1
    }

    /// Publish pending view changes to the consumer. `events` names the
    /// changed field groups.
    pub fn changed(&mut self, events: Events) {
        publish_changed_parts(&self.shared, self.view, self.source.as_ref(), events);
    }
}

/// Register a stream under the lock. Shared by driver registration and
/// caption-track synthesis.
pub(crate) fn add_stream_locked(state: &mut State, header: StreamHeader) -> StreamId {
    let id = StreamId(state.streams.len());
    let demuxer_id = header.demuxer_id.unwrap_or_else(|| {
        state
            .streams
            .iter()
            .filter(|s| s.info.kind == header.kind)
            .count() as u32
    });

    let info = StreamInfo {
        id,
        kind: header.kind,
        codec: header.codec,
        demuxer_id,
        default_track: header.default_track,
        attached_picture: header.attached_picture,
    };
    let mut st = StreamState::new(info, header.tags);
    st.q.selected = state.autoselect;
    state.streams.push(st);

    state.events |= Events::STREAMS;
    fire_wakeup(state);
    id
}

/// Lazily create the closed-caption sibling of a video stream.
pub(crate) fn get_or_create_cc_locked(state: &mut State, video: StreamId) -> StreamId {
    if let Some(cc) = state.streams[video.0].cc {
        return cc;
    }
    let mut header = StreamHeader::new(StreamKind::Subtitle);
    header.codec = CodecDesc::named("eia_608");
    header.default_track = true;
    let cc = add_stream_locked(state, header);
    state.streams[cc.0].q.ignore_eof = true;
    state.streams[video.0].cc = Some(cc);
    cc
}

/// Route a packet into its stream queue and handle the engine-level
/// consequences (EOF clearing, wakeups, condvar signal).
pub(crate) fn add_packet_locked(shared: &Shared, state: &mut State, id: StreamId, mut packet: Packet) {
    packet.stream = id.0;
    let seeking = state.seeking;
    let slot = &mut state.streams[id.0];
    match slot.q.append(packet, seeking) {
        AppendResult::Dropped => {}
        AppendResult::Queued { first_forward } => {
            let ignore_eof = slot.q.ignore_eof;
            trace!(
                stream = id.0,
                kind = %slot.info.kind,
                fw_packs = slot.q.fw_packs,
                fw_bytes = slot.q.fw_bytes,
                "append packet"
            );
            if !ignore_eof {
                state.eof = false;
                state.last_eof = false;
            }
            // Wake up if this was the first packet after start or underrun.
            if first_forward {
                fire_wakeup(state);
            }
            shared.cond.notify_all();
        }
    }
}

/// Publish view changes: sort chapters on INIT, refresh the cached source
/// state, and stage the flagged field groups in the shadow.
pub(crate) fn publish_changed(shared: &Arc<Shared>, host: &mut crate::engine::DriverHost, events: Events) {
    publish_changed_parts(shared, &mut host.view, host.source.as_ref(), events);
}

fn publish_changed_parts(
    shared: &Shared,
    view: &mut ViewState,
    source: &dyn ByteSource,
    events: Events,
) {
    view.events |= events;

    crate::reader::update_cache(shared, source);

    let mut state = shared.state.lock();
    if view.events.contains(Events::INIT) {
        sort_chapters(&mut view.chapters);
    }
    state.seekable = view.seekable;
    state.partially_seekable = view.partially_seekable;
    state.shadow.copy_from(view);
    fire_wakeup(&state);
}
