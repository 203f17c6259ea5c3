//! Consumer API — pulling packets, seeking, selecting tracks.
//!
//! All methods are called by the single consumer thread. Blocking reads
//! park on the engine condvar until the reader thread buffers a packet or
//! flags EOF; in synchronous mode they pump the driver inline instead.

use tracing::{debug, warn};

use dmx_common::{ts_add, Packet, StreamKind, TimeCode};

use crate::engine::{clear_demux_state, Demux, State};
use crate::driver::SeekFlags;
use crate::prune::prune_old_packets;
use crate::reader::{execute_seek, execute_trackswitch, read_packet};
use crate::seek::try_seek_cache;
use crate::stream::StreamId;

/// Result of a non-blocking read attempt.
#[derive(Clone, Debug)]
pub enum ReadResult {
    Packet(Packet),
    /// Nothing buffered yet; the reader has been nudged and the wakeup
    /// callback will fire when a packet arrives.
    NotYet,
    EndOfStream,
}

/// Whether reads on this stream must never force the reader to fetch.
///
/// Cover art is delivered exactly once from the stream info. Subtitles
/// interleaved with actively read audio/video arrive on their own; forcing
/// read-ahead for them could buffer minutes of other streams to find the
/// next subtitle.
fn use_lazy_reading(state: &State, id: StreamId) -> bool {
    let st = &state.streams[id.0];
    if st.info.attached_picture.is_some() {
        return true;
    }
    if st.info.kind != StreamKind::Subtitle {
        return false;
    }
    state.streams.iter().any(|other| {
        other.info.kind != StreamKind::Subtitle
            && other.q.selected
            && !other.q.eof
            && other.info.attached_picture.is_none()
    })
}

/// Take the next packet off a queue and apply the consumer-side fixups:
/// byte-position bookkeeping, timestamp offset, back-buffer eviction.
fn dequeue_packet(state: &mut State, id: StreamId) -> Option<Packet> {
    let slot = &mut state.streams[id.0];

    if let Some(picture) = &slot.info.attached_picture {
        slot.q.eof = true;
        if slot.q.attached_picture_added {
            return None;
        }
        slot.q.attached_picture_added = true;
        let mut pkt = picture.clone();
        pkt.stream = id.0;
        return Some(pkt);
    }

    let mut pkt = slot.q.take_next()?;

    if let Some(pos) = pkt.pos {
        if state.user_filepos.is_none_or(|f| pos >= f) {
            state.user_filepos = Some(pos);
        }
    }

    let off = state.ts_offset;
    pkt.pts = ts_add(pkt.pts, off);
    pkt.dts = ts_add(pkt.dts, off);
    if let Some(seg) = pkt.segment.as_mut() {
        seg.start = ts_add(seg.start, off);
        seg.end = ts_add(seg.end, off);
    }

    prune_old_packets(&mut state.streams, state.max_bytes_bw);
    Some(pkt)
}

impl Demux {
    /// Read the next packet of a stream. Blocks until a packet is buffered
    /// or the stream hits EOF; returns `None` on EOF.
    pub fn read(&self, id: StreamId) -> Option<Packet> {
        let mut state = self.shared.state.lock();
        if !use_lazy_reading(&state, id) {
            debug!(stream = id.0, "reading packet");
            state.eof = false; // force retry
            loop {
                let q = &state.streams[id.0].q;
                if !q.selected || q.has_forward() {
                    break;
                }
                // Engine teardown unblocks waiters with EOF semantics.
                if state.thread_terminate {
                    break;
                }
                state.streams[id.0].q.active = true;
                if state.threading {
                    self.shared.cond.notify_all();
                    self.shared.cond.wait(&mut state);
                } else {
                    read_packet(&self.shared, &mut state);
                }
                if state.streams[id.0].q.eof {
                    break;
                }
            }
        }
        let pkt = dequeue_packet(&mut state, id);
        // possibly read more
        self.shared.cond.notify_all();
        pkt
    }

    /// Non-blocking read. On `NotYet` the stream is switched to active
    /// read-ahead, so a later wakeup callback signals the retry.
    pub fn try_read(&self, id: StreamId) -> ReadResult {
        let threading = {
            let state = self.shared.state.lock();
            state.threading
        };
        if !threading {
            // Without a reader thread there is no later delivery to wait
            // for; read synchronously.
            return match self.read(id) {
                Some(pkt) => ReadResult::Packet(pkt),
                None => ReadResult::EndOfStream,
            };
        }

        let mut state = self.shared.state.lock();
        let pkt = dequeue_packet(&mut state, id);
        if use_lazy_reading(&state, id) {
            return match pkt {
                Some(pkt) => ReadResult::Packet(pkt),
                None => ReadResult::EndOfStream,
            };
        }
        match pkt {
            Some(pkt) => ReadResult::Packet(pkt),
            None => {
                let q = &mut state.streams[id.0].q;
                if q.eof || !q.selected {
                    ReadResult::EndOfStream
                } else {
                    q.active = q.selected; // enable readahead
                    state.eof = false; // force retry
                    self.shared.cond.notify_all();
                    ReadResult::NotYet
                }
            }
        }
    }

    /// Whether a packet is buffered for the stream. Never blocks, never
    /// triggers reads.
    pub fn has_packet(&self, id: StreamId) -> bool {
        self.shared.state.lock().streams[id.0].q.has_forward()
    }

    /// Read the next packet of any stream, in demux order. Synchronous mode
    /// only; returns `None` at end of stream.
    pub fn read_any(&self) -> Option<Packet> {
        let mut state = self.shared.state.lock();
        assert!(!state.threading, "read_any requires synchronous mode");
        let mut read_more = true;
        while read_more {
            for n in 0..state.streams.len() {
                let q = &mut state.streams[n].q;
                q.active = q.selected; // force read_packet to read
                if let Some(pkt) = dequeue_packet(&mut state, StreamId(n)) {
                    return Some(pkt);
                }
            }
            read_more = read_packet(&self.shared, &mut state) && !state.eof;
        }
        None
    }

    /// Request a seek. Returns false (and changes nothing) when the source
    /// is not seekable. The seek itself is asynchronous: buffered packets
    /// are dropped immediately, and reads resume at the target once the
    /// driver got there. Inside the buffered range the request is served
    /// from the cache without involving the driver.
    pub fn seek(&self, pts: TimeCode, flags: SeekFlags) -> bool {
        let mut state = self.shared.state.lock();

        if !state.seekable {
            warn!("cannot seek in this source");
            return false;
        }

        debug!(
            %pts,
            cascade = state.seeking,
            "queuing seek"
        );

        let mut pts = pts;
        if !flags.factor {
            pts = pts - state.ts_offset;
        }

        if try_seek_cache(&mut state, pts, flags) {
            debug!("in-cache seek worked");
        } else {
            clear_demux_state(&mut state);
            state.seeking = true;
            state.seek_flags = flags;
            state.seek_pts = Some(pts);
            if !state.threading {
                execute_seek(&self.shared, &mut state);
            }
        }

        self.shared.cond.notify_all();
        true
    }

    /// Enable or disable packet delivery for one stream.
    ///
    /// Selecting an already-selected stream (or the reverse) is a no-op.
    /// `ref_pts` is the caller's current playback position; enabling a
    /// stream mid-playback triggers a refresh seek back to it so the new
    /// stream gets past packets without disturbing the others.
    pub fn select_track(&self, id: StreamId, ref_pts: Option<TimeCode>, selected: bool) {
        let mut state = self.shared.state.lock();
        if state.streams[id.0].q.selected == selected {
            return;
        }
        debug!(stream = id.0, selected, "track switch");
        let off = state.ts_offset;
        let slot = &mut state.streams[id.0];
        slot.q.selected = selected;
        slot.q.clear_demux_state();
        state.tracks_switched = true;
        let need_refresh = selected && !state.initial_state;
        state.streams[id.0].q.need_refresh = need_refresh;
        if need_refresh {
            state.ref_pts = ts_add(ref_pts, -off);
        }
        if state.threading {
            self.shared.cond.notify_all();
        } else {
            execute_trackswitch(&self.shared, &mut state);
        }
    }

    pub fn stream_is_selected(&self, id: StreamId) -> bool {
        self.shared.state.lock().streams[id.0].q.selected
    }

    /// Drop all buffered packets on all streams.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        clear_demux_state(&mut state);
    }

    /// Set the timestamp offset applied to every delivered packet and
    /// removed from every seek target.
    pub fn set_ts_offset(&self, offset: f64) {
        self.shared.state.lock().ts_offset = offset;
    }
}
