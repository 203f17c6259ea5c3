//! Per-stream packet queue with forward and back windows.
//!
//! The queue is a single append-only ring of packets split by a moving
//! reader cursor: everything before the cursor is the back buffer (retained
//! for in-buffer seeks), everything from the cursor on is the forward buffer
//! (awaiting consumption). Byte and packet counts for both windows are
//! maintained incrementally and must always match a full recount.
//!
//! Besides plain FIFO duty the queue tracks everything the scheduler needs
//! per stream: DTS/position monotonicity, the last queued timestamp, the
//! smallest still-reachable seek target (`back_pts`), a keyframe-anchored
//! bitrate estimate, and the refresh-deduplication state used after
//! mid-stream track switches.

use std::collections::VecDeque;

use dmx_common::{ts_min, Packet, StreamKind, TimeCode};

use crate::driver::SeekFlags;
use crate::stream::QueueStats;

/// Timestamp regressions larger than this are treated as a stream-local
/// reset rather than packet reordering, and accepted into `last_ts`.
const TS_RESET_SECS: f64 = 10.0;

/// Minimum keyframe-to-keyframe window for a bitrate sample.
const BITRATE_WINDOW_SECS: f64 = 0.5;

/// What `append` did with a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AppendResult {
    /// The packet was discarded (unselected stream, pending refresh or
    /// seek, or refresh deduplication).
    Dropped,
    /// The packet was queued.
    Queued {
        /// True if this packet re-armed an empty forward window; the
        /// consumer may be blocked waiting for exactly this.
        first_forward: bool,
    },
}

/// Per-stream buffering state. All fields are guarded by the engine lock.
pub(crate) struct StreamQueue {
    pub kind: StreamKind,

    /// Consumer wants packets from this stream.
    pub selected: bool,
    /// Reader tries to keep at least one packet buffered.
    pub active: bool,
    /// End of demuxed stream (producer EOF or overflow) and the forward
    /// window is empty.
    pub eof: bool,
    /// Stream does not count toward global underrun/EOF detection
    /// (synthetic caption streams).
    pub ignore_eof: bool,

    /// Enabled mid-stream; a refresh seek is pending for it.
    pub need_refresh: bool,
    /// Replaying already-delivered data after a refresh seek; packets are
    /// dropped until the pre-switch position is reached again.
    pub refreshing: bool,

    /// Packet DTS observed strictly monotonically increasing so far.
    pub correct_dts: bool,
    /// Packet byte position observed strictly monotonically increasing.
    pub correct_pos: bool,

    pub fw_packs: usize,
    pub fw_bytes: usize,
    pub bw_bytes: usize,

    pub last_pos: Option<u64>,
    pub last_dts: Option<TimeCode>,
    /// Timestamp of the last packet added to the queue.
    pub last_ts: Option<TimeCode>,
    /// Smallest timestamp reachable by an in-buffer seek.
    pub back_pts: Option<TimeCode>,

    /// Timestamp of the last packet returned to the consumer; anchors
    /// read-ahead.
    pub base_ts: Option<TimeCode>,
    pub last_br_ts: Option<TimeCode>,
    pub last_br_bytes: usize,
    /// Most recent bitrate estimate in bytes per second.
    pub bitrate: Option<f64>,

    /// After a flushed seek without an in-buffer target: drop packets until
    /// the next keyframe.
    pub skip_to_keyframe: bool,
    /// One-shot delivery flag for attached-picture streams.
    pub attached_picture_added: bool,

    packets: VecDeque<Packet>,
    /// Index of the next packet to hand to the consumer. Equal to
    /// `packets.len()` when the forward window is empty.
    reader: usize,
}

impl StreamQueue {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            selected: false,
            active: false,
            eof: false,
            ignore_eof: false,
            need_refresh: false,
            refreshing: false,
            correct_dts: true,
            correct_pos: true,
            fw_packs: 0,
            fw_bytes: 0,
            bw_bytes: 0,
            last_pos: None,
            last_dts: None,
            last_ts: None,
            back_pts: None,
            base_ts: None,
            last_br_ts: None,
            last_br_bytes: 0,
            bitrate: None,
            skip_to_keyframe: false,
            attached_picture_added: false,
            packets: VecDeque::new(),
            reader: 0,
        }
    }

    /// Whether at least one packet awaits the consumer.
    pub fn has_forward(&self) -> bool {
        self.reader < self.packets.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            fw_packs: self.fw_packs,
            fw_bytes: self.fw_bytes,
            bw_bytes: self.bw_bytes,
            total_packs: self.packets.len(),
        }
    }

    /// Reset the consumer-facing half: cursor, read-ahead anchor, bitrate
    /// window, one-shot flags. Queued packets stay; callers that move the
    /// cursor afterwards must call [`recompute_buffers`](Self::recompute_buffers).
    pub fn clear_reader_state(&mut self) {
        self.reader = self.packets.len();
        self.base_ts = None;
        self.last_br_ts = None;
        self.last_br_bytes = 0;
        self.bitrate = None;
        self.skip_to_keyframe = false;
        self.attached_picture_added = false;
    }

    /// Drop everything: packets, windows, monotonicity tracking.
    /// Selection is left alone, it is a consumer decision.
    pub fn clear_demux_state(&mut self) {
        self.clear_reader_state();
        self.packets.clear();
        self.reader = 0;
        self.fw_packs = 0;
        self.fw_bytes = 0;
        self.bw_bytes = 0;
        self.eof = false;
        self.active = false;
        self.refreshing = false;
        self.need_refresh = false;
        self.correct_dts = true;
        self.correct_pos = true;
        self.last_pos = None;
        self.last_dts = None;
        self.last_ts = None;
        self.back_pts = None;
    }

    /// Append a packet delivered by the producer.
    ///
    /// `engine_seeking` is the engine-wide "a seek is queued" flag; while it
    /// is set all producer output is discarded. The packet must already
    /// carry its stream index.
    pub fn append(&mut self, mut pkt: Packet, engine_seeking: bool) -> AppendResult {
        // Refresh deduplication: consume packets only to find the point
        // where the pre-switch delivery stopped. The boundary packet itself
        // is dropped too, we already handed it out.
        let drop = self.refreshing;
        if self.refreshing {
            if self.correct_dts {
                self.refreshing = match (pkt.dts, self.last_dts) {
                    (Some(dts), Some(last)) => dts < last,
                    (None, _) => true,
                    (_, None) => false,
                };
            } else if self.correct_pos {
                self.refreshing = match (pkt.pos, self.last_pos) {
                    (Some(pos), Some(last)) => pos < last,
                    (None, _) => true,
                    (_, None) => false,
                };
            } else {
                // should not happen, refreshes require a monotonic key
                self.refreshing = false;
            }
        }

        if !self.selected || self.need_refresh || engine_seeking || drop {
            return AppendResult::Dropped;
        }

        self.correct_pos &= match (pkt.pos, self.last_pos) {
            (Some(pos), Some(last)) => pos > last,
            (Some(_), None) => true,
            (None, _) => false,
        };
        self.correct_dts &= match (pkt.dts, self.last_dts) {
            (Some(dts), Some(last)) => dts > last,
            (Some(_), None) => true,
            (None, _) => false,
        };
        self.last_pos = pkt.pos;
        self.last_dts = pkt.dts;

        // For video, PTS determination is not trivial; for everything else
        // distinguishing PTS and DTS is not useful.
        if self.kind != StreamKind::Video && pkt.pts.is_none() {
            pkt.pts = pkt.dts;
        }

        let keyframe = pkt.keyframe;
        let bytes = pkt.estimated_size();
        let mut ts = pkt.queue_ts();
        if let Some(seg) = pkt.segment {
            ts = ts_min(ts, seg.end);
        }

        let had_forward = self.has_forward();
        let eligible = !self.skip_to_keyframe || keyframe;
        self.packets.push_back(pkt);

        let first_forward;
        if had_forward {
            self.fw_packs += 1;
            self.fw_bytes += bytes;
            first_forward = false;
        } else if eligible {
            // cursor already points at the slot just filled
            self.skip_to_keyframe = false;
            self.fw_packs += 1;
            self.fw_bytes += bytes;
            first_forward = true;
        } else {
            self.reader = self.packets.len();
            self.bw_bytes += bytes;
            first_forward = false;
        }

        if self.back_pts.is_none() && keyframe {
            self.back_pts = self.range_pts_from(0);
        }

        if !self.ignore_eof {
            self.eof = false;
        }

        if let Some(t) = ts {
            let accept = match self.last_ts {
                None => true,
                Some(last) => t > last || t + TS_RESET_SECS < last,
            };
            if accept {
                self.last_ts = Some(t);
            }
        }
        if self.base_ts.is_none() {
            self.base_ts = self.last_ts;
        }

        AppendResult::Queued { first_forward }
    }

    /// Hand the next forward packet to the consumer as a clone; the queued
    /// original moves into the back window. Updates the read-ahead anchor
    /// and the keyframe-window bitrate estimate.
    pub fn take_next(&mut self) -> Option<Packet> {
        if !self.has_forward() {
            return None;
        }
        let pkt = self.packets[self.reader].clone();
        let bytes = pkt.estimated_size();
        self.reader += 1;
        self.fw_packs -= 1;
        self.fw_bytes -= bytes;
        self.bw_bytes += bytes;

        let ts = pkt.queue_ts();
        if ts.is_some() {
            self.base_ts = ts;
        }

        // Bitrate only at keyframe points: queue timestamps may be
        // reordered between them.
        if pkt.keyframe {
            if let Some(t) = ts {
                match self.last_br_ts {
                    Some(prev) if (t - prev).as_secs() >= 0.0 => {
                        let d = (t - prev).as_secs();
                        if d >= BITRATE_WINDOW_SECS {
                            self.bitrate = Some(self.last_br_bytes as f64 / d);
                            self.last_br_ts = Some(t);
                            self.last_br_bytes = 0;
                        }
                    }
                    _ => {
                        self.bitrate = None;
                        self.last_br_ts = Some(t);
                        self.last_br_bytes = 0;
                    }
                }
            }
        }
        self.last_br_bytes += pkt.len();

        Some(pkt)
    }

    /// Minimum presentation timestamp of the keyframe range starting at or
    /// after `start` (packet index). A range opens at the first keyframe
    /// encountered and closes at the next one. Timestamps outside a
    /// packet's segment bounds are ignored.
    pub fn range_pts_from(&self, start: usize) -> Option<TimeCode> {
        let mut in_range = false;
        let mut res: Option<TimeCode> = None;
        for pkt in self.packets.iter().skip(start) {
            if pkt.keyframe {
                if in_range {
                    break;
                }
                in_range = true;
            }
            if in_range {
                let mut ts = pkt.present_ts();
                if let (Some(t), Some(seg)) = (ts, pkt.segment) {
                    let before = seg.start.is_some_and(|s| t < s);
                    let after = seg.end.is_some_and(|e| t > e);
                    if before || after {
                        ts = None;
                    }
                }
                res = ts_min(res, ts);
            }
        }
        res
    }

    /// Pick the best in-buffer seek entry for `(pts, flags)`: the keyframe
    /// whose range timestamp is nearest to `pts`. With `forward` set, only
    /// targets at or past `pts` qualify. Returns a packet index.
    pub fn find_seek_target(&self, pts: TimeCode, flags: SeekFlags) -> Option<usize> {
        let mut target: Option<usize> = None;
        let mut target_diff: Option<f64> = None;
        for (i, pkt) in self.packets.iter().enumerate() {
            if !pkt.keyframe {
                continue;
            }
            let Some(range_pts) = self.range_pts_from(i) else {
                continue;
            };

            let mut diff = (range_pts - pts).as_secs();
            if flags.forward {
                diff = -diff;
                if diff > 0.0 {
                    continue;
                }
            }
            if let Some(td) = target_diff {
                if diff <= 0.0 {
                    // prefer the latest target at or before the request
                    if td <= 0.0 && diff <= td {
                        continue;
                    }
                } else if diff >= td {
                    continue;
                }
            }
            target_diff = Some(diff);
            target = Some(i);
        }
        target
    }

    /// Point the reader cursor at `idx`, or past the end when `None`.
    pub fn set_reader(&mut self, idx: Option<usize>) {
        self.reader = idx.unwrap_or(self.packets.len());
    }

    /// Recount both windows from scratch. Needed after the cursor was moved
    /// by an in-buffer seek.
    pub fn recompute_buffers(&mut self) {
        self.fw_packs = 0;
        self.fw_bytes = 0;
        self.bw_bytes = 0;
        for (i, pkt) in self.packets.iter().enumerate() {
            let bytes = pkt.estimated_size();
            if i < self.reader {
                self.bw_bytes += bytes;
            } else {
                self.fw_packs += 1;
                self.fw_bytes += bytes;
            }
        }
    }

    /// Oldest packet that eviction may drop (strictly before the cursor).
    pub fn front_evictable(&self) -> Option<&Packet> {
        if self.reader > 0 {
            self.packets.front()
        } else {
            None
        }
    }

    /// One eviction round: find the next viable seek entry behind the
    /// cursor, make it the new `back_pts`, and free every back-buffer
    /// packet before it. Packets between keyframes have no seek value, so
    /// whole keyframe ranges are dropped. Returns the freed byte estimate.
    pub fn prune_step(&mut self) -> usize {
        self.back_pts = None;

        // The new seek target has to be past the queue head so at least one
        // packet gets dropped. Ranges without a usable timestamp are passed
        // over (and freed along with everything before the viable one).
        let mut next_target: Option<usize> = None;
        for i in 1..self.packets.len() {
            if self.packets[i].keyframe {
                self.back_pts = self.range_pts_from(i);
                if self.back_pts.is_some() {
                    next_target = Some(i);
                    break;
                }
            }
        }

        let mut freed = 0;
        while self.reader > 0 && next_target != Some(0) {
            let pkt = self.packets.pop_front().expect("reader > 0 implies packets");
            let bytes = pkt.estimated_size();
            self.bw_bytes -= bytes;
            freed += bytes;
            self.reader -= 1;
            if let Some(t) = next_target.as_mut() {
                *t -= 1;
            }
        }
        freed
    }

    /// Debug recount used by accounting assertions in tests.
    #[cfg(test)]
    pub fn recount(&self) -> QueueStats {
        let mut s = QueueStats {
            total_packs: self.packets.len(),
            ..QueueStats::default()
        };
        for (i, pkt) in self.packets.iter().enumerate() {
            if i < self.reader {
                s.bw_bytes += pkt.estimated_size();
            } else {
                s.fw_packs += 1;
                s.fw_bytes += pkt.estimated_size();
            }
        }
        s
    }
}
