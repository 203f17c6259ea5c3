//! Consumer control queries.
//!
//! Controls are answered from engine state wherever possible: cache info,
//! source size, base filename, bitrate stats, and the reader-state snapshot
//! never touch the driver. Anything else is marshalled onto the reader
//! thread as a one-shot job so that driver calls stay on the thread that
//! owns them.

use tracing::debug;

use dmx_common::{ts_add, ts_max, TimeCode};

use crate::driver::{ControlStatus, DriverCtrl, SourceCacheInfo};
use crate::engine::{Demux, State};

/// A consumer control request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Byte-source cache state.
    CacheInfo,
    /// Total source size in bytes.
    SourceSize,
    /// Undecorated name of the underlying file.
    BaseFilename,
    /// Per-kind bitrate of the selected streams.
    BitrateStats,
    /// Buffering / seek-range snapshot.
    ReaderState,
    /// Pass-through to the format driver.
    Driver(DriverCtrl),
}

/// Answer to a [`ControlCommand`].
#[derive(Clone, Debug, PartialEq)]
pub enum ControlOutcome {
    CacheInfo(SourceCacheInfo),
    SourceSize(u64),
    BaseFilename(String),
    Bitrates(BitrateStats),
    ReaderState(ReaderState),
    /// The driver's answer to a pass-through command.
    Driver(ControlStatus),
    /// The engine has no data to answer this with.
    Unsupported,
}

/// Summed bitrate (bytes per second) of the selected streams, per kind.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BitrateStats {
    pub video: Option<f64>,
    pub audio: Option<f64>,
    pub subtitle: Option<f64>,
}

/// Snapshot of the reader's buffering state, in consumer time.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ReaderState {
    /// Producer hit end of stream.
    pub eof: bool,
    /// Some active stream ran dry while the reader still works.
    pub underrun: bool,
    /// The reader has nothing to do.
    pub idle: bool,
    /// Timestamp of the last packet handed to the consumer.
    pub ts_reader: Option<TimeCode>,
    /// Highest buffered timestamp.
    pub ts_end: Option<TimeCode>,
    /// Seconds of buffer ahead of the reader position.
    pub ts_duration: Option<f64>,
    /// Range servable by an in-buffer seek, if every active stream has one.
    pub seek_range: Option<(TimeCode, TimeCode)>,
}

/// Compute the reader-state snapshot. Must be called with the lock held.
pub(crate) fn reader_state_locked(state: &State) -> ReaderState {
    let mut r = ReaderState {
        eof: state.last_eof,
        ..ReaderState::default()
    };

    let mut any_packets = false;
    let mut seek_ok = state.seekable_cache && !state.seeking;
    let mut ts_min_v: Option<TimeCode> = None;
    let mut ts_max_v: Option<TimeCode> = None;

    for st in &state.streams {
        let q = &st.q;
        let exhausted = q.is_queue_empty() && q.eof;
        if !q.active || exhausted || q.ignore_eof {
            continue;
        }
        r.underrun |= !q.has_forward() && !q.eof;
        r.ts_reader = ts_max(r.ts_reader, q.base_ts);
        // The range start must be accurate (an off target would force a
        // real seek); the end only good enough, since the reader can wait
        // for packets if a seek lands slightly past it. Both take the
        // furthest stream so every stream can serve the range.
        ts_min_v = ts_max(ts_min_v, q.back_pts);
        ts_max_v = ts_max(ts_max_v, q.last_ts);
        if q.back_pts.is_none() || q.last_ts.is_none() {
            seek_ok = false;
        }
        any_packets |= !q.is_queue_empty();
    }

    r.idle = (state.idle && !r.underrun) || r.eof;
    r.underrun &= !r.idle;

    let off = state.ts_offset;
    ts_min_v = ts_add(ts_min_v, off);
    ts_max_v = ts_add(ts_max_v, off);
    r.ts_reader = ts_add(r.ts_reader, off);

    if let (Some(reader), Some(end)) = (r.ts_reader, ts_max_v) {
        if reader <= end {
            r.ts_duration = Some((end - reader).as_secs());
        }
    }
    if state.seeking || !any_packets {
        r.ts_duration = Some(0.0);
    }

    if seek_ok {
        if let (Some(start), Some(end)) = (ts_min_v, ts_max_v) {
            if end > start {
                r.seek_range = Some((start, end));
            }
        }
    }
    r.ts_end = ts_max_v;
    r
}

/// Serve a control from engine state alone. `None` means the command needs
/// the driver.
pub(crate) fn cached_control(state: &mut State, cmd: ControlCommand) -> Option<ControlOutcome> {
    match cmd {
        ControlCommand::CacheInfo | ControlCommand::SourceSize | ControlCommand::BaseFilename => {
            // Keep the cached source state fresh while someone polls it.
            if state.cache.info.is_some() {
                state.force_cache_update = true;
            }
            Some(match cmd {
                ControlCommand::CacheInfo => match state.cache.info {
                    Some(info) => ControlOutcome::CacheInfo(info),
                    None => ControlOutcome::Unsupported,
                },
                ControlCommand::SourceSize => match state.cache.size {
                    Some(size) => ControlOutcome::SourceSize(size),
                    None => ControlOutcome::Unsupported,
                },
                ControlCommand::BaseFilename => match &state.cache.base_filename {
                    Some(name) => ControlOutcome::BaseFilename(name.clone()),
                    None => ControlOutcome::Unsupported,
                },
                _ => unreachable!(),
            })
        }
        ControlCommand::BitrateStats => {
            let mut rates = BitrateStats::default();
            for st in &state.streams {
                if !st.q.selected {
                    continue;
                }
                let Some(br) = st.q.bitrate else { continue };
                let slot = match st.info.kind {
                    dmx_common::StreamKind::Video => &mut rates.video,
                    dmx_common::StreamKind::Audio => &mut rates.audio,
                    dmx_common::StreamKind::Subtitle => &mut rates.subtitle,
                    dmx_common::StreamKind::Unknown => continue,
                };
                *slot = Some(slot.unwrap_or(0.0) + br);
            }
            Some(ControlOutcome::Bitrates(rates))
        }
        ControlCommand::ReaderState => Some(ControlOutcome::ReaderState(reader_state_locked(state))),
        ControlCommand::Driver(_) => None,
    }
}

impl Demux {
    /// Run a control query. Cached commands are answered under the lock;
    /// driver commands are marshalled onto the reader thread (or run inline
    /// in synchronous mode) and block until answered.
    pub fn control(&self, cmd: ControlCommand) -> ControlOutcome {
        let threading;
        {
            let mut state = self.shared.state.lock();
            if let Some(outcome) = cached_control(&mut state, cmd) {
                if state.force_cache_update {
                    self.shared.cond.notify_all();
                }
                return outcome;
            }
            threading = state.threading;
        }

        let ControlCommand::Driver(ctrl) = cmd else {
            return ControlOutcome::Unsupported;
        };

        if threading {
            debug!(?ctrl, "blocking on demuxer thread");
            let mut state = self.shared.state.lock();
            while state.run_job.is_some() {
                self.shared.cond.wait(&mut state);
            }
            state.run_job = Some(Box::new(move |host, shared| {
                let (driver, mut ctx) = host.split(shared);
                ControlOutcome::Driver(driver.control(&mut ctx, ctrl))
            }));
            self.shared.cond.notify_all();
            while state.run_result.is_none() {
                self.shared.cond.wait(&mut state);
            }
            state.run_result.take().unwrap()
        } else {
            let mut host = self.shared.host.lock();
            match host.as_mut() {
                Some(host) => {
                    let (driver, mut ctx) = host.split(&self.shared);
                    ControlOutcome::Driver(driver.control(&mut ctx, ctrl))
                }
                None => ControlOutcome::Unsupported,
            }
        }
    }

    /// Byte-source cache state, served from engine state.
    pub fn cache_info(&self) -> Option<SourceCacheInfo> {
        match self.control(ControlCommand::CacheInfo) {
            ControlOutcome::CacheInfo(info) => Some(info),
            _ => None,
        }
    }

    /// Source size in bytes, served from engine state.
    pub fn source_size(&self) -> Option<u64> {
        match self.control(ControlCommand::SourceSize) {
            ControlOutcome::SourceSize(size) => Some(size),
            _ => None,
        }
    }

    /// Base filename of the source, served from engine state.
    pub fn base_filename(&self) -> Option<String> {
        match self.control(ControlCommand::BaseFilename) {
            ControlOutcome::BaseFilename(name) => Some(name),
            _ => None,
        }
    }

    /// Per-kind bitrate estimates of the selected streams.
    pub fn bitrate_stats(&self) -> BitrateStats {
        match self.control(ControlCommand::BitrateStats) {
            ControlOutcome::Bitrates(rates) => rates,
            _ => BitrateStats::default(),
        }
    }

    /// Buffering snapshot.
    pub fn reader_state(&self) -> ReaderState {
        match self.control(ControlCommand::ReaderState) {
            ControlOutcome::ReaderState(state) => state,
            _ => ReaderState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::add_stream_locked;
    use crate::stream::StreamHeader;
    use dmx_common::{Packet, StreamKind};

    fn feed(state: &mut State, stream: usize, pts: f64, keyframe: bool) {
        let mut p = Packet::new(vec![0u8; 64]);
        p.pts = Some(TimeCode::from_secs(pts));
        p.dts = Some(TimeCode::from_secs(pts));
        p.keyframe = keyframe;
        p.stream = stream;
        state.streams[stream].q.append(p, false);
    }

    #[test]
    fn reader_state_reports_buffered_range() {
        let shared = crate::test_support::shared_for_tests();
        let mut state = shared.state.lock();
        state.seekable_cache = true;
        let v = add_stream_locked(&mut state, StreamHeader::new(StreamKind::Video));
        state.streams[v.0].q.selected = true;
        state.streams[v.0].q.active = true;

        for i in 0..10 {
            feed(&mut state, v.0, i as f64, i % 2 == 0);
        }

        let r = reader_state_locked(&state);
        let (start, end) = r.seek_range.expect("buffered range");
        assert_eq!(start, TimeCode::from_secs(0.0));
        assert_eq!(end, TimeCode::from_secs(9.0));
        assert!(!r.eof);
        assert!(!r.underrun, "forward data buffered");
    }

    #[test]
    fn reader_state_no_range_without_back_pts() {
        let shared = crate::test_support::shared_for_tests();
        let mut state = shared.state.lock();
        state.seekable_cache = true;
        let v = add_stream_locked(&mut state, StreamHeader::new(StreamKind::Video));
        state.streams[v.0].q.selected = true;
        state.streams[v.0].q.active = true;

        // no keyframe anywhere: back_pts stays unset
        feed(&mut state, v.0, 0.0, false);
        feed(&mut state, v.0, 1.0, false);

        let r = reader_state_locked(&state);
        assert_eq!(r.seek_range, None);
    }

    #[test]
    fn reader_state_underrun_when_active_and_dry() {
        let shared = crate::test_support::shared_for_tests();
        let mut state = shared.state.lock();
        state.idle = false;
        let v = add_stream_locked(&mut state, StreamHeader::new(StreamKind::Video));
        state.streams[v.0].q.selected = true;
        state.streams[v.0].q.active = true;
        feed(&mut state, v.0, 0.0, true);
        while state.streams[v.0].q.take_next().is_some() {}

        let r = reader_state_locked(&state);
        assert!(r.underrun);
        assert!(!r.idle);
    }

    #[test]
    fn reader_state_applies_ts_offset() {
        let shared = crate::test_support::shared_for_tests();
        let mut state = shared.state.lock();
        state.seekable_cache = true;
        state.ts_offset = 100.0;
        let v = add_stream_locked(&mut state, StreamHeader::new(StreamKind::Video));
        state.streams[v.0].q.selected = true;
        state.streams[v.0].q.active = true;
        for i in 0..4 {
            feed(&mut state, v.0, i as f64, true);
        }

        let r = reader_state_locked(&state);
        let (start, end) = r.seek_range.unwrap();
        assert_eq!(start, TimeCode::from_secs(100.0));
        assert_eq!(end, TimeCode::from_secs(103.0));
    }

    #[test]
    fn bitrate_stats_sum_selected_streams() {
        let shared = crate::test_support::shared_for_tests();
        let mut state = shared.state.lock();
        let a = add_stream_locked(&mut state, StreamHeader::new(StreamKind::Audio));
        let b = add_stream_locked(&mut state, StreamHeader::new(StreamKind::Audio));
        let v = add_stream_locked(&mut state, StreamHeader::new(StreamKind::Video));
        state.streams[a.0].q.selected = true;
        state.streams[a.0].q.bitrate = Some(1000.0);
        state.streams[b.0].q.selected = true;
        state.streams[b.0].q.bitrate = Some(500.0);
        state.streams[v.0].q.bitrate = Some(9000.0); // unselected: ignored

        let out = cached_control(&mut state, ControlCommand::BitrateStats).unwrap();
        let ControlOutcome::Bitrates(rates) = out else {
            panic!("wrong outcome")
        };
        assert_eq!(rates.audio, Some(1500.0));
        assert_eq!(rates.video, None);
    }

    #[test]
    fn cached_queries_without_data_are_unsupported() {
        let shared = crate::test_support::shared_for_tests();
        let mut state = shared.state.lock();
        assert_eq!(
            cached_control(&mut state, ControlCommand::CacheInfo),
            Some(ControlOutcome::Unsupported)
        );
        assert_eq!(
            cached_control(&mut state, ControlCommand::SourceSize),
            Some(ControlOutcome::Unsupported)
        );
        assert_eq!(
            cached_control(&mut state, ControlCommand::Driver(DriverCtrl::SwitchedTracks)),
            None,
            "driver commands fall through to marshalling"
        );
    }
}
