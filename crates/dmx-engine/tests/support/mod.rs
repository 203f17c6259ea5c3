//! Test fixtures: a scripted format driver and an in-memory byte source.
//!
//! `ScriptDriver` plays back a fixed schedule of packets, one per
//! `fill_buffer` call, and records every seek it is asked to perform.
//! That makes scheduler decisions (refresh seeks, cached seeks, overflow
//! stops) directly observable from tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dmx_engine::{
    ByteSource, CheckLevel, ControlStatus, Demux, DemuxError, DemuxOptions, DemuxResult,
    DriverCtrl, FillStatus, FormatDriver, Packet, ProducerContext, SeekFlags, StreamHeader,
    StreamId, StreamKind, TagMap, TimeCode,
};

/// One scheduled packet.
#[derive(Clone, Debug)]
pub struct ScriptItem {
    pub stream: usize,
    pub pts: f64,
    pub keyframe: bool,
    pub size: usize,
}

pub fn item(stream: usize, pts: f64, keyframe: bool, size: usize) -> ScriptItem {
    ScriptItem {
        stream,
        pts,
        keyframe,
        size,
    }
}

/// A recorded driver seek.
#[derive(Clone, Debug, PartialEq)]
pub struct SeekRecord {
    pub pts: f64,
    pub hr: bool,
    pub forward: bool,
    pub factor: bool,
}

/// Rendezvous used to hold the driver inside a seek call while the test
/// thread interleaves other work.
pub struct SeekHold {
    pub started: Sender<()>,
    pub release: Receiver<()>,
}

#[derive(Default)]
pub struct ScriptSpec {
    pub streams: Vec<StreamKind>,
    pub items: Vec<ScriptItem>,
    pub duration: f64,
    /// Driver refuses to implement seeking.
    pub unseekable_driver: bool,
    /// `fill_buffer` past the script end keeps returning progress without
    /// packets instead of EOF (simulates a stalled live source).
    pub spin_at_end: bool,
    /// Container metadata set at open time.
    pub metadata: Vec<(&'static str, &'static str)>,
    /// Chapters (title, pts) added at open time, in the given order.
    pub chapters: Vec<(&'static str, f64)>,
    /// Stream tags staged during the first `fill_buffer` call.
    pub tag_update_on_first_fill: Option<(usize, &'static str, &'static str)>,
    /// Emit a closed-caption packet alongside every item of stream 0.
    pub captions_from_stream0: bool,
    /// Park inside the next seek call until released.
    pub hold_next_seek: Option<SeekHold>,
}

/// Shared observation points for a running `ScriptDriver`.
#[derive(Clone, Default)]
pub struct DriverProbe {
    pub seeks: Arc<Mutex<Vec<SeekRecord>>>,
    pub fills: Arc<AtomicUsize>,
    pub switches: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

impl DriverProbe {
    pub fn seeks(&self) -> Vec<SeekRecord> {
        self.seeks.lock().unwrap().clone()
    }
}

pub struct ScriptDriver {
    spec: ScriptSpec,
    probe: DriverProbe,
    /// Byte offset per item, assigned in schedule order.
    positions: Vec<u64>,
    ids: Vec<StreamId>,
    cursor: usize,
    first_fill_done: bool,
}

impl ScriptDriver {
    pub fn new(spec: ScriptSpec, probe: DriverProbe) -> Self {
        let mut positions = Vec::with_capacity(spec.items.len());
        let mut pos = 0u64;
        for it in &spec.items {
            positions.push(pos);
            pos += it.size as u64;
        }
        Self {
            spec,
            probe,
            positions,
            ids: Vec::new(),
            cursor: 0,
            first_fill_done: false,
        }
    }

    fn packet_at(&self, index: usize) -> Packet {
        let it = &self.spec.items[index];
        let mut p = Packet::new(vec![0u8; it.size]);
        p.pts = Some(TimeCode::from_secs(it.pts));
        p.dts = Some(TimeCode::from_secs(it.pts));
        p.pos = Some(self.positions[index]);
        p.keyframe = it.keyframe;
        p
    }
}

impl FormatDriver for ScriptDriver {
    fn name(&self) -> &'static str {
        "script"
    }

    fn open(&mut self, ctx: &mut ProducerContext<'_>, _check: CheckLevel) -> DemuxResult<()> {
        for kind in self.spec.streams.clone() {
            let id = ctx.register_stream(StreamHeader::new(kind));
            self.ids.push(id);
        }
        ctx.view_mut().filetype = Some("script".into());
        if self.spec.duration > 0.0 {
            ctx.view_mut().duration = Some(TimeCode::from_secs(self.spec.duration));
        }
        for (k, v) in &self.spec.metadata {
            ctx.view_mut().metadata.set(*k, *v);
        }
        for (i, (title, pts)) in self.spec.chapters.clone().into_iter().enumerate() {
            ctx.add_chapter(title, TimeCode::from_secs(pts), i as u64);
        }
        Ok(())
    }

    fn fill_buffer(&mut self, ctx: &mut ProducerContext<'_>) -> FillStatus {
        self.probe.fills.fetch_add(1, Ordering::Relaxed);

        if !self.first_fill_done {
            self.first_fill_done = true;
            if let Some((stream, key, value)) = self.spec.tag_update_on_first_fill {
                let mut tags = TagMap::new();
                tags.set(key, value);
                ctx.set_stream_tags(self.ids[stream], tags);
            }
        }

        if self.cursor >= self.spec.items.len() {
            if self.spec.spin_at_end {
                std::thread::sleep(Duration::from_millis(1));
                return FillStatus::Progress;
            }
            return FillStatus::Eof;
        }

        let index = self.cursor;
        self.cursor += 1;
        let pkt = self.packet_at(index);
        let stream = self.spec.items[index].stream;
        if self.spec.captions_from_stream0 && stream == 0 {
            let mut caption = Packet::new(vec![0xcc; 4]);
            caption.pts = pkt.pts;
            caption.dts = pkt.dts;
            caption.keyframe = true;
            ctx.submit_caption(self.ids[0], caption);
        }
        ctx.submit_packet(self.ids[stream], pkt);
        FillStatus::Progress
    }

    fn can_seek(&self) -> bool {
        !self.spec.unseekable_driver
    }

    fn seek(&mut self, _ctx: &mut ProducerContext<'_>, pts: TimeCode, flags: SeekFlags) {
        self.probe.seeks.lock().unwrap().push(SeekRecord {
            pts: pts.as_secs(),
            hr: flags.hr,
            forward: flags.forward,
            factor: flags.factor,
        });

        if let Some(hold) = self.spec.hold_next_seek.take() {
            hold.started.send(()).unwrap();
            hold.release.recv().unwrap();
        }

        if flags.factor {
            self.cursor = 0;
            return;
        }

        let t = pts.as_secs();
        self.cursor = if flags.hr {
            // precise: replay from the exact position
            self.spec
                .items
                .iter()
                .position(|it| it.pts >= t - 1e-9)
                .unwrap_or(self.spec.items.len())
        } else {
            // keyframe seek: land on the last stream-0 keyframe at or
            // before the target
            self.spec
                .items
                .iter()
                .rposition(|it| it.stream == 0 && it.keyframe && it.pts <= t + 1e-9)
                .unwrap_or(0)
        };
    }

    fn control(&mut self, _ctx: &mut ProducerContext<'_>, ctrl: DriverCtrl) -> ControlStatus {
        match ctrl {
            DriverCtrl::SwitchedTracks => {
                self.probe.switches.fetch_add(1, Ordering::Relaxed);
                ControlStatus::Ok
            }
        }
    }

    fn close(&mut self) {
        self.probe.closed.store(true, Ordering::Relaxed);
    }
}

/// A driver that rejects every probe.
pub struct RejectDriver;

impl FormatDriver for RejectDriver {
    fn name(&self) -> &'static str {
        "reject"
    }

    fn open(&mut self, _ctx: &mut ProducerContext<'_>, _check: CheckLevel) -> DemuxResult<()> {
        Err(DemuxError::UnrecognizedFormat)
    }

    fn fill_buffer(&mut self, _ctx: &mut ProducerContext<'_>) -> FillStatus {
        FillStatus::Eof
    }
}

/// A driver whose probe only succeeds at `Unsafe` level or below.
pub struct WeakProbeDriver;

impl FormatDriver for WeakProbeDriver {
    fn name(&self) -> &'static str {
        "weak"
    }

    fn open(&mut self, ctx: &mut ProducerContext<'_>, check: CheckLevel) -> DemuxResult<()> {
        if check == CheckLevel::Normal {
            return Err(DemuxError::UnrecognizedFormat);
        }
        ctx.register_stream(StreamHeader::new(StreamKind::Audio));
        ctx.view_mut().filetype = Some("weak".into());
        Ok(())
    }

    fn fill_buffer(&mut self, _ctx: &mut ProducerContext<'_>) -> FillStatus {
        FillStatus::Eof
    }
}

/// In-memory byte source with observable read-ahead hints.
pub struct MemorySource {
    pub seekable: bool,
    pub network: bool,
    pub size: Option<u64>,
    pub cancelled: AtomicBool,
    pub base: Option<String>,
    pub readahead_hints: Mutex<Vec<bool>>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seekable: true,
            network: false,
            size: Some(1 << 20),
            cancelled: AtomicBool::new(false),
            base: Some("clip.mkv".into()),
            readahead_hints: Mutex::new(Vec::new()),
        })
    }

    pub fn unseekable() -> Arc<Self> {
        Arc::new(Self {
            seekable: false,
            network: false,
            size: None,
            cancelled: AtomicBool::new(false),
            base: None,
            readahead_hints: Mutex::new(Vec::new()),
        })
    }
}

impl ByteSource for MemorySource {
    fn seekable(&self) -> bool {
        self.seekable
    }

    fn is_network(&self) -> bool {
        self.network
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn base_filename(&self) -> Option<String> {
        self.base.clone()
    }

    fn set_readahead(&self, enabled: bool) {
        self.readahead_hints.lock().unwrap().push(enabled);
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Open a scripted engine. Streams are registered in `spec.streams` order,
/// so `StreamId(n)` matches index `n`.
pub fn open_script(spec: ScriptSpec, opts: &DemuxOptions) -> (Demux, DriverProbe, Arc<MemorySource>) {
    open_script_with_source(spec, opts, MemorySource::new())
}

pub fn open_script_with_source(
    spec: ScriptSpec,
    opts: &DemuxOptions,
    source: Arc<MemorySource>,
) -> (Demux, DriverProbe, Arc<MemorySource>) {
    let probe = DriverProbe::default();
    let driver = Box::new(ScriptDriver::new(spec, probe.clone()));
    let demux = Demux::open_with(driver, source.clone(), opts, CheckLevel::Force)
        .expect("script driver always opens");
    (demux, probe, source)
}

/// Interleaved video/audio schedule: video every `v_step` seconds with a
/// keyframe every `v_kf_every` packets, audio every `a_step` seconds.
pub fn av_schedule(secs: f64, v_step: f64, v_kf_every: usize, a_step: f64, size: usize) -> Vec<ScriptItem> {
    let mut items = Vec::new();
    let mut vt = 0.0;
    let mut vi = 0usize;
    let mut at = 0.0;
    while vt <= secs || at <= secs {
        if vt <= at && vt <= secs {
            items.push(item(0, vt, vi % v_kf_every == 0, size));
            vt += v_step;
            vi += 1;
        } else if at <= secs {
            items.push(item(1, at, true, size));
            at += a_step;
        } else {
            break;
        }
    }
    items
}

/// Poll `cond` until it holds or `timeout` elapses. Returns whether it held.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Wait until the reader is idle and all queue stats stop changing.
pub fn wait_settled(demux: &Demux, streams: &[StreamId]) -> bool {
    wait_until(Duration::from_secs(2), || {
        if !demux.reader_state().idle {
            return false;
        }
        let before: Vec<_> = streams.iter().map(|&s| demux.queue_stats(s)).collect();
        std::thread::sleep(Duration::from_millis(30));
        let after: Vec<_> = streams.iter().map(|&s| demux.queue_stats(s)).collect();
        before == after && demux.reader_state().idle
    })
}
