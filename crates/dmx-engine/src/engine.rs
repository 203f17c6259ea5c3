//! Engine state and lifecycle.
//!
//! One mutex and one condition variable serialize everything: every stream
//! queue, the scheduler flags the reader thread dispatches on, and the
//! shadow snapshot that ferries container info between the producer and
//! consumer threads. Driver I/O is the only long-running work and always
//! happens with the lock released.
//!
//! ```text
//! Consumer thread                Reader thread
//! ┌────────────────┐   condvar   ┌──────────────────┐
//! │ read/seek/     │◄───────────►│ fill_buffer/seek │
//! │ select/control │    +lock    │ on the driver    │
//! └───────┬────────┘             └────────┬─────────┘
//!         │ pull_updates                  │ changed()
//!         ▼                               ▼
//!   consumer view  ◄── shadow ◄── producer view
//! ```
//!
//! The three views are one record type with distinct mutation rights: the
//! producer view belongs to whichever thread is running the driver, the
//! consumer view to the consumer thread. The shadow is the only one under
//! the lock and shuttles deltas between them, gated by event flags.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use dmx_common::{
    Attachment, Chapter, DemuxError, DemuxOptions, DemuxResult, Edition, TagMap, TimeCode,
};

use crate::control::ControlOutcome;
use crate::driver::{
    ByteSource, CheckLevel, DriverDesc, FormatDriver, SeekFlags, SourceCacheInfo,
};
use crate::producer::{self, ProducerContext};
use crate::reader;
use crate::stream::{StreamId, StreamInfo, StreamState};

/// Change notification bits, published by the producer and drained by the
/// consumer with [`Demux::pull_updates`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Events(u32);

impl Events {
    pub const NONE: Events = Events(0);
    /// Container-level info changed (chapters, duration, seekability, ...).
    pub const INIT: Events = Events(1);
    /// The stream table grew.
    pub const STREAMS: Events = Events(1 << 1);
    /// Global or per-stream metadata changed.
    pub const METADATA: Events = Events(1 << 2);
    pub const ALL: Events = Events(0b111);

    pub fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Events {
    type Output = Events;
    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

/// Container-level state as seen by one side of the engine.
///
/// The producer mutates its own instance freely during driver calls and
/// publishes with [`ProducerContext::changed`]; `copy_from` then moves the
/// flagged field groups across the shadow to the consumer instance.
#[derive(Clone, Debug, Default)]
pub struct ViewState {
    pub(crate) events: Events,

    // -- INIT group --
    pub chapters: Vec<Chapter>,
    pub editions: Vec<Edition>,
    pub current_edition: usize,
    pub attachments: Vec<Attachment>,
    pub seekable: bool,
    pub partially_seekable: bool,
    pub filetype: Option<String>,
    pub ts_resets_possible: bool,
    pub fully_read: bool,
    pub is_network: bool,
    /// Whether the driver may load referenced external media.
    pub access_references: bool,
    pub start_time: Option<TimeCode>,
    pub duration: Option<TimeCode>,

    // -- METADATA group --
    pub metadata: TagMap,
    /// Staged per-stream tag replacements, indexed by stream.
    pub(crate) stream_tags: Vec<Option<TagMap>>,
}

impl ViewState {
    /// Field-selective copy gated by `src`'s pending events. Drains the
    /// pending events of `src` into `self`.
    pub(crate) fn copy_from(&mut self, src: &mut ViewState) {
        if src.events.contains(Events::INIT) {
            self.chapters = src.chapters.clone();
            self.editions = src.editions.clone();
            self.current_edition = src.current_edition;
            self.attachments = src.attachments.clone();
            self.seekable = src.seekable;
            self.partially_seekable = src.partially_seekable;
            self.filetype = src.filetype.clone();
            self.ts_resets_possible = src.ts_resets_possible;
            self.fully_read = src.fully_read;
            self.is_network = src.is_network;
            self.access_references = src.access_references;
            self.start_time = src.start_time;
            self.duration = src.duration;
        }

        if src.events.contains(Events::METADATA) {
            self.metadata = src.metadata.clone();
            if self.stream_tags.len() < src.stream_tags.len() {
                self.stream_tags.resize(src.stream_tags.len(), None);
            }
            for (dst, staged) in self.stream_tags.iter_mut().zip(src.stream_tags.iter_mut()) {
                if let Some(tags) = staged.take() {
                    *dst = Some(tags);
                }
            }
        }

        self.events |= src.events;
        src.events = Events::NONE;
    }
}

/// Byte-source state cached so consumer queries never block on I/O.
#[derive(Default)]
pub(crate) struct SourceCache {
    pub size: Option<u64>,
    pub info: Option<SourceCacheInfo>,
    pub metadata: Option<TagMap>,
    pub base_filename: Option<String>,
}

/// Consumer wakeup callback. Invoked with the engine lock held, so it must
/// only signal (set a flag, wake an event loop), never call back in.
pub type WakeupFn = Arc<dyn Fn() + Send + Sync>;

pub(crate) type RunJob = Box<dyn FnOnce(&mut DriverHost, &Arc<Shared>) -> ControlOutcome + Send>;

/// Everything the engine mutex guards.
pub(crate) struct State {
    pub streams: Vec<StreamState>,
    pub shadow: ViewState,
    /// Engine-raised events (stream registration) merged into the consumer
    /// events on the next pull.
    pub events: Events,

    pub threading: bool,
    pub thread_terminate: bool,

    pub seeking: bool,
    pub seek_flags: SeekFlags,
    pub seek_pts: Option<TimeCode>,
    pub tracks_switched: bool,
    /// Still at the start of the file; lets track switches skip the
    /// refresh seek that would only reproduce buggy driver seeking.
    pub initial_state: bool,
    pub autoselect: bool,

    pub eof: bool,
    pub last_eof: bool,
    pub idle: bool,
    pub warned_queue_overflow: bool,

    pub ts_offset: f64,
    /// Assumed player position, for refresh seeks after track switches.
    pub ref_pts: Option<TimeCode>,

    pub min_secs: f64,
    pub max_bytes: usize,
    pub max_bytes_bw: usize,
    pub seekable_cache: bool,

    pub force_cache_update: bool,
    pub cache: SourceCache,

    /// One-shot work the consumer marshals onto the reader thread.
    pub run_job: Option<RunJob>,
    pub run_result: Option<ControlOutcome>,

    pub wakeup: Option<WakeupFn>,
    /// Highest packet byte position handed to the consumer.
    pub user_filepos: Option<u64>,

    // Mirrors of producer-view facts the reader needs while holding only
    // the engine lock.
    pub seekable: bool,
    pub partially_seekable: bool,
    pub driver_can_seek: bool,
}

impl State {
    pub(crate) fn new(opts: &DemuxOptions) -> Self {
        Self {
            streams: Vec::new(),
            shadow: ViewState::default(),
            events: Events::NONE,
            threading: false,
            thread_terminate: false,
            seeking: false,
            seek_flags: SeekFlags::default(),
            seek_pts: None,
            tracks_switched: false,
            initial_state: true,
            autoselect: false,
            eof: false,
            last_eof: false,
            idle: true,
            warned_queue_overflow: false,
            ts_offset: 0.0,
            ref_pts: None,
            min_secs: opts.readahead_secs,
            max_bytes: opts.max_bytes,
            max_bytes_bw: opts.max_bytes_bw,
            seekable_cache: opts.seekable_cache,
            force_cache_update: false,
            cache: SourceCache::default(),
            run_job: None,
            run_result: None,
            wakeup: None,
            user_filepos: None,
            seekable: false,
            partially_seekable: false,
            driver_can_seek: false,
        }
    }
}

/// Fire the consumer wakeup callback. Called with the lock held; the
/// callback must not reenter the engine.
pub(crate) fn fire_wakeup(state: &State) {
    if let Some(cb) = &state.wakeup {
        cb();
    }
}

/// Reset the consumer-facing half of every queue (cursors, bitrate
/// anchors); queued packets stay.
pub(crate) fn clear_reader_state(state: &mut State) {
    for st in &mut state.streams {
        st.q.clear_reader_state();
    }
    state.warned_queue_overflow = false;
    state.user_filepos = None;
}

/// Drop all buffered packets and reset per-stream demux state.
pub(crate) fn clear_demux_state(state: &mut State) {
    clear_reader_state(state);
    for st in &mut state.streams {
        st.q.clear_demux_state();
    }
    state.eof = false;
    state.last_eof = false;
    state.idle = true;
}

/// The format driver plus the state only its thread may touch.
pub(crate) struct DriverHost {
    pub driver: Box<dyn FormatDriver>,
    pub view: ViewState,
    pub source: Arc<dyn ByteSource>,
}

impl DriverHost {
    /// Borrow the driver and a producer context over the remaining parts.
    pub fn split(&mut self, shared: &Arc<Shared>) -> (&mut dyn FormatDriver, ProducerContext<'_>) {
        let DriverHost {
            driver,
            view,
            source,
        } = self;
        (
            driver.as_mut(),
            ProducerContext::new(shared.clone(), view, source.clone()),
        )
    }
}

/// Shared engine core.
///
/// Lock order: `host` before `state`. The host lock is only ever taken by
/// the thread currently playing producer (the reader thread, or the
/// consumer in synchronous mode), so it is effectively uncontended.
pub(crate) struct Shared {
    pub state: Mutex<State>,
    pub cond: Condvar,
    pub host: Mutex<Option<DriverHost>>,
}

/// Consumer handle to a running demultiplexer.
///
/// There is exactly one consumer. Packets are pulled per stream with
/// [`read`](Demux::read) / [`try_read`](Demux::try_read); container info is
/// refreshed with [`pull_updates`](Demux::pull_updates) and then read from
/// the accessor methods without locking.
pub struct Demux {
    pub(crate) shared: Arc<Shared>,
    pub(crate) view: ViewState,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Demux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demux").finish_non_exhaustive()
    }
}

impl Demux {
    /// Open `source` with a specific driver at the given probe level.
    ///
    /// The engine starts in synchronous mode; call [`start`](Demux::start)
    /// to spawn the reader thread.
    pub fn open_with(
        driver: Box<dyn FormatDriver>,
        source: Arc<dyn ByteSource>,
        opts: &DemuxOptions,
        check: CheckLevel,
    ) -> DemuxResult<Demux> {
        if source.cancelled() {
            return Err(DemuxError::Cancelled);
        }

        debug!(
            driver = driver.name(),
            level = check.name(),
            "trying demuxer"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(State::new(opts)),
            cond: Condvar::new(),
            host: Mutex::new(None),
        });

        let mut host = DriverHost {
            driver,
            view: ViewState {
                seekable: source.seekable(),
                is_network: source.is_network(),
                access_references: opts.access_references,
                ..ViewState::default()
            },
            source: Arc::clone(&source),
        };

        let opened = {
            let (driver, mut ctx) = host.split(&shared);
            driver.open(&mut ctx, check)
        };
        if let Err(err) = opened {
            host.driver.close();
            return Err(err);
        }

        if host.view.filetype.is_some() {
            info!(
                filetype = host.view.filetype.as_deref().unwrap_or(""),
                driver = host.driver.name(),
                "detected file format"
            );
        } else {
            info!(driver = host.driver.name(), "detected file format");
        }

        if !host.view.seekable {
            debug!("stream is not seekable");
            if opts.force_seekable {
                warn!("not seekable, but enabling seeking on user request");
                host.view.seekable = true;
                host.view.partially_seekable = true;
            }
        }

        {
            let mut state = shared.state.lock();
            state.seekable = host.view.seekable;
            state.partially_seekable = host.view.partially_seekable;
            state.driver_can_seek = host.driver.can_seek();
            state.cache.base_filename = source.base_filename();

            if opts.create_ccs {
                let video: Vec<StreamId> = state
                    .streams
                    .iter()
                    .filter(|s| s.info.kind == dmx_common::StreamKind::Video)
                    .map(|s| s.info.id)
                    .collect();
                for id in video {
                    producer::get_or_create_cc_locked(&mut state, id);
                }
            }
        }

        producer::publish_changed(&shared, &mut host, Events::ALL);
        *shared.host.lock() = Some(host);

        let mut demux = Demux {
            shared,
            view: ViewState::default(),
            thread: Mutex::new(None),
        };
        demux.pull_updates();

        source.set_readahead(false);

        if demux.view.is_network || source.cache_info().is_some() {
            let mut state = demux.shared.state.lock();
            state.min_secs = state.min_secs.max(opts.cache_secs);
        }

        Ok(demux)
    }

    /// Probe `source` against a driver registry.
    ///
    /// Drivers are tried in order, first at `Normal` then at `Unsafe` level.
    /// `force_format` restricts probing to one driver at `Request` level; a
    /// leading `+` raises that to `Force`.
    pub fn open_source(
        drivers: &[DriverDesc],
        source: Arc<dyn ByteSource>,
        opts: &DemuxOptions,
        force_format: Option<&str>,
    ) -> DemuxResult<Demux> {
        let mut levels: &[CheckLevel] = &[CheckLevel::Normal, CheckLevel::Unsafe];
        let mut forced: Option<&str> = None;

        if let Some(mut name) = force_format.filter(|n| !n.is_empty()) {
            levels = &[CheckLevel::Request];
            if let Some(stripped) = name.strip_prefix('+') {
                name = stripped;
                levels = &[CheckLevel::Force];
            }
            if !drivers.iter().any(|d| d.name == name) {
                return Err(DemuxError::UnknownDriver(name.to_string()));
            }
            forced = Some(name);
        }

        for &level in levels {
            debug!(level = level.name(), "trying demuxers");
            for desc in drivers {
                if forced.is_some_and(|f| f != desc.name) {
                    continue;
                }
                match Demux::open_with((desc.create)(), Arc::clone(&source), opts, level) {
                    Ok(demux) => return Ok(demux),
                    Err(DemuxError::Cancelled) => return Err(DemuxError::Cancelled),
                    Err(err) => {
                        debug!(driver = desc.name, %err, "demuxer rejected source");
                    }
                }
            }
        }
        Err(DemuxError::UnrecognizedFormat)
    }

    /// Spawn the reader thread, which reads ahead packets on its own.
    pub fn start(&self) {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if state.threading {
                return;
            }
            state.threading = true;
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("demux".into())
            .spawn(move || reader::reader_thread(shared))
        {
            Ok(handle) => *slot = Some(handle),
            Err(err) => {
                warn!(%err, "failed to spawn reader thread");
                self.shared.state.lock().threading = false;
            }
        }
    }

    /// Stop and join the reader thread, returning to synchronous mode.
    /// Safe to call from any thread; a consumer blocked in
    /// [`read`](Demux::read) observes EOF semantics.
    pub fn stop(&self) {
        let mut slot = self.thread.lock();
        let Some(handle) = slot.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            state.thread_terminate = true;
            self.shared.cond.notify_all();
        }
        let _ = handle.join();
        let mut state = self.shared.state.lock();
        state.threading = false;
        state.thread_terminate = false;
        self.shared.cond.notify_all();
    }

    /// Tear the engine down: join the reader thread and close the driver on
    /// this thread.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Some(mut host) = self.shared.host.lock().take() {
            host.driver.close();
        }
    }

    /// Drain pending producer-side changes into the consumer view.
    /// Returns the accumulated change events (read-and-clear).
    pub fn pull_updates(&mut self) -> Events {
        let threading = self.shared.state.lock().threading;
        if !threading {
            let source = self
                .shared
                .host
                .lock()
                .as_ref()
                .map(|h| Arc::clone(&h.source));
            if let Some(source) = source {
                reader::update_cache(&self.shared, source.as_ref());
            }
        }

        let mut state = self.shared.state.lock();
        let state = &mut *state;
        self.view.copy_from(&mut state.shadow);
        let events = self.view.events | state.events;
        state.events = Events::NONE;
        self.view.events = Events::NONE;

        if events.contains(Events::METADATA) {
            let n = state.streams.len().min(self.view.stream_tags.len());
            for i in 0..n {
                if let Some(tags) = self.view.stream_tags[i].take() {
                    state.streams[i].tags = tags;
                }
            }

            // Audio-only files often keep their metadata in the single
            // track's tags instead of the container metadata.
            if state.streams.len() == 1 {
                let tags = state.streams[0].tags.clone();
                self.view.metadata.merge(&tags);
            }
            if let Some(md) = &state.cache.metadata {
                self.view.metadata.merge(md);
            }
        }

        events
    }

    /// Register a callback fired when a blocked consumer could make
    /// progress: first packet after an underrun, stream/metadata changes,
    /// newly reached EOF. Invoked with the engine lock held, so it must not
    /// call back into the engine.
    pub fn set_wakeup_callback(&self, cb: Option<WakeupFn>) {
        self.shared.state.lock().wakeup = cb;
    }

    /// Select-by-default for streams registered from now on.
    pub fn set_autoselect(&self, autoselect: bool) {
        let mut state = self.shared.state.lock();
        debug_assert!(!state.threading, "autoselect is an open-time decision");
        state.autoselect = autoselect;
    }

    // -----------------------------------------------------------------
    // Consumer view accessors (valid as of the last pull_updates)
    // -----------------------------------------------------------------

    pub fn metadata(&self) -> &TagMap {
        &self.view.metadata
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.view.chapters
    }

    pub fn editions(&self) -> &[Edition] {
        &self.view.editions
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.view.attachments
    }

    pub fn duration(&self) -> Option<TimeCode> {
        self.view.duration
    }

    pub fn start_time(&self) -> Option<TimeCode> {
        self.view.start_time
    }

    pub fn seekable(&self) -> bool {
        self.view.seekable
    }

    pub fn partially_seekable(&self) -> bool {
        self.view.partially_seekable
    }

    pub fn filetype(&self) -> Option<&str> {
        self.view.filetype.as_deref()
    }

    pub fn is_network(&self) -> bool {
        self.view.is_network
    }

    // -----------------------------------------------------------------
    // Stream table introspection
    // -----------------------------------------------------------------

    pub fn stream_count(&self) -> usize {
        self.shared.state.lock().streams.len()
    }

    /// Stream description by dense index. Panics on out-of-range indices,
    /// mirroring slice indexing; indices below `stream_count()` stay valid
    /// for the life of the engine.
    pub fn stream_at(&self, index: usize) -> Arc<StreamInfo> {
        Arc::clone(&self.shared.state.lock().streams[index].info)
    }

    pub fn streams(&self) -> Vec<Arc<StreamInfo>> {
        self.shared
            .state
            .lock()
            .streams
            .iter()
            .map(|s| Arc::clone(&s.info))
            .collect()
    }

    pub fn stream_by_demuxer_id(
        &self,
        kind: dmx_common::StreamKind,
        demuxer_id: u32,
    ) -> Option<Arc<StreamInfo>> {
        self.shared
            .state
            .lock()
            .streams
            .iter()
            .find(|s| s.info.kind == kind && s.info.demuxer_id == demuxer_id)
            .map(|s| Arc::clone(&s.info))
    }

    /// Current tags of a stream (updated by pull_updates).
    pub fn stream_tags(&self, id: StreamId) -> TagMap {
        self.shared.state.lock().streams[id.0].tags.clone()
    }

    /// Buffer accounting snapshot for one stream.
    pub fn queue_stats(&self, id: StreamId) -> crate::stream::QueueStats {
        self.shared.state.lock().streams[id.0].q.stats()
    }
}

impl Drop for Demux {
    fn drop(&mut self) {
        self.shutdown();
    }
}
