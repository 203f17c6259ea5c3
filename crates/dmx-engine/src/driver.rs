//! Contracts between the engine and its collaborators: the format driver
//! (producer) and the byte source it reads from.
//!
//! The engine never parses containers itself. A [`FormatDriver`] owns the
//! parsing and publishes streams and packets through the
//! [`ProducerContext`](crate::producer::ProducerContext) handed to each call.
//! All driver calls happen with the engine lock released, on the reader
//! thread once it is running, or on the caller's thread in synchronous mode.

use dmx_common::{DemuxResult, TagMap, TimeCode};

use crate::producer::ProducerContext;

/// Probing intensity for [`FormatDriver::open`].
///
/// `Normal` probes must only accept content they positively identify.
/// `Unsafe` allows weak heuristics, `Request` is used when the caller asked
/// for this driver by name, and `Force` skips content checks entirely.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckLevel {
    Force,
    Unsafe,
    Request,
    Normal,
}

impl CheckLevel {
    pub fn name(self) -> &'static str {
        match self {
            Self::Force => "force",
            Self::Unsafe => "unsafe",
            Self::Request => "request",
            Self::Normal => "normal",
        }
    }
}

/// Modifiers for a seek request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeekFlags {
    /// Precise seek: the driver should not snap to keyframes, the caller
    /// will discard leading frames itself.
    pub hr: bool,
    /// Never land before the requested target.
    pub forward: bool,
    /// Interpret the seek value as a 0..1 fraction of the whole stream.
    pub factor: bool,
}

impl SeekFlags {
    pub const HR: SeekFlags = SeekFlags {
        hr: true,
        forward: false,
        factor: false,
    };
}

/// Result of a [`FormatDriver::fill_buffer`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FillStatus {
    /// At least one packet (or other progress) was produced.
    Progress,
    /// Nothing more to read, or the read failed. The engine treats both as
    /// end of stream.
    Eof,
}

/// Result of a driver control call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlStatus {
    Ok,
    Unsupported,
    Unknown,
    Error,
}

/// Out-of-band notifications the engine sends to the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverCtrl {
    /// The set of selected tracks changed; the driver may adjust which
    /// streams it bothers to parse.
    SwitchedTracks,
}

/// Snapshot of a byte source's cache state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceCacheInfo {
    /// Total cache capacity in bytes.
    pub size: u64,
    /// Bytes currently buffered.
    pub fill: u64,
    /// Whether the cache reader is idle.
    pub idle: bool,
    /// Recent fill speed in bytes per second.
    pub speed: u64,
}

/// The byte stream a format driver reads from.
///
/// Reading and byte-level seeking happen inside the driver; the engine only
/// needs the introspection surface below, which must be callable from any
/// thread.
pub trait ByteSource: Send + Sync {
    /// Whether byte-level seeking is supported.
    fn seekable(&self) -> bool {
        false
    }

    /// Whether the source is network-backed (enables the larger read-ahead).
    fn is_network(&self) -> bool {
        false
    }

    /// Total size in bytes, if known.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Cache state, if the source maintains a cache.
    fn cache_info(&self) -> Option<SourceCacheInfo> {
        None
    }

    /// Source-level metadata (e.g. ICY tags on a radio stream).
    fn metadata(&self) -> Option<TagMap> {
        None
    }

    /// Name of the underlying file, without transport decoration.
    fn base_filename(&self) -> Option<String> {
        None
    }

    /// Hint whether any track is selected, so the source can stop
    /// read-ahead when nothing consumes it.
    fn set_readahead(&self, _enabled: bool) {}

    /// Cooperative cancel token. When this trips, the reader stops calling
    /// `fill_buffer` and converges to EOF.
    fn cancelled(&self) -> bool {
        false
    }
}

/// A container format driver (the producer side of the engine).
pub trait FormatDriver: Send {
    /// Short identifier used for forced-format lookup and logging.
    fn name(&self) -> &'static str;

    /// Probe the source and, on success, register streams and publish
    /// container info through `ctx`. Return
    /// [`DemuxError::UnrecognizedFormat`](dmx_common::DemuxError) to let
    /// probing continue with the next driver.
    fn open(&mut self, ctx: &mut ProducerContext<'_>, check: CheckLevel) -> DemuxResult<()>;

    /// Read ahead and submit whatever packets are available.
    fn fill_buffer(&mut self, ctx: &mut ProducerContext<'_>) -> FillStatus;

    /// Whether this driver implements [`seek`](Self::seek).
    fn can_seek(&self) -> bool {
        false
    }

    /// Reposition the parser. `factor` seeks interpret `pts` as a fraction.
    fn seek(&mut self, _ctx: &mut ProducerContext<'_>, _pts: TimeCode, _flags: SeekFlags) {}

    /// Handle an engine notification.
    fn control(&mut self, _ctx: &mut ProducerContext<'_>, _ctrl: DriverCtrl) -> ControlStatus {
        ControlStatus::Unknown
    }

    /// Release driver resources. Called once, after the reader thread has
    /// been joined.
    fn close(&mut self) {}
}

/// Registry entry for driver probing.
#[derive(Copy, Clone)]
pub struct DriverDesc {
    pub name: &'static str,
    pub description: &'static str,
    pub create: fn() -> Box<dyn FormatDriver>,
}

impl std::fmt::Debug for DriverDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverDesc")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}
