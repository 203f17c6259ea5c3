//! `dmx-engine` — Threaded demultiplexer buffering layer.
//!
//! Sits between a format-parsing driver (the producer) and per-stream
//! decoders (the consumer), decoupling blocking container I/O from
//! real-time decoding:
//!
//! ```text
//! FormatDriver ──► ReaderLoop ──► StreamQueue (per stream) ──► Demux::read
//!      ▲                │
//!      └── seek/switch ─┘   (control flow via engine flags + condvar)
//! ```
//!
//! - per-stream packet queues with configurable read-ahead and back-buffer
//! - background reader thread issuing fills, seeks and track switches
//! - keyframe-bounded back-buffer eviction
//! - cached seeking inside the buffered range
//! - mid-stream track enabling via monotonicity-filtered refresh seeks
//!
//! Open a source with [`Demux::open_source`] (driver probing) or
//! [`Demux::open_with`], then call [`Demux::start`] to spawn the reader
//! thread. Without `start` the engine runs synchronously, pumping the
//! driver from the consumer's own calls.

mod consumer;
mod control;
mod driver;
mod engine;
mod producer;
mod prune;
mod queue;
mod reader;
mod seek;
mod stream;

pub use consumer::ReadResult;
pub use control::{BitrateStats, ControlCommand, ControlOutcome, ReaderState};
pub use driver::{
    ByteSource, CheckLevel, ControlStatus, DriverCtrl, DriverDesc, FillStatus, FormatDriver,
    SeekFlags, SourceCacheInfo,
};
pub use engine::{Demux, Events, ViewState, WakeupFn};
pub use producer::ProducerContext;
pub use stream::{CodecDesc, QueueStats, StreamHeader, StreamId, StreamInfo};

// Re-export the shared value types so driver implementations only need this
// crate.
pub use dmx_common::{
    Attachment, Chapter, DemuxError, DemuxOptions, DemuxResult, Edition, Packet, Segment,
    StreamKind, TagMap, TimeCode,
};
