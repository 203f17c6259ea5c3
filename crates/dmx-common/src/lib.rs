//! `dmx-common` — Shared types, options, and errors for the dmx engine.
//!
//! This crate is the foundation the engine crate depends on. It defines:
//!
//! - **Types**: `TimeCode`, `StreamKind`, and the unset-timestamp helpers
//! - **Packets**: `Packet`, `Segment` (data flow between driver and consumer)
//! - **Tags**: `TagMap` (ordered, case-insensitive metadata)
//! - **Metadata**: `Chapter`, `Edition`, `Attachment`
//! - **Options**: `DemuxOptions` (buffering and seeking knobs)
//! - **Errors**: `DemuxError` (thiserror-based)

pub mod error;
pub mod meta;
pub mod options;
pub mod packet;
pub mod tags;
pub mod types;

// Re-export commonly used items at crate root
pub use error::{DemuxError, DemuxResult};
pub use meta::{sort_chapters, Attachment, Chapter, Edition};
pub use options::DemuxOptions;
pub use packet::{Packet, Segment};
pub use tags::TagMap;
pub use types::{ts_add, ts_max, ts_min, StreamKind, TimeCode};
