//! Container-level metadata: chapters, editions, attachments.

use crate::tags::TagMap;
use crate::types::TimeCode;

/// A chapter mark.
#[derive(Clone, Debug)]
pub struct Chapter {
    /// Chapter start time.
    pub pts: TimeCode,
    /// Chapter metadata; the title lives under the `TITLE` key.
    pub metadata: TagMap,
    /// Container-assigned chapter id.
    pub demuxer_id: u64,
    /// Position in the order the driver added chapters. Sort tiebreak.
    pub original_index: usize,
}

impl Chapter {
    pub fn new(title: &str, pts: TimeCode, demuxer_id: u64, original_index: usize) -> Self {
        let mut metadata = TagMap::new();
        metadata.set("TITLE", title);
        Self {
            pts,
            metadata,
            demuxer_id,
            original_index,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get("TITLE")
    }
}

/// Sort chapters by start time; ties keep the driver's original order.
pub fn sort_chapters(chapters: &mut [Chapter]) {
    chapters.sort_by(|a, b| {
        a.pts
            .partial_cmp(&b.pts)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.original_index.cmp(&b.original_index))
    });
}

/// A selectable edition (Matroska-style alternate timeline).
#[derive(Clone, Debug)]
pub struct Edition {
    pub demuxer_id: u64,
    pub default: bool,
    pub metadata: TagMap,
}

/// A file attached to the container (fonts, cover art blobs, ...).
#[derive(Clone, Debug)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}
