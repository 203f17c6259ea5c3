//! Cached seeking — serving a seek entirely from buffered packets.
//!
//! When the target lies inside the buffered range of every active stream,
//! the engine only has to move each stream's reader cursor to a suitable
//! keyframe; the driver is never involved and nothing is re-downloaded or
//! re-parsed.

use tracing::debug;

use dmx_common::{StreamKind, TimeCode};

use crate::control::reader_state_locked;
use crate::driver::SeekFlags;
use crate::engine::{clear_reader_state, State};

/// Try to satisfy `seek(pts, flags)` from the buffer. `pts` is in engine
/// time (timestamp offset already removed). Returns false when the cached
/// path cannot serve the request and the driver has to seek.
///
/// Must be called with the engine lock held.
pub(crate) fn try_seek_cache(state: &mut State, pts: TimeCode, mut flags: SeekFlags) -> bool {
    if flags.factor || !state.seekable_cache {
        return false;
    }
    // A queued driver seek is about to invalidate every queue.
    if state.seeking {
        return false;
    }

    let snapshot = reader_state_locked(state);
    let Some((mut start, mut end)) = snapshot.seek_range else {
        return false;
    };
    // The snapshot is in consumer time; compare in engine time.
    start = start - state.ts_offset;
    end = end - state.ts_offset;
    debug!(%start, %end, target = %pts, "in-cache seek range");

    if pts < start || pts > end {
        return false;
    }

    clear_reader_state(state);

    // Align the target to a video keyframe range first: audio would
    // otherwise land closer to the request than the video can, and the
    // caller would play video without audio for the difference. Precise
    // seeks skip this, they decode-and-discard up to the exact target.
    let mut pts = pts;
    if !flags.hr {
        if let Some(video) = state
            .streams
            .iter()
            .find(|st| st.q.selected && st.info.kind == StreamKind::Video)
        {
            if let Some(target) = video.q.find_seek_target(pts, flags) {
                if let Some(target_pts) = video.q.range_pts_from(target) {
                    debug!(from = %pts, to = %target_pts, "adjust seek target");
                    pts = target_pts;
                    flags.forward = false;
                }
            }
        }
    }

    for st in &mut state.streams {
        let target = st.q.find_seek_target(pts, flags);
        st.q.set_reader(target);
        st.q.skip_to_keyframe = target.is_none();
        st.q.recompute_buffers();
        debug!(
            stream = st.info.id.0,
            kind = %st.info.kind,
            hit = target.is_some(),
            "cached seek cursor move"
        );
    }

    true
}
