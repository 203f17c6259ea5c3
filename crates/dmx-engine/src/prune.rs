//! Back-buffer eviction across streams.
//!
//! Runs after every consumer dequeue. While the summed back-buffer size is
//! over the cap, the stream holding the globally oldest evictable packet
//! gives up its oldest keyframe range. Only keyframes are viable in-buffer
//! seek entries, so the packets between them carry no seek value and go
//! with the range.

use tracing::trace;

use crate::stream::StreamState;

/// Prune back buffers until their total drops to `max_bytes_bw`.
pub(crate) fn prune_old_packets(streams: &mut [StreamState], max_bytes_bw: usize) {
    let mut buffered: usize = streams.iter().map(|s| s.q.bw_bytes).sum();
    trace!(total = buffered, "back-buffer before prune");

    while buffered > max_bytes_bw {
        // Oldest evictable packet across all streams; packets without a
        // timestamp sort earliest so they cannot pin the back buffer.
        let mut earliest: Option<(usize, Option<f64>)> = None;
        for (n, st) in streams.iter().enumerate() {
            let Some(front) = st.q.front_evictable() else {
                continue;
            };
            let ts = front.queue_ts().map(|t| t.as_secs());
            let older = match (&earliest, ts) {
                (None, _) => true,
                (Some((_, None)), _) => false,
                (Some((_, Some(_))), None) => true,
                (Some((_, Some(best))), Some(ts)) => ts < *best,
            };
            if older {
                earliest = Some((n, ts));
            }
        }

        let Some((n, _)) = earliest else {
            // buffered > 0 with nothing evictable means the accounting
            // drifted somewhere
            debug_assert!(false, "back-buffer bytes with no evictable packet");
            break;
        };

        let freed = streams[n].q.prune_step();
        trace!(stream = n, freed, "dropped back-buffer keyframe range");
        buffered -= freed;
    }
}
