//! The reader loop.
//!
//! A single dedicated thread owns every driver call. Each wake-up it
//! dispatches, in priority order: a marshalled control job, a pending track
//! switch, a pending user seek, a buffer fill (possibly preceded by a
//! refresh seek), a cached-state refresh. When none of them applies it
//! idles on the condvar. The engine lock is held across every decision and
//! dropped only around driver I/O.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

use dmx_common::{ts_min, TimeCode};

use crate::driver::{ByteSource, DriverCtrl, FillStatus, SeekFlags};
use crate::engine::{fire_wakeup, Events, Shared, State};

pub(crate) fn reader_thread(shared: Arc<Shared>) {
    debug!("reader thread started");
    let mut state = shared.state.lock();
    while !state.thread_terminate {
        if state.run_job.is_some() {
            let job = state.run_job.take().unwrap();
            let result = MutexGuard::unlocked(&mut state, || {
                let mut host = shared.host.lock();
                let host = host.as_mut().expect("driver host installed before start");
                job(host, &shared)
            });
            state.run_result = Some(result);
            shared.cond.notify_all();
            continue;
        }
        if state.tracks_switched {
            execute_trackswitch(&shared, &mut state);
            continue;
        }
        if state.seeking {
            execute_seek(&shared, &mut state);
            continue;
        }
        if !state.eof {
            // If it made progress the lock was released; recheck everything.
            if read_packet(&shared, &mut state) {
                continue;
            }
        }
        if state.force_cache_update {
            MutexGuard::unlocked(&mut state, || {
                let source = shared.host.lock().as_ref().map(|h| Arc::clone(&h.source));
                if let Some(source) = source {
                    update_cache(&shared, source.as_ref());
                }
            });
            state.force_cache_update = false;
            continue;
        }
        // Let waiters observe the idle state before sleeping.
        shared.cond.notify_all();
        shared.cond.wait(&mut state);
    }
    debug!("reader thread exiting");
}

/// Tell the driver about a changed track selection and adjust the byte
/// source's read-ahead to whether anything is selected at all.
pub(crate) fn execute_trackswitch(shared: &Arc<Shared>, state: &mut MutexGuard<'_, State>) {
    state.tracks_switched = false;
    let any_selected = state.streams.iter().any(|s| s.q.selected);

    MutexGuard::unlocked(state, || {
        let mut host = shared.host.lock();
        if let Some(host) = host.as_mut() {
            let (driver, mut ctx) = host.split(shared);
            driver.control(&mut ctx, DriverCtrl::SwitchedTracks);
            host.source.set_readahead(any_selected);
        }
    });
}

/// Forward a queued user seek to the driver.
pub(crate) fn execute_seek(shared: &Arc<Shared>, state: &mut MutexGuard<'_, State>) {
    let pts = state.seek_pts.take();
    let flags = state.seek_flags;
    state.seeking = false;
    state.initial_state = false;

    debug!(pts = ?pts, ?flags, "execute seek");

    MutexGuard::unlocked(state, || {
        let mut host = shared.host.lock();
        if let (Some(host), Some(pts)) = (host.as_mut(), pts) {
            let (driver, mut ctx) = host.split(shared);
            if driver.can_seek() {
                driver.seek(&mut ctx, pts, flags);
            }
        }
    });

    debug!("seek done");
}

/// One fill step. Returns true if the lock was released (progress), so the
/// caller must recheck all dispatch conditions.
pub(crate) fn read_packet(shared: &Arc<Shared>, state: &mut MutexGuard<'_, State>) -> bool {
    state.eof = false;
    state.idle = true;

    // Read when any selected stream explicitly needs data, or any active
    // stream is below the read-ahead target, with a hard stop at the
    // forward-window byte cap.
    let mut active = false;
    let mut read_more = false;
    let mut bytes: usize = 0;
    for st in &state.streams {
        let q = &st.q;
        active |= q.active;
        read_more |= (q.active && !q.has_forward()) || q.refreshing;
        bytes += q.fw_bytes;
        if q.active && state.min_secs > 0.0 {
            if let (Some(last), Some(base)) = (q.last_ts, q.base_ts) {
                if last >= base {
                    read_more |= (last - base).as_secs() < state.min_secs;
                }
            }
        }
    }
    trace!(bytes, active, read_more, "read decision");

    if bytes >= state.max_bytes {
        if !state.warned_queue_overflow {
            state.warned_queue_overflow = true;
            warn!("too many packets in the demuxer packet queues");
            for (n, st) in state.streams.iter().enumerate() {
                if st.q.selected {
                    warn!(
                        stream = n,
                        kind = %st.info.kind,
                        packs = st.q.fw_packs,
                        bytes = st.q.fw_bytes,
                        "overflowing queue"
                    );
                }
            }
        }
        let wakeup = state.wakeup.clone();
        for st in &mut state.streams {
            let eof = !st.q.has_forward();
            if eof && !st.q.eof {
                if let Some(cb) = &wakeup {
                    cb();
                }
            }
            st.q.eof |= eof;
        }
        shared.cond.notify_all();
        return false;
    }

    let refresh_pts = refresh_seek_pts(state);
    let read_more = read_more || refresh_pts.is_some();
    if !read_more {
        return false;
    }

    // Actually read. Drop the lock while doing so; disk or network I/O can
    // take arbitrarily long.
    state.idle = false;
    state.initial_state = false;

    let mut eof = true;
    MutexGuard::unlocked(state, || {
        let mut host = shared.host.lock();
        if let Some(host) = host.as_mut() {
            {
                let (driver, mut ctx) = host.split(shared);
                if let Some(pts) = refresh_pts {
                    debug!(%pts, "refresh seek");
                    driver.seek(&mut ctx, pts, SeekFlags::HR);
                }
                if !ctx.cancel_test() {
                    eof = driver.fill_buffer(&mut ctx) == FillStatus::Eof;
                }
            }
            update_cache(shared, host.source.as_ref());
        }
    });

    if !state.seeking {
        if eof {
            for st in &mut state.streams {
                st.q.eof = true;
            }
            // If we already were at EOF, don't wake up again (wakeup loop).
            if !state.last_eof {
                fire_wakeup(state);
                shared.cond.notify_all();
                debug!("EOF reached");
            }
        }
        state.eof = eof;
        state.last_eof = eof;
    }
    true
}

/// Decide whether a refresh seek is due, and to where.
///
/// A newly selected stream cannot get past packets from the producer
/// without a seek. If every selected stream is new, a plain seek to the
/// reader position is enough. Otherwise the seek undershoots by a second
/// and the queues deduplicate replayed packets by their monotonic key, so
/// the already-selected streams resume exactly where they left off.
fn refresh_seek_pts(state: &mut State) -> Option<TimeCode> {
    let mut start_ts = state.ref_pts;
    let mut needed = false;
    let mut normal_seek = true;
    let mut refresh_possible = true;

    for st in &mut state.streams {
        let q = &mut st.q;
        if !q.selected {
            continue;
        }
        if matches!(
            st.info.kind,
            dmx_common::StreamKind::Video | dmx_common::StreamKind::Audio
        ) {
            start_ts = ts_min(start_ts, q.base_ts);
        }
        needed |= q.need_refresh;
        // With no other streams selected, a normal seek covers it.
        normal_seek &= q.need_refresh;
        q.need_refresh = false;

        refresh_possible &= q.correct_dts || q.correct_pos;
    }

    if !needed
        || !state.driver_can_seek
        || !state.seekable
        || state.partially_seekable
    {
        return None;
    }
    let start_ts = start_ts?;

    if normal_seek {
        return Some(start_ts);
    }

    if !refresh_possible {
        debug!("can't issue refresh seek");
        return None;
    }

    for st in &mut state.streams {
        let q = &mut st.q;
        // Streams that never produced anything will simply deliver from the
        // seek target; the others replay and deduplicate.
        if q.last_pos.is_some() || q.last_dts.is_some() {
            q.refreshing |= q.selected;
        }
    }

    // Undershoot so the driver definitely reproduces the last-seen packet.
    Some(start_ts - 1.0)
}

/// Refresh the cached byte-source state. Queries the source without any
/// engine lock held, then publishes under the lock.
pub(crate) fn update_cache(shared: &Shared, source: &dyn ByteSource) {
    let size = source.size();
    let info = source.cache_info();
    let metadata = source.metadata();

    let mut state = shared.state.lock();
    state.cache.size = size;
    state.cache.info = info;
    if let Some(md) = metadata {
        state.cache.metadata = Some(md);
        state.shadow.events |= Events::METADATA;
    }
}
