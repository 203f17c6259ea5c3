//! Read-ahead, overflow, and back-buffer behavior of the reader loop.

mod support;

use std::time::Duration;

use dmx_engine::{DemuxOptions, StreamId, StreamKind, TimeCode};
use support::*;

const V: StreamId = StreamId(0);
const A: StreamId = StreamId(1);

#[test]
fn two_stream_readahead_stays_near_target() {
    let spec = ScriptSpec {
        streams: vec![StreamKind::Video, StreamKind::Audio],
        items: av_schedule(5.0, 0.04, 25, 0.02, 100),
        duration: 5.0,
        ..ScriptSpec::default()
    };
    let opts = DemuxOptions {
        readahead_secs: 0.1,
        ..DemuxOptions::default()
    };
    let (demux, _probe, _src) = open_script(spec, &opts);
    demux.select_track(V, None, true);
    demux.select_track(A, None, true);
    demux.start();

    // frames come back in schedule order
    for expected in [0.0, 0.04, 0.08] {
        let pkt = demux.read(V).expect("video packet");
        assert_eq!(pkt.pts, Some(TimeCode::from_secs(expected)));
    }

    // wait for the reader to satisfy the read-ahead target and go idle
    assert!(wait_settled(&demux, &[V, A]));

    let v = demux.queue_stats(V);
    let a = demux.queue_stats(A);
    assert!(v.fw_packs >= 2, "video below read-ahead: {v:?}");
    assert!(
        v.fw_packs <= 25,
        "video buffered far past 0.1s target: {v:?}"
    );
    assert!(a.fw_packs >= 1, "audio packets ride along: {a:?}");
    assert!(a.fw_packs <= 50, "audio buffered far past target: {a:?}");

    // reading resumes exactly where the schedule continues
    let pkt = demux.read(V).expect("video packet");
    assert_eq!(pkt.pts, Some(TimeCode::from_secs(0.12)));
    demux.close();
}

#[test]
fn overflow_clamps_reader_and_flags_dry_streams() {
    // Video supplies 1 KiB packets; audio is selected but the container
    // carries no audio at all.
    let items: Vec<ScriptItem> = (0..6).map(|i| item(0, i as f64, true, 1024)).collect();
    let spec = ScriptSpec {
        streams: vec![StreamKind::Video, StreamKind::Audio],
        items,
        duration: 6.0,
        ..ScriptSpec::default()
    };
    let opts = DemuxOptions {
        max_bytes: 1500,
        readahead_secs: 10.0,
        ..DemuxOptions::default()
    };
    let (demux, _probe, _src) = open_script(spec, &opts);
    demux.select_track(V, None, true);
    demux.select_track(A, None, true);
    demux.start();

    let first = demux.read(V).expect("first packet");
    assert_eq!(first.pts, Some(TimeCode::from_secs(0.0)));

    // the reader fills until the forward cap and then stops
    assert!(wait_until(Duration::from_secs(2), || demux
        .queue_stats(V)
        .fw_packs
        == 2));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(demux.queue_stats(V).fw_packs, 2, "reader kept reading past the cap");

    // the starved audio stream is flagged EOF by the overflow guard
    assert!(wait_until(Duration::from_secs(2), || matches!(
        demux.try_read(A),
        dmx_engine::ReadResult::EndOfStream
    )));

    // draining works and frees the reader to finish the script
    let mut pts = Vec::new();
    while let Some(pkt) = demux.read(V) {
        pts.push(pkt.pts.unwrap().as_secs());
    }
    assert_eq!(pts, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    demux.close();
}

#[test]
fn back_buffer_stays_under_cap_and_keyframe_aligned() {
    let items: Vec<ScriptItem> = (0..40)
        .map(|i| item(0, i as f64 * 0.1, i % 5 == 0, 1024))
        .collect();
    let spec = ScriptSpec {
        streams: vec![StreamKind::Video],
        items,
        duration: 4.0,
        ..ScriptSpec::default()
    };
    let opts = DemuxOptions {
        max_bytes_bw: 4096,
        readahead_secs: 10.0,
        seekable_cache: true,
        ..DemuxOptions::default()
    };
    let (demux, _probe, _src) = open_script(spec, &opts);
    demux.select_track(V, None, true);
    demux.start();

    for _ in 0..20 {
        demux.read(V).expect("video packet");
        let stats = demux.queue_stats(V);
        assert!(
            stats.bw_bytes <= 4096,
            "back buffer over cap after read: {stats:?}"
        );
    }

    // the buffered range still begins at a keyframe range start
    let state = demux.reader_state();
    let (start, _end) = state.seek_range.expect("buffered seek range");
    let frac = (start.as_secs() / 0.5).fract().abs();
    assert!(
        frac < 1e-9 || (1.0 - frac) < 1e-9,
        "range start {start} is not keyframe-aligned"
    );
    demux.close();
}

#[test]
fn packets_arrive_in_order_with_consistent_accounting() {
    let items: Vec<ScriptItem> = (0..30)
        .map(|i| item(0, i as f64 * 0.04, i % 6 == 0, 200))
        .collect();
    let n_items = items.len();
    let spec = ScriptSpec {
        streams: vec![StreamKind::Video],
        items,
        duration: 1.2,
        ..ScriptSpec::default()
    };
    let (demux, _probe, _src) = open_script(spec, &DemuxOptions::default());
    demux.select_track(V, None, true);
    demux.start();

    let mut last = f64::NEG_INFINITY;
    let mut count = 0usize;
    while let Some(pkt) = demux.read(V) {
        let pts = pkt.pts.unwrap().as_secs();
        assert!(pts > last, "out of order: {pts} after {last}");
        last = pts;
        count += 1;

        let stats = demux.queue_stats(V);
        // uniform packet size: the split must account for every byte
        assert_eq!(
            stats.fw_bytes + stats.bw_bytes,
            stats.total_packs * (200 + 64),
            "accounting drifted: {stats:?}"
        );
    }
    assert_eq!(count, n_items, "every scheduled packet delivered once");
    demux.close();
}
