//! End-to-end checks of ingestion, area queries and paths through the public API

use gps_trail_lib::{
    ApRect, AreaSetResult, CryptKey, FileBackend, Fix, GpsContext, IndexConfig, KeyRegistry, Path,
    ReadWriteThreadManager, RunOutcome, SelectedAreaSet, TrailIndex, ap_rect,
};
use std::sync::Arc;

/// An 8 x 8 world of unit depth 0 panels
fn small_index() -> TrailIndex {
    TrailIndex::new(IndexConfig {
        max_depth: 3,
        depth_0_units: 1,
        ..IndexConfig::default()
    })
    .unwrap()
}

/// Walk along the bottom row visiting `xs` in turn, one fix every 10 seconds from t = 0
fn walk(xs: &[i64]) -> TrailIndex {
    let mut index = small_index();
    for (i, &x) in xs.iter().enumerate() {
        index.add_point(x, 0, i as i64 * 10).unwrap();
    }
    index
}

fn paths(index: &TrailIndex, areas: &[ApRect]) -> Vec<Path> {
    index
        .find_api_paths(areas, i64::MIN, i64::MAX, &mut || Ok(()))
        .unwrap()
}

#[test]
fn test_insertion_scenario_spans() {
    let mut index = TrailIndex::new(IndexConfig {
        max_depth: 1,
        depth_0_units: 1,
        ..IndexConfig::default()
    })
    .unwrap();
    index.add_point(0, 0, 100).unwrap();
    index.add_point(0, 0, 160).unwrap();
    index.add_point(1, 0, 220).unwrap();

    let span = |slot| {
        let ap = index
            .area_panels()
            .get_sub_area_panel(index.root_panel(), slot)
            .unwrap()
            .unwrap();
        let tree = index.area_panels().get_row(ap).unwrap().time_tree().unwrap();
        let tree = index.time_trees().get_row(tree).unwrap();
        (tree.min_time(), tree.max_time())
    };
    assert_eq!(span(0), (100, 221));
    assert_eq!(span(1), (161, 221));
}

#[test]
fn test_single_trip_gives_one_path() {
    // Parked at x = 0 until t = 100, then one panel every 10 seconds up to x = 7
    let mut index = small_index();
    for t in [0, 50, 100] {
        index.add_point(0, 0, t).unwrap();
    }
    for x in 1..=7 {
        index.add_point(x, 0, 100 + x * 10).unwrap();
    }
    index.add_point(7, 0, 220).unwrap();

    let found = paths(&index, &[ap_rect(0, 0, 1, 1), ap_rect(7, 0, 8, 1)]);
    assert_eq!(found.len(), 1);
    let path = &found[0];
    assert_eq!((path.start_time, path.end_time), (106, 166));
    assert_eq!(path.areas.len(), 2);
    assert_eq!((path.areas[0].start_time, path.areas[0].end_time), (0, 106));
    assert_eq!(path.areas[1].start_time, 166);

    // Wider areas: the ends are pulled back to where the trip really starts and ends
    let found = paths(&index, &[ap_rect(0, 0, 2, 1), ap_rect(6, 0, 8, 1)]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].areas[0].end_time, 116);
    assert_eq!(found[0].areas[1].start_time, 156);
    assert_eq!((found[0].start_time, found[0].end_time), (106, 166));
}

#[test]
fn test_revisit_keeps_latest_exit() {
    // x = 0, 1, back to 0, then straight to 7
    let index = walk(&[0, 1, 0, 1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7]);
    let a = ap_rect(0, 0, 1, 1);
    let b = ap_rect(7, 0, 8, 1);

    let visits = index
        .time_ranges_for_area(&a, i64::MIN, i64::MAX, &mut || Ok(()))
        .unwrap();
    let spans: Vec<(i64, i64)> = visits.iter().map(|r| (r.start_time, r.end_time)).collect();
    assert_eq!(spans, vec![(0, 6), (16, 26)]);

    let found = paths(&index, &[a, b]);
    assert_eq!(found.len(), 1);
    let path = &found[0];
    assert_eq!(path.areas[0].range_index, 1);
    assert_eq!(path.areas[0].end_time, 26);
    assert_eq!((path.start_time, path.end_time), (26, 86));
}

#[test]
fn test_back_and_forth_gives_two_paths() {
    let xs: Vec<i64> = (0..=7).chain((0..7).rev()).chain(1..=7).collect();
    let index = walk(&xs);
    let found = paths(&index, &[ap_rect(0, 0, 1, 1), ap_rect(7, 0, 8, 1)]);

    assert_eq!(found.len(), 2);
    let chains: Vec<Vec<usize>> = found
        .iter()
        .map(|p| p.areas.iter().map(|info| info.range_index).collect())
        .collect();
    assert_eq!(chains, vec![vec![0, 0], vec![1, 1]]);
    assert!(found[0].end_time <= found[1].start_time);
    for path in &found {
        assert!(path.areas[0].start_time < path.areas[1].start_time);
        assert!(path.start_time <= path.areas[0].end_time);
        assert!(path.end_time >= path.areas[1].start_time);
    }

    // The reverse order only sees the middle trip
    let reverse = paths(&index, &[ap_rect(7, 0, 8, 1), ap_rect(0, 0, 1, 1)]);
    assert_eq!(reverse.len(), 1);
}

#[test]
fn test_queries_outside_the_data_are_empty() {
    let index = walk(&[0, 1, 2, 3]);
    let area = ap_rect(0, 0, 1, 1);
    assert!(
        index
            .time_ranges_for_area(&area, 1_000, 2_000, &mut || Ok(()))
            .unwrap()
            .is_empty()
    );
    assert!(
        index
            .time_ranges_for_area(&ap_rect(0, 5, 8, 8), i64::MIN, i64::MAX, &mut || Ok(()))
            .unwrap()
            .is_empty()
    );
    assert!(
        index
            .find_api_paths(&[area, ap_rect(3, 0, 4, 1)], 1_000, 2_000, &mut || Ok(()))
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_reselecting_same_inputs_is_a_no_op() {
    let index = Arc::new(ReadWriteThreadManager::new(walk(&[0, 1, 0, 1, 2, 3, 4, 5, 6, 7])));
    let set = SelectedAreaSet::new(index);
    let areas = vec![ap_rect(0, 0, 1, 1), ap_rect(7, 0, 8, 1)];

    set.set_areas(areas.clone());
    set.set_requested_time(None);
    assert_eq!(set.run_once().unwrap(), RunOutcome::Published);
    let first = set.published();
    let AreaSetResult::Paths(found) = &first.result else {
        panic!("expected paths, got {:?}", first.result);
    };
    assert_eq!(found.len(), 1);
    assert!(found[0].dist_m.is_some_and(|d| d > 0.0));

    set.set_areas(areas);
    set.set_requested_time(None);
    assert_eq!(set.run_once().unwrap(), RunOutcome::Idle);
    assert_eq!(set.published(), first);
}

#[test]
fn test_context_persists_to_files() {
    let dir = tempfile::tempdir().unwrap();
    let key = CryptKey::generate();
    let config = IndexConfig::default();
    let fixes: Vec<Fix> = (0..50)
        .map(|i| Fix {
            time_sec: 1_700_000_000 + i * 15,
            lat: 48.8566 + (i as f64 * 0.1).sin() * 0.002,
            lon: 2.3522 + i as f64 * 0.0003,
        })
        .collect();

    let context = GpsContext::new(config.clone(), KeyRegistry::new(1, key.clone())).unwrap();
    let report = context.ingest(fixes).unwrap();
    assert_eq!(report.accepted, 50);
    let mut backend = FileBackend::open(dir.path()).unwrap();
    context.flush(&mut backend).unwrap();

    let mut backend = FileBackend::open(dir.path()).unwrap();
    let reopened = GpsContext::open(config, KeyRegistry::new(1, key), &mut backend).unwrap();
    assert_eq!(reopened.info().unwrap(), context.info().unwrap());

    // Queries see the same data after reopening
    let set = reopened.selected_area_set();
    let everywhere = ap_rect(0, 0, 1 << 30, 1 << 30);
    set.add_area(everywhere);
    set.run_once().unwrap();
    let AreaSetResult::TimeRanges(ranges) = set.published().result else {
        panic!("expected time ranges");
    };
    assert_eq!(ranges.len(), 1);
    assert_eq!(
        (ranges[0].start_time, ranges[0].end_time),
        (1_700_000_000, 1_700_000_000 + 49 * 15 + 1)
    );
}
