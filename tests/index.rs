//! Tile index integration tests: lazy loading, lookups, geometry slicing
//! and bins over the shared test network.

mod common;

use common::{extent, local, tile_source};
use geo::{Coord, Geometry};
use street_matcher::geometry;
use street_matcher::{
    Direction, MatchError, SideOfStreet, TileIndex, TileParams, TilePathGroup, TileType,
};

fn all_tiles() -> TilePathGroup {
    TilePathGroup::from_rect(extent(), 0.0, &TileParams::default()).with_types(&[
        TileType::Geometry,
        TileType::Reference,
        TileType::Intersection,
        TileType::Metadata,
    ])
}

fn loaded_index() -> std::sync::Arc<TileIndex> {
    let index = common::index();
    index.index_tiles(&all_tiles()).unwrap();
    index
}

#[test]
fn test_loading_is_idempotent() {
    let source = tile_source();
    let index = common::index_over(source.clone());
    let group = all_tiles();

    let loaded = index.index_tiles(&group).unwrap();
    assert_eq!(loaded, group.paths().len());
    let fetches = source.fetch_count();
    let stats = index.stats();

    assert_eq!(index.index_tiles(&group).unwrap(), 0);
    assert_eq!(source.fetch_count(), fetches);
    assert_eq!(index.stats(), stats);

    // Every tile repeats the whole network; duplicates are skipped
    assert_eq!(stats.segments, 3);
    assert_eq!(stats.references, 5);
    assert_eq!(stats.intersections, 4);
    assert_eq!(stats.metadata, 2);
    let ids: Vec<String> = index.segments().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["seg-a", "seg-b", "seg-c"]);
}

#[test]
fn test_concurrent_queries_share_loads() {
    let source = tile_source();
    let index = common::index_over(source.clone());
    let point = local(0.0, 50.0);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let index = &index;
            scope.spawn(move || {
                let hits = index.nearby(point, TileType::Geometry, 25.0).unwrap();
                assert_eq!(hits[0].id, "seg-a");
            });
        }
    });

    // nearby() loads tiles for twice the search radius
    let expected = TilePathGroup::from_point(point, 50.0, &TileParams::default())
        .with_types(&[TileType::Geometry, TileType::Reference])
        .paths()
        .len();
    assert_eq!(source.fetch_count(), expected);
}

#[test]
fn test_nearby_intersections_within_radius() {
    let index = common::index();
    let hits = index
        .nearby(local(5.0, 95.0), TileType::Intersection, 20.0)
        .unwrap();
    let ids: Vec<&str> = hits.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["int-b"]);
    assert!(hits[0].as_point().is_some());
}

#[test]
fn test_reference_lookups() {
    let index = loaded_index();

    assert_eq!(index.direction_for_reference("a-b"), Some(Direction::Backward));
    assert_eq!(index.direction_for_reference("b-f"), Some(Direction::Forward));
    assert_eq!(index.from_intersection_id("c-b").as_deref(), Some("int-d"));
    assert_eq!(index.to_intersection_id("c-b").as_deref(), Some("int-b"));
    assert_eq!(index.street_name("seg-a").as_deref(), Some("Main Street"));
    assert!(index.street_name("seg-b").is_none());
    assert!(index.direction_for_reference("nope").is_none());

    let reference = index.reference("a-f").unwrap();
    assert!((reference.length() - 100.0).abs() < 0.05);
}

#[test]
fn test_geom_follows_reference_direction() {
    let index = loaded_index();

    let forward = index.slice("a-f", 10.0, 40.0, None).unwrap();
    let backward = index.slice("a-b", 60.0, 90.0, None).unwrap();
    assert!((geometry::line_length(&forward) - 30.0).abs() < 0.05);
    assert!((geometry::line_length(&backward) - 30.0).abs() < 0.05);

    // Same stretch of street, opposite travel
    assert!(geometry::distance(forward.0[0], *backward.0.last().unwrap()) < 0.05);
    assert!(geometry::distance(*forward.0.last().unwrap(), backward.0[0]) < 0.05);

    // A point at `start` when no end is given
    match index.geom("a-b", 25.0, None, None) {
        Some(Geometry::Point(p)) => {
            assert!(geometry::distance(p.0, local(0.0, 75.0)) < 0.05);
        }
        other => panic!("expected a point, got {:?}", other),
    }
    assert!(index.geom("a-f", 250.0, None, None).is_none());
}

#[test]
fn test_slice_errors() {
    let index = loaded_index();
    assert!(matches!(
        index.try_slice("missing", 0.0, 10.0, None),
        Err(MatchError::NotFound { .. })
    ));
    assert!(matches!(
        index.try_slice("a-f", 40.0, 40.0, None),
        Err(MatchError::GeometrySliceOutOfRange { .. })
    ));
    assert!(index.try_slice("a-f", 40.0, 400.0, None).is_ok());
}

#[test]
fn test_lateral_offset_goes_right_of_travel() {
    let index = loaded_index();

    // a-f runs north, so right is east; a-b runs south, so right is west
    let north = index.slice("a-f", 0.0, 100.0, Some(3.0)).unwrap();
    let south = index.slice("a-b", 0.0, 100.0, Some(3.0)).unwrap();
    let centre_lon = local(0.0, 0.0).x;
    assert!(north.0.iter().all(|c| c.x > centre_lon));
    assert!(south.0.iter().all(|c| c.x < centre_lon));

    let mid = Coord {
        x: north.0[0].x,
        y: local(0.0, 50.0).y,
    };
    assert!((geometry::distance(mid, local(0.0, 50.0)) - 3.0).abs() < 0.05);

    let left = index.slice("a-f", 0.0, 100.0, Some(-3.0)).unwrap();
    assert!(left.0.iter().all(|c| c.x < centre_lon));
}

#[test]
fn test_bins_are_deterministic() {
    let first = loaded_index();
    let second = loaded_index();

    let a = first
        .reference_to_bins("c-f", 5, 2.0, SideOfStreet::Left)
        .unwrap();
    let b = second
        .reference_to_bins("c-f", 5, 2.0, SideOfStreet::Left)
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 5);

    // c-f runs east: bins are 20 m apart, left of travel is north
    assert!((geometry::distance(a[0], a[1]) - 20.0).abs() < 0.2);
    assert!(a.iter().all(|c| c.y > local(0.0, 100.0).y));

    let centre = first
        .reference_to_bins("c-f", 5, 2.0, SideOfStreet::Unknown)
        .unwrap();
    assert!(centre
        .iter()
        .all(|c| (c.y - local(0.0, 100.0).y).abs() < 1e-6));
    assert!(first.reference_to_bins("c-f", 0, 2.0, SideOfStreet::Left).is_none());
}

#[test]
fn test_full_slice_round_trips_the_segment() {
    let index = loaded_index();

    for (reference_id, reversed) in [("a-f", false), ("a-b", true), ("c-b", true)] {
        let context = index.reference_context(reference_id).unwrap();
        let length = context.reference.length();
        let slice = index.slice(reference_id, 0.0, length, None).unwrap();

        let mut expected = context.segment.line().0;
        if reversed {
            expected.reverse();
        }
        assert_eq!(slice.0.len(), expected.len(), "{}", reference_id);
        for (got, want) in slice.0.iter().zip(&expected) {
            assert!((got.x - want.x).abs() < 1e-6 && (got.y - want.y).abs() < 1e-6);
        }
    }
}
