//! Candidate generation and direct line matching over the shared network.

mod common;

use common::{line, local, matcher};
use street_matcher::geometry;
use street_matcher::{Direction, FormOfWay, MatchConfig, MatchType, SideOfStreet};

// ============================================================================
// Point Candidates
// ============================================================================

#[test]
fn test_perpendicular_offset() {
    let matcher = matcher(MatchConfig::default());
    let candidates = matcher.point_candidates(local(5.0, 50.0), None, 1).unwrap();

    assert_eq!(candidates.len(), 1);
    let best = &candidates[0];
    assert_eq!(best.reference_id, "a-f");
    assert!((best.score - 5.0).abs() < 0.05, "score {}", best.score);
    assert!((best.location - 50.0).abs() < 0.05, "location {}", best.location);
    assert_eq!(best.side_of_street, SideOfStreet::Right);
    assert!(!best.is_snapped());
}

#[test]
fn test_both_references_of_a_two_way_street() {
    let matcher = matcher(MatchConfig::default());
    let candidates = matcher.point_candidates(local(5.0, 50.0), None, 10).unwrap();

    assert_eq!(candidates.len(), 2);
    let backward = candidates.iter().find(|c| c.reference_id == "a-b").unwrap();
    assert_eq!(backward.direction, Direction::Backward);
    assert_eq!(backward.side_of_street, SideOfStreet::Left);
    assert!((backward.location - 50.0).abs() < 0.05);
    assert!((backward.bearing - 180.0).abs() < 0.01);
}

#[test]
fn test_left_hand_traffic_breaks_ties_to_the_left() {
    let config = MatchConfig {
        right_hand_traffic: false,
        ..MatchConfig::default()
    };
    let candidates = matcher(config)
        .point_candidates(local(5.0, 50.0), None, 1)
        .unwrap();
    assert_eq!(candidates[0].reference_id, "a-b");
}

#[test]
fn test_bearing_filter() {
    let matcher = matcher(MatchConfig::default());

    let south = matcher
        .point_candidates(local(5.0, 50.0), Some(185.0), 10)
        .unwrap();
    assert_eq!(south.len(), 1);
    assert_eq!(south[0].reference_id, "a-b");

    let east = matcher
        .point_candidates(local(5.0, 50.0), Some(90.0), 10)
        .unwrap();
    assert!(east.is_empty());
}

#[test]
fn test_radius_is_exclusive_of_far_streets() {
    let matcher = matcher(MatchConfig::default());
    assert!(matcher.match_point(local(40.0, 50.0), None).unwrap().is_none());
    assert!(matcher.match_point(local(20.0, 50.0), None).unwrap().is_some());
}

#[test]
fn test_snapping_near_an_intersection() {
    let config = MatchConfig {
        snap_intersections: true,
        search_radius: 10.0,
        ..MatchConfig::default()
    };
    let candidates = matcher(config)
        .point_candidates(local(2.0, 3.0), None, 10)
        .unwrap();

    let plain = candidates
        .iter()
        .find(|c| c.reference_id == "a-f" && !c.is_snapped())
        .unwrap();
    assert!((plain.location - 3.0).abs() < 0.05);

    let snapped = candidates
        .iter()
        .find(|c| c.reference_id == "a-f" && c.is_snapped())
        .unwrap();
    assert_eq!(snapped.location, 0.0);
    let at = snapped.snapped_point.unwrap();
    assert!(geometry::distance(at, local(0.0, 0.0)) < 0.01);

    // The backward reference ends at the same intersection
    let back = candidates
        .iter()
        .find(|c| c.reference_id == "a-b" && c.is_snapped())
        .unwrap();
    assert_eq!(back.location, back.reference_length);
}

// ============================================================================
// Direct Line Matching
// ============================================================================

#[test]
fn test_same_segment_match() {
    let matcher = matcher(MatchConfig::default());
    let matches = matcher
        .match_line(&line(&[(0.0, 20.0), (0.0, 80.0)]), None)
        .unwrap();

    assert_eq!(matches.len(), 1);
    let path = &matches[0];
    assert_eq!(path.match_type, MatchType::Direct);
    assert_eq!(path.segments.len(), 1);
    let segment = &path.segments[0];
    assert_eq!(segment.reference_id, "a-f");
    assert_eq!(segment.from_intersection_id, "int-a");
    assert_eq!(segment.to_intersection_id, "int-b");
    assert!((segment.section[0] - 20.0).abs() < 0.05);
    assert!((segment.section[1] - 80.0).abs() < 0.05);
    assert!((path.path_length() - 60.0).abs() < 0.1);
    assert!(path.length_delta().abs() < 0.1);

    let geometry = segment.geometry.as_ref().unwrap();
    assert!((geometry::line_length(geometry) - 60.0).abs() < 0.1);
    assert_eq!(path.matched_path.as_ref().unwrap().0.len(), 1);
}

#[test]
fn test_routed_match_across_an_intersection() {
    let matcher = matcher(MatchConfig::default());
    let matches = matcher
        .match_line(&line(&[(0.0, 50.0), (0.0, 100.0), (50.0, 100.0)]), None)
        .unwrap();

    assert_eq!(matches.len(), 1);
    let path = &matches[0];
    assert_eq!(path.reference_ids(), vec!["a-f", "c-f"]);
    assert!((path.segments[0].section[0] - 50.0).abs() < 0.1);
    assert!((path.segments[1].section[1] - 50.0).abs() < 0.1);
    assert!((path.path_length() - 100.0).abs() < 0.2);
}

#[test]
fn test_route_length_must_fit_the_line() {
    let matcher = matcher(MatchConfig::default());
    // Leaves north on a-f and arrives east on c-f, but runs about 500 m
    let detour = line(&[
        (0.0, 50.0),
        (0.0, 75.0),
        (-200.0, 75.0),
        (-200.0, 100.0),
        (50.0, 100.0),
    ]);
    assert!(matcher.match_line(&detour, None).unwrap().is_empty());
}

#[test]
fn test_one_way_street_against_traffic() {
    let southbound = line(&[(0.0, 180.0), (0.0, 120.0)]);

    let strict = matcher(MatchConfig::default());
    assert!(strict.match_line(&southbound, None).unwrap().is_empty());

    let either = matcher(MatchConfig {
        ignore_direction: true,
        ..MatchConfig::default()
    });
    let matches = either.match_line(&southbound, None).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].reference_ids(), vec!["b-f"]);
    assert!((matches[0].segments[0].section[0] - 20.0).abs() < 0.05);
}

#[test]
fn test_two_way_street_returns_both_directions() {
    let matcher = matcher(MatchConfig {
        ignore_direction: true,
        ..MatchConfig::default()
    });
    let matches = matcher
        .match_line(&line(&[(0.0, 20.0), (0.0, 80.0)]), None)
        .unwrap();

    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].reference_ids(), vec!["a-f"]);
    assert_eq!(matches[1].reference_ids(), vec!["a-b"]);
    assert!(matches[0].is_colinear(&matches[1]));
}

#[test]
fn test_form_of_way_filter() {
    let matcher = matcher(MatchConfig::default());
    let probe = line(&[(0.0, 20.0), (0.0, 80.0)]);

    let motorways = [FormOfWay::Motorway];
    assert!(matcher.match_line(&probe, Some(&motorways)).unwrap().is_empty());

    let streets = [FormOfWay::SingleCarriageway];
    assert_eq!(matcher.match_line(&probe, Some(&streets)).unwrap().len(), 1);
}

#[test]
fn test_side_of_street_offsets_geometry() {
    let matcher = matcher(MatchConfig {
        snap_side_of_street: SideOfStreet::Right,
        lateral_offset: 4.0,
        ..MatchConfig::default()
    });
    // Drawn 3 m east of a-f, on its right
    let matches = matcher
        .match_line(&line(&[(3.0, 20.0), (3.0, 80.0)]), None)
        .unwrap();

    let path = &matches[0];
    assert_eq!(path.side_of_street, SideOfStreet::Right);
    let geometry = path.segments[0].geometry.as_ref().unwrap();
    let centre_lon = local(0.0, 0.0).x;
    assert!(geometry.0.iter().all(|c| c.x > centre_lon));
}

#[test]
fn test_degenerate_line_is_rejected() {
    let matcher = matcher(MatchConfig::default());
    assert!(matcher.match_line(&line(&[(0.0, 20.0)]), None).is_err());
}

#[test]
fn test_candidates_stay_within_bounds() {
    let config = MatchConfig {
        snap_intersections: true,
        ..MatchConfig::default()
    };
    let radius = config.search_radius;
    let matcher = matcher(config);

    for east in [-20.0, -3.0, 0.0, 7.5, 24.0] {
        for north in [-10.0, 0.0, 45.0, 99.0, 130.0, 210.0] {
            let point = local(east, north);
            for candidate in matcher.point_candidates(point, None, 50).unwrap() {
                assert!(candidate.location >= 0.0);
                assert!(candidate.location <= candidate.reference_length);
                assert!(candidate.score >= 0.0);
                assert!(geometry::distance(point, candidate.point_on_line) < radius);
            }
        }
    }
}
