//! Path assembly and scoring.
//!
//! Two strategies produce [`PathCandidate`]s:
//! - **Direct**: rank point candidates at both ends of a probe line, then
//!   join each pair either within one segment or through a bounded route
//!   search over loaded references.
//! - **HMM**: take the ordered reference ids an external routing engine
//!   matched a trace onto and trim the first and last references to where
//!   the trace starts and ends (see [`crate::graph::Graph::match_trace`]).
//!
//! Both strategies share segment construction, side-of-street resolution and
//! geometry materialisation.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use geo::{Coord, LineString, MultiLineString};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::candidates::{CandidateGenerator, PointCandidate};
use crate::error::{MatchError, Result};
use crate::geometry;
use crate::tile_index::TileIndex;
use crate::types::{Direction, FeatureReference, FormOfWay, RoadClass, SideOfStreet};
use crate::MatchConfig;

/// Per-segment penalty added to direct match scores.
const SEGMENT_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Direct,
    Hmm,
}

/// One reference traversed by a path, trimmed to `section`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub reference_id: String,
    pub segment_id: String,
    pub road_class: RoadClass,
    pub from_intersection_id: String,
    pub to_intersection_id: String,
    pub streetname: Option<String>,
    pub reference_length: f64,
    /// [start, end] metres along the reference
    pub section: [f64; 2],
    pub direction: Direction,
    /// Filled by [`Matcher::materialize`]
    pub geometry: Option<LineString>,
}

impl PathSegment {
    pub fn length(&self) -> f64 {
        self.section[1] - self.section[0]
    }
}

/// A scored path through the street network for one probe feature.
#[derive(Debug, Clone, PartialEq)]
pub struct PathCandidate {
    pub match_type: MatchType,
    /// Lower is better
    pub score: f64,
    /// Routing engine confidence for HMM matches
    pub confidence: Option<f64>,
    pub start_point: PointCandidate,
    pub end_point: PointCandidate,
    pub segments: Vec<PathSegment>,
    pub original_feature: LineString,
    pub original_feature_length: f64,
    pub matched_path: Option<MultiLineString>,
    pub side_of_street: SideOfStreet,
}

impl PathCandidate {
    /// Sum of segment spans in metres.
    pub fn path_length(&self) -> f64 {
        self.segments.iter().map(PathSegment::length).sum()
    }

    pub fn length_delta(&self) -> f64 {
        self.path_length() - self.original_feature_length
    }

    /// Same set of segments, regardless of order or direction.
    pub fn is_colinear(&self, other: &PathCandidate) -> bool {
        if self.segments.len() != other.segments.len() {
            return false;
        }
        let ids: HashSet<&str> = self.segments.iter().map(|s| s.segment_id.as_str()).collect();
        other
            .segments
            .iter()
            .all(|s| ids.contains(s.segment_id.as_str()))
    }

    /// Whether `other` runs the opposite way along roughly the same line.
    pub fn is_parallel(&self, other: &PathCandidate, tolerance: f64) -> bool {
        let b1 = geometry::bearing(self.start_point.point_on_line, self.end_point.point_on_line);
        let b2 = geometry::bearing(other.end_point.point_on_line, other.start_point.point_on_line);
        geometry::angle_delta(geometry::normalize_angle(b1), geometry::normalize_angle(b2))
            < tolerance
    }

    pub fn reference_ids(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.reference_id.as_str()).collect()
    }

    fn compute_score(&mut self) {
        let error = geometry::rmse(&[
            self.start_point.score,
            self.end_point.score,
            self.length_delta(),
        ]);
        self.score = match self.match_type {
            MatchType::Direct => error + self.segments.len() as f64 * SEGMENT_PENALTY,
            MatchType::Hmm => error,
        };
    }
}

/// Ascending score; ties prefer a resolved side of street.
fn rank_paths(candidates: &mut [PathCandidate]) {
    candidates.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let ka = (a.side_of_street == SideOfStreet::Unknown) as u8;
                let kb = (b.side_of_street == SideOfStreet::Unknown) as u8;
                ka.cmp(&kb)
            })
    });
}

/// Pick the candidates to return when a line matched in both directions.
///
/// Colinear or parallel pairs are both kept, forward first. Otherwise a
/// known side of street wins, then the lower score, with ties to forward.
fn reconcile(
    forward: Option<PathCandidate>,
    backward: Option<PathCandidate>,
    bearing_tolerance: f64,
) -> Vec<PathCandidate> {
    let (f, b) = match (forward, backward) {
        (Some(f), Some(b)) => (f, b),
        (Some(f), None) => return vec![f],
        (None, Some(b)) => return vec![b],
        (None, None) => return Vec::new(),
    };

    if f.is_colinear(&b) || f.is_parallel(&b, bearing_tolerance) {
        return vec![f, b];
    }

    let f_known = f.side_of_street != SideOfStreet::Unknown;
    let b_known = b.side_of_street != SideOfStreet::Unknown;
    match (f_known, b_known) {
        (true, false) => vec![f],
        (false, true) => vec![b],
        _ if b.score < f.score => vec![b],
        _ => vec![f],
    }
}

/// Trim a trace match to the intersections near its ends.
///
/// Applies when the matched length exceeds `radius`. The first segment is
/// extended back to its start when the trace begins within `radius` of it;
/// otherwise, if only a short stub remains before the next segment, the stub
/// is dropped. The last segment follows the same rule at its end. Interior
/// segments span their full reference and empty segments are removed.
pub fn snap_to_intersections(segments: &mut Vec<PathSegment>, radius: f64) {
    let total: f64 = segments.iter().map(PathSegment::length).sum();
    if segments.is_empty() || total <= radius {
        return;
    }

    let n = segments.len();
    let mut drop_first = false;
    let mut drop_last = false;

    for (i, segment) in segments.iter_mut().enumerate() {
        let len = segment.reference_length;
        if i > 0 && i < n - 1 {
            segment.section = [0.0, len];
            continue;
        }
        if i == 0 {
            if segment.section[0] < radius {
                segment.section[0] = 0.0;
            } else if n > 1 && len - segment.section[0] < radius {
                drop_first = true;
            }
        }
        if i == n - 1 {
            if len - segment.section[1] < radius {
                segment.section[1] = len;
            } else if n > 1 && segment.section[1] < radius {
                drop_last = true;
            }
        }
    }

    if drop_last {
        segments.pop();
    }
    if drop_first && !segments.is_empty() {
        segments.remove(0);
    }
    segments.retain(|s| s.length() > 0.0);
}

/// Matches points and lines against a [`TileIndex`].
#[derive(Clone)]
pub struct Matcher {
    index: Arc<TileIndex>,
    config: MatchConfig,
    candidates: CandidateGenerator,
}

impl Matcher {
    pub fn new(index: Arc<TileIndex>, config: MatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            candidates: CandidateGenerator::new(index.clone(), config.clone()),
            index,
            config,
        })
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<TileIndex> {
        &self.index
    }

    pub fn candidates(&self) -> &CandidateGenerator {
        &self.candidates
    }

    /// Ranked point candidates, see [`CandidateGenerator::point_candidates`].
    pub fn point_candidates(
        &self,
        point: Coord,
        bearing: Option<f64>,
        max_candidates: usize,
    ) -> Result<Vec<PointCandidate>> {
        self.candidates
            .point_candidates(point, bearing, max_candidates)
    }

    /// Best candidate for a point, if any street is in range.
    pub fn match_point(&self, point: Coord, bearing: Option<f64>) -> Result<Option<PointCandidate>> {
        Ok(self
            .point_candidates(point, bearing, self.config.max_candidates)?
            .into_iter()
            .next())
    }

    // ========================================================================
    // Direct Matching
    // ========================================================================

    /// Ranked direct matches for `line` travelled in `direction`.
    ///
    /// Geometry is not materialised; see [`Matcher::materialize`].
    pub fn match_directed(
        &self,
        line: &LineString,
        direction: Direction,
        form_of_way: Option<&[FormOfWay]>,
    ) -> Result<Vec<PathCandidate>> {
        let feature = FeatureReference::from_line(line, direction).ok_or_else(|| {
            MatchError::InvalidInput {
                message: format!("line needs at least 2 coordinates, got {}", line.0.len()),
            }
        })?;
        let directed = match direction {
            Direction::Forward => line.clone(),
            Direction::Backward => geometry::reversed(line),
        };

        let max = self.config.max_candidates;
        let starts = self
            .candidates
            .point_candidates(feature.start, Some(feature.outbound_bearing), max)?;
        let ends = self
            .candidates
            .point_candidates(feature.end, Some(feature.inbound_bearing), max)?;

        let mut route_queries = 0;
        let mut results = Vec::new();

        for start in &starts {
            for end in &ends {
                let segments = if start.segment_id == end.segment_id {
                    if start.reference_id != end.reference_id || end.location <= start.location {
                        continue;
                    }
                    match self.path_segment(
                        &start.reference_id,
                        [start.location, end.location],
                        form_of_way,
                    ) {
                        Some(segment) => vec![segment],
                        None => continue,
                    }
                } else {
                    if route_queries >= self.config.max_route_queries {
                        continue;
                    }
                    route_queries += 1;
                    match self.routed_segments(start, end, feature.length, form_of_way) {
                        Some(segments) => segments,
                        None => continue,
                    }
                };

                let mut candidate = PathCandidate {
                    match_type: MatchType::Direct,
                    score: 0.0,
                    confidence: None,
                    start_point: start.clone(),
                    end_point: end.clone(),
                    segments,
                    original_feature: directed.clone(),
                    original_feature_length: feature.length,
                    matched_path: None,
                    side_of_street: self.resolve_side(start, end),
                };
                candidate.compute_score();
                results.push(candidate);
            }
        }

        if route_queries >= self.config.max_route_queries {
            debug!(
                "[Matcher] route query cap ({}) reached for {} x {} candidates",
                self.config.max_route_queries,
                starts.len(),
                ends.len()
            );
        }

        rank_paths(&mut results);
        Ok(results)
    }

    /// Best match(es) for a line, with geometry materialised.
    ///
    /// Matches the line's own direction, and with `ignore_direction` also the
    /// reverse. When both directions match along the same street both are
    /// returned (forward first); otherwise only the preferred one.
    pub fn match_line(
        &self,
        line: &LineString,
        form_of_way: Option<&[FormOfWay]>,
    ) -> Result<Vec<PathCandidate>> {
        let forward = self
            .match_directed(line, Direction::Forward, form_of_way)?
            .into_iter()
            .next();
        let backward = if self.config.ignore_direction {
            self.match_directed(line, Direction::Backward, form_of_way)?
                .into_iter()
                .next()
        } else {
            None
        };

        let mut chosen = reconcile(forward, backward, self.config.bearing_tolerance);
        for candidate in &mut chosen {
            self.materialize(candidate);
        }
        Ok(chosen)
    }

    fn routed_segments(
        &self,
        start: &PointCandidate,
        end: &PointCandidate,
        target_length: f64,
        form_of_way: Option<&[FormOfWay]>,
    ) -> Option<Vec<PathSegment>> {
        let route = self.index.route(
            &start.reference_id,
            start.location,
            &end.reference_id,
            end.location,
            end.point_on_line,
            target_length,
            self.config.length_tolerance,
        )?;

        let mut segments = Vec::with_capacity(route.len());
        for reference_id in &route {
            let section = if *reference_id == start.reference_id {
                [start.location, start.reference_length]
            } else if *reference_id == end.reference_id {
                [0.0, end.location]
            } else {
                [0.0, f64::INFINITY]
            };
            let segment = self.path_segment(reference_id, section, form_of_way)?;
            if segment.length() > 0.0 {
                segments.push(segment);
            }
        }

        if segments.is_empty() {
            None
        } else {
            Some(segments)
        }
    }

    // ========================================================================
    // Trace Matching
    // ========================================================================

    /// Path over the ordered references an engine matched `trace` onto.
    pub(crate) fn assemble_trace(
        &self,
        trace: &LineString,
        reference_ids: &[String],
        confidence: f64,
    ) -> Option<PathCandidate> {
        let first_id = reference_ids.first()?;
        let last_id = reference_ids.last()?;
        let start = self
            .candidates
            .project_onto_reference(*trace.0.first()?, first_id)?;
        let end = self
            .candidates
            .project_onto_reference(*trace.0.last()?, last_id)?;

        let mut segments = Vec::with_capacity(reference_ids.len());
        if reference_ids.len() == 1 {
            if end.location <= start.location {
                return None;
            }
            segments.push(self.path_segment(first_id, [start.location, end.location], None)?);
        } else {
            let last = reference_ids.len() - 1;
            for (i, reference_id) in reference_ids.iter().enumerate() {
                let section = if i == 0 {
                    [start.location, f64::INFINITY]
                } else if i == last {
                    [0.0, end.location]
                } else {
                    [0.0, f64::INFINITY]
                };
                if let Some(segment) = self.path_segment(reference_id, section, None) {
                    segments.push(segment);
                }
            }
        }

        if self.config.snap_intersections {
            snap_to_intersections(&mut segments, self.config.search_radius);
        }
        segments.retain(|s| s.length() > 0.0);
        if segments.is_empty() {
            return None;
        }

        let mut candidate = PathCandidate {
            match_type: MatchType::Hmm,
            score: 0.0,
            confidence: Some(confidence),
            start_point: start,
            end_point: end,
            segments,
            original_feature: trace.clone(),
            original_feature_length: geometry::line_length(trace),
            matched_path: None,
            side_of_street: self.config.snap_side_of_street,
        };
        candidate.compute_score();
        self.materialize(&mut candidate);
        Some(candidate)
    }

    // ========================================================================
    // Shared Helpers
    // ========================================================================

    /// Fill segment geometries and the combined matched path.
    ///
    /// Segments are offset toward the candidate's side of street when it is
    /// known, falling back to the centreline slice.
    pub fn materialize(&self, candidate: &mut PathCandidate) {
        let offset = candidate
            .side_of_street
            .signed_offset(self.config.lateral_offset)
            .filter(|o| *o != 0.0);

        let mut lines = Vec::with_capacity(candidate.segments.len());
        for segment in &mut candidate.segments {
            let [start, end] = segment.section;
            let geometry = offset
                .and_then(|o| self.index.slice(&segment.reference_id, start, end, Some(o)))
                .or_else(|| self.index.slice(&segment.reference_id, start, end, None));
            if let Some(line) = geometry {
                lines.push(line.clone());
                segment.geometry = Some(line);
            }
        }
        candidate.matched_path = Some(MultiLineString::new(lines));
    }

    /// Segment for a reference with `section` clamped into the reference.
    fn path_segment(
        &self,
        reference_id: &str,
        section: [f64; 2],
        form_of_way: Option<&[FormOfWay]>,
    ) -> Option<PathSegment> {
        let context = self.index.reference_context(reference_id)?;
        if let Some(allowed) = form_of_way {
            if !allowed.contains(&context.reference.form_of_way) {
                return None;
            }
        }

        let length = context.reference.length();
        let start = section[0].clamp(0.0, length);
        let end = section[1].clamp(start, length);

        Some(PathSegment {
            reference_id: reference_id.to_string(),
            segment_id: context.segment.id.clone(),
            road_class: context.segment.road_class,
            from_intersection_id: context
                .reference
                .from_intersection_id()
                .unwrap_or_default()
                .to_string(),
            to_intersection_id: context
                .reference
                .to_intersection_id()
                .unwrap_or_default()
                .to_string(),
            streetname: self.index.street_name(&context.segment.id),
            reference_length: length,
            section: [start, end],
            direction: context.direction,
            geometry: None,
        })
    }

    /// Side of street shared by both ends of a path, when it can be trusted.
    fn resolve_side(&self, start: &PointCandidate, end: &PointCandidate) -> SideOfStreet {
        let preferred = self.config.snap_side_of_street;
        if start.intercept_angle < 180.0
            && end.intercept_angle < 180.0
            && (preferred == SideOfStreet::Right || start.oneway)
        {
            SideOfStreet::Right
        } else if start.intercept_angle > 180.0
            && end.intercept_angle > 180.0
            && (preferred == SideOfStreet::Left || start.oneway)
        {
            SideOfStreet::Left
        } else {
            SideOfStreet::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: &str, length: f64, section: [f64; 2]) -> PathSegment {
        PathSegment {
            reference_id: format!("ref-{}", id),
            segment_id: id.to_string(),
            road_class: RoadClass::Residential,
            from_intersection_id: "a".to_string(),
            to_intersection_id: "b".to_string(),
            streetname: None,
            reference_length: length,
            section,
            direction: Direction::Forward,
            geometry: None,
        }
    }

    fn point(location: f64) -> PointCandidate {
        PointCandidate {
            search_point: Coord { x: 0.0, y: 0.0 },
            point_on_line: Coord { x: 0.0, y: 0.0 },
            snapped_point: None,
            segment_id: "s".to_string(),
            reference_id: "r".to_string(),
            road_class: RoadClass::Residential,
            direction: Direction::Forward,
            reference_length: 100.0,
            location,
            bearing: 0.0,
            intercept_angle: 90.0,
            side_of_street: SideOfStreet::Right,
            oneway: false,
            distance: 3.0,
            score: 3.0,
        }
    }

    fn path(segments: Vec<PathSegment>) -> PathCandidate {
        PathCandidate {
            match_type: MatchType::Direct,
            score: 0.0,
            confidence: None,
            start_point: point(10.0),
            end_point: point(90.0),
            segments,
            original_feature: LineString::new(vec![]),
            original_feature_length: 200.0,
            matched_path: None,
            side_of_street: SideOfStreet::Unknown,
        }
    }

    #[test]
    fn test_path_length_accounting() {
        let mut candidate = path(vec![
            segment("a", 100.0, [40.0, 100.0]),
            segment("b", 80.0, [0.0, 80.0]),
            segment("c", 120.0, [0.0, 55.5]),
        ]);
        assert!((candidate.path_length() - 195.5).abs() < 1e-9);
        assert!((candidate.length_delta() + 4.5).abs() < 1e-9);

        candidate.compute_score();
        let expected = geometry::rmse(&[3.0, 3.0, -4.5]) + 0.3;
        assert!((candidate.score - expected).abs() < 1e-9);

        candidate.match_type = MatchType::Hmm;
        candidate.compute_score();
        assert!((candidate.score - geometry::rmse(&[3.0, 3.0, -4.5])).abs() < 1e-9);
    }

    #[test]
    fn test_colinear_ignores_order() {
        let a = path(vec![segment("x", 100.0, [0.0, 100.0]), segment("y", 50.0, [0.0, 20.0])]);
        let b = path(vec![segment("y", 50.0, [10.0, 50.0]), segment("x", 100.0, [0.0, 60.0])]);
        let c = path(vec![segment("x", 100.0, [0.0, 100.0])]);
        assert!(a.is_colinear(&b));
        assert!(!a.is_colinear(&c));
    }

    #[test]
    fn test_snap_extends_near_ends_and_fills_interior() {
        let mut segments = vec![
            segment("a", 100.0, [4.0, 100.0]),
            segment("b", 80.0, [10.0, 70.0]),
            segment("c", 120.0, [0.0, 114.0]),
        ];
        snap_to_intersections(&mut segments, 10.0);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].section, [0.0, 100.0]);
        assert_eq!(segments[1].section, [0.0, 80.0]);
        assert_eq!(segments[2].section, [0.0, 120.0]);
    }

    #[test]
    fn test_snap_drops_short_stubs() {
        let mut segments = vec![
            segment("a", 100.0, [95.0, 100.0]),
            segment("b", 80.0, [0.0, 80.0]),
            segment("c", 120.0, [0.0, 3.0]),
        ];
        snap_to_intersections(&mut segments, 10.0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].segment_id, "b");
    }

    #[test]
    fn test_snap_skips_short_matches() {
        let mut segments = vec![segment("a", 100.0, [40.0, 45.0])];
        snap_to_intersections(&mut segments, 10.0);
        assert_eq!(segments[0].section, [40.0, 45.0]);
    }

    /// Direct candidate on `segment_id` running from `from` to `to`.
    fn directed(
        segment_id: &str,
        from: Coord,
        to: Coord,
        side: SideOfStreet,
        score: f64,
    ) -> PathCandidate {
        let mut candidate = path(vec![segment(segment_id, 100.0, [0.0, 100.0])]);
        candidate.start_point.point_on_line = from;
        candidate.end_point.point_on_line = to;
        candidate.side_of_street = side;
        candidate.score = score;
        candidate
    }

    const SOUTH: Coord = Coord { x: 0.0, y: 0.0 };
    const NORTH: Coord = Coord { x: 0.0, y: 0.001 };
    const EAST: Coord = Coord { x: 0.001, y: 0.0 };

    #[test]
    fn test_reconcile_keeps_parallel_directions() {
        let forward = directed("x", SOUTH, NORTH, SideOfStreet::Unknown, 4.0);
        let backward = directed("y", NORTH, SOUTH, SideOfStreet::Unknown, 2.0);
        let kept = reconcile(Some(forward), Some(backward), 15.0);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].segments[0].segment_id, "x");
        assert_eq!(kept[1].segments[0].segment_id, "y");
    }

    #[test]
    fn test_reconcile_prefers_a_known_side() {
        let forward = directed("x", SOUTH, NORTH, SideOfStreet::Unknown, 1.0);
        let backward = directed("y", SOUTH, EAST, SideOfStreet::Left, 9.0);
        let kept = reconcile(Some(forward.clone()), Some(backward.clone()), 15.0);
        assert_eq!(kept, vec![backward.clone()]);

        let forward = directed("x", SOUTH, NORTH, SideOfStreet::Right, 9.0);
        let backward = directed("y", SOUTH, EAST, SideOfStreet::Unknown, 1.0);
        let kept = reconcile(Some(forward.clone()), Some(backward), 15.0);
        assert_eq!(kept, vec![forward]);
    }

    #[test]
    fn test_reconcile_falls_back_to_score() {
        let forward = directed("x", SOUTH, NORTH, SideOfStreet::Unknown, 5.0);
        let backward = directed("y", SOUTH, EAST, SideOfStreet::Unknown, 3.0);
        assert!(!forward.is_parallel(&backward, 15.0));
        assert!(!forward.is_colinear(&backward));
        let kept = reconcile(Some(forward), Some(backward.clone()), 15.0);
        assert_eq!(kept, vec![backward]);

        // Both sides known behaves the same
        let forward = directed("x", SOUTH, NORTH, SideOfStreet::Right, 2.0);
        let backward = directed("y", SOUTH, EAST, SideOfStreet::Left, 3.0);
        let kept = reconcile(Some(forward.clone()), Some(backward), 15.0);
        assert_eq!(kept, vec![forward]);
    }

    #[test]
    fn test_reconcile_ties_go_forward() {
        let forward = directed("x", SOUTH, NORTH, SideOfStreet::Unknown, 3.0);
        let backward = directed("y", SOUTH, EAST, SideOfStreet::Unknown, 3.0);
        let kept = reconcile(Some(forward.clone()), Some(backward.clone()), 15.0);
        assert_eq!(kept, vec![forward]);

        assert_eq!(reconcile(None, Some(backward.clone()), 15.0), vec![backward]);
        assert!(reconcile(None, None, 15.0).is_empty());
    }
}
