//! Point candidate generation.
//!
//! A search point is projected onto every nearby segment once, and each
//! projection yields up to two candidates: one per reference (forward and,
//! for two-way streets, backward). Candidates carry the linear location along
//! their reference, the street bearing at the projection and the side of the
//! street the search point lies on.

use std::cmp::Ordering;
use std::sync::Arc;

use geo::{Coord, LineString};

use crate::error::Result;
use crate::geometry::{self, NearestPoint};
use crate::tile_index::TileIndex;
use crate::tiles::TileType;
use crate::types::{Direction, RoadClass, Segment, SideOfStreet};
use crate::MatchConfig;

/// A search point resolved onto one directed reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCandidate {
    pub search_point: Coord,
    pub point_on_line: Coord,
    /// Intersection coordinate when the candidate was snapped to an endpoint
    pub snapped_point: Option<Coord>,
    pub segment_id: String,
    pub reference_id: String,
    pub road_class: RoadClass,
    pub direction: Direction,
    /// Reference length in metres
    pub reference_length: f64,
    /// Metres from the reference start
    pub location: f64,
    /// Street bearing at the projection, in the reference direction
    pub bearing: f64,
    /// Bearing to the search point relative to the street bearing
    pub intercept_angle: f64,
    pub side_of_street: SideOfStreet,
    pub oneway: bool,
    /// Distance from the search point to the street (metres)
    pub distance: f64,
    /// Metres, lower is better
    pub score: f64,
}

impl PointCandidate {
    pub fn is_snapped(&self) -> bool {
        self.snapped_point.is_some()
    }
}

/// Produces scored point candidates from the tile index.
#[derive(Clone)]
pub struct CandidateGenerator {
    index: Arc<TileIndex>,
    config: MatchConfig,
}

impl CandidateGenerator {
    pub fn new(index: Arc<TileIndex>, config: MatchConfig) -> Self {
        Self { index, config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Ranked candidates for `point`, at most `max_candidates`.
    ///
    /// A `bearing` (degrees) rejects streets whose direction differs by the
    /// bearing tolerance or more.
    pub fn point_candidates(
        &self,
        point: Coord,
        bearing: Option<f64>,
        max_candidates: usize,
    ) -> Result<Vec<PointCandidate>> {
        let radius = self.config.search_radius;
        let hits = self.index.nearby(point, TileType::Geometry, radius)?;

        let mut candidates = Vec::new();
        for hit in hits {
            let Some(segment) = self.index.segment(&hit.id) else {
                continue;
            };
            let Some(line) = hit.as_line() else {
                continue;
            };
            let Some(nearest) = geometry::nearest_point_on_line(line, point) else {
                continue;
            };
            if nearest.distance >= radius {
                continue;
            }

            for direction in [Direction::Forward, Direction::Backward] {
                let Some(candidate) = self.project(point, &nearest, &segment, line, direction)
                else {
                    continue;
                };
                if let Some(b) = bearing {
                    if geometry::angle_delta(b, candidate.bearing) >= self.config.bearing_tolerance
                    {
                        continue;
                    }
                }
                if self.config.snap_intersections {
                    if let Some(snapped) = self.snap_to_endpoint(&candidate, line) {
                        candidates.push(snapped);
                    }
                }
                candidates.push(candidate);
            }
        }

        self.rank(&mut candidates);
        candidates.truncate(max_candidates);
        Ok(candidates)
    }

    /// Project a point onto a specific reference without radius or bearing
    /// filtering. Used to anchor trace matches on known references.
    pub fn project_onto_reference(&self, point: Coord, reference_id: &str) -> Option<PointCandidate> {
        let context = self.index.reference_context(reference_id)?;
        let line = context.segment.line();
        let nearest = geometry::nearest_point_on_line(&line, point)?;
        self.project(point, &nearest, &context.segment, &line, context.direction)
    }

    /// Shared projection for both directions of a segment.
    fn project(
        &self,
        point: Coord,
        nearest: &NearestPoint,
        segment: &Segment,
        line: &LineString,
        direction: Direction,
    ) -> Option<PointCandidate> {
        let reference_id = segment.reference_id(direction)?;
        let reference = self.index.reference(reference_id)?;
        let reference_length = reference.length();

        let coords = &line.0;
        if coords.len() < 2 {
            return None;
        }
        let i = nearest.index.min(coords.len() - 2);
        let mut line_bearing = geometry::bearing(coords[i], coords[i + 1]);
        if direction == Direction::Backward {
            line_bearing += 180.0;
        }
        let line_bearing = geometry::normalize_angle(line_bearing);

        let location = match direction {
            Direction::Forward => nearest.location,
            Direction::Backward => reference_length - nearest.location,
        }
        .clamp(0.0, reference_length);

        let intercept_bearing = geometry::bearing(nearest.coord, point);
        let intercept_angle = geometry::normalize_angle(intercept_bearing - line_bearing);

        Some(PointCandidate {
            search_point: point,
            point_on_line: nearest.coord,
            snapped_point: None,
            segment_id: segment.id.clone(),
            reference_id: reference_id.to_string(),
            road_class: segment.road_class,
            direction,
            reference_length,
            location,
            bearing: line_bearing,
            intercept_angle,
            side_of_street: SideOfStreet::from_intercept_angle(intercept_angle),
            oneway: segment.is_oneway(),
            distance: nearest.distance,
            score: nearest.distance,
        })
    }

    /// Duplicate of `candidate` pinned to its nearer reference endpoint, if
    /// that endpoint is within the search radius.
    fn snap_to_endpoint(&self, candidate: &PointCandidate, line: &LineString) -> Option<PointCandidate> {
        let to_start = candidate.location;
        let to_end = candidate.reference_length - candidate.location;
        let at_start = to_start <= to_end;
        if to_start.min(to_end) >= self.config.search_radius {
            return None;
        }

        // Reference start is the geometry start going forward, its end going backward
        let use_first = at_start == (candidate.direction == Direction::Forward);
        let snapped = if use_first {
            *line.0.first()?
        } else {
            *line.0.last()?
        };

        let snap_distance = geometry::distance(candidate.search_point, snapped);
        Some(PointCandidate {
            snapped_point: Some(snapped),
            location: if at_start {
                0.0
            } else {
                candidate.reference_length
            },
            score: (candidate.distance + snap_distance) / 2.0,
            ..candidate.clone()
        })
    }

    /// Ascending score; ties go to the traffic side.
    fn rank(&self, candidates: &mut [PointCandidate]) {
        let preferred = self.config.traffic_side();
        candidates.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    let ra = (a.side_of_street != preferred) as u8;
                    let rb = (b.side_of_street != preferred) as u8;
                    ra.cmp(&rb)
                })
        });
    }
}
