//! Batch matching with per-feature failure isolation.
//!
//! Input is GeoJSON-shaped `serde_json::Value`. It is first cleaned into
//! matchable features plus the inputs that can never match. Every feature is
//! then matched on its own: errors and panics from one feature route that
//! feature to `unmatched` and never abort the batch, so a run always ends
//! with a partition of its input into matched, unmatched and invalid.

use std::panic::{self, AssertUnwindSafe};

use geo::{Coord, Geometry, LineString, Point};
use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::candidates::PointCandidate;
use crate::error::Result;
use crate::geometry;
use crate::matching::{Matcher, PathCandidate};
use crate::types::FormOfWay;

#[cfg(feature = "persistence")]
use crate::graph::Graph;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Property consulted for point bearings by default.
pub const DEFAULT_BEARING_PROPERTY: &str = "bearing";

// ============================================================================
// Input Cleaning
// ============================================================================

/// A line feature ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct LineFeature {
    pub line: LineString,
    pub properties: Map<String, Value>,
}

/// A point feature ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct PointFeature {
    pub point: Coord,
    pub properties: Map<String, Value>,
}

fn parse_position(value: &Value) -> Option<Coord> {
    let array = value.as_array()?;
    let x = array.first()?.as_f64()?;
    let y = array.get(1)?.as_f64()?;
    if x.is_finite() && y.is_finite() {
        Some(Coord { x, y })
    } else {
        None
    }
}

fn parse_positions(value: &Value) -> Option<Vec<Coord>> {
    value.as_array()?.iter().map(parse_position).collect()
}

fn properties_of(feature: &Value) -> Map<String, Value> {
    feature
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Flatten a GeoJSON object into `Feature` values.
fn input_features(input: &Value, geometry_types: &[&str]) -> (Vec<Value>, Vec<Value>) {
    let wrap = |geometry: &Value| json!({"type": "Feature", "properties": {}, "geometry": geometry});
    match input.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            let features = input
                .get("features")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            (features, Vec::new())
        }
        Some("Feature") => (vec![input.clone()], Vec::new()),
        Some("GeometryCollection") => {
            let features = input
                .get("geometries")
                .and_then(Value::as_array)
                .map(|geometries| geometries.iter().map(wrap).collect())
                .unwrap_or_default();
            (features, Vec::new())
        }
        Some(t) if geometry_types.contains(&t) => (vec![wrap(input)], Vec::new()),
        _ => (Vec::new(), vec![input.clone()]),
    }
}

fn line_feature_value(coords: &[Coord], properties: &Map<String, Value>) -> Value {
    json!({
        "type": "Feature",
        "properties": properties,
        "geometry": line_geometry_value(coords),
    })
}

fn line_geometry_value(coords: &[Coord]) -> Value {
    let coordinates: Vec<[f64; 2]> = coords.iter().map(|c| [c.x, c.y]).collect();
    json!({"type": "LineString", "coordinates": coordinates})
}

/// Line input partitioned into matchable lines and invalid inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanedLines {
    pub clean: Vec<LineFeature>,
    pub invalid: Vec<Value>,
}

impl CleanedLines {
    /// Accepts a FeatureCollection, Feature, GeometryCollection or a bare
    /// LineString/MultiLineString.
    ///
    /// Multi-line parts that continue one another are merged; disjoint parts
    /// become separate lines. Lines with fewer than two positions are invalid.
    pub fn from_geojson(input: &Value) -> Self {
        let mut cleaned = CleanedLines::default();
        let (features, invalid) = input_features(input, &["LineString", "MultiLineString"]);
        cleaned.invalid.extend(invalid);

        for feature in features {
            let properties = properties_of(&feature);
            let geometry = feature.get("geometry");
            let kind = geometry.and_then(|g| g.get("type")).and_then(Value::as_str);
            let coordinates = geometry.and_then(|g| g.get("coordinates"));

            match (kind, coordinates) {
                (Some("LineString"), Some(coordinates)) => match parse_positions(coordinates) {
                    Some(coords) => cleaned.push_line(coords, &properties),
                    None => cleaned.invalid.push(feature.clone()),
                },
                (Some("MultiLineString"), Some(coordinates)) => {
                    let parts: Option<Vec<Vec<Coord>>> = coordinates
                        .as_array()
                        .map(|parts| parts.iter().map(parse_positions).collect())
                        .unwrap_or(None);
                    match parts {
                        Some(parts) if !parts.is_empty() => cleaned.push_multi_line(parts, &properties),
                        _ => cleaned.invalid.push(feature.clone()),
                    }
                }
                _ => cleaned.invalid.push(feature.clone()),
            }
        }
        cleaned
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from_geojson(&value))
    }

    fn push_line(&mut self, coords: Vec<Coord>, properties: &Map<String, Value>) {
        if coords.len() > 1 {
            self.clean.push(LineFeature {
                line: LineString::new(coords),
                properties: properties.clone(),
            });
        } else {
            self.invalid.push(line_feature_value(&coords, properties));
        }
    }

    fn push_multi_line(&mut self, parts: Vec<Vec<Coord>>, properties: &Map<String, Value>) {
        let mut current: Vec<Coord> = Vec::new();
        for part in parts {
            if current.is_empty() {
                current = part;
            } else if current.last() == part.first() {
                current.pop();
                current.extend(part);
            } else {
                let finished = std::mem::replace(&mut current, part);
                self.push_line(finished, properties);
            }
        }
        if !current.is_empty() {
            self.push_line(current, properties);
        }
    }

    pub fn len(&self) -> usize {
        self.clean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clean.is_empty()
    }
}

/// Point input partitioned into matchable points and invalid inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanedPoints {
    pub clean: Vec<PointFeature>,
    pub invalid: Vec<Value>,
}

impl CleanedPoints {
    pub fn from_geojson(input: &Value) -> Self {
        let mut cleaned = CleanedPoints::default();
        let (features, invalid) = input_features(input, &["Point"]);
        cleaned.invalid.extend(invalid);

        for feature in features {
            let geometry = feature.get("geometry");
            let is_point = geometry.and_then(|g| g.get("type")).and_then(Value::as_str) == Some("Point");
            let point = geometry
                .and_then(|g| g.get("coordinates"))
                .and_then(parse_position);
            match point {
                Some(point) if is_point => cleaned.clean.push(PointFeature {
                    point,
                    properties: properties_of(&feature),
                }),
                _ => cleaned.invalid.push(feature.clone()),
            }
        }
        cleaned
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from_geojson(&value))
    }

    pub fn len(&self) -> usize {
        self.clean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clean.is_empty()
    }
}

// ============================================================================
// Results
// ============================================================================

/// A matched input feature with its source properties.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedFeature<T> {
    pub properties: Map<String, Value>,
    pub result: T,
}

/// An input feature that produced no match, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct UnmatchedFeature {
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
    pub reason: String,
}

/// Partition of a batch's input.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T> {
    pub matched: Vec<MatchedFeature<T>>,
    pub unmatched: Vec<UnmatchedFeature>,
    pub invalid: Vec<Value>,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            matched: Vec::new(),
            unmatched: Vec::new(),
            invalid: Vec::new(),
        }
    }
}

impl<T> BatchResult<T> {
    fn push(&mut self, outcome: Outcome<T>) {
        match outcome {
            Outcome::Matched(m) => self.matched.push(m),
            Outcome::Unmatched(u) => self.unmatched.push(u),
        }
    }

    /// Unmatched features as a GeoJSON FeatureCollection.
    pub fn unmatched_geojson(&self) -> Value {
        let features: Vec<Value> = self
            .unmatched
            .iter()
            .map(|u| {
                let mut properties = u.properties.clone();
                properties.insert("reason".to_string(), json!(u.reason));
                let geometry = match &u.geometry {
                    Geometry::Point(p) => json!({"type": "Point", "coordinates": [p.x(), p.y()]}),
                    Geometry::LineString(line) => line_geometry_value(&line.0),
                    _ => Value::Null,
                };
                json!({"type": "Feature", "properties": properties, "geometry": geometry})
            })
            .collect();
        json!({"type": "FeatureCollection", "features": features})
    }
}

impl BatchResult<PathCandidate> {
    /// One feature per matched segment geometry.
    pub fn matched_geojson(&self) -> Value {
        let mut features = Vec::new();
        for matched in &self.matched {
            let candidate = &matched.result;
            for segment in &candidate.segments {
                let Some(line) = &segment.geometry else {
                    continue;
                };
                let mut properties = matched.properties.clone();
                properties.insert("referenceId".to_string(), json!(segment.reference_id));
                properties.insert("segmentId".to_string(), json!(segment.segment_id));
                properties.insert("fromIntersectionId".to_string(), json!(segment.from_intersection_id));
                properties.insert("toIntersectionId".to_string(), json!(segment.to_intersection_id));
                properties.insert("roadClass".to_string(), json!(segment.road_class));
                properties.insert("direction".to_string(), json!(segment.direction));
                properties.insert("referenceLength".to_string(), json!(segment.reference_length));
                properties.insert("section".to_string(), json!(segment.section));
                properties.insert("streetname".to_string(), json!(segment.streetname));
                properties.insert("side".to_string(), json!(candidate.side_of_street));
                properties.insert("score".to_string(), json!(candidate.score));
                properties.insert("matchType".to_string(), json!(candidate.match_type));
                features.push(json!({
                    "type": "Feature",
                    "properties": properties,
                    "geometry": line_geometry_value(&line.0),
                }));
            }
        }
        json!({"type": "FeatureCollection", "features": features})
    }
}

enum Outcome<T> {
    Matched(MatchedFeature<T>),
    Unmatched(UnmatchedFeature),
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic while matching".to_string()
    }
}

/// Run one feature's match, converting errors and panics into a reason.
fn isolate<T>(f: impl FnOnce() -> Result<Vec<T>>) -> std::result::Result<Vec<T>, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(results)) => Ok(results),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload)),
    }
}

fn outcomes<T>(
    results: std::result::Result<Vec<T>, String>,
    geometry: Geometry,
    properties: &Map<String, Value>,
) -> Vec<Outcome<T>> {
    let unmatched = |reason: String| {
        Outcome::Unmatched(UnmatchedFeature {
            geometry: geometry.clone(),
            properties: properties.clone(),
            reason,
        })
    };
    match results {
        Ok(results) if results.is_empty() => vec![unmatched("no match".to_string())],
        Ok(results) => results
            .into_iter()
            .map(|result| {
                Outcome::Matched(MatchedFeature {
                    properties: properties.clone(),
                    result,
                })
            })
            .collect(),
        Err(reason) => {
            warn!("[Batch] Feature failed to match: {}", reason);
            vec![unmatched(reason)]
        }
    }
}

// ============================================================================
// Line Splitting
// ============================================================================

/// Split a line into equal parts no longer than `max_length`.
///
/// Each part starts exactly where the previous one ended.
pub fn split_line(line: &LineString, max_length: f64) -> Vec<LineString> {
    let length = geometry::line_length(line);
    if length <= max_length || max_length <= 0.0 {
        return vec![line.clone()];
    }

    let count = (length / max_length).ceil() as usize;
    let part_length = length / count as f64;
    let mut parts: Vec<LineString> = Vec::with_capacity(count);
    for i in 0..count {
        let Some(mut part) =
            geometry::slice_along(line, part_length * i as f64, part_length * (i + 1) as f64)
        else {
            continue;
        };
        if let Some(previous_end) = parts.last().and_then(|p| p.0.last().copied()) {
            part.0[0] = previous_end;
        }
        parts.push(part);
    }
    parts
}

/// Form-of-way filter from `properties.filterParameters.formOfWay`.
fn form_of_way_filter(properties: &Map<String, Value>) -> Option<Vec<FormOfWay>> {
    let values = properties
        .get("filterParameters")?
        .get("formOfWay")?
        .as_array()?;
    let filter: Vec<FormOfWay> = values
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_u64().map(|code| FormOfWay::from_code(code as u8)),
            other => serde_json::from_value(other.clone()).ok(),
        })
        .collect();
    if filter.is_empty() {
        None
    } else {
        Some(filter)
    }
}

// ============================================================================
// Batch Operations
// ============================================================================

fn match_line_feature(matcher: &Matcher, feature: &LineFeature) -> Vec<Outcome<PathCandidate>> {
    let filter = form_of_way_filter(&feature.properties);
    split_line(&feature.line, matcher.config().max_feature_length)
        .into_iter()
        .flat_map(|part| {
            let results = isolate(|| matcher.match_line(&part, filter.as_deref()));
            outcomes(results, Geometry::LineString(part), &feature.properties)
        })
        .collect()
}

/// Collect per-feature outcomes into a batch partition.
fn partition<T>(invalid: &[Value], outcomes: impl IntoIterator<Item = Outcome<T>>) -> BatchResult<T> {
    let mut result = BatchResult {
        invalid: invalid.to_vec(),
        ..BatchResult::default()
    };
    for outcome in outcomes {
        result.push(outcome);
    }
    result
}

/// Direct-match every line. Long lines are split first.
pub fn match_lines(matcher: &Matcher, lines: &CleanedLines) -> BatchResult<PathCandidate> {
    let result = partition(
        &lines.invalid,
        lines.clean.iter().flat_map(|f| match_line_feature(matcher, f)),
    );
    debug!(
        "[Batch] {} lines: {} matched, {} unmatched, {} invalid",
        lines.clean.len(),
        result.matched.len(),
        result.unmatched.len(),
        result.invalid.len()
    );
    result
}

/// [`match_lines`] across the rayon thread pool. Output order follows input.
#[cfg(feature = "parallel")]
pub fn match_lines_parallel(matcher: &Matcher, lines: &CleanedLines) -> BatchResult<PathCandidate> {
    let per_feature: Vec<Vec<Outcome<PathCandidate>>> = lines
        .clean
        .par_iter()
        .map(|feature| match_line_feature(matcher, feature))
        .collect();
    partition(&lines.invalid, per_feature.into_iter().flatten())
}

/// Match every point, reading an optional bearing from `bearing_property`.
pub fn match_points(
    matcher: &Matcher,
    points: &CleanedPoints,
    bearing_property: Option<&str>,
) -> BatchResult<PointCandidate> {
    let field = bearing_property.unwrap_or(DEFAULT_BEARING_PROPERTY);
    partition(
        &points.invalid,
        points.clean.iter().flat_map(|feature| {
            let bearing = feature.properties.get(field).and_then(Value::as_f64);
            let results = isolate(|| {
                matcher
                    .match_point(feature.point, bearing)
                    .map(|c| c.into_iter().collect())
            });
            outcomes(results, Geometry::Point(Point(feature.point)), &feature.properties)
        }),
    )
}

/// HMM-match every line through a built graph.
#[cfg(feature = "persistence")]
pub fn match_traces(graph: &Graph, lines: &CleanedLines) -> BatchResult<PathCandidate> {
    partition(
        &lines.invalid,
        lines.clean.iter().flat_map(|feature| {
            let results = isolate(|| graph.match_trace(&feature.line).map(|c| c.into_iter().collect()));
            outcomes(results, Geometry::LineString(feature.line.clone()), &feature.properties)
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MatchError;

    #[test]
    fn test_from_json_text() {
        let lines = CleanedLines::from_json(
            r#"{"type": "LineString", "coordinates": [[0.0, 0.0], [0.0, 0.001]]}"#,
        )
        .unwrap();
        assert_eq!(lines.len(), 1);
        assert!(matches!(
            CleanedPoints::from_json("{not json"),
            Err(MatchError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_clean_lines_partition() {
        let input = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"id": 1},
                 "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [0.0, 0.001]]}},
                {"type": "Feature", "properties": {"id": 2},
                 "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0]]}},
                {"type": "Feature", "properties": {"id": 3},
                 "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}}
            ]
        });
        let cleaned = CleanedLines::from_geojson(&input);
        assert_eq!(cleaned.clean.len(), 1);
        assert_eq!(cleaned.clean[0].properties["id"], json!(1));
        assert_eq!(cleaned.invalid.len(), 2);
    }

    #[test]
    fn test_multi_line_merge_and_split() {
        let continuous = json!({
            "type": "MultiLineString",
            "coordinates": [[[0.0, 0.0], [0.0, 0.001]], [[0.0, 0.001], [0.0, 0.002]]]
        });
        let cleaned = CleanedLines::from_geojson(&continuous);
        assert_eq!(cleaned.clean.len(), 1);
        assert_eq!(cleaned.clean[0].line.0.len(), 3);

        let disjoint = json!({
            "type": "MultiLineString",
            "coordinates": [[[0.0, 0.0], [0.0, 0.001]], [[0.1, 0.1], [0.1, 0.2]]]
        });
        let cleaned = CleanedLines::from_geojson(&disjoint);
        assert_eq!(cleaned.clean.len(), 2);
    }

    #[test]
    fn test_unknown_input_is_invalid() {
        let cleaned = CleanedLines::from_geojson(&json!({"type": "Polygon", "coordinates": []}));
        assert!(cleaned.is_empty());
        assert_eq!(cleaned.invalid.len(), 1);

        let points = CleanedPoints::from_geojson(&json!({"type": "Point", "coordinates": [1.0, 2.0]}));
        assert_eq!(points.clean.len(), 1);
        assert_eq!(points.clean[0].point, Coord { x: 1.0, y: 2.0 });
    }

    #[test]
    fn test_split_line_parts_are_continuous() {
        let line = LineString::new(vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 0.3 }]);
        let length = geometry::line_length(&line);
        let parts = split_line(&line, 15_000.0);
        assert_eq!(parts.len(), (length / 15_000.0).ceil() as usize);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].0.last(), pair[1].0.first());
        }
        let total: f64 = parts.iter().map(geometry::line_length).sum();
        assert!((total - length).abs() < 1.0);
    }

    #[test]
    fn test_form_of_way_filter() {
        let properties = json!({"filterParameters": {"formOfWay": [3, "Roundabout"]}});
        let filter = form_of_way_filter(properties.as_object().unwrap()).unwrap();
        assert_eq!(filter, vec![FormOfWay::SingleCarriageway, FormOfWay::Roundabout]);
    }

    #[test]
    fn test_isolate_catches_panics() {
        let result: std::result::Result<Vec<u8>, String> = isolate(|| panic!("boom"));
        assert_eq!(result, Err("boom".to_string()));

        let result: std::result::Result<Vec<u8>, String> = isolate(|| {
            Err(MatchError::InvalidInput {
                message: "bad".to_string(),
            })
        });
        assert!(result.unwrap_err().contains("bad"));
    }
}
