//! # Tile Index
//!
//! Lazily populated, tile-backed store of street network records.
//!
//! The index keeps:
//! - An id index over segments, references and intersections
//! - R-trees over segment lines and intersection points
//! - Basemap metadata keyed by geometry id
//! - The reference graph used for bounded route search
//! - A cache of evenly spaced bin points per reference
//!
//! Tiles are fetched on demand the first time a spatial query touches them.
//! Loading is idempotent: a tile is fetched at most once, concurrent requests
//! for the same tile wait on the in-flight load instead of fetching again, and
//! records already present under an id are never replaced.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, RwLock};

use geo::{Coord, Geometry, LineString, Point, Rect};
use log::{debug, info, warn};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::error::{LockResultExt, MatchError, Result};
use crate::geometry;
use crate::routing::{ReferenceGraph, RouteRequest};
use crate::tiles::{TileData, TileDecoder, TileParams, TilePath, TilePathGroup, TileSource, TileType};
use crate::types::{Direction, IndexedObject, Intersection, Metadata, Reference, Segment, SideOfStreet};

/// Decimal places kept on bin points.
const BIN_PRECISION: i32 = 6;

// ============================================================================
// Spatial Entries
// ============================================================================

/// Segment line envelope stored in the R-tree.
#[derive(Debug, Clone)]
struct SegmentEntry {
    id: String,
    min: [f64; 2],
    max: [f64; 2],
}

impl SegmentEntry {
    fn new(segment: &Segment) -> Option<Self> {
        let first = segment.coordinates.first()?;
        let mut min = *first;
        let mut max = *first;
        for c in &segment.coordinates {
            min[0] = min[0].min(c[0]);
            min[1] = min[1].min(c[1]);
            max[0] = max[0].max(c[0]);
            max[1] = max[1].max(c[1]);
        }
        Some(Self {
            id: segment.id.clone(),
            min,
            max,
        })
    }
}

impl RTreeObject for SegmentEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

/// Intersection point stored in the R-tree.
#[derive(Debug, Clone)]
struct IntersectionEntry {
    id: String,
    lon: f64,
    lat: f64,
}

impl RTreeObject for IntersectionEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lon, self.lat])
    }
}

impl PointDistance for IntersectionEntry {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlon = self.lon - point[0];
        let dlat = self.lat - point[1];
        dlon * dlon + dlat * dlat
    }
}

fn aabb(rect: &Rect) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

// ============================================================================
// Public Types
// ============================================================================

/// Spatial query hit: an object id and an independent copy of its geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub geometry: Geometry,
}

impl Feature {
    pub fn as_line(&self) -> Option<&LineString> {
        match &self.geometry {
            Geometry::LineString(line) => Some(line),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<Coord> {
        match &self.geometry {
            Geometry::Point(p) => Some(p.0),
            _ => None,
        }
    }
}

/// Counts of what the index currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub tiles: usize,
    pub segments: usize,
    pub references: usize,
    pub intersections: usize,
    pub metadata: usize,
    pub cached_bins: usize,
}

/// Reference together with the segment it traverses.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceContext {
    pub reference: Reference,
    pub segment: Segment,
    pub direction: Direction,
}

impl ReferenceContext {
    /// Segment line in the reference's direction of travel.
    pub fn line(&self) -> LineString {
        let line = self.segment.line();
        match self.direction {
            Direction::Forward => line,
            Direction::Backward => geometry::reversed(&line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BinKey {
    reference_id: String,
    count: usize,
    offset_bits: u64,
    side: SideOfStreet,
}

// ============================================================================
// Tile Index
// ============================================================================

#[derive(Default)]
struct IndexState {
    tiles: HashSet<TilePath>,
    objects: HashMap<String, IndexedObject>,
    lines: HashMap<String, LineString>,
    /// Reference id -> segment id (the segment's geometry id)
    reference_segments: HashMap<String, String>,
    metadata: HashMap<String, Metadata>,
    segment_tree: RTree<SegmentEntry>,
    intersection_tree: RTree<IntersectionEntry>,
    graph: ReferenceGraph,
    bins: HashMap<BinKey, Vec<Coord>>,
}

impl IndexState {
    fn segment(&self, id: &str) -> Option<&Segment> {
        match self.objects.get(id) {
            Some(IndexedObject::Segment(s)) => Some(s),
            _ => None,
        }
    }

    fn reference(&self, id: &str) -> Option<&Reference> {
        match self.objects.get(id) {
            Some(IndexedObject::Reference(r)) => Some(r),
            _ => None,
        }
    }

    fn intersection(&self, id: &str) -> Option<&Intersection> {
        match self.objects.get(id) {
            Some(IndexedObject::Intersection(i)) => Some(i),
            _ => None,
        }
    }

    /// Segment carrying a reference, falling back to its geometry id.
    fn segment_for_reference(&self, reference: &Reference) -> Option<&Segment> {
        self.reference_segments
            .get(&reference.id)
            .and_then(|id| self.segment(id))
            .or_else(|| self.segment(&reference.geometry_id))
    }

    fn context(&self, reference_id: &str) -> Option<ReferenceContext> {
        let reference = self.reference(reference_id)?;
        let segment = self.segment_for_reference(reference)?;
        let direction = if segment.forward_reference_id == reference.id {
            Direction::Forward
        } else {
            Direction::Backward
        };
        Some(ReferenceContext {
            reference: reference.clone(),
            segment: segment.clone(),
            direction,
        })
    }

    /// Merge decoded records. Returns how many new records were inserted.
    fn merge(&mut self, data: TileData) -> usize {
        let mut inserted = 0;
        match data {
            TileData::Segments(segments) => {
                let mut entries = Vec::with_capacity(segments.len());
                for segment in segments {
                    if self.objects.contains_key(&segment.id) {
                        continue;
                    }
                    let Some(entry) = SegmentEntry::new(&segment) else {
                        warn!("[TileIndex] Skipping segment {} without coordinates", segment.id);
                        continue;
                    };
                    entries.push(entry);
                    self.reference_segments
                        .insert(segment.forward_reference_id.clone(), segment.id.clone());
                    if let Some(back) = &segment.back_reference_id {
                        self.reference_segments.insert(back.clone(), segment.id.clone());
                    }
                    self.lines.insert(segment.id.clone(), segment.line());
                    self.objects
                        .insert(segment.id.clone(), IndexedObject::Segment(segment));
                }
                inserted = entries.len();
                bulk_insert(&mut self.segment_tree, entries);
            }
            TileData::Intersections(intersections) => {
                let mut entries = Vec::with_capacity(intersections.len());
                for intersection in intersections {
                    if self.objects.contains_key(&intersection.id) {
                        continue;
                    }
                    entries.push(IntersectionEntry {
                        id: intersection.id.clone(),
                        lon: intersection.lon,
                        lat: intersection.lat,
                    });
                    self.objects.insert(
                        intersection.id.clone(),
                        IndexedObject::Intersection(intersection),
                    );
                }
                inserted = entries.len();
                bulk_insert(&mut self.intersection_tree, entries);
            }
            TileData::References(references) => {
                for reference in references {
                    if self.objects.contains_key(&reference.id) {
                        continue;
                    }
                    if let Err(e) = reference.validate() {
                        warn!("[TileIndex] Skipping reference: {}", e);
                        continue;
                    }
                    self.graph.add_reference(&reference);
                    self.objects
                        .insert(reference.id.clone(), IndexedObject::Reference(reference));
                    inserted += 1;
                }
            }
            TileData::Metadata(records) => {
                for record in records {
                    if self.metadata.contains_key(&record.geometry_id) {
                        continue;
                    }
                    self.metadata.insert(record.geometry_id.clone(), record);
                    inserted += 1;
                }
            }
        }
        inserted
    }
}

/// Bulk-load into an empty tree, insert one by one otherwise.
fn bulk_insert<T: RTreeObject>(tree: &mut RTree<T>, entries: Vec<T>) {
    if entries.is_empty() {
        return;
    }
    if tree.size() == 0 {
        *tree = RTree::bulk_load(entries);
    } else {
        for entry in entries {
            tree.insert(entry);
        }
    }
}

/// In-flight marker for one tile load.
struct LoadClaim<'a> {
    index: &'a TileIndex,
    path: &'a TilePath,
}

impl Drop for LoadClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.index.in_flight.lock() {
            in_flight.remove(self.path);
        }
        self.index.load_finished.notify_all();
    }
}

/// Street network index backed by a tile source.
///
/// Safe to share across threads (`Arc<TileIndex>`). All returned records and
/// geometries are independent copies.
pub struct TileIndex {
    params: TileParams,
    source: Box<dyn TileSource>,
    decoder: Box<dyn TileDecoder>,
    state: RwLock<IndexState>,
    in_flight: Mutex<HashSet<TilePath>>,
    load_finished: Condvar,
}

impl TileIndex {
    pub fn new(
        source: Box<dyn TileSource>,
        decoder: Box<dyn TileDecoder>,
        params: TileParams,
    ) -> Self {
        Self {
            params,
            source,
            decoder,
            state: RwLock::new(IndexState::default()),
            in_flight: Mutex::new(HashSet::new()),
            load_finished: Condvar::new(),
        }
    }

    pub fn params(&self) -> &TileParams {
        &self.params
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, IndexState>> {
        self.state.read().or_poisoned("tile index")
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, IndexState>> {
        self.state.write().or_poisoned("tile index")
    }

    // ========================================================================
    // Tile Loading
    // ========================================================================

    /// Load one tile if it is not already indexed.
    ///
    /// Returns `true` when this call performed the load. A concurrent caller
    /// for the same tile blocks until the first load finishes and returns
    /// `false`.
    pub fn index_tile(&self, path: &TilePath) -> Result<bool> {
        {
            let mut in_flight = self.in_flight.lock().or_poisoned("tile load")?;
            loop {
                if self.read()?.tiles.contains(path) {
                    return Ok(false);
                }
                if !in_flight.contains(path) {
                    in_flight.insert(path.clone());
                    break;
                }
                in_flight = self
                    .load_finished
                    .wait(in_flight)
                    .or_poisoned("tile load")?;
            }
        }

        // Released on drop so a panicking source cannot wedge later loads
        let _claim = LoadClaim { index: self, path };
        self.load_tile(path).map(|_| true)
    }

    fn load_tile(&self, path: &TilePath) -> Result<()> {
        let path_string = path.to_path_string();
        let bytes = self.source.fetch(path)?;
        let data = self
            .decoder
            .decode(&bytes, path.tile_type)
            .map_err(|e| MatchError::TileDecode {
                path: path_string.clone(),
                message: e.to_string(),
            })?;
        if data.tile_type() != path.tile_type {
            return Err(MatchError::TileDecode {
                path: path_string,
                message: format!(
                    "expected {} records, got {}",
                    path.tile_type.as_str(),
                    data.tile_type().as_str()
                ),
            });
        }

        let total = data.len();
        let mut state = self.write()?;
        let inserted = state.merge(data);
        state.tiles.insert(path.clone());
        debug!(
            "[TileIndex] Indexed {} ({} new of {} records)",
            path_string, inserted, total
        );
        Ok(())
    }

    /// Load every tile in the group. Returns how many tiles were newly loaded.
    pub fn index_tiles(&self, group: &TilePathGroup) -> Result<usize> {
        let mut loaded = 0;
        for path in group.paths() {
            if self.index_tile(&path)? {
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!(
                "[TileIndex] Loaded {} of {} tiles for {} tile ids",
                loaded,
                group.paths().len(),
                group.tile_ids.len()
            );
        }
        Ok(loaded)
    }

    // ========================================================================
    // Spatial Queries
    // ========================================================================

    fn spatial_types(tile_type: TileType) -> Result<Vec<TileType>> {
        match tile_type {
            // Matching needs the references of every segment it finds
            TileType::Geometry => Ok(vec![TileType::Geometry, TileType::Reference]),
            TileType::Intersection => Ok(vec![TileType::Intersection]),
            other => Err(MatchError::InvalidQuery {
                message: format!("{} records have no spatial index", other.as_str()),
            }),
        }
    }

    /// Objects of `tile_type` whose geometry intersects `rect`.
    pub fn intersects(&self, rect: Rect, tile_type: TileType) -> Result<Vec<Feature>> {
        let types = Self::spatial_types(tile_type)?;
        let group = TilePathGroup::from_rect(rect, 0.0, &self.params).with_types(&types);
        self.index_tiles(&group)?;

        let state = self.read()?;
        let envelope = aabb(&rect);
        let mut hits = match tile_type {
            TileType::Geometry => state
                .segment_tree
                .locate_in_envelope_intersecting(&envelope)
                .filter_map(|e| line_feature(&state, &e.id))
                .collect::<Vec<_>>(),
            _ => state
                .intersection_tree
                .locate_in_envelope_intersecting(&envelope)
                .map(point_feature)
                .collect::<Vec<_>>(),
        };
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }

    /// Objects of `tile_type` within roughly `radius` metres of `point`.
    ///
    /// Segment hits are envelope candidates; callers measure exact distance.
    /// Intersection hits are filtered to the radius.
    pub fn nearby(&self, point: Coord, tile_type: TileType, radius: f64) -> Result<Vec<Feature>> {
        let types = Self::spatial_types(tile_type)?;
        let group = TilePathGroup::from_point(point, radius * 2.0, &self.params).with_types(&types);
        self.index_tiles(&group)?;

        let state = self.read()?;
        let envelope = aabb(&geometry::buffered_envelope(point, radius));
        let mut hits = match tile_type {
            TileType::Geometry => state
                .segment_tree
                .locate_in_envelope_intersecting(&envelope)
                .filter_map(|e| line_feature(&state, &e.id))
                .collect::<Vec<_>>(),
            _ => state
                .intersection_tree
                .locate_in_envelope_intersecting(&envelope)
                .filter(|e| {
                    geometry::distance(Coord { x: e.lon, y: e.lat }, point) <= radius
                })
                .map(point_feature)
                .collect::<Vec<_>>(),
        };
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn object(&self, id: &str) -> Option<IndexedObject> {
        self.read().ok()?.objects.get(id).cloned()
    }

    pub fn segment(&self, id: &str) -> Option<Segment> {
        self.read().ok()?.segment(id).cloned()
    }

    pub fn reference(&self, id: &str) -> Option<Reference> {
        self.read().ok()?.reference(id).cloned()
    }

    pub fn intersection(&self, id: &str) -> Option<Intersection> {
        self.read().ok()?.intersection(id).cloned()
    }

    /// Basemap metadata for a segment geometry id.
    pub fn metadata(&self, geometry_id: &str) -> Option<Metadata> {
        self.read().ok()?.metadata.get(geometry_id).cloned()
    }

    pub fn reference_context(&self, reference_id: &str) -> Option<ReferenceContext> {
        self.read().ok()?.context(reference_id)
    }

    /// Whether a reference runs with or against its segment's vertex order.
    pub fn direction_for_reference(&self, reference_id: &str) -> Option<Direction> {
        self.reference_context(reference_id).map(|c| c.direction)
    }

    pub fn from_intersection_id(&self, reference_id: &str) -> Option<String> {
        let state = self.read().ok()?;
        state
            .reference(reference_id)?
            .from_intersection_id()
            .map(str::to_string)
    }

    pub fn to_intersection_id(&self, reference_id: &str) -> Option<String> {
        let state = self.read().ok()?;
        state
            .reference(reference_id)?
            .to_intersection_id()
            .map(str::to_string)
    }

    /// Street name from basemap metadata, when loaded.
    pub fn street_name(&self, geometry_id: &str) -> Option<String> {
        self.metadata(geometry_id).and_then(|m| m.name)
    }

    /// All loaded segments ordered by id.
    pub fn segments(&self) -> Vec<Segment> {
        let Ok(state) = self.read() else {
            return Vec::new();
        };
        let mut segments: Vec<Segment> = state
            .objects
            .values()
            .filter_map(|o| match o {
                IndexedObject::Segment(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        segments.sort_by(|a, b| a.id.cmp(&b.id));
        segments
    }

    pub fn stats(&self) -> IndexStats {
        let Ok(state) = self.read() else {
            return IndexStats::default();
        };
        let mut stats = IndexStats {
            tiles: state.tiles.len(),
            metadata: state.metadata.len(),
            cached_bins: state.bins.len(),
            ..IndexStats::default()
        };
        for object in state.objects.values() {
            match object {
                IndexedObject::Segment(_) => stats.segments += 1,
                IndexedObject::Reference(_) => stats.references += 1,
                IndexedObject::Intersection(_) => stats.intersections += 1,
            }
        }
        stats
    }

    // ========================================================================
    // Reference Geometry
    // ========================================================================

    /// Geometry along a reference in its direction of travel.
    ///
    /// With `end` this is the slice `[start, end]` (a line), otherwise the
    /// point at `start`. A lateral offset moves the result to the right of
    /// travel when positive. Negative distances clamp to 0. Returns `None`
    /// for unknown references and out-of-range or empty slices.
    pub fn geom(
        &self,
        reference_id: &str,
        start: f64,
        end: Option<f64>,
        lateral_offset: Option<f64>,
    ) -> Option<Geometry> {
        let context = self.reference_context(reference_id)?;
        let line = context.line();
        let start = start.max(0.0);
        let offset = lateral_offset.unwrap_or(0.0);

        match end {
            Some(end) => {
                let slice = geometry::slice_along(&line, start, end)?;
                if offset != 0.0 {
                    Some(Geometry::LineString(geometry::line_offset(&slice, offset)))
                } else {
                    Some(Geometry::LineString(slice))
                }
            }
            None => {
                let total = geometry::line_length(&line).max(context.reference.length());
                if start > total {
                    return None;
                }
                let point = geometry::along(&line, start)?;
                let point = if offset != 0.0 {
                    let bearing = geometry::bearing_at(&line, start)?;
                    geometry::point_offset(point, bearing, offset)
                } else {
                    point
                };
                Some(Geometry::Point(Point(point)))
            }
        }
    }

    /// Line slice along a reference, see [`TileIndex::geom`].
    pub fn slice(
        &self,
        reference_id: &str,
        start: f64,
        end: f64,
        lateral_offset: Option<f64>,
    ) -> Option<LineString> {
        match self.geom(reference_id, start, Some(end), lateral_offset)? {
            Geometry::LineString(line) => Some(line),
            _ => None,
        }
    }

    /// Like [`TileIndex::slice`] but reports why a slice is empty.
    pub fn try_slice(
        &self,
        reference_id: &str,
        start: f64,
        end: f64,
        lateral_offset: Option<f64>,
    ) -> Result<LineString> {
        if self.read()?.reference(reference_id).is_none() {
            return Err(MatchError::NotFound {
                kind: "reference".to_string(),
                id: reference_id.to_string(),
            });
        }
        self.slice(reference_id, start, end, lateral_offset)
            .ok_or_else(|| MatchError::GeometrySliceOutOfRange {
                reference_id: reference_id.to_string(),
                start,
                end,
            })
    }

    /// `count` points spaced evenly along a reference.
    ///
    /// Point `i` sits at `(i + 0.5) · length / count`, offset perpendicular
    /// to the line by `lateral_offset` on `side` (no offset for center or
    /// unknown), rounded to 6 decimals. Results are cached per argument set.
    pub fn reference_to_bins(
        &self,
        reference_id: &str,
        count: usize,
        lateral_offset: f64,
        side: SideOfStreet,
    ) -> Option<Vec<Coord>> {
        if count == 0 {
            return None;
        }
        let key = BinKey {
            reference_id: reference_id.to_string(),
            count,
            offset_bits: lateral_offset.to_bits(),
            side,
        };
        if let Some(cached) = self.read().ok()?.bins.get(&key) {
            return Some(cached.clone());
        }

        let context = self.reference_context(reference_id)?;
        let line = context.line();
        let length = context.reference.length();
        let offset = side.signed_offset(lateral_offset).unwrap_or(0.0);
        let step = length / count as f64;

        let mut bins = Vec::with_capacity(count);
        for i in 0..count {
            let d = (i as f64 + 0.5) * step;
            let point = geometry::along(&line, d)?;
            let bearing = geometry::bearing_at(&line, d)?;
            let shifted = geometry::point_offset(point, bearing, offset);
            bins.push(geometry::round_coord(shifted, BIN_PRECISION));
        }

        if let Ok(mut state) = self.write() {
            state.bins.entry(key).or_insert_with(|| bins.clone());
        }
        Some(bins)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Reference ids of the best path between two partially traversed
    /// references whose length is within `tolerance` of `target_length`.
    #[allow(clippy::too_many_arguments)]
    pub fn route(
        &self,
        start_reference: &str,
        start_location: f64,
        end_reference: &str,
        end_location: f64,
        end_coord: Coord,
        target_length: f64,
        tolerance: f64,
    ) -> Option<Vec<String>> {
        let state = self.read().ok()?;
        let request = RouteRequest {
            start_reference,
            start_location,
            end_reference,
            end_location,
            end_coord,
            target_length,
            tolerance,
        };
        state
            .graph
            .find_route(&request)
            .map(|route| route.reference_ids)
    }
}

fn line_feature(state: &IndexState, id: &str) -> Option<Feature> {
    state.lines.get(id).map(|line| Feature {
        id: id.to_string(),
        geometry: Geometry::LineString(line.clone()),
    })
}

fn point_feature(entry: &IntersectionEntry) -> Feature {
    Feature {
        id: entry.id.clone(),
        geometry: Geometry::Point(Point::new(entry.lon, entry.lat)),
    }
}
