//! Shared fixtures for integration tests.
//!
//! A small street network laid out in local metres around (0.01, 0.01):
//!
//! ```text
//!            C (0,200)
//!            |  seg-b, one-way north (b-f)
//!            B (0,100) ---- D (100,100)   seg-c, two-way (c-f / c-b)
//!            |  seg-a, two-way (a-f / a-b)
//!            A (0,0)
//! ```
//!
//! Every tile covering the network holds every record, so any query loads
//! the whole network and later tiles merge as duplicates.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use geo::{Coord, LineString, Rect};
use street_matcher::error::Result;
use street_matcher::geometry;
use street_matcher::tiles::tile_ids_for_rect;
use street_matcher::{
    EdgeRecord, FormOfWay, Intersection, JsonTileDecoder, LocationReference, MatchConfig,
    MatchResponse, Matcher, Metadata, MemoryTileSource, NodeRecord, Reference, RoadClass,
    RoutingEngine, RoutingIndex, Segment, TileData, TileIndex, TileParams, TilePath, TileSource,
    TileType,
};

pub const ORIGIN: Coord = Coord { x: 0.01, y: 0.01 };

/// Route `log` output through the test harness (`RUST_LOG=debug` to see it).
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Coordinate `east` and `north` metres from the origin.
pub fn local(east: f64, north: f64) -> Coord {
    let north_of = geometry::destination(ORIGIN, north, 0.0);
    geometry::destination(north_of, east, 90.0)
}

pub fn line(points: &[(f64, f64)]) -> LineString {
    LineString::new(points.iter().map(|&(e, n)| local(e, n)).collect())
}

fn position(c: Coord) -> [f64; 2] {
    [c.x, c.y]
}

fn location_reference(intersection_id: &str, c: Coord, next_cm: Option<u64>) -> LocationReference {
    LocationReference {
        intersection_id: intersection_id.to_string(),
        lon: c.x,
        lat: c.y,
        inbound_bearing: None,
        outbound_bearing: None,
        distance_to_next_ref: next_cm,
    }
}

fn reference(id: &str, segment_id: &str, from: (&str, Coord), to: (&str, Coord)) -> Reference {
    let cm = (geometry::distance(from.1, to.1) * 100.0).round() as u64;
    Reference {
        id: id.to_string(),
        geometry_id: segment_id.to_string(),
        form_of_way: FormOfWay::SingleCarriageway,
        location_references: vec![
            location_reference(from.0, from.1, Some(cm)),
            location_reference(to.0, to.1, None),
        ],
    }
}

fn segment(
    id: &str,
    from: (&str, Coord),
    to: (&str, Coord),
    forward: &str,
    back: Option<&str>,
) -> (Segment, Vec<Reference>) {
    let mut references = vec![reference(forward, id, from, to)];
    if let Some(back) = back {
        references.push(reference(back, id, to, from));
    }
    let segment = Segment {
        id: id.to_string(),
        from_intersection_id: from.0.to_string(),
        to_intersection_id: to.0.to_string(),
        forward_reference_id: forward.to_string(),
        back_reference_id: back.map(str::to_string),
        road_class: RoadClass::Residential,
        coordinates: vec![position(from.1), position(to.1)],
    };
    (segment, references)
}

/// Records of the test network.
pub struct Network {
    pub segments: Vec<Segment>,
    pub references: Vec<Reference>,
    pub intersections: Vec<Intersection>,
    pub metadata: Vec<Metadata>,
}

pub fn network() -> Network {
    let a = ("int-a", local(0.0, 0.0));
    let b = ("int-b", local(0.0, 100.0));
    let c = ("int-c", local(0.0, 200.0));
    let d = ("int-d", local(100.0, 100.0));

    let mut segments = Vec::new();
    let mut references = Vec::new();
    for (s, refs) in [
        segment("seg-a", a, b, "a-f", Some("a-b")),
        segment("seg-b", b, c, "b-f", None),
        segment("seg-c", b, d, "c-f", Some("c-b")),
    ] {
        segments.push(s);
        references.extend(refs);
    }

    let intersections = [a, b, c, d]
        .iter()
        .map(|(id, coord)| Intersection {
            id: id.to_string(),
            lon: coord.x,
            lat: coord.y,
            node_id: None,
            inbound_reference_ids: Vec::new(),
            outbound_reference_ids: Vec::new(),
        })
        .collect();

    let metadata = vec![
        Metadata {
            geometry_id: "seg-a".to_string(),
            name: Some("Main Street".to_string()),
            way_ids: vec![1001],
        },
        Metadata {
            geometry_id: "seg-c".to_string(),
            name: Some("Cross Street".to_string()),
            way_ids: vec![1002],
        },
    ];

    Network {
        segments,
        references,
        intersections,
        metadata,
    }
}

/// Bounds of the network in degrees.
pub fn extent() -> Rect {
    Rect::new(local(0.0, 0.0), local(100.0, 200.0))
}

/// Tile ids that hold network records.
pub fn network_tile_ids() -> Vec<String> {
    tile_ids_for_rect(extent(), 3_000.0)
}

/// Memory tile source with the network in every covering tile.
pub fn tile_source() -> Arc<MemoryTileSource> {
    let params = TileParams::default();
    let network = network();
    let source = Arc::new(MemoryTileSource::new());
    for id in network_tile_ids() {
        let tiles = [
            (TileType::Geometry, TileData::Segments(network.segments.clone())),
            (TileType::Reference, TileData::References(network.references.clone())),
            (
                TileType::Intersection,
                TileData::Intersections(network.intersections.clone()),
            ),
            (TileType::Metadata, TileData::Metadata(network.metadata.clone())),
        ];
        for (tile_type, data) in tiles {
            source
                .insert_data(&TilePath::new(&params, &id, tile_type), &data)
                .unwrap();
        }
    }
    source
}

pub fn index_over<S: TileSource + 'static>(source: S) -> Arc<TileIndex> {
    init_logging();
    Arc::new(TileIndex::new(
        Box::new(source),
        Box::new(JsonTileDecoder),
        TileParams::default(),
    ))
}

pub fn index() -> Arc<TileIndex> {
    index_over(tile_source())
}

pub fn matcher(config: MatchConfig) -> Matcher {
    Matcher::new(index(), config).unwrap()
}

// ============================================================================
// Routing Engine Fake
// ============================================================================

/// In-process routing engine that records calls and answers every match
/// query with a shared, settable response.
#[derive(Default)]
pub struct FakeEngine {
    pub builds: AtomicUsize,
    pub opens: AtomicUsize,
    pub fail_builds: bool,
    pub response: Arc<Mutex<Option<MatchResponse>>>,
    pub last_edges: Mutex<Vec<EdgeRecord>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_builds: true,
            ..Self::default()
        }
    }

    pub fn respond_with(&self, response: MatchResponse) {
        *self.response.lock().unwrap() = Some(response);
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

const MARKER: &str = "index.ready";

impl RoutingEngine for FakeEngine {
    fn build_index(&self, dir: &Path, nodes: &[NodeRecord], edges: &[EdgeRecord]) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_builds {
            return Err(street_matcher::MatchError::Internal {
                message: "engine refused to build".to_string(),
            });
        }
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(MARKER), format!("{} {}", nodes.len(), edges.len()))?;
        *self.last_edges.lock().unwrap() = edges.to_vec();
        Ok(())
    }

    fn index_exists(&self, dir: &Path) -> bool {
        dir.join(MARKER).exists()
    }

    fn open_index(&self, _dir: &Path) -> Result<Box<dyn RoutingIndex>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeIndex {
            response: self.response.clone(),
        }))
    }
}

pub struct FakeIndex {
    response: Arc<Mutex<Option<MatchResponse>>>,
}

impl RoutingIndex for FakeIndex {
    fn match_trace(&self, _coordinates: &[[f64; 2]], _radii: &[f64]) -> Result<Option<MatchResponse>> {
        Ok(self.response.lock().unwrap().clone())
    }
}
