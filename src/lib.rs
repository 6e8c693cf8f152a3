//! # Street Matcher
//!
//! Resolves geographic points and lines onto a canonical, versioned street
//! reference network delivered as tiles.
//!
//! This library provides:
//! - A lazily populated, tile-backed spatial index over street segments,
//!   directed references and intersections
//! - Point candidate generation with bearing filtering and intersection
//!   snapping
//! - Direct (co-linear / routed) line matching
//! - HMM trace matching through an external routing engine, bridged by a
//!   persistent node/edge store
//! - Batch matching with per-feature failure isolation
//!
//! ## Features
//!
//! - **`persistence`** (default) - SQLite bridge store and routable graph
//! - **`parallel`** - Enable parallel batch matching with rayon
//! - **`http`** - Enable the HTTP tile source with on-disk cache
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geo::{Coord, LineString};
//! use street_matcher::{
//!     DirectoryTileSource, JsonTileDecoder, MatchConfig, Matcher, TileIndex, TileParams,
//! };
//!
//! let index = Arc::new(TileIndex::new(
//!     Box::new(DirectoryTileSource::new("/data/tiles")),
//!     Box::new(JsonTileDecoder),
//!     TileParams::default(),
//! ));
//! let matcher = Matcher::new(index, MatchConfig::default()).unwrap();
//!
//! let line = LineString::new(vec![
//!     Coord { x: -74.0060, y: 40.7128 },
//!     Coord { x: -74.0050, y: 40.7135 },
//! ]);
//! for candidate in matcher.match_line(&line, None).unwrap() {
//!     println!("{:.1} m over {} references", candidate.path_length(), candidate.segments.len());
//! }
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{MatchError, OptionExt, Result};

// Geographic utilities (distance, bearing, slicing, offsets)
pub mod geometry;

// Street network records
pub mod types;
pub use types::{
    Direction, FeatureReference, FormOfWay, IndexedObject, Intersection, LocationReference,
    Metadata, Reference, RoadClass, Segment, SideOfStreet,
};

// Tile addressing, decoding and sources
pub mod tiles;
pub use tiles::{
    CachedTileSource, DirectoryTileSource, JsonTileDecoder, MemoryTileSource, TileData,
    TileDecoder, TileParams, TilePath, TilePathGroup, TileSource, TileType,
};

// Bounded route search over loaded references
pub mod routing;

// Tile-backed spatial index
pub mod tile_index;
pub use tile_index::{Feature, IndexStats, ReferenceContext, TileIndex};

// Point candidate generation
pub mod candidates;
pub use candidates::{CandidateGenerator, PointCandidate};

// Path assembly and scoring
pub mod matching;
pub use matching::{MatchType, Matcher, PathCandidate, PathSegment};

// Routing engine interface (external collaborator)
pub mod engine;
pub use engine::{EdgeRecord, MatchLeg, MatchResponse, Matching, NodeRecord, RoutingEngine, RoutingIndex};

// Persistent node/edge bridge
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::BridgeStore;

// Routable graph with build lifecycle
#[cfg(feature = "persistence")]
pub mod graph;
#[cfg(feature = "persistence")]
pub use graph::{Graph, GraphMode, GraphState};

// Batch matching with failure isolation
pub mod batch;
pub use batch::{BatchResult, CleanedLines, CleanedPoints, UnmatchedFeature};

// HTTP tile source
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpTileSource;

// ============================================================================
// Configuration
// ============================================================================

/// Upper bound accepted for `search_radius` (metres).
pub const MAX_SEARCH_RADIUS: f64 = 100.0;

/// Upper bound accepted for `length_tolerance`.
pub const MAX_LENGTH_TOLERANCE: f64 = 0.5;

/// Configuration for candidate generation and path matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Maximum distance from a search point to a street (metres).
    /// Default: 25.0
    pub search_radius: f64,

    /// Maximum difference between a search bearing and the street bearing
    /// (degrees). Default: 15.0
    pub bearing_tolerance: f64,

    /// Allowed relative deviation between a probe line and a routed path.
    /// Default: 0.1
    pub length_tolerance: f64,

    /// Point candidates kept per search point.
    /// Default: 10
    pub max_candidates: usize,

    /// Route searches attempted per directed line match.
    /// Default: 16
    pub max_route_queries: usize,

    /// Lines longer than this are split before batch matching (metres).
    /// Default: 15000.0
    pub max_feature_length: f64,

    /// Round near-endpoint matches to the intersection.
    /// Default: false
    pub snap_intersections: bool,

    /// Match lines in both directions and reconcile.
    /// Default: false
    pub ignore_direction: bool,

    /// Preferred side of street for path candidates.
    /// Default: Unknown
    pub snap_side_of_street: SideOfStreet,

    /// Break point candidate ties toward the right-hand side.
    /// Default: true
    pub right_hand_traffic: bool,

    /// Lateral offset applied to side-of-street geometry (metres).
    /// Default: 2.0
    pub lateral_offset: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            search_radius: 25.0,
            bearing_tolerance: 15.0,
            length_tolerance: 0.1,
            max_candidates: 10,
            max_route_queries: 16,
            max_feature_length: 15_000.0,
            snap_intersections: false,
            ignore_direction: false,
            snap_side_of_street: SideOfStreet::Unknown,
            right_hand_traffic: true,
            lateral_offset: 2.0,
        }
    }
}

impl MatchConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: MatchConfig = serde_json::from_str(json).map_err(|e| MatchError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(MatchError::Config { message });

        if !(self.search_radius > 0.0 && self.search_radius <= MAX_SEARCH_RADIUS) {
            return fail(format!(
                "search_radius must be in (0, {}], got {}",
                MAX_SEARCH_RADIUS, self.search_radius
            ));
        }
        if !(self.bearing_tolerance > 0.0 && self.bearing_tolerance <= 180.0) {
            return fail(format!(
                "bearing_tolerance must be in (0, 180], got {}",
                self.bearing_tolerance
            ));
        }
        if !(self.length_tolerance >= 0.0 && self.length_tolerance <= MAX_LENGTH_TOLERANCE) {
            return fail(format!(
                "length_tolerance must be in [0, {}], got {}",
                MAX_LENGTH_TOLERANCE, self.length_tolerance
            ));
        }
        if self.max_candidates == 0 {
            return fail("max_candidates must be at least 1".to_string());
        }
        if !(self.max_feature_length > 0.0) {
            return fail(format!(
                "max_feature_length must be positive, got {}",
                self.max_feature_length
            ));
        }
        if !(self.lateral_offset >= 0.0) {
            return fail(format!(
                "lateral_offset must be non-negative, got {}",
                self.lateral_offset
            ));
        }
        Ok(())
    }

    /// Side preferred when point candidates tie on score.
    pub fn traffic_side(&self) -> SideOfStreet {
        if self.right_hand_traffic {
            SideOfStreet::Right
        } else {
            SideOfStreet::Left
        }
    }
}
