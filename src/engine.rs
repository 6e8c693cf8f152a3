//! Routing engine interface.
//!
//! The engine is an external collaborator: it builds a persistent routing
//! index from nodes and edges, opens it again later, and answers HMM map
//! matching queries. Its algorithms are opaque to this crate. Implementations
//! wrap a native library or a subprocess; tests use an in-process fake.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Routing node emitted for one polyline vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u64,
    pub lon: f64,
    pub lat: f64,
}

/// Routing edge emitted for one segment polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: u64,
    /// Node ids in polyline vertex order
    pub nodes: Vec<u64>,
    pub oneway: bool,
    /// Key/value tags describing allowed travel (e.g. `highway`, `access`)
    pub tags: Vec<(String, String)>,
}

/// Node sequence traversed by one leg of a matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchLeg {
    pub nodes: Vec<u64>,
}

/// One candidate matching returned by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Matching {
    pub confidence: f64,
    /// Matched geometry as [lon, lat] pairs
    pub geometry: Vec<[f64; 2]>,
    pub legs: Vec<MatchLeg>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub matchings: Vec<Matching>,
}

impl MatchResponse {
    /// Highest-confidence matching, if any has positive confidence.
    pub fn best(&self) -> Option<&Matching> {
        self.matchings
            .iter()
            .filter(|m| m.confidence > 0.0)
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Builds and opens routing indexes.
pub trait RoutingEngine: Send + Sync {
    /// Build a persistent index under `dir`. May be slow.
    fn build_index(&self, dir: &Path, nodes: &[NodeRecord], edges: &[EdgeRecord]) -> Result<()>;

    /// Whether a complete index already exists under `dir`.
    fn index_exists(&self, dir: &Path) -> bool;

    fn open_index(&self, dir: &Path) -> Result<Box<dyn RoutingIndex>>;
}

/// An opened routing index.
pub trait RoutingIndex: Send + Sync {
    /// HMM match of a coordinate trace with a search radius per point.
    /// `Ok(None)` means the engine found nothing.
    fn match_trace(&self, coordinates: &[[f64; 2]], radii: &[f64]) -> Result<Option<MatchResponse>>;
}
